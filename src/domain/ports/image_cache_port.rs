//! Port definition for image caching.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::domain::entities::{CacheKey, ItemId};
use crate::domain::errors::ImageError;

/// Result type for cache operations.
pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Errors that can occur during cache operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    /// Entry not found in cache.
    #[error("Entry not found: {0}")]
    NotFound(String),
    /// A single entry is larger than the whole cache.
    #[error("Entry of {size} bytes exceeds capacity of {capacity} bytes")]
    CapacityExceeded {
        /// Size of the rejected entry.
        size: u64,
        /// Configured capacity.
        capacity: u64,
    },
    /// I/O error during cache operation.
    #[error("IO error: {0}")]
    IoError(String),
    /// The persisted index could not be read or written.
    #[error("Index error: {0}")]
    IndexError(String),
}

impl From<CacheError> for ImageError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::NotFound(key) => Self::NotFound { key },
            CacheError::CapacityExceeded { size, capacity } => {
                Self::CapacityExceeded { size, capacity }
            }
            CacheError::IoError(message) | CacheError::IndexError(message) => Self::Io { message },
        }
    }
}

/// A decoded image held by a memory tier, with the expiration of its bytes.
#[derive(Debug, Clone)]
pub struct CachedImage {
    /// Shared pixel data.
    pub image: Arc<image::DynamicImage>,
    /// When the image stops being servable.
    pub expires_at: Option<DateTime<Utc>>,
}

impl CachedImage {
    /// Wraps an image that never expires.
    #[must_use]
    pub const fn new(image: Arc<image::DynamicImage>) -> Self {
        Self {
            image,
            expires_at: None,
        }
    }

    /// Returns true once `now` reaches the expiration.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Port for decoded-image caching operations.
/// Implementations must be thread-safe.
#[async_trait::async_trait]
pub trait ImageCachePort: Send + Sync {
    /// Attempts to get an unexpired image from the cache.
    /// Returns None if not cached.
    async fn get(&self, key: &CacheKey) -> Option<CachedImage>;

    /// Stores an image in the cache.
    async fn put(&self, key: CacheKey, image: CachedImage);

    /// Removes an image from the cache.
    async fn evict(&self, key: &CacheKey);

    /// Removes every format of an item.
    async fn evict_item(&self, item_id: &ItemId);

    /// Returns the current number of cached images.
    fn len(&self) -> usize;

    /// Returns true if the cache is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clears all images from the cache.
    async fn clear(&self);
}
