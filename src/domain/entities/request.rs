//! Requests, results and producer output.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use super::{CacheKey, ImageFormat, ImageItem, Size};
use crate::domain::errors::ImageError;

/// What a caller eventually receives for a request.
pub type ImageResult = Result<LoadedImage, ImageError>;

/// A caller's request for an item at a display size.
#[derive(Clone)]
pub struct ImageRequest {
    item: Arc<dyn ImageItem>,
    target_size: Size,
    opportunistic: bool,
    network_allowed: bool,
}

impl ImageRequest {
    /// Creates a request for `item` displayed at `target_size` points.
    #[must_use]
    pub fn new(item: Arc<dyn ImageItem>, target_size: Size) -> Self {
        Self {
            item,
            target_size,
            opportunistic: false,
            network_allowed: true,
        }
    }

    /// Marks the request as low priority. The source decides what that means.
    #[must_use]
    pub fn opportunistic(mut self, opportunistic: bool) -> Self {
        self.opportunistic = opportunistic;
        self
    }

    /// Allows or forbids the source to go to the network for this request.
    #[must_use]
    pub fn network_allowed(mut self, allowed: bool) -> Self {
        self.network_allowed = allowed;
        self
    }

    /// The requested item.
    #[must_use]
    pub fn item(&self) -> &Arc<dyn ImageItem> {
        &self.item
    }

    /// The requested display size.
    #[must_use]
    pub const fn target_size(&self) -> Size {
        self.target_size
    }

    /// Whether the request is opportunistic.
    #[must_use]
    pub const fn is_opportunistic(&self) -> bool {
        self.opportunistic
    }

    /// Whether the source may use the network.
    #[must_use]
    pub const fn is_network_allowed(&self) -> bool {
        self.network_allowed
    }
}

impl fmt::Debug for ImageRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageRequest")
            .field("item", &self.item.unique_identifier())
            .field("target_size", &self.target_size)
            .field("opportunistic", &self.opportunistic)
            .field("network_allowed", &self.network_allowed)
            .finish()
    }
}

/// Where a delivered image came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageOrigin {
    /// Decoded image held in memory.
    MemoryCache,
    /// Bytes persisted in the disk cache.
    DiskCache,
    /// Freshly produced by the image source.
    Source,
}

impl fmt::Display for ImageOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MemoryCache => write!(f, "memory"),
            Self::DiskCache => write!(f, "disk"),
            Self::Source => write!(f, "source"),
        }
    }
}

/// A decoded image delivered to a caller.
///
/// The pixel data is shared between every waiter of a coalesced request.
#[derive(Debug, Clone)]
pub struct LoadedImage {
    /// Cache bucket the image belongs to.
    pub key: CacheKey,
    /// Format the request resolved to.
    pub format: ImageFormat,
    /// Shared, read-only pixel data.
    pub image: Arc<image::DynamicImage>,
    /// Pixels per point.
    pub scale: f64,
    /// Where the image was found.
    pub origin: ImageOrigin,
}

/// Encoded image handed back by a source.
#[derive(Debug, Clone)]
pub struct ProducedImage {
    /// Encoded bytes (any format the transform can decode).
    pub bytes: Bytes,
    /// Overrides the manager's default expiration.
    pub expires_at: Option<DateTime<Utc>>,
    /// Write the result to the disk cache.
    pub persist: bool,
}

impl ProducedImage {
    /// A persistable image with the default expiration.
    #[must_use]
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            expires_at: None,
            persist: true,
        }
    }

    /// Sets an explicit expiration.
    #[must_use]
    pub fn expiring_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    /// Delivers without persisting.
    #[must_use]
    pub fn transient(mut self) -> Self {
        self.persist = false;
        self
    }
}
