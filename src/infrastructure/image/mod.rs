//! Image handling infrastructure.
//!
//! This module provides:
//! - Memory caching with LRU eviction
//! - Disk caching with capacity and expiration accounting
//! - Request coalescing and cancellation
//! - The manager tying them to an image source

pub mod disk_cache;
pub mod manager;
pub mod memory_cache;
pub mod request_registry;
pub mod transform;

pub use disk_cache::{CacheEntry, DiskCache, DiskCacheConfig};
pub use manager::{ImageManager, RequestTicket};
pub use memory_cache::{CacheStats, MemoryImageCache};
pub use request_registry::{Admission, Cancellation, RequestRegistry, Waiter, WaiterId};
pub use transform::RasterTransform;
