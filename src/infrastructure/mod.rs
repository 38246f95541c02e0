//! Infrastructure layer with caches, the manager and configuration.

/// Application configuration.
pub mod config;
/// Image handling (caching, coalescing, orchestration).
pub mod image;

pub use config::{AppConfig, CliArgs, Command, ConfigError, LogLevel, StorageManager};
pub use image::{
    CacheStats, DiskCache, DiskCacheConfig, ImageManager, MemoryImageCache, RasterTransform,
    RequestRegistry, RequestTicket,
};
