//! Image manager - a cache manager for loading images at display sizes.
//!
//! Images are resolved to a registered format, served from memory or disk when
//! cached, and otherwise produced once by an external image source no matter
//! how many callers ask for them concurrently.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Domain layer containing entities, errors, and port definitions.
pub mod domain;
/// Infrastructure layer containing caches, the manager and configuration.
pub mod infrastructure;

pub use domain::{
    CacheKey, Completion, ImageError, ImageFormat, ImageItem, ImageRequest, ImageSource, ItemId,
    ManagerOptions, Size, SourceRequest,
};
pub use infrastructure::{ImageManager, RequestTicket};

/// Current version of the application.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name.
pub const NAME: &str = "image-manager";
