//! Domain layer with entities, errors, ports and pure services.

/// Entity definitions.
pub mod entities;
/// Error types.
pub mod errors;
/// Port definitions.
pub mod ports;
/// Format resolution.
pub mod services;

pub use entities::{CacheKey, ImageFormat, ImageItem, ImageRequest, ItemId, ManagerOptions, Size};
pub use errors::ImageError;
pub use ports::{Completion, ImageSource, SourceRequest};
