//! Domain entity definitions.

mod image_format;
mod item;
mod options;
mod request;

pub use image_format::{DEFAULT_FORMAT_NAME, ImageFormat, MAXIMUM_SIZE, Size};
pub use item::{CacheKey, ImageItem, ItemId};
pub use options::{DEFAULT_MEMORY_CAPACITY, DEFAULT_SWEEP_INTERVAL_SECS, ManagerOptions};
pub use request::{ImageOrigin, ImageRequest, ImageResult, LoadedImage, ProducedImage};
