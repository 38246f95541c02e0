mod image_cache_port;
mod image_source_port;
mod image_transform_port;

pub use image_cache_port::{CacheError, CacheResult, CachedImage, ImageCachePort};
#[cfg(test)]
pub use image_source_port::MockImageSource;
pub use image_source_port::{
    Completion, CompletionSink, Generation, ImageSource, SourceOutcome, SourceRequest,
};
pub use image_transform_port::ImageTransform;

#[cfg(test)]
pub mod mocks {
    pub use super::image_source_port::mock::RecordingSource;
}
