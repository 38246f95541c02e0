//! Default decode/resize/encode collaborator backed by the `image` crate.

use std::io::Cursor;

use bytes::Bytes;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat as EncodedFormat};

use crate::domain::entities::Size;
use crate::domain::ports::ImageTransform;

/// Decodes any format the `image` crate was built with and re-encodes as PNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct RasterTransform;

impl RasterTransform {
    /// Creates the transform.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl ImageTransform for RasterTransform {
    fn decode(&self, bytes: &[u8]) -> Result<DynamicImage, String> {
        image::load_from_memory(bytes).map_err(|e| e.to_string())
    }

    fn constrain(&self, image: DynamicImage, max_size: Size) -> DynamicImage {
        let fits = image.width() <= max_size.width && image.height() <= max_size.height;
        if max_size.is_zero() || fits {
            return image;
        }
        // `resize` keeps the aspect ratio and fits within both bounds.
        image.resize(
            max_size.width.max(1),
            max_size.height.max(1),
            FilterType::Lanczos3,
        )
    }

    fn encode(&self, image: &DynamicImage) -> Result<Bytes, String> {
        let mut buffer = Cursor::new(Vec::new());
        image
            .write_to(&mut buffer, EncodedFormat::Png)
            .map_err(|e| e.to_string())?;
        Ok(Bytes::from(buffer.into_inner()))
    }
}
