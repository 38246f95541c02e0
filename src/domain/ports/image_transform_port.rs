//! Port for the pixel transforms the manager applies to results.

use bytes::Bytes;

use crate::domain::entities::Size;

/// Decodes, constrains and encodes images.
///
/// Implementations are pure and synchronous; the manager runs them on a
/// blocking thread.
pub trait ImageTransform: Send + Sync {
    /// Decodes encoded bytes into pixels.
    ///
    /// # Errors
    /// Returns a description of why the bytes can't be decoded.
    fn decode(&self, bytes: &[u8]) -> Result<image::DynamicImage, String>;

    /// Scales an image down so that it fits within `max_size` pixels,
    /// keeping its aspect ratio. Images that already fit are returned as is.
    fn constrain(&self, image: image::DynamicImage, max_size: Size) -> image::DynamicImage;

    /// Encodes pixels for persistence.
    ///
    /// # Errors
    /// Returns a description of why the image can't be encoded.
    fn encode(&self, image: &image::DynamicImage) -> Result<Bytes, String>;
}
