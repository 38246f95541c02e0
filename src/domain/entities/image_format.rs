//! Image formats: named size buckets an item can be cached in.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Largest size the manager will ever produce or request, in points.
pub const MAXIMUM_SIZE: Size = Size::new(2048, 2048);

/// Name prefix of the fallback format used when no formats are registered.
pub const DEFAULT_FORMAT_NAME: &str = "default";

/// Two-dimensional size in points. `(0, 0)` means unconstrained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Size {
    /// Width in points.
    pub width: u32,
    /// Height in points.
    pub height: u32,
}

impl Size {
    /// The unconstrained sentinel.
    pub const ZERO: Self = Self::new(0, 0);

    /// Creates a new size.
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Returns true for the unconstrained sentinel.
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.width == 0 && self.height == 0
    }

    /// Area in square points.
    #[must_use]
    pub const fn area(self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Returns true if both dimensions are at least as large as `other`'s.
    #[must_use]
    pub const fn covers(self, other: Self) -> bool {
        self.width >= other.width && self.height >= other.height
    }

    /// Clamps both dimensions to `max`.
    #[must_use]
    pub fn min(self, max: Self) -> Self {
        Self::new(self.width.min(max.width), self.height.min(max.height))
    }

    /// Resolves the sentinel to [`MAXIMUM_SIZE`].
    #[must_use]
    pub const fn or_maximum(self) -> Self {
        if self.is_zero() { MAXIMUM_SIZE } else { self }
    }

    /// Multiplies both dimensions by a pixel scale.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn scaled(self, scale: f64) -> Self {
        Self::new(
            (f64::from(self.width) * scale).round() as u32,
            (f64::from(self.height) * scale).round() as u32,
        )
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Immutable descriptor of a cache bucket.
///
/// Equality is name plus target size.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageFormat {
    name: String,
    target_size: Size,
}

impl ImageFormat {
    /// Creates a format. Names must be non-empty and unique per manager.
    #[must_use]
    pub fn new(name: impl Into<String>, target_size: Size) -> Self {
        Self {
            name: name.into(),
            target_size,
        }
    }

    /// Fallback format for a requested size when nothing is registered.
    ///
    /// The size is capped to [`MAXIMUM_SIZE`] and becomes part of the name so
    /// that distinct sizes never share a cache bucket.
    #[must_use]
    pub fn sentinel(requested: Size) -> Self {
        let size = requested.or_maximum().min(MAXIMUM_SIZE);
        Self::new(format!("{DEFAULT_FORMAT_NAME}@{size}"), size)
    }

    /// Format name, used in cache keys.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Target size as registered; may be the `(0, 0)` sentinel.
    #[must_use]
    pub const fn target_size(&self) -> Size {
        self.target_size
    }

    /// Target size with the sentinel resolved to [`MAXIMUM_SIZE`].
    #[must_use]
    pub const fn effective_size(&self) -> Size {
        self.target_size.or_maximum()
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.target_size)
    }
}
