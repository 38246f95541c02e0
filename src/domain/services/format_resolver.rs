use std::collections::HashSet;

use tracing::warn;

use crate::domain::entities::{ImageFormat, Size};

/// The formats registered with one manager, in registration order.
///
/// Read-only once built.
#[derive(Debug, Clone, Default)]
pub struct FormatSet {
    formats: Vec<ImageFormat>,
}

impl FormatSet {
    /// Builds a set, skipping unnamed formats and repeated names.
    #[must_use]
    pub fn new(formats: impl IntoIterator<Item = ImageFormat>) -> Self {
        let mut seen = HashSet::new();
        let mut kept = Vec::new();

        for format in formats {
            if format.name().is_empty() {
                warn!(format = %format, "Ignoring image format without a name");
                continue;
            }
            if !seen.insert(format.name().to_string()) {
                warn!(format = %format, "Ignoring image format with a duplicate name");
                continue;
            }
            kept.push(format);
        }

        Self { formats: kept }
    }

    /// Registered formats in registration order.
    #[must_use]
    pub fn formats(&self) -> &[ImageFormat] {
        &self.formats
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.formats.is_empty()
    }

    /// Looks up a registered format by name.
    #[must_use]
    pub fn named(&self, name: &str) -> Option<&ImageFormat> {
        self.formats.iter().find(|f| f.name() == name)
    }

    /// Picks the format a request for `requested` points is served from.
    ///
    /// The smallest format covering both dimensions wins; failing that, the
    /// largest one. Equal areas keep the first registered. With nothing
    /// registered the request gets its own capped sentinel format.
    #[must_use]
    pub fn resolve(&self, requested: Size) -> ImageFormat {
        let wanted = requested.or_maximum();

        let mut smallest_covering: Option<&ImageFormat> = None;
        let mut largest: Option<&ImageFormat> = None;

        for format in &self.formats {
            let size = format.effective_size();

            if size.covers(wanted)
                && smallest_covering.is_none_or(|best| size.area() < best.effective_size().area())
            {
                smallest_covering = Some(format);
            }

            if largest.is_none_or(|best| size.area() > best.effective_size().area()) {
                largest = Some(format);
            }
        }

        smallest_covering
            .or(largest)
            .cloned()
            .unwrap_or_else(|| ImageFormat::sentinel(requested))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn thumb_and_full() -> FormatSet {
        FormatSet::new([
            ImageFormat::new("thumb", Size::new(50, 50)),
            ImageFormat::new("full", Size::new(200, 200)),
        ])
    }

    #[test_case(Size::new(40, 40), "thumb" ; "fits_thumb")]
    #[test_case(Size::new(50, 50), "thumb" ; "exact_thumb")]
    #[test_case(Size::new(80, 80), "full" ; "smallest_covering")]
    #[test_case(Size::new(10, 120), "full" ; "one_dimension_too_tall")]
    #[test_case(Size::new(300, 300), "full" ; "largest_when_nothing_covers")]
    #[test_case(Size::ZERO, "full" ; "unconstrained_gets_largest")]
    fn test_resolve(requested: Size, expected: &str) {
        assert_eq!(thumb_and_full().resolve(requested).name(), expected);
    }

    #[test]
    fn test_equal_area_prefers_first_registered() {
        let set = FormatSet::new([
            ImageFormat::new("wide", Size::new(200, 100)),
            ImageFormat::new("tall", Size::new(100, 200)),
        ]);
        assert_eq!(set.resolve(Size::new(500, 500)).name(), "wide");

        let set = FormatSet::new([
            ImageFormat::new("a", Size::new(100, 100)),
            ImageFormat::new("b", Size::new(100, 100)),
        ]);
        assert_eq!(set.resolve(Size::new(10, 10)).name(), "a");
    }

    #[test]
    fn test_unconstrained_format_covers_everything() {
        let set = FormatSet::new([
            ImageFormat::new("original", Size::ZERO),
            ImageFormat::new("thumb", Size::new(50, 50)),
        ]);
        assert_eq!(set.resolve(Size::new(40, 40)).name(), "thumb");
        assert_eq!(set.resolve(Size::new(4000, 4000)).name(), "original");
    }

    #[test]
    fn test_empty_set_uses_sentinel() {
        let format = FormatSet::default().resolve(Size::new(120, 80));
        assert_eq!(format, ImageFormat::sentinel(Size::new(120, 80)));
    }

    #[test]
    fn test_invalid_formats_are_skipped() {
        let set = FormatSet::new([
            ImageFormat::new("", Size::new(10, 10)),
            ImageFormat::new("thumb", Size::new(50, 50)),
            ImageFormat::new("thumb", Size::new(90, 90)),
        ]);
        assert_eq!(set.formats().len(), 1);
        assert_eq!(set.named("thumb").map(ImageFormat::target_size), Some(Size::new(50, 50)));
    }
}
