//! Port for the external producer of images.

use std::fmt;
use std::sync::{Arc, Weak};

use crate::domain::entities::{CacheKey, ImageFormat, ImageItem, ProducedImage};

/// What a source reports for an accepted request: an image or a failure reason.
pub type SourceOutcome = Result<ProducedImage, String>;

/// Admission number of a pending request; distinguishes re-admissions of a key.
pub type Generation = u64;

/// Context handed to the source for one admitted (format, item) pair.
#[derive(Clone)]
pub struct SourceRequest {
    /// Format the image must be produced for.
    pub format: ImageFormat,
    /// Item to produce.
    pub item: Arc<dyn ImageItem>,
    /// True when the first caller only prefetches.
    pub opportunistic: bool,
    /// False when the caller forbids network access.
    pub network_allowed: bool,
}

impl SourceRequest {
    /// Cache key of this request.
    #[must_use]
    pub fn key(&self) -> CacheKey {
        CacheKey::for_item(self.item.as_ref(), &self.format)
    }
}

impl fmt::Debug for SourceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceRequest")
            .field("format", &self.format)
            .field("item", &self.item.unique_identifier())
            .field("opportunistic", &self.opportunistic)
            .field("network_allowed", &self.network_allowed)
            .finish()
    }
}

/// Receiver of source outcomes. Implemented by the manager.
pub trait CompletionSink: Send + Sync {
    /// Called exactly once per [`Completion`], with the format the request
    /// was admitted for.
    fn finish(
        &self,
        key: CacheKey,
        format: ImageFormat,
        generation: Generation,
        outcome: SourceOutcome,
    );
}

/// One-shot handle a source uses to report the result of a request.
///
/// Consumed on use, so a request can't be completed twice. Dropping it
/// unused reports a failure. It does not keep the manager alive: completing
/// after the manager is gone does nothing.
pub struct Completion {
    key: CacheKey,
    format: ImageFormat,
    generation: Generation,
    sink: Option<Weak<dyn CompletionSink>>,
}

impl Completion {
    /// Creates a completion that reports to `sink`.
    #[must_use]
    pub fn new(
        key: CacheKey,
        format: ImageFormat,
        generation: Generation,
        sink: Weak<dyn CompletionSink>,
    ) -> Self {
        Self {
            key,
            format,
            generation,
            sink: Some(sink),
        }
    }

    /// Key being produced.
    #[must_use]
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Format the image is produced for.
    #[must_use]
    pub fn format(&self) -> &ImageFormat {
        &self.format
    }

    /// Admission this completion belongs to.
    #[must_use]
    pub const fn generation(&self) -> Generation {
        self.generation
    }

    /// Reports a produced image.
    pub fn succeed(self, image: ProducedImage) {
        self.complete(Ok(image));
    }

    /// Reports a definitive failure.
    pub fn fail(self, reason: impl Into<String>) {
        self.complete(Err(reason.into()));
    }

    /// Reports an outcome.
    pub fn complete(mut self, outcome: SourceOutcome) {
        self.deliver(outcome);
    }

    fn deliver(&mut self, outcome: SourceOutcome) {
        let Some(sink) = self.sink.take().and_then(|weak| weak.upgrade()) else {
            return;
        };
        sink.finish(
            self.key.clone(),
            self.format.clone(),
            self.generation,
            outcome,
        );
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if self.sink.is_some() {
            self.deliver(Err("producer dropped the request".to_string()));
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .field("pending", &self.sink.is_some())
            .finish()
    }
}

/// Port for the component that actually produces images.
///
/// `handle_request` must return quickly; production happens elsewhere and is
/// reported through the [`Completion`]. `cancel_request` is only issued for
/// requests the source has already been handed: a request abandoned while
/// `handle_request` is still running is cancelled once it returns.
#[cfg_attr(test, mockall::automock)]
pub trait ImageSource: Send + Sync {
    /// Starts producing an image. Returns false if the pair can't be served,
    /// which the manager treats as an immediate failure.
    fn handle_request(&self, request: SourceRequest, completion: Completion) -> bool;

    /// Advisory stop signal for a request nobody waits on anymore.
    fn cancel_request(&self, format: &ImageFormat, item: &Arc<dyn ImageItem>);

    /// Formats this source can produce. Queried once per manager.
    fn supported_formats(&self) -> Option<Vec<ImageFormat>> {
        None
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Source that parks every completion until the test releases it.
    pub struct RecordingSource {
        formats: Option<Vec<ImageFormat>>,
        accept: AtomicBool,
        handled: AtomicUsize,
        cancelled: Mutex<Vec<String>>,
        parked: Mutex<Vec<(SourceRequest, Completion)>>,
    }

    impl RecordingSource {
        /// Creates a source without registered formats.
        pub fn new() -> Self {
            Self {
                formats: None,
                accept: AtomicBool::new(true),
                handled: AtomicUsize::new(0),
                cancelled: Mutex::new(Vec::new()),
                parked: Mutex::new(Vec::new()),
            }
        }

        /// Creates a source advertising `formats`.
        pub fn with_formats(formats: Vec<ImageFormat>) -> Self {
            Self {
                formats: Some(formats),
                ..Self::new()
            }
        }

        /// Sets whether new requests are accepted.
        pub fn set_accept(&self, accept: bool) {
            self.accept.store(accept, Ordering::SeqCst);
        }

        /// Number of `handle_request` calls.
        pub fn handled(&self) -> usize {
            self.handled.load(Ordering::SeqCst)
        }

        /// Item identifiers passed to `cancel_request`, in call order.
        pub fn cancelled(&self) -> Vec<String> {
            self.cancelled.lock().clone()
        }

        /// Requests currently parked.
        pub fn parked(&self) -> Vec<SourceRequest> {
            self.parked.lock().iter().map(|(r, _)| r.clone()).collect()
        }

        /// Removes and returns the oldest parked completion.
        pub fn take_next(&self) -> Option<(SourceRequest, Completion)> {
            let mut parked = self.parked.lock();
            if parked.is_empty() {
                None
            } else {
                Some(parked.remove(0))
            }
        }
    }

    impl Default for RecordingSource {
        fn default() -> Self {
            Self::new()
        }
    }

    impl ImageSource for RecordingSource {
        fn handle_request(&self, request: SourceRequest, completion: Completion) -> bool {
            self.handled.fetch_add(1, Ordering::SeqCst);
            if !self.accept.load(Ordering::SeqCst) {
                return false;
            }
            self.parked.lock().push((request, completion));
            true
        }

        fn cancel_request(&self, _format: &ImageFormat, item: &Arc<dyn ImageItem>) {
            self.cancelled
                .lock()
                .push(item.unique_identifier().to_string());
        }

        fn supported_formats(&self) -> Option<Vec<ImageFormat>> {
            self.formats.clone()
        }
    }
}
