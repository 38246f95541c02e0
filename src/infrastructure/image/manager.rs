//! Request orchestration: memory tier, then disk, then the image source.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::domain::entities::{
    CacheKey, ImageFormat, ImageItem, ImageOrigin, ImageRequest, ImageResult, ItemId,
    LoadedImage, ManagerOptions, ProducedImage, Size,
};
use crate::domain::errors::ImageError;
use crate::domain::ports::{
    CacheError, CachedImage, Completion, CompletionSink, Generation, ImageCachePort, ImageSource,
    ImageTransform, SourceOutcome, SourceRequest,
};
use crate::domain::services::FormatSet;

use super::disk_cache::{DiskCache, DiskCacheConfig};
use super::memory_cache::{CacheStats, MemoryImageCache};
use super::request_registry::{Admission, Cancellation, RequestRegistry, Waiter, WaiterId};
use super::transform::RasterTransform;

/// Handle to one caller's request.
///
/// Resolves to the result, or to `None` once the request was cancelled.
#[derive(Debug)]
pub struct RequestTicket {
    key: CacheKey,
    format: ImageFormat,
    waiter: WaiterId,
    receiver: oneshot::Receiver<ImageResult>,
}

impl RequestTicket {
    /// Key the request was admitted under.
    #[must_use]
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Format the request resolved to.
    #[must_use]
    pub fn format(&self) -> &ImageFormat {
        &self.format
    }

    /// Waits for the result. `None` means nothing will be delivered.
    pub async fn wait(self) -> Option<ImageResult> {
        self.receiver.await.ok()
    }

    /// Returns the result if it already arrived.
    pub fn try_result(&mut self) -> Option<ImageResult> {
        self.receiver.try_recv().ok()
    }
}

/// Loads images for items at display sizes, caching them in memory and on disk.
///
/// Concurrent requests for the same item and format are coalesced into one
/// call to the [`ImageSource`].
pub struct ImageManager {
    inner: Arc<ManagerInner>,
    sweeper: Option<JoinHandle<()>>,
}

struct ManagerInner {
    name: String,
    options: ManagerOptions,
    formats: FormatSet,
    source: Arc<dyn ImageSource>,
    transform: Arc<dyn ImageTransform>,
    disk: Arc<DiskCache>,
    memory: MemoryImageCache,
    registry: RequestRegistry,
    prefetches: Mutex<HashMap<CacheKey, WaiterId>>,
    next_waiter: AtomicU64,
    runtime: Handle,
    this: Weak<ManagerInner>,
}

impl std::fmt::Debug for ImageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageManager")
            .field("name", &self.inner.name)
            .field("options", &self.inner.options)
            .field("formats", &self.inner.formats.formats())
            .field("pending", &self.inner.registry.len())
            .finish_non_exhaustive()
    }
}

impl ImageManager {
    /// Opens a manager whose disk cache lives in `cache_dir`, decoding with
    /// [`RasterTransform`].
    ///
    /// # Errors
    /// Returns error if the options are invalid or the cache can't be opened.
    pub async fn open(
        name: impl Into<String>,
        options: ManagerOptions,
        cache_dir: PathBuf,
        source: Arc<dyn ImageSource>,
    ) -> Result<Self, ImageError> {
        Self::open_with_transform(name, options, cache_dir, source, Arc::new(RasterTransform))
            .await
    }

    /// Opens a manager in `<default cache dir>/<name>`.
    ///
    /// # Errors
    /// Returns error if the options are invalid or the cache can't be opened.
    pub async fn default_location(
        name: impl Into<String>,
        options: ManagerOptions,
        source: Arc<dyn ImageSource>,
    ) -> Result<Self, ImageError> {
        let name = name.into();
        let cache_dir = crate::infrastructure::config::default_cache_dir().join(&name);
        Self::open(name, options, cache_dir, source).await
    }

    /// Opens a manager with a custom decode/resize collaborator.
    ///
    /// The source's formats are read once, here.
    ///
    /// # Errors
    /// Returns error if the options are invalid or the cache can't be opened.
    pub async fn open_with_transform(
        name: impl Into<String>,
        options: ManagerOptions,
        cache_dir: PathBuf,
        source: Arc<dyn ImageSource>,
        transform: Arc<dyn ImageTransform>,
    ) -> Result<Self, ImageError> {
        options.validate()?;
        let name = name.into();

        let disk = Arc::new(DiskCache::open(cache_dir, DiskCacheConfig::from(&options)).await?);
        let formats = FormatSet::new(source.supported_formats().unwrap_or_default());
        debug!(
            manager = %name,
            formats = formats.formats().len(),
            dir = %disk.cache_dir().display(),
            "Opened image manager"
        );

        let sweeper = disk.spawn_sweeper();
        let inner = Arc::new_cyclic(|this| ManagerInner {
            memory: MemoryImageCache::new(options.memory_capacity),
            name,
            options,
            formats,
            source,
            transform,
            disk,
            registry: RequestRegistry::new(),
            prefetches: Mutex::new(HashMap::new()),
            next_waiter: AtomicU64::new(0),
            runtime: Handle::current(),
            this: this.clone(),
        });

        Ok(Self { inner, sweeper })
    }

    /// Name of this manager.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Options the manager was opened with.
    #[must_use]
    pub fn options(&self) -> &ManagerOptions {
        &self.inner.options
    }

    /// Formats registered by the source.
    #[must_use]
    pub fn formats(&self) -> &[ImageFormat] {
        self.inner.formats.formats()
    }

    /// The format a request for `size` points is served from.
    #[must_use]
    pub fn appropriate_format(&self, size: Size) -> ImageFormat {
        self.inner.formats.resolve(size)
    }

    /// Looks up a registered format by name.
    ///
    /// # Errors
    /// Returns `FormatUnresolved` if the source registered no such format.
    pub fn format_named(&self, name: &str) -> Result<ImageFormat, ImageError> {
        self.inner
            .formats
            .named(name)
            .cloned()
            .ok_or_else(|| ImageError::FormatUnresolved {
                name: name.to_string(),
            })
    }

    /// Requests an image.
    ///
    /// Cache hits resolve the ticket before this returns. Misses join the
    /// request already in flight for the same key, or start a new one.
    pub async fn add_request(&self, request: ImageRequest) -> RequestTicket {
        let inner = &self.inner;
        let format = inner.formats.resolve(request.target_size());
        let key = CacheKey::for_item(request.item().as_ref(), &format);
        let id = inner.next_waiter_id();
        let (sender, receiver) = oneshot::channel();

        if let Some(image) = inner.cached(&key, &format).await {
            let _ = sender.send(Ok(image));
        } else {
            let waiter = Waiter::new(id, sender)
                .with_flags(request.is_opportunistic(), request.is_network_allowed());
            inner.admit(&key, &format, request.item(), waiter);
        }

        RequestTicket {
            key,
            format,
            waiter: id,
            receiver,
        }
    }

    /// Withdraws one request. The source is told to stop once nobody else
    /// waits on the same key.
    pub fn cancel_request(&self, ticket: &RequestTicket) {
        self.inner.cancel_waiter(&ticket.key, ticket.waiter);
    }

    /// Cancels every request for `item` in `format`. Attached callers receive
    /// [`ImageError::Cancelled`].
    pub fn cancel_requests_with_format(&self, format: &ImageFormat, item: &dyn ImageItem) {
        let inner = &self.inner;
        let key = CacheKey::for_item(item, format);
        let Some(request) = inner.registry.cancel_all(&key) else {
            return;
        };
        debug!(manager = %inner.name, key = %key, waiters = request.waiters.len(), "Cancelling all requests");
        inner.forget_prefetch(&request.key, &request.waiter_ids());
        if request.started {
            inner.source.cancel_request(&request.format, &request.item);
        }
        request.fan_out(&Err(ImageError::cancelled(&key)));
    }

    /// Starts opportunistic requests for `items` at `size`, without result
    /// delivery. Items already cached or already prefetching are skipped.
    pub async fn begin_caching_images_for_items(&self, items: &[Arc<dyn ImageItem>], size: Size) {
        let inner = &self.inner;
        let format = inner.formats.resolve(size);

        for item in items {
            let key = CacheKey::for_item(item.as_ref(), &format);
            let id = inner.next_waiter_id();
            let reserved = {
                let mut prefetches = inner.prefetches.lock();
                match prefetches.entry(key.clone()) {
                    Entry::Occupied(_) => false,
                    Entry::Vacant(slot) => {
                        slot.insert(id);
                        true
                    }
                }
            };
            if !reserved {
                continue;
            }

            if inner.memory.peek(&key).await.is_some() || inner.disk.contains(&key) {
                trace!(key = %key, "Prefetch already cached");
                inner.release_prefetch(&key, id);
                continue;
            }

            inner.admit(&key, &format, item, Waiter::prefetch(id));
            // A stop that ran between reserving and admitting found no waiter.
            if !inner.holds_prefetch(&key, id) {
                inner.cancel_waiter(&key, id);
            }
        }
    }

    /// Stops prefetching `items` at `size`.
    pub fn stop_caching_images_for_items(&self, items: &[Arc<dyn ImageItem>], size: Size) {
        let inner = &self.inner;
        let format = inner.formats.resolve(size);

        for item in items {
            let key = CacheKey::for_item(item.as_ref(), &format);
            let id = inner.prefetches.lock().remove(&key);
            if let Some(id) = id {
                inner.cancel_waiter(&key, id);
            }
        }
    }

    /// Stops every prefetch.
    pub fn stop_caching_images_for_all_items(&self) {
        let inner = &self.inner;
        let prefetches: Vec<(CacheKey, WaiterId)> = inner.prefetches.lock().drain().collect();
        if !prefetches.is_empty() {
            debug!(manager = %inner.name, count = prefetches.len(), "Stopping all prefetches");
        }
        for (key, id) in prefetches {
            inner.cancel_waiter(&key, id);
        }
    }

    /// Stores an image for `item` in `format` without a request.
    ///
    /// # Errors
    /// Returns error if the bytes don't decode or can't be persisted.
    pub async fn save_image(
        &self,
        format: &ImageFormat,
        item: &dyn ImageItem,
        bytes: impl Into<Bytes>,
    ) -> Result<(), ImageError> {
        let inner = &self.inner;
        let key = CacheKey::for_item(item, format);
        let (image, encoded) = inner.prepare(&key, format, bytes.into()).await?;

        inner.disk.write(&key, &encoded, None).await?;
        let cached = CachedImage {
            image: Arc::new(image),
            expires_at: inner.options.default_expiration,
        };
        inner.memory.put(key.clone(), cached).await;
        debug!(manager = %inner.name, key = %key, "Saved image");
        Ok(())
    }

    /// Removes `item` in `format` from both caches.
    pub async fn remove_image(&self, format: &ImageFormat, item: &dyn ImageItem) {
        let key = CacheKey::for_item(item, format);
        self.inner.memory.evict(&key).await;
        self.inner.disk.remove(&key).await;
    }

    /// Removes every format of `item` from both caches.
    pub async fn remove_all_images_for_item(&self, item: &dyn ImageItem) {
        let item_id = ItemId::new(item.unique_identifier());
        self.inner.memory.evict_item(&item_id).await;
        let removed = self.inner.disk.remove_all_for_item(&item_id).await;
        debug!(manager = %self.inner.name, item = %item_id, removed = removed, "Removed item images");
    }

    /// Empties both caches.
    ///
    /// # Errors
    /// Returns error if the disk cache can't be cleared.
    pub async fn remove_all_images(&self) -> Result<(), ImageError> {
        self.inner.memory.clear().await;
        self.inner.disk.remove_all().await?;
        Ok(())
    }

    /// Keeps serving `item` in `format` from disk until `not_before`, then
    /// drops it. Returns false if nothing is cached for it.
    pub async fn schedule_image_removal(
        &self,
        format: &ImageFormat,
        item: &dyn ImageItem,
        not_before: DateTime<Utc>,
    ) -> bool {
        let key = CacheKey::for_item(item, format);
        self.inner.memory.evict(&key).await;
        self.inner.disk.schedule_removal(&key, not_before).await
    }

    /// Removes every image written at or after `since`. Returns how many
    /// disk entries were removed.
    pub async fn remove_images_since(&self, since: DateTime<Utc>) -> usize {
        // Memory entries carry no write time.
        self.inner.memory.clear().await;
        self.inner.disk.remove_since(since).await
    }

    /// Bytes currently used by the disk cache.
    #[must_use]
    pub fn current_disk_usage(&self) -> u64 {
        self.inner.disk.current_usage()
    }

    /// Number of keys with a request in flight.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Memory tier statistics.
    #[must_use]
    pub fn memory_stats(&self) -> CacheStats {
        self.inner.memory.stats()
    }
}

impl Drop for ImageManager {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

impl ManagerInner {
    fn next_waiter_id(&self) -> WaiterId {
        self.next_waiter.fetch_add(1, Ordering::Relaxed)
    }

    fn sink(&self) -> Weak<dyn CompletionSink> {
        self.this.clone()
    }

    /// Memory, then disk. Disk hits are decoded and promoted to memory.
    async fn cached(&self, key: &CacheKey, format: &ImageFormat) -> Option<LoadedImage> {
        if let Some(cached) = self.memory.get(key).await {
            return Some(self.loaded(key, format, cached.image, ImageOrigin::MemoryCache));
        }

        let bytes = self.disk.lookup(key).await?;
        let transform = self.transform.clone();
        let decoded = tokio::task::spawn_blocking(move || transform.decode(&bytes)).await;

        match decoded {
            Ok(Ok(image)) => {
                let image = Arc::new(image);
                let expires_at = self.disk.entry(key).ok().and_then(|entry| entry.deadline());
                self.memory
                    .put(
                        key.clone(),
                        CachedImage {
                            image: image.clone(),
                            expires_at,
                        },
                    )
                    .await;
                Some(self.loaded(key, format, image, ImageOrigin::DiskCache))
            }
            Ok(Err(e)) => {
                warn!(key = %key, error = %e, "Dropping undecodable disk cache entry");
                self.disk.remove(key).await;
                None
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Disk cache decode task failed");
                None
            }
        }
    }

    fn loaded(
        &self,
        key: &CacheKey,
        format: &ImageFormat,
        image: Arc<image::DynamicImage>,
        origin: ImageOrigin,
    ) -> LoadedImage {
        LoadedImage {
            key: key.clone(),
            format: format.clone(),
            image,
            scale: self.options.pixel_scale,
            origin,
        }
    }

    fn admit(
        &self,
        key: &CacheKey,
        format: &ImageFormat,
        item: &Arc<dyn ImageItem>,
        waiter: Waiter,
    ) {
        match self.registry.admit(key, format, item, waiter) {
            Admission::Joined => {}
            Admission::Created(generation) => self.start(key, format, item, generation),
        }
    }

    /// Hands a freshly created request to the source.
    fn start(
        &self,
        key: &CacheKey,
        format: &ImageFormat,
        item: &Arc<dyn ImageItem>,
        generation: Generation,
    ) {
        let (opportunistic, network_allowed) =
            self.registry.source_flags(key).unwrap_or((false, true));
        let request = SourceRequest {
            format: format.clone(),
            item: item.clone(),
            opportunistic,
            network_allowed,
        };
        let completion = Completion::new(key.clone(), format.clone(), generation, self.sink());

        trace!(manager = %self.name, key = %key, generation = generation, "Delegating to source");
        let accepted = self.source.handle_request(request, completion);
        let still_wanted = self.registry.mark_started(key, generation);

        if !accepted {
            debug!(manager = %self.name, key = %key, "Source rejected request");
            self.fail(
                key,
                Some(generation),
                ImageError::rejected(key, "source cannot handle the request"),
            );
        } else if !still_wanted {
            debug!(manager = %self.name, key = %key, "Request abandoned while starting, cancelling source request");
            self.source.cancel_request(format, item);
        }
    }

    fn cancel_waiter(&self, key: &CacheKey, waiter: WaiterId) {
        match self.registry.cancel(key, waiter) {
            Cancellation::Abandoned(request) if request.started => {
                debug!(manager = %self.name, key = %key, "Last waiter left, cancelling source request");
                self.source.cancel_request(&request.format, &request.item);
            }
            Cancellation::Abandoned(_) => {
                trace!(key = %key, "Last waiter left before the source was asked");
            }
            Cancellation::Detached => trace!(key = %key, waiter = waiter, "Waiter detached"),
            Cancellation::NotPending => {}
        }
    }

    fn holds_prefetch(&self, key: &CacheKey, id: WaiterId) -> bool {
        self.prefetches.lock().get(key) == Some(&id)
    }

    fn release_prefetch(&self, key: &CacheKey, id: WaiterId) {
        let mut prefetches = self.prefetches.lock();
        if prefetches.get(key) == Some(&id) {
            prefetches.remove(key);
        }
    }

    fn forget_prefetch(&self, key: &CacheKey, waiters: &[WaiterId]) {
        let mut prefetches = self.prefetches.lock();
        if prefetches.get(key).is_some_and(|id| waiters.contains(id)) {
            prefetches.remove(key);
        }
    }

    /// Fails the request for `key`. With a generation, only that admission.
    fn fail(&self, key: &CacheKey, generation: Option<Generation>, error: ImageError) {
        let Some(request) = self.registry.detach(key, generation) else {
            trace!(key = %key, "Failure for a request nobody waits on");
            return;
        };
        self.forget_prefetch(key, &request.waiter_ids());
        request.fan_out(&Err(error));
    }

    /// Size a produced image is constrained to, if resizing applies.
    fn resize_target(&self, format: &ImageFormat) -> Option<Size> {
        if !self.options.resize_to_fit {
            return None;
        }
        let target = format.target_size();
        (!target.is_zero()).then(|| target.scaled(self.options.pixel_scale))
    }

    /// Decodes and optionally constrains bytes off the async threads.
    /// Returns the image and the bytes to persist.
    async fn prepare(
        &self,
        key: &CacheKey,
        format: &ImageFormat,
        bytes: Bytes,
    ) -> Result<(image::DynamicImage, Bytes), ImageError> {
        let transform = self.transform.clone();
        let resize_to = self.resize_target(format);

        tokio::task::spawn_blocking(move || -> Result<(image::DynamicImage, Bytes), String> {
            let image = transform.decode(&bytes)?;
            let Some(max_size) = resize_to else {
                return Ok((image, bytes));
            };
            let (width, height) = (image.width(), image.height());
            let image = transform.constrain(image, max_size);
            if (image.width(), image.height()) == (width, height) {
                return Ok((image, bytes));
            }
            let encoded = transform.encode(&image)?;
            Ok((image, encoded))
        })
        .await
        .map_err(|e| ImageError::decode(key, format!("decode task failed: {e}")))?
        .map_err(|message: String| ImageError::decode(key, message))
    }

    /// Prepares, persists and delivers a produced image.
    async fn deliver(&self, key: CacheKey, format: ImageFormat, produced: ProducedImage) {
        let (image, encoded) = match self.prepare(&key, &format, produced.bytes).await {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(manager = %self.name, key = %key, error = %e, "Produced image is unusable");
                self.fail(&key, None, e);
                return;
            }
        };

        let expires_at = produced.expires_at.or(self.options.default_expiration);
        if produced.persist {
            match self.disk.write(&key, &encoded, expires_at).await {
                Ok(()) => {}
                Err(CacheError::CapacityExceeded { size, capacity }) => {
                    debug!(key = %key, size = size, capacity = capacity, "Image too large to persist");
                }
                Err(e) => warn!(key = %key, error = %e, "Failed to persist image"),
            }
        }

        let image = Arc::new(image);
        self.memory
            .put(
                key.clone(),
                CachedImage {
                    image: image.clone(),
                    expires_at,
                },
            )
            .await;

        // Late successes serve whoever waits on the key now.
        let Some(request) = self.registry.detach(&key, None) else {
            trace!(key = %key, "Produced image has no waiters left");
            return;
        };
        self.forget_prefetch(&key, &request.waiter_ids());
        let loaded = self.loaded(&key, &request.format, image, ImageOrigin::Source);
        let delivered = request.fan_out(&Ok(loaded));
        debug!(manager = %self.name, key = %key, delivered = delivered, "Delivered produced image");
    }
}

impl CompletionSink for ManagerInner {
    fn finish(
        &self,
        key: CacheKey,
        format: ImageFormat,
        generation: Generation,
        outcome: SourceOutcome,
    ) {
        match outcome {
            Err(reason) => {
                debug!(manager = %self.name, key = %key, reason = %reason, "Source reported failure");
                let error = ImageError::rejected(&key, reason);
                self.fail(&key, Some(generation), error);
            }
            Ok(produced) => {
                let Some(inner) = self.this.upgrade() else {
                    return;
                };
                self.runtime.spawn(async move {
                    inner.deliver(key, format, produced).await;
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::MockImageSource;
    use crate::domain::ports::mocks::RecordingSource;
    use futures_util::future::join_all;
    use image::DynamicImage;
    use tempfile::TempDir;
    use tokio_test::assert_pending;

    fn png(width: u32, height: u32) -> Bytes {
        RasterTransform::new()
            .encode(&DynamicImage::new_rgb8(width, height))
            .unwrap()
    }

    fn item(id: &str) -> Arc<dyn ImageItem> {
        Arc::new(ItemId::new(id))
    }

    fn request(id: &str, size: Size) -> ImageRequest {
        ImageRequest::new(item(id), size)
    }

    fn formats() -> Vec<ImageFormat> {
        vec![
            ImageFormat::new("thumb", Size::new(50, 50)),
            ImageFormat::new("full", Size::new(200, 200)),
        ]
    }

    async fn manager(
        dir: &TempDir,
        options: ManagerOptions,
    ) -> (ImageManager, Arc<RecordingSource>) {
        let source = Arc::new(RecordingSource::with_formats(formats()));
        let manager = ImageManager::open("test", options, dir.path().to_path_buf(), source.clone())
            .await
            .unwrap();
        (manager, source)
    }

    fn succeed_next(source: &RecordingSource, bytes: Bytes) {
        let (_, completion) = source.take_next().unwrap();
        completion.succeed(ProducedImage::new(bytes));
    }

    #[tokio::test]
    async fn test_concurrent_requests_are_coalesced() {
        let dir = TempDir::new().unwrap();
        let (manager, source) = manager(&dir, ManagerOptions::default()).await;

        let tickets =
            join_all((0..4).map(|_| manager.add_request(request("a", Size::new(40, 40))))).await;

        assert_eq!(source.handled(), 1);
        assert_eq!(manager.pending_count(), 1);

        succeed_next(&source, png(50, 50));

        let results: Vec<LoadedImage> = join_all(tickets.into_iter().map(RequestTicket::wait))
            .await
            .into_iter()
            .map(|result| result.unwrap().unwrap())
            .collect();

        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|r| r.origin == ImageOrigin::Source));
        assert!(results.iter().all(|r| r.format.name() == "thumb"));
        assert!(results.iter().all(|r| Arc::ptr_eq(&r.image, &results[0].image)));
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_ticket_waits_for_the_source() {
        let dir = TempDir::new().unwrap();
        let (manager, source) = manager(&dir, ManagerOptions::default()).await;

        let ticket = manager.add_request(request("a", Size::new(40, 40))).await;
        let mut wait = tokio_test::task::spawn(ticket.wait());
        assert_pending!(wait.poll());

        succeed_next(&source, png(10, 10));
        assert!(matches!(wait.await, Some(Ok(_))));
    }

    #[tokio::test]
    async fn test_cached_images_skip_the_source() {
        let dir = TempDir::new().unwrap();
        {
            let (manager, source) = manager(&dir, ManagerOptions::default()).await;
            let ticket = manager.add_request(request("a", Size::new(40, 40))).await;
            succeed_next(&source, png(10, 10));
            ticket.wait().await.unwrap().unwrap();

            let again = manager.add_request(request("a", Size::new(30, 30))).await;
            let loaded = again.wait().await.unwrap().unwrap();
            assert_eq!(loaded.origin, ImageOrigin::MemoryCache);
            assert_eq!(source.handled(), 1);
            assert!(manager.current_disk_usage() > 0);
        }

        let (reopened, source) = manager(&dir, ManagerOptions::default()).await;
        let loaded = reopened
            .add_request(request("a", Size::new(40, 40)))
            .await
            .wait()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.origin, ImageOrigin::DiskCache);
        assert_eq!(source.handled(), 0);
    }

    #[tokio::test]
    async fn test_cancelling_every_waiter_cancels_the_source_once() {
        let dir = TempDir::new().unwrap();
        let (manager, source) = manager(&dir, ManagerOptions::default()).await;

        let first = manager.add_request(request("a", Size::new(40, 40))).await;
        let second = manager.add_request(request("a", Size::new(40, 40))).await;

        manager.cancel_request(&first);
        assert!(source.cancelled().is_empty());
        manager.cancel_request(&second);
        manager.cancel_request(&second);

        assert_eq!(source.cancelled(), vec!["a".to_string()]);
        assert_eq!(manager.pending_count(), 0);
        assert!(first.wait().await.is_none());

        let _late = manager.add_request(request("a", Size::new(40, 40))).await;
        assert_eq!(source.handled(), 2);
    }

    #[tokio::test]
    async fn test_cancelling_one_waiter_keeps_the_other() {
        let dir = TempDir::new().unwrap();
        let (manager, source) = manager(&dir, ManagerOptions::default()).await;

        let first = manager.add_request(request("a", Size::new(40, 40))).await;
        let second = manager.add_request(request("a", Size::new(40, 40))).await;
        manager.cancel_request(&first);

        succeed_next(&source, png(10, 10));

        assert!(first.wait().await.is_none());
        assert!(matches!(second.wait().await, Some(Ok(_))));
        assert!(source.cancelled().is_empty());
    }

    #[tokio::test]
    async fn test_source_rejection_fails_every_waiter() {
        let dir = TempDir::new().unwrap();
        let mut source = MockImageSource::new();
        source.expect_supported_formats().return_const(None);
        source
            .expect_handle_request()
            .times(1)
            .returning(|_, _| false);
        source.expect_cancel_request().never();

        let manager = ImageManager::open(
            "test",
            ManagerOptions::default(),
            dir.path().to_path_buf(),
            Arc::new(source),
        )
        .await
        .unwrap();

        let first = manager.add_request(request("a", Size::new(40, 40))).await;
        let result = first.wait().await.unwrap();

        assert!(matches!(result, Err(ImageError::SourceRejected { .. })));
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_reported_failure_reaches_waiters() {
        let dir = TempDir::new().unwrap();
        let (manager, source) = manager(&dir, ManagerOptions::default()).await;

        let ticket = manager.add_request(request("a", Size::new(40, 40))).await;
        let (_, completion) = source.take_next().unwrap();
        completion.fail("not found upstream");

        let Some(Err(ImageError::SourceRejected { reason, .. })) = ticket.wait().await else {
            panic!("expected a source failure");
        };
        assert_eq!(reason, "not found upstream");
        assert_eq!(manager.current_disk_usage(), 0);
    }

    #[tokio::test]
    async fn test_stale_failure_leaves_new_admission_alone() {
        let dir = TempDir::new().unwrap();
        let (manager, source) = manager(&dir, ManagerOptions::default()).await;

        let first = manager.add_request(request("a", Size::new(40, 40))).await;
        let (_, stale) = source.take_next().unwrap();
        manager.cancel_request(&first);

        let mut second = manager.add_request(request("a", Size::new(40, 40))).await;
        stale.fail("too late");

        assert!(second.try_result().is_none());
        assert_eq!(manager.pending_count(), 1);

        succeed_next(&source, png(10, 10));
        assert!(matches!(second.wait().await, Some(Ok(_))));
    }

    #[tokio::test]
    async fn test_late_success_serves_new_admission() {
        let dir = TempDir::new().unwrap();
        let (manager, source) = manager(&dir, ManagerOptions::default()).await;

        let first = manager.add_request(request("a", Size::new(40, 40))).await;
        let (_, stale) = source.take_next().unwrap();
        manager.cancel_request(&first);
        let second = manager.add_request(request("a", Size::new(40, 40))).await;

        stale.succeed(ProducedImage::new(png(10, 10)));

        assert!(matches!(second.wait().await, Some(Ok(_))));
    }

    #[tokio::test]
    async fn test_undecodable_bytes_are_not_persisted() {
        let dir = TempDir::new().unwrap();
        let (manager, source) = manager(&dir, ManagerOptions::default()).await;

        let ticket = manager.add_request(request("a", Size::new(40, 40))).await;
        succeed_next(&source, Bytes::from_static(b"garbage"));

        assert!(matches!(ticket.wait().await, Some(Err(ImageError::Decode { .. }))));
        assert_eq!(manager.current_disk_usage(), 0);
    }

    #[tokio::test]
    async fn test_transient_images_are_not_persisted() {
        let dir = TempDir::new().unwrap();
        let (manager, source) = manager(&dir, ManagerOptions::default()).await;

        let ticket = manager.add_request(request("a", Size::new(40, 40))).await;
        let (_, completion) = source.take_next().unwrap();
        completion.succeed(ProducedImage::new(png(10, 10)).transient());

        assert!(matches!(ticket.wait().await, Some(Ok(_))));
        assert_eq!(manager.current_disk_usage(), 0);
    }

    #[tokio::test]
    async fn test_oversized_image_is_delivered_but_not_persisted() {
        let dir = TempDir::new().unwrap();
        let options = ManagerOptions::default().with_disk_capacity(16);
        let (manager, source) = manager(&dir, options).await;

        let ticket = manager.add_request(request("a", Size::new(40, 40))).await;
        succeed_next(&source, png(10, 10));

        assert!(matches!(ticket.wait().await, Some(Ok(_))));
        assert_eq!(manager.current_disk_usage(), 0);
    }

    #[tokio::test]
    async fn test_resize_to_fit_constrains_and_persists_result() {
        let dir = TempDir::new().unwrap();
        let options = ManagerOptions::default()
            .with_resize_to_fit(true)
            .with_pixel_scale(2.0);
        let (manager, source) = manager(&dir, options).await;

        let ticket = manager.add_request(request("a", Size::new(40, 40))).await;
        succeed_next(&source, png(400, 200));

        let loaded = ticket.wait().await.unwrap().unwrap();
        assert_eq!((loaded.image.width(), loaded.image.height()), (100, 50));
        assert!((loaded.scale - 2.0).abs() < f64::EPSILON);

        let key = CacheKey::new("a", "thumb");
        let persisted = manager.inner.disk.lookup(&key).await.unwrap();
        let decoded = RasterTransform::new().decode(&persisted).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (100, 50));
    }

    #[tokio::test]
    async fn test_cancel_requests_with_format_notifies_waiters() {
        let dir = TempDir::new().unwrap();
        let (manager, source) = manager(&dir, ManagerOptions::default()).await;

        let first = manager.add_request(request("a", Size::new(40, 40))).await;
        let second = manager.add_request(request("a", Size::new(40, 40))).await;

        let thumb = manager.format_named("thumb").unwrap();
        manager.cancel_requests_with_format(&thumb, &ItemId::new("a"));

        assert!(matches!(first.wait().await, Some(Err(ImageError::Cancelled { .. }))));
        assert!(matches!(second.wait().await, Some(Err(ImageError::Cancelled { .. }))));
        assert_eq!(source.cancelled(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_prefetch_bookkeeping() {
        let dir = TempDir::new().unwrap();
        let (manager, source) = manager(&dir, ManagerOptions::default()).await;
        let items = vec![item("a"), item("b")];

        manager
            .begin_caching_images_for_items(&items, Size::new(40, 40))
            .await;
        manager
            .begin_caching_images_for_items(&items, Size::new(40, 40))
            .await;
        assert_eq!(source.handled(), 2);
        assert!(source.parked().iter().all(|r| r.opportunistic));

        manager.stop_caching_images_for_items(&items[..1], Size::new(40, 40));
        assert_eq!(source.cancelled(), vec!["a".to_string()]);

        manager.stop_caching_images_for_all_items();
        assert_eq!(source.cancelled(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_prefetch_joined_by_caller_survives_stop() {
        let dir = TempDir::new().unwrap();
        let (manager, source) = manager(&dir, ManagerOptions::default()).await;
        let items = vec![item("a")];

        manager
            .begin_caching_images_for_items(&items, Size::new(40, 40))
            .await;
        let ticket = manager.add_request(request("a", Size::new(40, 40))).await;
        manager.stop_caching_images_for_all_items();

        assert!(source.cancelled().is_empty());
        succeed_next(&source, png(10, 10));
        assert!(matches!(ticket.wait().await, Some(Ok(_))));
    }

    #[tokio::test]
    async fn test_saved_image_is_served_until_removed() {
        let dir = TempDir::new().unwrap();
        let (manager, source) = manager(&dir, ManagerOptions::default()).await;
        let thumb = manager.format_named("thumb").unwrap();

        manager
            .save_image(&thumb, &ItemId::new("a"), png(10, 10))
            .await
            .unwrap();

        let loaded = manager
            .add_request(request("a", Size::new(40, 40)))
            .await
            .wait()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.origin, ImageOrigin::MemoryCache);

        manager.remove_all_images_for_item(&ItemId::new("a")).await;
        assert_eq!(manager.current_disk_usage(), 0);

        let _ticket = manager.add_request(request("a", Size::new(40, 40))).await;
        assert_eq!(source.handled(), 1);
    }

    #[tokio::test]
    async fn test_remove_images_since() {
        let dir = TempDir::new().unwrap();
        let (manager, _source) = manager(&dir, ManagerOptions::default()).await;
        let thumb = manager.format_named("thumb").unwrap();

        manager
            .save_image(&thumb, &ItemId::new("old"), png(10, 10))
            .await
            .unwrap();
        let cutoff = Utc::now();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        manager
            .save_image(&thumb, &ItemId::new("new"), png(10, 10))
            .await
            .unwrap();

        assert_eq!(manager.remove_images_since(cutoff).await, 1);
        assert!(manager.inner.disk.contains(&CacheKey::new("old", "thumb")));
        assert!(!manager.inner.disk.contains(&CacheKey::new("new", "thumb")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_requests_from_many_tasks_share_one_load() {
        let dir = TempDir::new().unwrap();
        let (manager, source) = manager(&dir, ManagerOptions::default()).await;
        let manager = Arc::new(manager);

        let tasks = (0..16).map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.add_request(request("a", Size::new(40, 40))).await })
        });
        let tickets: Vec<RequestTicket> = join_all(tasks)
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();

        assert_eq!(source.handled(), 1);
        succeed_next(&source, png(50, 50));

        let delivered = join_all(tickets.into_iter().map(RequestTicket::wait))
            .await
            .into_iter()
            .filter(|result| matches!(result, Some(Ok(_))))
            .count();
        assert_eq!(delivered, 16);
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_prefetches_track_one_waiter() {
        let dir = TempDir::new().unwrap();
        let (manager, source) = manager(&dir, ManagerOptions::default()).await;
        let manager = Arc::new(manager);
        let items = vec![item("a")];

        let tasks = (0..8).map(|_| {
            let manager = manager.clone();
            let items = items.clone();
            tokio::spawn(async move {
                manager
                    .begin_caching_images_for_items(&items, Size::new(40, 40))
                    .await;
            })
        });
        for result in join_all(tasks).await {
            result.unwrap();
        }

        assert_eq!(source.handled(), 1);
        manager.stop_caching_images_for_all_items();
        assert_eq!(source.cancelled(), vec!["a".to_string()]);
        assert_eq!(manager.pending_count(), 0);
    }

    /// Stops every prefetch from inside `handle_request`.
    #[derive(Default)]
    struct StoppingSource {
        manager: std::sync::OnceLock<Weak<ImageManager>>,
        events: Mutex<Vec<String>>,
        parked: Mutex<Vec<Completion>>,
    }

    impl ImageSource for StoppingSource {
        fn handle_request(&self, request: SourceRequest, completion: Completion) -> bool {
            if let Some(manager) = self.manager.get().and_then(Weak::upgrade) {
                manager.stop_caching_images_for_all_items();
            }
            self.events
                .lock()
                .push(format!("handle {}", request.item.unique_identifier()));
            self.parked.lock().push(completion);
            true
        }

        fn cancel_request(&self, _format: &ImageFormat, item: &Arc<dyn ImageItem>) {
            self.events
                .lock()
                .push(format!("cancel {}", item.unique_identifier()));
        }
    }

    #[tokio::test]
    async fn test_request_abandoned_while_starting_is_cancelled_after_handoff() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(StoppingSource::default());
        let manager = Arc::new(
            ImageManager::open(
                "test",
                ManagerOptions::default(),
                dir.path().to_path_buf(),
                source.clone(),
            )
            .await
            .unwrap(),
        );
        source.manager.set(Arc::downgrade(&manager)).unwrap();

        manager
            .begin_caching_images_for_items(&[item("a")], Size::new(40, 40))
            .await;

        assert_eq!(
            *source.events.lock(),
            vec!["handle a".to_string(), "cancel a".to_string()]
        );
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_late_success_after_cancel_is_resized_before_persisting() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(RecordingSource::new());
        let manager = ImageManager::open(
            "test",
            ManagerOptions::default().with_resize_to_fit(true),
            dir.path().to_path_buf(),
            source.clone(),
        )
        .await
        .unwrap();

        let ticket = manager.add_request(request("a", Size::new(40, 40))).await;
        let key = ticket.key().clone();
        let (_, completion) = source.take_next().unwrap();
        manager.cancel_request(&ticket);
        assert_eq!(manager.pending_count(), 0);

        completion.succeed(ProducedImage::new(png(400, 200)));
        for _ in 0..200 {
            if manager.inner.disk.contains(&key) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let persisted = manager.inner.disk.lookup(&key).await.unwrap();
        let decoded = RasterTransform::new().decode(&persisted).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (40, 20));
    }

    #[tokio::test]
    async fn test_format_lookup() {
        let dir = TempDir::new().unwrap();
        let (manager, _source) = manager(&dir, ManagerOptions::default()).await;

        assert_eq!(manager.appropriate_format(Size::new(80, 80)).name(), "full");
        assert_eq!(manager.appropriate_format(Size::new(300, 300)).name(), "full");
        assert!(matches!(
            manager.format_named("huge"),
            Err(ImageError::FormatUnresolved { .. })
        ));
    }

    #[tokio::test]
    async fn test_without_formats_requests_use_sentinel() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(RecordingSource::new());
        let manager = ImageManager::open(
            "test",
            ManagerOptions::default(),
            dir.path().to_path_buf(),
            source.clone(),
        )
        .await
        .unwrap();

        let ticket = manager.add_request(request("a", Size::new(30, 20))).await;
        assert_eq!(ticket.format().target_size(), Size::new(30, 20));
        assert_eq!(source.parked()[0].format, *ticket.format());
    }

    #[tokio::test]
    async fn test_completion_after_manager_is_gone() {
        let dir = TempDir::new().unwrap();
        let (manager, source) = manager(&dir, ManagerOptions::default()).await;

        let ticket = manager.add_request(request("a", Size::new(40, 40))).await;
        let (_, completion) = source.take_next().unwrap();
        drop(manager);

        completion.succeed(ProducedImage::new(png(10, 10)));
        assert!(ticket.wait().await.is_none());
    }

    #[tokio::test]
    async fn test_invalid_options_are_rejected() {
        let dir = TempDir::new().unwrap();
        let result = ImageManager::open(
            "test",
            ManagerOptions::default().with_pixel_scale(0.0),
            dir.path().to_path_buf(),
            Arc::new(RecordingSource::new()),
        )
        .await;

        assert!(matches!(result, Err(ImageError::InvalidOptions { .. })));
    }
}
