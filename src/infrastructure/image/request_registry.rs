//! In-flight request tracking: coalescing, cancellation and fan-out.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::trace;

use crate::domain::entities::{CacheKey, ImageFormat, ImageItem, ImageResult};
use crate::domain::ports::Generation;

/// Identifies one waiter across the registry.
pub type WaiterId = u64;

/// One caller waiting on a pending request.
#[derive(Debug)]
pub struct Waiter {
    id: WaiterId,
    sender: Option<oneshot::Sender<ImageResult>>,
    opportunistic: bool,
    network_allowed: bool,
}

impl Waiter {
    /// A waiter whose result goes to `sender`.
    #[must_use]
    pub const fn new(id: WaiterId, sender: oneshot::Sender<ImageResult>) -> Self {
        Self {
            id,
            sender: Some(sender),
            opportunistic: false,
            network_allowed: true,
        }
    }

    /// A prefetch waiter: opportunistic, nobody receives its result.
    #[must_use]
    pub const fn prefetch(id: WaiterId) -> Self {
        Self {
            id,
            sender: None,
            opportunistic: true,
            network_allowed: true,
        }
    }

    /// Sets the request flags carried to the source.
    #[must_use]
    pub const fn with_flags(mut self, opportunistic: bool, network_allowed: bool) -> Self {
        self.opportunistic = opportunistic;
        self.network_allowed = network_allowed;
        self
    }

    /// Waiter identifier.
    #[must_use]
    pub const fn id(&self) -> WaiterId {
        self.id
    }

    /// Sends the result. Returns false if nobody is listening.
    pub fn deliver(self, result: ImageResult) -> bool {
        self.sender.is_some_and(|sender| sender.send(result).is_ok())
    }
}

/// Work admitted to the source for one key.
pub struct PendingRequest {
    /// Key being produced.
    pub key: CacheKey,
    /// Admission this request was created by.
    pub generation: Generation,
    /// Resolved format.
    pub format: ImageFormat,
    /// Item being produced.
    pub item: Arc<dyn ImageItem>,
    /// Waiters in the order they joined.
    pub waiters: Vec<Waiter>,
    /// Set once the request is abandoned before completion.
    pub cancelled: bool,
    /// Set once the source has been handed the request.
    pub started: bool,
}

impl PendingRequest {
    /// Sends `result` to every waiter in join order. Returns how many received it.
    pub fn fan_out(self, result: &ImageResult) -> usize {
        let key = self.key;
        let delivered = self
            .waiters
            .into_iter()
            .map(|waiter| waiter.deliver(result.clone()))
            .filter(|delivered| *delivered)
            .count();
        trace!(key = %key, delivered = delivered, "Fanned out result");
        delivered
    }

    /// Ids of the attached waiters.
    #[must_use]
    pub fn waiter_ids(&self) -> Vec<WaiterId> {
        self.waiters.iter().map(Waiter::id).collect()
    }
}

impl std::fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .field("waiters", &self.waiters.len())
            .field("cancelled", &self.cancelled)
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

/// Result of [`RequestRegistry::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Joined an in-flight request; the caller must not start production.
    Joined,
    /// Created a new request; the caller must start production.
    Created(Generation),
}

/// Result of [`RequestRegistry::cancel`].
#[derive(Debug)]
pub enum Cancellation {
    /// No such waiter was pending.
    NotPending,
    /// The waiter left; others still wait.
    Detached,
    /// The last waiter left. The request is removed and should be stopped.
    Abandoned(PendingRequest),
}

/// Tracks in-flight requests keyed by [`CacheKey`].
///
/// All operations run under one short lock, so admission, cancellation and
/// completion of a key are linearizable. Nothing blocking happens under it.
#[derive(Debug, Default)]
pub struct RequestRegistry {
    pending: Mutex<HashMap<CacheKey, PendingRequest>>,
    /// Generations abandoned before the source saw them. Locked after `pending`.
    unstarted: Mutex<HashSet<Generation>>,
    next_generation: AtomicU64,
}

impl RequestRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `waiter` to the request for `key`, creating it if needed.
    pub fn admit(
        &self,
        key: &CacheKey,
        format: &ImageFormat,
        item: &Arc<dyn ImageItem>,
        waiter: Waiter,
    ) -> Admission {
        let mut pending = self.pending.lock();

        if let Some(request) = pending.get_mut(key).filter(|request| !request.cancelled) {
            request.waiters.push(waiter);
            trace!(key = %key, waiters = request.waiters.len(), "Joined pending request");
            return Admission::Joined;
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        pending.insert(
            key.clone(),
            PendingRequest {
                key: key.clone(),
                generation,
                format: format.clone(),
                item: item.clone(),
                waiters: vec![waiter],
                cancelled: false,
                started: false,
            },
        );
        trace!(key = %key, generation = generation, "Created pending request");
        Admission::Created(generation)
    }

    /// Flags the source should see for a just-created request.
    #[must_use]
    pub fn source_flags(&self, key: &CacheKey) -> Option<(bool, bool)> {
        let pending = self.pending.lock();
        let request = pending.get(key)?;
        let opportunistic = request.waiters.iter().all(|w| w.opportunistic);
        let network_allowed = request.waiters.iter().any(|w| w.network_allowed);
        Some((opportunistic, network_allowed))
    }

    /// Detaches one waiter. Other waiters on the key are unaffected.
    pub fn cancel(&self, key: &CacheKey, waiter: WaiterId) -> Cancellation {
        let mut pending = self.pending.lock();

        let Some(request) = pending.get_mut(key) else {
            return Cancellation::NotPending;
        };
        let Some(position) = request.waiters.iter().position(|w| w.id == waiter) else {
            return Cancellation::NotPending;
        };
        request.waiters.remove(position);

        if !request.waiters.is_empty() {
            return Cancellation::Detached;
        }

        match pending.remove(key) {
            Some(mut request) => {
                request.cancelled = true;
                self.note_unstarted(&request);
                trace!(key = %key, generation = request.generation, "Abandoned pending request");
                Cancellation::Abandoned(request)
            }
            None => Cancellation::NotPending,
        }
    }

    /// Abandons the request for `key` with all of its waiters still attached.
    pub fn cancel_all(&self, key: &CacheKey) -> Option<PendingRequest> {
        let mut pending = self.pending.lock();
        let mut request = pending.remove(key)?;
        request.cancelled = true;
        self.note_unstarted(&request);
        Some(request)
    }

    fn note_unstarted(&self, request: &PendingRequest) {
        if !request.started {
            self.unstarted.lock().insert(request.generation);
        }
    }

    /// Records that the source has been handed `generation`.
    ///
    /// Returns false if the request was abandoned before this call; the
    /// caller then owes the source the cancellation it was not yet sent.
    pub fn mark_started(&self, key: &CacheKey, generation: Generation) -> bool {
        let mut pending = self.pending.lock();
        if let Some(request) = pending
            .get_mut(key)
            .filter(|request| request.generation == generation)
        {
            request.started = true;
            return true;
        }
        !self.unstarted.lock().remove(&generation)
    }

    /// Detaches the request for `key`.
    ///
    /// With a generation, only a request from that admission is detached, so
    /// a stale failure can't fail a newer admission of the same key.
    pub fn detach(&self, key: &CacheKey, generation: Option<Generation>) -> Option<PendingRequest> {
        let mut pending = self.pending.lock();
        let matches = pending
            .get(key)
            .is_some_and(|request| generation.is_none_or(|g| g == request.generation));
        if matches { pending.remove(key) } else { None }
    }

    /// Detaches the request for `key` and fans `result` out to its waiters.
    /// Returns how many waiters received it.
    pub fn complete(
        &self,
        key: &CacheKey,
        generation: Option<Generation>,
        result: &ImageResult,
    ) -> usize {
        self.detach(key, generation)
            .map_or(0, |request| request.fan_out(result))
    }

    /// Returns true if a request for `key` is in flight.
    #[must_use]
    pub fn is_pending(&self, key: &CacheKey) -> bool {
        self.pending.lock().contains_key(key)
    }

    /// Number of waiters attached to `key`.
    #[must_use]
    pub fn waiter_count(&self, key: &CacheKey) -> usize {
        self.pending
            .lock()
            .get(key)
            .map_or(0, |request| request.waiters.len())
    }

    /// Number of keys in flight.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Returns true if nothing is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
