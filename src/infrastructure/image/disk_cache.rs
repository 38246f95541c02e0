//! Disk-based image cache for persistence across sessions.
//!
//! Entries are stored one file per [`CacheKey`] next to a JSON index holding
//! their sizes and timestamps, so capacity accounting survives restarts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::domain::entities::{CacheKey, ItemId, ManagerOptions};
use crate::domain::ports::{CacheError, CacheResult};

const ENTRY_EXTENSION: &str = "img";
const TEMP_EXTENSION: &str = "tmp";
const INDEX_FILE_NAME: &str = "index.json";
const INDEX_VERSION: u32 = 1;
/// Longest reversible file stem before falling back to a digest.
const MAX_STEM_LEN: usize = 200;

/// Settings of a disk cache.
#[derive(Debug, Clone, Default)]
pub struct DiskCacheConfig {
    /// Budget in bytes. `0` means unlimited.
    pub capacity: u64,
    /// Expiration for writes that don't carry their own.
    pub default_expiration: Option<DateTime<Utc>>,
    /// Period of the expiration sweep. `None` disables it.
    pub sweep_interval: Option<Duration>,
}

impl From<&ManagerOptions> for DiskCacheConfig {
    fn from(options: &ManagerOptions) -> Self {
        Self {
            capacity: options.disk_capacity,
            default_expiration: options.default_expiration,
            sweep_interval: options.sweep_interval(),
        }
    }
}

/// Bookkeeping for one persisted entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Item and format the bytes belong to.
    pub key: CacheKey,
    /// Size of the bytes on disk.
    pub size: u64,
    /// When the bytes were written.
    pub written_at: DateTime<Utc>,
    /// When the entry expires, if ever.
    pub expires_at: Option<DateTime<Utc>>,
    /// Scheduled removal; the entry is served until then.
    #[serde(default)]
    pub remove_after: Option<DateTime<Utc>>,
    #[serde(default)]
    seq: u64,
}

impl CacheEntry {
    /// Returns true while the entry may be served at `now`.
    #[must_use]
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|at| at > now) && self.remove_after.is_none_or(|at| at > now)
    }

    /// Earliest of the expiration and the scheduled removal.
    #[must_use]
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.expires_at.into_iter().chain(self.remove_after).min()
    }

    fn write_order(&self) -> (DateTime<Utc>, u64) {
        (self.written_at, self.seq)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    entries: Vec<CacheEntry>,
}

/// In-memory view of what is on disk.
#[derive(Debug, Default)]
struct CacheIndex {
    entries: HashMap<CacheKey, CacheEntry>,
    total_size: u64,
    next_seq: u64,
}

impl CacheIndex {
    fn from_entries(entries: impl IntoIterator<Item = CacheEntry>) -> Self {
        let mut index = Self::default();
        for entry in entries {
            index.next_seq = index.next_seq.max(entry.seq + 1);
            index.insert(entry);
        }
        index
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn insert(&mut self, entry: CacheEntry) -> Option<CacheEntry> {
        self.total_size += entry.size;
        let old = self.entries.insert(entry.key.clone(), entry);
        if let Some(old) = &old {
            self.total_size -= old.size;
        }
        old
    }

    fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.total_size -= entry.size;
        Some(entry)
    }

    fn drain_where(&mut self, mut predicate: impl FnMut(&CacheEntry) -> bool) -> Vec<CacheEntry> {
        let keys: Vec<CacheKey> = self
            .entries
            .values()
            .filter(|entry| predicate(entry))
            .map(|entry| entry.key.clone())
            .collect();
        keys.iter().filter_map(|key| self.remove(key)).collect()
    }

    /// Drops expired entries, then the oldest writes until `capacity` holds.
    /// `keep` is never selected.
    fn evict(
        &mut self,
        capacity: u64,
        keep: Option<&CacheKey>,
        now: DateTime<Utc>,
    ) -> Vec<CacheEntry> {
        let mut evicted =
            self.drain_where(|entry| keep != Some(&entry.key) && !entry.is_live(now));

        if capacity == 0 || self.total_size <= capacity {
            return evicted;
        }

        let mut candidates: Vec<(DateTime<Utc>, u64, CacheKey)> = self
            .entries
            .values()
            .filter(|entry| keep != Some(&entry.key))
            .map(|entry| {
                let (written_at, seq) = entry.write_order();
                (written_at, seq, entry.key.clone())
            })
            .collect();
        candidates.sort();

        for (_, _, key) in candidates {
            if self.total_size <= capacity {
                break;
            }
            if let Some(entry) = self.remove(&key) {
                evicted.push(entry);
            }
        }

        evicted
    }

    fn snapshot(&self) -> IndexFile {
        let mut entries: Vec<CacheEntry> = self.entries.values().cloned().collect();
        entries.sort_by_key(CacheEntry::write_order);
        IndexFile {
            version: INDEX_VERSION,
            entries,
        }
    }
}

/// Disk-based cache that persists encoded image bytes.
///
/// Reads never wait on writers. Mutations are serialized among themselves and
/// update the index only after the file operation they account for.
pub struct DiskCache {
    cache_dir: PathBuf,
    config: DiskCacheConfig,
    index: Mutex<CacheIndex>,
    write_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for DiskCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskCache")
            .field("cache_dir", &self.cache_dir)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DiskCache {
    /// Opens (or creates) a cache in the specified directory.
    ///
    /// Entries recorded in the index whose files are gone are dropped; files
    /// the index doesn't know are adopted when their name decodes to a key
    /// and deleted otherwise.
    ///
    /// # Errors
    /// Returns error if the cache directory cannot be created or read.
    pub async fn open(cache_dir: PathBuf, config: DiskCacheConfig) -> CacheResult<Self> {
        fs::create_dir_all(&cache_dir)
            .await
            .map_err(|e| CacheError::IoError(format!("Failed to create cache dir: {e}")))?;

        let persisted = load_index(&cache_dir).await;
        let mut on_disk = scan_entry_files(&cache_dir).await?;

        let mut entries = Vec::with_capacity(on_disk.len());
        let mut dirty = false;

        for mut entry in persisted {
            let stem = entry_stem(&entry.key);
            match on_disk.remove(&stem) {
                Some((size, _)) => {
                    if size != entry.size {
                        debug!(key = %entry.key, recorded = entry.size, actual = size, "Correcting entry size");
                        entry.size = size;
                        dirty = true;
                    }
                    entries.push(entry);
                }
                None => {
                    debug!(key = %entry.key, "Dropping index entry without a file");
                    dirty = true;
                }
            }
        }

        let mut next_seq = entries.iter().map(|e| e.seq + 1).max().unwrap_or(0);
        for (stem, (size, modified)) in on_disk {
            dirty = true;
            if let Some(key) = key_from_stem(&stem) {
                debug!(key = %key, size = size, "Adopting untracked cache file");
                entries.push(CacheEntry {
                    key,
                    size,
                    written_at: modified,
                    expires_at: None,
                    remove_after: None,
                    seq: next_seq,
                });
                next_seq += 1;
            } else {
                let path = cache_dir.join(format!("{stem}.{ENTRY_EXTENSION}"));
                warn!(path = %path.display(), "Removing unaddressable cache file");
                remove_file_quietly(&path).await;
            }
        }

        let index = CacheIndex::from_entries(entries);
        debug!(
            dir = %cache_dir.display(),
            entries = index.entries.len(),
            size = index.total_size,
            "Opened disk cache"
        );

        let cache = Self {
            cache_dir,
            config,
            index: Mutex::new(index),
            write_lock: tokio::sync::Mutex::new(()),
        };

        let evicted = cache.enforce_capacity().await;
        if dirty && evicted == 0 {
            let _guard = cache.write_lock.lock().await;
            cache.persist_index().await;
        }

        Ok(cache)
    }

    /// Directory the cache lives in.
    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Configured capacity in bytes, `0` when unlimited.
    #[must_use]
    pub const fn capacity(&self) -> u64 {
        self.config.capacity
    }

    /// Returns the path for a cached entry.
    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.cache_dir
            .join(format!("{}.{ENTRY_EXTENSION}", entry_stem(key)))
    }

    fn index_path(&self) -> PathBuf {
        self.cache_dir.join(INDEX_FILE_NAME)
    }

    /// Gets the bytes of a live entry.
    ///
    /// Expired entries and entries past their scheduled removal are misses.
    pub async fn lookup(&self, key: &CacheKey) -> Option<Bytes> {
        let now = Utc::now();
        let seq = {
            let index = self.index.lock();
            let Some(entry) = index.entries.get(key) else {
                trace!(key = %key, "Disk cache miss");
                return None;
            };
            if !entry.is_live(now) {
                trace!(key = %key, "Disk cache entry expired");
                return None;
            }
            entry.seq
        };

        let path = self.entry_path(key);
        match fs::read(&path).await {
            Ok(bytes) => {
                trace!(key = %key, path = %path.display(), "Disk cache hit");
                Some(Bytes::from(bytes))
            }
            Err(e) => {
                if e.kind() == std::io::ErrorKind::NotFound {
                    warn!(key = %key, "Cache file vanished, forgetting entry");
                    self.forget(key, seq);
                } else {
                    warn!(key = %key, error = %e, "Failed to read cache file");
                }
                None
            }
        }
    }

    /// Drops an index entry whose file is gone, unless it was rewritten since.
    fn forget(&self, key: &CacheKey, seq: u64) {
        let mut index = self.index.lock();
        if index.entries.get(key).is_some_and(|entry| entry.seq == seq) {
            index.remove(key);
        }
    }

    /// Stores bytes and evicts the oldest writes if the budget is exceeded.
    ///
    /// `expires_at` falls back to the configured default expiration.
    ///
    /// # Errors
    /// Returns `CapacityExceeded` if the bytes alone exceed the capacity, or
    /// an I/O error if the file cannot be written.
    pub async fn write(
        &self,
        key: &CacheKey,
        bytes: &[u8],
        expires_at: Option<DateTime<Utc>>,
    ) -> CacheResult<()> {
        let size = bytes.len() as u64;
        let capacity = self.config.capacity;
        if capacity > 0 && size > capacity {
            return Err(CacheError::CapacityExceeded { size, capacity });
        }

        let _guard = self.write_lock.lock().await;

        let path = self.entry_path(key);
        write_atomic(&path, bytes)
            .await
            .map_err(|e| CacheError::IoError(format!("Failed to write cache file: {e}")))?;

        let now = Utc::now();
        let evicted = {
            let mut index = self.index.lock();
            let seq = index.next_seq();
            index.insert(CacheEntry {
                key: key.clone(),
                size,
                written_at: now,
                expires_at: expires_at.or(self.config.default_expiration),
                remove_after: None,
                seq,
            });
            index.evict(capacity, Some(key), now)
        };

        debug!(key = %key, path = %path.display(), size = size, "Stored image in disk cache");

        self.delete_files(&evicted).await;
        self.persist_index().await;

        Ok(())
    }

    /// Removes one entry. Missing keys are ignored.
    pub async fn remove(&self, key: &CacheKey) {
        let _guard = self.write_lock.lock().await;
        let removed = self.index.lock().remove(key);
        if let Some(entry) = removed {
            self.delete_files(std::slice::from_ref(&entry)).await;
            self.persist_index().await;
            debug!(key = %key, "Removed from disk cache");
        }
    }

    /// Removes every format of an item. Returns the number of entries removed.
    pub async fn remove_all_for_item(&self, item_id: &ItemId) -> usize {
        self.remove_where(|entry| &entry.key.item_id == item_id)
            .await
    }

    /// Removes every entry written at or after `since`.
    pub async fn remove_since(&self, since: DateTime<Utc>) -> usize {
        self.remove_where(|entry| entry.written_at >= since).await
    }

    /// Purges entries that are expired or past their scheduled removal.
    pub async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        self.remove_where(|entry| !entry.is_live(now)).await
    }

    async fn remove_where(&self, predicate: impl FnMut(&CacheEntry) -> bool) -> usize {
        let _guard = self.write_lock.lock().await;
        let removed = self.index.lock().drain_where(predicate);
        if removed.is_empty() {
            return 0;
        }
        self.delete_files(&removed).await;
        self.persist_index().await;
        debug!(count = removed.len(), "Removed entries from disk cache");
        removed.len()
    }

    /// Clears the entire disk cache, including files the index doesn't track.
    ///
    /// # Errors
    /// Returns error if cache directory cannot be read.
    pub async fn remove_all(&self) -> CacheResult<()> {
        let _guard = self.write_lock.lock().await;

        let mut entries = fs::read_dir(&self.cache_dir)
            .await
            .map_err(|e| CacheError::IoError(format!("Failed to read cache dir: {e}")))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CacheError::IoError(format!("Failed to read entry: {e}")))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == ENTRY_EXTENSION)
                && fs::remove_file(&path).await.is_err()
            {
                warn!(path = %path.display(), "Failed to remove cache file");
            }
        }

        *self.index.lock() = CacheIndex::default();
        self.persist_index().await;
        debug!("Cleared disk cache");
        Ok(())
    }

    /// Keeps an entry servable until `not_before`, then treats it as expired.
    ///
    /// Returns false if there is no such entry.
    pub async fn schedule_removal(&self, key: &CacheKey, not_before: DateTime<Utc>) -> bool {
        let _guard = self.write_lock.lock().await;
        let scheduled = {
            let mut index = self.index.lock();
            index.entries.get_mut(key).map(|entry| {
                entry.remove_after = Some(not_before);
            })
        };
        if scheduled.is_some() {
            self.persist_index().await;
            debug!(key = %key, at = %not_before, "Scheduled removal from disk cache");
        }
        scheduled.is_some()
    }

    /// Returns the bookkeeping of an entry, live or not.
    ///
    /// # Errors
    /// Returns `NotFound` if the key isn't tracked.
    pub fn entry(&self, key: &CacheKey) -> CacheResult<CacheEntry> {
        self.index
            .lock()
            .entries
            .get(key)
            .cloned()
            .ok_or_else(|| CacheError::NotFound(key.to_string()))
    }

    /// Checks if a live entry exists.
    #[must_use]
    pub fn contains(&self, key: &CacheKey) -> bool {
        let now = Utc::now();
        self.index
            .lock()
            .entries
            .get(key)
            .is_some_and(|entry| entry.is_live(now))
    }

    /// Returns the sum of tracked entry sizes in bytes.
    #[must_use]
    pub fn current_usage(&self) -> u64 {
        self.index.lock().total_size
    }

    /// Returns the number of tracked entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.lock().entries.len()
    }

    /// Returns true if nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Starts the periodic expiration sweep, if configured.
    ///
    /// The task holds only a weak reference and stops once the cache is dropped.
    #[must_use]
    pub fn spawn_sweeper(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let interval = self.config.sweep_interval.filter(|i| !i.is_zero())?;
        let cache: Weak<Self> = Arc::downgrade(self);

        Some(tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let purged = cache.sweep_expired().await;
                if purged > 0 {
                    debug!(purged = purged, "Disk cache sweep complete");
                }
            }
            debug!("Disk cache sweep stopped");
        }))
    }

    /// Evicts down to capacity after opening. Returns the number evicted.
    async fn enforce_capacity(&self) -> usize {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let evicted = {
            let mut index = self.index.lock();
            let over = self.config.capacity > 0 && index.total_size > self.config.capacity;
            if !over {
                return 0;
            }
            debug!(
                current_size = index.total_size,
                max_size = self.config.capacity,
                "Disk cache over limit, cleaning up"
            );
            index.evict(self.config.capacity, None, now)
        };
        self.delete_files(&evicted).await;
        self.persist_index().await;
        evicted.len()
    }

    async fn delete_files(&self, entries: &[CacheEntry]) {
        for entry in entries {
            let path = self.entry_path(&entry.key);
            if let Err(e) = fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(key = %entry.key, error = %e, "Failed to remove cache file");
                }
            } else {
                trace!(key = %entry.key, size = entry.size, "Removed cache file");
            }
        }
    }

    /// Writes the index. Callers hold the write lock.
    async fn persist_index(&self) {
        let snapshot = self.index.lock().snapshot();
        let result = match serde_json::to_vec(&snapshot) {
            Ok(json) => write_atomic(&self.index_path(), &json)
                .await
                .map_err(|e| CacheError::IoError(e.to_string())),
            Err(e) => Err(CacheError::IndexError(e.to_string())),
        };
        if let Err(e) = result {
            warn!(error = %e, "Failed to persist disk cache index");
        }
    }
}

/// File stem for a key: reversible base64 when short enough, a digest otherwise.
///
/// Reversible stems always contain one `.`, digests never do, so the two
/// schemes can't collide.
fn entry_stem(key: &CacheKey) -> String {
    let stem = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(key.item_id.as_str()),
        URL_SAFE_NO_PAD.encode(&key.format)
    );
    if stem.len() <= MAX_STEM_LEN {
        return stem;
    }

    let mut hasher = Sha256::new();
    hasher.update((key.item_id.as_str().len() as u64).to_le_bytes());
    hasher.update(key.item_id.as_str().as_bytes());
    hasher.update(key.format.as_bytes());
    format!("h-{}", hex::encode(hasher.finalize()))
}

fn key_from_stem(stem: &str) -> Option<CacheKey> {
    let (item, format) = stem.split_once('.')?;
    let item = String::from_utf8(URL_SAFE_NO_PAD.decode(item).ok()?).ok()?;
    let format = String::from_utf8(URL_SAFE_NO_PAD.decode(format).ok()?).ok()?;
    Some(CacheKey::new(item, format))
}

async fn load_index(cache_dir: &Path) -> Vec<CacheEntry> {
    let path = cache_dir.join(INDEX_FILE_NAME);
    let Ok(content) = fs::read(&path).await else {
        return Vec::new();
    };
    match serde_json::from_slice::<IndexFile>(&content) {
        Ok(index) if index.version == INDEX_VERSION => index.entries,
        Ok(index) => {
            warn!(version = index.version, "Unknown disk cache index version, rebuilding");
            Vec::new()
        }
        Err(e) => {
            warn!(error = %e, "Failed to parse disk cache index, rebuilding");
            Vec::new()
        }
    }
}

/// Lists entry files by stem with their size and modification time.
/// Leftover temporary files are removed.
async fn scan_entry_files(cache_dir: &Path) -> CacheResult<HashMap<String, (u64, DateTime<Utc>)>> {
    let mut entries = fs::read_dir(cache_dir)
        .await
        .map_err(|e| CacheError::IoError(format!("Failed to read cache dir: {e}")))?;

    let mut files = HashMap::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == TEMP_EXTENSION) {
            remove_file_quietly(&path).await;
            continue;
        }
        if path.extension().is_none_or(|ext| ext != ENTRY_EXTENSION) {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if let Ok(meta) = entry.metadata().await {
            let modified = meta
                .modified()
                .map_or_else(|_| Utc::now(), DateTime::<Utc>::from);
            files.insert(stem.to_string(), (meta.len(), modified));
        }
    }
    Ok(files)
}

/// Writes through a sibling temporary file so readers never see partial data.
async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let temp = path.with_extension(TEMP_EXTENSION);
    fs::write(&temp, bytes).await?;
    fs::rename(&temp, path).await
}

async fn remove_file_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "Failed to remove file");
    }
}
