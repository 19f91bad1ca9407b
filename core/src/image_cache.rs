//! Two-tier image cache.
//!
//! [`ImageCache::get`] answers from memory, then from disk, and otherwise returns a pending
//! [`ImageHandle`] that a background download fills in later. A finished download is written to
//! both tiers before any handle observes it, so a follow-up `get` for the same URI is a hit.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::cache::{MemoryCache, PersistentStore};
use crate::config::{self, ImageCacheConfig};
use crate::download::{DownloadCoordinator, Fetcher, HttpFetcher, ImageHandle, WriteThrough};
use crate::error::CacheError;
use crate::stats::{CacheStatsSnapshot, LookupOutcome, StatsCollector};
use crate::types::{self, CacheKey, ImageData};

/// What a pruning pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    /// Persisted entries older than the expiration delay.
    pub expired: usize,
    /// Memory entries over capacity.
    pub evicted: usize,
    /// Downloads nobody was waiting for any more.
    pub cancelled: usize,
}

#[derive(Debug, Default)]
struct PruneState {
    last_run: Option<Instant>,
    scheduled: Option<AbortHandle>,
}

/// Debounce for background pruning: at most one pass pending, and passes spaced by `interval`.
#[derive(Debug)]
struct PruneSchedule {
    interval: Duration,
    delay: Duration,
    state: Mutex<PruneState>,
}

#[derive(Debug)]
struct CacheShared {
    memory: MemoryCache,
    store: PersistentStore,
    expiration_delay: RwLock<Duration>,
    enabled: AtomicBool,
    pruning: PruneSchedule,
    stats: Arc<StatsCollector>,
    runtime: Handle,
}

impl CacheShared {
    fn expiration_delay(&self) -> Duration {
        *self.expiration_delay.read()
    }

    fn load_from_store(self: &Arc<Self>, key: &CacheKey) -> Option<ImageData> {
        self.request_pruning();
        match self.store.read_fresh(key, self.expiration_delay(), Utc::now()) {
            Ok(Some(bytes)) if !bytes.is_empty() => Some(ImageData::from(bytes)),
            Ok(_) => None,
            Err(err) => {
                warn!(target: "image_cache", key = %key, "store read failed: {err:#}");
                None
            }
        }
    }

    /// Write-through for a completed download.
    fn persist(self: &Arc<Self>, key: &CacheKey, data: &ImageData) {
        self.request_pruning();
        if let Err(err) = self.store.write(key, data) {
            warn!(target: "image_cache", key = %key, "store write failed: {err:#}");
        }
        self.memory.put(key.clone(), data.clone());
        self.publish_usage();
    }

    /// Schedule a pruning pass after `pruning.delay`, unless one is already pending or the last
    /// pass ran less than `pruning.interval` ago.
    fn request_pruning(self: &Arc<Self>) {
        let mut state = self.pruning.state.lock();
        if state.scheduled.is_some() {
            return;
        }
        if state.last_run.is_some_and(|at| at.elapsed() < self.pruning.interval) {
            return;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let delay = self.pruning.delay;
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            {
                let mut state = shared.pruning.state.lock();
                state.scheduled = None;
                state.last_run = Some(Instant::now());
            }
            match tokio::task::spawn_blocking(move || shared.prune_now()).await {
                Ok(report) => trace!(target: "image_cache", ?report, "background prune finished"),
                Err(err) => warn!(target: "image_cache", "background prune failed: {err}"),
            }
        });

        state.scheduled = Some(task.abort_handle());
        trace!(target: "image_cache", delay_ms = delay.as_millis() as u64, "prune scheduled");
    }

    fn prune_now(&self) -> PruneReport {
        let expired = match self.store.prune_expired(self.expiration_delay(), Utc::now()) {
            Ok(removed) => removed,
            Err(err) => {
                warn!(target: "image_cache", "pruning the store failed: {err:#}");
                0
            }
        };
        let evicted = self.memory.trim();

        self.stats.record_prune(expired + evicted);
        self.publish_usage();
        PruneReport { expired, evicted, cancelled: 0 }
    }

    fn publish_usage(&self) {
        self.stats.update_memory_usage(
            self.memory.len(),
            self.memory.bytes_used(),
            self.memory.capacity(),
        );
    }
}

/// Memory + disk image cache backed by de-duplicated downloads.
pub struct ImageCache<F: Fetcher = HttpFetcher> {
    shared: Arc<CacheShared>,
    downloads: DownloadCoordinator<F>,
    owner: Option<ThreadId>,
}

impl ImageCache<HttpFetcher> {
    /// Build a cache that downloads over HTTP on the current tokio runtime.
    pub fn new(config: ImageCacheConfig) -> crate::Result<Self> {
        let runtime = Handle::try_current().map_err(|_| CacheError::NoRuntime)?;
        let fetcher = HttpFetcher::new(config.request_timeout, &config.user_agent)?;
        Self::with_fetcher(config, fetcher, runtime)
    }
}

impl<F: Fetcher> ImageCache<F> {
    /// Build a cache around a custom [`Fetcher`], spawning background work on `runtime`.
    pub fn with_fetcher(
        config: ImageCacheConfig,
        fetcher: F,
        runtime: Handle,
    ) -> crate::Result<Self> {
        config.validate()?;
        let store = PersistentStore::new(config.store_root.clone())?;
        let stats = Arc::new(StatsCollector::new());

        let shared = Arc::new(CacheShared {
            memory: MemoryCache::new(config.memory_capacity),
            store,
            expiration_delay: RwLock::new(config.expiration_delay),
            enabled: AtomicBool::new(config.enabled),
            pruning: PruneSchedule {
                interval: config.pruning_interval,
                delay: config.pruning_delay,
                state: Mutex::new(PruneState::default()),
            },
            stats: Arc::clone(&stats),
            runtime: runtime.clone(),
        });
        shared.publish_usage();

        let weak = Arc::downgrade(&shared);
        let write_through: WriteThrough = Arc::new(move |key: &CacheKey, data: &ImageData| {
            if let Some(shared) = weak.upgrade() {
                shared.persist(key, data);
            }
        });
        let downloads = DownloadCoordinator::new(fetcher, runtime, write_through, stats);

        info!(
            target: "image_cache",
            dir = %shared.store.directory().display(),
            capacity = config.memory_capacity,
            enabled = config.enabled,
            "image cache ready"
        );

        let owner = config.enforce_owner_thread.then(|| thread::current().id());
        Ok(Self { shared, downloads, owner })
    }

    /// Look up `uri`.
    ///
    /// Returns `Ok(None)` when the cache is disabled or `uri` is not an absolute URI. Otherwise
    /// the handle is either ready (memory or disk hit) or pending on a download.
    pub fn get(&self, uri: &str) -> Result<Option<ImageHandle>, CacheError> {
        self.check_owner()?;

        if !self.is_enabled() {
            self.shared.stats.record_lookup(LookupOutcome::Bypassed);
            return Ok(None);
        }
        let Some(url) = types::parse_absolute_uri(uri) else {
            debug!(target: "image_cache", uri, "ignoring non-absolute uri");
            self.shared.stats.record_lookup(LookupOutcome::Bypassed);
            return Ok(None);
        };
        let key = CacheKey::from_url(&url);

        if let Some(data) = self.shared.memory.get(&key) {
            self.shared.stats.record_lookup(LookupOutcome::MemoryHit);
            trace!(target: "image_cache", key = %key, "memory hit");
            return Ok(Some(ImageHandle::ready(data)));
        }

        if let Some(data) = self.shared.load_from_store(&key) {
            self.shared.memory.put(key.clone(), data.clone());
            self.shared.publish_usage();
            self.shared.stats.record_lookup(LookupOutcome::StoreHit);
            trace!(target: "image_cache", key = %key, "store hit");
            return Ok(Some(ImageHandle::ready(data)));
        }

        self.shared.stats.record_lookup(LookupOutcome::Miss);
        let handle = ImageHandle::pending();
        let outcome = self.downloads.request(key, url, handle.sink());
        trace!(target: "image_cache", ?outcome, "miss");
        Ok(Some(handle))
    }

    /// Whether either tier holds a fresh copy of `uri`. Does not touch recency or start downloads.
    pub fn contains(&self, uri: &str) -> bool {
        let Some(url) = types::parse_absolute_uri(uri) else {
            return false;
        };
        let key = CacheKey::from_url(&url);
        self.shared.memory.contains(&key)
            || self.shared.store.is_fresh(&key, self.shared.expiration_delay(), Utc::now())
    }

    /// Whether a download for `uri` is currently pending.
    pub fn is_downloading(&self, uri: &str) -> bool {
        types::parse_absolute_uri(uri)
            .is_some_and(|url| self.downloads.is_pending(&CacheKey::from_url(&url)))
    }

    /// Drop `uri` from both tiers, e.g. after its bytes failed to decode.
    pub fn invalidate(&self, uri: &str) {
        let Some(url) = types::parse_absolute_uri(uri) else {
            return;
        };
        let key = CacheKey::from_url(&url);
        self.shared.memory.remove(&key);
        if let Err(err) = self.shared.store.delete(&key) {
            warn!(target: "image_cache", key = %key, "failed to delete entry: {err:#}");
        }
        self.shared.publish_usage();
        debug!(target: "image_cache", key = %key, "invalidated");
    }

    /// Run a pruning pass now, regardless of the background schedule.
    pub fn cleanup(&self) -> PruneReport {
        let mut report = self.shared.prune_now();
        report.cancelled = self.downloads.prune();
        debug!(target: "image_cache", ?report, "cleanup");
        report
    }

    /// Empty both tiers. Pending downloads are left running.
    pub fn clear(&self) {
        self.shared.memory.clear();
        match self.shared.store.delete_all() {
            Ok(removed) => debug!(target: "image_cache", removed, "cleared"),
            Err(err) => warn!(target: "image_cache", "failed to clear the store: {err:#}"),
        }
        self.shared.publish_usage();
    }

    pub fn expiration_delay(&self) -> Duration {
        self.shared.expiration_delay()
    }

    /// Change the maximum age of persisted entries. Values under one minute are rejected.
    pub fn set_expiration_delay(&self, delay: Duration) -> Result<(), CacheError> {
        config::check_expiration_delay(delay)?;
        *self.shared.expiration_delay.write() = delay;
        self.shared.request_pruning();
        Ok(())
    }

    pub fn memory_cache_capacity(&self) -> usize {
        self.shared.memory.capacity()
    }

    /// Resize the memory tier, evicting immediately if it shrinks. Negative values are rejected.
    pub fn set_memory_cache_capacity<N>(&self, capacity: N) -> Result<(), CacheError>
    where
        N: TryInto<usize> + Copy + fmt::Display,
    {
        let capacity = config::checked_capacity(capacity)?;
        let evicted = self.shared.memory.set_capacity(capacity);
        self.shared.publish_usage();
        debug!(target: "image_cache", capacity, evicted, "memory capacity changed");
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.shared.enabled.store(enabled, Ordering::Release);
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn store_directory(&self) -> &Path {
        self.shared.store.directory()
    }

    pub fn pending_downloads(&self) -> usize {
        self.downloads.pending_count()
    }

    pub fn is_pruning_scheduled(&self) -> bool {
        self.shared.pruning.state.lock().scheduled.is_some()
    }

    fn check_owner(&self) -> Result<(), CacheError> {
        match self.owner {
            Some(owner) if owner != thread::current().id() => Err(CacheError::CrossContextAccess),
            _ => Ok(()),
        }
    }
}

impl<F: Fetcher> Drop for ImageCache<F> {
    fn drop(&mut self) {
        let cancelled = self.downloads.cancel_all();
        if let Some(task) = self.shared.pruning.state.lock().scheduled.take() {
            task.abort();
        }
        trace!(target: "image_cache", cancelled, "image cache dropped");
    }
}

impl<F: Fetcher> fmt::Debug for ImageCache<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageCache")
            .field("store", &self.shared.store.directory())
            .field("memory_entries", &self.shared.memory.len())
            .field("enabled", &self.is_enabled())
            .field("downloads", &self.downloads)
            .finish_non_exhaustive()
    }
}
