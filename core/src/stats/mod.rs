//! Cache effectiveness counters.
//!
//! Every tier and the download coordinator report into one [`StatsCollector`]; callers read it back
//! as a serializable [`CacheStatsSnapshot`] for dashboards or debug logging.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::warn;

const DEFAULT_SAMPLE_CAPACITY: usize = 240;

#[derive(Debug, Default)]
struct SampleWindow {
    samples: VecDeque<f32>,
    capacity: usize,
}

impl SampleWindow {
    fn new(capacity: usize) -> Self {
        Self { samples: VecDeque::with_capacity(capacity), capacity }
    }

    fn push(&mut self, value: f32) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    fn percentile(&self, percentile: f32) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }

        let mut sorted: Vec<f32> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));

        let rank = percentile.clamp(0.0, 1.0) * (sorted.len() - 1) as f32;
        let index = rank.round() as usize;
        sorted.get(index).copied().unwrap_or(0.0)
    }
}

/// Where a `get` call was answered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupOutcome {
    MemoryHit,
    StoreHit,
    /// Neither tier had the image; a download was requested.
    Miss,
    /// The cache was disabled or the URI was not usable.
    Bypassed,
}

#[derive(Debug)]
struct StatsInner {
    started_at: Instant,
    fetch_times_ms: SampleWindow,
    memory_hits: u64,
    store_hits: u64,
    misses: u64,
    bypassed: u64,
    downloads_started: u64,
    downloads_coalesced: u64,
    downloads_succeeded: u64,
    downloads_failed: u64,
    downloads_cancelled: u64,
    prune_passes: u64,
    pruned_entries: u64,
    memory_entries: usize,
    memory_bytes: usize,
    memory_capacity: usize,
}

impl Default for StatsInner {
    fn default() -> Self {
        Self {
            started_at: Instant::now(),
            fetch_times_ms: SampleWindow::new(DEFAULT_SAMPLE_CAPACITY),
            memory_hits: 0,
            store_hits: 0,
            misses: 0,
            bypassed: 0,
            downloads_started: 0,
            downloads_coalesced: 0,
            downloads_succeeded: 0,
            downloads_failed: 0,
            downloads_cancelled: 0,
            prune_passes: 0,
            pruned_entries: 0,
            memory_entries: 0,
            memory_bytes: 0,
            memory_capacity: 0,
        }
    }
}

/// Thread-safe counter collection shared by the cache components.
#[derive(Debug, Default)]
pub struct StatsCollector {
    inner: parking_lot::Mutex<StatsInner>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_lookup(&self, outcome: LookupOutcome) {
        let mut guard = self.inner.lock();
        let counter = match outcome {
            LookupOutcome::MemoryHit => &mut guard.memory_hits,
            LookupOutcome::StoreHit => &mut guard.store_hits,
            LookupOutcome::Miss => &mut guard.misses,
            LookupOutcome::Bypassed => &mut guard.bypassed,
        };
        *counter = counter.saturating_add(1);
    }

    pub fn record_download_started(&self) {
        let mut guard = self.inner.lock();
        guard.downloads_started = guard.downloads_started.saturating_add(1);
    }

    /// A request attached to a download that was already pending.
    pub fn record_download_coalesced(&self) {
        let mut guard = self.inner.lock();
        guard.downloads_coalesced = guard.downloads_coalesced.saturating_add(1);
    }

    pub fn record_download_succeeded(&self) {
        let mut guard = self.inner.lock();
        guard.downloads_succeeded = guard.downloads_succeeded.saturating_add(1);
    }

    pub fn record_download_failed(&self) {
        let mut guard = self.inner.lock();
        guard.downloads_failed = guard.downloads_failed.saturating_add(1);
    }

    pub fn record_download_cancelled(&self) {
        let mut guard = self.inner.lock();
        guard.downloads_cancelled = guard.downloads_cancelled.saturating_add(1);
    }

    /// Record how long a single network fetch took, successful or not.
    pub fn record_fetch(&self, duration: Duration) {
        let mut guard = self.inner.lock();
        guard.fetch_times_ms.push(duration.as_secs_f64() as f32 * 1_000.0);
    }

    pub fn record_prune(&self, removed: usize) {
        let mut guard = self.inner.lock();
        guard.prune_passes = guard.prune_passes.saturating_add(1);
        guard.pruned_entries = guard.pruned_entries.saturating_add(removed as u64);
    }

    /// Update the memory tier gauges.
    pub fn update_memory_usage(&self, entries: usize, bytes: usize, capacity: usize) {
        let mut guard = self.inner.lock();
        guard.memory_entries = entries;
        guard.memory_bytes = bytes;
        guard.memory_capacity = capacity;
    }

    pub fn snapshot(&self) -> CacheStatsSnapshot {
        let guard = self.inner.lock();

        let hits = guard.memory_hits + guard.store_hits;
        let lookups = (hits + guard.misses).max(1);
        let hit_ratio = hits as f32 / lookups as f32;

        CacheStatsSnapshot {
            timestamp_ms: now_ms(),
            uptime_ms: guard.started_at.elapsed().as_millis() as u64,
            memory_hits: guard.memory_hits,
            store_hits: guard.store_hits,
            misses: guard.misses,
            bypassed: guard.bypassed,
            hit_ratio,
            downloads_started: guard.downloads_started,
            downloads_coalesced: guard.downloads_coalesced,
            downloads_succeeded: guard.downloads_succeeded,
            downloads_failed: guard.downloads_failed,
            downloads_cancelled: guard.downloads_cancelled,
            fetch_time_ms_p50: guard.fetch_times_ms.percentile(0.50),
            fetch_time_ms_p95: guard.fetch_times_ms.percentile(0.95),
            prune_passes: guard.prune_passes,
            pruned_entries: guard.pruned_entries,
            memory_entries: guard.memory_entries,
            memory_bytes: guard.memory_bytes,
            memory_capacity: guard.memory_capacity,
        }
    }
}

fn now_ms() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(delta) => delta.as_millis() as u64,
        Err(err) => {
            warn!("system clock error: {err}");
            0
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatsSnapshot {
    pub timestamp_ms: u64,
    pub uptime_ms: u64,
    pub memory_hits: u64,
    pub store_hits: u64,
    pub misses: u64,
    pub bypassed: u64,
    /// Share of enabled lookups answered by either tier.
    pub hit_ratio: f32,
    pub downloads_started: u64,
    pub downloads_coalesced: u64,
    pub downloads_succeeded: u64,
    pub downloads_failed: u64,
    pub downloads_cancelled: u64,
    pub fetch_time_ms_p50: f32,
    pub fetch_time_ms_p95: f32,
    pub prune_passes: u64,
    pub pruned_entries: u64,
    pub memory_entries: usize,
    pub memory_bytes: usize,
    pub memory_capacity: usize,
}
