//! De-duplicated background downloads.
//!
//! At most one fetch runs per [`CacheKey`]. Later requests for the same key attach their sink to
//! the download already in flight. A download whose sinks have all been dropped is cancelled the
//! next time the coordinator looks at its pending map.

pub mod fetch;
pub mod sink;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};
use url::Url;

use crate::stats::StatsCollector;
use crate::types::{CacheKey, ImageData};

pub use fetch::{FetchError, Fetcher, HttpFetcher};
pub use sink::{HandleState, ImageHandle, ResultSink};

/// Hook run with freshly downloaded bytes before any sink is filled.
pub type WriteThrough = Arc<dyn Fn(&CacheKey, &ImageData) + Send + Sync>;

/// What [`DownloadCoordinator::request`] did with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// A new fetch was spawned.
    Started,
    /// The sink joined a fetch that was already pending.
    Attached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    NotStarted,
    InFlight,
    Completed,
}

#[derive(Debug)]
struct PendingDownload {
    id: u64,
    uri: Url,
    sinks: Vec<ResultSink>,
    state: DownloadState,
    abort: Option<AbortHandle>,
}

impl PendingDownload {
    fn has_live_sinks(&self) -> bool {
        self.sinks.iter().any(ResultSink::is_alive)
    }

    fn cancel(self) -> Vec<ResultSink> {
        if let Some(abort) = self.abort {
            abort.abort();
        }
        self.sinks
    }
}

#[derive(Debug, Default)]
struct CoordinatorState {
    pending: HashMap<CacheKey, PendingDownload>,
    next_id: u64,
}

struct Shared<F> {
    fetcher: F,
    runtime: Handle,
    state: Mutex<CoordinatorState>,
    write_through: WriteThrough,
    stats: Arc<StatsCollector>,
}

impl<F: Fetcher> Shared<F> {
    /// Cancel downloads nobody waits for and forget dead sinks of the rest.
    fn prune_dead(&self, state: &mut CoordinatorState) -> usize {
        let dead: Vec<CacheKey> = state
            .pending
            .iter()
            .filter(|(_, download)| !download.has_live_sinks())
            .map(|(key, _)| key.clone())
            .collect();

        for key in &dead {
            if let Some(download) = state.pending.remove(key) {
                debug!(target: "download", key = %key, url = %download.uri, "cancelled");
                download.cancel();
                self.stats.record_download_cancelled();
            }
        }

        for download in state.pending.values_mut() {
            download.sinks.retain(ResultSink::is_alive);
        }

        dead.len()
    }

    fn is_current(&self, key: &CacheKey, id: u64) -> bool {
        self.state.lock().pending.get(key).is_some_and(|download| download.id == id)
    }

    /// Remove the entry for this generation and hand back its sinks.
    fn take(&self, key: &CacheKey, id: u64) -> Vec<ResultSink> {
        let mut state = self.state.lock();
        let current = state.pending.get(key).is_some_and(|download| download.id == id);
        let removed = if current { state.pending.remove(key) } else { None };
        let sinks = match removed {
            Some(mut download) => {
                download.state = DownloadState::Completed;
                trace!(target: "download", key = %key, state = ?download.state, "resolved");
                download.sinks
            }
            None => Vec::new(),
        };
        self.prune_dead(&mut state);
        sinks
    }

    async fn run(self: Arc<Self>, key: CacheKey, id: u64, uri: Url) {
        let started = Instant::now();
        let result = self.fetcher.fetch(&uri).await;
        self.stats.record_fetch(started.elapsed());

        match result {
            Ok(bytes) if !bytes.is_empty() => self.complete(key, id, ImageData::from(bytes)).await,
            Ok(_) => {
                warn!(target: "download", url = %uri, "empty response");
                self.fail(&key, id);
            }
            Err(err) => {
                warn!(target: "download", url = %uri, "download failed: {err}");
                self.fail(&key, id);
            }
        }
    }

    async fn complete(self: &Arc<Self>, key: CacheKey, id: u64, data: ImageData) {
        if !self.is_current(&key, id) {
            debug!(target: "download", key = %key, "result of a cancelled download discarded");
            return;
        }

        let shared = Arc::clone(self);
        let (hook_key, hook_data) = (key.clone(), data.clone());
        let write = tokio::task::spawn_blocking(move || {
            // Aborting the task does not stop a closure already queued on the blocking pool.
            let current = shared.is_current(&hook_key, id);
            if current {
                (shared.write_through)(&hook_key, &hook_data);
            }
            current
        });
        match write.await {
            Ok(true) => {}
            Ok(false) => {
                debug!(target: "download", key = %key, "cancelled before write-through");
                return;
            }
            Err(err) => warn!(target: "download", key = %key, "write-through failed: {err}"),
        }

        let sinks = self.take(&key, id);
        let delivered = sinks.iter().filter(|sink| sink.deliver(data.clone())).count();
        self.stats.record_download_succeeded();
        debug!(target: "download", key = %key, size = data.len(), delivered, "completed");
    }

    fn fail(&self, key: &CacheKey, id: u64) {
        for sink in self.take(key, id) {
            sink.abandon();
        }
        self.stats.record_download_failed();
    }
}

/// Owns the pending-download map and the tasks behind it.
pub struct DownloadCoordinator<F> {
    shared: Arc<Shared<F>>,
}

impl<F: Fetcher> DownloadCoordinator<F> {
    /// Build a coordinator spawning its tasks on `runtime`.
    pub fn new(
        fetcher: F,
        runtime: Handle,
        write_through: WriteThrough,
        stats: Arc<StatsCollector>,
    ) -> Self {
        let shared = Shared {
            fetcher,
            runtime,
            state: Mutex::new(CoordinatorState::default()),
            write_through,
            stats,
        };
        Self { shared: Arc::new(shared) }
    }

    /// Ensure a download for `key` is pending and attach `sink` to it.
    pub fn request(&self, key: CacheKey, uri: Url, sink: ResultSink) -> RequestOutcome {
        let mut state = self.shared.state.lock();
        self.shared.prune_dead(&mut state);

        if let Some(download) = state.pending.get_mut(&key) {
            download.sinks.push(sink);
            self.shared.stats.record_download_coalesced();
            trace!(target: "download", key = %key, waiting = download.sinks.len(), "attached");
            return RequestOutcome::Attached;
        }

        state.next_id += 1;
        let id = state.next_id;
        let mut download = PendingDownload {
            id,
            uri: uri.clone(),
            sinks: vec![sink],
            state: DownloadState::NotStarted,
            abort: None,
        };

        debug!(target: "download", key = %key, url = %uri, "starting");
        let task = self.shared.runtime.spawn(Arc::clone(&self.shared).run(key.clone(), id, uri));
        download.abort = Some(task.abort_handle());
        download.state = DownloadState::InFlight;

        state.pending.insert(key, download);
        self.shared.stats.record_download_started();
        RequestOutcome::Started
    }

    /// Cancel downloads whose sinks are all gone. Returns how many were cancelled.
    pub fn prune(&self) -> usize {
        let mut state = self.shared.state.lock();
        self.shared.prune_dead(&mut state)
    }

    /// Abort every pending download and wake its waiters empty-handed.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<_> = self.shared.state.lock().pending.drain().collect();
        let count = drained.len();
        for (key, download) in drained {
            trace!(target: "download", key = %key, "aborted");
            for sink in download.cancel() {
                sink.abandon();
            }
            self.shared.stats.record_download_cancelled();
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    pub fn is_pending(&self, key: &CacheKey) -> bool {
        self.shared.state.lock().pending.contains_key(key)
    }

    pub fn state_of(&self, key: &CacheKey) -> Option<DownloadState> {
        self.shared.state.lock().pending.get(key).map(|download| download.state)
    }
}

impl<F> fmt::Debug for DownloadCoordinator<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pending = self.shared.state.lock().pending.len();
        f.debug_struct("DownloadCoordinator").field("pending", &pending).finish_non_exhaustive()
    }
}
