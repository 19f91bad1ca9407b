use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use imgcache_core::cache::PersistentStore;
use imgcache_core::types::parse_absolute_uri;
use imgcache_core::{
    CacheKey, FetchError, Fetcher, ImageCache, ImageCacheConfig, ImageData, ImageHandle,
};
use parking_lot::Mutex;
use reqwest::StatusCode;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use url::Url;

const A: &str = "https://img.example.com/a.png";
const B: &str = "https://img.example.com/b.png";
const C: &str = "https://img.example.com/c.png";

/// In-memory fetcher counting calls; optionally holds every fetch until released.
struct StubFetcher {
    calls: AtomicUsize,
    gate: Option<Semaphore>,
    bodies: Mutex<HashMap<String, Vec<u8>>>,
}

impl StubFetcher {
    fn new() -> Arc<Self> {
        Arc::new(Self { calls: AtomicUsize::new(0), gate: None, bodies: Mutex::default() })
    }

    fn gated() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            gate: Some(Semaphore::new(0)),
            bodies: Mutex::default(),
        })
    }

    fn serve(&self, uri: &str, body: &[u8]) {
        self.bodies.lock().insert(uri.to_string(), body.to_vec());
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn release(&self, permits: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(permits);
        }
    }
}

impl Fetcher for StubFetcher {
    async fn fetch(&self, uri: &Url) -> Result<Vec<u8>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await.expect("gate open");
        }
        let body = self.bodies.lock().get(uri.as_str()).cloned();
        body.ok_or(FetchError::Status(StatusCode::NOT_FOUND))
    }
}

fn cache_with(
    temp: &tempfile::TempDir,
    fetcher: &Arc<StubFetcher>,
    config: ImageCacheConfig,
) -> ImageCache<Arc<StubFetcher>> {
    let config = config.with_store_root(temp.path());
    ImageCache::with_fetcher(config, Arc::clone(fetcher), Handle::current()).expect("cache")
}

fn store(temp: &tempfile::TempDir) -> PersistentStore {
    PersistentStore::new(temp.path()).expect("store")
}

fn key(uri: &str) -> CacheKey {
    CacheKey::from_url(&parse_absolute_uri(uri).expect("absolute uri"))
}

async fn wait(handle: &ImageHandle) -> Option<ImageData> {
    tokio::time::timeout(Duration::from_secs(5), handle.wait()).await.expect("handle resolves")
}

#[tokio::test]
async fn miss_downloads_into_both_tiers_then_hits_memory() {
    let temp = tempfile::tempdir().unwrap();
    let fetcher = StubFetcher::new();
    fetcher.serve(A, b"image-a");
    let cache = cache_with(&temp, &fetcher, ImageCacheConfig::default());

    let handle = cache.get(A).unwrap().expect("enabled cache returns a handle");
    assert_eq!(wait(&handle).await.as_deref(), Some(&b"image-a"[..]));

    let store = store(&temp);
    assert_eq!(store.read(&key(A)).unwrap().as_deref(), Some(&b"image-a"[..]));
    assert!(store.timestamp_path(&key(A)).is_file());

    let again = cache.get(A).unwrap().unwrap();
    assert!(again.is_ready());
    assert_eq!(again.data().as_deref(), Some(&b"image-a"[..]));
    assert_eq!(fetcher.calls(), 1);

    let stats = cache.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.memory_hits, 1);
    assert_eq!(stats.downloads_succeeded, 1);
}

#[tokio::test]
async fn store_hit_is_promoted_into_memory() {
    let temp = tempfile::tempdir().unwrap();
    let fetcher = StubFetcher::new();
    let cache = cache_with(&temp, &fetcher, ImageCacheConfig::default());
    let store = store(&temp);
    store.write(&key(A), b"from-disk").unwrap();

    let handle = cache.get(A).unwrap().unwrap();
    assert_eq!(handle.data().as_deref(), Some(&b"from-disk"[..]));

    store.delete(&key(A)).unwrap();
    let again = cache.get(A).unwrap().unwrap();
    assert_eq!(again.data().as_deref(), Some(&b"from-disk"[..]));
    assert_eq!(fetcher.calls(), 0);
    assert_eq!(cache.stats().store_hits, 1);
}

#[tokio::test]
async fn expired_entry_is_deleted_and_downloaded_again() {
    let temp = tempfile::tempdir().unwrap();
    let fetcher = StubFetcher::gated();
    fetcher.serve(A, b"fresh");
    let cache = cache_with(&temp, &fetcher, ImageCacheConfig::default());
    let store = store(&temp);
    store.write_at(&key(A), b"stale", Utc::now() - chrono::Duration::days(31)).unwrap();

    let handle = cache.get(A).unwrap().unwrap();
    assert!(handle.is_pending());
    assert!(!store.data_path(&key(A)).exists());
    assert!(!store.timestamp_path(&key(A)).exists());

    fetcher.release(1);
    assert_eq!(wait(&handle).await.as_deref(), Some(&b"fresh"[..]));
    assert!(cache.contains(A));
}

#[tokio::test]
async fn concurrent_gets_share_one_download() {
    let temp = tempfile::tempdir().unwrap();
    let fetcher = StubFetcher::gated();
    fetcher.serve(A, b"shared");
    let cache = cache_with(&temp, &fetcher, ImageCacheConfig::default());

    let first = cache.get(A).unwrap().unwrap();
    let second = cache.get(A).unwrap().unwrap();
    assert_eq!(cache.pending_downloads(), 1);
    assert!(cache.is_downloading(A));

    fetcher.release(1);
    assert_eq!(wait(&first).await.as_deref(), Some(&b"shared"[..]));
    assert_eq!(wait(&second).await.as_deref(), Some(&b"shared"[..]));
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(cache.stats().downloads_coalesced, 1);
    assert_eq!(cache.pending_downloads(), 0);
}

#[tokio::test]
async fn dropped_handle_does_not_affect_other_waiters() {
    let temp = tempfile::tempdir().unwrap();
    let fetcher = StubFetcher::gated();
    fetcher.serve(A, b"kept");
    let cache = cache_with(&temp, &fetcher, ImageCacheConfig::default());

    let dropped = cache.get(A).unwrap().unwrap();
    let kept = cache.get(A).unwrap().unwrap();
    drop(dropped);

    fetcher.release(1);
    assert_eq!(wait(&kept).await.as_deref(), Some(&b"kept"[..]));
}

#[tokio::test]
async fn abandoned_download_is_cancelled() {
    let temp = tempfile::tempdir().unwrap();
    let fetcher = StubFetcher::gated();
    fetcher.serve(A, b"unused");
    let cache = cache_with(&temp, &fetcher, ImageCacheConfig::default());

    drop(cache.get(A).unwrap().unwrap());
    let report = cache.cleanup();
    assert_eq!(report.cancelled, 1);
    assert!(!cache.is_downloading(A));

    fetcher.release(1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!cache.contains(A));
}

#[tokio::test]
async fn failed_download_caches_nothing() {
    let temp = tempfile::tempdir().unwrap();
    let fetcher = StubFetcher::new();
    let cache = cache_with(&temp, &fetcher, ImageCacheConfig::default());

    let handle = cache.get(A).unwrap().unwrap();
    assert!(wait(&handle).await.is_none());
    assert!(!cache.contains(A));
    assert!(store(&temp).list_keys().unwrap().is_empty());
    assert_eq!(cache.stats().downloads_failed, 1);

    let retry = cache.get(A).unwrap().unwrap();
    assert!(wait(&retry).await.is_none());
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test]
async fn failed_store_write_still_delivers_from_memory() {
    let temp = tempfile::tempdir().unwrap();
    let fetcher = StubFetcher::new();
    fetcher.serve(A, b"image-a");
    let cache = cache_with(&temp, &fetcher, ImageCacheConfig::default());
    let store = store(&temp);
    std::fs::create_dir(store.timestamp_path(&key(A))).unwrap();

    let handle = cache.get(A).unwrap().unwrap();
    assert_eq!(wait(&handle).await.as_deref(), Some(&b"image-a"[..]));
    assert!(!store.data_path(&key(A)).exists());

    let again = cache.get(A).unwrap().unwrap();
    assert_eq!(again.data().as_deref(), Some(&b"image-a"[..]));
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn disabled_cache_and_bad_uris_return_nothing() {
    let temp = tempfile::tempdir().unwrap();
    let fetcher = StubFetcher::new();
    fetcher.serve(A, b"a");
    let cache = cache_with(&temp, &fetcher, ImageCacheConfig::default().with_enabled(false));

    assert!(cache.get(A).unwrap().is_none());
    cache.set_enabled(true);
    assert!(cache.get("/relative/a.png").unwrap().is_none());
    assert!(cache.get("").unwrap().is_none());
    assert!(cache.get("not a uri").unwrap().is_none());

    assert_eq!(fetcher.calls(), 0);
    assert_eq!(cache.stats().bypassed, 4);
}

#[tokio::test]
async fn clear_empties_both_tiers() {
    let temp = tempfile::tempdir().unwrap();
    let fetcher = StubFetcher::new();
    fetcher.serve(A, b"a");
    let cache = cache_with(&temp, &fetcher, ImageCacheConfig::default());
    wait(&cache.get(A).unwrap().unwrap()).await.unwrap();
    assert!(cache.contains(A));

    cache.clear();
    assert!(!cache.contains(A));
    assert!(store(&temp).list_keys().unwrap().is_empty());
    assert_eq!(cache.stats().memory_entries, 0);
}

#[tokio::test]
async fn cleanup_prunes_expired_entries_only() {
    let temp = tempfile::tempdir().unwrap();
    let fetcher = StubFetcher::new();
    let cache = cache_with(&temp, &fetcher, ImageCacheConfig::default());
    let store = store(&temp);
    store.write_at(&key(A), b"old", Utc::now() - chrono::Duration::days(40)).unwrap();
    store.write(&key(B), b"new").unwrap();

    let report = cache.cleanup();
    assert_eq!(report.expired, 1);
    assert!(!store.exists(&key(A)));
    assert!(store.exists(&key(B)));
}

#[tokio::test]
async fn shrinking_expiration_delay_expires_entries() {
    let temp = tempfile::tempdir().unwrap();
    let fetcher = StubFetcher::new();
    let cache = cache_with(&temp, &fetcher, ImageCacheConfig::default());
    store(&temp).write_at(&key(A), b"a", Utc::now() - chrono::Duration::hours(2)).unwrap();
    assert!(cache.contains(A));

    cache.set_expiration_delay(Duration::from_secs(60 * 60)).unwrap();
    assert!(!cache.contains(A));
}

#[tokio::test]
async fn shrinking_memory_capacity_evicts() {
    let temp = tempfile::tempdir().unwrap();
    let fetcher = StubFetcher::new();
    for uri in [A, B, C] {
        fetcher.serve(uri, uri.as_bytes());
    }
    let cache = cache_with(&temp, &fetcher, ImageCacheConfig::default());
    for uri in [A, B, C] {
        wait(&cache.get(uri).unwrap().unwrap()).await.unwrap();
    }
    assert_eq!(cache.stats().memory_entries, 3);

    cache.set_memory_cache_capacity(1).unwrap();
    assert_eq!(cache.stats().memory_entries, 1);
    assert!(cache.set_memory_cache_capacity(-5).is_err());
    assert_eq!(cache.memory_cache_capacity(), 1);
}

#[tokio::test]
async fn invalidate_removes_entry_from_both_tiers() {
    let temp = tempfile::tempdir().unwrap();
    let fetcher = StubFetcher::new();
    fetcher.serve(A, b"corrupt");
    let cache = cache_with(&temp, &fetcher, ImageCacheConfig::default());
    wait(&cache.get(A).unwrap().unwrap()).await.unwrap();

    cache.invalidate(A);
    assert!(!cache.contains(A));
    assert!(!store(&temp).exists(&key(A)));
}

#[tokio::test]
async fn background_pruning_is_debounced() {
    let temp = tempfile::tempdir().unwrap();
    let fetcher = StubFetcher::new();
    fetcher.serve(B, b"b");
    fetcher.serve(C, b"c");
    let config = ImageCacheConfig::default()
        .with_pruning(Duration::from_secs(60), Duration::from_millis(50));
    let cache = cache_with(&temp, &fetcher, config);
    let store = store(&temp);
    let long_ago = Utc::now() - chrono::Duration::days(90);

    let first_stale = key("https://img.example.com/first-stale.png");
    store.write_at(&first_stale, b"x", long_ago).unwrap();
    let handle = cache.get(B).unwrap().unwrap();
    assert!(cache.is_pruning_scheduled());
    wait(&handle).await.unwrap();

    for _ in 0..200 {
        if !store.exists(&first_stale) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!store.exists(&first_stale), "scheduled pass should remove expired entries");
    assert!(!cache.is_pruning_scheduled());

    let second_stale = key("https://img.example.com/second-stale.png");
    store.write_at(&second_stale, b"y", long_ago).unwrap();
    wait(&cache.get(C).unwrap().unwrap()).await.unwrap();
    assert!(!cache.is_pruning_scheduled(), "a pass ran less than an interval ago");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(store.exists(&second_stale));
}

/// Serve one canned HTTP response on an ephemeral port and return its URL.
async fn serve_once(response: &'static [u8]) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
        }
        socket.write_all(response).await.unwrap();
        socket.shutdown().await.ok();
    });

    format!("http://{addr}/photo.jpg")
}

#[tokio::test]
async fn http_cache_downloads_over_the_network() {
    let temp = tempfile::tempdir().unwrap();
    let uri =
        serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nJFIF!").await;
    let cache = ImageCache::new(ImageCacheConfig::default().with_store_root(temp.path())).unwrap();

    let handle = cache.get(&uri).unwrap().unwrap();
    assert_eq!(wait(&handle).await.as_deref(), Some(&b"JFIF!"[..]));
    assert!(cache.contains(&uri));
    assert!(cache.get(&uri).unwrap().unwrap().is_ready());
}
