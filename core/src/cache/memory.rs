//! In-memory LRU tier for recently served images.

use hashlink::LruCache;
use parking_lot::Mutex;
use tracing::trace;

use crate::types::{CacheKey, ImageData};

#[derive(Debug)]
struct Inner {
    entries: LruCache<CacheKey, ImageData>,
    capacity: usize,
    bytes_used: usize,
}

impl Inner {
    /// Drop least-recently-used entries until the entry count fits the capacity.
    fn evict_to_capacity(&mut self) -> usize {
        let mut evicted = 0;
        while self.entries.len() > self.capacity {
            match self.entries.remove_lru() {
                Some((key, oldest)) => {
                    self.bytes_used = self.bytes_used.saturating_sub(oldest.len());
                    evicted += 1;
                    trace!(target: "cache::memory", key = %key, "evicted");
                }
                None => break,
            }
        }
        evicted
    }
}

/// Entry-count bounded LRU keyed by [`CacheKey`].
///
/// The key index and the recency order live in one `LruCache`, and every operation goes through a
/// single mutex, so the two can never disagree.
#[derive(Debug)]
pub struct MemoryCache {
    inner: Mutex<Inner>,
}

impl MemoryCache {
    /// Construct a cache holding at most `capacity` entries. `0` disables the tier.
    pub fn new(capacity: usize) -> Self {
        let inner = Inner { entries: LruCache::new_unbounded(), capacity, bytes_used: 0 };
        Self { inner: Mutex::new(inner) }
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Total payload bytes held by the tier.
    pub fn bytes_used(&self) -> usize {
        self.inner.lock().bytes_used
    }

    /// Retrieve an entry, promoting it to most-recently-used.
    pub fn get(&self, key: &CacheKey) -> Option<ImageData> {
        let mut inner = self.inner.lock();
        if inner.capacity == 0 {
            return None;
        }
        inner.entries.get(key).cloned()
    }

    /// Presence check that leaves the recency order untouched.
    pub fn contains(&self, key: &CacheKey) -> bool {
        let inner = self.inner.lock();
        inner.capacity > 0 && inner.entries.peek(key).is_some()
    }

    /// Insert or replace an entry as most-recently-used, evicting the oldest entries on overflow.
    ///
    /// Empty payloads and puts into a zero-capacity tier are ignored.
    pub fn put(&self, key: CacheKey, data: ImageData) {
        if data.is_empty() {
            return;
        }

        let mut inner = self.inner.lock();
        if inner.capacity == 0 {
            return;
        }

        let size = data.len();
        if let Some(previous) = inner.entries.insert(key, data) {
            inner.bytes_used = inner.bytes_used.saturating_sub(previous.len());
        }
        inner.bytes_used += size;
        inner.evict_to_capacity();
    }

    /// Change the capacity and evict down to it immediately.
    pub fn set_capacity(&self, capacity: usize) -> usize {
        let mut inner = self.inner.lock();
        inner.capacity = capacity;
        inner.evict_to_capacity()
    }

    /// Evict down to the configured capacity, returning how many entries were dropped.
    pub fn trim(&self) -> usize {
        self.inner.lock().evict_to_capacity()
    }

    /// Remove an entry if present.
    pub fn remove(&self, key: &CacheKey) -> Option<ImageData> {
        let mut inner = self.inner.lock();
        let removed = inner.entries.remove(key);
        if let Some(ref data) = removed {
            inner.bytes_used = inner.bytes_used.saturating_sub(data.len());
        }
        removed
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.bytes_used = 0;
    }
}
