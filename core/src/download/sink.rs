//! Placeholder handles given to callers and the weak sinks that fill them.
//!
//! The caller owns an [`ImageHandle`]; the coordinator only keeps a [`ResultSink`] pointing at the
//! same slot through a `Weak`. Dropping every clone of the handle is how a caller says it no longer
//! cares, and the coordinator notices on its next liveness check.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::types::ImageData;

/// Observable state of a placeholder.
#[derive(Debug, Clone)]
pub enum HandleState {
    /// The download this handle waits on has not resolved yet.
    Pending,
    Ready(ImageData),
    /// The download resolved without data; nothing will be delivered.
    Unavailable,
}

#[derive(Debug)]
struct Slot {
    state: Mutex<HandleState>,
    changed: Notify,
}

impl Slot {
    fn new(state: HandleState) -> Arc<Self> {
        Arc::new(Self { state: Mutex::new(state), changed: Notify::new() })
    }

    /// Move out of `Pending` exactly once.
    fn resolve(&self, next: HandleState) -> bool {
        let mut state = self.state.lock();
        if !matches!(*state, HandleState::Pending) {
            return false;
        }
        *state = next;
        drop(state);
        self.changed.notify_waiters();
        true
    }
}

/// Placeholder returned by [`crate::ImageCache::get`], filled in at most once.
#[derive(Debug, Clone)]
pub struct ImageHandle {
    slot: Arc<Slot>,
}

impl ImageHandle {
    pub(crate) fn pending() -> Self {
        Self { slot: Slot::new(HandleState::Pending) }
    }

    pub(crate) fn ready(data: ImageData) -> Self {
        Self { slot: Slot::new(HandleState::Ready(data)) }
    }

    /// Weak sink the coordinator uses to deliver into this handle.
    pub(crate) fn sink(&self) -> ResultSink {
        ResultSink { slot: Arc::downgrade(&self.slot) }
    }

    pub fn state(&self) -> HandleState {
        self.slot.state.lock().clone()
    }

    /// The image bytes, if they have arrived.
    pub fn data(&self) -> Option<ImageData> {
        match &*self.slot.state.lock() {
            HandleState::Ready(data) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.slot.state.lock(), HandleState::Ready(_))
    }

    pub fn is_pending(&self) -> bool {
        matches!(*self.slot.state.lock(), HandleState::Pending)
    }

    /// Wait until the handle resolves, returning the bytes or `None` if the download produced none.
    pub async fn wait(&self) -> Option<ImageData> {
        loop {
            let notified = self.slot.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match &*self.slot.state.lock() {
                HandleState::Pending => {}
                HandleState::Ready(data) => return Some(data.clone()),
                HandleState::Unavailable => return None,
            }

            notified.await;
        }
    }
}

/// Coordinator-side reference to a caller's [`ImageHandle`].
#[derive(Debug, Clone)]
pub struct ResultSink {
    slot: Weak<Slot>,
}

impl ResultSink {
    /// Whether any clone of the originating handle is still held.
    pub fn is_alive(&self) -> bool {
        self.slot.strong_count() > 0
    }

    /// Fill the handle. Returns `false` if the handle is gone or already resolved.
    pub fn deliver(&self, data: ImageData) -> bool {
        self.slot.upgrade().is_some_and(|slot| slot.resolve(HandleState::Ready(data)))
    }

    /// Wake waiters with no data. Returns `false` if the handle is gone or already resolved.
    pub fn abandon(&self) -> bool {
        self.slot.upgrade().is_some_and(|slot| slot.resolve(HandleState::Unavailable))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn bytes(value: &[u8]) -> ImageData {
        ImageData::from(value)
    }

    #[test]
    fn ready_handles_expose_data_immediately() {
        let handle = ImageHandle::ready(bytes(&[1, 2]));
        assert!(handle.is_ready());
        assert_eq!(handle.data().as_deref(), Some(&[1u8, 2][..]));
    }

    #[test]
    fn sink_fills_handle_exactly_once() {
        let handle = ImageHandle::pending();
        let sink = handle.sink();

        assert!(sink.deliver(bytes(&[7])));
        assert!(!sink.deliver(bytes(&[8])));
        assert!(!sink.abandon());
        assert_eq!(handle.data().as_deref(), Some(&[7u8][..]));
    }

    #[test]
    fn dropping_every_clone_kills_the_sink() {
        let handle = ImageHandle::pending();
        let clone = handle.clone();
        let sink = handle.sink();

        drop(handle);
        assert!(sink.is_alive());
        drop(clone);
        assert!(!sink.is_alive());
        assert!(!sink.deliver(bytes(&[1])));
    }

    #[tokio::test]
    async fn wait_wakes_on_delivery() {
        let handle = ImageHandle::pending();
        let sink = handle.sink();

        let deliver = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            sink.deliver(ImageData::from(&[3u8, 4][..]))
        });

        let data = tokio::time::timeout(Duration::from_secs(5), handle.wait()).await.unwrap();
        assert_eq!(data.as_deref(), Some(&[3u8, 4][..]));
        assert!(deliver.await.unwrap());
    }

    #[tokio::test]
    async fn wait_returns_none_when_abandoned() {
        let handle = ImageHandle::pending();
        assert!(handle.sink().abandon());
        assert!(handle.wait().await.is_none());
        assert!(matches!(handle.state(), HandleState::Unavailable));
    }
}
