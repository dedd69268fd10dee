//! In-flight request correlation table.
//!
//! Maps request ids to the bounded frame queue feeding each request's response
//! assembler. The ingress handler registers an entry immediately before
//! writing the request frame and holds a [`PendingGuard`] so the entry is
//! removed on every exit path, including cancellation. The read pump offers
//! frames without blocking: a slow consumer loses frames rather than stalling
//! a tunnel shared with other requests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::frame::Frame;

/// Response sink depth. Sized for a burst of stream chunks ahead of a consumer.
pub const RESPONSE_QUEUE_CAPACITY: usize = 10;

/// Result of offering a frame to a pending request's sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered,
    /// Sink exists but is full; the frame was dropped.
    QueueFull,
    /// No entry for this id (request already completed or timed out).
    NotFound,
}

/// Table of in-flight requests. Lock scope is a single map operation.
#[derive(Default)]
pub struct PendingRequests {
    inner: Mutex<HashMap<String, mpsc::Sender<Frame>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Create the response sink for `request_id`.
    ///
    /// Returns `None` if the id is already present — ids are fresh UUIDs, so
    /// this indicates a caller bug rather than a runtime condition.
    pub fn register(
        self: &Arc<Self>,
        request_id: &str,
    ) -> Option<(PendingGuard, mpsc::Receiver<Frame>)> {
        let (tx, rx) = mpsc::channel(RESPONSE_QUEUE_CAPACITY);
        {
            let mut inner = self.inner.lock().expect("pending table poisoned");
            if inner.contains_key(request_id) {
                return None;
            }
            inner.insert(request_id.to_string(), tx);
        }
        let guard = PendingGuard {
            table: Arc::clone(self),
            request_id: request_id.to_string(),
        };
        Some((guard, rx))
    }

    /// Offer a frame to the sink for `request_id` without blocking.
    pub fn dispatch(&self, request_id: &str, frame: Frame) -> DispatchOutcome {
        let sender = {
            let inner = self.inner.lock().expect("pending table poisoned");
            inner.get(request_id).cloned()
        };
        match sender {
            None => DispatchOutcome::NotFound,
            Some(tx) => match tx.try_send(frame) {
                Ok(()) => DispatchOutcome::Delivered,
                Err(mpsc::error::TrySendError::Full(_)) => DispatchOutcome::QueueFull,
                // Receiver dropped but entry not yet reaped by the guard.
                Err(mpsc::error::TrySendError::Closed(_)) => DispatchOutcome::NotFound,
            },
        }
    }

    /// Remove an entry. Idempotent.
    pub fn remove(&self, request_id: &str) {
        self.inner
            .lock()
            .expect("pending table poisoned")
            .remove(request_id);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("pending table poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes the pending entry when dropped, on every exit path.
pub struct PendingGuard {
    table: Arc<PendingRequests>,
    request_id: String,
}

impl PendingGuard {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.table.remove(&self.request_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameType;
    use serde_json::Map;

    fn frame(id: &str, kind: FrameType) -> Frame {
        Frame {
            id: id.to_string(),
            kind,
            payload: Map::new(),
        }
    }

    #[test]
    fn test_register_dispatch_remove_balance() {
        let table = Arc::new(PendingRequests::new());
        let (guard, mut rx) = table.register("req-1").unwrap();
        assert_eq!(table.len(), 1);

        assert_eq!(
            table.dispatch("req-1", frame("req-1", FrameType::HttpResponse)),
            DispatchOutcome::Delivered
        );
        assert_eq!(rx.try_recv().unwrap().kind, FrameType::HttpResponse);

        drop(guard);
        assert!(table.is_empty());
        assert_eq!(
            table.dispatch("req-1", frame("req-1", FrameType::StreamEnd)),
            DispatchOutcome::NotFound
        );
    }

    #[test]
    fn test_duplicate_register_fails() {
        let table = Arc::new(PendingRequests::new());
        let first = table.register("req-1");
        assert!(first.is_some());
        assert!(table.register("req-1").is_none());
        // The failed attempt must not have clobbered the live entry.
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_dispatch_drops_on_full_queue() {
        let table = Arc::new(PendingRequests::new());
        let (_guard, _rx) = table.register("req-1").unwrap();

        for _ in 0..RESPONSE_QUEUE_CAPACITY {
            assert_eq!(
                table.dispatch("req-1", frame("req-1", FrameType::StreamChunk)),
                DispatchOutcome::Delivered
            );
        }
        assert_eq!(
            table.dispatch("req-1", frame("req-1", FrameType::StreamChunk)),
            DispatchOutcome::QueueFull
        );
    }

    #[test]
    fn test_dispatch_unknown_id() {
        let table = PendingRequests::new();
        assert_eq!(
            table.dispatch("ghost", frame("ghost", FrameType::Error)),
            DispatchOutcome::NotFound
        );
    }

    #[test]
    fn test_guard_outlives_dropped_receiver() {
        let table = Arc::new(PendingRequests::new());
        let (guard, rx) = table.register("req-1").unwrap();
        drop(rx);
        // Entry still present until the guard goes; dispatch reports NotFound
        // because the consumer is gone.
        assert_eq!(table.len(), 1);
        assert_eq!(
            table.dispatch("req-1", frame("req-1", FrameType::StreamChunk)),
            DispatchOutcome::NotFound
        );
        drop(guard);
        assert!(table.is_empty());
    }

    #[test]
    fn test_remove_idempotent() {
        let table = Arc::new(PendingRequests::new());
        let (guard, _rx) = table.register("req-1").unwrap();
        table.remove("req-1");
        table.remove("req-1");
        assert!(table.is_empty());
        drop(guard); // guard's drop removes an already-absent entry
    }
}
