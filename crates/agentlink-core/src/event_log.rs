//! Append-only event history with a live broadcast.

use std::{
    collections::HashSet,
    sync::{PoisonError, RwLock},
};

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::SessionEvent;

const LIVE_CAPACITY: usize = 10_000;

#[derive(Default)]
struct Inner {
    history: Vec<SessionEvent>,
    seen: HashSet<String>,
}

/// Event history with broadcast support.
///
/// History is only ever appended to. An event whose id was already recorded
/// is ignored, so replaying a persisted transcript on top of live delivery
/// never produces duplicates.
pub struct EventLog {
    inner: RwLock<Inner>,
    sender: broadcast::Sender<SessionEvent>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(LIVE_CAPACITY);
        Self {
            inner: RwLock::new(Inner::default()),
            sender,
        }
    }

    /// Append an event to history and publish it to live receivers.
    ///
    /// Returns `false` when the event id was already recorded.
    pub fn push(&self, event: SessionEvent) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if !inner.seen.insert(event.id.clone()) {
            tracing::trace!(event_id = %event.id, "Skipping duplicate event");
            return false;
        }
        inner.history.push(event.clone());
        // Publish under the lock so `history_plus_stream` never sees an event twice.
        let _ = self.sender.send(event);
        true
    }

    /// Seed history without publishing. Used when a transcript is fetched
    /// from the agent on resume.
    pub fn extend_history(&self, events: impl IntoIterator<Item = SessionEvent>) -> usize {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let mut added = 0;
        for event in events {
            if inner.seen.insert(event.id.clone()) {
                inner.history.push(event);
                added += 1;
            }
        }
        added
    }

    /// Get a receiver for live updates.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    /// Snapshot of the history at call time.
    #[must_use]
    pub fn snapshot(&self) -> Vec<SessionEvent> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stream that yields history first, then live updates.
    ///
    /// The receiver is taken under the same lock as the snapshot, so no
    /// event falls between the two.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, SessionEvent> {
        let (history, rx) = {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            (inner.history.clone(), self.sender.subscribe())
        };

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| async move {
            match res {
                Ok(event) => Some(event),
                Err(e) => {
                    tracing::warn!("Live event stream lagged: {e}");
                    None
                }
            }
        });

        Box::pin(hist.chain(live))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventData, SessionEventType};

    fn event(id: &str) -> SessionEvent {
        let mut event = SessionEvent::new(SessionEventType::UserMessage, EventData::default());
        event.id = id.to_string();
        event
    }

    #[test]
    fn test_push_dedupes_by_id() {
        let log = EventLog::new();
        assert!(log.push(event("a")));
        assert!(log.push(event("b")));
        assert!(!log.push(event("a")));
        let ids: Vec<_> = log.snapshot().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, ["a", "b"]);
    }

    #[test]
    fn test_extend_history_then_live() {
        let log = EventLog::new();
        assert_eq!(log.extend_history([event("a"), event("b")]), 2);
        assert!(!log.push(event("b")));
        assert!(log.push(event("c")));
        assert_eq!(log.len(), 3);
    }

    #[tokio::test]
    async fn test_history_plus_stream() {
        let log = EventLog::new();
        log.push(event("a"));
        let mut stream = log.history_plus_stream();
        log.push(event("b"));

        assert_eq!(stream.next().await.unwrap().id, "a");
        assert_eq!(stream.next().await.unwrap().id, "b");
    }

    #[test]
    fn test_stream_waits_for_live_events() {
        let log = EventLog::new();
        let mut stream = log.history_plus_stream();
        let mut next = tokio_test::task::spawn(stream.next());
        tokio_test::assert_pending!(next.poll());

        log.push(event("a"));
        assert!(next.is_woken());
        let live = tokio_test::assert_ready!(next.poll());
        assert_eq!(live.unwrap().id, "a");
    }
}
