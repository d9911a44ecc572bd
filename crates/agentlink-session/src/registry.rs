//! Session id → session routing table.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, PoisonError},
};

use tokio::sync::mpsc;

use agentlink_core::SessionEvent;

use crate::Session;

/// Events held per unknown session id.
const ORPHAN_LIMIT: usize = 256;
/// Unknown session ids tracked at once.
const ORPHAN_SESSIONS: usize = 64;

struct Entry {
    session: Arc<Session>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Entry>,
    orphans: HashMap<String, VecDeque<SessionEvent>>,
}

/// Live sessions of one connection.
///
/// Events for an id that is not registered yet (the agent may emit them
/// before the `session.create` response is processed) are buffered and
/// replayed, in order, when the session registers.
#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<Inner>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `session`. A previous entry with the same id is replaced and
    /// returned so the caller can end it.
    pub(crate) fn insert(
        &self,
        session: Arc<Session>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Option<Arc<Session>> {
        let mut inner = self.lock();
        let id = session.id().to_string();
        if let Some(buffered) = inner.orphans.remove(&id) {
            tracing::debug!(session_id = %id, count = buffered.len(), "Replaying early events");
            for event in buffered {
                let _ = events.send(event);
            }
        }
        let replaced = inner
            .sessions
            .insert(id.clone(), Entry { session, events })
            .map(|e| e.session);
        if replaced.is_some() {
            tracing::debug!(session_id = %id, "Replaced existing session record");
        }
        replaced
    }

    /// Deliver `event` to its session, or buffer it.
    pub(crate) fn route(&self, session_id: &str, event: SessionEvent) {
        let mut inner = self.lock();
        if let Some(entry) = inner.sessions.get(session_id) {
            let _ = entry.events.send(event);
            return;
        }

        if !inner.orphans.contains_key(session_id) && inner.orphans.len() >= ORPHAN_SESSIONS {
            tracing::debug!(session_id, "Dropping event for unknown session");
            return;
        }
        let queue = inner.orphans.entry(session_id.to_string()).or_default();
        if queue.len() >= ORPHAN_LIMIT {
            queue.pop_front();
        }
        queue.push_back(event);
    }

    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.lock()
            .sessions
            .get(session_id)
            .map(|e| Arc::clone(&e.session))
    }

    #[must_use]
    pub fn contains(&self, session_id: &str) -> bool {
        self.lock().sessions.contains_key(session_id)
    }

    /// Unregister a session. Its event pump stops once queued events drain.
    pub(crate) fn remove(&self, session_id: &str) -> Option<Arc<Session>> {
        let mut inner = self.lock();
        inner.orphans.remove(session_id);
        inner.sessions.remove(session_id).map(|e| e.session)
    }

    /// Unregister every session.
    pub(crate) fn drain(&self) -> Vec<Arc<Session>> {
        let mut inner = self.lock();
        inner.orphans.clear();
        inner.sessions.drain().map(|(_, e)| e.session).collect()
    }

    #[must_use]
    pub fn all(&self) -> Vec<Arc<Session>> {
        self.lock()
            .sessions
            .values()
            .map(|e| Arc::clone(&e.session))
            .collect()
    }

    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.lock().sessions.keys().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Weak;

    use super::*;
    use crate::session::Handlers;
    use agentlink_core::{EventData, SessionEventType};

    fn event(id: &str) -> SessionEvent {
        let mut event = SessionEvent::new(SessionEventType::SessionInfo, EventData::default());
        event.id = id.to_string();
        event
    }

    fn detached(id: &str) -> (Arc<Session>, mpsc::UnboundedSender<SessionEvent>) {
        Session::spawn(Weak::new(), id.to_string(), None, Handlers::default())
    }

    #[tokio::test]
    async fn test_early_events_are_replayed_in_order() {
        let registry = SessionRegistry::new();
        registry.route("s1", event("e1"));
        registry.route("s1", event("e2"));
        registry.route("other", event("x"));

        let (session, tx) = detached("s1");
        registry.insert(Arc::clone(&session), tx);
        registry.route("s1", event("e3"));

        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while session.get_messages().len() < 3 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        let ids: Vec<_> = session.get_messages().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, ["e1", "e2", "e3"]);
    }

    #[tokio::test]
    async fn test_orphan_buffer_is_bounded() {
        let registry = SessionRegistry::new();
        for n in 0..ORPHAN_LIMIT + 10 {
            registry.route("s1", event(&format!("e{n}")));
        }
        let inner = registry.lock();
        let queue = &inner.orphans["s1"];
        assert_eq!(queue.len(), ORPHAN_LIMIT);
        assert_eq!(queue.front().unwrap().id, "e10");
    }

    #[tokio::test]
    async fn test_remove_and_drain() {
        let registry = SessionRegistry::new();
        let (a, tx_a) = detached("a");
        let (b, tx_b) = detached("b");
        assert!(registry.insert(a, tx_a).is_none());
        assert!(registry.insert(b, tx_b).is_none());

        let (stale, tx_stale) = detached("b");
        let replaced = registry.insert(Arc::clone(&stale), tx_stale);
        assert!(replaced.is_some_and(|old| !Arc::ptr_eq(&old, &stale)));
        assert!(Arc::ptr_eq(&registry.get("b").unwrap(), &stale));

        assert!(registry.remove("a").is_some());
        assert!(registry.remove("a").is_none());
        assert!(registry.contains("b"));
        assert_eq!(registry.drain().len(), 1);
        assert!(registry.is_empty());
    }
}
