//! Per-(plugin, session) key/value data.

use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

type Key = (String, String);

/// Storage for every plugin's private per-session data.
///
/// Buckets are keyed by `(plugin, session)`, so neither two plugins nor two
/// sessions can observe each other's entries.
#[derive(Default)]
pub struct PluginDataStore {
    buckets: RwLock<HashMap<Key, HashMap<String, Value>>>,
}

impl PluginDataStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scoped handle for one plugin in one session.
    #[must_use]
    pub fn scope(self: &Arc<Self>, plugin: &str, session_id: &str) -> PluginData {
        PluginData {
            store: Arc::clone(self),
            key: (plugin.to_string(), session_id.to_string()),
        }
    }

    /// Discard everything stored for `session_id`.
    pub fn close_session(&self, session_id: &str) -> usize {
        let mut buckets = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        let before = buckets.len();
        buckets.retain(|(_, session), _| session != session_id);
        before - buckets.len()
    }

    /// Discard everything a plugin stored, across sessions.
    pub fn remove_plugin(&self, plugin: &str) {
        self.buckets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(owner, _), _| owner != plugin);
    }

    fn with_bucket<T>(&self, key: &Key, f: impl FnOnce(Option<&HashMap<String, Value>>) -> T) -> T {
        let buckets = self.buckets.read().unwrap_or_else(PoisonError::into_inner);
        f(buckets.get(key))
    }

    fn with_bucket_mut<T>(&self, key: &Key, f: impl FnOnce(&mut HashMap<String, Value>) -> T) -> T {
        let mut buckets = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        f(buckets.entry(key.clone()).or_default())
    }
}

/// A plugin's view of its data for one session.
#[derive(Clone)]
pub struct PluginData {
    store: Arc<PluginDataStore>,
    key: Key,
}

impl PluginData {
    #[must_use]
    pub fn plugin(&self) -> &str {
        &self.key.0
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.key.1
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.store
            .with_bucket(&self.key, |bucket| bucket.and_then(|b| b.get(key).cloned()))
    }

    /// Typed read; `None` when absent or of a different shape.
    #[must_use]
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| serde_json::from_value(v).ok())
    }

    /// Store a value, returning the previous one.
    pub fn set(&self, key: impl Into<String>, value: impl Serialize) -> Option<Value> {
        let value = match serde_json::to_value(value) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(plugin = %self.key.0, "Failed to serialize plugin data: {e}");
                return None;
            }
        };
        self.store
            .with_bucket_mut(&self.key, |bucket| bucket.insert(key.into(), value))
    }

    /// Read-modify-write under a single lock.
    pub fn update(&self, key: &str, f: impl FnOnce(Option<Value>) -> Value) {
        self.store.with_bucket_mut(&self.key, |bucket| {
            let current = bucket.remove(key);
            bucket.insert(key.to_string(), f(current));
        });
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.store
            .with_bucket_mut(&self.key, |bucket| bucket.remove(key))
    }

    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.store.with_bucket(&self.key, |bucket| {
            let mut keys: Vec<String> = bucket.map(|b| b.keys().cloned().collect()).unwrap_or_default();
            keys.sort();
            keys
        })
    }
}

impl std::fmt::Debug for PluginData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginData")
            .field("plugin", &self.key.0)
            .field("session_id", &self.key.1)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolation_across_plugins_and_sessions() {
        let store = Arc::new(PluginDataStore::new());
        let a_in_s1 = store.scope("a", "s1");
        let b_in_s1 = store.scope("b", "s1");
        let a_in_s2 = store.scope("a", "s2");

        a_in_s1.set("count", 1);
        b_in_s1.set("count", 2);

        assert_eq!(a_in_s1.get_as::<i32>("count"), Some(1));
        assert_eq!(b_in_s1.get_as::<i32>("count"), Some(2));
        assert_eq!(a_in_s2.get("count"), None);
    }

    #[test]
    fn test_close_session_discards_only_that_session() {
        let store = Arc::new(PluginDataStore::new());
        store.scope("a", "s1").set("k", "v");
        store.scope("b", "s1").set("k", "v");
        store.scope("a", "s2").set("k", "v");

        assert_eq!(store.close_session("s1"), 2);
        assert!(store.scope("a", "s1").keys().is_empty());
        assert_eq!(store.scope("a", "s2").keys(), ["k"]);
    }

    #[test]
    fn test_update_counter() {
        let store = Arc::new(PluginDataStore::new());
        let data = store.scope("counter", "s");
        for _ in 0..3 {
            data.update("n", |v| {
                Value::from(v.and_then(|v| v.as_i64()).unwrap_or(0) + 1)
            });
        }
        assert_eq!(data.get_as::<i64>("n"), Some(3));
    }
}
