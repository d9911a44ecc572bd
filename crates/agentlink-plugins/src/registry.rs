//! Named plugin factories used by `/plugins install`.

use std::{
    collections::BTreeMap,
    sync::{Arc, PoisonError, RwLock},
};

use crate::Plugin;

type Factory = Arc<dyn Fn() -> Arc<dyn Plugin> + Send + Sync>;

struct Entry {
    description: String,
    factory: Factory,
}

/// Catalog of installable plugins, listed in name order.
#[derive(Default)]
pub struct PluginRegistry {
    factories: RwLock<BTreeMap<String, Entry>>,
}

impl PluginRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a factory.
    pub fn add<F>(&self, name: impl Into<String>, description: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn Plugin> + Send + Sync + 'static,
    {
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                name.into(),
                Entry {
                    description: description.into(),
                    factory: Arc::new(factory),
                },
            );
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Instantiate the plugin registered under `name`.
    #[must_use]
    pub fn create(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        let factory = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|e| Arc::clone(&e.factory))?;
        Some(factory())
    }

    /// `(name, description)` pairs.
    #[must_use]
    pub fn available(&self) -> Vec<(String, String)> {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, e)| (name.clone(), e.description.clone()))
            .collect()
    }
}
