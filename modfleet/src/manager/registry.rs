//! Owned collection of managers, keyed by lowercased community name.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::Manager;

/// Cheap-to-clone handle to the fleet's managers.
#[derive(Clone, Default)]
pub struct ManagerRegistry {
    inner: Arc<RwLock<BTreeMap<String, Arc<Manager>>>>,
}

impl ManagerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, manager: Arc<Manager>) -> Option<Arc<Manager>> {
        self.inner.write().insert(key(manager.community()), manager)
    }

    pub fn remove(&self, community: &str) -> Option<Arc<Manager>> {
        self.inner.write().remove(&key(community))
    }

    /// Case-insensitive lookup.
    pub fn get(&self, community: &str) -> Option<Arc<Manager>> {
        self.inner.read().get(&key(community)).cloned()
    }

    pub fn contains(&self, community: &str) -> bool {
        self.inner.read().contains_key(&key(community))
    }

    /// Managers in name order. The lock is released before returning.
    pub fn snapshot(&self) -> Vec<Arc<Manager>> {
        self.inner.read().values().cloned().collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.inner
            .read()
            .values()
            .map(|m| m.community().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

fn key(community: &str) -> String {
    community.to_ascii_lowercase()
}
