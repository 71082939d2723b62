//! In-memory store shared by several simulated contexts
//!
//! `SharedMemoryStore` is the device-wide medium; each context gets its own
//! `MemoryStore` handle so writes can be attributed and notifications routed
//! to everyone except the writer.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;

use super::{ContextId, KeyValueStore, StoreChange, StoreError, StoreWatcher};

/// The shared medium. Cheap to clone.
#[derive(Clone)]
pub struct SharedMemoryStore {
    data: Arc<RwLock<HashMap<String, String>>>,
    changes: broadcast::Sender<StoreChange>,
}

impl SharedMemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            data: Arc::new(RwLock::new(HashMap::new())),
            changes,
        }
    }

    /// Open a handle for one context.
    pub fn context(&self, context_id: impl Into<ContextId>) -> MemoryStore {
        MemoryStore {
            shared: self.clone(),
            context_id: context_id.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SharedMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// One context's view of a [`SharedMemoryStore`].
#[derive(Clone)]
pub struct MemoryStore {
    shared: SharedMemoryStore,
    context_id: ContextId,
}

impl MemoryStore {
    /// A store with a single context, for tests and single-tab use.
    pub fn standalone(context_id: impl Into<ContextId>) -> Self {
        SharedMemoryStore::new().context(context_id)
    }

    fn notify(&self, key: &str, removed: bool) {
        // No receivers is fine
        let _ = self.shared.changes.send(StoreChange {
            key: key.to_string(),
            writer: self.context_id.clone(),
            removed,
        });
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let data = self
            .shared
            .data
            .read()
            .map_err(|e| StoreError::Poisoned(e.to_string()))?;
        Ok(data.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        {
            let mut data = self
                .shared
                .data
                .write()
                .map_err(|e| StoreError::Poisoned(e.to_string()))?;
            data.insert(key.to_string(), value.to_string());
        }
        self.notify(key, false);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let existed = {
            let mut data = self
                .shared
                .data
                .write()
                .map_err(|e| StoreError::Poisoned(e.to_string()))?;
            data.remove(key).is_some()
        };
        if existed {
            self.notify(key, true);
        }
        Ok(())
    }

    fn context_id(&self) -> &str {
        &self.context_id
    }

    fn watch(&self) -> StoreWatcher {
        StoreWatcher::new(self.shared.changes.subscribe(), self.context_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contexts_share_data() {
        let shared = SharedMemoryStore::new();
        let tab1 = shared.context("tab1");
        let tab2 = shared.context("tab2");

        tab1.set("k", "v").unwrap();
        assert_eq!(tab2.get("k").unwrap().as_deref(), Some("v"));

        tab2.remove("k").unwrap();
        assert_eq!(tab1.get("k").unwrap(), None);
        assert!(shared.is_empty());
    }

    #[tokio::test]
    async fn test_writer_is_not_notified() {
        let shared = SharedMemoryStore::new();
        let tab1 = shared.context("tab1");
        let tab2 = shared.context("tab2");
        let mut w1 = tab1.watch();
        let mut w2 = tab2.watch();

        tab1.set("leases", "{}").unwrap();

        let change = w2.changed().await.unwrap();
        assert_eq!(change.key, "leases");
        assert_eq!(change.writer, "tab1");
        assert!(!change.removed);

        assert!(w1.try_changed().is_none());
    }

    #[test]
    fn test_remove_missing_key_is_silent() {
        let tab = MemoryStore::standalone("tab");
        let mut other = tab.shared.context("other").watch();
        tab.remove("nothing").unwrap();
        assert!(other.try_changed().is_none());
    }
}
