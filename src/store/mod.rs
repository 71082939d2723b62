//! Shared key-value storage visible to every context on a device
//!
//! Reads and writes are synchronous. Change notifications are asynchronous
//! and only delivered to contexts other than the writer. Nothing here is
//! atomic across contexts: callers read-modify-write whole records through
//! [`update_json`] to keep race windows short, not to eliminate them.

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::{MemoryStore, SharedMemoryStore};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

/// Identifier of one execution context (tab, process) sharing a store
pub type ContextId = String;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Store lock poisoned: {0}")]
    Poisoned(String),
}

/// A write observed by another context.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreChange {
    pub key: String,
    pub writer: ContextId,
    pub removed: bool,
}

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// This handle's context id
    fn context_id(&self) -> &str;

    /// Subscribe to writes made by other contexts.
    fn watch(&self) -> StoreWatcher;
}

/// Receives change notifications, skipping this context's own writes.
pub struct StoreWatcher {
    rx: broadcast::Receiver<StoreChange>,
    context: ContextId,
}

impl StoreWatcher {
    pub fn new(rx: broadcast::Receiver<StoreChange>, context: ContextId) -> Self {
        Self { rx, context }
    }

    /// Wait for the next foreign change. Returns None once the store is gone.
    pub async fn changed(&mut self) -> Option<StoreChange> {
        loop {
            match self.rx.recv().await {
                Ok(change) if change.writer == self.context => continue,
                Ok(change) => return Some(change),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Store watcher for {} lagged by {} changes", self.context, n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next pending foreign change, if one is already queued.
    pub fn try_changed(&mut self) -> Option<StoreChange> {
        loop {
            match self.rx.try_recv() {
                Ok(change) if change.writer == self.context => continue,
                Ok(change) => return Some(change),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

/// Read and decode a JSON record.
pub fn load_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(key)? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| StoreError::Serialization(format!("{key}: {e}"))),
        None => Ok(None),
    }
}

/// Encode and write a JSON record.
pub fn save_json<T: Serialize>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let raw = serde_json::to_string(value)
        .map_err(|e| StoreError::Serialization(format!("{key}: {e}")))?;
    store.set(key, &raw)
}

/// Read-modify-write a whole JSON record in one step.
///
/// A record that fails to decode is replaced with the default rather than
/// wedging every later writer.
pub fn update_json<T, R>(
    store: &dyn KeyValueStore,
    key: &str,
    f: impl FnOnce(&mut T) -> R,
) -> Result<R, StoreError>
where
    T: Serialize + DeserializeOwned + Default,
{
    update_json_reporting(store, key, f).map(|(out, _)| out)
}

/// Like [`update_json`], also returning the decode error of a record that
/// had to be discarded so the caller can surface the loss.
pub fn update_json_reporting<T, R>(
    store: &dyn KeyValueStore,
    key: &str,
    f: impl FnOnce(&mut T) -> R,
) -> Result<(R, Option<String>), StoreError>
where
    T: Serialize + DeserializeOwned + Default,
{
    let (mut record, discarded): (T, _) = match load_json(store, key) {
        Ok(v) => (v.unwrap_or_default(), None),
        Err(StoreError::Serialization(e)) => {
            log::warn!("Discarding unreadable record {}", e);
            (T::default(), Some(e))
        }
        Err(e) => return Err(e),
    };
    let out = f(&mut record);
    save_json(store, key, &record)?;
    Ok((out, discarded))
}
