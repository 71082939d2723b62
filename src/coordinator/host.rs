//! Seams to the host application: its state container and its transport.

use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::operation::{AppState, SyncOperation};
use crate::queue::Priority;

/// The host's state, addressed one target field at a time.
pub trait StateContainer: Send + Sync {
    /// Current slice for `target_field` (Null if absent)
    fn get_state(&self, target_field: &str) -> Value;

    /// Replace the slice for `target_field`. Null removes it.
    fn apply_patch(&self, target_field: &str, slice: Value);
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport is offline")]
    Offline,

    #[error("Remote rejected the operation: {0}")]
    Rejected(String),

    #[error("Transport IO error: {0}")]
    Io(String),
}

/// Delivers operations to remote devices and surfaces theirs.
///
/// A successful `send` is the delivery confirmation; the queue entry is
/// acknowledged on it. Deliveries may be reordered, dropped or duplicated.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, op: &SyncOperation, priority: Priority) -> Result<(), TransportError>;

    /// Subscribe to operations arriving from remote devices.
    fn incoming(&self) -> broadcast::Receiver<SyncOperation>;
}

/// A `StateContainer` over an in-memory map.
#[derive(Default)]
pub struct MemoryStateContainer {
    state: RwLock<AppState>,
}

impl MemoryStateContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: AppState) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }

    /// Copy of every slice
    pub fn snapshot(&self) -> AppState {
        match self.state.read() {
            Ok(s) => s.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl StateContainer for MemoryStateContainer {
    fn get_state(&self, target_field: &str) -> Value {
        let state = match self.state.read() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.get(target_field).cloned().unwrap_or(Value::Null)
    }

    fn apply_patch(&self, target_field: &str, slice: Value) {
        let mut state = match self.state.write() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slice.is_null() {
            state.remove(target_field);
        } else {
            state.insert(target_field.to_string(), slice);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_patch_and_read_back() {
        let container = MemoryStateContainer::new();
        assert_eq!(container.get_state("tasks"), Value::Null);

        container.apply_patch("tasks", json!({"t1": {"done": true}}));
        assert_eq!(container.get_state("tasks")["t1"]["done"], json!(true));

        container.apply_patch("tasks", Value::Null);
        assert!(container.snapshot().is_empty());
    }
}
