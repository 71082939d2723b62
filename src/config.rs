//! Tunables for a sync context, loadable from JSON.
//!
//! Every section defaults field-by-field, so a config file only needs the
//! values it changes.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::coordinator::DispatchConfig;
use crate::error::SyncError;
use crate::lease::LeaseConfig;
use crate::operation::manager::DEFAULT_JOURNAL_LIMIT;
use crate::queue::{QueueConfig, RetryPolicy};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub queue: QueueConfig,
    pub retry: RetryPolicy,
    pub dispatch: DispatchConfig,
    pub lease: LeaseConfig,
    /// Applied operations kept per target for rollback
    pub journal_limit: usize,
    /// Remote operation ids remembered for duplicate suppression
    pub seen_limit: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            retry: RetryPolicy::default(),
            dispatch: DispatchConfig::default(),
            lease: LeaseConfig::default(),
            journal_limit: DEFAULT_JOURNAL_LIMIT,
            seen_limit: 4_096,
        }
    }
}

impl SyncConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, SyncError> {
        let config: SyncConfig =
            serde_json::from_str(raw).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.queue.ttl_ms == 0 {
            return Err(SyncError::Config("queue.ttl_ms must be positive".into()));
        }
        if self.queue.max_entries == 0 {
            return Err(SyncError::Config("queue.max_entries must be positive".into()));
        }
        if self.queue.storage_key.is_empty() || self.lease.storage_key.is_empty() {
            return Err(SyncError::Config("storage keys must not be empty".into()));
        }
        if self.queue.storage_key == self.lease.storage_key {
            return Err(SyncError::Config(
                "queue and lease records need distinct storage keys".into(),
            ));
        }
        if self.dispatch.normal_max_wait_ms < self.dispatch.normal_debounce_ms {
            return Err(SyncError::Config(
                "dispatch.normal_max_wait_ms must be at least normal_debounce_ms".into(),
            ));
        }
        if !(self.retry.backoff_factor >= 1.0) {
            return Err(SyncError::Config("retry.backoff_factor must be >= 1.0".into()));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(SyncError::Config("retry.jitter_factor must be within 0..=1".into()));
        }
        Ok(())
    }
}
