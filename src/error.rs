//! Error taxonomy for the synchronization core

use thiserror::Error;

use crate::operation::OpId;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("No handler registered for kind '{kind}' on target '{target_field}'")]
    NoHandler { target_field: String, kind: String },

    #[error("Handler failed for operation {op_id}: {reason}")]
    Handler { op_id: OpId, reason: String },

    /// Causally superseded. Expected during convergence, not a fault.
    #[error("Operation {0} is stale")]
    StaleOperation(OpId),

    #[error("Transport failure: {0}")]
    TransportFailure(String),

    #[error("Operation {0} expired before acknowledgment")]
    Expired(OpId),

    #[error("Resource '{resource_id}' is held by {holder}, try again shortly")]
    LeaseDenied { resource_id: String, holder: String },

    #[error("Unknown operation: {0}")]
    UnknownOperation(OpId),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Conditions that are part of normal operation rather than faults.
    pub fn is_benign(&self) -> bool {
        matches!(self, SyncError::StaleOperation(_) | SyncError::LeaseDenied { .. })
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
