//! Synchronized operations
//!
//! A SyncOperation is an immutable record of one keyed state mutation. It is
//! created once (locally or on receipt), applied once, and may later be
//! superseded by conflict resolution but never edited in place.

pub mod handlers;
pub mod manager;

pub use manager::{AppState, HandlerError, OperationHandler, OperationManager, Resolution};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::clock::{ClockOrdering, DeviceId, VectorClock};
use crate::error::SyncError;
use crate::time::Timestamp;

/// Unique identifier for an operation
pub type OpId = Uuid;

/// Opaque mutation tag, e.g. "toggle", "set_field", "assign_owner"
pub type OperationKind = String;

/// Current payload schema version stamped on new operations
pub const PAYLOAD_VERSION: u32 = 1;

/// Payload fields consulted, in order, for the logical entity key.
pub const ENTITY_KEY_FIELDS: [&str; 3] = ["entity_id", "id", "key"];

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
    pub id: OpId,
    pub kind: OperationKind,
    pub payload: Value,
    /// State slice this operation mutates
    pub target_field: String,
    pub origin_device: DeviceId,
    /// Creation time; only a tie-breaker
    pub timestamp: Timestamp,
    /// Clock snapshot taken at creation
    pub clock: VectorClock,
    pub version: u32,
}

impl SyncOperation {
    pub fn new(
        kind: impl Into<OperationKind>,
        payload: Value,
        target_field: impl Into<String>,
        origin_device: DeviceId,
        timestamp: Timestamp,
        clock: VectorClock,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            payload,
            target_field: target_field.into(),
            origin_device,
            timestamp,
            clock,
            version: PAYLOAD_VERSION,
        }
    }

    /// The logical entity this operation addresses inside its target field.
    pub fn entity_key(&self) -> Option<String> {
        ENTITY_KEY_FIELDS.iter().find_map(|field| {
            match self.payload.get(field)? {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            }
        })
    }

    /// Partition key for compaction and conflict scoping.
    pub fn conflict_key(&self) -> ConflictKey {
        ConflictKey {
            target_field: self.target_field.clone(),
            entity: self.entity_key(),
        }
    }

    pub fn causal_order(&self, other: &SyncOperation) -> ClockOrdering {
        self.clock.compare(&other.clock)
    }

    /// Deterministic winner order among concurrent operations: later
    /// timestamp wins, then the lexically smaller origin device, then the
    /// smaller id.
    pub fn wins_over(&self, other: &SyncOperation) -> bool {
        if self.timestamp != other.timestamp {
            return self.timestamp > other.timestamp;
        }
        if self.origin_device != other.origin_device {
            return self.origin_device < other.origin_device;
        }
        self.id < other.id
    }

    /// Serialize to CBOR bytes.
    pub fn to_cbor(&self) -> Result<Vec<u8>, SyncError> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).map_err(|e| SyncError::Codec(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize from CBOR bytes.
    pub fn from_cbor(data: &[u8]) -> Result<Self, SyncError> {
        ciborium::from_reader(data).map_err(|e| SyncError::Codec(e.to_string()))
    }
}

/// `(targetField, entity key)` pair that scopes conflicts and compaction.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConflictKey {
    pub target_field: String,
    pub entity: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn op(device: &str, ts: Timestamp, payload: Value) -> SyncOperation {
        SyncOperation::new(
            "set_field",
            payload,
            "tasks",
            device.to_string(),
            ts,
            VectorClock::at(device, 1),
        )
    }

    #[test]
    fn test_entity_key_lookup_order() {
        assert_eq!(op("A", 1, json!({"id": "t1"})).entity_key().as_deref(), Some("t1"));
        assert_eq!(
            op("A", 1, json!({"id": "t1", "entity_id": "e9"})).entity_key().as_deref(),
            Some("e9")
        );
        assert_eq!(op("A", 1, json!({"key": 42})).entity_key().as_deref(), Some("42"));
        assert_eq!(op("A", 1, json!({"value": true})).entity_key(), None);
        assert_eq!(op("A", 1, json!("scalar")).entity_key(), None);
    }

    #[test]
    fn test_wins_over_timestamp_then_device() {
        let later = op("B", 20, json!({}));
        let earlier = op("A", 10, json!({}));
        assert!(later.wins_over(&earlier));
        assert!(!earlier.wins_over(&later));

        let x = op("X", 10, json!({}));
        let y = op("Y", 10, json!({}));
        assert!(x.wins_over(&y));
        assert!(!y.wins_over(&x));
    }

    #[test]
    fn test_cbor_codec() {
        let original = op("A", 7, json!({"id": "t1", "done": true}));
        let bytes = original.to_cbor().unwrap();
        let decoded = SyncOperation::from_cbor(&bytes).unwrap();
        assert_eq!(decoded, original);

        assert!(SyncOperation::from_cbor(&[0xff, 0x00]).is_err());
    }
}
