//! Status and diagnostic events
//!
//! Every component publishes onto one broadcast bus; UIs subscribe for sync
//! warnings, conflict notices, and device counts.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::clock::DeviceId;
use crate::operation::{ConflictKey, OpId};
use crate::queue::Priority;
use crate::time::Timestamp;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SyncEvent {
    /// A local operation was applied optimistically
    OperationApplied { op_id: OpId, target_field: String },
    /// A remote operation won resolution and was applied
    RemoteApplied { op_id: OpId, origin_device: DeviceId },
    ConflictResolved {
        key: ConflictKey,
        winner: OpId,
        losers: Vec<OpId>,
        concurrent: bool,
    },
    /// Causally superseded on arrival; expected, informational
    StaleDropped { op_id: OpId },
    /// TTL ran out before acknowledgment
    Expired { op_id: OpId, attempts: u32 },
    /// Evicted by queue pressure
    Dropped { op_id: OpId, priority: Priority },
    Sent { op_id: OpId, priority: Priority, at: Timestamp },
    TransportFailed { op_id: OpId, attempts: u32, reason: String },
    LeaseDenied { resource_id: String, holder: DeviceId },
    DeviceSeen { device_id: DeviceId, known_devices: usize },
    Error { op_id: Option<OpId>, message: String },
}

/// Cloneable sender side of the event stream.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: SyncEvent) {
        // Nobody listening is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
