// opsync - Multi-device operation synchronization core

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod lease;
pub mod operation;
pub mod queue;
pub mod store;
pub mod time;

pub use clock::{new_device_id, ClockOrdering, DeviceId, VectorClock};
pub use config::SyncConfig;
pub use coordinator::{
    LocalAction, MemoryStateContainer, RemoteOutcome, SimNetwork, SimTransport, StateContainer,
    SyncCoordinator, SyncStatus, Transport, TransportError,
};
pub use error::{Result, SyncError};
pub use events::{EventBus, SyncEvent};
pub use lease::{CrossTabLeaseManager, Lease, LeaseStatus};
pub use operation::{
    AppState, ConflictKey, HandlerError, OpId, OperationHandler, OperationManager, Resolution,
    SyncOperation,
};
pub use queue::{OfflineQueue, Priority, QueueEntry, RetryPolicy};
pub use store::{FileStore, KeyValueStore, MemoryStore, SharedMemoryStore, StoreError};
pub use time::{ManualWallClock, SharedWallClock, SystemWallClock, WallClock};
