//! Advisory cross-context leases
//!
//! A lease marks a logical resource as busy for a bounded time so that two
//! tabs or devices sharing a store do not start the same action twice. The
//! lease table is a single record rewritten in one read-modify-write; the
//! check-then-write is still not atomic across contexts, so two contexts can
//! both be granted a lease inside a narrow window. This is a throttle against
//! accidental double submission, not mutual exclusion. Convergence never
//! depends on it.
//!
//! Expired leases are invisible to every reader, so a holder that never calls
//! `complete_operation` heals after its lease time.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::DeviceId;
use crate::error::SyncError;
use crate::events::{EventBus, SyncEvent};
use crate::store::{load_json, update_json, KeyValueStore};
use crate::time::{SharedWallClock, Timestamp};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub resource_id: String,
    pub operation_kind: String,
    pub holder_device: DeviceId,
    pub acquired_at: Timestamp,
    pub expires_at: Timestamp,
}

impl Lease {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }
}

type LeaseTable = BTreeMap<String, Lease>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    pub storage_key: String,
    pub default_lease_ms: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            storage_key: "opsync.leases".to_string(),
            default_lease_ms: 5_000,
        }
    }
}

impl LeaseConfig {
    pub fn default_lease(&self) -> Duration {
        Duration::from_millis(self.default_lease_ms)
    }
}

/// Diagnostic snapshot of the lease table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseStatus {
    pub device_id: DeviceId,
    /// Unexpired leases held by this device
    pub own_operations: Vec<Lease>,
    /// Unexpired leases held by anyone
    pub pending_count: usize,
}

pub struct CrossTabLeaseManager {
    device_id: DeviceId,
    store: Arc<dyn KeyValueStore>,
    config: LeaseConfig,
    wall_clock: SharedWallClock,
    events: EventBus,
}

impl CrossTabLeaseManager {
    pub fn new(
        device_id: DeviceId,
        store: Arc<dyn KeyValueStore>,
        config: LeaseConfig,
        wall_clock: SharedWallClock,
        events: EventBus,
    ) -> Self {
        Self {
            device_id,
            store,
            config,
            wall_clock,
            events,
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    /// Take or renew the lease on `resource_id`, returning the lease, or
    /// `LeaseDenied` naming the current holder.
    pub fn acquire(
        &self,
        resource_id: &str,
        operation_kind: &str,
        lease: Duration,
    ) -> Result<Lease, SyncError> {
        let now = self.wall_clock.now_ms();
        let device_id = self.device_id.clone();

        let result = update_json(
            self.store.as_ref(),
            &self.config.storage_key,
            |table: &mut LeaseTable| {
                table.retain(|_, l| !l.is_expired(now));

                if let Some(existing) = table.get(resource_id) {
                    if existing.holder_device != device_id {
                        return Err(existing.holder_device.clone());
                    }
                }

                let granted = Lease {
                    resource_id: resource_id.to_string(),
                    operation_kind: operation_kind.to_string(),
                    holder_device: device_id.clone(),
                    acquired_at: now,
                    expires_at: now.saturating_add(lease.as_millis() as u64),
                };
                table.insert(resource_id.to_string(), granted.clone());
                Ok(granted)
            },
        )?;

        result.map_err(|holder| {
            log::info!(
                "Lease on '{}' denied to {}: held by {}",
                resource_id,
                self.device_id,
                holder
            );
            self.events.publish(SyncEvent::LeaseDenied {
                resource_id: resource_id.to_string(),
                holder: holder.clone(),
            });
            SyncError::LeaseDenied {
                resource_id: resource_id.to_string(),
                holder,
            }
        })
    }

    /// True (and lease written) if no other device holds `resource_id`.
    pub fn should_allow_operation(
        &self,
        resource_id: &str,
        operation_kind: &str,
        lease_ms: u64,
    ) -> Result<bool, SyncError> {
        match self.acquire(resource_id, operation_kind, Duration::from_millis(lease_ms)) {
            Ok(_) => Ok(true),
            Err(SyncError::LeaseDenied { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Release the lease on `resource_id` if this device holds it.
    pub fn complete_operation(&self, resource_id: &str) -> Result<bool, SyncError> {
        let device_id = &self.device_id;
        // Nothing to release; do not rewrite the shared record
        let table: Option<LeaseTable> = load_json(self.store.as_ref(), &self.config.storage_key)?;
        let held = |table: &LeaseTable| {
            matches!(table.get(resource_id), Some(l) if &l.holder_device == device_id)
        };
        if !table.as_ref().map(held).unwrap_or(false) {
            return Ok(false);
        }

        Ok(update_json(
            self.store.as_ref(),
            &self.config.storage_key,
            |table: &mut LeaseTable| held(&*table) && table.remove(resource_id).is_some(),
        )?)
    }

    /// Unexpired lease on `resource_id`, whoever holds it.
    pub fn holder_of(&self, resource_id: &str) -> Result<Option<Lease>, SyncError> {
        let now = self.wall_clock.now_ms();
        Ok(self
            .live_leases()?
            .into_iter()
            .find(|l| l.resource_id == resource_id && !l.is_expired(now)))
    }

    fn live_leases(&self) -> Result<Vec<Lease>, SyncError> {
        let now = self.wall_clock.now_ms();
        let table: Option<LeaseTable> = load_json(self.store.as_ref(), &self.config.storage_key)?;
        Ok(table
            .unwrap_or_default()
            .into_values()
            .filter(|l| !l.is_expired(now))
            .collect())
    }

    pub fn get_status(&self) -> Result<LeaseStatus, SyncError> {
        let live = self.live_leases()?;
        let pending_count = live.len();
        let own_operations = live
            .into_iter()
            .filter(|l| l.holder_device == self.device_id)
            .collect();
        Ok(LeaseStatus {
            device_id: self.device_id.clone(),
            own_operations,
            pending_count,
        })
    }

    /// Drop every lease this device holds, e.g. when the context closes.
    pub fn release_all(&self) -> Result<usize, SyncError> {
        let device_id = &self.device_id;
        Ok(update_json(
            self.store.as_ref(),
            &self.config.storage_key,
            |table: &mut LeaseTable| {
                let before = table.len();
                table.retain(|_, l| &l.holder_device != device_id);
                before - table.len()
            },
        )?)
    }
}
