//! SyncCoordinator: the operation core wired to a host
//!
//! Local intents are checked against the lease table, stamped, applied
//! optimistically, queued, and dispatched at their priority. Remote
//! operations are merged into the local clock and reconciled against
//! everything already observed for the same `(target_field, entity)`.
//!
//! For each conflict key the coordinator keeps a bounded history of observed
//! operations and keeps the state equal to the winning history of that set:
//! the last-writer-wins winner on the causal frontier plus, beneath it, the
//! operations it was built on. Concurrent losers are rolled back. Because the
//! winning history depends only on the set of operations, replicas that saw
//! the same operations in any order converge.

pub mod dispatch;
pub mod host;
pub mod sim;

pub use dispatch::{DispatchConfig, DispatchTimer};
pub use host::{MemoryStateContainer, StateContainer, Transport, TransportError};
pub use sim::{SimNetwork, SimTransport};

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::clock::{DeviceId, VectorClock};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::events::{EventBus, SyncEvent};
use crate::lease::{CrossTabLeaseManager, LeaseStatus};
use crate::operation::{AppState, ConflictKey, OpId, OperationManager, SyncOperation};
use crate::queue::{EnqueueOutcome, FailureOutcome, OfflineQueue, Priority};
use crate::store::KeyValueStore;
use crate::time::{SharedWallClock, Timestamp};

/// Observed operations kept per conflict key before the oldest are retired
pub const KEY_HISTORY_LIMIT: usize = 64;

/// A UI intent to turn into an operation.
#[derive(Clone, Debug)]
pub struct LocalAction {
    pub kind: String,
    pub payload: Value,
    pub target_field: String,
    pub priority: Priority,
    pub lease: Option<LeaseRequest>,
}

/// Hold a resource for the duration of an action.
#[derive(Clone, Debug)]
pub struct LeaseRequest {
    pub resource_id: String,
    /// None uses the configured default
    pub duration: Option<Duration>,
}

impl LocalAction {
    pub fn new(kind: impl Into<String>, target_field: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            target_field: target_field.into(),
            priority: Priority::Normal,
            lease: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_lease(mut self, resource_id: impl Into<String>, duration: Option<Duration>) -> Self {
        self.lease = Some(LeaseRequest {
            resource_id: resource_id.into(),
            duration,
        });
        self
    }
}

/// What happened to a received operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemoteOutcome {
    /// Part of the winning history and reflected in state
    Applied,
    /// Lost conflict resolution
    Lost { winner: OpId },
    /// Older than the retained history for its key
    Stale,
    /// Already seen
    Duplicate,
    /// Our own operation coming back
    Echo,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub sent: Vec<OpId>,
    pub failed: Vec<OpId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub device_id: DeviceId,
    /// Devices seen so far, this one included
    pub known_devices: usize,
    /// Last successful send or receipt
    pub last_sync_at: Option<Timestamp>,
    /// Operations waiting for acknowledgment
    pub pending: usize,
    pub leases: LeaseStatus,
}

/// Observed operations for one conflict key.
#[derive(Default)]
struct KeyHistory {
    observed: Vec<SyncOperation>,
    /// Winning history currently reflected in state, oldest first
    applied: Vec<SyncOperation>,
    /// Clock of the newest retired operation; anything it dominates is stale
    floor: Option<VectorClock>,
}

impl KeyHistory {
    fn is_stale(&self, op: &SyncOperation) -> bool {
        self.floor
            .as_ref()
            .map(|floor| floor.dominates(&op.clock))
            .unwrap_or(false)
    }

    fn contains(&self, op_id: &OpId) -> bool {
        self.observed.iter().any(|o| &o.id == op_id)
    }

    fn is_applied(&self, op_id: &OpId) -> bool {
        self.applied.iter().any(|o| &o.id == op_id)
    }

    /// Stop tracking an applied operation; its effect stays in state.
    fn retire(&mut self, op: &SyncOperation) {
        self.observed.retain(|o| o.id != op.id);
        self.applied.retain(|o| o.id != op.id);
        self.floor = Some(match self.floor.take() {
            Some(floor) => floor.merge(&op.clock),
            None => op.clock.clone(),
        });
    }

    /// Retire applied operations that fell out of the rollback journal.
    fn retire_folded(&mut self, manager: &OperationManager) {
        let folded: Vec<SyncOperation> = self
            .applied
            .iter()
            .filter(|op| !manager.is_journaled(&op.id))
            .cloned()
            .collect();
        for op in &folded {
            self.retire(op);
        }
    }

    fn prune(&mut self, limit: usize) {
        while self.observed.len() > limit {
            // Forget losing candidates before retiring applied history
            let loser = self
                .observed
                .iter()
                .position(|o| !self.applied.iter().any(|a| a.id == o.id));
            if let Some(idx) = loser {
                self.observed.remove(idx);
            } else if let Some(oldest) = self.applied.first().cloned() {
                self.retire(&oldest);
            } else {
                break;
            }
        }
    }
}

/// Bounded set of recently seen operation ids.
struct SeenWindow {
    order: VecDeque<OpId>,
    ids: HashSet<OpId>,
    limit: usize,
}

impl SeenWindow {
    fn new(limit: usize) -> Self {
        Self {
            order: VecDeque::new(),
            ids: HashSet::new(),
            limit: limit.max(1),
        }
    }

    /// Returns false if the id was already present.
    fn insert(&mut self, id: OpId) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.limit {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
        true
    }
}

struct CoreState {
    manager: OperationManager,
    histories: HashMap<ConflictKey, KeyHistory>,
    seen: SeenWindow,
    known_devices: BTreeSet<DeviceId>,
    last_sync_at: Option<Timestamp>,
    /// Resource held on behalf of each pending local operation
    op_leases: HashMap<OpId, String>,
}

#[derive(Default)]
struct Reconciled {
    winner: Option<OpId>,
    /// Operations rolled back and not re-applied
    displaced: Vec<SyncOperation>,
    failures: Vec<(OpId, SyncError)>,
}

enum Placement {
    Applied,
    Lost { winner: OpId },
    Stale,
}

struct Integrated {
    placement: Placement,
    displaced: Vec<SyncOperation>,
    /// Set if the integrated operation itself could not be applied
    failure: Option<SyncError>,
}

enum Rebuild {
    Unchanged,
    Changed,
    /// Applying this operation failed; state holds the chain up to it
    Failed(OpId, SyncError),
}

/// Move the applied history of one key towards `chain`: apply only the new
/// suffix when the applied operations are a prefix of it, otherwise roll
/// everything back and replay the chain.
fn rebuild(
    manager: &mut OperationManager,
    history: &mut KeyHistory,
    chain: Vec<SyncOperation>,
    state: &mut AppState,
) -> Result<Rebuild> {
    let chain_ids: Vec<OpId> = chain.iter().map(|op| op.id).collect();
    let applied_ids: Vec<OpId> = history.applied.iter().map(|op| op.id).collect();

    let (rolled_back, to_apply) = if chain_ids.starts_with(&applied_ids) {
        (false, chain[applied_ids.len()..].to_vec())
    } else {
        log::debug!("Rolling back {} operation(s)", history.applied.len());
        *state = manager.rollback_operations(&history.applied, state)?;
        history.applied.clear();
        (true, chain)
    };
    if !rolled_back && to_apply.is_empty() {
        return Ok(Rebuild::Unchanged);
    }

    for op in to_apply {
        match manager.apply_and_record(&op, state) {
            Ok(next) => {
                *state = next;
                history.applied.push(op);
            }
            Err(e) => return Ok(Rebuild::Failed(op.id, e)),
        }
    }
    Ok(Rebuild::Changed)
}

struct Inner {
    device_id: DeviceId,
    config: SyncConfig,
    /// Device-wide store shared with the other contexts
    store: Arc<dyn KeyValueStore>,
    core: Mutex<CoreState>,
    queue: OfflineQueue,
    leases: CrossTabLeaseManager,
    container: Arc<dyn StateContainer>,
    transport: Arc<dyn Transport>,
    events: EventBus,
    wall_clock: SharedWallClock,
    dispatch: DispatchTimer,
    /// One flush at a time, so a dispatch window and housekeeping never
    /// drain and send the same entries twice
    flushing: tokio::sync::Mutex<()>,
}

pub struct SyncCoordinator {
    inner: Arc<Inner>,
    shutdown_tx: broadcast::Sender<()>,
    listening: AtomicBool,
}

impl SyncCoordinator {
    /// Wire a coordinator for the device that owns `manager`.
    ///
    /// Handlers must already be registered on `manager`. The store is the
    /// device-wide shared store holding the queue and the lease table.
    pub fn new(
        manager: OperationManager,
        store: Arc<dyn KeyValueStore>,
        container: Arc<dyn StateContainer>,
        transport: Arc<dyn Transport>,
        config: SyncConfig,
        wall_clock: SharedWallClock,
    ) -> Result<Self> {
        config.validate()?;

        let device_id = manager.device_id().clone();
        let manager = manager.with_journal_limit(config.journal_limit);
        let events = EventBus::default();

        let queue = OfflineQueue::new(
            Arc::clone(&store),
            config.queue.clone(),
            config.retry.clone(),
            Arc::clone(&wall_clock),
            events.clone(),
        );
        let leases = CrossTabLeaseManager::new(
            device_id.clone(),
            Arc::clone(&store),
            config.lease.clone(),
            Arc::clone(&wall_clock),
            events.clone(),
        );

        let mut known_devices = BTreeSet::new();
        known_devices.insert(device_id.clone());

        let core = CoreState {
            manager,
            histories: HashMap::new(),
            seen: SeenWindow::new(config.seen_limit),
            known_devices,
            last_sync_at: None,
            op_leases: HashMap::new(),
        };

        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            inner: Arc::new(Inner {
                device_id,
                dispatch: DispatchTimer::new(config.dispatch.clone()),
                config,
                store,
                core: Mutex::new(core),
                queue,
                leases,
                container,
                transport,
                events,
                wall_clock,
                flushing: tokio::sync::Mutex::new(()),
            }),
            shutdown_tx,
            listening: AtomicBool::new(false),
        })
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.inner.device_id
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.inner.queue
    }

    pub fn leases(&self) -> &CrossTabLeaseManager {
        &self.inner.leases
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// The local vector clock
    pub fn clock(&self) -> VectorClock {
        self.inner.lock_core().manager.clock().clone()
    }

    /// Turn a local intent into an applied, queued operation.
    ///
    /// Critical operations are sent before this returns; other tiers are
    /// left to the dispatch window. Fails with `LeaseDenied` when another
    /// context holds the requested resource, leaving state untouched.
    pub async fn perform(&self, action: LocalAction) -> Result<SyncOperation> {
        let priority = action.priority;
        let op = self.inner.perform_local(action)?;

        match priority {
            Priority::Critical => {
                self.inner.flush(&[Priority::Critical]).await?;
            }
            tier => self.schedule_dispatch(tier),
        }
        Ok(op)
    }

    /// Apply an operation received from the network.
    pub fn handle_remote_operation(&self, op: SyncOperation) -> Result<RemoteOutcome> {
        self.inner.handle_remote(op)
    }

    /// Roll back a local operation the remote source of truth refused and
    /// drop it from the queue. Returns false if the operation is unknown.
    pub fn reject_operation(&self, op_id: &OpId) -> Result<bool> {
        self.inner.reject(op_id, "rejected by remote")
    }

    /// Send every due entry in the given tiers, in that order.
    pub async fn flush(&self, tiers: &[Priority]) -> Result<FlushReport> {
        self.inner.flush(tiers).await
    }

    /// Send everything due, e.g. after reconnecting.
    pub async fn flush_all(&self) -> Result<FlushReport> {
        self.inner.flush(&Priority::ALL).await
    }

    pub fn status(&self) -> Result<SyncStatus> {
        let (known_devices, last_sync_at) = {
            let core = self.inner.lock_core();
            (core.known_devices.len(), core.last_sync_at)
        };
        Ok(SyncStatus {
            device_id: self.inner.device_id.clone(),
            known_devices,
            last_sync_at,
            pending: self.inner.queue.len()?,
            leases: self.inner.leases.get_status()?,
        })
    }

    fn schedule_dispatch(&self, priority: Priority) {
        let inner = Arc::clone(&self.inner);
        // A window also carries anything more urgent that is due
        let tiers: Vec<Priority> = Priority::ALL
            .iter()
            .copied()
            .filter(|p| *p <= priority)
            .collect();
        self.inner.dispatch.schedule(priority, move || async move {
            if let Err(e) = inner.flush(&tiers).await {
                log::warn!("Scheduled {} dispatch failed: {}", priority, e);
            }
        });
    }

    /// Start listening for remote operations and for queue writes by other
    /// contexts, and run periodic housekeeping (queue compaction and
    /// retries).
    pub fn start(&self) {
        if self.listening.swap(true, Ordering::SeqCst) {
            return;
        }

        let inner = Arc::clone(&self.inner);
        let mut rx = inner.transport.incoming();
        let mut watcher = inner.store.watch();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let period = inner.config.dispatch.background_delay().max(Duration::from_millis(100));

        tokio::spawn(async move {
            let mut housekeeping =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            let mut watching = true;
            loop {
                tokio::select! {
                    received = rx.recv() => match received {
                        Ok(op) => {
                            if let Err(e) = inner.handle_remote(op) {
                                if !e.is_benign() {
                                    log::warn!("Remote operation not applied: {}", e);
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Listener for {} lagged, {} operation(s) missed", inner.device_id, n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    changed = watcher.changed(), if watching => match changed {
                        // Another context sent or dropped queued operations
                        Some(change) if change.key == inner.config.queue.storage_key => {
                            inner.release_delivered_leases();
                        }
                        Some(_) => {}
                        None => watching = false,
                    },
                    _ = housekeeping.tick() => {
                        inner.housekeeping().await;
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
            log::debug!("Listener for {} stopped", inner.device_id);
        });
    }

    /// Stop the listener and abort pending dispatch windows.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        self.listening.store(false, Ordering::SeqCst);
        self.inner.dispatch.cancel_all();
    }
}

impl Drop for SyncCoordinator {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Inner {
    fn lock_core(&self) -> MutexGuard<'_, CoreState> {
        match self.core.lock() {
            Ok(core) => core,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn perform_local(&self, action: LocalAction) -> Result<SyncOperation> {
        let resource = match &action.lease {
            Some(request) => {
                let duration = request
                    .duration
                    .unwrap_or_else(|| self.config.lease.default_lease());
                self.leases
                    .acquire(&request.resource_id, &action.kind, duration)?;
                Some(request.resource_id.clone())
            }
            None => None,
        };

        match self.apply_local(&action, resource.clone()) {
            Ok(op) => Ok(op),
            Err(e) => {
                if let Some(resource) = &resource {
                    if let Err(release) = self.leases.complete_operation(resource) {
                        log::warn!("Could not release lease on '{}': {}", resource, release);
                    }
                }
                Err(e)
            }
        }
    }

    fn apply_local(&self, action: &LocalAction, resource: Option<String>) -> Result<SyncOperation> {
        let mut core = self.lock_core();
        let op = core.manager.create_operation(
            action.kind.clone(),
            action.payload.clone(),
            action.target_field.clone(),
        );
        core.seen.insert(op.id);

        let integrated = self.integrate(&mut core, &op)?;
        self.settle_displaced(&mut core, &integrated.displaced);
        if let Some(e) = integrated.failure {
            return Err(e);
        }

        match self.queue.enqueue(op.clone(), action.priority)? {
            EnqueueOutcome::Superseded { replaced } => {
                for id in &replaced {
                    if let Some(old) = core.op_leases.remove(id) {
                        if resource.as_ref() != Some(&old) {
                            self.release_lease(&old);
                        }
                    }
                }
            }
            EnqueueOutcome::Inserted => {}
        }
        if let Some(resource) = resource {
            core.op_leases.insert(op.id, resource);
        }

        self.events.publish(SyncEvent::OperationApplied {
            op_id: op.id,
            target_field: op.target_field.clone(),
        });
        Ok(op)
    }

    fn handle_remote(&self, op: SyncOperation) -> Result<RemoteOutcome> {
        if op.origin_device == self.device_id {
            return Ok(RemoteOutcome::Echo);
        }

        let mut core = self.lock_core();
        if !core.seen.insert(op.id) {
            log::debug!("Ignoring duplicate delivery of {}", op.id);
            return Ok(RemoteOutcome::Duplicate);
        }

        core.last_sync_at = Some(self.wall_clock.now_ms());
        if core.known_devices.insert(op.origin_device.clone()) {
            log::info!("{} saw new device {}", self.device_id, op.origin_device);
            self.events.publish(SyncEvent::DeviceSeen {
                device_id: op.origin_device.clone(),
                known_devices: core.known_devices.len(),
            });
        }
        core.manager.observe(&op);

        let integrated = self.integrate(&mut core, &op)?;
        self.settle_displaced(&mut core, &integrated.displaced);
        if let Some(e) = integrated.failure {
            self.events.publish(SyncEvent::Error {
                op_id: Some(op.id),
                message: e.to_string(),
            });
            return Err(e);
        }

        Ok(match integrated.placement {
            Placement::Applied => {
                self.events.publish(SyncEvent::RemoteApplied {
                    op_id: op.id,
                    origin_device: op.origin_device.clone(),
                });
                RemoteOutcome::Applied
            }
            Placement::Lost { winner } => RemoteOutcome::Lost { winner },
            Placement::Stale => {
                log::debug!("Dropping stale operation {}", op.id);
                self.events.publish(SyncEvent::StaleDropped { op_id: op.id });
                RemoteOutcome::Stale
            }
        })
    }

    /// Add `op` to its key's history and bring state in line with the new
    /// winning history.
    fn integrate(&self, core: &mut CoreState, op: &SyncOperation) -> Result<Integrated> {
        let key = op.conflict_key();
        {
            let history = core.histories.entry(key.clone()).or_default();
            if history.is_stale(op) {
                return Ok(Integrated {
                    placement: Placement::Stale,
                    displaced: Vec::new(),
                    failure: None,
                });
            }
            history.observed.push(op.clone());
        }

        let decision = core
            .histories
            .get(&key)
            .and_then(|h| core.manager.resolve(&h.observed));

        let reconciled = self.reconcile(core, &key)?;

        // A winner that failed to apply decided nothing
        let decision = decision.filter(|d| {
            d.was_concurrent() && !reconciled.failures.iter().any(|(id, _)| *id == d.winner.id)
        });
        if let Some(decision) = decision {
            if decision.winner.id == op.id || decision.overridden.contains(&op.id) {
                log::info!(
                    "Conflict on {:?}: {} wins over {} concurrent operation(s)",
                    key,
                    decision.winner.id,
                    decision.overridden.len()
                );
                self.events.publish(SyncEvent::ConflictResolved {
                    key: key.clone(),
                    winner: decision.winner.id,
                    losers: decision.overridden.clone(),
                    concurrent: true,
                });
            }
        }

        let mut failure = None;
        for (op_id, e) in reconciled.failures {
            if op_id == op.id {
                failure = Some(e);
            } else {
                self.events.publish(SyncEvent::Error {
                    op_id: Some(op_id),
                    message: e.to_string(),
                });
            }
        }

        let applied = core
            .histories
            .get(&key)
            .map(|h| h.is_applied(&op.id))
            .unwrap_or(false);
        let placement = match (applied, reconciled.winner) {
            (true, _) => Placement::Applied,
            (false, Some(winner)) => Placement::Lost { winner },
            (false, None) => Placement::Stale,
        };

        Ok(Integrated {
            placement,
            displaced: reconciled.displaced,
            failure,
        })
    }

    /// Recompute the winning history for `key` and patch the host state to
    /// match, rolling back operations that dropped out of it.
    ///
    /// An operation that fails to apply is dropped from the history and the
    /// winning history is recomputed without it, so whatever it displaced
    /// is restored. Only operations missing from the final chain are
    /// reported as displaced.
    fn reconcile(&self, core: &mut CoreState, key: &ConflictKey) -> Result<Reconciled> {
        let CoreState {
            manager, histories, ..
        } = core;
        let Some(history) = histories.get_mut(key) else {
            return Ok(Reconciled::default());
        };

        history.retire_folded(manager);
        let previous = history.applied.clone();

        let target = key.target_field.as_str();
        let mut state = AppState::new();
        let current = self.container.get_state(target);
        if !current.is_null() {
            state.insert(target.to_string(), current);
        }

        let mut changed = false;
        let mut failures = Vec::new();
        let winner = loop {
            let chain = manager.winning_history(&history.observed);
            let winner = chain.last().map(|op| op.id);
            match rebuild(manager, history, chain, &mut state)? {
                Rebuild::Unchanged => break winner,
                Rebuild::Changed => {
                    changed = true;
                    break winner;
                }
                Rebuild::Failed(op_id, e) => {
                    log::warn!("Operation {} not applied: {}", op_id, e);
                    changed = true;
                    history.observed.retain(|o| o.id != op_id);
                    failures.push((op_id, e));
                }
            }
        };

        if changed {
            self.container
                .apply_patch(target, state.remove(target).unwrap_or(Value::Null));
        }

        let displaced = previous
            .into_iter()
            .filter(|op| !history.is_applied(&op.id))
            .collect();
        history.prune(KEY_HISTORY_LIMIT);

        Ok(Reconciled {
            winner,
            displaced,
            failures,
        })
    }

    /// Local operations that lost are cancelled: no point sending them.
    fn settle_displaced(&self, core: &mut CoreState, displaced: &[SyncOperation]) {
        for op in displaced.iter().filter(|op| op.origin_device == self.device_id) {
            match self.queue.remove(&op.id) {
                Ok(Some(_)) => log::info!("Cancelled local operation {} after losing a conflict", op.id),
                Ok(None) => {}
                Err(e) => log::warn!("Could not dequeue {}: {}", op.id, e),
            }
            if let Some(resource) = core.op_leases.remove(&op.id) {
                self.release_lease(&resource);
            }
        }
    }

    /// Release leases of our operations that left the queue without passing
    /// through our own flush, e.g. delivered by another context.
    fn release_delivered_leases(&self) {
        let released: Vec<String> = {
            // Read under the core lock; perform enqueues while holding it
            let mut core = self.lock_core();
            let pending: HashSet<OpId> = match self.queue.entries() {
                Ok(entries) => entries.into_iter().map(|e| e.operation.id).collect(),
                Err(e) => {
                    log::warn!("Could not read queue: {}", e);
                    return;
                }
            };
            let gone: Vec<OpId> = core
                .op_leases
                .keys()
                .filter(|id| !pending.contains(id))
                .copied()
                .collect();
            gone.iter()
                .filter_map(|id| core.op_leases.remove(id))
                .collect()
        };
        for resource in released {
            self.release_lease(&resource);
        }
    }

    fn release_lease(&self, resource: &str) {
        if let Err(e) = self.leases.complete_operation(resource) {
            log::warn!("Could not release lease on '{}': {}", resource, e);
        }
    }

    fn reject(&self, op_id: &OpId, reason: &str) -> Result<bool> {
        let mut core = self.lock_core();
        let key = core
            .histories
            .iter()
            .find(|(_, h)| h.contains(op_id))
            .map(|(k, _)| k.clone());
        let Some(key) = key else {
            return Ok(false);
        };

        if let Some(history) = core.histories.get_mut(&key) {
            history.observed.retain(|o| &o.id != op_id);
        }
        let reconciled = self.reconcile(&mut core, &key)?;
        for (failed, e) in reconciled.failures {
            self.events.publish(SyncEvent::Error {
                op_id: Some(failed),
                message: e.to_string(),
            });
        }
        self.settle_displaced(&mut core, &reconciled.displaced);

        self.queue.remove(op_id)?;
        if let Some(resource) = core.op_leases.remove(op_id) {
            self.release_lease(&resource);
        }

        log::info!("Rolled back operation {}: {}", op_id, reason);
        self.events.publish(SyncEvent::Error {
            op_id: Some(*op_id),
            message: reason.to_string(),
        });
        Ok(true)
    }

    async fn flush(&self, tiers: &[Priority]) -> Result<FlushReport> {
        let _flushing = self.flushing.lock().await;
        let entries = self.queue.drain_entries(tiers)?;
        let mut report = FlushReport::default();

        for entry in entries {
            let op = &entry.operation;
            match self.transport.send(op, entry.priority).await {
                Ok(()) => {
                    self.queue.acknowledge(&op.id)?;
                    let now = self.wall_clock.now_ms();
                    let resource = {
                        let mut core = self.lock_core();
                        core.last_sync_at = Some(now);
                        core.op_leases.remove(&op.id)
                    };
                    if let Some(resource) = resource {
                        self.release_lease(&resource);
                    }
                    self.events.publish(SyncEvent::Sent {
                        op_id: op.id,
                        priority: entry.priority,
                        at: now,
                    });
                    report.sent.push(op.id);
                    // Queued by another context sharing the store; the relay
                    // never hands it back to us
                    if op.origin_device != self.device_id {
                        if let Err(e) = self.handle_remote(op.clone()) {
                            if !e.is_benign() {
                                log::warn!("Forwarded operation {} not applied: {}", op.id, e);
                            }
                        }
                    }
                }
                Err(TransportError::Rejected(reason)) => {
                    log::warn!("Operation {} rejected: {}", op.id, reason);
                    self.reject(&op.id, &format!("rejected by remote: {reason}"))?;
                    report.failed.push(op.id);
                }
                Err(e) => {
                    let outcome = self.queue.record_failure(&op.id)?;
                    log::warn!(
                        "Send of {} failed after {} attempt(s): {} ({:?})",
                        op.id,
                        entry.attempts + 1,
                        e,
                        outcome
                    );
                    self.events.publish(SyncEvent::TransportFailed {
                        op_id: op.id,
                        attempts: entry.attempts + 1,
                        reason: e.to_string(),
                    });
                    if outcome == FailureOutcome::Expired {
                        if let Some(resource) = self.lock_core().op_leases.remove(&op.id) {
                            self.release_lease(&resource);
                        }
                    }
                    report.failed.push(op.id);
                    if e == TransportError::Offline {
                        break;
                    }
                }
            }
        }

        Ok(report)
    }

    async fn housekeeping(&self) {
        if let Err(e) = self.queue.compact() {
            log::warn!("Queue compaction failed: {}", e);
        }
        self.release_delivered_leases();
        match self.queue.is_empty() {
            Ok(false) => {
                if let Err(e) = self.flush(&Priority::ALL).await {
                    log::warn!("Retry flush failed: {}", e);
                }
            }
            Ok(true) => {}
            Err(e) => log::warn!("Could not read queue: {}", e),
        }
    }
}
