//! Durable offline queue of not-yet-acknowledged operations
//!
//! The whole queue is one JSON record in the shared store and every mutation
//! rewrites it in a single read-modify-write. Enqueuing a newer operation
//! for the same `(target_field, entity)` replaces the older entry, which is
//! the only cancellation primitive the system has. "Newer" is causal: the
//! replaced entry comes from the same context or happened before the new
//! operation. Contexts sharing the store can each have one concurrent entry
//! per key pending, and none of them is discarded.

mod priority;
mod retry;

pub use priority::Priority;
pub use retry::RetryPolicy;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::ClockOrdering;
use crate::error::SyncError;
use crate::events::{EventBus, SyncEvent};
use crate::operation::{ConflictKey, OpId, SyncOperation};
use crate::store::{load_json, update_json_reporting, KeyValueStore};
use crate::time::{SharedWallClock, Timestamp};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Key of the queue record in the shared store
    pub storage_key: String,
    /// Time-to-live of an entry from enqueue
    pub ttl_ms: u64,
    /// Entries beyond this are evicted, background tier first
    pub max_entries: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            storage_key: "opsync.queue".to_string(),
            ttl_ms: 86_400_000,
            max_entries: 500,
        }
    }
}

impl QueueConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub operation: SyncOperation,
    pub priority: Priority,
    pub enqueued_at: Timestamp,
    /// Failed send attempts so far
    pub attempts: u32,
    pub expires_at: Timestamp,
    /// Not handed out by `drain` before this time
    pub next_attempt_at: Timestamp,
    /// Insertion sequence, FIFO tie-break within one millisecond
    seq: u64,
}

impl QueueEntry {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }

    pub fn is_due(&self, now: Timestamp) -> bool {
        now >= self.next_attempt_at
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct QueueRecord {
    next_seq: u64,
    entries: Vec<QueueEntry>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Inserted,
    /// Older pending entries for the same key were replaced
    Superseded { replaced: Vec<OpId> },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailureOutcome {
    Retrying { next_attempt_at: Timestamp },
    /// Retries exhausted or TTL reached; the entry was discarded
    Expired,
    /// Not in the queue (already acknowledged, superseded, or expired)
    Unknown,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompactionReport {
    pub expired: Vec<OpId>,
    pub dropped: Vec<OpId>,
}

/// Entries removed while the record was open, published afterwards.
#[derive(Default)]
struct Removed {
    expired: Vec<QueueEntry>,
    dropped: Vec<QueueEntry>,
}

pub struct OfflineQueue {
    store: Arc<dyn KeyValueStore>,
    config: QueueConfig,
    retry: RetryPolicy,
    wall_clock: SharedWallClock,
    events: EventBus,
}

impl OfflineQueue {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        config: QueueConfig,
        retry: RetryPolicy,
        wall_clock: SharedWallClock,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            config,
            retry,
            wall_clock,
            events,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn update<R>(&self, f: impl FnOnce(&mut QueueRecord) -> R) -> Result<R, SyncError> {
        let (out, discarded) =
            update_json_reporting(self.store.as_ref(), &self.config.storage_key, f)?;
        if let Some(reason) = discarded {
            log::warn!("Queue record was unreadable; pending operations lost");
            self.events.publish(SyncEvent::Error {
                op_id: None,
                message: format!("offline queue discarded: {reason}"),
            });
        }
        Ok(out)
    }

    fn publish_removed(&self, removed: Removed) {
        for entry in removed.expired {
            log::warn!(
                "Operation {} on '{}' expired after {} attempt(s)",
                entry.operation.id,
                entry.operation.target_field,
                entry.attempts
            );
            self.events.publish(SyncEvent::Expired {
                op_id: entry.operation.id,
                attempts: entry.attempts,
            });
        }
        for entry in removed.dropped {
            log::warn!(
                "Dropped {} operation {} under queue pressure",
                entry.priority,
                entry.operation.id
            );
            self.events.publish(SyncEvent::Dropped {
                op_id: entry.operation.id,
                priority: entry.priority,
            });
        }
    }

    /// Insert an operation, replacing pending entries with the same key that
    /// came from the same context or that it causally follows.
    ///
    /// A replacing entry keeps the most urgent of the replaced priorities.
    pub fn enqueue(&self, op: SyncOperation, priority: Priority) -> Result<EnqueueOutcome, SyncError> {
        let now = self.wall_clock.now_ms();
        let ttl = self.config.ttl_ms;
        let max = self.config.max_entries;
        let key = op.conflict_key();

        let (outcome, removed) = self.update(|record| {
            let mut removed = Removed::default();
            let mut priority = priority;
            let mut outcome = EnqueueOutcome::Inserted;

            let (stale, kept): (Vec<QueueEntry>, Vec<QueueEntry>) =
                record.entries.drain(..).partition(|e| {
                    e.operation.conflict_key() == key && supersedes(&op, &e.operation)
                });
            record.entries = kept;
            if !stale.is_empty() {
                priority = stale.iter().map(|e| e.priority).fold(priority, Priority::min);
                outcome = EnqueueOutcome::Superseded {
                    replaced: stale.into_iter().map(|e| e.operation.id).collect(),
                };
            }

            let seq = record.next_seq;
            record.next_seq += 1;
            record.entries.push(QueueEntry {
                operation: op,
                priority,
                enqueued_at: now,
                attempts: 0,
                expires_at: now.saturating_add(ttl),
                next_attempt_at: now,
                seq,
            });

            removed.dropped = evict_over_capacity(record, max);
            (outcome, removed)
        })?;

        if let EnqueueOutcome::Superseded { replaced } = &outcome {
            log::debug!("Compacted {} pending operation(s) for {:?}", replaced.len(), key);
        }
        self.publish_removed(removed);
        Ok(outcome)
    }

    /// Live, due operations in the given tiers, ordered by tier position in
    /// `order` and then FIFO. Expired entries are removed and reported.
    /// Returned entries stay queued until acknowledged.
    pub fn drain(&self, order: &[Priority]) -> Result<Vec<SyncOperation>, SyncError> {
        Ok(self
            .drain_entries(order)?
            .into_iter()
            .map(|e| e.operation)
            .collect())
    }

    /// Like [`drain`](Self::drain) but keeps the queue metadata.
    pub fn drain_entries(&self, order: &[Priority]) -> Result<Vec<QueueEntry>, SyncError> {
        let now = self.wall_clock.now_ms();

        let (entries, removed) = self.update(|record| {
            let removed = Removed {
                expired: take_expired(record, now),
                dropped: Vec::new(),
            };

            let mut due: Vec<(usize, &QueueEntry)> = record
                .entries
                .iter()
                .filter(|e| e.is_due(now))
                .filter_map(|e| order.iter().position(|p| *p == e.priority).map(|i| (i, e)))
                .collect();
            due.sort_by_key(|(tier, e)| (*tier, e.enqueued_at, e.seq));

            let entries: Vec<QueueEntry> = due.into_iter().map(|(_, e)| e.clone()).collect();
            (entries, removed)
        })?;

        self.publish_removed(removed);
        Ok(entries)
    }

    pub fn drain_all(&self) -> Result<Vec<SyncOperation>, SyncError> {
        self.drain(&Priority::ALL)
    }

    /// Remove an entry once the transport confirmed delivery.
    pub fn acknowledge(&self, op_id: &OpId) -> Result<bool, SyncError> {
        Ok(self.remove(op_id)?.is_some())
    }

    /// Remove an entry without delivering it (superseded or rejected).
    pub fn remove(&self, op_id: &OpId) -> Result<Option<QueueEntry>, SyncError> {
        self.update(|record| {
            let idx = record.entries.iter().position(|e| &e.operation.id == op_id)?;
            Some(record.entries.remove(idx))
        })
    }

    /// Record a failed send and schedule the next attempt with backoff.
    pub fn record_failure(&self, op_id: &OpId) -> Result<FailureOutcome, SyncError> {
        let now = self.wall_clock.now_ms();
        let retry = self.retry.clone();

        let (outcome, removed) = self.update(|record| {
            let mut removed = Removed::default();
            let Some(idx) = record.entries.iter().position(|e| &e.operation.id == op_id) else {
                return (FailureOutcome::Unknown, removed);
            };

            let entry = &mut record.entries[idx];
            entry.attempts += 1;
            let next = retry
                .next_delay(entry.attempts)
                .map(|d| now.saturating_add(d.as_millis() as u64))
                .filter(|at| *at < entry.expires_at);

            match next {
                Some(at) => {
                    entry.next_attempt_at = at;
                    (FailureOutcome::Retrying { next_attempt_at: at }, removed)
                }
                None => {
                    removed.expired.push(record.entries.remove(idx));
                    (FailureOutcome::Expired, removed)
                }
            }
        })?;

        self.publish_removed(removed);
        Ok(outcome)
    }

    /// Housekeeping: drop expired entries and enforce the size limit.
    pub fn compact(&self) -> Result<CompactionReport, SyncError> {
        let now = self.wall_clock.now_ms();
        let max = self.config.max_entries;

        let removed = self.update(|record| Removed {
            expired: take_expired(record, now),
            dropped: evict_over_capacity(record, max),
        })?;

        let report = CompactionReport {
            expired: removed.expired.iter().map(|e| e.operation.id).collect(),
            dropped: removed.dropped.iter().map(|e| e.operation.id).collect(),
        };
        if !report.expired.is_empty() || !report.dropped.is_empty() {
            log::debug!(
                "Queue compaction: {} expired, {} dropped",
                report.expired.len(),
                report.dropped.len()
            );
        }
        self.publish_removed(removed);
        Ok(report)
    }

    /// Snapshot of all stored entries, including ones not yet due.
    pub fn entries(&self) -> Result<Vec<QueueEntry>, SyncError> {
        let record: Option<QueueRecord> = load_json(self.store.as_ref(), &self.config.storage_key)?;
        Ok(record.map(|r| r.entries).unwrap_or_default())
    }

    pub fn get(&self, op_id: &OpId) -> Result<Option<QueueEntry>, SyncError> {
        Ok(self.entries()?.into_iter().find(|e| &e.operation.id == op_id))
    }

    /// The pending operation for a conflict key, if any.
    pub fn pending_for(&self, key: &ConflictKey) -> Result<Option<SyncOperation>, SyncError> {
        Ok(self
            .entries()?
            .into_iter()
            .find(|e| &e.operation.conflict_key() == key)
            .map(|e| e.operation))
    }

    pub fn len(&self) -> Result<usize, SyncError> {
        Ok(self.entries()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, SyncError> {
        Ok(self.len()? == 0)
    }
}

/// True if `newer` may replace the queued `older` for the same key.
fn supersedes(newer: &SyncOperation, older: &SyncOperation) -> bool {
    newer.origin_device == older.origin_device
        || older.causal_order(newer) == ClockOrdering::Before
}

fn take_expired(record: &mut QueueRecord, now: Timestamp) -> Vec<QueueEntry> {
    let (expired, live): (Vec<_>, Vec<_>) = record
        .entries
        .drain(..)
        .partition(|e| e.is_expired(now));
    record.entries = live;
    expired
}

fn evict_over_capacity(record: &mut QueueRecord, max: usize) -> Vec<QueueEntry> {
    let mut dropped = Vec::new();
    while record.entries.len() > max {
        let victim = Priority::EVICTION_ORDER.iter().find_map(|tier| {
            record
                .entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.priority == *tier)
                .min_by_key(|(_, e)| (e.enqueued_at, e.seq))
                .map(|(i, _)| i)
        });
        match victim {
            Some(idx) => dropped.push(record.entries.remove(idx)),
            None => break,
        }
    }
    dropped
}
