//! OperationManager: creates, applies, resolves, and rolls back operations
//!
//! Application is a pure function of `(operation, state)` dispatched through a
//! handler registry keyed by `(target_field, kind)`. Rollback replays a
//! per-target journal from its base snapshot while skipping the reverted
//! operations, so it works for every registered kind without per-kind
//! inverse functions.
//!
//! Conflict resolution is last-writer-wins restricted to the causal frontier:
//! operations causally before another candidate are superseded, and exactly
//! one of the remaining concurrent candidates wins by timestamp, then origin
//! device. Concurrent edits to different sub-fields of one entity therefore do
//! not both survive; this is a known limitation of whole-operation LWW.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use super::{ConflictKey, OpId, SyncOperation};
use crate::clock::{ClockOrdering, DeviceId, VectorClock};
use crate::error::{Result, SyncError};
use crate::time::SharedWallClock;

/// Application state: one JSON slice per target field.
pub type AppState = BTreeMap<String, Value>;

/// Default number of operations journaled per target field
pub const DEFAULT_JOURNAL_LIMIT: usize = 256;

/// A handler's refusal to apply an operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Applies one kind of operation to one target field's slice.
///
/// Handlers must be total over their input: they report failure through
/// `HandlerError` and never panic. Returning an error aborts only the
/// operation being applied.
pub trait OperationHandler: Send + Sync {
    fn apply(&self, op: &SyncOperation, slice: &Value) -> std::result::Result<Value, HandlerError>;
}

impl<F> OperationHandler for F
where
    F: Fn(&SyncOperation, &Value) -> std::result::Result<Value, HandlerError> + Send + Sync,
{
    fn apply(&self, op: &SyncOperation, slice: &Value) -> std::result::Result<Value, HandlerError> {
        self(op, slice)
    }
}

/// The outcome of resolving one conflict set.
#[derive(Clone, Debug, PartialEq)]
pub struct Resolution {
    pub winner: SyncOperation,
    /// Causally before another candidate
    pub superseded: Vec<OpId>,
    /// Concurrent with the winner but lost the tie-break
    pub overridden: Vec<OpId>,
}

impl Resolution {
    /// True if the decision had to break a tie between concurrent operations
    pub fn was_concurrent(&self) -> bool {
        !self.overridden.is_empty()
    }

    pub fn losers(&self) -> impl Iterator<Item = &OpId> {
        self.superseded.iter().chain(self.overridden.iter())
    }
}

/// Operations applied to one target since its base snapshot.
#[derive(Clone, Debug, Default)]
struct Journal {
    /// Slice before the first journaled operation (None if it was absent)
    base: Option<Value>,
    applied: Vec<SyncOperation>,
}

pub struct OperationManager {
    device_id: DeviceId,
    clock: VectorClock,
    wall_clock: SharedWallClock,
    handlers: HashMap<(String, String), Arc<dyn OperationHandler>>,
    journals: HashMap<String, Journal>,
    journal_limit: usize,
}

impl OperationManager {
    pub fn new(device_id: DeviceId, wall_clock: SharedWallClock) -> Self {
        Self {
            device_id,
            clock: VectorClock::new(),
            wall_clock,
            handlers: HashMap::new(),
            journals: HashMap::new(),
            journal_limit: DEFAULT_JOURNAL_LIMIT,
        }
    }

    pub fn with_journal_limit(mut self, limit: usize) -> Self {
        self.journal_limit = limit.max(1);
        self
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// The local vector clock
    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }

    /// Register the handler for `kind` on `target_field`, replacing any
    /// previous one.
    pub fn register_handler(
        &mut self,
        target_field: impl Into<String>,
        kind: impl Into<String>,
        handler: impl OperationHandler + 'static,
    ) {
        self.handlers
            .insert((target_field.into(), kind.into()), Arc::new(handler));
    }

    pub fn has_handler(&self, target_field: &str, kind: &str) -> bool {
        self.handlers
            .contains_key(&(target_field.to_string(), kind.to_string()))
    }

    fn handler_for(&self, op: &SyncOperation) -> Result<&Arc<dyn OperationHandler>> {
        self.handlers
            .get(&(op.target_field.clone(), op.kind.clone()))
            .ok_or_else(|| SyncError::NoHandler {
                target_field: op.target_field.clone(),
                kind: op.kind.clone(),
            })
    }

    /// Stamp a new local operation with the next clock value.
    pub fn create_operation(
        &mut self,
        kind: impl Into<String>,
        payload: Value,
        target_field: impl Into<String>,
    ) -> SyncOperation {
        self.clock.increment(&self.device_id);
        SyncOperation::new(
            kind,
            payload,
            target_field,
            self.device_id.clone(),
            self.wall_clock.now_ms(),
            self.clock.clone(),
        )
    }

    /// Merge a received operation's clock into the local clock.
    pub fn observe(&mut self, op: &SyncOperation) {
        self.clock.update(&op.clock);
    }

    /// Compute the state after `op` without touching `state`.
    pub fn apply_operation(&self, op: &SyncOperation, state: &AppState) -> Result<AppState> {
        let slice = state.get(&op.target_field).cloned().unwrap_or(Value::Null);
        let next_slice = self.apply_to_slice(op, &slice)?;
        let mut next = state.clone();
        next.insert(op.target_field.clone(), next_slice);
        Ok(next)
    }

    fn apply_to_slice(&self, op: &SyncOperation, slice: &Value) -> Result<Value> {
        let handler = self.handler_for(op)?;
        handler.apply(op, slice).map_err(|e| SyncError::Handler {
            op_id: op.id,
            reason: e.to_string(),
        })
    }

    /// Apply `op` and journal it so it can be rolled back later.
    pub fn apply_and_record(&mut self, op: &SyncOperation, state: &AppState) -> Result<AppState> {
        let next = self.apply_operation(op, state)?;

        let journal = self
            .journals
            .entry(op.target_field.clone())
            .or_insert_with(|| Journal {
                base: state.get(&op.target_field).cloned(),
                applied: Vec::new(),
            });
        journal.applied.push(op.clone());

        if journal.applied.len() > self.journal_limit {
            let oldest = journal.applied.remove(0);
            let base = journal.base.clone().unwrap_or(Value::Null);
            match self.apply_to_slice(&oldest, &base) {
                Ok(folded) => {
                    if let Some(journal) = self.journals.get_mut(&op.target_field) {
                        journal.base = Some(folded);
                    }
                }
                Err(e) => log::warn!("Dropping {} while folding journal: {}", oldest.id, e),
            }
        }

        Ok(next)
    }

    /// Number of operations currently journaled for a target field
    pub fn journal_len(&self, target_field: &str) -> usize {
        self.journals
            .get(target_field)
            .map(|j| j.applied.len())
            .unwrap_or(0)
    }

    /// True if the operation is still inside the rollback window
    pub fn is_journaled(&self, op_id: &OpId) -> bool {
        self.journals
            .values()
            .any(|j| j.applied.iter().any(|o| &o.id == op_id))
    }

    /// Revert previously applied operations by replaying each affected
    /// target's journal without them.
    ///
    /// Operations no longer in the journal are skipped with a warning; other
    /// journaled operations whose replay now fails are dropped.
    pub fn rollback_operations(
        &mut self,
        ops: &[SyncOperation],
        state: &AppState,
    ) -> Result<AppState> {
        let mut by_target: BTreeMap<&str, HashSet<OpId>> = BTreeMap::new();
        for op in ops {
            if self.is_journaled(&op.id) {
                by_target
                    .entry(op.target_field.as_str())
                    .or_default()
                    .insert(op.id);
            } else {
                log::warn!("Cannot roll back {}: not in journal", op.id);
            }
        }

        let mut next = state.clone();
        for (target, reverted) in by_target {
            let journal = match self.journals.get(target) {
                Some(j) => j.clone(),
                None => continue,
            };

            let mut slice = journal.base.clone();
            let mut kept = Vec::with_capacity(journal.applied.len());
            for op in journal.applied {
                if reverted.contains(&op.id) {
                    continue;
                }
                let current = slice.clone().unwrap_or(Value::Null);
                match self.apply_to_slice(&op, &current) {
                    Ok(v) => {
                        slice = Some(v);
                        kept.push(op);
                    }
                    Err(e) => log::warn!("Dropping {} during rollback replay: {}", op.id, e),
                }
            }

            match slice {
                Some(v) => {
                    next.insert(target.to_string(), v);
                }
                None => {
                    next.remove(target);
                }
            }
            if let Some(j) = self.journals.get_mut(target) {
                j.applied = kept;
            }
            log::debug!("Rolled back {} operation(s) on '{}'", reverted.len(), target);
        }

        Ok(next)
    }

    /// Decide one conflict set (operations sharing a conflict key).
    pub fn resolve(&self, ops: &[SyncOperation]) -> Option<Resolution> {
        resolve_set(ops)
    }

    /// Return the operations to apply, one winner per conflict key, ordered
    /// deterministically for application.
    pub fn resolve_conflicts(&self, ops: &[SyncOperation]) -> Vec<SyncOperation> {
        let mut groups: BTreeMap<ConflictKey, Vec<SyncOperation>> = BTreeMap::new();
        for op in ops {
            groups.entry(op.conflict_key()).or_default().push(op.clone());
        }

        let mut winners: Vec<SyncOperation> = groups
            .values()
            .filter_map(|group| resolve_set(group))
            .map(|r| r.winner)
            .collect();
        winners.sort_by(|a, b| {
            (a.timestamp, &a.origin_device, a.id).cmp(&(b.timestamp, &b.origin_device, b.id))
        });
        winners
    }

    /// The winner of a conflict set together with the winning history
    /// beneath it, oldest first.
    ///
    /// Each step keeps only the candidates causally before the current
    /// winner and resolves again, so concurrent losers are excluded at every
    /// level and the result is a causal chain. Every replica holding the same
    /// set computes the same chain.
    pub fn winning_history(&self, ops: &[SyncOperation]) -> Vec<SyncOperation> {
        let mut chain = Vec::new();
        let mut remaining = ops.to_vec();
        while let Some(resolution) = resolve_set(&remaining) {
            let winner = resolution.winner;
            remaining.retain(|op| op.causal_order(&winner) == ClockOrdering::Before);
            chain.push(winner);
        }
        chain.reverse();
        chain
    }
}

fn resolve_set(ops: &[SyncOperation]) -> Option<Resolution> {
    let mut seen = HashSet::new();
    let unique: Vec<&SyncOperation> = ops.iter().filter(|op| seen.insert(op.id)).collect();

    let (frontier, superseded): (Vec<&SyncOperation>, Vec<&SyncOperation>) =
        unique.iter().copied().partition(|a| {
            !unique
                .iter()
                .any(|b| a.causal_order(b) == ClockOrdering::Before)
        });

    let winner = frontier.iter().copied().reduce(|best, candidate| {
        if candidate.wins_over(best) {
            candidate
        } else {
            best
        }
    })?;

    let overridden = frontier
        .iter()
        .filter(|op| op.id != winner.id)
        .map(|op| op.id)
        .collect::<Vec<_>>();

    log::debug!(
        "Resolved {} candidate(s) for {:?}: winner {} ({} superseded, {} overridden)",
        unique.len(),
        winner.conflict_key(),
        winner.id,
        superseded.len(),
        overridden.len()
    );

    Some(Resolution {
        winner: winner.clone(),
        superseded: superseded.iter().map(|op| op.id).collect(),
        overridden,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::handlers::{register_entity_map_handlers, SET_FIELD, TOGGLE_FIELD};
    use crate::time::ManualWallClock;
    use serde_json::json;

    fn manager(device: &str, now: u64) -> OperationManager {
        let mut m = OperationManager::new(device.into(), Arc::new(ManualWallClock::new(now)));
        register_entity_map_handlers(&mut m, "tasks");
        m
    }

    fn op_with(device: &str, ts: u64, clock: VectorClock, title: &str) -> SyncOperation {
        SyncOperation::new(
            SET_FIELD,
            json!({"id": "t1", "field": "title", "value": title}),
            "tasks",
            device.into(),
            ts,
            clock,
        )
    }

    fn permutations(ops: &[SyncOperation]) -> Vec<Vec<SyncOperation>> {
        if ops.len() <= 1 {
            return vec![ops.to_vec()];
        }
        let mut out = Vec::new();
        for i in 0..ops.len() {
            let mut rest = ops.to_vec();
            let head = rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, head.clone());
                out.push(tail);
            }
        }
        out
    }

    #[test]
    fn test_create_operation_increments_clock() {
        let mut m = manager("A", 100);
        let first = m.create_operation(SET_FIELD, json!({"id": "t1"}), "tasks");
        let second = m.create_operation(SET_FIELD, json!({"id": "t1"}), "tasks");

        assert_eq!(first.clock.get("A"), 1);
        assert_eq!(second.clock.get("A"), 2);
        assert_eq!(second.causal_order(&first), ClockOrdering::After);
        assert_eq!(first.origin_device, "A");
        assert_eq!(first.timestamp, 100);
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn test_observe_merges_remote_clock() {
        let mut m = manager("A", 0);
        m.create_operation(SET_FIELD, json!({}), "tasks");
        let remote = op_with("B", 0, VectorClock::at("B", 4), "x");
        m.observe(&remote);
        let next = m.create_operation(SET_FIELD, json!({}), "tasks");
        assert_eq!(next.clock.get("A"), 2);
        assert_eq!(next.clock.get("B"), 4);
        assert_eq!(next.causal_order(&remote), ClockOrdering::After);
    }

    #[test]
    fn test_apply_is_pure() {
        let mut m = manager("A", 0);
        let op = m.create_operation(
            SET_FIELD,
            json!({"id": "t1", "field": "title", "value": "Milk"}),
            "tasks",
        );
        let state = AppState::new();
        let next = m.apply_operation(&op, &state).unwrap();

        assert!(state.is_empty());
        assert_eq!(next["tasks"], json!({"t1": {"title": "Milk"}}));
    }

    #[test]
    fn test_unknown_kind_is_no_handler() {
        let mut m = manager("A", 0);
        let op = m.create_operation("explode", json!({"id": "t1"}), "tasks");
        match m.apply_operation(&op, &AppState::new()) {
            Err(SyncError::NoHandler { target_field, kind }) => {
                assert_eq!(target_field, "tasks");
                assert_eq!(kind, "explode");
            }
            other => panic!("expected NoHandler, got {:?}", other),
        }
    }

    #[test]
    fn test_handler_error_leaves_state_untouched() {
        let mut m = manager("A", 0);
        let mut state = AppState::new();
        state.insert("tasks".into(), json!({"t1": {"done": false}}));
        let bad = m.create_operation(TOGGLE_FIELD, json!({"id": "t1", "value": 3}), "tasks");

        let err = m.apply_and_record(&bad, &state).unwrap_err();
        assert!(matches!(err, SyncError::Handler { .. }));
        assert_eq!(m.journal_len("tasks"), 0);
        assert_eq!(state["tasks"], json!({"t1": {"done": false}}));
    }

    #[test]
    fn test_closure_handler_registration() {
        let mut m = manager("A", 0);
        m.register_handler("counter", "add", |op: &SyncOperation, slice: &Value| -> std::result::Result<Value, HandlerError> {
            let by = op.payload.get("by").and_then(Value::as_i64).unwrap_or(1);
            Ok(json!(slice.as_i64().unwrap_or(0) + by))
        });
        let op = m.create_operation("add", json!({"by": 5}), "counter");
        let next = m.apply_operation(&op, &AppState::new()).unwrap();
        assert_eq!(next["counter"], json!(5));
    }

    #[test]
    fn test_rollback_replays_without_reverted_ops() {
        let mut m = manager("A", 0);
        let mut state = AppState::new();

        let a = m.create_operation(SET_FIELD, json!({"id": "t1", "field": "title", "value": "Milk"}), "tasks");
        let b = m.create_operation(TOGGLE_FIELD, json!({"id": "t1"}), "tasks");
        let c = m.create_operation(SET_FIELD, json!({"id": "t2", "field": "title", "value": "Eggs"}), "tasks");
        for op in [&a, &b, &c] {
            state = m.apply_and_record(op, &state).unwrap();
        }
        assert_eq!(state["tasks"]["t1"]["done"], json!(true));

        let rolled = m.rollback_operations(&[b.clone()], &state).unwrap();
        assert_eq!(
            rolled["tasks"],
            json!({"t1": {"title": "Milk"}, "t2": {"title": "Eggs"}})
        );
        assert_eq!(m.journal_len("tasks"), 2);
        assert!(!m.is_journaled(&b.id));
    }

    #[test]
    fn test_rollback_to_absent_slice_removes_target() {
        let mut m = manager("A", 0);
        let op = m.create_operation(SET_FIELD, json!({"id": "t1", "field": "x", "value": 1}), "tasks");
        let state = m.apply_and_record(&op, &AppState::new()).unwrap();
        let rolled = m.rollback_operations(&[op], &state).unwrap();
        assert!(rolled.get("tasks").is_none());
    }

    #[test]
    fn test_rollback_of_unknown_op_is_skipped() {
        let mut m = manager("A", 0);
        let mut state = AppState::new();
        state.insert("tasks".into(), json!({"t1": {}}));
        let stranger = op_with("B", 0, VectorClock::at("B", 1), "x");
        let rolled = m.rollback_operations(&[stranger], &state).unwrap();
        assert_eq!(rolled, state);
    }

    #[test]
    fn test_journal_limit_folds_into_base() {
        let mut m = manager("A", 0).with_journal_limit(2);
        let mut state = AppState::new();
        let ops: Vec<_> = (0..4)
            .map(|i| {
                m.create_operation(
                    SET_FIELD,
                    json!({"id": format!("t{i}"), "field": "n", "value": i}),
                    "tasks",
                )
            })
            .collect();
        for op in &ops {
            state = m.apply_and_record(op, &state).unwrap();
        }
        assert_eq!(m.journal_len("tasks"), 2);
        assert!(!m.is_journaled(&ops[0].id));

        // Rolling back the newest keeps the folded ones in place
        let rolled = m.rollback_operations(&[ops[3].clone()], &state).unwrap();
        assert_eq!(
            rolled["tasks"],
            json!({"t0": {"n": 0}, "t1": {"n": 1}, "t2": {"n": 2}})
        );
    }

    #[test]
    fn test_causally_before_is_superseded() {
        let m = manager("A", 0);
        let old = op_with("A", 50, VectorClock::at("A", 1), "old");
        // Newer op has seen `old`, even though its wall clock is behind
        let new = op_with("B", 10, VectorClock::at("A", 1).merge(&VectorClock::at("B", 1)), "new");

        let r = m.resolve(&[old.clone(), new.clone()]).unwrap();
        assert_eq!(r.winner.id, new.id);
        assert_eq!(r.superseded, vec![old.id]);
        assert!(!r.was_concurrent());
    }

    #[test]
    fn test_concurrent_picks_later_timestamp() {
        let m = manager("A", 0);
        let x = op_with("X", 100, VectorClock::at("X", 1), "x");
        let y = op_with("Y", 200, VectorClock::at("Y", 1), "y");
        let r = m.resolve(&[x.clone(), y.clone()]).unwrap();
        assert_eq!(r.winner.id, y.id);
        assert_eq!(r.overridden, vec![x.id]);
        assert!(r.was_concurrent());
    }

    #[test]
    fn test_concurrent_equal_timestamps_pick_lexically_first_device() {
        let m = manager("A", 0);
        let x = op_with("X", 100, VectorClock::at("X", 1), "x");
        let y = op_with("Y", 100, VectorClock::at("Y", 1), "y");
        assert_eq!(m.resolve(&[y.clone(), x.clone()]).unwrap().winner.id, x.id);
        assert_eq!(m.resolve(&[x.clone(), y]).unwrap().winner.id, x.id);
    }

    #[test]
    fn test_equal_clocks_fall_back_to_timestamp() {
        let m = manager("A", 0);
        let clock = VectorClock::at("X", 1);
        let a = op_with("X", 5, clock.clone(), "a");
        let b = op_with("X", 9, clock, "b");
        let r = m.resolve(&[a.clone(), b.clone()]).unwrap();
        assert_eq!(r.winner.id, b.id);
        assert_eq!(r.overridden, vec![a.id]);
    }

    #[test]
    fn test_duplicates_collapse() {
        let m = manager("A", 0);
        let x = op_with("X", 1, VectorClock::at("X", 1), "x");
        let r = m.resolve(&[x.clone(), x.clone()]).unwrap();
        assert_eq!(r.winner.id, x.id);
        assert!(r.losers().next().is_none());
        assert!(m.resolve(&[]).is_none());
    }

    #[test]
    fn test_resolve_conflicts_groups_by_entity() {
        let m = manager("A", 0);
        let t1_old = op_with("X", 1, VectorClock::at("X", 1), "old");
        let t1_new = op_with("X", 2, VectorClock::at("X", 2), "new");
        let t2 = SyncOperation::new(
            SET_FIELD,
            json!({"id": "t2", "field": "title", "value": "other"}),
            "tasks",
            "Y".into(),
            0,
            VectorClock::at("Y", 1),
        );

        let winners = m.resolve_conflicts(&[t1_old, t1_new.clone(), t2.clone()]);
        assert_eq!(winners.len(), 2);
        // Ordered by timestamp for application
        assert_eq!(winners[0].id, t2.id);
        assert_eq!(winners[1].id, t1_new.id);
    }

    #[test]
    fn test_convergence_across_arrival_orders() {
        let m = manager("A", 0);
        let base = VectorClock::at("A", 1);
        let ops = vec![
            op_with("A", 10, base.clone(), "a1"),
            op_with("B", 30, base.merge(&VectorClock::at("B", 1)), "b1"),
            op_with("C", 30, base.merge(&VectorClock::at("C", 1)), "c1"),
            op_with("D", 5, VectorClock::at("D", 1), "d1"),
        ];

        let mut results = Vec::new();
        for order in permutations(&ops) {
            let mut state = AppState::new();
            for op in m.resolve_conflicts(&order) {
                state = m.apply_operation(&op, &state).unwrap();
            }
            results.push(state);
        }

        let first = &results[0];
        assert!(results.iter().all(|s| s == first));
        // B and C tie on timestamp; B sorts first
        assert_eq!(first["tasks"]["t1"]["title"], json!("b1"));
    }

    #[test]
    fn test_winning_history_keeps_causal_predecessors() {
        let m = manager("A", 0);
        let a1 = op_with("A", 10, VectorClock::at("A", 1), "a1");
        let a2 = op_with("A", 20, VectorClock::at("A", 2), "a2");
        let a3 = op_with("A", 30, VectorClock::at("A", 3), "a3");

        let ids: Vec<OpId> = m
            .winning_history(&[a3.clone(), a1.clone(), a2.clone()])
            .iter()
            .map(|op| op.id)
            .collect();
        assert_eq!(ids, vec![a1.id, a2.id, a3.id]);
    }

    #[test]
    fn test_winning_history_excludes_concurrent_losers() {
        let m = manager("A", 0);
        let base = op_with("A", 10, VectorClock::at("A", 1), "base");
        let loser = op_with("B", 20, VectorClock::at("A", 1).merge(&VectorClock::at("B", 1)), "b");
        let winner = op_with("C", 30, VectorClock::at("A", 1).merge(&VectorClock::at("C", 1)), "c");
        // Concurrent with everything, oldest timestamp
        let late = op_with("D", 5, VectorClock::at("D", 1), "d");

        for order in permutations(&[base.clone(), loser.clone(), winner.clone(), late.clone()]) {
            let chain: Vec<OpId> = m.winning_history(&order).iter().map(|op| op.id).collect();
            assert_eq!(chain, vec![base.id, winner.id]);
        }
    }
}
