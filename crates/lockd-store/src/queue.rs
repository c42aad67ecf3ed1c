//! Durable bounded command queue with a terminal-state history ring.
//!
//! All state lives in one sealed record. Every mutation builds the next state,
//! persists it, and only then swaps it in, so a failed persist leaves the
//! in-memory view unchanged.

use lockd_types::{CommandStatus, EpochMs, OfflineCommand, ValidationError, WireCommand};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::{DynStore, RecordStore, StoreError, lock};

const QUEUE_KEY: &str = "command-queue";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    pub max_pending: usize,
    pub max_history: usize,
    pub max_seen_ids: usize,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            max_pending: 1000,
            max_history: 500,
            max_seen_ids: 2000,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("command '{0}' was already received")]
    Duplicate(String),
    #[error("command queue is full ({capacity} pending)")]
    Full { capacity: usize },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct QueueState {
    pending: Vec<OfflineCommand>,
    history: VecDeque<OfflineCommand>,
    seen: VecDeque<String>,
}

/// Result of one dequeue: the command to run (if any) plus ids that expired
/// on the way.
#[derive(Debug, Default)]
pub struct Dequeued {
    pub next: Option<OfflineCommand>,
    pub expired: Vec<OfflineCommand>,
}

pub struct CommandQueue {
    store: DynStore,
    limits: QueueLimits,
    state: Mutex<QueueState>,
}

impl std::fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("CommandQueue")
            .field("pending", &state.pending.len())
            .field("history", &state.history.len())
            .field("limits", &self.limits)
            .finish()
    }
}

impl CommandQueue {
    /// Load persisted state. Commands caught mid-dispatch by a crash go back
    /// to `PENDING`; handlers are idempotent so re-running them is safe.
    pub fn open(store: DynStore, limits: QueueLimits) -> Result<Self, StoreError> {
        let mut state: QueueState = store.get_record(QUEUE_KEY)?.unwrap_or_default();
        let mut reset = 0usize;
        for cmd in state.pending.iter_mut() {
            if cmd.status == CommandStatus::Executing {
                cmd.status = CommandStatus::Pending;
                reset += 1;
            }
        }
        if reset > 0 {
            log::warn!("{reset} command(s) interrupted mid-dispatch returned to pending");
            store.put_record(QUEUE_KEY, &state)?;
        }
        Ok(Self {
            store,
            limits,
            state: Mutex::new(state),
        })
    }

    fn commit<R>(
        &self,
        mutate: impl FnOnce(&mut QueueState) -> Result<R, QueueError>,
    ) -> Result<R, QueueError> {
        let mut guard = lock(&self.state);
        let mut next = guard.clone();
        let out = mutate(&mut next)?;
        self.store.put_record(QUEUE_KEY, &next)?;
        *guard = next;
        Ok(out)
    }

    /// Validate and enqueue a command from the wire.
    pub fn enqueue_wire(
        &self,
        wire: WireCommand,
        now_ms: EpochMs,
    ) -> Result<OfflineCommand, QueueError> {
        let cmd = OfflineCommand::from_wire(wire, now_ms)?;
        self.enqueue(cmd.clone())?;
        Ok(cmd)
    }

    pub fn enqueue(&self, mut cmd: OfflineCommand) -> Result<(), QueueError> {
        if cmd.id.trim().is_empty() {
            return Err(ValidationError::MissingField("id").into());
        }
        cmd.action()?;
        cmd.status = CommandStatus::Pending;
        let limits = self.limits;
        self.commit(|state| {
            let id = cmd.id.as_str();
            if state.seen.iter().any(|s| s == id)
                || state.pending.iter().any(|c| c.id == id)
                || state.history.iter().any(|c| c.id == id)
            {
                return Err(QueueError::Duplicate(cmd.id.clone()));
            }
            if state.pending.len() >= limits.max_pending {
                return Err(QueueError::Full {
                    capacity: limits.max_pending,
                });
            }
            state.seen.push_back(cmd.id.clone());
            while state.seen.len() > limits.max_seen_ids {
                state.seen.pop_front();
            }
            state.pending.push(cmd);
            Ok(())
        })?;
        Ok(())
    }

    /// Oldest pending, non-expired command, now marked `EXECUTING`. Expired
    /// commands met along the way move to history as `EXPIRED`.
    pub fn dequeue_next(&self, now_ms: EpochMs) -> Result<Dequeued, QueueError> {
        let limits = self.limits;
        let out = self.commit(|state| {
            let mut out = Dequeued::default();
            let mut idx = 0;
            while idx < state.pending.len() {
                let cmd = &state.pending[idx];
                if cmd.status != CommandStatus::Pending {
                    idx += 1;
                    continue;
                }
                if cmd.is_expired(now_ms) {
                    let mut expired = state.pending.remove(idx);
                    expired.status = CommandStatus::Expired;
                    expired.finished_at_ms = Some(now_ms);
                    expired.result = Some("expired before execution".into());
                    push_history(state, expired.clone(), limits.max_history);
                    out.expired.push(expired);
                    continue;
                }
                state.pending[idx].status = CommandStatus::Executing;
                out.next = Some(state.pending[idx].clone());
                break;
            }
            Ok(out)
        })?;
        for cmd in &out.expired {
            log::warn!("command {} ({}) expired in queue", cmd.id, cmd.kind);
        }
        Ok(out)
    }

    pub fn mark_executed(
        &self,
        id: &str,
        result: impl Into<String>,
        now_ms: EpochMs,
    ) -> Result<bool, QueueError> {
        self.finish(id, CommandStatus::Executed, result.into(), now_ms)
    }

    pub fn mark_failed(
        &self,
        id: &str,
        reason: impl Into<String>,
        now_ms: EpochMs,
    ) -> Result<bool, QueueError> {
        self.finish(id, CommandStatus::Failed, reason.into(), now_ms)
    }

    /// Cancel a command that has not started.
    pub fn cancel(&self, id: &str, now_ms: EpochMs) -> Result<bool, QueueError> {
        self.finish(id, CommandStatus::Cancelled, "cancelled".into(), now_ms)
    }

    /// Unknown ids are a no-op returning `false`.
    fn finish(
        &self,
        id: &str,
        status: CommandStatus,
        result: String,
        now_ms: EpochMs,
    ) -> Result<bool, QueueError> {
        // Cancellation never preempts a running command.
        let eligible = |c: &OfflineCommand| {
            c.id == id && (status != CommandStatus::Cancelled || c.status == CommandStatus::Pending)
        };
        if !lock(&self.state).pending.iter().any(eligible) {
            return Ok(false);
        }
        let limits = self.limits;
        self.commit(|state| {
            let Some(idx) = state.pending.iter().position(eligible) else {
                return Ok(false);
            };
            let mut cmd = state.pending.remove(idx);
            cmd.status = status;
            cmd.result = Some(result);
            cmd.finished_at_ms = Some(now_ms);
            push_history(state, cmd, limits.max_history);
            Ok(true)
        })
    }

    pub fn has_pending(&self) -> bool {
        lock(&self.state)
            .pending
            .iter()
            .any(|c| c.status == CommandStatus::Pending)
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.state).pending.len()
    }

    pub fn pending(&self) -> Vec<OfflineCommand> {
        lock(&self.state).pending.clone()
    }

    /// Terminal commands, oldest first.
    pub fn history(&self) -> Vec<OfflineCommand> {
        lock(&self.state).history.iter().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<OfflineCommand> {
        let state = lock(&self.state);
        state
            .pending
            .iter()
            .chain(state.history.iter())
            .find(|c| c.id == id)
            .cloned()
    }

    pub fn limits(&self) -> QueueLimits {
        self.limits
    }
}

fn push_history(state: &mut QueueState, cmd: OfflineCommand, max: usize) {
    state.history.push_back(cmd);
    while state.history.len() > max {
        state.history.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemStore;
    use std::sync::Arc;

    fn wire(id: &str) -> WireCommand {
        WireCommand {
            id: id.into(),
            kind: "REBOOT_DEVICE".into(),
            device_id: "dev".into(),
            signature: "AAAA".into(),
            ..Default::default()
        }
    }

    fn queue_with(limits: QueueLimits) -> (CommandQueue, MemStore) {
        let store = MemStore::new();
        let queue = CommandQueue::open(Arc::new(store.clone()), limits).expect("open");
        (queue, store)
    }

    #[test]
    fn dequeues_oldest_first() {
        let (queue, _) = queue_with(QueueLimits::default());
        queue.enqueue_wire(wire("a"), 1).expect("a");
        queue.enqueue_wire(wire("b"), 2).expect("b");
        let first = queue.dequeue_next(3).expect("dq").next.expect("cmd");
        assert_eq!(first.id, "a");
        assert_eq!(first.status, CommandStatus::Executing);
        let second = queue.dequeue_next(3).expect("dq").next.expect("cmd");
        assert_eq!(second.id, "b");
        assert!(queue.dequeue_next(3).expect("dq").next.is_none());
    }

    #[test]
    fn full_queue_rejects_without_eviction() {
        let limits = QueueLimits {
            max_pending: 2,
            ..QueueLimits::default()
        };
        let (queue, _) = queue_with(limits);
        queue.enqueue_wire(wire("a"), 0).expect("a");
        queue.enqueue_wire(wire("b"), 0).expect("b");
        assert!(matches!(
            queue.enqueue_wire(wire("c"), 0),
            Err(QueueError::Full { capacity: 2 })
        ));
        assert_eq!(queue.pending_count(), 2);
        assert!(queue.get("a").is_some());
    }

    #[test]
    fn malformed_commands_are_not_persisted() {
        let (queue, store) = queue_with(QueueLimits::default());
        let mut bad = wire("");
        assert!(matches!(queue.enqueue_wire(bad.clone(), 0), Err(QueueError::Validation(_))));
        bad.id = "x".into();
        bad.kind = "MELT".into();
        assert!(matches!(queue.enqueue_wire(bad, 0), Err(QueueError::Validation(_))));
        assert!(store.keys().is_empty());
    }

    #[test]
    fn replayed_ids_are_rejected() {
        let (queue, _) = queue_with(QueueLimits::default());
        queue.enqueue_wire(wire("a"), 0).expect("a");
        assert!(matches!(queue.enqueue_wire(wire("a"), 0), Err(QueueError::Duplicate(_))));
        let cmd = queue.dequeue_next(0).expect("dq").next.expect("cmd");
        queue.mark_executed(&cmd.id, "ok", 1).expect("mark");
        assert!(matches!(queue.enqueue_wire(wire("a"), 2), Err(QueueError::Duplicate(_))));
    }

    #[test]
    fn expired_commands_skip_straight_to_history() {
        let (queue, _) = queue_with(QueueLimits::default());
        let mut stale = wire("stale");
        stale.expires_at = 100;
        queue.enqueue_wire(stale, 0).expect("stale");
        queue.enqueue_wire(wire("fresh"), 0).expect("fresh");
        let out = queue.dequeue_next(100).expect("dq");
        assert_eq!(out.next.expect("cmd").id, "fresh");
        assert_eq!(out.expired.len(), 1);
        assert_eq!(queue.get("stale").expect("history").status, CommandStatus::Expired);
    }

    #[test]
    fn marking_unknown_ids_is_a_noop() {
        let (queue, _) = queue_with(QueueLimits::default());
        assert!(!queue.mark_executed("ghost", "ok", 0).expect("mark"));
        assert!(!queue.mark_failed("ghost", "err", 0).expect("mark"));
        assert!(!queue.cancel("ghost", 0).expect("cancel"));
    }

    #[test]
    fn history_is_a_bounded_ring() {
        let limits = QueueLimits {
            max_history: 2,
            ..QueueLimits::default()
        };
        let (queue, _) = queue_with(limits);
        for id in ["a", "b", "c"] {
            queue.enqueue_wire(wire(id), 0).expect("enqueue");
            let cmd = queue.dequeue_next(0).expect("dq").next.expect("cmd");
            queue.mark_failed(&cmd.id, "boom", 1).expect("mark");
        }
        let ids: Vec<String> = queue.history().into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn cancel_only_touches_pending() {
        let (queue, _) = queue_with(QueueLimits::default());
        queue.enqueue_wire(wire("a"), 0).expect("a");
        queue.enqueue_wire(wire("b"), 0).expect("b");
        let running = queue.dequeue_next(0).expect("dq").next.expect("cmd");
        assert!(!queue.cancel(&running.id, 1).expect("cancel running"));
        assert!(queue.cancel("b", 1).expect("cancel pending"));
        assert_eq!(queue.get("b").expect("b").status, CommandStatus::Cancelled);
    }

    #[test]
    fn executing_commands_resume_after_restart() {
        let store = MemStore::new();
        {
            let queue =
                CommandQueue::open(Arc::new(store.clone()), QueueLimits::default()).expect("open");
            queue.enqueue_wire(wire("a"), 0).expect("a");
            queue.dequeue_next(0).expect("dq").next.expect("cmd");
        }
        let queue = CommandQueue::open(Arc::new(store), QueueLimits::default()).expect("reopen");
        let cmd = queue.dequeue_next(1).expect("dq").next.expect("resumed");
        assert_eq!(cmd.id, "a");
    }
}
