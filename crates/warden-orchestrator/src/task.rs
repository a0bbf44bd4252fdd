//! The schedulable task contract
//!
//! Every workflow the orchestrator runs implements [`Task`]. The scheduler
//! asks `next(now)` for the following firing instant (allocating the PENDING
//! operation row as a side effect), runs the task with a cancellation token,
//! and calls `cancel` when the user or a shutdown wants the work stopped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use warden_core::{time_to_unix_ms, Operation, OperationStatus, Result, WardenError};
use warden_oplog::OpLog;

/// A schedulable unit of work.
///
/// Implementations use interior mutability for their operation reference and
/// cancel handle so the orchestrator can call `cancel` while `run` is in
/// flight on a worker.
#[async_trait]
pub trait Task: Send + Sync {
    /// Human-readable name for logs.
    fn name(&self) -> String;

    /// Stable kind tag, part of the task-set key.
    fn kind(&self) -> &'static str;

    /// The repo this task's work is serialized against.
    fn repo_id(&self) -> &str;

    /// The owning plan, when there is one.
    fn plan_id(&self) -> Option<&str> {
        None
    }

    /// Next firing instant strictly after `now`, or `None` to remove the
    /// task permanently. Allocates and inserts the PENDING operation row; a
    /// task holds at most one outstanding pending row, and calling `next`
    /// again before `run` replaces it.
    async fn next(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>>;

    /// Perform the work. Transitions the row to INPROGRESS on entry and to a
    /// terminal status on exit. Cancellation is observed through `cancel`.
    async fn run(&self, cancel: CancellationToken) -> Result<()>;

    /// Terminally mark the task's current operation. For a running task this
    /// also triggers the stored cancel handle. Safe to call repeatedly.
    async fn cancel(&self, status: OperationStatus) -> Result<()>;

    /// Id of the outstanding PENDING/INPROGRESS row, if any.
    fn current_op_id(&self) -> Option<i64>;
}

/// Shared per-task state: the outstanding operation row and the in-flight
/// cancel handle. Locks are held only across brief synchronous sections,
/// never across awaits.
#[derive(Default)]
pub struct TaskState {
    op: Mutex<Option<Operation>>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl TaskState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a freshly inserted pending row.
    pub fn set_pending(&self, op: Operation) {
        *self.op.lock().unwrap_or_else(|e| e.into_inner()) = Some(op);
    }

    /// The outstanding pending row, if any, for `next` to replace.
    pub fn pending_op(&self) -> Option<Operation> {
        self.op
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .filter(|op| op.status == OperationStatus::Pending)
    }

    pub fn current_op_id(&self) -> Option<i64> {
        self.op
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|op| op.id)
    }

    /// Claim the pending row at `run` entry: transition it to INPROGRESS and
    /// store the cancel handle. Returns `None` when the row was already
    /// terminally marked (cancelled before the task fired).
    pub fn begin_run(
        &self,
        oplog: &OpLog,
        token: &CancellationToken,
    ) -> Result<Option<Operation>> {
        let mut guard = self.op.lock().unwrap_or_else(|e| e.into_inner());
        let Some(op) = guard.as_mut() else {
            return Ok(None);
        };
        op.status = OperationStatus::InProgress;
        op.unix_time_start_ms = time_to_unix_ms(Utc::now());
        if op.flow_id == 0 {
            op.flow_id = op.id;
        }
        oplog.update(op)?;
        *self.cancel.lock().unwrap_or_else(|e| e.into_inner()) = Some(token.clone());
        Ok(Some(op.clone()))
    }

    /// Mutate the in-flight row (progress updates). Write errors are logged
    /// and swallowed; progress is best-effort. Returns false when the row is
    /// gone (concurrent cancel committed it).
    pub fn update_progress<F>(&self, oplog: &OpLog, mutate: F) -> bool
    where
        F: FnOnce(&mut Operation),
    {
        let mut guard = self.op.lock().unwrap_or_else(|e| e.into_inner());
        let Some(op) = guard.as_mut() else {
            return false;
        };
        mutate(op);
        if let Err(e) = oplog.update(op) {
            warn!(op = op.id, "failed to write progress update: {}", e);
        }
        true
    }

    /// Commit the terminal state at `run` exit and clear the cancel handle.
    /// No-op when a concurrent `cancel` already committed the row.
    pub fn finish_run<F>(&self, oplog: &OpLog, status: OperationStatus, mutate: F)
    where
        F: FnOnce(&mut Operation),
    {
        *self.cancel.lock().unwrap_or_else(|e| e.into_inner()) = None;
        let mut guard = self.op.lock().unwrap_or_else(|e| e.into_inner());
        let Some(mut op) = guard.take() else {
            return;
        };
        op.status = status;
        op.unix_time_end_ms = time_to_unix_ms(Utc::now()).max(op.unix_time_start_ms);
        mutate(&mut op);
        commit_terminal(oplog, &op);
    }

    /// Cancel path shared by every task: terminally mark the outstanding row
    /// (pending or running) and fire the stored cancel handle. Idempotent.
    pub fn cancel(&self, oplog: &OpLog, status: OperationStatus) -> Result<()> {
        if let Some(token) = self
            .cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            token.cancel();
        }
        let mut guard = self.op.lock().unwrap_or_else(|e| e.into_inner());
        let Some(mut op) = guard.take() else {
            return Ok(());
        };
        op.status = status;
        // A pending row can carry a future start; never end before it.
        op.unix_time_end_ms = time_to_unix_ms(Utc::now()).max(op.unix_time_start_ms);
        commit_terminal(oplog, &op);
        Ok(())
    }
}

/// Write a terminal transition, retrying transient failures with bounded
/// backoff. A terminal transition that cannot be committed would leave the
/// log claiming work is still running, so after the retries are exhausted
/// the process aborts.
pub(crate) fn commit_terminal(oplog: &OpLog, op: &Operation) {
    const ATTEMPTS: u32 = 4;
    let mut delay = Duration::from_millis(100);
    for attempt in 1..=ATTEMPTS {
        match oplog.update(op) {
            Ok(()) => return,
            Err(e) if e.is_retryable() && attempt < ATTEMPTS => {
                warn!(
                    op = op.id,
                    attempt, "transient failure committing terminal status: {}", e
                );
                std::thread::sleep(delay);
                delay *= 2;
            }
            Err(WardenError::NotFound(_)) => {
                // Row cleared out from under us; nothing left to commit.
                return;
            }
            Err(e) => {
                error!(op = op.id, "unable to commit terminal status: {}", e);
                panic!("operation log rejected terminal transition for op {}: {}", op.id, e);
            }
        }
    }
}

/// Insert (or replace) a task's pending row for the firing instant `at`.
///
/// Returns `None` when the log refuses the insert; the scheduler drops the
/// task in that case and logs the reason.
pub(crate) fn allocate_pending(
    state: &TaskState,
    oplog: &OpLog,
    name: &str,
    mut op: Operation,
    at: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    op.status = OperationStatus::Pending;
    op.unix_time_start_ms = time_to_unix_ms(at);

    let result = match state.pending_op() {
        Some(existing) => {
            op.id = existing.id;
            op.flow_id = existing.flow_id;
            oplog.update(&op)
        }
        None => oplog.add(&mut op),
    };
    match result {
        Ok(()) => {
            state.set_pending(op);
            Some(at)
        }
        Err(e) => {
            error!(task = name, "failed to allocate pending operation: {}", e);
            None
        }
    }
}

/// Arc alias used throughout the scheduler.
pub(crate) type TaskRef = Arc<dyn Task>;

#[cfg(test)]
mod tests {
    use super::*;
    use warden_core::OperationKind;

    fn open_log() -> (OpLog, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let log = OpLog::open(&dir.path().join("oplog.redb")).unwrap();
        (log, dir)
    }

    fn pending_backup(state: &TaskState, oplog: &OpLog) -> Operation {
        let op = Operation::new("r1", "p1", OperationKind::Backup { last_status: None });
        let at = Utc::now();
        allocate_pending(state, oplog, "test", op, at).unwrap();
        state.pending_op().unwrap()
    }

    #[test]
    fn test_allocate_pending_replaces_outstanding_row() {
        let (oplog, _dir) = open_log();
        let state = TaskState::new();

        let first = pending_backup(&state, &oplog);
        let second = pending_backup(&state, &oplog);

        // Same row, refreshed; no orphan pending rows pile up.
        assert_eq!(first.id, second.id);
        let mut count = 0;
        oplog.for_each(0, |_| {
            count += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_begin_finish_run_lifecycle() {
        let (oplog, _dir) = open_log();
        let state = TaskState::new();
        let op = pending_backup(&state, &oplog);

        let token = CancellationToken::new();
        let claimed = state.begin_run(&oplog, &token).unwrap().unwrap();
        assert_eq!(claimed.status, OperationStatus::InProgress);
        assert_eq!(claimed.flow_id, claimed.id);

        state.finish_run(&oplog, OperationStatus::Success, |_| {});
        let committed = oplog.get(op.id).unwrap();
        assert_eq!(committed.status, OperationStatus::Success);
        assert!(committed.unix_time_end_ms >= committed.unix_time_start_ms);
        assert!(state.current_op_id().is_none());
    }

    #[test]
    fn test_cancel_pending_marks_without_running() {
        let (oplog, _dir) = open_log();
        let state = TaskState::new();
        let op = pending_backup(&state, &oplog);

        state.cancel(&oplog, OperationStatus::UserCancelled).unwrap();
        assert_eq!(
            oplog.get(op.id).unwrap().status,
            OperationStatus::UserCancelled
        );

        // Idempotent, and a later run claims nothing.
        state.cancel(&oplog, OperationStatus::UserCancelled).unwrap();
        let token = CancellationToken::new();
        assert!(state.begin_run(&oplog, &token).unwrap().is_none());
    }

    #[test]
    fn test_cancel_running_fires_token_and_commits() {
        let (oplog, _dir) = open_log();
        let state = TaskState::new();
        let op = pending_backup(&state, &oplog);

        let token = CancellationToken::new();
        state.begin_run(&oplog, &token).unwrap().unwrap();
        state.cancel(&oplog, OperationStatus::UserCancelled).unwrap();

        assert!(token.is_cancelled());
        assert_eq!(
            oplog.get(op.id).unwrap().status,
            OperationStatus::UserCancelled
        );

        // The worker's own terminal commit is now a no-op.
        state.finish_run(&oplog, OperationStatus::Error, |_| {});
        assert_eq!(
            oplog.get(op.id).unwrap().status,
            OperationStatus::UserCancelled
        );
    }
}
