//! Snapshot indexing task
//!
//! Lists the snapshots the backup engine knows for each plan and inserts a
//! SUCCESS-status IndexSnapshot row for every snapshot the log has not seen.
//! Unlike the other tasks it allocates no tracking row of its own; the
//! indexed snapshots are the rows. Re-running against a stable snapshot set
//! is a no-op.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use warden_core::{
    Operation, OperationKind, OperationStatus, Plan, Result, Snapshot, WardenError,
};
use warden_oplog::Query;

use crate::handle::OrchestratorHandle;
use crate::task::{Task, TaskState};
use crate::tasks::OneShot;

pub struct IndexSnapshotsTask {
    name: String,
    handle: OrchestratorHandle,
    repo_id: String,
    plans: Vec<Plan>,
    flow_id: i64,
    one_shot: OneShot,
    state: TaskState,
}

impl IndexSnapshotsTask {
    pub fn one_shot(
        handle: OrchestratorHandle,
        repo_id: String,
        plans: Vec<Plan>,
        flow_id: i64,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            name: format!("index snapshots for repo {:?}", repo_id),
            handle,
            repo_id,
            plans,
            flow_id,
            one_shot: OneShot::at(at),
            state: TaskState::new(),
        }
    }

    /// Rows for snapshots of `plan` that are not indexed yet.
    fn new_index_ops(&self, plan: &Plan, snapshots: &[Snapshot]) -> Result<Vec<Operation>> {
        let oplog = self.handle.oplog();
        let mut fresh = Vec::new();
        for snapshot in snapshots {
            let existing = oplog.get_by_snapshot(&snapshot.id, Query::all())?;
            let indexed = existing.iter().any(|op| {
                op.repo_id == self.repo_id
                    && matches!(op.kind, OperationKind::IndexSnapshot { .. })
                    && !matches!(
                        op.status,
                        OperationStatus::UserCancelled | OperationStatus::SystemCancelled
                    )
            });
            if indexed {
                continue;
            }
            let mut op = Operation::new(
                &self.repo_id,
                &plan.id,
                OperationKind::IndexSnapshot {
                    snapshot: snapshot.clone(),
                },
            );
            op.snapshot_id = snapshot.id.clone();
            op.flow_id = self.flow_id;
            op.status = OperationStatus::Success;
            op.unix_time_start_ms = snapshot.unix_time_ms;
            op.unix_time_end_ms = snapshot.unix_time_ms;
            fresh.push(op);
        }
        Ok(fresh)
    }
}

#[async_trait]
impl Task for IndexSnapshotsTask {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn kind(&self) -> &'static str {
        "index_snapshots"
    }

    fn repo_id(&self) -> &str {
        &self.repo_id
    }

    async fn next(&self, _now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.one_shot.take()
    }

    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let repo = self.handle.get_repo(&self.repo_id).await?;
        for plan in &self.plans {
            if cancel.is_cancelled() {
                return Err(WardenError::Cancelled);
            }
            let snapshots = repo.snapshots_for_plan(&cancel, plan).await?;
            let mut fresh = self.new_index_ops(plan, &snapshots)?;
            if fresh.is_empty() {
                continue;
            }
            let count = fresh.len();
            self.handle.oplog().bulk_add(&mut fresh)?;
            debug!(
                repo = %self.repo_id,
                plan = %plan.id,
                known = snapshots.len(),
                indexed = count,
                "indexed new snapshots"
            );
        }
        Ok(())
    }

    async fn cancel(&self, status: OperationStatus) -> Result<()> {
        self.state.cancel(self.handle.oplog(), status)
    }

    fn current_op_id(&self) -> Option<i64> {
        None
    }
}
