//! Forget task: apply retention to a plan, or drop one specific snapshot.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::info;

use warden_core::{
    Operation, OperationKind, OperationStatus, Plan, Result, RetentionPolicy, WardenError,
};

use crate::handle::OrchestratorHandle;
use crate::task::{allocate_pending, Task, TaskState};
use crate::tasks::OneShot;

enum ForgetTarget {
    /// Forget by the plan tag using its retention policy.
    Plan { plan: Plan, policy: RetentionPolicy },
    /// Forget one snapshot regardless of plan.
    Snapshot { repo_id: String, snapshot_id: String },
}

pub struct ForgetTask {
    name: String,
    handle: OrchestratorHandle,
    target: ForgetTarget,
    flow_id: i64,
    one_shot: OneShot,
    state: TaskState,
}

impl ForgetTask {
    /// Post-backup retention pass for `plan`, joining the backup's flow.
    pub fn for_plan(handle: OrchestratorHandle, plan: Plan, flow_id: i64, at: DateTime<Utc>) -> Self {
        let policy = plan.retention.clone().unwrap_or_default();
        Self {
            name: format!("forget for plan {:?}", plan.id),
            handle,
            target: ForgetTarget::Plan { plan, policy },
            flow_id,
            one_shot: OneShot::at(at),
            state: TaskState::new(),
        }
    }

    /// User-requested removal of a single snapshot.
    pub fn for_snapshot(
        handle: OrchestratorHandle,
        repo_id: String,
        snapshot_id: String,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            name: format!("forget snapshot {:?}", snapshot_id),
            handle,
            target: ForgetTarget::Snapshot {
                repo_id,
                snapshot_id,
            },
            flow_id: 0,
            one_shot: OneShot::at(at),
            state: TaskState::new(),
        }
    }
}

#[async_trait]
impl Task for ForgetTask {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn kind(&self) -> &'static str {
        "forget"
    }

    fn repo_id(&self) -> &str {
        match &self.target {
            ForgetTarget::Plan { plan, .. } => &plan.repo,
            ForgetTarget::Snapshot { repo_id, .. } => repo_id,
        }
    }

    fn plan_id(&self) -> Option<&str> {
        match &self.target {
            ForgetTarget::Plan { plan, .. } => Some(&plan.id),
            ForgetTarget::Snapshot { .. } => None,
        }
    }

    async fn next(&self, _now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let at = self.one_shot.take()?;
        let mut op = Operation::new(
            self.repo_id(),
            self.plan_id().unwrap_or_default(),
            OperationKind::Forget { forgotten: vec![] },
        );
        op.flow_id = self.flow_id;
        if let ForgetTarget::Snapshot { snapshot_id, .. } = &self.target {
            op.snapshot_id = snapshot_id.clone();
        }
        allocate_pending(&self.state, self.handle.oplog(), &self.name, op, at)
    }

    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let oplog = self.handle.oplog();
        let Some(op) = self.state.begin_run(oplog, &cancel)? else {
            return Ok(());
        };

        let result = async {
            let repo = self.handle.get_repo(self.repo_id()).await?;
            match &self.target {
                ForgetTarget::Plan { plan, policy } => {
                    repo.forget_plan(&cancel, plan, policy).await
                }
                ForgetTarget::Snapshot { snapshot_id, .. } => {
                    repo.forget_snapshot(&cancel, snapshot_id).await
                }
            }
        }
        .await;

        match result {
            Ok(forgotten) => {
                info!(op = op.id, count = forgotten.len(), "forget complete");
                self.state.finish_run(oplog, OperationStatus::Success, |row| {
                    row.kind = OperationKind::Forget {
                        forgotten: forgotten.clone(),
                    };
                });
                Ok(())
            }
            Err(WardenError::Cancelled) => {
                self.state
                    .finish_run(oplog, OperationStatus::SystemCancelled, |_| {});
                Err(WardenError::Cancelled)
            }
            Err(e) => {
                let message = e.to_string();
                self.state.finish_run(oplog, OperationStatus::Error, |row| {
                    row.error = message.clone();
                });
                Err(e)
            }
        }
    }

    async fn cancel(&self, status: OperationStatus) -> Result<()> {
        self.state.cancel(self.handle.oplog(), status)
    }

    fn current_op_id(&self) -> Option<i64> {
        self.state.current_op_id()
    }
}
