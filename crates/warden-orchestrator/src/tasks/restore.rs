//! Restore task: assemble files from a snapshot into a download target.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::info;

use warden_core::{Operation, OperationKind, OperationStatus, Result, WardenError};

use crate::handle::OrchestratorHandle;
use crate::task::{allocate_pending, Task, TaskState};
use crate::tasks::OneShot;

pub struct RestoreTask {
    name: String,
    handle: OrchestratorHandle,
    repo_id: String,
    plan_id: String,
    snapshot_id: String,
    path: String,
    /// Directory the downloadable archive is later assembled from.
    target: String,
    one_shot: OneShot,
    state: TaskState,
}

impl RestoreTask {
    #[allow(clippy::too_many_arguments)]
    pub fn one_shot(
        handle: OrchestratorHandle,
        repo_id: String,
        plan_id: String,
        snapshot_id: String,
        path: String,
        target: String,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            name: format!("restore {:?} from snapshot {:?}", path, snapshot_id),
            handle,
            repo_id,
            plan_id,
            snapshot_id,
            path,
            target,
            one_shot: OneShot::at(at),
            state: TaskState::new(),
        }
    }
}

#[async_trait]
impl Task for RestoreTask {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn kind(&self) -> &'static str {
        "restore"
    }

    fn repo_id(&self) -> &str {
        &self.repo_id
    }

    fn plan_id(&self) -> Option<&str> {
        if self.plan_id.is_empty() {
            None
        } else {
            Some(&self.plan_id)
        }
    }

    async fn next(&self, _now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let at = self.one_shot.take()?;
        let mut op = Operation::new(
            &self.repo_id,
            &self.plan_id,
            OperationKind::Restore {
                snapshot_id: self.snapshot_id.clone(),
                path: self.path.clone(),
                target: self.target.clone(),
            },
        );
        op.snapshot_id = self.snapshot_id.clone();
        allocate_pending(&self.state, self.handle.oplog(), &self.name, op, at)
    }

    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let oplog = self.handle.oplog();
        let Some(op) = self.state.begin_run(oplog, &cancel)? else {
            return Ok(());
        };

        let result = async {
            let repo = self.handle.get_repo(&self.repo_id).await?;
            repo.restore(&cancel, &self.snapshot_id, &self.path, &self.target)
                .await
        }
        .await;

        match result {
            Ok(()) => {
                info!(op = op.id, target = %self.target, "restore complete");
                self.state
                    .finish_run(oplog, OperationStatus::Success, |_| {});
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
