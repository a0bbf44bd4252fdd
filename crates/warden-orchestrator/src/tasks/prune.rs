//! Prune task: repo-scoped repack of unreferenced data.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use warden_core::{
    truncate_output, unix_ms_to_time, Operation, OperationKind, OperationStatus, PrunePolicy,
    Result, WardenError,
};
use warden_oplog::{HookPhase, Query, UI_LOG_LIMIT};

use crate::handle::OrchestratorHandle;
use crate::task::{allocate_pending, Task, TaskState};
use crate::tasks::OneShot;

pub struct PruneTask {
    name: String,
    handle: OrchestratorHandle,
    repo_id: String,
    policy: PrunePolicy,
    one_shot: OneShot,
    state: TaskState,
}

impl PruneTask {
    pub fn one_shot(
        handle: OrchestratorHandle,
        repo_id: String,
        policy: PrunePolicy,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            name: format!("prune for repo {:?}", repo_id),
            handle,
            repo_id,
            policy,
            one_shot: OneShot::at(at),
            state: TaskState::new(),
        }
    }

    /// When did the last successful prune of this repo finish?
    fn last_prune_end(&self) -> Result<Option<DateTime<Utc>>> {
        let recent = self
            .handle
            .oplog()
            .get_by_repo(&self.repo_id, Query::all().reversed())?;
        Ok(recent
            .iter()
            .find(|op| {
                matches!(op.kind, OperationKind::Prune { .. })
                    && op.status == OperationStatus::Success
            })
            .map(|op| unix_ms_to_time(op.unix_time_end_ms)))
    }
}

#[async_trait]
impl Task for PruneTask {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn kind(&self) -> &'static str {
        "prune"
    }

    fn repo_id(&self) -> &str {
        &self.repo_id
    }

    async fn next(&self, _now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let at = self.one_shot.take()?;
        let op = Operation::new(
            &self.repo_id,
            "",
            OperationKind::Prune {
                output: String::new(),
            },
        );
        allocate_pending(&self.state, self.handle.oplog(), &self.name, op, at)
    }

    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let oplog = self.handle.oplog();
        let Some(op) = self.state.begin_run(oplog, &cancel)? else {
            return Ok(());
        };

        if self.policy.max_frequency_days > 0 {
            let horizon = Utc::now() - Duration::days(i64::from(self.policy.max_frequency_days));
            if let Some(last) = self.last_prune_end()? {
                if last > horizon {
                    info!(repo = %self.repo_id, last = %last, "skipping prune, repo pruned recently");
                    self.state.finish_run(oplog, OperationStatus::Success, |row| {
                        row.kind = OperationKind::Prune {
                            output: format!("skipped: last successful prune at {}", last),
                        };
                    });
                    return Ok(());
                }
            }
        }

        self.handle.notify_phase(HookPhase::PruneStart, op.id);
        let collected = Mutex::new(String::new());
        let result = async {
            let repo = self.handle.get_repo(&self.repo_id).await?;
            repo.prune(&cancel, &self.policy, &|line| {
                let mut buffer = collected.lock().unwrap_or_else(|e| e.into_inner());
                buffer.push_str(line);
                buffer.push('\n');
            })
            .await
        }
        .await;

        let output = collected.into_inner().unwrap_or_else(|e| e.into_inner());
        let log_ref = self.handle.log_store().put(output.as_bytes()).ok();

        match result {
            Ok(()) => {
                self.state.finish_run(oplog, OperationStatus::Success, |row| {
                    row.kind = OperationKind::Prune {
                        output: truncate_output(&output, UI_LOG_LIMIT),
                    };
                    row.log_ref = log_ref.clone().unwrap_or_default();
                });
                self.handle.notify_phase(HookPhase::PruneEnd, op.id);
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
                    row.log_ref = log_ref.clone().unwrap_or_default();
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
