//! Stats and check tasks: repo-scoped restic subcommands with parsed output.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use warden_core::{
    truncate_output, Operation, OperationKind, OperationStatus, Result, WardenError,
};
use warden_oplog::UI_LOG_LIMIT;

use crate::handle::OrchestratorHandle;
use crate::task::{allocate_pending, Task, TaskState};
use crate::tasks::OneShot;

pub struct StatsTask {
    name: String,
    handle: OrchestratorHandle,
    repo_id: String,
    one_shot: OneShot,
    state: TaskState,
}

impl StatsTask {
    pub fn one_shot(handle: OrchestratorHandle, repo_id: String, at: DateTime<Utc>) -> Self {
        Self {
            name: format!("stats for repo {:?}", repo_id),
            handle,
            repo_id,
            one_shot: OneShot::at(at),
            state: TaskState::new(),
        }
    }
}

#[async_trait]
impl Task for StatsTask {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn kind(&self) -> &'static str {
        "stats"
    }

    fn repo_id(&self) -> &str {
        &self.repo_id
    }

    async fn next(&self, _now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let at = self.one_shot.take()?;
        let op = Operation::new(&self.repo_id, "", OperationKind::Stats { stats: None });
        allocate_pending(&self.state, self.handle.oplog(), &self.name, op, at)
    }

    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let oplog = self.handle.oplog();
        let Some(op) = self.state.begin_run(oplog, &cancel)? else {
            return Ok(());
        };

        let result = async {
            let repo = self.handle.get_repo(&self.repo_id).await?;
            repo.stats().await
        }
        .await;

        match result {
            Ok(stats) => {
                info!(op = op.id, repo = %self.repo_id, "stats collected");
                self.state.finish_run(oplog, OperationStatus::Success, |row| {
                    row.kind = OperationKind::Stats {
                        stats: Some(stats.clone()),
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

pub struct CheckTask {
    name: String,
    handle: OrchestratorHandle,
    repo_id: String,
    one_shot: OneShot,
    state: TaskState,
}

impl CheckTask {
    pub fn one_shot(handle: OrchestratorHandle, repo_id: String, at: DateTime<Utc>) -> Self {
        Self {
            name: format!("check for repo {:?}", repo_id),
            handle,
            repo_id,
            one_shot: OneShot::at(at),
            state: TaskState::new(),
        }
    }
}

#[async_trait]
impl Task for CheckTask {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn kind(&self) -> &'static str {
        "check"
    }

    fn repo_id(&self) -> &str {
        &self.repo_id
    }

    async fn next(&self, _now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let at = self.one_shot.take()?;
        let op = Operation::new(
            &self.repo_id,
            "",
            OperationKind::Check {
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

        let collected = Mutex::new(String::new());
        let result = async {
            let repo = self.handle.get_repo(&self.repo_id).await?;
            repo.check(&cancel, &|line| {
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
            Ok(_) => {
                info!(op = op.id, repo = %self.repo_id, "check complete");
                self.state.finish_run(oplog, OperationStatus::Success, |row| {
                    row.kind = OperationKind::Check {
                        output: truncate_output(&output, UI_LOG_LIMIT),
                    };
                    row.log_ref = log_ref.clone().unwrap_or_default();
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
