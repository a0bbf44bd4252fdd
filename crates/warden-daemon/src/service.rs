//! Service-level control API
//!
//! Everything a transport needs to expose warden: config management,
//! operation queries, trigger endpoints (each enqueues a one-shot task and
//! returns immediately), cancellation, history cleanup, log retrieval, and
//! signed download paths.

use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use warden_core::{
    Config, Operation, OperationKind, OperationStatus, Repo, Result, Snapshot, WardenError,
};
use warden_oplog::{ClearHistoryFilter, EventStream, Query};
use warden_orchestrator::{
    BackupTask, CheckTask, DownloadSigner, ForgetTask, IndexSnapshotsTask, Orchestrator,
    OrchestratorHandle, PruneTask, RestoreTask, StatsTask, Task,
};

use crate::events::subscribe_with_catchup;

/// Filter for [`Service::get_operations`]. The most specific populated
/// dimension wins; `last_n` caps the result from the newest end.
#[derive(Debug, Clone, Default)]
pub struct OperationFilter {
    pub repo_id: Option<String>,
    pub plan_id: Option<String>,
    pub snapshot_id: Option<String>,
    pub flow_id: Option<i64>,
    pub ids: Vec<i64>,
    pub last_n: Option<usize>,
}

pub struct Service {
    orchestrator: Arc<Orchestrator>,
    handle: OrchestratorHandle,
    signer: DownloadSigner,
    config_path: PathBuf,
    /// Restore targets are assembled under here, one directory per op.
    restore_dir: PathBuf,
}

impl Service {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        signer: DownloadSigner,
        config_path: PathBuf,
        restore_dir: PathBuf,
    ) -> Self {
        let handle = orchestrator.handle();
        Self {
            orchestrator,
            handle,
            signer,
            config_path,
            restore_dir,
        }
    }

    // ----- config -----

    pub fn get_config(&self) -> Config {
        self.orchestrator.config()
    }

    /// Replace the configuration: validate, persist, and reload the
    /// scheduler. Returns the applied config.
    pub async fn set_config(&self, config: Config) -> Result<Config> {
        config.validate()?;
        config.save(&self.config_path)?;
        self.orchestrator.reload(config.clone()).await?;
        info!("configuration replaced");
        Ok(config)
    }

    pub async fn add_repo(&self, repo: Repo) -> Result<Config> {
        let mut config = self.get_config();
        if config.repo(&repo.id).is_some() {
            return Err(WardenError::InvalidArgument(format!(
                "repo {:?} already exists",
                repo.id
            )));
        }
        config.repos.push(repo);
        self.set_config(config).await
    }

    // ----- queries -----

    pub fn get_operations(&self, filter: &OperationFilter) -> Result<Vec<Operation>> {
        let oplog = self.handle.oplog();
        let mut ops = if !filter.ids.is_empty() {
            let mut ops = Vec::with_capacity(filter.ids.len());
            for id in &filter.ids {
                ops.push(oplog.get(*id)?);
            }
            ops
        } else if let Some(snapshot_id) = &filter.snapshot_id {
            oplog.get_by_snapshot(snapshot_id, Query::all())?
        } else if let Some(flow_id) = filter.flow_id {
            oplog.get_by_flow(flow_id, Query::all())?
        } else if let Some(plan_id) = &filter.plan_id {
            oplog.get_by_plan(plan_id, Query::all())?
        } else if let Some(repo_id) = &filter.repo_id {
            oplog.get_by_repo(repo_id, Query::all())?
        } else {
            let mut ops = Vec::new();
            oplog.for_each(0, |op| {
                ops.push(op.clone());
                Ok(())
            })?;
            ops
        };

        // Secondary dimensions filter the primary scan.
        if let Some(repo_id) = &filter.repo_id {
            ops.retain(|op| op.repo_id == *repo_id);
        }
        if let Some(plan_id) = &filter.plan_id {
            ops.retain(|op| op.plan_id == *plan_id);
        }
        if let Some(n) = filter.last_n {
            if ops.len() > n {
                ops.drain(..ops.len() - n);
            }
        }
        Ok(ops)
    }

    /// Live operation events with a catch-up prelude of committed history.
    pub fn get_operation_events(&self, since_id: i64) -> Result<(Vec<Operation>, EventStream)> {
        subscribe_with_catchup(self.handle.oplog(), self.handle.broker(), since_id)
    }

    pub async fn list_snapshots(&self, repo_id: &str, plan_id: &str) -> Result<Vec<Snapshot>> {
        let config = self.get_config();
        let driver = self.handle.get_repo(repo_id).await?;
        let cancel = tokio_cancel();

        let plans: Vec<_> = config
            .plans
            .iter()
            .filter(|p| p.repo == repo_id && (plan_id.is_empty() || p.id == plan_id))
            .cloned()
            .collect();
        if !plan_id.is_empty() && plans.is_empty() {
            return Err(WardenError::NotFound(format!("plan {}", plan_id)));
        }
        let mut snapshots = Vec::new();
        for plan in &plans {
            snapshots.extend(driver.snapshots_for_plan(&cancel, plan).await?);
        }
        snapshots.sort_by(|a, b| a.unix_time_ms.cmp(&b.unix_time_ms));
        Ok(snapshots)
    }

    pub async fn list_snapshot_files(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        path: &str,
    ) -> Result<Vec<warden_core::FileEntry>> {
        let driver = self.handle.get_repo(repo_id).await?;
        driver.list_files(snapshot_id, path).await
    }

    // ----- triggers: enqueue a one-shot task, return its op id -----

    pub async fn backup(&self, plan_id: &str) -> Result<i64> {
        let plan = self.plan(plan_id)?;
        let task = BackupTask::one_shot(self.handle.clone(), plan, Utc::now());
        self.enqueue(task).await
    }

    pub async fn prune(&self, plan_id: &str) -> Result<i64> {
        let plan = self.plan(plan_id)?;
        let policy = plan.prune.clone().unwrap_or_default();
        let task = PruneTask::one_shot(self.handle.clone(), plan.repo, policy, Utc::now());
        self.enqueue(task).await
    }

    /// Forget a single snapshot when `snapshot_id` is given, otherwise run
    /// the plan's retention policy.
    pub async fn forget(&self, repo_id: &str, plan_id: &str, snapshot_id: &str) -> Result<i64> {
        let task = if snapshot_id.is_empty() {
            let plan = self.plan(plan_id)?;
            if !plan.retention.as_ref().is_some_and(|r| !r.is_empty()) {
                return Err(WardenError::InvalidArgument(format!(
                    "plan {:?} declares no retention policy",
                    plan_id
                )));
            }
            ForgetTask::for_plan(self.handle.clone(), plan, 0, Utc::now())
        } else {
            ForgetTask::for_snapshot(
                self.handle.clone(),
                repo_id.to_string(),
                snapshot_id.to_string(),
                Utc::now(),
            )
        };
        self.enqueue(task).await
    }

    pub async fn restore(
        &self,
        repo_id: &str,
        plan_id: &str,
        snapshot_id: &str,
        path: &str,
    ) -> Result<i64> {
        let target = self
            .restore_dir
            .join(format!("restore-{}", uuid::Uuid::new_v4()));
        let task = RestoreTask::one_shot(
            self.handle.clone(),
            repo_id.to_string(),
            plan_id.to_string(),
            snapshot_id.to_string(),
            path.to_string(),
            target.to_string_lossy().into_owned(),
            Utc::now(),
        );
        self.enqueue(task).await
    }

    pub async fn index_snapshots(&self, repo_id: &str) -> Result<()> {
        let config = self.get_config();
        if config.repo(repo_id).is_none() {
            return Err(WardenError::NotFound(format!("repo {}", repo_id)));
        }
        let plans: Vec<_> = config
            .plans
            .iter()
            .filter(|p| p.repo == repo_id)
            .cloned()
            .collect();
        let task = IndexSnapshotsTask::one_shot(
            self.handle.clone(),
            repo_id.to_string(),
            plans,
            0,
            Utc::now(),
        );
        self.handle
            .schedule_task(OrchestratorHandle::one_shot_key(task.kind()), Arc::new(task))
            .await;
        Ok(())
    }

    pub async fn stats(&self, repo_id: &str) -> Result<i64> {
        let task = StatsTask::one_shot(self.handle.clone(), repo_id.to_string(), Utc::now());
        self.enqueue(task).await
    }

    pub async fn check(&self, repo_id: &str) -> Result<i64> {
        let task = CheckTask::one_shot(self.handle.clone(), repo_id.to_string(), Utc::now());
        self.enqueue(task).await
    }

    /// Synchronous: blocks on the repo slot before dropping stale locks.
    pub async fn unlock(&self, repo_id: &str) -> Result<()> {
        self.orchestrator.unlock(repo_id).await
    }

    // ----- lifecycle -----

    pub async fn cancel(&self, op_id: i64) -> Result<()> {
        self.orchestrator
            .cancel(op_id, OperationStatus::UserCancelled)
            .await
    }

    pub fn clear_history(&self, filter: &ClearHistoryFilter) -> Result<Vec<i64>> {
        self.handle.oplog().delete(filter)
    }

    pub fn get_logs(&self, log_ref: &str) -> Result<Vec<u8>> {
        self.handle.log_store().get(log_ref)
    }

    // ----- signed downloads -----

    /// Signed path segment for a completed restore. Unknown ops and ops of
    /// any other kind are `NotFound`.
    pub fn get_download_url(&self, op_id: i64) -> Result<String> {
        self.restore_op(op_id)?;
        Ok(self.signer.sign(op_id))
    }

    /// Verify a download path and resolve it to the restore's target
    /// directory plus the requested subpath. Signature mismatch is
    /// `Unauthorized`; unknown op or non-restore kind is `NotFound`.
    pub fn verify_download_path(&self, path: &str) -> Result<(PathBuf, String)> {
        let (op_id, subpath) = self.signer.verify_path(path)?;
        let op = self.restore_op(op_id)?;
        let OperationKind::Restore { target, .. } = op.kind else {
            unreachable!("restore_op returned a non-restore operation");
        };
        Ok((PathBuf::from(target), subpath))
    }

    fn restore_op(&self, op_id: i64) -> Result<Operation> {
        let op = self
            .handle
            .oplog()
            .get(op_id)
            .map_err(|_| WardenError::NotFound(format!("restore operation {}", op_id)))?;
        if !matches!(op.kind, OperationKind::Restore { .. }) {
            return Err(WardenError::NotFound(format!(
                "operation {} is not a restore",
                op_id
            )));
        }
        Ok(op)
    }

    fn plan(&self, plan_id: &str) -> Result<warden_core::Plan> {
        self.get_config()
            .plan(plan_id)
            .cloned()
            .ok_or_else(|| WardenError::NotFound(format!("plan {}", plan_id)))
    }

    async fn enqueue<T: Task + 'static>(&self, task: T) -> Result<i64> {
        let key = OrchestratorHandle::one_shot_key(task.kind());
        self.handle
            .schedule_task(key, Arc::new(task))
            .await
            .ok_or_else(|| {
                WardenError::InvalidArgument("task produced no operation".to_string())
            })
    }
}

fn tokio_cancel() -> tokio_util::sync::CancellationToken {
    tokio_util::sync::CancellationToken::new()
}
