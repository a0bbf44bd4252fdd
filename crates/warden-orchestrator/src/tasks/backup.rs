//! Scheduled and one-shot backup task

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use warden_core::{
    BackupProgress, Operation, OperationKind, OperationStatus, Plan, Result, WardenError,
};
use warden_oplog::HookPhase;

use crate::handle::OrchestratorHandle;
use crate::task::{allocate_pending, Task, TaskState};
use crate::tasks::{ForgetTask, IndexSnapshotsTask, OneShot};

/// Progress updates are written to the oplog at most once per window; the
/// first entry and the final summary always pass.
const PROGRESS_DEBOUNCE: Duration = Duration::from_millis(250);

pub struct BackupTask {
    name: String,
    handle: OrchestratorHandle,
    plan: Plan,
    schedule: Option<cron::Schedule>,
    one_shot: Option<OneShot>,
    state: TaskState,
}

impl BackupTask {
    /// Recurring backup firing on the plan's cron expression.
    pub fn scheduled(handle: OrchestratorHandle, plan: Plan) -> Result<Self> {
        let schedule = parse_cron(&plan.cron).map_err(|e| {
            WardenError::Config(format!("plan {:?} schedule {:?}: {}", plan.id, plan.cron, e))
        })?;
        Ok(Self {
            name: format!("backup for plan {:?}", plan.id),
            handle,
            plan,
            schedule: Some(schedule),
            one_shot: None,
            state: TaskState::new(),
        })
    }

    /// Manually triggered backup firing once at `at`.
    pub fn one_shot(handle: OrchestratorHandle, plan: Plan, at: DateTime<Utc>) -> Self {
        Self {
            name: format!("onetime backup for plan {:?}", plan.id),
            handle,
            plan,
            schedule: None,
            one_shot: Some(OneShot::at(at)),
            state: TaskState::new(),
        }
    }

    async fn backup_inner(
        &self,
        cancel: &CancellationToken,
    ) -> Result<BackupProgress> {
        let repo = self.handle.get_repo(&self.plan.repo).await?;
        let oplog = self.handle.oplog();
        let limiter = ProgressLimiter::new(PROGRESS_DEBOUNCE);

        repo.backup(cancel, &self.plan, &|entry| {
            if !limiter.admit(Instant::now(), entry.is_summary()) {
                return;
            }
            self.state.update_progress(oplog, |op| {
                if let OperationKind::Backup { last_status } = &mut op.kind {
                    *last_status = Some(entry.clone());
                }
            });
        })
        .await
    }

    /// Enqueue the follow-up work a successful backup triggers: snapshot
    /// indexing for the plan and, when retention is declared, a forget pass.
    /// Both join the backup's flow.
    async fn schedule_followups(&self, flow_id: i64) {
        let now = Utc::now();
        let index = IndexSnapshotsTask::one_shot(
            self.handle.clone(),
            self.plan.repo.clone(),
            vec![self.plan.clone()],
            flow_id,
            now,
        );
        self.handle
            .schedule_task(
                OrchestratorHandle::one_shot_key(index.kind()),
                Arc::new(index),
            )
            .await;

        if self.plan.retention.as_ref().is_some_and(|r| !r.is_empty()) {
            let forget = ForgetTask::for_plan(self.handle.clone(), self.plan.clone(), flow_id, now);
            self.handle
                .schedule_task(
                    OrchestratorHandle::one_shot_key(forget.kind()),
                    Arc::new(forget),
                )
                .await;
        }
    }
}

#[async_trait]
impl Task for BackupTask {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn kind(&self) -> &'static str {
        "backup"
    }

    fn repo_id(&self) -> &str {
        &self.plan.repo
    }

    fn plan_id(&self) -> Option<&str> {
        Some(&self.plan.id)
    }

    async fn next(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let at = match (&self.schedule, &self.one_shot) {
            (Some(schedule), _) => schedule.after(&now).next()?,
            (None, Some(slot)) => slot.take()?,
            (None, None) => return None,
        };
        let op = Operation::new(
            &self.plan.repo,
            &self.plan.id,
            OperationKind::Backup { last_status: None },
        );
        allocate_pending(&self.state, self.handle.oplog(), &self.name, op, at)
    }

    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let oplog = self.handle.oplog();
        let Some(op) = self.state.begin_run(oplog, &cancel)? else {
            return Ok(());
        };
        let started = Instant::now();
        info!(plan = %self.plan.id, op = op.id, "starting backup");
        self.handle.notify_phase(HookPhase::SnapshotStart, op.id);

        match self.backup_inner(&cancel).await {
            Ok(summary) => {
                let snapshot_id = summary.snapshot_id.clone().unwrap_or_default();
                if snapshot_id.is_empty() {
                    warn!(op = op.id, "backup summary carried no snapshot id");
                }
                self.state.finish_run(oplog, OperationStatus::Success, |row| {
                    row.snapshot_id = snapshot_id.clone();
                    if let OperationKind::Backup { last_status } = &mut row.kind {
                        *last_status = Some(summary.clone());
                    }
                });
                info!(
                    plan = %self.plan.id,
                    op = op.id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "backup complete"
                );
                self.handle.notify_phase(HookPhase::SnapshotEnd, op.id);
                self.schedule_followups(op.flow_id).await;
                Ok(())
            }
            Err(WardenError::Cancelled) => {
                // A user cancel already committed the row; a shutdown cancel
                // reaches here with the row still claimed.
                self.state
                    .finish_run(oplog, OperationStatus::SystemCancelled, |_| {});
                Err(WardenError::Cancelled)
            }
            Err(e) => {
                self.handle.notify_phase(HookPhase::SnapshotError, op.id);
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

/// Parse a cron expression, accepting the common 5-field form by assuming
/// second zero.
pub(crate) fn parse_cron(expr: &str) -> std::result::Result<cron::Schedule, cron::error::Error> {
    let expr = expr.trim();
    if expr.split_whitespace().count() == 5 {
        cron::Schedule::from_str(&format!("0 {}", expr))
    } else {
        cron::Schedule::from_str(expr)
    }
}

/// Debounce gate for progress writes. The first entry and every summary are
/// always admitted; anything else within the window is suppressed.
pub(crate) struct ProgressLimiter {
    window: Duration,
    last: Mutex<Option<Instant>>,
}

impl ProgressLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last: Mutex::new(None),
        }
    }

    pub fn admit(&self, now: Instant, is_summary: bool) -> bool {
        if is_summary {
            return true;
        }
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        if last.is_some_and(|t| now.duration_since(t) <= self.window) {
            return false;
        }
        *last = Some(now);
        true
    }
}
