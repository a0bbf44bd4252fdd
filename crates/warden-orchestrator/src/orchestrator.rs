//! The scheduler loop
//!
//! A min-heap of scheduled tasks drives the system: the loop sleeps until
//! the earliest firing time, pops everything due, and launches each task on
//! a worker after acquiring its repo's slot. Tasks on the same repo queue
//! behind that slot; tasks on different repos run in parallel. The wait is
//! interruptible by new task insertion, task completion, and shutdown.

use crate::task::Task;
use chrono::Utc;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use warden_core::{
    time_to_unix_ms, Config, OperationStatus, Plan, Result, WardenError,
};
use warden_oplog::{Broker, LogStore, OpLog};

use crate::handle::{OrchestratorHandle, ScheduledEntry, SchedulerShared};
use crate::registry::RepoRegistry;
use crate::task::TaskRef;
use crate::tasks::{BackupTask, IndexSnapshotsTask};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How long shutdown waits for running tasks before marking their
    /// operations cancelled directly.
    pub shutdown_grace: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

pub struct Orchestrator {
    handle: OrchestratorHandle,
    options: OrchestratorConfig,
    config: Mutex<Config>,
    repo_slots: Mutex<HashMap<String, Arc<Semaphore>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        oplog: Arc<OpLog>,
        logs: Arc<LogStore>,
        registry: Arc<RepoRegistry>,
        broker: Broker,
        options: OrchestratorConfig,
    ) -> Arc<Self> {
        let handle = OrchestratorHandle {
            oplog,
            broker,
            registry,
            logs,
            shared: Arc::new(SchedulerShared::new()),
        };
        Arc::new(Self {
            handle,
            options,
            config: Mutex::new(config),
            repo_slots: Mutex::new(HashMap::new()),
            workers: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn handle(&self) -> OrchestratorHandle {
        self.handle.clone()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Snapshot of the active configuration.
    pub fn config(&self) -> Config {
        self.config.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Seed the scheduler: sweep operations left over from a previous run,
    /// create a cron backup task per plan, and enqueue one snapshot indexing
    /// pass per repo.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.sweep_stale()?;

        let config = self.config();
        for plan in &config.plans {
            self.schedule_plan_backup(plan).await?;
        }
        for repo in &config.repos {
            let plans: Vec<Plan> = config
                .plans
                .iter()
                .filter(|p| p.repo == repo.id)
                .cloned()
                .collect();
            let task =
                IndexSnapshotsTask::one_shot(self.handle(), repo.id.clone(), plans, 0, Utc::now());
            self.handle
                .schedule_task(OrchestratorHandle::one_shot_key(task.kind()), Arc::new(task))
                .await;
        }
        info!(
            plans = config.plans.len(),
            repos = config.repos.len(),
            "orchestrator seeded"
        );
        Ok(())
    }

    /// Operations that were PENDING or INPROGRESS when the process died are
    /// unowned now; close them out as system-cancelled.
    fn sweep_stale(&self) -> Result<()> {
        let oplog = self.handle.oplog();
        let mut stale = Vec::new();
        oplog.for_each(0, |op| {
            if !op.status.is_terminal() {
                stale.push(op.clone());
            }
            Ok(())
        })?;
        let now_ms = time_to_unix_ms(Utc::now());
        for mut op in stale {
            warn!(op = op.id, "cancelling operation left over from a previous run");
            op.status = OperationStatus::SystemCancelled;
            op.unix_time_end_ms = now_ms.max(op.unix_time_start_ms);
            oplog.update(&op)?;
        }
        Ok(())
    }

    async fn schedule_plan_backup(self: &Arc<Self>, plan: &Plan) -> Result<()> {
        let task = BackupTask::scheduled(self.handle(), plan.clone())?;
        let key = OrchestratorHandle::plan_key(&plan.id, "backup");
        self.handle.schedule_task(key, Arc::new(task)).await;
        Ok(())
    }

    /// Run the scheduler until shutdown, then drain workers.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            let now = Utc::now();
            let due = self.pop_due(now);
            let mut deferred = Vec::new();
            for entry in due {
                if !self.entry_is_current(&entry) {
                    debug!(task = %entry.task.name(), "dropping superseded task");
                    continue;
                }
                let slot = self.slot(entry.task.repo_id());
                match slot.try_acquire_owned() {
                    Ok(permit) => self.spawn_worker(entry, permit),
                    // Slot held: requeue at the original time; retried when
                    // the holder finishes and signals the wake.
                    Err(_) => deferred.push(entry),
                }
            }
            if !deferred.is_empty() {
                let mut queue = self
                    .handle
                    .shared
                    .queue
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                for entry in deferred {
                    queue.push(Reverse(entry));
                }
            }

            let next_at = {
                let queue = self
                    .handle
                    .shared
                    .queue
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                queue.peek().map(|Reverse(e)| e.at)
            };
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.handle.shared.wake.notified() => {}
                _ = sleep_until(next_at, now) => {}
            }
        }
        self.drain_shutdown().await;
        Ok(())
    }

    fn pop_due(&self, now: chrono::DateTime<Utc>) -> Vec<ScheduledEntry> {
        let mut queue = self
            .handle
            .shared
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let mut due = Vec::new();
        while queue.peek().is_some_and(|Reverse(e)| e.at <= now) {
            if let Some(Reverse(entry)) = queue.pop() {
                due.push(entry);
            }
        }
        due
    }

    /// A queue entry is live only while the task set still holds the same
    /// task under its key; config reloads replace or remove entries there.
    fn entry_is_current(&self, entry: &ScheduledEntry) -> bool {
        self.handle
            .shared
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&entry.key)
            .is_some_and(|t| Arc::ptr_eq(t, &entry.task))
    }

    fn spawn_worker(self: &Arc<Self>, entry: ScheduledEntry, permit: OwnedSemaphorePermit) {
        let orchestrator = self.clone();
        let worker = tokio::spawn(async move {
            let token = orchestrator.shutdown.child_token();
            let ScheduledEntry { key, task, .. } = entry;
            let op_id = task.current_op_id();

            if let Err(e) = task.run(token).await {
                warn!(task = %task.name(), "task failed: {}", e);
            }

            if let Some(op_id) = op_id {
                orchestrator
                    .handle
                    .shared
                    .cancellations
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&op_id);
            }
            drop(permit);
            orchestrator.handle.schedule_task(key, task).await;
            orchestrator.handle.shared.wake.notify_one();
        });
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        workers.retain(|w| !w.is_finished());
        workers.push(worker);
    }

    /// Cancel an operation by id. A pending row is terminally marked without
    /// running; a running task also has its cancel handle fired. Returns
    /// without waiting for the subprocess to die.
    pub async fn cancel(&self, op_id: i64, status: OperationStatus) -> Result<()> {
        let task = self
            .handle
            .shared
            .cancellations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&op_id);
        match task {
            Some(task) => {
                info!(op = op_id, %status, "cancelling operation");
                task.cancel(status).await
            }
            None => {
                // Not owned by any live task (e.g. already finished).
                let op = self.handle.oplog().get(op_id)?;
                if op.status.is_terminal() {
                    return Ok(());
                }
                let mut op = op;
                op.status = status;
                op.unix_time_end_ms =
                    time_to_unix_ms(Utc::now()).max(op.unix_time_start_ms);
                self.handle.oplog().update(&op)
            }
        }
    }

    /// Atomically replace the configuration: tear down tasks for removed or
    /// mutated plans (cancelling running instances), schedule tasks for new
    /// ones, refresh the repo registry.
    pub async fn reload(self: &Arc<Self>, new_config: Config) -> Result<()> {
        new_config.validate()?;
        self.handle.registry.update(new_config.repos.clone()).await;

        let old_config = {
            let mut config = self.config.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *config, new_config.clone())
        };
        let old_plans: HashMap<&str, &Plan> =
            old_config.plans.iter().map(|p| (p.id.as_str(), p)).collect();
        let new_plans: HashMap<&str, &Plan> =
            new_config.plans.iter().map(|p| (p.id.as_str(), p)).collect();

        for (id, old_plan) in &old_plans {
            if new_plans.get(id).copied() == Some(*old_plan) {
                continue;
            }
            let key = OrchestratorHandle::plan_key(id, "backup");
            let removed = self
                .handle
                .shared
                .tasks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&key);
            if let Some(task) = removed {
                info!(plan = %id, "removing task for deleted or changed plan");
                if let Err(e) = task.cancel(OperationStatus::SystemCancelled).await {
                    warn!(plan = %id, "failed to cancel removed plan task: {}", e);
                }
            }
        }
        for (id, new_plan) in &new_plans {
            if old_plans.get(id).copied() != Some(*new_plan) {
                info!(plan = %id, "scheduling task for new or changed plan");
                self.schedule_plan_backup(new_plan).await?;
            }
        }
        self.handle.shared.wake.notify_one();
        Ok(())
    }

    /// Drop stale locks on a repo. Blocks on the repo slot so it never races
    /// a running operation.
    pub async fn unlock(&self, repo_id: &str) -> Result<()> {
        let slot = self.slot(repo_id);
        let _permit = slot
            .acquire()
            .await
            .map_err(|_| WardenError::Cancelled)?;
        let driver = self.handle.get_repo(repo_id).await?;
        driver.unlock().await
    }

    /// Request shutdown and wait for the loop to drain.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    async fn drain_shutdown(&self) {
        info!("shutting down, cancelling active operations");
        let tasks: Vec<TaskRef> = {
            let cancellations = self
                .handle
                .shared
                .cancellations
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            cancellations.values().cloned().collect()
        };
        // Running tasks observe their child tokens; waiting covers them.
        let workers: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()));
        let join_all = async {
            for worker in workers {
                let _ = worker.await;
            }
        };
        if tokio::time::timeout(self.options.shutdown_grace, join_all)
            .await
            .is_err()
        {
            warn!("shutdown grace window elapsed with tasks still running");
        }
        // Anything still non-terminal (pending rows, stuck workers) is
        // closed out directly.
        for task in tasks {
            if let Err(e) = task.cancel(OperationStatus::SystemCancelled).await {
                warn!(task = %task.name(), "failed to cancel during shutdown: {}", e);
            }
        }
    }

    fn slot(&self, repo_id: &str) -> Arc<Semaphore> {
        self.repo_slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(repo_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }
}

/// Sleep until `next`, or forever when nothing is scheduled or everything
/// due is blocked on a repo slot (the wake signal covers those).
async fn sleep_until(next: Option<chrono::DateTime<Utc>>, now: chrono::DateTime<Utc>) {
    match next {
        Some(at) if at > now => {
            let duration = (at - now).to_std().unwrap_or(Duration::ZERO);
            tokio::time::sleep(duration).await;
        }
        _ => std::future::pending().await,
    }
}
