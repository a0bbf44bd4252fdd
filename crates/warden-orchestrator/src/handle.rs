//! Orchestrator capability handle
//!
//! Tasks never hold the orchestrator itself; they hold this handle, which
//! exposes exactly what a task may do: read and mutate the operation log,
//! resolve repo drivers, publish hook-phase events, and schedule follow-up
//! tasks. This keeps ownership acyclic between tasks and the scheduler.

use chrono::Utc;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::debug;

use warden_core::Result;
use warden_oplog::{Broker, HookPhase, LogStore, OpLog, OperationEvent};
use warden_restic::RepoDriver;

use crate::registry::RepoRegistry;
use crate::task::TaskRef;

/// One entry in the scheduler's priority queue. Ordered by firing time with
/// an insertion sequence number for FIFO tie-breaking.
pub(crate) struct ScheduledEntry {
    pub at: chrono::DateTime<Utc>,
    pub seq: u64,
    pub key: String,
    pub task: TaskRef,
}

impl PartialEq for ScheduledEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for ScheduledEntry {}

impl PartialOrd for ScheduledEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

/// State shared between the scheduler loop, the handle, and workers.
pub(crate) struct SchedulerShared {
    pub queue: Mutex<BinaryHeap<Reverse<ScheduledEntry>>>,
    /// Active tasks keyed `(plan, kind)`; one-shots get synthetic keys.
    pub tasks: Mutex<HashMap<String, TaskRef>>,
    /// op id -> the task that owns it, for cancellation routing.
    pub cancellations: Mutex<HashMap<i64, TaskRef>>,
    pub wake: Notify,
    pub seq: AtomicU64,
}

impl SchedulerShared {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(BinaryHeap::new()),
            tasks: Mutex::new(HashMap::new()),
            cancellations: Mutex::new(HashMap::new()),
            wake: Notify::new(),
            seq: AtomicU64::new(0),
        }
    }
}

/// Capability handle given to tasks and the service layer.
#[derive(Clone)]
pub struct OrchestratorHandle {
    pub(crate) oplog: Arc<OpLog>,
    pub(crate) broker: Broker,
    pub(crate) registry: Arc<RepoRegistry>,
    pub(crate) logs: Arc<LogStore>,
    pub(crate) shared: Arc<SchedulerShared>,
}

impl OrchestratorHandle {
    pub fn oplog(&self) -> &OpLog {
        &self.oplog
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub fn log_store(&self) -> &LogStore {
        &self.logs
    }

    pub async fn get_repo(&self, repo_id: &str) -> Result<Arc<dyn RepoDriver>> {
        self.registry.get(repo_id).await
    }

    /// Publish a hook-phase notification for an operation. An external hook
    /// runner subscribes to these.
    pub fn notify_phase(&self, phase: HookPhase, op_id: i64) {
        self.broker.publish(OperationEvent::Hook { phase, op_id });
    }

    /// Ask `task` for its next firing time and enqueue it. Tasks whose
    /// `next` returns `None` (or whose pending row cannot be allocated) are
    /// dropped. Returns the op id of the allocated pending row, if any.
    pub async fn schedule_task(&self, key: String, task: TaskRef) -> Option<i64> {
        {
            // A reload may have replaced this key; a finishing worker must
            // not resurrect the task it was running.
            let tasks = self.shared.tasks.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(existing) = tasks.get(&key) {
                if !Arc::ptr_eq(existing, &task) {
                    return None;
                }
            }
        }
        let now = Utc::now();
        let Some(at) = task.next(now).await else {
            self.shared
                .tasks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&key);
            return None;
        };
        debug!(task = %task.name(), at = %at, "scheduled");

        let op_id = task.current_op_id();
        if let Some(op_id) = op_id {
            self.shared
                .cancellations
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(op_id, task.clone());
        }
        self.shared
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.clone(), task.clone());
        let seq = self.shared.seq.fetch_add(1, Ordering::SeqCst);
        self.shared
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Reverse(ScheduledEntry { at, seq, key, task }));
        self.shared.wake.notify_one();
        op_id
    }

    /// Synthetic task-set key for a one-shot task.
    pub fn one_shot_key(kind: &str) -> String {
        format!("{}:{}", kind, uuid::Uuid::new_v4())
    }

    /// Task-set key for a plan-owned recurring task.
    pub fn plan_key(plan_id: &str, kind: &str) -> String {
        format!("{}:{}", plan_id, kind)
    }
}
