//! Embedded KV storage for the operation log.
//!
//! Layout:
//!   - `ops`: primary table, operation id -> JSON row
//!   - `idx_repo` / `idx_plan` / `idx_snapshot` / `idx_flow`: inverted lists
//!     keyed `(value, id)` enabling bounded range cursors
//!   - `running`: guard table keyed `(repo, plan)` enforcing at most one
//!     in-progress row per plan
//!   - `meta`: next id counter and index version stamp
//!
//! Every mutation runs inside a single write transaction under the commit
//! lock: validate, write primary, update indexes, buffer change events, and
//! after commit drain the buffer to subscribers in commit order. Indexes are
//! rebuilt from the primary table on open when the version stamp mismatches.

use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use warden_core::{Operation, OperationKind, OperationStatus, Result, WardenError};

const OPS: TableDefinition<u64, &[u8]> = TableDefinition::new("ops");
const IDX_REPO: TableDefinition<(&str, u64), ()> = TableDefinition::new("idx_repo");
const IDX_PLAN: TableDefinition<(&str, u64), ()> = TableDefinition::new("idx_plan");
const IDX_SNAPSHOT: TableDefinition<(&str, u64), ()> = TableDefinition::new("idx_snapshot");
const IDX_FLOW: TableDefinition<(u64, u64), ()> = TableDefinition::new("idx_flow");
const RUNNING: TableDefinition<(&str, &str), u64> = TableDefinition::new("running");
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

const META_NEXT_ID: &str = "next_id";
const META_INDEX_VERSION: &str = "index_version";

/// Bump when the index layout changes; mismatching stores are reindexed on open.
const INDEX_VERSION: u64 = 1;

/// Callback invoked synchronously under the commit lock with the (old, new)
/// row pair. Old is `None` on insert; new is `None` on delete. Callbacks must
/// not block.
pub type Subscriber = Box<dyn Fn(Option<&Operation>, Option<&Operation>) + Send + Sync>;

/// Handle returned by [`OpLog::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionHandle(u64);

/// Cursor, limit, and direction for bounded range scans.
#[derive(Debug, Clone, Copy, Default)]
pub struct Query {
    /// Exclusive cursor: only ids past this one are returned.
    pub last_id: Option<i64>,
    pub limit: Option<usize>,
    /// Descending id order when set.
    pub reverse: bool,
}

impl Query {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn reversed(mut self) -> Self {
        self.reverse = true;
        self
    }
}

/// Filters honored by [`OpLog::delete`].
#[derive(Debug, Clone, Default)]
pub struct ClearHistoryFilter {
    pub repo_id: Option<String>,
    pub plan_id: Option<String>,
    /// Only remove rows whose terminal status is a failure.
    pub only_failed: bool,
    /// Explicit id set; empty means no id restriction.
    pub ids: Vec<i64>,
}

impl ClearHistoryFilter {
    fn matches(&self, op: &Operation) -> bool {
        // In-flight rows are owned by live tasks and never cleared.
        if !op.status.is_terminal() {
            return false;
        }
        if self.only_failed
            && matches!(op.status, OperationStatus::Success | OperationStatus::Warning)
        {
            return false;
        }
        if let Some(repo) = &self.repo_id {
            if op.repo_id != *repo {
                return false;
            }
        }
        if let Some(plan) = &self.plan_id {
            if op.plan_id != *plan {
                return false;
            }
        }
        if !self.ids.is_empty() && !self.ids.contains(&op.id) {
            return false;
        }
        true
    }
}

/// Durable append-only journal of operations.
pub struct OpLog {
    db: Database,
    /// Serializes write transactions and the subscriber drain that follows
    /// each commit, so events reach subscribers in commit order.
    commit_lock: Mutex<()>,
    subscribers: RwLock<Vec<(u64, Subscriber)>>,
    next_subscriber: AtomicU64,
}

/// Buffered change pair: (old, new).
type Change = (Option<Operation>, Option<Operation>);

impl OpLog {
    /// Open (or create) the log at `path`, creating tables and rebuilding
    /// secondary indexes if the version stamp mismatches.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path).map_err(store_err)?;
        let log = Self {
            db,
            commit_lock: Mutex::new(()),
            subscribers: RwLock::new(Vec::new()),
            next_subscriber: AtomicU64::new(1),
        };
        log.init()?;
        Ok(log)
    }

    fn init(&self) -> Result<()> {
        let txn = self.db.begin_write().map_err(store_err)?;
        let stamp = {
            let mut meta = txn.open_table(META).map_err(store_err)?;
            // Touch every table so later read transactions never miss them.
            txn.open_table(OPS).map_err(store_err)?;
            txn.open_table(IDX_REPO).map_err(store_err)?;
            txn.open_table(IDX_PLAN).map_err(store_err)?;
            txn.open_table(IDX_SNAPSHOT).map_err(store_err)?;
            txn.open_table(IDX_FLOW).map_err(store_err)?;
            txn.open_table(RUNNING).map_err(store_err)?;
            let stamp = meta
                .get(META_INDEX_VERSION)
                .map_err(store_err)?
                .map(|g| g.value());
            if stamp != Some(INDEX_VERSION) {
                meta.insert(META_INDEX_VERSION, INDEX_VERSION)
                    .map_err(store_err)?;
            }
            stamp
        };

        if stamp != Some(INDEX_VERSION) {
            info!(
                found = ?stamp,
                want = INDEX_VERSION,
                "index version mismatch, rebuilding secondary indexes"
            );
            Self::rebuild_indexes(&txn)?;
        }
        txn.commit().map_err(store_err)?;
        Ok(())
    }

    /// Drop and repopulate every secondary index from the primary table.
    fn rebuild_indexes(txn: &redb::WriteTransaction) -> Result<()> {
        let rows: Vec<Operation> = {
            let ops = txn.open_table(OPS).map_err(store_err)?;
            let mut rows = Vec::new();
            for item in ops.range::<u64>(..).map_err(store_err)? {
                let (_, value) = item.map_err(store_err)?;
                rows.push(decode(value.value())?);
            }
            rows
        };

        txn.delete_table(IDX_REPO).map_err(store_err)?;
        txn.delete_table(IDX_PLAN).map_err(store_err)?;
        txn.delete_table(IDX_SNAPSHOT).map_err(store_err)?;
        txn.delete_table(IDX_FLOW).map_err(store_err)?;
        txn.delete_table(RUNNING).map_err(store_err)?;

        let mut idx_repo = txn.open_table(IDX_REPO).map_err(store_err)?;
        let mut idx_plan = txn.open_table(IDX_PLAN).map_err(store_err)?;
        let mut idx_snapshot = txn.open_table(IDX_SNAPSHOT).map_err(store_err)?;
        let mut idx_flow = txn.open_table(IDX_FLOW).map_err(store_err)?;
        let mut running = txn.open_table(RUNNING).map_err(store_err)?;

        for op in &rows {
            let id = op.id as u64;
            idx_repo.insert((op.repo_id.as_str(), id), ()).map_err(store_err)?;
            if !op.plan_id.is_empty() {
                idx_plan.insert((op.plan_id.as_str(), id), ()).map_err(store_err)?;
            }
            if !op.snapshot_id.is_empty() {
                idx_snapshot
                    .insert((op.snapshot_id.as_str(), id), ())
                    .map_err(store_err)?;
            }
            if op.flow_id != 0 {
                idx_flow.insert((op.flow_id as u64, id), ()).map_err(store_err)?;
            }
            if op.status == OperationStatus::InProgress {
                running
                    .insert((op.repo_id.as_str(), op.plan_id.as_str()), id)
                    .map_err(store_err)?;
            }
        }
        debug!(rows = rows.len(), "index rebuild complete");
        Ok(())
    }

    /// Insert a new row, assigning its id. Fails if `op.id` is pre-set.
    pub fn add(&self, op: &mut Operation) -> Result<()> {
        self.bulk_add(std::slice::from_mut(op))
    }

    /// Atomic multi-insert assigning contiguous ids.
    pub fn bulk_add(&self, ops: &mut [Operation]) -> Result<()> {
        for op in ops.iter() {
            if op.id != 0 {
                return Err(WardenError::InvalidArgument(format!(
                    "operation already has id {}",
                    op.id
                )));
            }
            validate_row(op)?;
        }

        let guard = self.commit_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut changes: Vec<Change> = Vec::with_capacity(ops.len());

        let txn = self.db.begin_write().map_err(store_err)?;
        {
            let mut meta = txn.open_table(META).map_err(store_err)?;
            let mut next = meta
                .get(META_NEXT_ID)
                .map_err(store_err)?
                .map(|g| g.value())
                .unwrap_or(1);

            let mut primary = txn.open_table(OPS).map_err(store_err)?;
            let mut idx_repo = txn.open_table(IDX_REPO).map_err(store_err)?;
            let mut idx_plan = txn.open_table(IDX_PLAN).map_err(store_err)?;
            let mut idx_snapshot = txn.open_table(IDX_SNAPSHOT).map_err(store_err)?;
            let mut idx_flow = txn.open_table(IDX_FLOW).map_err(store_err)?;
            let mut running = txn.open_table(RUNNING).map_err(store_err)?;

            for op in ops.iter_mut() {
                if let OperationKind::IndexSnapshot { .. } = op.kind {
                    Self::check_snapshot_unique(&idx_snapshot, &primary, op)?;
                }
                op.id = next as i64;
                next += 1;

                if op.status == OperationStatus::InProgress {
                    Self::claim_running(&mut running, op)?;
                }

                primary
                    .insert(op.id as u64, encode(op)?.as_slice())
                    .map_err(store_err)?;
                Self::index_insert(
                    &mut idx_repo,
                    &mut idx_plan,
                    &mut idx_snapshot,
                    &mut idx_flow,
                    op,
                )?;
                changes.push((None, Some(op.clone())));
            }
            meta.insert(META_NEXT_ID, next).map_err(store_err)?;
        }
        txn.commit().map_err(store_err)?;

        self.drain(changes);
        drop(guard);
        Ok(())
    }

    /// Replace an existing row after verifying the status transition.
    pub fn update(&self, op: &Operation) -> Result<()> {
        validate_row(op)?;
        let guard = self.commit_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut changes: Vec<Change> = Vec::with_capacity(1);

        let txn = self.db.begin_write().map_err(store_err)?;
        {
            let mut primary = txn.open_table(OPS).map_err(store_err)?;
            let old = primary
                .get(op.id as u64)
                .map_err(store_err)?
                .map(|g| decode(g.value()))
                .transpose()?
                .ok_or_else(|| WardenError::NotFound(format!("operation {}", op.id)))?;

            if !old.status.can_transition_to(op.status) {
                return Err(WardenError::IllegalTransition {
                    from: old.status.to_string(),
                    to: op.status.to_string(),
                });
            }
            if old.status.is_terminal() && !terminal_rewrite_ok(&old, op) {
                return Err(WardenError::IllegalTransition {
                    from: old.status.to_string(),
                    to: format!("{} (terminal rows only accept log-ref backfill)", op.status),
                });
            }
            if op.status.is_terminal()
                && op.unix_time_end_ms != 0
                && op.unix_time_start_ms != 0
                && op.unix_time_end_ms < op.unix_time_start_ms
            {
                return Err(WardenError::InvalidArgument(format!(
                    "operation {} would end before it starts",
                    op.id
                )));
            }

            let mut running = txn.open_table(RUNNING).map_err(store_err)?;
            if old.status != OperationStatus::InProgress
                && op.status == OperationStatus::InProgress
            {
                Self::claim_running(&mut running, op)?;
            } else if old.status == OperationStatus::InProgress && op.status.is_terminal() {
                running
                    .remove((old.repo_id.as_str(), old.plan_id.as_str()))
                    .map_err(store_err)?;
            }

            let mut idx_repo = txn.open_table(IDX_REPO).map_err(store_err)?;
            let mut idx_plan = txn.open_table(IDX_PLAN).map_err(store_err)?;
            let mut idx_snapshot = txn.open_table(IDX_SNAPSHOT).map_err(store_err)?;
            let mut idx_flow = txn.open_table(IDX_FLOW).map_err(store_err)?;
            Self::index_remove(
                &mut idx_repo,
                &mut idx_plan,
                &mut idx_snapshot,
                &mut idx_flow,
                &old,
            )?;
            Self::index_insert(
                &mut idx_repo,
                &mut idx_plan,
                &mut idx_snapshot,
                &mut idx_flow,
                op,
            )?;

            primary
                .insert(op.id as u64, encode(op)?.as_slice())
                .map_err(store_err)?;
            changes.push((Some(old), Some(op.clone())));
        }
        txn.commit().map_err(store_err)?;

        self.drain(changes);
        drop(guard);
        Ok(())
    }

    /// Point lookup. `NotFound` is distinguishable from storage errors.
    pub fn get(&self, id: i64) -> Result<Operation> {
        let txn = self.db.begin_read().map_err(store_err)?;
        let primary = txn.open_table(OPS).map_err(store_err)?;
        primary
            .get(id as u64)
            .map_err(store_err)?
            .map(|g| decode(g.value()))
            .transpose()?
            .ok_or_else(|| WardenError::NotFound(format!("operation {}", id)))
    }

    pub fn get_by_repo(&self, repo_id: &str, query: Query) -> Result<Vec<Operation>> {
        self.scan_str_index(IDX_REPO, repo_id, query)
    }

    pub fn get_by_plan(&self, plan_id: &str, query: Query) -> Result<Vec<Operation>> {
        self.scan_str_index(IDX_PLAN, plan_id, query)
    }

    pub fn get_by_snapshot(&self, snapshot_id: &str, query: Query) -> Result<Vec<Operation>> {
        self.scan_str_index(IDX_SNAPSHOT, snapshot_id, query)
    }

    pub fn get_by_flow(&self, flow_id: i64, query: Query) -> Result<Vec<Operation>> {
        let txn = self.db.begin_read().map_err(store_err)?;
        let idx = txn.open_table(IDX_FLOW).map_err(store_err)?;
        let mut ids = Vec::new();
        for item in idx
            .range((flow_id as u64, 0)..=(flow_id as u64, u64::MAX))
            .map_err(store_err)?
        {
            let (key, _) = item.map_err(store_err)?;
            ids.push(key.value().1);
        }
        drop(idx);
        self.load_ids(&txn, ids, query)
    }

    /// Streaming scan of every row with id strictly greater than `since_id`,
    /// ascending. Used for catch-up by late subscribers.
    pub fn for_each<F>(&self, since_id: i64, mut visitor: F) -> Result<()>
    where
        F: FnMut(&Operation) -> Result<()>,
    {
        let txn = self.db.begin_read().map_err(store_err)?;
        let primary = txn.open_table(OPS).map_err(store_err)?;
        let start = (since_id as u64).saturating_add(1);
        for item in primary.range(start..).map_err(store_err)? {
            let (_, value) = item.map_err(store_err)?;
            visitor(&decode(value.value())?)?;
        }
        Ok(())
    }

    /// Bulk delete honoring the ClearHistory filters. Returns deleted ids.
    pub fn delete(&self, filter: &ClearHistoryFilter) -> Result<Vec<i64>> {
        let guard = self.commit_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut changes: Vec<Change> = Vec::new();
        let mut deleted = Vec::new();

        let txn = self.db.begin_write().map_err(store_err)?;
        {
            let mut primary = txn.open_table(OPS).map_err(store_err)?;
            let victims: Vec<Operation> = {
                let mut victims = Vec::new();
                for item in primary.range::<u64>(..).map_err(store_err)? {
                    let (_, value) = item.map_err(store_err)?;
                    let op = decode(value.value())?;
                    if filter.matches(&op) {
                        victims.push(op);
                    }
                }
                victims
            };

            let mut idx_repo = txn.open_table(IDX_REPO).map_err(store_err)?;
            let mut idx_plan = txn.open_table(IDX_PLAN).map_err(store_err)?;
            let mut idx_snapshot = txn.open_table(IDX_SNAPSHOT).map_err(store_err)?;
            let mut idx_flow = txn.open_table(IDX_FLOW).map_err(store_err)?;

            for op in victims {
                primary.remove(op.id as u64).map_err(store_err)?;
                Self::index_remove(
                    &mut idx_repo,
                    &mut idx_plan,
                    &mut idx_snapshot,
                    &mut idx_flow,
                    &op,
                )?;
                deleted.push(op.id);
                changes.push((Some(op), None));
            }
        }
        txn.commit().map_err(store_err)?;

        self.drain(changes);
        drop(guard);
        Ok(deleted)
    }

    /// Register a subscriber. Invoked synchronously under the commit lock;
    /// must not block.
    pub fn subscribe(&self, f: Subscriber) -> SubscriptionHandle {
        let id = self.next_subscriber.fetch_add(1, Ordering::SeqCst);
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, f));
        SubscriptionHandle(id)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(id, _)| *id != handle.0);
    }

    fn drain(&self, changes: Vec<Change>) {
        if changes.is_empty() {
            return;
        }
        let subs = self.subscribers.read().unwrap_or_else(|e| e.into_inner());
        for (old, new) in &changes {
            for (_, f) in subs.iter() {
                f(old.as_ref(), new.as_ref());
            }
        }
    }

    fn scan_str_index(
        &self,
        table: TableDefinition<(&'static str, u64), ()>,
        value: &str,
        query: Query,
    ) -> Result<Vec<Operation>> {
        let txn = self.db.begin_read().map_err(store_err)?;
        let idx = txn.open_table(table).map_err(store_err)?;
        let mut ids = Vec::new();
        for item in idx.range((value, 0)..=(value, u64::MAX)).map_err(store_err)? {
            let (key, _) = item.map_err(store_err)?;
            ids.push(key.value().1);
        }
        drop(idx);
        self.load_ids(&txn, ids, query)
    }

    /// Apply cursor, direction, and limit to an ascending id list, then load
    /// the rows.
    fn load_ids(
        &self,
        txn: &redb::ReadTransaction,
        mut ids: Vec<u64>,
        query: Query,
    ) -> Result<Vec<Operation>> {
        if let Some(last) = query.last_id {
            if query.reverse {
                ids.retain(|id| (*id as i64) < last);
            } else {
                ids.retain(|id| (*id as i64) > last);
            }
        }
        if query.reverse {
            ids.reverse();
        }
        if let Some(limit) = query.limit {
            ids.truncate(limit);
        }

        let primary = txn.open_table(OPS).map_err(store_err)?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(g) = primary.get(id).map_err(store_err)? {
                out.push(decode(g.value())?);
            } else {
                warn!(id, "dangling index entry");
            }
        }
        Ok(out)
    }

    fn index_insert(
        idx_repo: &mut redb::Table<(&'static str, u64), ()>,
        idx_plan: &mut redb::Table<(&'static str, u64), ()>,
        idx_snapshot: &mut redb::Table<(&'static str, u64), ()>,
        idx_flow: &mut redb::Table<(u64, u64), ()>,
        op: &Operation,
    ) -> Result<()> {
        let id = op.id as u64;
        idx_repo.insert((op.repo_id.as_str(), id), ()).map_err(store_err)?;
        if !op.plan_id.is_empty() {
            idx_plan.insert((op.plan_id.as_str(), id), ()).map_err(store_err)?;
        }
        if !op.snapshot_id.is_empty() {
            idx_snapshot
                .insert((op.snapshot_id.as_str(), id), ())
                .map_err(store_err)?;
        }
        if op.flow_id != 0 {
            idx_flow.insert((op.flow_id as u64, id), ()).map_err(store_err)?;
        }
        Ok(())
    }

    fn index_remove(
        idx_repo: &mut redb::Table<(&'static str, u64), ()>,
        idx_plan: &mut redb::Table<(&'static str, u64), ()>,
        idx_snapshot: &mut redb::Table<(&'static str, u64), ()>,
        idx_flow: &mut redb::Table<(u64, u64), ()>,
        op: &Operation,
    ) -> Result<()> {
        let id = op.id as u64;
        idx_repo.remove((op.repo_id.as_str(), id)).map_err(store_err)?;
        if !op.plan_id.is_empty() {
            idx_plan.remove((op.plan_id.as_str(), id)).map_err(store_err)?;
        }
        if !op.snapshot_id.is_empty() {
            idx_snapshot
                .remove((op.snapshot_id.as_str(), id))
                .map_err(store_err)?;
        }
        if op.flow_id != 0 {
            idx_flow.remove((op.flow_id as u64, id)).map_err(store_err)?;
        }
        Ok(())
    }

    fn claim_running(
        running: &mut redb::Table<(&'static str, &'static str), u64>,
        op: &Operation,
    ) -> Result<()> {
        let key = (op.repo_id.as_str(), op.plan_id.as_str());
        if let Some(existing) = running.get(key).map_err(store_err)? {
            let holder = existing.value();
            if holder != op.id as u64 {
                return Err(WardenError::IllegalTransition {
                    from: format!("operation {} already in progress for this plan", holder),
                    to: OperationStatus::InProgress.to_string(),
                });
            }
        }
        running.insert(key, op.id as u64).map_err(store_err)?;
        Ok(())
    }

    /// Reject an IndexSnapshot insert when a non-cancelled row for the same
    /// repo already covers the snapshot.
    fn check_snapshot_unique(
        idx_snapshot: &redb::Table<(&'static str, u64), ()>,
        primary: &redb::Table<u64, &'static [u8]>,
        op: &Operation,
    ) -> Result<()> {
        if op.snapshot_id.is_empty() {
            return Err(WardenError::InvalidArgument(
                "index snapshot operation without snapshot id".to_string(),
            ));
        }
        for item in idx_snapshot
            .range((op.snapshot_id.as_str(), 0)..=(op.snapshot_id.as_str(), u64::MAX))
            .map_err(store_err)?
        {
            let (key, _) = item.map_err(store_err)?;
            let Some(existing) = primary.get(key.value().1).map_err(store_err)? else {
                continue;
            };
            let existing = decode(existing.value())?;
            let cancelled = matches!(
                existing.status,
                OperationStatus::UserCancelled | OperationStatus::SystemCancelled
            );
            if existing.repo_id == op.repo_id
                && matches!(existing.kind, OperationKind::IndexSnapshot { .. })
                && !cancelled
            {
                return Err(WardenError::InvalidArgument(format!(
                    "snapshot {} already indexed as operation {}",
                    op.snapshot_id, existing.id
                )));
            }
        }
        Ok(())
    }
}

fn validate_row(op: &Operation) -> Result<()> {
    if op.repo_id.is_empty() {
        return Err(WardenError::InvalidArgument(
            "operation without repo id".to_string(),
        ));
    }
    Ok(())
}

/// Terminal rows accept exactly one kind of rewrite: log-ref backfill.
fn terminal_rewrite_ok(old: &Operation, new: &Operation) -> bool {
    let mut patched = old.clone();
    patched.log_ref = new.log_ref.clone();
    patched == *new
}

fn encode(op: &Operation) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(op)?)
}

fn decode(bytes: &[u8]) -> Result<Operation> {
    serde_json::from_slice(bytes)
        .map_err(|e| WardenError::Corrupt(format!("undecodable operation row: {}", e)))
}

fn store_err(e: impl Into<redb::Error>) -> WardenError {
    let e = e.into();
    match e {
        redb::Error::Corrupted(msg) => WardenError::Corrupt(msg),
        other => WardenError::Transient(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_core::OperationKind;

    fn open_log() -> (OpLog, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let log = OpLog::open(&dir.path().join("oplog.redb")).unwrap();
        (log, dir)
    }

    fn backup_op(repo: &str, plan: &str) -> Operation {
        Operation::new(repo, plan, OperationKind::Backup { last_status: None })
    }

    #[test]
    fn test_add_assigns_increasing_ids() {
        let (log, _dir) = open_log();

        let mut a = backup_op("r1", "p1");
        let mut b = backup_op("r1", "p2");
        log.add(&mut a).unwrap();
        log.add(&mut b).unwrap();

        assert!(a.id > 0);
        assert!(b.id > a.id);
    }

    #[test]
    fn test_add_rejects_preset_id() {
        let (log, _dir) = open_log();
        let mut op = backup_op("r1", "p1");
        op.id = 42;
        assert!(matches!(
            log.add(&mut op),
            Err(WardenError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_update_rejects_backwards_transition() {
        let (log, _dir) = open_log();
        let mut op = backup_op("r1", "p1");
        log.add(&mut op).unwrap();

        op.status = OperationStatus::InProgress;
        log.update(&op).unwrap();
        op.status = OperationStatus::Success;
        log.update(&op).unwrap();

        op.status = OperationStatus::InProgress;
        let err = log.update(&op).unwrap_err();
        assert!(matches!(err, WardenError::IllegalTransition { .. }));
    }

    #[test]
    fn test_terminal_row_accepts_log_ref_backfill_only() {
        let (log, _dir) = open_log();
        let mut op = backup_op("r1", "p1");
        log.add(&mut op).unwrap();
        op.status = OperationStatus::Error;
        op.error = "boom".to_string();
        log.update(&op).unwrap();

        op.log_ref = "blob-1".to_string();
        log.update(&op).unwrap();
        assert_eq!(log.get(op.id).unwrap().log_ref, "blob-1");

        op.error = "rewritten".to_string();
        assert!(log.update(&op).is_err());
    }

    #[test]
    fn test_get_not_found_distinguishable() {
        let (log, _dir) = open_log();
        assert!(matches!(log.get(999), Err(WardenError::NotFound(_))));
    }

    #[test]
    fn test_running_guard_one_in_progress_per_plan() {
        let (log, _dir) = open_log();
        let mut a = backup_op("r1", "p1");
        let mut b = backup_op("r1", "p1");
        log.add(&mut a).unwrap();
        log.add(&mut b).unwrap();

        a.status = OperationStatus::InProgress;
        log.update(&a).unwrap();

        b.status = OperationStatus::InProgress;
        assert!(matches!(
            log.update(&b),
            Err(WardenError::IllegalTransition { .. })
        ));

        // Finishing the first frees the slot.
        a.status = OperationStatus::Success;
        log.update(&a).unwrap();
        log.update(&b).unwrap();
    }

    #[test]
    fn test_query_cursor_limit_direction() {
        let (log, _dir) = open_log();
        let mut ids = Vec::new();
        for _ in 0..5 {
            let mut op = backup_op("r1", "p1");
            log.add(&mut op).unwrap();
            ids.push(op.id);
        }

        let all = log.get_by_plan("p1", Query::all()).unwrap();
        assert_eq!(all.iter().map(|o| o.id).collect::<Vec<_>>(), ids);

        let first_two = log.get_by_plan("p1", Query::all().with_limit(2)).unwrap();
        assert_eq!(first_two.len(), 2);
        assert_eq!(first_two[0].id, ids[0]);

        let after = log
            .get_by_plan(
                "p1",
                Query {
                    last_id: Some(ids[2]),
                    ..Query::all()
                },
            )
            .unwrap();
        assert_eq!(after.iter().map(|o| o.id).collect::<Vec<_>>(), &ids[3..]);

        let newest = log
            .get_by_plan("p1", Query::all().reversed().with_limit(1))
            .unwrap();
        assert_eq!(newest[0].id, *ids.last().unwrap());
    }

    #[test]
    fn test_for_each_since() {
        let (log, _dir) = open_log();
        let mut first = backup_op("r1", "p1");
        let mut second = backup_op("r1", "p1");
        log.add(&mut first).unwrap();
        log.add(&mut second).unwrap();

        let mut seen = Vec::new();
        log.for_each(first.id, |op| {
            seen.push(op.id);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![second.id]);
    }

    #[test]
    fn test_clear_history_only_failed_spares_success() {
        let (log, _dir) = open_log();

        let mut ok = backup_op("r1", "p1");
        log.add(&mut ok).unwrap();
        ok.status = OperationStatus::InProgress;
        log.update(&ok).unwrap();
        ok.status = OperationStatus::Success;
        log.update(&ok).unwrap();

        let mut failed = backup_op("r1", "p1");
        log.add(&mut failed).unwrap();
        failed.status = OperationStatus::InProgress;
        log.update(&failed).unwrap();
        failed.status = OperationStatus::Error;
        log.update(&failed).unwrap();

        let deleted = log
            .delete(&ClearHistoryFilter {
                only_failed: true,
                ..Default::default()
            })
            .unwrap();

        assert_eq!(deleted, vec![failed.id]);
        assert!(log.get(ok.id).is_ok());
        assert!(log.get(failed.id).is_err());
    }

    #[test]
    fn test_clear_history_skips_in_flight() {
        let (log, _dir) = open_log();
        let mut pending = backup_op("r1", "p1");
        log.add(&mut pending).unwrap();

        let deleted = log.delete(&ClearHistoryFilter::default()).unwrap();
        assert!(deleted.is_empty());
    }

    #[test]
    fn test_subscribers_see_commit_order() {
        let (log, _dir) = open_log();
        let seen = std::sync::Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let handle = log.subscribe(Box::new(move |old, new| {
            seen2.lock().unwrap().push((
                old.map(|o| (o.id, o.status)),
                new.map(|n| (n.id, n.status)),
            ));
        }));

        let mut op = backup_op("r1", "p1");
        log.add(&mut op).unwrap();
        op.status = OperationStatus::InProgress;
        log.update(&op).unwrap();

        let events = seen.lock().unwrap().clone();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].0, None);
        assert_eq!(events[0].1, Some((op.id, OperationStatus::Pending)));
        assert_eq!(events[1].1, Some((op.id, OperationStatus::InProgress)));

        log.unsubscribe(handle);
        op.status = OperationStatus::Success;
        log.update(&op).unwrap();
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_snapshot_index_uniqueness() {
        let (log, _dir) = open_log();
        let snapshot = warden_core::Snapshot {
            id: "abc123".to_string(),
            unix_time_ms: 1000,
            ..Default::default()
        };
        let mut op = Operation::new(
            "r1",
            "p1",
            OperationKind::IndexSnapshot {
                snapshot: snapshot.clone(),
            },
        );
        op.snapshot_id = snapshot.id.clone();
        op.status = OperationStatus::Success;
        op.unix_time_start_ms = 1000;
        op.unix_time_end_ms = 1000;
        log.add(&mut op).unwrap();

        let mut dup = Operation::new("r1", "p1", OperationKind::IndexSnapshot { snapshot });
        dup.snapshot_id = "abc123".to_string();
        dup.status = OperationStatus::Success;
        assert!(matches!(
            log.add(&mut dup),
            Err(WardenError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_reopen_preserves_rows_and_indexes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oplog.redb");

        let id = {
            let log = OpLog::open(&path).unwrap();
            let mut op = backup_op("r1", "p1");
            log.add(&mut op).unwrap();
            op.id
        };

        let log = OpLog::open(&path).unwrap();
        assert_eq!(log.get(id).unwrap().id, id);
        assert_eq!(log.get_by_repo("r1", Query::all()).unwrap().len(), 1);
    }
}
