//! Repo driver abstraction
//!
//! The orchestrator core never talks to the backup binary directly; it holds
//! a `RepoDriver` per repository. The trait allows mocking the subprocess in
//! tests.

use async_trait::async_trait;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

use warden_core::{
    BackupProgress, FileEntry, Plan, PrunePolicy, RepoStats, Result, RetentionPolicy, Snapshot,
    WardenError,
};

/// Typed capability set over one restic-compatible repository.
///
/// Long-running calls take a cancellation token and must observe it at every
/// I/O boundary; a cancelled call kills the subprocess and returns
/// `WardenError::Cancelled`.
#[async_trait]
pub trait RepoDriver: Send + Sync {
    /// Run a backup for `plan`, invoking `progress` for each progress entry.
    /// Returns the final summary entry.
    async fn backup(
        &self,
        cancel: &CancellationToken,
        plan: &Plan,
        progress: &(dyn for<'a> Fn(&'a BackupProgress) + Send + Sync),
    ) -> Result<BackupProgress>;

    /// Apply a retention policy to the plan's snapshots. Returns the ids of
    /// forgotten snapshots.
    async fn forget_plan(
        &self,
        cancel: &CancellationToken,
        plan: &Plan,
        policy: &RetentionPolicy,
    ) -> Result<Vec<String>>;

    /// Forget one specific snapshot, independent of any plan.
    async fn forget_snapshot(
        &self,
        cancel: &CancellationToken,
        snapshot_id: &str,
    ) -> Result<Vec<String>>;

    /// Prune unreferenced data. Output is unstructured text, streamed
    /// verbatim into `output` line by line.
    async fn prune(
        &self,
        cancel: &CancellationToken,
        policy: &PrunePolicy,
        output: &(dyn for<'a> Fn(&'a str) + Send + Sync),
    ) -> Result<()>;

    /// Restore `path` from `snapshot_id` into the `target` directory.
    async fn restore(
        &self,
        cancel: &CancellationToken,
        snapshot_id: &str,
        path: &str,
        target: &str,
    ) -> Result<()>;

    /// List the snapshots tagged for `plan`.
    async fn snapshots_for_plan(
        &self,
        cancel: &CancellationToken,
        plan: &Plan,
    ) -> Result<Vec<Snapshot>>;

    /// List entries under `path` inside a snapshot.
    async fn list_files(&self, snapshot_id: &str, path: &str) -> Result<Vec<FileEntry>>;

    /// Drop stale repository locks.
    async fn unlock(&self) -> Result<()>;

    /// Repository statistics summary.
    async fn stats(&self) -> Result<RepoStats>;

    /// Verify repository integrity. Text output streams into `output`.
    async fn check(&self, cancel: &CancellationToken, output: &(dyn for<'a> Fn(&'a str) + Send + Sync))
        -> Result<String>;
}

/// Canned-response driver for tests.
///
/// Backups synthesize a deterministic snapshot id per invocation and append
/// it to the snapshot set, so follow-up indexing and forget behavior can be
/// exercised without a real subprocess.
pub struct MockDriver {
    snapshots: Mutex<Vec<Snapshot>>,
    backup_count: Mutex<u64>,
    /// When set, backup blocks until cancelled and then fails.
    pub hang_backups: bool,
    /// When set, every call fails with this message.
    pub fail_with: Option<String>,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    pub fn new() -> Self {
        Self {
            snapshots: Mutex::new(Vec::new()),
            backup_count: Mutex::new(0),
            hang_backups: false,
            fail_with: None,
        }
    }

    pub fn with_snapshots(self, snapshots: Vec<Snapshot>) -> Self {
        *self.snapshots.lock().unwrap() = snapshots;
        self
    }

    pub fn hanging(mut self) -> Self {
        self.hang_backups = true;
        self
    }

    pub fn failing(mut self, message: &str) -> Self {
        self.fail_with = Some(message.to_string());
        self
    }

    pub fn snapshot_ids(&self) -> Vec<String> {
        self.snapshots
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.id.clone())
            .collect()
    }

    fn check_failure(&self) -> Result<()> {
        if let Some(message) = &self.fail_with {
            return Err(WardenError::subprocess_failed(Some(1), message));
        }
        Ok(())
    }
}

#[async_trait]
impl RepoDriver for MockDriver {
    async fn backup(
        &self,
        cancel: &CancellationToken,
        plan: &Plan,
        progress: &(dyn for<'a> Fn(&'a BackupProgress) + Send + Sync),
    ) -> Result<BackupProgress> {
        self.check_failure()?;
        if self.hang_backups {
            cancel.cancelled().await;
            return Err(WardenError::Cancelled);
        }

        progress(&BackupProgress {
            message_type: "status".to_string(),
            percent_done: 0.5,
            total_files: 2,
            total_bytes: 2048,
            files_done: 1,
            bytes_done: 1024,
            snapshot_id: None,
        });

        let mut count = self.backup_count.lock().unwrap();
        *count += 1;
        let snapshot_id = format!("mock{:04}", *count);
        drop(count);

        self.snapshots.lock().unwrap().push(Snapshot {
            id: snapshot_id.clone(),
            unix_time_ms: 1_700_000_000_000,
            tags: vec![format!("plan:{}", plan.id)],
            paths: plan.paths.clone(),
            ..Default::default()
        });

        let summary = BackupProgress {
            message_type: "summary".to_string(),
            percent_done: 1.0,
            total_files: 2,
            total_bytes: 2048,
            files_done: 2,
            bytes_done: 2048,
            snapshot_id: Some(snapshot_id),
        };
        progress(&summary);
        Ok(summary)
    }

    async fn forget_plan(
        &self,
        _cancel: &CancellationToken,
        plan: &Plan,
        policy: &RetentionPolicy,
    ) -> Result<Vec<String>> {
        self.check_failure()?;
        let mut snapshots = self.snapshots.lock().unwrap();
        let tag = format!("plan:{}", plan.id);
        let mut tagged: Vec<usize> = snapshots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.tags.contains(&tag))
            .map(|(i, _)| i)
            .collect();

        let keep = policy.keep_last.max(1) as usize;
        if tagged.len() <= keep {
            return Ok(Vec::new());
        }
        let drop_count = tagged.len() - keep;
        let victims: Vec<usize> = tagged.drain(..drop_count).collect();
        let mut forgotten = Vec::new();
        for index in victims.into_iter().rev() {
            forgotten.push(snapshots.remove(index).id);
        }
        forgotten.reverse();
        Ok(forgotten)
    }

    async fn forget_snapshot(
        &self,
        _cancel: &CancellationToken,
        snapshot_id: &str,
    ) -> Result<Vec<String>> {
        self.check_failure()?;
        let mut snapshots = self.snapshots.lock().unwrap();
        let before = snapshots.len();
        snapshots.retain(|s| s.id != snapshot_id);
        if snapshots.len() == before {
            return Err(WardenError::NotFound(format!("snapshot {}", snapshot_id)));
        }
        Ok(vec![snapshot_id.to_string()])
    }

    async fn prune(
        &self,
        _cancel: &CancellationToken,
        _policy: &PrunePolicy,
        output: &(dyn for<'a> Fn(&'a str) + Send + Sync),
    ) -> Result<()> {
        self.check_failure()?;
        output("loading indexes...");
        output("done");
        Ok(())
    }

    async fn restore(
        &self,
        _cancel: &CancellationToken,
        snapshot_id: &str,
        _path: &str,
        _target: &str,
    ) -> Result<()> {
        self.check_failure()?;
        let known = self.snapshots.lock().unwrap().iter().any(|s| s.id == snapshot_id);
        if !known {
            return Err(WardenError::NotFound(format!("snapshot {}", snapshot_id)));
        }
        Ok(())
    }

    async fn snapshots_for_plan(
        &self,
        _cancel: &CancellationToken,
        plan: &Plan,
    ) -> Result<Vec<Snapshot>> {
        self.check_failure()?;
        let tag = format!("plan:{}", plan.id);
        Ok(self
            .snapshots
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.tags.contains(&tag))
            .cloned()
            .collect())
    }

    async fn list_files(&self, _snapshot_id: &str, path: &str) -> Result<Vec<FileEntry>> {
        self.check_failure()?;
        Ok(vec![FileEntry {
            name: "file.txt".to_string(),
            path: format!("{}/file.txt", path.trim_end_matches('/')),
            entry_type: "file".to_string(),
            size: 42,
            unix_time_ms: 1_700_000_000_000,
        }])
    }

    async fn unlock(&self) -> Result<()> {
        self.check_failure()
    }

    async fn stats(&self) -> Result<RepoStats> {
        self.check_failure()?;
        Ok(RepoStats {
            total_size: 4096,
            total_file_count: 4,
            snapshot_count: self.snapshots.lock().unwrap().len() as u64,
            compression_ratio: 1.3,
        })
    }

    async fn check(
        &self,
        _cancel: &CancellationToken,
        output: &(dyn for<'a> Fn(&'a str) + Send + Sync),
    ) -> Result<String> {
        self.check_failure()?;
        output("no errors were found");
        Ok("no errors were found".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> Plan {
        Plan {
            id: "p1".to_string(),
            repo: "r1".to_string(),
            paths: vec!["/data".to_string()],
            cron: "0 0 * * * *".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_mock_backup_produces_summary_and_snapshot() {
        let driver = MockDriver::new();
        let cancel = CancellationToken::new();

        let summary = driver.backup(&cancel, &plan(), &|_| {}).await.unwrap();
        assert!(summary.is_summary());
        let id = summary.snapshot_id.unwrap();
        assert_eq!(driver.snapshot_ids(), vec![id]);
    }

    #[tokio::test]
    async fn test_mock_forget_keeps_last() {
        let driver = MockDriver::new();
        let cancel = CancellationToken::new();
        let plan = plan();
        for _ in 0..5 {
            driver.backup(&cancel, &plan, &|_| {}).await.unwrap();
        }

        let policy = RetentionPolicy {
            keep_last: 3,
            ..Default::default()
        };
        let forgotten = driver.forget_plan(&cancel, &plan, &policy).await.unwrap();
        assert_eq!(forgotten, vec!["mock0001", "mock0002"]);

        // Idempotent: a second pass has nothing left to forget.
        let again = driver.forget_plan(&cancel, &plan, &policy).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_mock_hanging_backup_observes_cancel() {
        let driver = MockDriver::new().hanging();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = driver.backup(&cancel, &plan(), &|_| {}).await.unwrap_err();
        assert!(matches!(err, WardenError::Cancelled));
    }
}
