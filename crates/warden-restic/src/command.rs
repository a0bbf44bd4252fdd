//! restic command execution
//!
//! Builds argument lists from plans and policies, spawns the binary with the
//! repo's credential environment, and parses its line-delimited JSON output.

use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use warden_core::{
    BackupProgress, FileEntry, Plan, PrunePolicy, Repo, RepoStats, Result, RetentionPolicy,
    Snapshot, WardenError,
};

use crate::driver::RepoDriver;

/// Production driver spawning a restic-compatible binary.
#[derive(Clone)]
pub struct ResticCli {
    binary: String,
    repo: Repo,
}

impl ResticCli {
    pub fn new(repo: Repo) -> Self {
        Self {
            binary: "restic".to_string(),
            repo,
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn repo_id(&self) -> &str {
        &self.repo.id
    }

    /// Base invocation with repository URI, credentials, and extra flags.
    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--repo").arg(&self.repo.uri);
        for flag in &self.repo.flags {
            cmd.arg(flag);
        }
        cmd.args(args);
        for (key, value) in &self.repo.env {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Run to completion, observing the cancel token. Returns (stdout, stderr).
    #[instrument(skip(self, cancel), fields(repo = %self.repo.id))]
    async fn run(&self, args: &[&str], cancel: &CancellationToken) -> Result<(String, String)> {
        debug!("running restic {:?}", args);
        let mut child = self.command(args).spawn()?;

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let read_both = async {
            let mut stdout = String::new();
            let mut stderr = String::new();
            tokio::try_join!(
                async {
                    if let Some(pipe) = stdout_pipe.as_mut() {
                        pipe.read_to_string(&mut stdout).await?;
                    }
                    Ok::<_, std::io::Error>(())
                },
                async {
                    if let Some(pipe) = stderr_pipe.as_mut() {
                        pipe.read_to_string(&mut stderr).await?;
                    }
                    Ok::<_, std::io::Error>(())
                },
            )?;
            Ok::<_, std::io::Error>((stdout, stderr))
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                Err(WardenError::Cancelled)
            }
            output = read_both => {
                let (stdout, stderr) = output?;
                let status = child.wait().await?;
                if status.success() {
                    Ok((stdout, stderr))
                } else {
                    Err(WardenError::subprocess_failed(
                        status.code(),
                        &format!("{}{}", stdout, stderr),
                    ))
                }
            }
        }
    }

    /// Run, streaming each stdout line into `on_line` as it arrives.
    async fn run_streaming(
        &self,
        args: &[&str],
        cancel: &CancellationToken,
        on_line: &(dyn for<'a> Fn(&'a str) + Send + Sync),
    ) -> Result<()> {
        debug!("running restic {:?} (streaming)", args);
        let mut child = self.command(args).spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WardenError::InvalidArgument("child stdout not captured".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();
        let mut stderr_pipe = child.stderr.take();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    return Err(WardenError::Cancelled);
                }
                line = lines.next_line() => {
                    match line? {
                        Some(line) => on_line(&line),
                        None => break,
                    }
                }
            }
        }

        let mut stderr = String::new();
        if let Some(pipe) = stderr_pipe.as_mut() {
            pipe.read_to_string(&mut stderr).await?;
        }
        let status = child.wait().await?;
        if status.success() {
            Ok(())
        } else {
            Err(WardenError::subprocess_failed(status.code(), &stderr))
        }
    }
}

#[async_trait]
impl RepoDriver for ResticCli {
    async fn backup(
        &self,
        cancel: &CancellationToken,
        plan: &Plan,
        progress: &(dyn for<'a> Fn(&'a BackupProgress) + Send + Sync),
    ) -> Result<BackupProgress> {
        let tag = format!("plan:{}", plan.id);
        let mut args: Vec<String> = vec![
            "backup".to_string(),
            "--json".to_string(),
            "--tag".to_string(),
            tag,
        ];
        for exclude in &plan.excludes {
            args.push("--exclude".to_string());
            args.push(exclude.clone());
        }
        args.extend(plan.paths.iter().cloned());
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();

        let summary = std::sync::Mutex::new(None);
        self.run_streaming(&arg_refs, cancel, &|line| {
            if let Some(entry) = parse_progress_line(line) {
                if entry.is_summary() {
                    *summary.lock().unwrap() = Some(entry.clone());
                }
                progress(&entry);
            }
        })
        .await?;

        summary
            .into_inner()
            .unwrap_or_else(|e| e.into_inner())
            .ok_or_else(|| {
                WardenError::InvalidArgument("backup produced no summary entry".to_string())
            })
    }

    async fn forget_plan(
        &self,
        cancel: &CancellationToken,
        plan: &Plan,
        policy: &RetentionPolicy,
    ) -> Result<Vec<String>> {
        let tag = format!("plan:{}", plan.id);
        let mut args: Vec<String> = vec![
            "forget".to_string(),
            "--json".to_string(),
            "--tag".to_string(),
            tag,
        ];
        args.extend(retention_flags(policy));
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();

        let (stdout, _) = self.run(&arg_refs, cancel).await?;
        parse_forget_output(&stdout)
    }

    async fn forget_snapshot(
        &self,
        cancel: &CancellationToken,
        snapshot_id: &str,
    ) -> Result<Vec<String>> {
        self.run(&["forget", "--json", snapshot_id], cancel).await?;
        Ok(vec![snapshot_id.to_string()])
    }

    async fn prune(
        &self,
        cancel: &CancellationToken,
        policy: &PrunePolicy,
        output: &(dyn for<'a> Fn(&'a str) + Send + Sync),
    ) -> Result<()> {
        let mut args: Vec<String> = vec!["prune".to_string()];
        if policy.max_unused_percent > 0.0 {
            args.push("--max-unused".to_string());
            args.push(format!("{}%", policy.max_unused_percent));
        }
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run_streaming(&arg_refs, cancel, output).await
    }

    async fn restore(
        &self,
        cancel: &CancellationToken,
        snapshot_id: &str,
        path: &str,
        target: &str,
    ) -> Result<()> {
        let mut args = vec!["restore", snapshot_id, "--target", target];
        if !path.is_empty() && path != "/" {
            args.push("--include");
            args.push(path);
        }
        self.run(&args, cancel).await?;
        Ok(())
    }

    async fn snapshots_for_plan(
        &self,
        cancel: &CancellationToken,
        plan: &Plan,
    ) -> Result<Vec<Snapshot>> {
        let tag = format!("plan:{}", plan.id);
        let (stdout, _) = self
            .run(&["snapshots", "--json", "--tag", &tag], cancel)
            .await?;
        parse_snapshots(&stdout)
    }

    async fn list_files(&self, snapshot_id: &str, path: &str) -> Result<Vec<FileEntry>> {
        let cancel = CancellationToken::new();
        let (stdout, _) = self
            .run(&["ls", "--json", snapshot_id, path], &cancel)
            .await?;
        parse_ls_output(&stdout)
    }

    async fn unlock(&self) -> Result<()> {
        let cancel = CancellationToken::new();
        self.run(&["unlock"], &cancel).await?;
        Ok(())
    }

    async fn stats(&self) -> Result<RepoStats> {
        let cancel = CancellationToken::new();
        let (stdout, _) = self.run(&["stats", "--json"], &cancel).await?;
        let wire: StatsJson = serde_json::from_str(stdout.trim())?;
        Ok(RepoStats {
            total_size: wire.total_size,
            total_file_count: wire.total_file_count,
            snapshot_count: wire.snapshots_count,
            compression_ratio: wire.compression_ratio,
        })
    }

    async fn check(
        &self,
        cancel: &CancellationToken,
        output: &(dyn for<'a> Fn(&'a str) + Send + Sync),
    ) -> Result<String> {
        let collected = std::sync::Mutex::new(String::new());
        self.run_streaming(&["check"], cancel, &|line| {
            let mut buffer = collected.lock().unwrap();
            buffer.push_str(line);
            buffer.push('\n');
            output(line);
        })
        .await?;
        Ok(collected.into_inner().unwrap_or_else(|e| e.into_inner()))
    }
}

/// Map a retention policy onto forget flags. A non-zero `keep_last` wins;
/// otherwise every non-zero time bucket contributes its flag.
pub fn retention_flags(policy: &RetentionPolicy) -> Vec<String> {
    let mut flags = Vec::new();
    if policy.keep_last > 0 {
        flags.push("--keep-last".to_string());
        flags.push(policy.keep_last.to_string());
        return flags;
    }
    for (flag, value) in [
        ("--keep-hourly", policy.keep_hourly),
        ("--keep-daily", policy.keep_daily),
        ("--keep-weekly", policy.keep_weekly),
        ("--keep-monthly", policy.keep_monthly),
        ("--keep-yearly", policy.keep_yearly),
    ] {
        if value > 0 {
            flags.push(flag.to_string());
            flags.push(value.to_string());
        }
    }
    flags
}

#[derive(Debug, Deserialize)]
struct ProgressJson {
    message_type: String,
    #[serde(default)]
    percent_done: f64,
    #[serde(default)]
    total_files: u64,
    #[serde(default)]
    total_bytes: u64,
    #[serde(default)]
    files_done: u64,
    #[serde(default)]
    bytes_done: u64,
    #[serde(default)]
    total_files_processed: u64,
    #[serde(default)]
    total_bytes_processed: u64,
    #[serde(default)]
    snapshot_id: Option<String>,
}

/// Parse one line of `restic backup --json` output. Lines that are not
/// progress entries (verbose messages, blank lines) return `None`.
fn parse_progress_line(line: &str) -> Option<BackupProgress> {
    let line = line.trim();
    if line.is_empty() || !line.starts_with('{') {
        return None;
    }
    let wire: ProgressJson = match serde_json::from_str(line) {
        Ok(wire) => wire,
        Err(e) => {
            warn!("unparseable progress line: {}", e);
            return None;
        }
    };
    match wire.message_type.as_str() {
        "status" => Some(BackupProgress {
            message_type: wire.message_type,
            percent_done: wire.percent_done,
            total_files: wire.total_files,
            total_bytes: wire.total_bytes,
            files_done: wire.files_done,
            bytes_done: wire.bytes_done,
            snapshot_id: None,
        }),
        "summary" => Some(BackupProgress {
            message_type: wire.message_type,
            percent_done: 1.0,
            total_files: wire.total_files_processed,
            total_bytes: wire.total_bytes_processed,
            files_done: wire.total_files_processed,
            bytes_done: wire.total_bytes_processed,
            snapshot_id: wire.snapshot_id,
        }),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct SnapshotJson {
    id: String,
    time: String,
    #[serde(default)]
    hostname: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    tree: String,
    #[serde(default)]
    parent: Option<String>,
    #[serde(default)]
    paths: Vec<String>,
    #[serde(default)]
    tags: Vec<String>,
}

fn parse_snapshots(stdout: &str) -> Result<Vec<Snapshot>> {
    let stdout = stdout.trim();
    if stdout.is_empty() {
        return Ok(Vec::new());
    }
    let wire: Vec<SnapshotJson> = serde_json::from_str(stdout)?;
    wire.into_iter()
        .map(|s| {
            let time = chrono::DateTime::parse_from_rfc3339(&s.time)
                .map_err(|e| {
                    WardenError::InvalidArgument(format!("bad snapshot time {:?}: {}", s.time, e))
                })?
                .timestamp_millis();
            Ok(Snapshot {
                id: s.id,
                unix_time_ms: time,
                hostname: s.hostname,
                username: s.username,
                tree: s.tree,
                parent: s.parent.unwrap_or_default(),
                paths: s.paths,
                tags: s.tags,
            })
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct ForgetGroupJson {
    #[serde(default)]
    remove: Option<Vec<ForgetSnapshotJson>>,
}

#[derive(Debug, Deserialize)]
struct ForgetSnapshotJson {
    id: String,
}

fn parse_forget_output(stdout: &str) -> Result<Vec<String>> {
    let stdout = stdout.trim();
    if stdout.is_empty() {
        return Ok(Vec::new());
    }
    let groups: Vec<ForgetGroupJson> = serde_json::from_str(stdout)?;
    Ok(groups
        .into_iter()
        .flat_map(|g| g.remove.unwrap_or_default())
        .map(|s| s.id)
        .collect())
}

#[derive(Debug, Deserialize)]
struct LsEntryJson {
    #[serde(default)]
    name: String,
    #[serde(default)]
    path: String,
    #[serde(rename = "type", default)]
    entry_type: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    mtime: Option<String>,
    #[serde(default)]
    struct_type: Option<String>,
}

fn parse_ls_output(stdout: &str) -> Result<Vec<FileEntry>> {
    let mut entries = Vec::new();
    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() || !line.starts_with('{') {
            continue;
        }
        let wire: LsEntryJson = match serde_json::from_str(line) {
            Ok(wire) => wire,
            Err(_) => continue,
        };
        // The first line is the snapshot header, not a file node.
        if wire.struct_type.as_deref() == Some("snapshot") || wire.path.is_empty() {
            continue;
        }
        let unix_time_ms = wire
            .mtime
            .as_deref()
            .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.timestamp_millis())
            .unwrap_or_default();
        entries.push(FileEntry {
            name: wire.name,
            path: wire.path,
            entry_type: wire.entry_type,
            size: wire.size,
            unix_time_ms,
        });
    }
    Ok(entries)
}

#[derive(Debug, Deserialize)]
struct StatsJson {
    #[serde(default)]
    total_size: u64,
    #[serde(default)]
    total_file_count: u64,
    #[serde(default)]
    snapshots_count: u64,
    #[serde(default)]
    compression_ratio: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retention_flags_keep_last_wins() {
        let policy = RetentionPolicy {
            keep_last: 3,
            keep_daily: 7,
            ..Default::default()
        };
        assert_eq!(retention_flags(&policy), vec!["--keep-last", "3"]);
    }

    #[test]
    fn test_retention_flags_time_buckets() {
        let policy = RetentionPolicy {
            keep_daily: 7,
            keep_weekly: 4,
            keep_yearly: 1,
            ..Default::default()
        };
        assert_eq!(
            retention_flags(&policy),
            vec!["--keep-daily", "7", "--keep-weekly", "4", "--keep-yearly", "1"]
        );
    }

    #[test]
    fn test_parse_progress_status_line() {
        let line = r#"{"message_type":"status","percent_done":0.25,"total_files":10,"files_done":2,"total_bytes":4096,"bytes_done":1024}"#;
        let entry = parse_progress_line(line).unwrap();
        assert_eq!(entry.message_type, "status");
        assert_eq!(entry.files_done, 2);
        assert!(entry.snapshot_id.is_none());
    }

    #[test]
    fn test_parse_progress_summary_line() {
        let line = r#"{"message_type":"summary","total_files_processed":10,"total_bytes_processed":4096,"snapshot_id":"abc123"}"#;
        let entry = parse_progress_line(line).unwrap();
        assert!(entry.is_summary());
        assert_eq!(entry.total_files, 10);
        assert_eq!(entry.snapshot_id.as_deref(), Some("abc123"));
    }

    #[test]
    fn test_parse_progress_ignores_noise() {
        assert!(parse_progress_line("").is_none());
        assert!(parse_progress_line("repository opened").is_none());
        assert!(parse_progress_line(r#"{"message_type":"verbose_status"}"#).is_none());
    }

    #[test]
    fn test_parse_snapshots() {
        let json = r#"[{"id":"abc","time":"2024-01-01T00:00:00Z","hostname":"box","paths":["/data"],"tags":["plan:p1"]}]"#;
        let snapshots = parse_snapshots(json).unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].id, "abc");
        assert_eq!(snapshots[0].unix_time_ms, 1_704_067_200_000);
    }

    #[test]
    fn test_parse_snapshots_empty() {
        assert!(parse_snapshots("").unwrap().is_empty());
        assert!(parse_snapshots("null").is_err());
    }

    #[test]
    fn test_parse_forget_output() {
        let json = r#"[{"keep":[{"id":"k1"}],"remove":[{"id":"r1"},{"id":"r2"}]},{"remove":null}]"#;
        assert_eq!(parse_forget_output(json).unwrap(), vec!["r1", "r2"]);
    }

    #[test]
    fn test_parse_ls_skips_snapshot_header() {
        let out = concat!(
            r#"{"struct_type":"snapshot","id":"abc","time":"2024-01-01T00:00:00Z"}"#,
            "\n",
            r#"{"name":"docs","type":"dir","path":"/docs","struct_type":"node"}"#,
            "\n",
            r#"{"name":"a.txt","type":"file","path":"/docs/a.txt","size":12,"mtime":"2024-01-01T00:00:00Z","struct_type":"node"}"#,
        );
        let entries = parse_ls_output(out).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].name, "a.txt");
        assert_eq!(entries[1].size, 12);
    }
}
