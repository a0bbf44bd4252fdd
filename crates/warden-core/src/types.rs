//! Core type definitions for warden operations

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of an operation row.
///
/// Transitions are monotone: `Pending -> InProgress -> terminal`. Terminal
/// rows never change status again; the operation log enforces this on every
/// update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    #[default]
    Pending,
    InProgress,
    Success,
    Warning,
    Error,
    UserCancelled,
    SystemCancelled,
}

impl OperationStatus {
    /// Whether this status ends the operation lifecycle.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::InProgress)
    }

    /// Whether a row may move from `self` to `next`.
    ///
    /// Same-status rewrites are allowed: a running operation updates its
    /// payload with progress, and a terminal row may backfill its log ref.
    pub fn can_transition_to(self, next: OperationStatus) -> bool {
        if self == next {
            return true;
        }
        match self {
            Self::Pending => true,
            Self::InProgress => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Success => write!(f, "success"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
            Self::UserCancelled => write!(f, "user_cancelled"),
            Self::SystemCancelled => write!(f, "system_cancelled"),
        }
    }
}

impl std::str::FromStr for OperationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "in_progress" | "inprogress" => Ok(Self::InProgress),
            "success" => Ok(Self::Success),
            "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "user_cancelled" => Ok(Self::UserCancelled),
            "system_cancelled" => Ok(Self::SystemCancelled),
            _ => Err(format!("Invalid operation status: {}", s)),
        }
    }
}

/// One attempted unit of backup-engine work.
///
/// Rows are owned by the operation log; everything else holds them by id.
/// `id` is assigned on insert and is strictly increasing with insertion
/// order. `flow_id` groups causally related operations (a backup and the
/// forget/index work it triggers).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Assigned by the operation log on insert. Zero means unassigned.
    #[serde(default)]
    pub id: i64,

    /// Groups related operations. Zero means no flow.
    #[serde(default)]
    pub flow_id: i64,

    pub repo_id: String,

    /// Empty for repo-scoped work (prune, stats).
    #[serde(default)]
    pub plan_id: String,

    /// Empty until the work produces or targets a snapshot.
    #[serde(default)]
    pub snapshot_id: String,

    #[serde(default)]
    pub unix_time_start_ms: i64,

    /// Set on the terminal transition. Zero until then.
    #[serde(default)]
    pub unix_time_end_ms: i64,

    #[serde(default)]
    pub status: OperationStatus,

    pub kind: OperationKind,

    /// Opaque handle to a log blob holding full subprocess output.
    #[serde(default)]
    pub log_ref: String,

    /// Error message attached on ERROR/WARNING terminal states.
    #[serde(default)]
    pub error: String,
}

impl Operation {
    /// Shorthand for a fresh row in the default (pending) state.
    pub fn new(repo_id: impl Into<String>, plan_id: impl Into<String>, kind: OperationKind) -> Self {
        Self {
            id: 0,
            flow_id: 0,
            repo_id: repo_id.into(),
            plan_id: plan_id.into(),
            snapshot_id: String::new(),
            unix_time_start_ms: 0,
            unix_time_end_ms: 0,
            status: OperationStatus::Pending,
            kind,
            log_ref: String::new(),
            error: String::new(),
        }
    }
}

/// Tagged payload carried by an operation row.
///
/// Dispatch is by tag; each variant carries the telemetry specific to its
/// workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationKind {
    Backup {
        /// Most recent progress entry; the final summary always lands here.
        #[serde(default)]
        last_status: Option<BackupProgress>,
    },
    Forget {
        /// Snapshot ids removed by this forget run.
        #[serde(default)]
        forgotten: Vec<String>,
    },
    Prune {
        /// Verbatim text output (restic prune emits no JSON).
        #[serde(default)]
        output: String,
    },
    Restore {
        snapshot_id: String,
        /// Path within the snapshot being restored.
        path: String,
        /// Directory the restored files are assembled in.
        target: String,
    },
    IndexSnapshot {
        snapshot: Snapshot,
    },
    Stats {
        #[serde(default)]
        stats: Option<RepoStats>,
    },
    Check {
        #[serde(default)]
        output: String,
    },
}

impl OperationKind {
    /// Stable tag name, used in task keys and log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Backup { .. } => "backup",
            Self::Forget { .. } => "forget",
            Self::Prune { .. } => "prune",
            Self::Restore { .. } => "restore",
            Self::IndexSnapshot { .. } => "index_snapshot",
            Self::Stats { .. } => "stats",
            Self::Check { .. } => "check",
        }
    }
}

/// A snapshot as reported by the backup engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub unix_time_ms: i64,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub tree: String,
    #[serde(default)]
    pub parent: String,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// One progress entry from a running backup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackupProgress {
    /// "status" while running, "summary" for the final entry.
    #[serde(default)]
    pub message_type: String,
    #[serde(default)]
    pub percent_done: f64,
    #[serde(default)]
    pub total_files: u64,
    #[serde(default)]
    pub total_bytes: u64,
    #[serde(default)]
    pub files_done: u64,
    #[serde(default)]
    pub bytes_done: u64,
    /// Set on the summary entry only.
    #[serde(default)]
    pub snapshot_id: Option<String>,
}

impl BackupProgress {
    pub fn is_summary(&self) -> bool {
        self.message_type == "summary"
    }
}

/// Repository statistics summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepoStats {
    #[serde(default)]
    pub total_size: u64,
    #[serde(default)]
    pub total_file_count: u64,
    #[serde(default)]
    pub snapshot_count: u64,
    #[serde(default)]
    pub compression_ratio: f64,
}

/// One file or directory entry inside a snapshot listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    /// "file" or "dir".
    #[serde(rename = "type", default)]
    pub entry_type: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub unix_time_ms: i64,
}

/// Convert a chrono instant to unix milliseconds.
pub fn time_to_unix_ms(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

/// Convert unix milliseconds back to a chrono instant.
pub fn unix_ms_to_time(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}
