//! Configuration management for warden
//!
//! User intent lives in `warden.toml`: the repositories to back up into and
//! the plans describing what to back up, when, and how long to keep it. The
//! core treats this as read-only and replaces it atomically on reload.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::{Result, WardenError};

/// Top-level configuration, loaded from `warden.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub repos: Vec<Repo>,

    #[serde(default)]
    pub plans: Vec<Plan>,
}

/// A restic-compatible repository target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Repo {
    /// Unique identifier referenced by plans.
    pub id: String,

    /// Repository URI (local path, sftp:, s3:, rest: ...).
    pub uri: String,

    /// Environment variables passed to the subprocess (credentials).
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Extra flags appended to every invocation against this repo.
    #[serde(default)]
    pub flags: Vec<String>,
}

/// A user-declared backup plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Unique identifier.
    pub id: String,

    /// Id of the repo this plan backs up into.
    pub repo: String,

    /// Paths included in the backup.
    pub paths: Vec<String>,

    /// Exclude patterns.
    #[serde(default)]
    pub excludes: Vec<String>,

    /// Cron expression for scheduled firing.
    pub cron: String,

    /// Snapshot retention. None disables the post-backup forget pass.
    #[serde(default)]
    pub retention: Option<RetentionPolicy>,

    /// Prune policy for the plan's repo.
    #[serde(default)]
    pub prune: Option<PrunePolicy>,

    /// Hook scripts run by an external hook runner around backup phases.
    #[serde(default)]
    pub hooks: Vec<Hook>,
}

/// Which snapshots a forget pass keeps.
///
/// `keep_last` wins when non-zero; otherwise the time-bucketed fields apply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    #[serde(default)]
    pub keep_last: u32,
    #[serde(default)]
    pub keep_hourly: u32,
    #[serde(default)]
    pub keep_daily: u32,
    #[serde(default)]
    pub keep_weekly: u32,
    #[serde(default)]
    pub keep_monthly: u32,
    #[serde(default)]
    pub keep_yearly: u32,
}

impl RetentionPolicy {
    /// A policy with every field zero would forget nothing; treat it as unset.
    pub fn is_empty(&self) -> bool {
        self.keep_last == 0
            && self.keep_hourly == 0
            && self.keep_daily == 0
            && self.keep_weekly == 0
            && self.keep_monthly == 0
            && self.keep_yearly == 0
    }
}

/// Limits on how often and how aggressively a repo is pruned.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrunePolicy {
    /// Skip the prune if the last successful one is newer than this.
    #[serde(default)]
    pub max_frequency_days: u32,

    /// Tolerated unused data before repacking, in percent.
    #[serde(default)]
    pub max_unused_percent: f64,
}

/// A hook command with its failure policy. Executed by an external runner
/// subscribed to phase events; the core only stores the declaration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hook {
    pub command: String,

    #[serde(default)]
    pub on_error: HookErrorPolicy,
}

/// What a hook failure does to the surrounding operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookErrorPolicy {
    #[default]
    Ignore,
    Warn,
    Cancel,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| WardenError::Config(format!("failed to parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration, falling back to an empty default when the file
    /// does not exist yet.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Write the configuration out as pretty TOML.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| WardenError::Config(format!("failed to serialize config: {}", e)))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn repo(&self, id: &str) -> Option<&Repo> {
        self.repos.iter().find(|r| r.id == id)
    }

    pub fn plan(&self, id: &str) -> Option<&Plan> {
        self.plans.iter().find(|p| p.id == id)
    }

    /// Check referential integrity: unique ids, plans pointing at known
    /// repos, non-empty schedules and path sets.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for repo in &self.repos {
            if repo.id.is_empty() {
                return Err(WardenError::Config("repo with empty id".to_string()));
            }
            if !seen.insert(&repo.id) {
                return Err(WardenError::Config(format!("duplicate repo id {:?}", repo.id)));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for plan in &self.plans {
            if plan.id.is_empty() {
                return Err(WardenError::Config("plan with empty id".to_string()));
            }
            if !seen.insert(&plan.id) {
                return Err(WardenError::Config(format!("duplicate plan id {:?}", plan.id)));
            }
            if self.repo(&plan.repo).is_none() {
                return Err(WardenError::Config(format!(
                    "plan {:?} references unknown repo {:?}",
                    plan.id, plan.repo
                )));
            }
            if plan.cron.is_empty() {
                return Err(WardenError::Config(format!("plan {:?} has no schedule", plan.id)));
            }
            if plan.paths.is_empty() {
                return Err(WardenError::Config(format!("plan {:?} has no paths", plan.id)));
            }
        }
        Ok(())
    }
}
