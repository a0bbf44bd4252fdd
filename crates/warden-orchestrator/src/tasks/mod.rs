//! Task implementations
//!
//! One module per workflow. Backup is the only cron-recurring task; the rest
//! fire once at a fixed instant, enqueued either by a backup's follow-up
//! scheduling or by a service trigger.

mod backup;
mod forget;
mod index;
mod prune;
mod restore;
mod stats;

pub use backup::BackupTask;
pub use forget::ForgetTask;
pub use index::IndexSnapshotsTask;
pub use prune::PruneTask;
pub use restore::RestoreTask;
pub use stats::{CheckTask, StatsTask};

use chrono::{DateTime, Utc};
use std::sync::Mutex;

/// One-shot firing slot: `next` takes the instant exactly once.
pub(crate) struct OneShot(Mutex<Option<DateTime<Utc>>>);

impl OneShot {
    pub fn at(at: DateTime<Utc>) -> Self {
        Self(Mutex::new(Some(at)))
    }

    pub fn take(&self) -> Option<DateTime<Utc>> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}
