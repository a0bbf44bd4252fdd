//! Log blob storage
//!
//! Full subprocess output is too large for operation rows; it lands in one
//! file per blob under the logs directory, addressed by an opaque ref stored
//! in the row's `log_ref` field.

use std::path::{Path, PathBuf};

use warden_core::{truncate_output, Result, WardenError};

/// Maximum bytes surfaced in the UI slot; longer logs keep their first and
/// last half around an elision marker.
pub const UI_LOG_LIMIT: usize = 32 * 1024;

pub struct LogStore {
    dir: PathBuf,
}

impl LogStore {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// Write a blob and return its ref.
    pub fn put(&self, contents: &[u8]) -> Result<String> {
        let log_ref = uuid::Uuid::new_v4().to_string();
        std::fs::write(self.path_for(&log_ref)?, contents)?;
        Ok(log_ref)
    }

    /// Full blob contents.
    pub fn get(&self, log_ref: &str) -> Result<Vec<u8>> {
        let path = self.path_for(log_ref)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(WardenError::NotFound(format!("log blob {}", log_ref)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Blob contents capped for display.
    pub fn get_for_display(&self, log_ref: &str) -> Result<String> {
        let bytes = self.get(log_ref)?;
        Ok(truncate_output(&String::from_utf8_lossy(&bytes), UI_LOG_LIMIT))
    }

    fn path_for(&self, log_ref: &str) -> Result<PathBuf> {
        // Refs are uuids we minted; anything else is a traversal attempt.
        if log_ref.is_empty()
            || !log_ref
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(WardenError::InvalidArgument(format!(
                "malformed log ref {:?}",
                log_ref
            )));
        }
        Ok(self.dir.join(format!("{}.log", log_ref)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::open(dir.path()).unwrap();

        let log_ref = store.put(b"prune output here").unwrap();
        assert_eq!(store.get(&log_ref).unwrap(), b"prune output here");
    }

    #[test]
    fn test_get_missing_blob() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::open(dir.path()).unwrap();
        let missing = uuid::Uuid::new_v4().to_string();
        assert!(matches!(
            store.get(&missing),
            Err(WardenError::NotFound(_))
        ));
    }

    #[test]
    fn test_rejects_traversal_refs() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::open(dir.path()).unwrap();
        assert!(store.get("../etc/passwd").is_err());
        assert!(store.get("").is_err());
    }

    #[test]
    fn test_display_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::open(dir.path()).unwrap();

        let big = "x".repeat(UI_LOG_LIMIT * 2);
        let log_ref = store.put(big.as_bytes()).unwrap();
        let shown = store.get_for_display(&log_ref).unwrap();
        assert!(shown.len() < big.len());
        assert!(shown.contains("[...]"));
    }
}
