//! Unified error types for warden

use thiserror::Error;

/// How many bytes of subprocess output are kept on failure.
const OUTPUT_TAIL_LIMIT: usize = 500;

/// Unified error type for all warden operations
#[derive(Error, Debug)]
pub enum WardenError {
    /// The requested entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An operation status update that would move backwards in the lifecycle.
    #[error("illegal status transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Signature verification failure on a signed download path.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Retryable storage failure. Callers may back off and try again.
    #[error("transient storage error: {0}")]
    Transient(String),

    /// The backup subprocess exited unsuccessfully.
    #[error("subprocess failed ({}): {output_tail}", .exit_code.map(|c| c.to_string()).unwrap_or_else(|| "killed".to_string()))]
    SubprocessFailed {
        exit_code: Option<i32>,
        output_tail: String,
    },

    #[error("operation cancelled")]
    Cancelled,

    /// Unrecoverable storage corruption. The log refuses further writes.
    #[error("corrupt operation log: {0}")]
    Corrupt(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias using WardenError
pub type Result<T> = std::result::Result<T, WardenError>;

impl WardenError {
    /// Build a `SubprocessFailed` from raw output, keeping at most 500 bytes.
    /// Longer output is split into the first 250 and last 250 bytes.
    pub fn subprocess_failed(exit_code: Option<i32>, output: &str) -> Self {
        Self::SubprocessFailed {
            exit_code,
            output_tail: truncate_output(output, OUTPUT_TAIL_LIMIT),
        }
    }

    /// Whether the caller may retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Keep at most `limit` bytes of `output`, splitting half/half around an
/// elision marker when the input is longer.
pub fn truncate_output(output: &str, limit: usize) -> String {
    let bytes = output.as_bytes();
    if bytes.len() <= limit {
        return output.to_string();
    }
    let half = limit / 2;
    let head = String::from_utf8_lossy(&bytes[..half]);
    let tail = String::from_utf8_lossy(&bytes[bytes.len() - half..]);
    format!("{}\n[...]\n{}", head, tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_output_short_passthrough() {
        assert_eq!(truncate_output("hello", 500), "hello");
    }

    #[test]
    fn test_truncate_output_splits_long_output() {
        let long = "a".repeat(300) + &"b".repeat(300);
        let truncated = truncate_output(&long, 500);
        assert!(truncated.starts_with(&"a".repeat(250)));
        assert!(truncated.ends_with(&"b".repeat(250)));
        assert!(truncated.contains("[...]"));
    }

    #[test]
    fn test_subprocess_failed_display() {
        let err = WardenError::subprocess_failed(Some(1), "Fatal: wrong password");
        let msg = err.to_string();
        assert!(msg.contains("1"));
        assert!(msg.contains("wrong password"));

        let killed = WardenError::subprocess_failed(None, "");
        assert!(killed.to_string().contains("killed"));
    }

    #[test]
    fn test_is_retryable() {
        assert!(WardenError::Transient("lock held".to_string()).is_retryable());
        assert!(!WardenError::Corrupt("bad magic".to_string()).is_retryable());
    }
}
