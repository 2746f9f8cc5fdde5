//! Error types for Librarian.
//!
//! Library crates use [`LibrarianError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all Librarian operations.
#[derive(Debug, thiserror::Error)]
pub enum LibrarianError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Malformed input; rejected before anything is enqueued.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// An id that does not resolve to a stored record.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A content processing task is already active for the file.
    #[error("file {file_id} is already being processed")]
    AlreadyProcessing { file_id: String },

    /// The crawler has an open run.
    #[error("crawler {crawler_id} is already running")]
    AlreadyRunning { crawler_id: String },

    /// An external call or phase exceeded its time budget.
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Work was cancelled by a user request.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// An extraction method failed to convert a file.
    #[error("extraction error: {0}")]
    Extraction(String),

    /// The embedding provider failed.
    #[error("embedding error: {0}")]
    Embedding(String),

    /// Language model or retrieval failure while computing a field value.
    #[error("enrichment error: {0}")]
    Enrichment(String),

    /// Network/HTTP error during crawl or provider calls.
    #[error("network error: {0}")]
    Network(String),

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, LibrarianError>;

impl LibrarianError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Rejected because of a concurrent activity on the same entity.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::AlreadyProcessing { .. } | Self::AlreadyRunning { .. }
        )
    }

    /// Failures an operator may retry explicitly. Validation and conflicts are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::Extraction(_)
                | Self::Embedding(_)
                | Self::Enrichment(_)
                | Self::Network(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = LibrarianError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = LibrarianError::not_found("crawler", "c-1");
        assert_eq!(err.to_string(), "crawler not found: c-1");

        let err = LibrarianError::timeout("extraction", 500);
        assert!(err.to_string().contains("500ms"));
    }

    #[test]
    fn classification() {
        let conflict = LibrarianError::AlreadyRunning {
            crawler_id: "c".into(),
        };
        assert!(conflict.is_conflict());
        assert!(!conflict.is_retryable());

        assert!(LibrarianError::timeout("embedding", 1).is_retryable());
        assert!(!LibrarianError::validation("bad").is_retryable());
    }
}
