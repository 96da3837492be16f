//! Error types for linkflow.
//!
//! Library crates use [`LinkflowError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! A lost optimistic-claim race is not an error: conditional writes report
//! whether they applied and callers simply move on.

use std::path::PathBuf;

/// Top-level error type for all linkflow operations.
#[derive(Debug, thiserror::Error)]
pub enum LinkflowError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Input validation error (bad identity key, unparseable status, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// A state change that is not an edge of the pipeline state graph.
    #[error("illegal transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    /// Referenced work item does not exist.
    #[error("work item not found: {item}")]
    NotFound { item: String },

    /// An operator write kept losing to concurrent writers.
    #[error("work item {item} was modified concurrently, retry")]
    Conflict { item: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, LinkflowError>;

impl LinkflowError {
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

    /// Create an illegal-transition error for the given endpoints.
    pub fn illegal_transition(from: impl ToString, to: impl ToString) -> Self {
        Self::IllegalTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Create a not-found error for an item reference.
    pub fn not_found(item: impl Into<String>) -> Self {
        Self::NotFound { item: item.into() }
    }

    /// Create a conflict error for an item reference.
    pub fn conflict(item: impl Into<String>) -> Self {
        Self::Conflict { item: item.into() }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = LinkflowError::config("missing database path");
        assert_eq!(err.to_string(), "config error: missing database path");

        let err = LinkflowError::illegal_transition("new", "extracted");
        assert_eq!(err.to_string(), "illegal transition: new -> extracted");

        let err = LinkflowError::not_found("k1");
        assert!(err.to_string().contains("k1"));
    }
}
