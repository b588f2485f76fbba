// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Common error shape shared by every pool and adapter.
//!
//! Not-found and optimistic-concurrency failures are *not* errors: the first
//! yields zero rows, the second `affected_rows = 0`. Everything else lands
//! here, tagged with enough information for a caller to tell a transient
//! backend hiccup from a permanent failure.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DbError>;

#[derive(Error, Debug, Clone)]
pub enum DbError {
    /// Every client is checked out and the wait queue is at `max_queue`.
    #[error("pool '{pool}' queue is full ({waiting} waiting)")]
    QueueFull { pool: String, waiting: usize },

    #[error("timed out waiting for a client from pool '{pool}'")]
    AcquireTimeout { pool: String },

    /// Native connect failure.
    #[error("failed to connect to {backend}: {message}")]
    Connect { backend: String, message: String },

    /// A lookup required by `must_exist` found nothing.
    #[error("invalid id for table '{table}'")]
    InvalidId { table: String },

    #[error("record already exists in '{table}'")]
    AlreadyExists { table: String },

    /// Native protocol/backend error after `convert_error`.
    #[error("{backend} error{}: {message}", code_suffix(.code))]
    Backend {
        backend: String,
        code: Option<String>,
        message: String,
        transient: bool,
    },

    /// Rejected before any native call was issued.
    #[error("invalid request: {0}")]
    InvalidInput(String),

    #[error("{op} is not supported by {backend}")]
    Unsupported { backend: String, op: String },

    #[error("cache error: {0}")]
    Cache(String),
}

fn code_suffix(code: &Option<String>) -> String {
    code.as_deref().map(|c| format!(" [{c}]")).unwrap_or_default()
}

impl DbError {
    /// Shorthand for a permanent backend error without a native code.
    pub fn backend(backend: impl Into<String>, message: impl ToString) -> Self {
        Self::Backend {
            backend: backend.into(),
            code: None,
            message: message.to_string(),
            transient: false,
        }
    }

    /// Backend error carrying the native status/code.
    pub fn backend_code(
        backend: impl Into<String>,
        code: impl ToString,
        message: impl ToString,
        transient: bool,
    ) -> Self {
        Self::Backend {
            backend: backend.into(),
            code: Some(code.to_string()),
            message: message.to_string(),
            transient,
        }
    }

    pub fn connect(backend: impl Into<String>, message: impl ToString) -> Self {
        Self::Connect {
            backend: backend.into(),
            message: message.to_string(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Whether retrying the same call later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::QueueFull { .. } | Self::AcquireTimeout { .. } | Self::Connect { .. } => true,
            Self::Backend { transient, .. } => *transient,
            Self::Cache(_) => true,
            _ => false,
        }
    }

    /// Errors after which the client that produced them must not be reused.
    #[must_use]
    pub fn is_connection(&self) -> bool {
        match self {
            Self::Connect { .. } => true,
            Self::Backend { transient, .. } => *transient,
            _ => false,
        }
    }

    /// Label used for the `error_type` metric.
    #[must_use]
    pub fn class(&self) -> &'static str {
        match self {
            Self::QueueFull { .. } => "queue_full",
            Self::AcquireTimeout { .. } => "timeout",
            Self::Connect { .. } => "connect",
            Self::InvalidId { .. } => "invalid_id",
            Self::AlreadyExists { .. } => "exists",
            Self::Backend { .. } => "backend",
            Self::InvalidInput(_) => "input",
            Self::Unsupported { .. } => "unsupported",
            Self::Cache(_) => "cache",
        }
    }

    /// Native code attached by `convert_error`, if any.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Backend { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_display_includes_code() {
        let err = DbError::backend_code("redis", "BUSY", "script running", true);
        assert_eq!(err.to_string(), "redis error [BUSY]: script running");
        assert_eq!(err.code(), Some("BUSY"));
        assert!(err.is_transient());
    }

    #[test]
    fn test_backend_error_without_code() {
        let err = DbError::backend("sql", "syntax error");
        assert_eq!(err.to_string(), "sql error: syntax error");
        assert!(!err.is_transient());
        assert!(!err.is_connection());
    }

    #[test]
    fn test_classification() {
        let full = DbError::QueueFull { pool: "p".into(), waiting: 3 };
        assert!(full.is_transient());
        assert!(!full.is_connection());
        assert_eq!(full.class(), "queue_full");

        let input = DbError::invalid("missing key id");
        assert!(!input.is_transient());
        assert_eq!(input.class(), "input");

        assert!(DbError::connect("riak", "refused").is_connection());
    }
}
