//! Error types for docql.
//!
//! All errors in docql are strongly typed using thiserror.
//! Every error is `Clone` because a single failed live-query run is handed
//! to every listener registered on the query.

use thiserror::Error;

use crate::storage::StorageError;

/// Errors reported while compiling query text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}{}", .offset.map(|o| format!(" (at byte {o})")).unwrap_or_default())]
pub struct CompileError {
    /// Human-readable description of the problem.
    pub message: String,
    /// Approximate byte offset into the query text, when known.
    pub offset: Option<usize>,
}

impl CompileError {
    /// Creates a compile error at a known byte offset.
    #[must_use]
    pub fn at(offset: usize, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            offset: Some(offset),
        }
    }

    /// Creates a compile error whose position is not known.
    #[must_use]
    pub fn unknown(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            offset: None,
        }
    }
}

/// Execution errors that occur while running a compiled query.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecutionError {
    #[error("Collection not found: {name}")]
    CollectionNotFound {
        name: String,
    },

    #[error("Invalid {clause} value: {reason}")]
    InvalidClause {
        clause: &'static str,
        reason: String,
    },

    #[error("Storage error: {message}")]
    Storage {
        message: String,
    },

    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Channel disconnected: {path}")]
    Disconnected {
        path: String,
    },

    #[error("Background worker could not be started: {reason}")]
    WorkerUnavailable {
        reason: String,
    },
}

/// Errors raised by the index manager.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IndexError {
    #[error("Index name cannot be empty")]
    EmptyName,

    #[error("Invalid index spec for '{name}': {reason}")]
    InvalidSpec {
        name: String,
        reason: String,
    },

    #[error("Index catalog error: {message}")]
    Catalog {
        message: String,
    },
}

/// Top-level error type for docql.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DocqlError {
    #[error("Compile error: {0}")]
    Compile(#[from] CompileError),

    #[error("Parameter error: {reason}")]
    Parameter {
        reason: String,
    },

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl From<StorageError> for DocqlError {
    fn from(err: StorageError) -> Self {
        Self::Execution(ExecutionError::Storage {
            message: err.to_string(),
        })
    }
}

impl DocqlError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates a parameter error.
    #[must_use]
    pub fn parameter(reason: impl Into<String>) -> Self {
        Self::Parameter {
            reason: reason.into(),
        }
    }

    /// Returns true if this is a compile error.
    #[must_use]
    pub const fn is_compile(&self) -> bool {
        matches!(self, Self::Compile(_))
    }

    /// Returns true if this is a parameter error.
    #[must_use]
    pub const fn is_parameter(&self) -> bool {
        matches!(self, Self::Parameter { .. })
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if this is an index error.
    #[must_use]
    pub const fn is_index(&self) -> bool {
        matches!(self, Self::Index(_))
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// Byte offset of a compile error, if this is one and the offset is known.
    #[must_use]
    pub fn error_offset(&self) -> Option<usize> {
        match self {
            Self::Compile(e) => e.offset,
            _ => None,
        }
    }
}

/// Result type alias for docql operations.
pub type DocqlResult<T> = Result<T, DocqlError>;
