//! Error handling module for vault-migrations
//!
//! Provides centralized error handling with proper error types using thiserror.
//! Store failures keep their own type so the executor can retry them without
//! caring what went wrong on the wire.

use std::path::PathBuf;
use thiserror::Error;

/// Failure of a single call against the remote store.
///
/// These are opaque to the engine: every variant is retried the same way.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Connection, TLS or timeout problems
    #[error("transport error: {0}")]
    Transport(String),

    /// The server answered with a non-success status
    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },

    /// The response body was not what the store contract promises
    #[error("malformed response: {0}")]
    Decode(String),

    /// Failure injected by the in-memory store
    #[error("injected failure at {0}")]
    Injected(String),
}

/// Main error type for vault-migrations
#[derive(Error, Debug)]
pub enum MigrationError {
    /// Malformed or missing configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// A change-set, schema, snapshot or cursor document could not be parsed
    #[error("Parse error in {}: {reason}", path.display())]
    Parse { path: PathBuf, reason: String },

    /// Two change-set files claim the same version
    #[error(
        "Duplicate migration version {version}: {} and {}",
        first.display(),
        second.display()
    )]
    DuplicateVersion {
        version: u64,
        first: PathBuf,
        second: PathBuf,
    },

    /// A store call failed after all retries
    #[error("Store error at {path}{}: {source}", version.map(|v| format!(" (version {v})")).unwrap_or_default())]
    Store {
        version: Option<u64>,
        path: String,
        #[source]
        source: StoreError,
    },

    /// A task unit died before reporting (panic or abort)
    #[error("Task at {path}{} aborted: {reason}", version.map(|v| format!(" (version {v})")).unwrap_or_default())]
    TaskAborted {
        version: Option<u64>,
        path: String,
        reason: String,
    },

    /// The shared cancellation token fired
    #[error("Operation cancelled")]
    Cancelled,

    /// A change-set or task violates a structural or path-policy rule
    #[error("Validation error: {0}")]
    Validation(String),

    /// IO errors (reading directories, writing generated files)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for vault-migrations operations
pub type Result<T> = std::result::Result<T, MigrationError>;

// Convenient error constructors
impl MigrationError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a parse error for the document at `path`
    pub fn parse(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Parse {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a store error for a call outside any change-set (cursor, observe)
    pub fn store(path: impl Into<String>, source: StoreError) -> Self {
        Self::Store {
            version: None,
            path: path.into(),
            source,
        }
    }

    /// Attach the change-set version to a store error that lacks one
    pub fn in_version(self, version: u64) -> Self {
        match self {
            Self::Store {
                version: None,
                path,
                source,
            } => Self::Store {
                version: Some(version),
                path,
                source,
            },
            Self::TaskAborted {
                version: None,
                path,
                reason,
            } => Self::TaskAborted {
                version: Some(version),
                path,
                reason,
            },
            other => other,
        }
    }

    /// True for errors caused by the cancellation token
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
