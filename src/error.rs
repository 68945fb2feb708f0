//! Error taxonomy for the import engine.
//!
//! Only run-level failures ([`ImportError::Parse`], [`ImportError::SchemaConflict`] and a terminal
//! [`ImportError::Connection`]) reach the caller. Row and batch failures are recorded as
//! rejected outcomes in the [`crate::report::ImportReport`] instead.

use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("Failed to parse {path:?}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("Schema conflict on '{column}': {reason}")]
    SchemaConflict { column: String, reason: String },

    #[error("type mismatch: {value}, {column}")]
    RowCoercion { value: String, column: String },

    #[error("Batch {batch} failed after {attempts} attempt(s): {reason}")]
    BatchWrite {
        batch: usize,
        attempts: usize,
        reason: String,
    },

    #[error("Database connection failed: {0}. Check the connection settings and retry the import later")]
    Connection(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type ImportResult<T> = std::result::Result<T, ImportError>;

impl ImportError {
    pub fn parse(path: &Path, reason: impl Into<String>) -> Self {
        ImportError::Parse {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    pub fn conflict(column: impl Into<String>, reason: impl Into<String>) -> Self {
        ImportError::SchemaConflict {
            column: column.into(),
            reason: reason.into(),
        }
    }

    /// Maps a driver error raised outside of batch loading onto the run-level taxonomy.
    pub fn from_sqlx(err: sqlx::Error, context: &str) -> Self {
        if is_connection_error(&err) {
            ImportError::Connection(format!("{context}: {err}"))
        } else {
            ImportError::conflict(context, err.to_string())
        }
    }
}

/// SQLSTATE codes worth retrying: connection exceptions (class 08), serialization failure,
/// deadlock and operator intervention.
const TRANSIENT_SQLSTATES: &[&str] = &["40001", "40P01", "57P01", "57P02", "57P03"];

pub(crate) fn is_connection_error(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    )
}

pub(crate) fn is_transient(err: &sqlx::Error) -> bool {
    if is_connection_error(err) {
        return true;
    }
    match err {
        sqlx::Error::Protocol(_) => true,
        sqlx::Error::Database(db) => db
            .code()
            .map(|code| code.starts_with("08") || TRANSIENT_SQLSTATES.contains(&code.as_ref()))
            .unwrap_or(false),
        _ => false,
    }
}
