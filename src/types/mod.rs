//! Shared identifiers and the crate error type.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

/// Microseconds since the Unix epoch.
pub type Timestamp = i64;

/// Identifier handed out by the engine for an open table.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct TableId(pub u32);

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors raised by the storage core.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// A file system operation failed.
    #[error("storage I/O failed during {op} on {}: {source}", path.display())]
    StorageIo {
        /// Operation that failed (`open`, `truncate`, `map`, `rename`, ...).
        op: &'static str,
        /// Path the operation targeted.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// The OS refused to map more memory.
    #[error("out of memory mapping {len} bytes of {}", path.display())]
    OutOfMemory {
        /// File being mapped.
        path: PathBuf,
        /// Requested mapping length.
        len: usize,
    },
    /// A pipeline stage failed while processing a job item.
    #[error("{stage} job failed: {message}")]
    JobExecution {
        /// Stage name (`sort`, `partition`, `open_column`, `copy`, `commit`).
        stage: &'static str,
        /// Human readable cause chain.
        message: String,
    },
    /// Post-merge verification failed; nothing was published.
    #[error("consistency violation: {0}")]
    ConsistencyViolation(String),
    /// Caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    Invalid(String),
    /// A named entity does not exist.
    #[error("{0} not found")]
    NotFound(String),
    /// Metadata could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The table rejected rows older than its committed maximum.
    #[error("table {0} does not accept out-of-order rows")]
    OutOfOrderDisabled(String),
    /// A commit reached `_txn` but its files could not all be put in place;
    /// the table must be reopened so recovery can finish the job.
    #[error("table {table} must be reopened before further use: {reason}")]
    NeedsRecovery {
        /// Table name.
        table: String,
        /// What was left unfinished.
        reason: String,
    },
    /// The resource was already closed.
    #[error("{0} is closed")]
    Closed(&'static str),
    /// Plain I/O error without path context.
    #[error("IO: {0}")]
    Io(#[from] io::Error),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    /// Wraps an I/O error with the operation and path it came from.
    pub fn storage_io(op: &'static str, path: impl AsRef<Path>, source: io::Error) -> Self {
        StoreError::StorageIo {
            op,
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Classifies a failed mapping: resource exhaustion becomes [`StoreError::OutOfMemory`].
    pub fn map_failed(path: impl AsRef<Path>, len: usize, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::OutOfMemory {
            StoreError::OutOfMemory {
                path: path.as_ref().to_path_buf(),
                len,
            }
        } else {
            StoreError::storage_io("map", path, source)
        }
    }

    /// Builds a [`StoreError::JobExecution`] whose message carries this error's cause chain.
    pub fn into_job_failure(self, stage: &'static str) -> StoreError {
        match self {
            already @ StoreError::JobExecution { .. } => already,
            other => StoreError::JobExecution {
                stage,
                message: cause_chain(&other),
            },
        }
    }
}

/// Renders an error and all of its sources as `outer: inner: ...`.
pub fn cause_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        let text = inner.to_string();
        if !out.contains(&text) {
            out.push_str(": ");
            out.push_str(&text);
        }
        source = inner.source();
    }
    out
}

/// Duplicates an error so one failure can be reported to several observers.
pub fn clone_error(err: &StoreError) -> StoreError {
    fn clone_io(err: &io::Error) -> io::Error {
        io::Error::new(err.kind(), err.to_string())
    }
    match err {
        StoreError::StorageIo { op, path, source } => StoreError::StorageIo {
            op,
            path: path.clone(),
            source: clone_io(source),
        },
        StoreError::OutOfMemory { path, len } => StoreError::OutOfMemory {
            path: path.clone(),
            len: *len,
        },
        StoreError::JobExecution { stage, message } => StoreError::JobExecution {
            stage,
            message: message.clone(),
        },
        StoreError::ConsistencyViolation(msg) => StoreError::ConsistencyViolation(msg.clone()),
        StoreError::Invalid(msg) => StoreError::Invalid(msg.clone()),
        StoreError::NotFound(msg) => StoreError::NotFound(msg.clone()),
        StoreError::Serialization(msg) => StoreError::Serialization(msg.clone()),
        StoreError::OutOfOrderDisabled(table) => StoreError::OutOfOrderDisabled(table.clone()),
        StoreError::NeedsRecovery { table, reason } => StoreError::NeedsRecovery {
            table: table.clone(),
            reason: reason.clone(),
        },
        StoreError::Closed(what) => StoreError::Closed(what),
        StoreError::Io(source) => StoreError::Io(clone_io(source)),
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}
