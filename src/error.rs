//! # Error Handling for ledgerlake
//!
//! This module defines the error types used throughout the crate. A single
//! error enum ([`Error`]) covers every failure mode of the write path, the read
//! path and startup, which keeps signatures uniform (`Result<T>`).
//!
//! Submission is the one exception: [`SubmitError`] hands the rejected batch
//! back to the caller, so a source can retry or re-buffer it without rebuilding
//! its rows.
//!
//! ## Rust Pattern: thiserror
//!
//! We use the `thiserror` crate to derive `std::error::Error` implementations:
//! - `Display` from the `#[error(...)]` attributes
//! - `From` conversions from the `#[from]` attributes
//!
//! ## Error Categories
//!
//! | Category | Examples | Typical Response |
//! |----------|----------|------------------|
//! | Backpressure | Submit timeout, queue closed | Source decides: retry, drop, exit |
//! | Batch | Malformed row, table flush failure | Delivered on the batch's result channel |
//! | Fatal | Provisioning failure, lock conflict | Stop the orchestrator |
//! | Read | Query timeout | Returned to the query caller only |

use std::time::Duration;

use thiserror::Error;

use crate::types::{LedgerRange, LedgerTable, NetworkName, WriteBatch};

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in ledgerlake operations.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Storage Errors
    // =========================================================================

    /// SQLite operation failed.
    ///
    /// Busy/locked failures on the writer connection are reclassified as
    /// [`Error::LockConflict`] by [`Error::classify`].
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Schema provisioning or catalog error.
    ///
    /// Raised at startup when schema or table creation fails. The orchestrator
    /// never starts when this happens.
    #[error("schema error: {0}")]
    Schema(String),

    /// A batch targeted a schema that was never provisioned.
    ///
    /// This is a programming error in the caller: every schema is created during
    /// orchestrator initialization, before any source runs.
    #[error("unknown schema '{schema}': not provisioned at startup")]
    UnknownSchema {
        /// The schema named by the batch
        schema: String,
    },

    /// A schema name failed identifier validation.
    #[error("invalid schema name '{name}'")]
    InvalidSchemaName {
        /// The rejected name
        name: String,
    },

    /// A row's column count does not match its table definition.
    #[error("malformed row for table '{table}': expected {expected} columns, got {actual}")]
    MalformedRow {
        /// Target table
        table: LedgerTable,
        /// Column count of the table definition
        expected: usize,
        /// Column count of the offending row
        actual: usize,
    },

    /// Appending or flushing one table of a batch failed.
    ///
    /// Tables earlier in the write order may already be committed, depending
    /// on the writer's commit mode.
    #[error("append to table '{table}' failed: {source}")]
    TableAppend {
        /// The failing table
        table: LedgerTable,
        /// What went wrong
        #[source]
        source: Box<Error>,
    },

    /// The storage engine reported that another connection holds the write lock.
    ///
    /// # When This Happens
    ///
    /// Never, under normal operation: the queue's single consumer is the only
    /// writer. If it does occur, another process opened the database file for
    /// writing. This is a fatal configuration error, not something to retry.
    #[error("single-writer lock conflict: {detail}")]
    LockConflict {
        /// Underlying engine message
        detail: String,
    },

    // =========================================================================
    // Ledger Range Errors
    // =========================================================================

    /// A ledger range with `start > end`.
    #[error("invalid ledger range: start {start} > end {end}")]
    InvalidRange {
        /// First ledger
        start: u32,
        /// Last ledger
        end: u32,
    },

    /// A batch range overlaps or regresses behind the network's previous batch.
    #[error("ledger range regression on network '{network}': batch starts at {start}, previous batch ended at {previous_end}")]
    RangeRegression {
        /// Network whose ranges regressed
        network: NetworkName,
        /// Last ledger of the previous batch
        previous_end: u32,
        /// First ledger of the rejected batch
        start: u32,
    },

    // =========================================================================
    // Queue Errors
    // =========================================================================

    /// The queue stayed full for longer than the submit timeout.
    #[error("write queue full: submit for network '{network}' timed out after {timeout:?}")]
    SubmitTimeout {
        /// Submitting network
        network: NetworkName,
        /// Configured submit timeout
        timeout: Duration,
    },

    /// The queue is shutting down and accepts no new batches.
    #[error("write queue closed: batch for network '{network}' not accepted")]
    QueueClosed {
        /// Submitting network
        network: NetworkName,
    },

    /// The consumer dropped a batch's result channel without answering.
    #[error("writer has shut down")]
    WriterShutdown,

    // =========================================================================
    // Read Path Errors
    // =========================================================================

    /// A read query exceeded the configured query timeout and was interrupted.
    #[error("query exceeded timeout of {timeout:?}")]
    QueryTimeout {
        /// Configured query timeout
        timeout: Duration,
    },

    /// A statement submitted to the read pool would modify the database.
    #[error("statement is not read-only: {sql}")]
    NotReadOnly {
        /// The rejected statement
        sql: String,
    },

    /// The read pool has been shut down.
    #[error("read pool is shut down")]
    ReadPoolClosed,

    // =========================================================================
    // Source and Configuration Errors
    // =========================================================================

    /// The upstream ledger source for a network failed.
    #[error("source for network '{network}' failed: {message}")]
    Source {
        /// Network of the failing source
        network: NetworkName,
        /// Source-specific description
        message: String,
    },

    /// Configuration is invalid or could not be parsed.
    #[error("config error: {0}")]
    Config(String),

    /// Filesystem error (resume checkpoints, WAL inspection).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Resume checkpoint (de)serialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Reclassifies SQLite busy/locked failures as [`Error::LockConflict`].
    ///
    /// Every other error passes through unchanged.
    pub fn classify(self) -> Self {
        match self {
            Error::Sqlite(ref e) if is_busy_or_locked(e) => Error::LockConflict {
                detail: e.to_string(),
            },
            other => other,
        }
    }

    /// Returns true if this error means a second writer holds the database.
    pub fn is_lock_conflict(&self) -> bool {
        match self {
            Error::LockConflict { .. } => true,
            Error::Sqlite(e) => is_busy_or_locked(e),
            Error::TableAppend { source, .. } => source.is_lock_conflict(),
            _ => false,
        }
    }
}

fn is_busy_or_locked(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
    )
}

/// Result type alias for ledgerlake operations.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Submission Errors
// =============================================================================

/// A batch the queue did not accept.
///
/// # Rust Pattern: Returning Ownership on Failure
///
/// `WriteBatch` can hold many thousands of rows. Instead of dropping it on
/// failure, the error carries it back so the caller decides what happens next
/// (`into_batch()` to retry, or drop it to abandon the range).
#[derive(Error, Debug)]
pub enum SubmitError {
    /// The queue stayed full past the submit timeout.
    #[error("write queue full: submit for network '{}' (ledgers {}) timed out after {timeout:?}", .batch.network, .batch.range)]
    Timeout {
        /// The rejected batch
        batch: Box<WriteBatch>,
        /// Configured submit timeout
        timeout: Duration,
    },

    /// The queue has been stopped.
    #[error("write queue closed: batch for network '{}' (ledgers {}) not accepted", .batch.network, .batch.range)]
    Closed {
        /// The rejected batch
        batch: Box<WriteBatch>,
    },

    /// The batch's range overlaps or regresses behind the network's last
    /// accepted batch.
    #[error("batch for network '{}' (ledgers {}) rejected: {reason}", .batch.network, .batch.range)]
    Rejected {
        /// The rejected batch
        batch: Box<WriteBatch>,
        /// Why it was refused
        #[source]
        reason: Box<Error>,
    },
}

impl SubmitError {
    /// Returns the rejected batch.
    pub fn into_batch(self) -> WriteBatch {
        match self {
            SubmitError::Timeout { batch, .. }
            | SubmitError::Closed { batch }
            | SubmitError::Rejected { batch, .. } => *batch,
        }
    }

    /// The rejected batch's ledger range.
    pub fn range(&self) -> LedgerRange {
        match self {
            SubmitError::Timeout { batch, .. }
            | SubmitError::Closed { batch }
            | SubmitError::Rejected { batch, .. } => batch.range,
        }
    }

    /// True for [`SubmitError::Timeout`].
    pub fn is_timeout(&self) -> bool {
        matches!(self, SubmitError::Timeout { .. })
    }
}

impl From<SubmitError> for Error {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::Timeout { batch, timeout } => Error::SubmitTimeout {
                network: batch.network,
                timeout,
            },
            SubmitError::Closed { batch } => Error::QueueClosed {
                network: batch.network,
            },
            SubmitError::Rejected { reason, .. } => *reason,
        }
    }
}
