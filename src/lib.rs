//! # ledgerlake - Multi-Network Ledger Ingestion Core
//!
//! ledgerlake ingests ledger data from several blockchain networks at once
//! into one embedded SQLite database that only ever has a single writer. It
//! provides:
//!
//! - **One writer, many producers**: every network's batches funnel through a
//!   bounded FIFO queue into one consumer that owns the write connection
//! - **Per-network isolation**: each network writes to its own schema
//! - **Backpressure**: a full queue makes producers wait, then time out
//! - **No silent loss**: every accepted batch is written, even during shutdown
//! - **Concurrent reads**: a read-only connection pool beside the writer
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────┐ ┌──────────────┐ ┌──────────────┐
//! │ SourceRunner │ │ SourceRunner │ │ SourceRunner │   one tokio task each
//! │   (alpha)    │ │   (beta)     │ │    (...)     │
//! └──────┬───────┘ └──────┬───────┘ └──────┬───────┘
//!        │ submit(batch)  │                │
//!        └────────────────┼────────────────┘
//!                         ▼
//! ┌─────────────────────────────────────────────────┐
//! │ WriteQueue (bounded mpsc, FIFO, single consumer)│
//! └────────────────────────┬────────────────────────┘
//!                          ▼
//! ┌─────────────────────────────────────────────────┐
//! │ BatchWriter (consumer thread, write connection) │
//! │   SchemaAppenderSet per schema, fixed tables    │
//! │   checkpoint policy after each batch            │
//! └────────────────────────┬────────────────────────┘
//!                          ▼
//! ┌─────────────────────────────────────────────────┐      ┌──────────┐
//! │              SQLite (WAL)                       │◄─────│ ReadPool │
//! │   alpha__ledgers, alpha__transactions, ...      │      └──────────┘
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Single writer**: at most one write is in progress at any instant
//! 2. **FIFO**: batches are written in the order they were accepted
//! 3. **Drain on shutdown**: an accepted batch is written exactly once
//! 4. **Isolation**: a batch only touches its own network's schema
//! 5. **Fixed table order**: tables are written in one deterministic order
//!
//! ## Module Organization
//!
//! - [`error`]: Error types for all failure modes
//! - [`types`]: Domain types (networks, schemas, ranges, rows, batches)
//! - [`schema`]: Ledger table catalog, DDL and provisioning
//! - [`storage`]: Shared database handle and engine settings
//! - [`appender`]: Per-table append handles
//! - [`writer`]: The batch writer and checkpoint policies
//! - [`queue`]: The bounded write queue and its consumer
//! - [`metrics`]: Queue counters
//! - [`subscription`]: Batch completion records
//! - [`source`]: Source runners and the ledger source contract
//! - [`checkpoint`]: Per-network resume files
//! - [`reader`]: The read-only query pool
//! - [`orchestrator`]: Process lifecycle
//! - [`config`] / [`logging`]: Configuration and tracing setup

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for ledgerlake operations.
///
/// A single error enum covers the write path, the read path and startup.
/// [`SubmitError`](error::SubmitError) is the exception: it hands a rejected
/// batch back to its submitter.
pub mod error;

/// Domain types.
///
/// Newtypes for network and schema names, ledger ranges, the fixed set of
/// logical tables, rows and write batches.
pub mod types;

/// Ledger table catalog and schema provisioning.
///
/// Column definitions for every logical table, DDL generation, and the
/// idempotent per-network provisioning run at startup.
pub mod schema;

/// Canonical row encoding, content checksums and timestamps.
pub mod codec;

/// Shared database handle.
pub mod storage;

/// Table-bound append handles.
pub mod appender;

/// The batch writer.
///
/// Owns the only write-capable connection. Writes one batch at a time in a
/// fixed table order and checkpoints the WAL per the configured policy.
pub mod writer;

/// Write queue counters.
pub mod metrics;

/// The bounded multi-producer, single-consumer write queue.
///
/// Key features:
/// - Submit with timeout; rejected batches are returned to the caller
/// - Exactly one consumer on a dedicated thread
/// - Drain-before-exit on shutdown
/// - Periodic statistics logging
pub mod queue;

/// Batch completion records for downstream audit and lineage.
pub mod subscription;

/// Source runners and the ledger source contract.
pub mod source;

/// Per-network resume checkpoints.
pub mod checkpoint;

/// Read-only query pool.
pub mod reader;

/// Process lifecycle: init, start, stop.
pub mod orchestrator;

/// Configuration loaded from TOML.
pub mod config;

/// Tracing subscriber setup.
pub mod logging;

/// Deterministic synthetic ledger source for tests and benchmarks.
pub mod synthetic;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::{AppConfig, CheckpointPolicy, CommitMode, FailurePolicy, QueueConfig, SourceConfig, WriterConfig};
pub use error::{Error, Result, SubmitError};
pub use metrics::{MetricsSnapshot, NetworkStats, WriteQueueMetrics};
pub use orchestrator::{LifecycleState, Orchestrator, OrchestratorReport};
pub use queue::{WriteQueue, WriteQueueHandle, WriteTicket};
pub use reader::{QueryResult, ReadPool};
pub use source::{LedgerRows, LedgerSource, RunnerExit, RunnerReport, SourceRunner};
pub use storage::Storage;
pub use subscription::{BatchCompletion, CompletionSubscription};
pub use types::{
    LedgerRange, LedgerTable, NetworkName, QualityCheckResult, Row, SchemaName, TableRows, WriteBatch, WriteSummary,
};
pub use writer::{BatchSink, BatchWriter};
