//! # Batch Writer
//!
//! The batch writer owns the only write-capable connection and turns one
//! [`WriteBatch`] at a time into per-table appends, followed by a WAL
//! checkpoint when the configured policy says so.
//!
//! ## Write Sequence
//!
//! ```text
//! write(batch)
//!   │
//!   ├─ resolve SchemaAppenderSet (lazy, cached; unknown schema = error)
//!   │
//!   ├─ [Atomic] BEGIN IMMEDIATE
//!   │
//!   ├─ for table in LedgerTable::ALL (fixed order), if non-empty:
//!   │     append every row ──► flush
//!   │     └─ on failure: discard this table, stop, return the error
//!   │
//!   ├─ [Atomic] COMMIT   (ROLLBACK on any failure above)
//!   │
//!   └─ checkpoint policy due? ──► PRAGMA wal_checkpoint
//!         └─ failure is logged, never fails the batch
//! ```
//!
//! ## Commit Modes
//!
//! With [`CommitMode::PerTable`] a batch is not atomic across its tables: if
//! the third table fails, the first two stay committed. Each row carries its
//! natural key (ledger sequence, hashes), so a source can re-ingest the range
//! and deduplicate downstream. [`CommitMode::Atomic`] wraps the batch in one
//! transaction and removes the hazard.
//!
//! ## Single Writer
//!
//! There is no lock around `write`. The write queue's single consumer is the
//! only caller; the appender cache needs no mutex because `&mut self` already
//! proves exclusive access.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::appender::SchemaAppenderSet;
use crate::config::{CheckpointPolicy, CommitMode, WriterConfig};
use crate::error::{Error, Result};
use crate::schema;
use crate::storage::wal_size_bytes;
use crate::types::{LedgerTable, SchemaName, WriteBatch, WriteSummary};

/// Prepared statements kept per connection: 8 tables for up to 32 schemas.
const STATEMENT_CACHE_CAPACITY: usize = 256;

// =============================================================================
// Sink Trait
// =============================================================================

/// Where the write queue's consumer delivers batches.
///
/// [`BatchWriter`] is the production implementation. The trait is the seam
/// that lets tests observe the consumer without a database.
///
/// # Contract
///
/// `write` is only ever called from one thread at a time, and `close` is
/// called once after the last `write`.
pub trait BatchSink: Send + 'static {
    /// Writes one batch.
    fn write(&mut self, batch: &WriteBatch) -> Result<WriteSummary>;

    /// Flushes and releases everything; no `write` follows.
    fn close(&mut self) -> Result<()>;
}

// =============================================================================
// Checkpoints
// =============================================================================

/// SQLite checkpoint modes used by the writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointMode {
    /// Copies what it can without waiting on readers.
    Passive,
    /// Waits for readers, copies everything and truncates the WAL file.
    Truncate,
}

impl CheckpointMode {
    fn pragma(&self) -> &'static str {
        match self {
            CheckpointMode::Passive => "PRAGMA wal_checkpoint(PASSIVE)",
            CheckpointMode::Truncate => "PRAGMA wal_checkpoint(TRUNCATE)",
        }
    }
}

/// What one checkpoint did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointStats {
    /// The checkpoint could not complete because of concurrent readers.
    pub busy: bool,
    /// Frames in the WAL (-1 when not in WAL mode).
    pub log_frames: i64,
    /// Frames copied into the database file.
    pub checkpointed_frames: i64,
}

/// Runs a WAL checkpoint on `conn`.
pub fn run_checkpoint(conn: &Connection, mode: CheckpointMode) -> Result<CheckpointStats> {
    let stats = conn.query_row(mode.pragma(), [], |row| {
        Ok(CheckpointStats {
            busy: row.get::<_, i64>(0)? != 0,
            log_frames: row.get(1)?,
            checkpointed_frames: row.get(2)?,
        })
    })?;
    Ok(stats)
}

/// Decides when a checkpoint is due under a [`CheckpointPolicy`].
#[derive(Debug)]
pub struct CheckpointScheduler {
    policy: CheckpointPolicy,
    batches_since: u64,
    last: Instant,
}

impl CheckpointScheduler {
    /// Starts the schedule now.
    pub fn new(policy: CheckpointPolicy) -> Self {
        Self {
            policy,
            batches_since: 0,
            last: Instant::now(),
        }
    }

    /// Records a written batch and reports whether to checkpoint after it.
    ///
    /// `wal_size` is only evaluated by the size-threshold policy.
    pub fn on_batch(&mut self, wal_size: impl FnOnce() -> u64) -> bool {
        self.batches_since += 1;
        match self.policy {
            CheckpointPolicy::EveryBatch => true,
            CheckpointPolicy::EveryNBatches { batches } => self.batches_since >= batches.max(1),
            CheckpointPolicy::SizeThreshold { bytes } => wal_size() >= bytes,
            CheckpointPolicy::Periodic { interval } => self.last.elapsed() >= interval,
            CheckpointPolicy::Disabled => false,
        }
    }

    /// Mode the due checkpoint should run in.
    ///
    /// The size policy measures the WAL file, so it truncates; otherwise the
    /// file would never shrink below the threshold again.
    pub fn mode(&self) -> CheckpointMode {
        match self.policy {
            CheckpointPolicy::SizeThreshold { .. } => CheckpointMode::Truncate,
            _ => CheckpointMode::Passive,
        }
    }

    /// Restarts the schedule after a checkpoint attempt.
    pub fn reset(&mut self) {
        self.batches_since = 0;
        self.last = Instant::now();
    }
}

// =============================================================================
// Batch Writer
// =============================================================================

/// The batch writer. Owns the write connection and the appender cache.
pub struct BatchWriter {
    conn: Connection,
    config: WriterConfig,
    wal_path: Option<PathBuf>,
    appenders: HashMap<SchemaName, SchemaAppenderSet>,
    scheduler: CheckpointScheduler,
    checkpoints: u64,
    checkpoint_failures: u64,
    closed: bool,
    #[cfg(test)]
    fail_checkpoints: bool,
}

impl BatchWriter {
    /// Creates a writer over the write-capable connection.
    ///
    /// `wal_path` is needed by the size-threshold checkpoint policy; without it
    /// the WAL size reads as 0.
    pub fn new(conn: Connection, config: WriterConfig, wal_path: Option<PathBuf>) -> Result<Self> {
        conn.set_prepared_statement_cache_capacity(STATEMENT_CACHE_CAPACITY);
        let scheduler = CheckpointScheduler::new(config.checkpoint);
        Ok(Self {
            conn,
            config,
            wal_path,
            appenders: HashMap::new(),
            scheduler,
            checkpoints: 0,
            checkpoint_failures: 0,
            closed: false,
            #[cfg(test)]
            fail_checkpoints: false,
        })
    }

    /// Schemas with an open appender set.
    pub fn schema_count(&self) -> usize {
        self.appenders.len()
    }

    /// Appender set for `schema`, if one was opened.
    pub fn appender_set(&self, schema: &SchemaName) -> Option<&SchemaAppenderSet> {
        self.appenders.get(schema)
    }

    /// Successful checkpoints so far.
    pub fn checkpoint_count(&self) -> u64 {
        self.checkpoints
    }

    /// Failed checkpoints so far.
    pub fn checkpoint_failure_count(&self) -> u64 {
        self.checkpoint_failures
    }

    /// Read access to the write connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Writes one batch. See the module docs for the sequence.
    pub fn write_batch(&mut self, batch: &WriteBatch) -> Result<WriteSummary> {
        if self.closed {
            return Err(Error::WriterShutdown);
        }
        let queue_wait = batch.queue_wait().unwrap_or_default();
        let started = Instant::now();

        if !self.appenders.contains_key(&batch.schema) {
            let Some(owner) = schema::schema_owner(&self.conn, &batch.schema)? else {
                return Err(Error::UnknownSchema {
                    schema: batch.schema.to_string(),
                });
            };
            self.appenders
                .insert(batch.schema.clone(), SchemaAppenderSet::new(batch.schema.clone(), owner));
            debug!(schema = %batch.schema, "appender set created");
        }
        let set = self
            .appenders
            .get_mut(&batch.schema)
            .ok_or_else(|| Error::UnknownSchema {
                schema: batch.schema.to_string(),
            })?;
        if set.network() != &batch.network {
            return Err(Error::Schema(format!(
                "batch for network '{}' targets schema '{}', which belongs to network '{}'",
                batch.network,
                batch.schema,
                set.network()
            )));
        }

        let atomic = self.config.commit_mode == CommitMode::Atomic;
        if atomic {
            self.conn.execute_batch("BEGIN IMMEDIATE").map_err(|e| Error::from(e).classify())?;
        }

        let mut flushed = Vec::new();
        let result = append_tables(&self.conn, set, batch, &mut flushed).and_then(|()| {
            if atomic {
                self.conn.execute_batch("COMMIT")?;
            }
            Ok(())
        });

        if let Err(e) = result {
            if let Err(discard_err) = set.discard_all(&self.conn) {
                warn!(schema = %batch.schema, error = %discard_err, "discarding unflushed rows failed");
            }
            if atomic {
                if let Err(rollback_err) = self.conn.execute_batch("ROLLBACK") {
                    warn!(schema = %batch.schema, error = %rollback_err, "rolling back batch failed");
                }
                for (table, rows) in flushed {
                    set.appender_mut(table).unflush(rows);
                }
            }
            return Err(e.classify());
        }
        set.record_batch();

        let write_duration = started.elapsed();
        let checkpointed = self.after_batch();

        let mut summary = WriteSummary::from_batch(batch, write_duration, checkpointed);
        summary.queue_wait = queue_wait;
        Ok(summary)
    }

    /// Runs the checkpoint policy after a successful batch.
    fn after_batch(&mut self) -> bool {
        let wal_path = self.wal_path.as_deref();
        let due = self.scheduler.on_batch(|| wal_path.map(wal_size_bytes).unwrap_or(0));
        if !due {
            return false;
        }

        let mode = self.scheduler.mode();
        self.scheduler.reset();
        match self.checkpoint(mode) {
            Ok(stats) => {
                debug!(
                    mode = ?mode,
                    busy = stats.busy,
                    log_frames = stats.log_frames,
                    checkpointed_frames = stats.checkpointed_frames,
                    "checkpoint complete"
                );
                true
            }
            Err(e) => {
                self.checkpoint_failures += 1;
                warn!(error = %e, "checkpoint failed; batch already durable in WAL");
                false
            }
        }
    }

    /// Checkpoints the WAL now.
    pub fn checkpoint(&mut self, mode: CheckpointMode) -> Result<CheckpointStats> {
        #[cfg(test)]
        if self.fail_checkpoints {
            return Err(Error::Schema("injected checkpoint failure".to_string()));
        }
        let stats = run_checkpoint(&self.conn, mode)?;
        self.checkpoints += 1;
        Ok(stats)
    }

    /// Flushes and closes every appender set, then truncates the WAL.
    ///
    /// Idempotent. Reports the first failure but still closes every set.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut first_err = None;
        for (schema, set) in self.appenders.iter_mut() {
            if let Err(e) = set.close(&self.conn) {
                warn!(schema = %schema, error = %e, "closing appender set failed");
                first_err.get_or_insert(e);
            }
        }

        match run_checkpoint(&self.conn, CheckpointMode::Truncate) {
            Ok(stats) => debug!(busy = stats.busy, "final checkpoint complete"),
            Err(e) => warn!(error = %e, "final checkpoint failed"),
        }

        info!(
            schemas = self.appenders.len(),
            checkpoints = self.checkpoints,
            checkpoint_failures = self.checkpoint_failures,
            "batch writer closed"
        );
        first_err.map_or(Ok(()), Err)
    }
}

impl BatchSink for BatchWriter {
    fn write(&mut self, batch: &WriteBatch) -> Result<WriteSummary> {
        self.write_batch(batch)
    }

    fn close(&mut self) -> Result<()> {
        BatchWriter::close(self)
    }
}

/// Appends and flushes every non-empty table in fixed order.
///
/// Stops at the first failing table. `flushed` collects (table, rows) for
/// every flush that succeeded, for rollback bookkeeping.
fn append_tables(
    conn: &Connection,
    set: &mut SchemaAppenderSet,
    batch: &WriteBatch,
    flushed: &mut Vec<(LedgerTable, usize)>,
) -> Result<()> {
    for (table, rows) in batch.tables.non_empty() {
        let appender = set.appender_mut(table);
        let outcome = rows
            .iter()
            .try_for_each(|row| appender.append_row(conn, row))
            .and_then(|()| appender.flush(conn));

        match outcome {
            Ok(n) => flushed.push((table, n)),
            Err(e) => {
                let e = e.classify();
                if e.is_lock_conflict() {
                    return Err(e);
                }
                return Err(Error::TableAppend {
                    table,
                    source: Box::new(e),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{provision_schema, qualified};
    use crate::types::{LedgerRange, NetworkName, Row, TableRows};
    use rusqlite::types::Value;
    use std::time::Duration;

    fn provisioned_conn(networks: &[&str]) -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        for n in networks {
            provision_schema(&conn, &NetworkName::new(*n), &SchemaName::parse(*n).unwrap()).unwrap();
        }
        conn
    }

    fn writer(networks: &[&str], config: WriterConfig) -> BatchWriter {
        BatchWriter::new(provisioned_conn(networks), config, None).unwrap()
    }

    fn ledger_row(seq: u32) -> Row {
        Row::new(vec![
            Value::Integer(seq as i64),
            Value::Text(format!("hash-{}", seq)),
            Value::Integer(1_700_000_000 + seq as i64),
            Value::Integer(0),
            Value::Integer(0),
            Value::Integer(21),
        ])
    }

    fn batch(network: &str, start: u32, end: u32) -> WriteBatch {
        let mut tables = TableRows::new();
        for seq in start..=end {
            tables.push(LedgerTable::Ledgers, ledger_row(seq));
        }
        WriteBatch::new(
            NetworkName::new(network),
            SchemaName::parse(network).unwrap(),
            LedgerRange::new(start, end).unwrap(),
            tables,
        )
    }

    fn count(conn: &Connection, schema: &str, table: LedgerTable) -> i64 {
        let schema = SchemaName::parse(schema).unwrap();
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", qualified(&schema, table)), [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn test_write_batch() {
        let mut w = writer(&["alpha"], WriterConfig::default());
        let summary = w.write_batch(&batch("alpha", 1, 10)).unwrap();

        assert_eq!(summary.total_rows, 10);
        assert_eq!(summary.row_counts.get(&LedgerTable::Ledgers), Some(&10));
        assert_eq!(summary.range, LedgerRange::new(1, 10).unwrap());
        assert_eq!(count(w.connection(), "alpha", LedgerTable::Ledgers), 10);
    }

    #[test]
    fn test_appender_set_created_lazily_and_reused() {
        let mut w = writer(&["alpha", "beta"], WriterConfig::default());
        assert_eq!(w.schema_count(), 0);

        w.write_batch(&batch("alpha", 1, 5)).unwrap();
        w.write_batch(&batch("alpha", 6, 10)).unwrap();
        assert_eq!(w.schema_count(), 1);

        let set = w.appender_set(&SchemaName::parse("alpha").unwrap()).unwrap();
        assert_eq!(set.batch_count(), 2);
        assert_eq!(set.appender(LedgerTable::Ledgers).flush_count(), 2);

        w.write_batch(&batch("beta", 1, 5)).unwrap();
        assert_eq!(w.schema_count(), 2);
    }

    #[test]
    fn test_unknown_schema_is_error() {
        let mut w = writer(&["alpha"], WriterConfig::default());
        let err = w.write_batch(&batch("gamma", 1, 1)).unwrap_err();
        assert!(matches!(err, Error::UnknownSchema { ref schema } if schema == "gamma"));
        assert_eq!(w.schema_count(), 0);
    }

    #[test]
    fn test_batch_for_another_networks_schema_is_rejected() {
        for warm in [false, true] {
            let mut w = writer(&["alpha", "beta"], WriterConfig::default());
            if warm {
                w.write_batch(&batch("beta", 1, 2)).unwrap();
            }

            let mut stray = batch("alpha", 1, 3);
            stray.schema = SchemaName::parse("beta").unwrap();
            let err = w.write_batch(&stray).unwrap_err();
            assert!(matches!(err, Error::Schema(ref msg) if msg.contains("belongs to network 'beta'")));

            let expected = if warm { 2 } else { 0 };
            assert_eq!(count(w.connection(), "beta", LedgerTable::Ledgers), expected);
            assert!(w.connection().is_autocommit());

            // The owner still writes normally afterwards.
            w.write_batch(&batch("beta", 10, 12)).unwrap();
            assert_eq!(count(w.connection(), "beta", LedgerTable::Ledgers), expected + 3);
        }
    }

    #[test]
    fn test_failed_table_rolls_back_whole_batch_in_atomic_mode() {
        let mut w = writer(&["alpha"], WriterConfig::default());
        let mut b = batch("alpha", 1, 3);
        b.tables.push(LedgerTable::Operations, Row::new(vec![Value::Integer(1)]));

        let err = w.write_batch(&b).unwrap_err();
        assert!(matches!(err, Error::TableAppend { table: LedgerTable::Operations, .. }));
        assert_eq!(count(w.connection(), "alpha", LedgerTable::Ledgers), 0);
        assert!(w.connection().is_autocommit());

        // writer keeps working after a failed batch
        w.write_batch(&batch("alpha", 1, 3)).unwrap();
        assert_eq!(count(w.connection(), "alpha", LedgerTable::Ledgers), 3);
    }

    #[test]
    fn test_failed_table_keeps_earlier_tables_in_per_table_mode() {
        let config = WriterConfig {
            commit_mode: CommitMode::PerTable,
            ..WriterConfig::default()
        };
        let mut w = writer(&["alpha"], config);
        let mut b = batch("alpha", 1, 3);
        b.tables.push(LedgerTable::Operations, Row::new(vec![Value::Integer(1)]));

        assert!(w.write_batch(&b).is_err());
        assert_eq!(count(w.connection(), "alpha", LedgerTable::Ledgers), 3);
        assert_eq!(count(w.connection(), "alpha", LedgerTable::Operations), 0);
        assert!(w.connection().is_autocommit());
    }

    #[test]
    fn test_checkpoint_every_n_batches() {
        let config = WriterConfig {
            checkpoint: CheckpointPolicy::EveryNBatches { batches: 3 },
            ..WriterConfig::default()
        };
        let mut w = writer(&["alpha"], config);

        let flags: Vec<bool> = (0..6)
            .map(|i| w.write_batch(&batch("alpha", i * 10 + 1, i * 10 + 10)).unwrap().checkpointed)
            .collect();
        assert_eq!(flags, vec![false, false, true, false, false, true]);
        assert_eq!(w.checkpoint_count(), 2);
    }

    #[test]
    fn test_checkpoint_disabled_and_periodic() {
        let mut w = writer(&["alpha"], WriterConfig {
            checkpoint: CheckpointPolicy::Disabled,
            ..WriterConfig::default()
        });
        assert!(!w.write_batch(&batch("alpha", 1, 1)).unwrap().checkpointed);

        let mut w = writer(&["alpha"], WriterConfig {
            checkpoint: CheckpointPolicy::Periodic {
                interval: Duration::from_secs(3600),
            },
            ..WriterConfig::default()
        });
        assert!(!w.write_batch(&batch("alpha", 1, 1)).unwrap().checkpointed);

        let mut w = writer(&["alpha"], WriterConfig {
            checkpoint: CheckpointPolicy::Periodic {
                interval: Duration::ZERO,
            },
            ..WriterConfig::default()
        });
        assert!(w.write_batch(&batch("alpha", 1, 1)).unwrap().checkpointed);
    }

    #[test]
    fn test_scheduler_size_threshold() {
        let mut s = CheckpointScheduler::new(CheckpointPolicy::SizeThreshold { bytes: 1024 });
        assert!(!s.on_batch(|| 512));
        assert!(s.on_batch(|| 2048));
        assert_eq!(s.mode(), CheckpointMode::Truncate);
    }

    #[test]
    fn test_checkpoint_failure_does_not_fail_batch() {
        let mut w = writer(&["alpha"], WriterConfig::default());
        w.fail_checkpoints = true;

        let summary = w.write_batch(&batch("alpha", 1, 5)).unwrap();
        assert!(!summary.checkpointed);
        assert_eq!(w.checkpoint_failure_count(), 1);
        assert_eq!(count(w.connection(), "alpha", LedgerTable::Ledgers), 5);
    }

    #[test]
    fn test_close_is_idempotent_and_rejects_writes() {
        let mut w = writer(&["alpha"], WriterConfig::default());
        w.write_batch(&batch("alpha", 1, 2)).unwrap();

        w.close().unwrap();
        w.close().unwrap();
        assert!(matches!(w.write_batch(&batch("alpha", 3, 4)), Err(Error::WriterShutdown)));
    }
}
