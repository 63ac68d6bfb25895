//! # Source Runners
//!
//! A source runner binds one upstream ledger pipeline to one network and
//! schema. It buffers ledgers, cuts them into [`WriteBatch`]es and submits
//! them to the shared write queue. Runners never touch the database.
//!
//! ## Batch Boundaries
//!
//! ```text
//! next_ledger() ──► buffer ──┬─ batch_size ledgers buffered ──► submit
//!                            ├─ flush_interval since first ──► submit
//!                            ├─ source exhausted ───────────► submit, then exit
//!                            └─ shutdown ───────────────────► abandon, exit
//! ```
//!
//! Buffered ledgers that were never submitted are abandoned on shutdown; the
//! resume checkpoint still points before them, so the next run re-ingests
//! them. Batches already accepted by the queue are always written, and the
//! runner waits for their outcomes before it returns.
//!
//! ## In-Flight Window
//!
//! Up to `max_in_flight` submitted batches may await their outcome at once.
//! The queue is FIFO and a runner submits sequentially, so outcomes arrive in
//! submission order and the runner settles them front to back.
//!
//! ## Failure Isolation
//!
//! Everything that goes wrong in a runner ends up in its [`RunnerReport`].
//! Nothing propagates to sibling runners.

use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{ResumeCheckpoint, ResumeStore};
use crate::config::{FailurePolicy, SourceConfig};
use crate::error::{Error, Result};
use crate::queue::{WriteQueueHandle, WriteTicket};
use crate::types::{LedgerRange, NetworkName, QualityCheckResult, SchemaName, TableRows, WriteBatch};

// =============================================================================
// Source Contract
// =============================================================================

/// Rows extracted from one ledger.
#[derive(Debug, Clone, Default)]
pub struct LedgerRows {
    /// Ledger sequence number.
    pub sequence: u32,
    /// Rows per logical table.
    pub tables: TableRows,
    /// Quality checks computed for this ledger.
    pub quality: Vec<QualityCheckResult>,
}

impl LedgerRows {
    /// Empty rows for `sequence`.
    pub fn new(sequence: u32) -> Self {
        Self {
            sequence,
            ..Self::default()
        }
    }
}

/// An upstream ledger pipeline for one network.
///
/// # Cancel Safety
///
/// The runner races `next_ledger` against its flush timer and the shutdown
/// token, dropping the future when another branch wins. Implementations must
/// not lose a ledger when that happens: advance internal state only once the
/// ledger is returned.
#[async_trait]
pub trait LedgerSource: Send {
    /// Human-readable source description, for logs.
    fn describe(&self) -> String {
        "ledger source".to_string()
    }

    /// Positions the source so the next ledger returned is `ledger`.
    async fn resume_from(&mut self, ledger: u32) -> Result<()>;

    /// Next ledger, or `None` once the source is exhausted.
    async fn next_ledger(&mut self) -> Result<Option<LedgerRows>>;
}

// =============================================================================
// Run Reports
// =============================================================================

/// Why a runner returned.
#[derive(Debug)]
pub enum RunnerExit {
    /// The source had no more ledgers; everything buffered was submitted.
    Exhausted,
    /// The shutdown token fired.
    Shutdown,
    /// The source, the queue or a batch write failed.
    Failed(Error),
}

impl RunnerExit {
    /// True for [`RunnerExit::Failed`].
    pub fn is_failure(&self) -> bool {
        matches!(self, RunnerExit::Failed(_))
    }
}

/// Summary of one runner's lifetime.
#[derive(Debug)]
pub struct RunnerReport {
    /// Network the runner served.
    pub network: NetworkName,
    /// Batches accepted by the queue.
    pub batches_submitted: u64,
    /// Batches written.
    pub batches_written: u64,
    /// Batches the writer failed.
    pub batches_failed: u64,
    /// Submits that timed out, retried or not.
    pub submit_timeouts: u64,
    /// Ledgers written.
    pub ledgers_written: u64,
    /// Rows written.
    pub rows_written: u64,
    /// Ledgers buffered but never accepted by the queue.
    pub ledgers_abandoned: u64,
    /// Highest ledger written.
    pub last_committed: Option<u32>,
    /// Exit reason.
    pub exit: RunnerExit,
}

impl RunnerReport {
    fn new(network: NetworkName) -> Self {
        Self {
            network,
            batches_submitted: 0,
            batches_written: 0,
            batches_failed: 0,
            submit_timeouts: 0,
            ledgers_written: 0,
            rows_written: 0,
            ledgers_abandoned: 0,
            last_committed: None,
            exit: RunnerExit::Exhausted,
        }
    }
}

// =============================================================================
// Pending Batch
// =============================================================================

/// Ledgers buffered toward the next batch.
#[derive(Debug, Default)]
struct PendingBatch {
    tables: TableRows,
    quality: Vec<QualityCheckResult>,
    first: Option<u32>,
    last: Option<u32>,
    ledgers: usize,
    opened_at: Option<Instant>,
}

impl PendingBatch {
    fn push(&mut self, mut ledger: LedgerRows) {
        if self.opened_at.is_none() {
            self.opened_at = Some(Instant::now());
        }
        self.first.get_or_insert(ledger.sequence);
        self.last = Some(ledger.sequence);
        self.ledgers += 1;
        self.tables.append(&mut ledger.tables);
        self.quality.append(&mut ledger.quality);
    }

    fn is_empty(&self) -> bool {
        self.ledgers == 0
    }

    /// When the buffer must be flushed regardless of size.
    fn deadline(&self, interval: std::time::Duration) -> Option<Instant> {
        self.opened_at.map(|t| t + interval)
    }

    /// Empties the buffer into a batch.
    fn take(&mut self, network: &NetworkName, schema: &SchemaName) -> Result<Option<WriteBatch>> {
        let pending = std::mem::take(self);
        let (Some(first), Some(last)) = (pending.first, pending.last) else {
            return Ok(None);
        };
        let range = LedgerRange::new(first, last)?;
        Ok(Some(
            WriteBatch::new(network.clone(), schema.clone(), range, pending.tables).with_quality(pending.quality),
        ))
    }
}

// =============================================================================
// Source Runner
// =============================================================================

enum Event {
    Shutdown,
    FlushDue,
    Ledger(Result<Option<LedgerRows>>),
}

/// Drives one [`LedgerSource`] into the write queue.
pub struct SourceRunner {
    network: NetworkName,
    schema: SchemaName,
    source: Box<dyn LedgerSource>,
    queue: WriteQueueHandle,
    config: SourceConfig,
    resume: Option<ResumeStore>,
    shutdown: CancellationToken,

    pending: PendingBatch,
    in_flight: VecDeque<WriteTicket>,
    last_sequence: Option<u32>,
    batch_number: u64,
    report: RunnerReport,
}

impl SourceRunner {
    /// Creates a runner. Nothing happens until [`SourceRunner::run`].
    pub fn new(
        network: NetworkName,
        schema: SchemaName,
        source: Box<dyn LedgerSource>,
        queue: WriteQueueHandle,
        config: SourceConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let report = RunnerReport::new(network.clone());
        Self {
            network,
            schema,
            source,
            queue,
            config,
            resume: None,
            shutdown,
            pending: PendingBatch::default(),
            in_flight: VecDeque::new(),
            last_sequence: None,
            batch_number: 0,
            report,
        }
    }

    /// Persists progress to `store` and resumes from it.
    pub fn with_resume(mut self, store: ResumeStore) -> Self {
        self.resume = Some(store);
        self
    }

    /// Runs until the source is exhausted, shutdown fires, or a failure stops it.
    pub async fn run(mut self) -> RunnerReport {
        info!(
            network = %self.network,
            schema = %self.schema,
            source = %self.source.describe(),
            batch_size = self.config.batch_size,
            "source runner started"
        );

        let result = self.ingest().await;
        // Accepted batches are written even during shutdown; wait for them.
        let settled = self.settle_all().await;

        let exit = match (result, settled) {
            (Ok(exit), Ok(())) => exit,
            (Err(e), _) | (Ok(_), Err(e)) => RunnerExit::Failed(e),
        };

        match &exit {
            RunnerExit::Failed(e) => error!(
                network = %self.network,
                last_committed = ?self.report.last_committed,
                error = %e,
                "source runner failed"
            ),
            exit => info!(
                network = %self.network,
                exit = ?exit,
                batches_written = self.report.batches_written,
                ledgers_written = self.report.ledgers_written,
                last_committed = ?self.report.last_committed,
                "source runner finished"
            ),
        }

        self.report.exit = exit;
        self.report
    }

    async fn ingest(&mut self) -> Result<RunnerExit> {
        let start = match &self.resume {
            Some(store) => {
                if let Some(saved) = store.load()? {
                    self.batch_number = saved.batch_number;
                }
                store.resume_point(self.config.start_ledger)?
            }
            None => self.config.start_ledger,
        };
        if start != self.config.start_ledger {
            info!(network = %self.network, start, "resuming after last committed ledger");
        }
        self.source.resume_from(start).await?;
        self.last_sequence = start.checked_sub(1);

        loop {
            let deadline = self.pending.deadline(self.config.flush_interval);
            let event = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => Event::Shutdown,
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => Event::FlushDue,
                next = self.source.next_ledger() => Event::Ledger(next),
            };

            match event {
                Event::Shutdown => {
                    self.abandon_pending("shutdown");
                    return Ok(RunnerExit::Shutdown);
                }
                Event::FlushDue => self.flush().await?,
                Event::Ledger(Ok(Some(ledger))) => {
                    self.accept(ledger)?;
                    if self.pending.ledgers >= self.config.batch_size.max(1) {
                        self.flush().await?;
                    }
                }
                Event::Ledger(Ok(None)) => {
                    self.flush().await?;
                    debug!(network = %self.network, "source exhausted");
                    return Ok(RunnerExit::Exhausted);
                }
                Event::Ledger(Err(e)) => {
                    self.abandon_pending("source failure");
                    return Err(e);
                }
            }
        }
    }

    /// Buffers a ledger, rejecting sequence regressions.
    fn accept(&mut self, ledger: LedgerRows) -> Result<()> {
        if let Some(previous) = self.last_sequence {
            if ledger.sequence <= previous {
                return Err(Error::RangeRegression {
                    network: self.network.clone(),
                    previous_end: previous,
                    start: ledger.sequence,
                });
            }
        }
        self.last_sequence = Some(ledger.sequence);
        self.pending.push(ledger);
        Ok(())
    }

    fn abandon_pending(&mut self, reason: &str) {
        if self.pending.is_empty() {
            return;
        }
        let abandoned = std::mem::take(&mut self.pending);
        self.report.ledgers_abandoned += abandoned.ledgers as u64;
        info!(
            network = %self.network,
            start = ?abandoned.first,
            end = ?abandoned.last,
            ledgers = abandoned.ledgers,
            reason,
            "abandoning unsubmitted ledgers"
        );
    }

    /// Submits the buffer as one batch, if non-empty.
    async fn flush(&mut self) -> Result<()> {
        let Some(batch) = self.pending.take(&self.network, &self.schema)? else {
            return Ok(());
        };

        while self.in_flight.len() >= self.config.max_in_flight.max(1) {
            if let Some(ticket) = self.in_flight.pop_front() {
                if let Err(e) = self.settle(ticket).await {
                    self.report.ledgers_abandoned += batch.range.ledger_count();
                    return Err(e);
                }
            }
        }

        self.submit(batch).await
    }

    /// Submits with the configured retry policy.
    async fn submit(&mut self, mut batch: WriteBatch) -> Result<()> {
        let range = batch.range;
        let rows = batch.total_rows();
        let mut attempt = 0;
        loop {
            let outcome = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => None,
                outcome = self.queue.submit(batch) => Some(outcome),
            };
            let Some(outcome) = outcome else {
                self.report.ledgers_abandoned += range.ledger_count();
                info!(
                    network = %self.network,
                    start = range.start(),
                    end = range.end(),
                    "shutdown while waiting for queue space; batch abandoned"
                );
                return Ok(());
            };

            match outcome {
                Ok(ticket) => {
                    self.report.batches_submitted += 1;
                    debug!(network = %self.network, start = range.start(), end = range.end(), rows, "batch submitted");
                    self.in_flight.push_back(ticket);
                    return Ok(());
                }
                Err(err) if err.is_timeout() && attempt < self.config.submit_retries => {
                    self.report.submit_timeouts += 1;
                    attempt += 1;
                    warn!(
                        network = %self.network,
                        start = range.start(),
                        end = range.end(),
                        attempt,
                        "submit timed out, retrying"
                    );
                    batch = err.into_batch();
                    tokio::select! {
                        _ = self.shutdown.cancelled() => {}
                        _ = sleep(self.config.submit_backoff) => {}
                    }
                }
                Err(err) => {
                    if err.is_timeout() {
                        self.report.submit_timeouts += 1;
                    }
                    error!(
                        network = %self.network,
                        start = range.start(),
                        end = range.end(),
                        error = %err,
                        "batch not accepted by write queue"
                    );
                    return Err(err.into());
                }
            }
        }
    }

    /// Waits for one ticket and applies the failure policy.
    async fn settle(&mut self, ticket: WriteTicket) -> Result<()> {
        let range = ticket.range();
        match ticket.outcome().await {
            Ok(summary) => {
                self.report.batches_written += 1;
                self.report.ledgers_written += range.ledger_count();
                self.report.rows_written += summary.total_rows as u64;
                self.report.last_committed = Some(range.end());
                self.batch_number += 1;
                self.save_resume(range.end());
                Ok(())
            }
            Err(e) => {
                self.report.batches_failed += 1;
                error!(
                    network = %self.network,
                    start = range.start(),
                    end = range.end(),
                    error = %e,
                    "batch write failed"
                );
                match self.config.on_write_failure {
                    FailurePolicy::Stop => Err(e),
                    FailurePolicy::Skip => {
                        warn!(network = %self.network, start = range.start(), end = range.end(), "skipping lost range");
                        Ok(())
                    }
                }
            }
        }
    }

    /// Settles every outstanding ticket, returning the first failure.
    async fn settle_all(&mut self) -> Result<()> {
        let mut first_err = None;
        while let Some(ticket) = self.in_flight.pop_front() {
            if let Err(e) = self.settle(ticket).await {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn save_resume(&self, last_committed: u32) {
        let Some(store) = &self.resume else {
            return;
        };
        let checkpoint = ResumeCheckpoint::new(&self.network, &self.schema, last_committed, self.batch_number);
        if let Err(e) = store.save(&checkpoint) {
            warn!(network = %self.network, last_committed, error = %e, "saving resume checkpoint failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LedgerTable, Row};
    use rusqlite::types::Value;

    fn ledger(seq: u32) -> LedgerRows {
        let mut rows = LedgerRows::new(seq);
        rows.tables
            .push(LedgerTable::Ledgers, Row::new(vec![Value::Integer(seq as i64)]));
        rows.quality.push(QualityCheckResult::passed("ok"));
        rows
    }

    #[test]
    fn test_pending_batch_takes_range_and_rows() {
        let mut pending = PendingBatch::default();
        pending.push(ledger(10));
        pending.push(ledger(11));
        pending.push(ledger(13));

        let batch = pending
            .take(&NetworkName::new("alpha"), &SchemaName::parse("alpha").unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(batch.range, LedgerRange::new(10, 13).unwrap());
        assert_eq!(batch.total_rows(), 3);
        assert_eq!(batch.quality.len(), 3);
        assert!(batch.submitted_at.is_none());

        assert!(pending.is_empty());
        assert!(pending.deadline(std::time::Duration::from_secs(1)).is_none());
    }

    #[test]
    fn test_empty_pending_batch_takes_nothing() {
        let mut pending = PendingBatch::default();
        let batch = pending
            .take(&NetworkName::new("alpha"), &SchemaName::parse("alpha").unwrap())
            .unwrap();
        assert!(batch.is_none());
    }
}
