//! # Batch Completion Events
//!
//! Every successfully written batch produces one [`BatchCompletion`] record:
//! which network and ledgers, how many rows per table, a content checksum of
//! the rows, and the upstream quality-check tally. Observers subscribe to the
//! stream; nothing in the write path waits on them.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐   publish()   ┌──────────────────────┐
//! │ queue consumer │ ─────────────►│  broadcast::Sender   │
//! └────────────────┘               └──────────┬───────────┘
//!                                             │ (fan-out)
//!                         ┌───────────────────┼──────────────────┐
//!                         ▼                   ▼                  ▼
//!              CompletionSubscription  CompletionSubscription   ...
//! ```
//!
//! ## Slow Subscribers
//!
//! The channel is bounded. A subscriber that falls behind loses the oldest
//! records instead of stalling the writer; [`CompletionSubscription::lagged`]
//! reports how many were skipped.
//!
//! When there are no subscribers, publishing is free: the record (and its
//! checksum) is never built.

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::debug;

use crate::codec::{compute_checksum, current_time_ms};
use crate::types::{LedgerRange, NetworkName, RowCounts, SchemaName, WriteBatch, WriteSummary};

// =============================================================================
// Completion Record
// =============================================================================

/// Audit record of one committed batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchCompletion {
    /// Source network.
    pub network: NetworkName,
    /// Target schema.
    pub schema: SchemaName,
    /// Ledgers written.
    pub range: LedgerRange,
    /// Rows per non-empty table.
    pub row_counts: RowCounts,
    /// Rows in total.
    pub total_rows: usize,
    /// xxh3 checksum over the batch's rows, in table order.
    pub checksum: u64,
    /// Quality checks that passed.
    pub quality_passed: usize,
    /// Quality checks that failed.
    pub quality_failed: usize,
    /// Unix ms at which the record was built.
    pub completed_ms: u64,
}

impl BatchCompletion {
    /// Builds the record for a batch the writer just committed.
    pub fn new(batch: &WriteBatch, summary: &WriteSummary) -> Self {
        let quality_passed = batch.quality.iter().filter(|q| q.passed).count();
        Self {
            network: summary.network.clone(),
            schema: summary.schema.clone(),
            range: summary.range,
            row_counts: summary.row_counts.clone(),
            total_rows: summary.total_rows,
            checksum: compute_checksum(&batch.tables),
            quality_passed,
            quality_failed: batch.quality.len() - quality_passed,
            completed_ms: current_time_ms(),
        }
    }

    /// True if every quality check passed (or none were run).
    pub fn quality_ok(&self) -> bool {
        self.quality_failed == 0
    }
}

// =============================================================================
// Publisher
// =============================================================================

/// Sending side of the completion stream. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CompletionPublisher {
    tx: broadcast::Sender<BatchCompletion>,
}

impl CompletionPublisher {
    /// Creates a stream retaining up to `capacity` records per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publishes the record built by `build`, if anyone is listening.
    pub fn publish(&self, build: impl FnOnce() -> BatchCompletion) {
        if self.tx.receiver_count() == 0 {
            return;
        }
        // Err only if every receiver dropped in between.
        let _ = self.tx.send(build());
    }

    /// Opens a subscription starting at the next published record.
    pub fn subscribe(&self) -> CompletionSubscription {
        CompletionSubscription {
            rx: self.tx.subscribe(),
            lagged: 0,
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

// =============================================================================
// Subscription
// =============================================================================

/// Receiving side of the completion stream.
#[derive(Debug)]
pub struct CompletionSubscription {
    rx: broadcast::Receiver<BatchCompletion>,
    lagged: u64,
}

impl CompletionSubscription {
    /// Waits for the next record.
    ///
    /// Returns `None` once the publisher is gone and the backlog is drained.
    pub async fn next(&mut self) -> Option<BatchCompletion> {
        loop {
            match self.rx.recv().await {
                Ok(completion) => return Some(completion),
                Err(RecvError::Lagged(n)) => {
                    self.lagged += n;
                    debug!(skipped = n, "completion subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Returns the next record if one is already buffered.
    pub fn try_next(&mut self) -> Option<BatchCompletion> {
        loop {
            match self.rx.try_recv() {
                Ok(completion) => return Some(completion),
                Err(TryRecvError::Lagged(n)) => self.lagged += n,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Records skipped because this subscriber fell behind.
    pub fn lagged(&self) -> u64 {
        self.lagged
    }
}
