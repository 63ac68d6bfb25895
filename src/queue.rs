//! # Write Queue
//!
//! The write queue funnels every network's batches into one consumer, which
//! is the only code in the process that touches the write connection.
//!
//! ## Architecture
//!
//! ```text
//!  SourceRunner(alpha) ──┐
//!                        │ submit(batch)           ┌──────────────────────────┐
//!  SourceRunner(beta) ───┼──► bounded mpsc ──────► │ consumer thread          │
//!                        │   (capacity N, FIFO)    │  current-thread runtime  │
//!  SourceRunner(...) ────┘                         │  sink.write(batch)       │
//!         ▲                                        └────────────┬─────────────┘
//!         │               WriteTicket (oneshot)                 │
//!         └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Backpressure
//!
//! `submit` waits for a free slot for at most `submit_timeout`. On timeout
//! the batch is handed back inside [`SubmitError::Timeout`]; nothing is
//! retried here. Whether to retry, drop or exit is the submitter's call.
//!
//! ## Shutdown
//!
//! `stop` cancels the consumer's wait, closes the channel to new submits and
//! drains every batch already accepted (including submits that had reserved
//! a slot) before closing the sink. Every accepted batch gets an answer on
//! its ticket.
//!
//! ## Range Ordering
//!
//! Each network's batches must start strictly after the previous accepted
//! batch ended. The handle remembers the last accepted range per network and
//! refuses overlapping or regressing batches with [`SubmitError::Rejected`],
//! whichever producer submits them. The check and the send happen under one
//! lock, so channel order matches the recorded order.
//!
//! ## Rust Pattern: Reserve, Then Send
//!
//! `Sender::reserve` claims a slot without moving the batch. If the wait
//! times out the batch was never given away, so it can be returned to the
//! caller intact.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::error::{Error, Result, SubmitError};
use crate::metrics::{MetricsSnapshot, WriteQueueMetrics};
use crate::subscription::{BatchCompletion, CompletionPublisher, CompletionSubscription};
use crate::types::{LedgerRange, NetworkName, WriteBatch, WriteSummary};
use crate::writer::BatchSink;

/// Name of the consumer thread.
pub const WRITER_THREAD_NAME: &str = "ledgerlake-writer";

/// A batch and the slot its outcome is delivered to.
struct Envelope {
    batch: WriteBatch,
    result_tx: oneshot::Sender<Result<WriteSummary>>,
}

// =============================================================================
// Tickets
// =============================================================================

/// Receipt for an accepted batch. Resolves once the consumer has written
/// (or failed) it.
#[derive(Debug)]
pub struct WriteTicket {
    network: NetworkName,
    range: LedgerRange,
    rx: oneshot::Receiver<Result<WriteSummary>>,
}

impl WriteTicket {
    /// Network of the batch.
    pub fn network(&self) -> &NetworkName {
        &self.network
    }

    /// Ledgers of the batch.
    pub fn range(&self) -> LedgerRange {
        self.range
    }

    /// Waits for the batch's outcome.
    ///
    /// `Error::WriterShutdown` if the consumer went away without answering.
    pub async fn outcome(self) -> Result<WriteSummary> {
        self.rx.await.unwrap_or(Err(Error::WriterShutdown))
    }
}

// =============================================================================
// Submit Handle
// =============================================================================

/// Submitting side of the queue. Cheap to clone, one per source runner.
#[derive(Clone)]
pub struct WriteQueueHandle {
    tx: mpsc::Sender<Envelope>,
    metrics: Arc<WriteQueueMetrics>,
    submit_timeout: Duration,
    /// Last accepted range per network.
    accepted: Arc<Mutex<HashMap<NetworkName, LedgerRange>>>,
}

impl WriteQueueHandle {
    /// Enqueues a batch, waiting up to the submit timeout for space.
    ///
    /// # Errors
    ///
    /// - [`SubmitError::Timeout`] if the queue stayed full
    /// - [`SubmitError::Closed`] if the queue is stopping or stopped
    /// - [`SubmitError::Rejected`] if the range does not follow the network's
    ///   last accepted batch
    ///
    /// All return the batch untouched.
    pub async fn submit(&self, mut batch: WriteBatch) -> std::result::Result<WriteTicket, SubmitError> {
        let permit = match timeout(self.submit_timeout, self.tx.reserve()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                debug!(network = %batch.network, range = %batch.range, "submit rejected: queue closed");
                return Err(SubmitError::Closed { batch: Box::new(batch) });
            }
            Err(_) => {
                self.metrics.record_submit_timeout(&batch.network);
                warn!(
                    network = %batch.network,
                    range = %batch.range,
                    timeout_ms = self.submit_timeout.as_millis() as u64,
                    depth = self.depth(),
                    "write queue full, submit timed out"
                );
                return Err(SubmitError::Timeout {
                    batch: Box::new(batch),
                    timeout: self.submit_timeout,
                });
            }
        };

        let mut accepted = self.accepted();
        if let Some(previous) = accepted.get(&batch.network) {
            if !batch.range.follows(previous) {
                let reason = Error::RangeRegression {
                    network: batch.network.clone(),
                    previous_end: previous.end(),
                    start: batch.range.start(),
                };
                warn!(network = %batch.network, range = %batch.range, previous = %previous, "submit rejected: range does not follow");
                return Err(SubmitError::Rejected {
                    batch: Box::new(batch),
                    reason: Box::new(reason),
                });
            }
        }
        accepted.insert(batch.network.clone(), batch.range);

        let (result_tx, rx) = oneshot::channel();
        let ticket = WriteTicket {
            network: batch.network.clone(),
            range: batch.range,
            rx,
        };
        batch.submitted_at = Some(Instant::now());
        self.metrics.record_submitted(&batch.network);
        permit.send(Envelope { batch, result_tx });
        Ok(ticket)
    }

    /// Last range accepted for `network`, if any.
    pub fn last_accepted(&self, network: &NetworkName) -> Option<LedgerRange> {
        self.accepted().get(network).copied()
    }

    fn accepted(&self) -> MutexGuard<'_, HashMap<NetworkName, LedgerRange>> {
        self.accepted.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Batches queued or reserved, not yet taken by the consumer.
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Queue capacity.
    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// True once the queue no longer accepts batches.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Configured submit timeout.
    pub fn submit_timeout(&self) -> Duration {
        self.submit_timeout
    }

    /// Current counters, with the live queue depth filled in.
    pub fn metrics(&self) -> MetricsSnapshot {
        let mut snapshot = self.metrics.snapshot();
        snapshot.queue_depth = self.depth();
        snapshot
    }
}

// =============================================================================
// Write Queue
// =============================================================================

struct Consumer {
    thread: JoinHandle<()>,
    done: oneshot::Receiver<Result<()>>,
}

/// The bounded multi-producer, single-consumer write queue.
pub struct WriteQueue {
    config: QueueConfig,
    handle: WriteQueueHandle,
    rx: Option<mpsc::Receiver<Envelope>>,
    metrics: Arc<WriteQueueMetrics>,
    completions: CompletionPublisher,
    shutdown: CancellationToken,
    fatal: CancellationToken,
    consumer: Option<Consumer>,
    monitor: Option<tokio::task::JoinHandle<()>>,
}

impl WriteQueue {
    /// Creates a queue. Nothing is consumed until [`WriteQueue::start`].
    pub fn new(config: QueueConfig) -> Result<Self> {
        if config.capacity == 0 {
            return Err(Error::Config("queue.capacity must be at least 1".into()));
        }
        let (tx, rx) = mpsc::channel(config.capacity);
        let metrics = Arc::new(WriteQueueMetrics::new(config.capacity));
        let handle = WriteQueueHandle {
            tx,
            metrics: Arc::clone(&metrics),
            submit_timeout: config.submit_timeout,
            accepted: Arc::default(),
        };
        let completions = CompletionPublisher::new(config.completion_capacity);

        Ok(Self {
            config,
            handle,
            rx: Some(rx),
            metrics,
            completions,
            shutdown: CancellationToken::new(),
            fatal: CancellationToken::new(),
            consumer: None,
            monitor: None,
        })
    }

    /// Uses `token` to signal fatal writer errors (lock conflicts).
    pub fn with_fatal_token(mut self, token: CancellationToken) -> Self {
        self.fatal = token;
        self
    }

    /// A submit handle.
    pub fn handle(&self) -> WriteQueueHandle {
        self.handle.clone()
    }

    /// Enqueues a batch. See [`WriteQueueHandle::submit`].
    pub async fn submit(&self, batch: WriteBatch) -> std::result::Result<WriteTicket, SubmitError> {
        self.handle.submit(batch).await
    }

    /// Current counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.handle.metrics()
    }

    /// Shared counters, for callers that outlive the queue.
    pub fn metrics_handle(&self) -> Arc<WriteQueueMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Subscribes to batch completion records.
    pub fn subscribe_completions(&self) -> CompletionSubscription {
        self.completions.subscribe()
    }

    /// True between `start` and `stop`.
    pub fn is_running(&self) -> bool {
        self.consumer.is_some()
    }

    /// Starts the consumer thread, which owns `sink` from here on.
    pub fn start<S: BatchSink>(&mut self, sink: S) -> Result<()> {
        let rx = self
            .rx
            .take()
            .ok_or_else(|| Error::Config("write queue already started".into()))?;

        let ctx = ConsumerContext {
            rx,
            metrics: Arc::clone(&self.metrics),
            completions: self.completions.clone(),
            shutdown: self.shutdown.clone(),
            fatal: self.fatal.clone(),
        };
        let (done_tx, done) = oneshot::channel();

        let thread = thread::Builder::new()
            .name(WRITER_THREAD_NAME.to_string())
            .spawn(move || {
                let result = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt.block_on(ctx.run(sink)),
                    Err(e) => {
                        error!(error = %e, "failed to build writer runtime");
                        Err(Error::Io(e))
                    }
                };
                let _ = done_tx.send(result);
            })?;

        self.consumer = Some(Consumer { thread, done });
        info!(capacity = self.config.capacity, "write queue started");
        Ok(())
    }

    /// Starts periodic statistics logging. Must be called inside a runtime.
    ///
    /// No-op when the monitor is disabled or already running.
    pub fn start_monitor(&mut self) {
        if !self.config.monitor_enabled || self.monitor.is_some() {
            return;
        }
        let handle = self.handle.clone();
        let shutdown = self.shutdown.clone();
        let period = self.config.monitor_interval;

        self.monitor = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => log_snapshot(&handle.metrics()),
                }
            }
        }));
    }

    /// Stops accepting batches, drains the queue and closes the sink.
    ///
    /// Idempotent. Returns the sink's close result.
    pub async fn stop(&mut self) -> Result<()> {
        self.shutdown.cancel();

        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
            let _ = monitor.await;
        }

        let Some(consumer) = self.consumer.take() else {
            // Never started: refuse new submits and answer anything queued.
            if let Some(mut rx) = self.rx.take() {
                rx.close();
                while let Ok(envelope) = rx.try_recv() {
                    let _ = envelope.result_tx.send(Err(Error::WriterShutdown));
                }
            }
            return Ok(());
        };

        let result = consumer.done.await.unwrap_or(Err(Error::WriterShutdown));
        let thread = consumer.thread;
        if let Ok(Err(_)) = tokio::task::spawn_blocking(move || thread.join()).await {
            error!("writer thread panicked");
        }

        let snapshot = self.metrics();
        info!(
            batches_written = snapshot.batches_written,
            batches_failed = snapshot.batches_failed,
            submit_timeouts = snapshot.submit_timeouts,
            "write queue stopped"
        );
        result
    }
}

impl Drop for WriteQueue {
    fn drop(&mut self) {
        // Lets a still-running consumer drain and exit.
        self.shutdown.cancel();
    }
}

// =============================================================================
// Consumer
// =============================================================================

/// State moved onto the consumer thread.
struct ConsumerContext {
    rx: mpsc::Receiver<Envelope>,
    metrics: Arc<WriteQueueMetrics>,
    completions: CompletionPublisher,
    shutdown: CancellationToken,
    fatal: CancellationToken,
}

impl ConsumerContext {
    async fn run<S: BatchSink>(mut self, mut sink: S) -> Result<()> {
        debug!("write queue consumer running");
        let mut processed: u64 = 0;

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                envelope = self.rx.recv() => match envelope {
                    Some(envelope) => {
                        self.process(&mut sink, envelope);
                        processed += 1;
                    }
                    None => break,
                },
            }
        }

        // Closing still lets reserved permits send; recv yields those too.
        self.rx.close();
        let mut drained: u64 = 0;
        while let Some(envelope) = self.rx.recv().await {
            self.process(&mut sink, envelope);
            drained += 1;
        }
        info!(processed, drained, "write queue drained");

        let result = sink.close();
        if let Err(ref e) = result {
            error!(error = %e, "closing batch sink failed");
        }
        result
    }

    fn process<S: BatchSink>(&self, sink: &mut S, envelope: Envelope) {
        let Envelope { batch, result_tx } = envelope;
        let result = sink.write(&batch);

        match &result {
            Ok(summary) => {
                self.metrics.record_written(summary);
                self.completions.publish(|| BatchCompletion::new(&batch, summary));
                debug!(
                    network = %summary.network,
                    range = %summary.range,
                    rows = summary.total_rows,
                    write_ms = summary.write_duration.as_millis() as u64,
                    queue_wait_ms = summary.queue_wait.as_millis() as u64,
                    checkpointed = summary.checkpointed,
                    "batch written"
                );
            }
            Err(e) => {
                self.metrics.record_failed(&batch.network);
                error!(
                    network = %batch.network,
                    schema = %batch.schema,
                    range = %batch.range,
                    error = %e,
                    "batch write failed"
                );
                if e.is_lock_conflict() {
                    error!("another writer holds the database; signalling fatal shutdown");
                    self.fatal.cancel();
                }
            }
        }

        if result_tx.send(result).is_err() {
            debug!(network = %batch.network, range = %batch.range, "ticket dropped before outcome");
        }
    }
}

fn log_snapshot(snapshot: &MetricsSnapshot) {
    let utilization = snapshot.utilization_pct();
    info!(
        depth = snapshot.queue_depth,
        capacity = snapshot.capacity,
        utilization_pct = utilization,
        batches_submitted = snapshot.batches_submitted,
        batches_written = snapshot.batches_written,
        batches_failed = snapshot.batches_failed,
        submit_timeouts = snapshot.submit_timeouts,
        avg_write_ms = snapshot.avg_write_latency().as_millis() as u64,
        "write queue stats"
    );
    for (network, stats) in &snapshot.networks {
        debug!(
            network = %network,
            batches_written = stats.batches_written,
            ledgers_written = stats.ledgers_written,
            rows_written = stats.rows_written,
            avg_write_ms = stats.avg_write_latency().as_millis() as u64,
            avg_queue_wait_ms = stats.avg_queue_wait().as_millis() as u64,
            "network write stats"
        );
    }
    if utilization >= 80.0 {
        warn!(utilization_pct = utilization, "write queue near capacity");
    }
}
