//! Write queue metrics
//!
//! Counters mutated by the submit path and the consumer, read by the monitor
//! loop and by callers through [`WriteQueueMetrics::snapshot`]. One mutex
//! guards everything: updates happen once per batch, so contention is
//! negligible next to the write itself.
//!
//! Queue depth is not counted here. It is read from the channel at snapshot
//! time (see [`crate::queue::WriteQueueHandle::metrics`]), which cannot drift.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::codec::current_time_ms;
use crate::types::{NetworkName, WriteSummary};

/// Per-network counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkStats {
    /// Batches accepted by the queue.
    pub batches_submitted: u64,
    /// Batches written successfully.
    pub batches_written: u64,
    /// Batches the writer failed.
    pub batches_failed: u64,
    /// Submits that timed out.
    pub submit_timeouts: u64,
    /// Ledgers written.
    pub ledgers_written: u64,
    /// Rows written across all tables.
    pub rows_written: u64,
    /// Cumulative time spent writing this network's batches.
    pub total_write_time: Duration,
    /// Cumulative time this network's batches waited in the queue.
    pub total_queue_wait: Duration,
    /// Unix ms of the last successful write.
    pub last_write_ms: Option<u64>,
}

impl NetworkStats {
    /// Mean write latency per successful batch.
    pub fn avg_write_latency(&self) -> Duration {
        average(self.total_write_time, self.batches_written)
    }

    /// Mean queue wait per successful batch.
    pub fn avg_queue_wait(&self) -> Duration {
        average(self.total_queue_wait, self.batches_written)
    }
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    /// Queue capacity.
    pub capacity: usize,
    /// Batches waiting in the queue when the snapshot was taken.
    pub queue_depth: usize,
    /// Batches accepted by the queue.
    pub batches_submitted: u64,
    /// Batches written successfully.
    pub batches_written: u64,
    /// Batches the writer failed.
    pub batches_failed: u64,
    /// Submits that timed out.
    pub submit_timeouts: u64,
    /// Ledgers written, all networks.
    pub ledgers_written: u64,
    /// Rows written, all networks.
    pub rows_written: u64,
    /// Cumulative write time, all networks.
    pub total_write_time: Duration,
    /// Per-network breakdown, sorted by name.
    pub networks: BTreeMap<NetworkName, NetworkStats>,
}

impl MetricsSnapshot {
    /// Mean write latency per successful batch.
    pub fn avg_write_latency(&self) -> Duration {
        average(self.total_write_time, self.batches_written)
    }

    /// Queue fill level in percent.
    pub fn utilization_pct(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.queue_depth as f64 / self.capacity as f64 * 100.0
    }

    /// Counters of one network, if it has been seen.
    pub fn network(&self, network: &NetworkName) -> Option<&NetworkStats> {
        self.networks.get(network)
    }
}

fn average(total: Duration, count: u64) -> Duration {
    if count == 0 {
        return Duration::ZERO;
    }
    total / count.min(u64::from(u32::MAX)) as u32
}

/// Shared, lock-guarded queue counters.
#[derive(Debug)]
pub struct WriteQueueMetrics {
    inner: Mutex<MetricsSnapshot>,
}

impl WriteQueueMetrics {
    /// Creates zeroed counters for a queue of `capacity`.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(MetricsSnapshot {
                capacity,
                ..MetricsSnapshot::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MetricsSnapshot> {
        // Counters stay meaningful even if a holder panicked mid-update.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A batch entered the queue.
    pub fn record_submitted(&self, network: &NetworkName) {
        let mut m = self.lock();
        m.batches_submitted += 1;
        m.networks.entry(network.clone()).or_default().batches_submitted += 1;
    }

    /// A submit gave up waiting for space.
    pub fn record_submit_timeout(&self, network: &NetworkName) {
        let mut m = self.lock();
        m.submit_timeouts += 1;
        m.networks.entry(network.clone()).or_default().submit_timeouts += 1;
    }

    /// The writer finished a batch.
    pub fn record_written(&self, summary: &WriteSummary) {
        let ledgers = summary.range.ledger_count();
        let rows = summary.total_rows as u64;

        let mut m = self.lock();
        m.batches_written += 1;
        m.ledgers_written += ledgers;
        m.rows_written += rows;
        m.total_write_time += summary.write_duration;

        let net = m.networks.entry(summary.network.clone()).or_default();
        net.batches_written += 1;
        net.ledgers_written += ledgers;
        net.rows_written += rows;
        net.total_write_time += summary.write_duration;
        net.total_queue_wait += summary.queue_wait;
        net.last_write_ms = Some(current_time_ms());
    }

    /// The writer failed a batch.
    pub fn record_failed(&self, network: &NetworkName) {
        let mut m = self.lock();
        m.batches_failed += 1;
        m.networks.entry(network.clone()).or_default().batches_failed += 1;
    }

    /// Deep copy of the counters. `queue_depth` is left at 0.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LedgerRange, SchemaName};

    fn summary(network: &str, start: u32, end: u32, rows: usize, ms: u64) -> WriteSummary {
        WriteSummary {
            network: NetworkName::new(network),
            schema: SchemaName::parse(network).unwrap(),
            range: LedgerRange::new(start, end).unwrap(),
            row_counts: Default::default(),
            total_rows: rows,
            write_duration: Duration::from_millis(ms),
            queue_wait: Duration::from_millis(1),
            checkpointed: true,
        }
    }

    #[test]
    fn test_record_written_per_network() {
        let metrics = WriteQueueMetrics::new(10);
        let alpha = NetworkName::new("alpha");

        metrics.record_submitted(&alpha);
        metrics.record_submitted(&alpha);
        metrics.record_written(&summary("alpha", 1, 250, 250, 10));
        metrics.record_written(&summary("alpha", 251, 500, 250, 30));
        metrics.record_written(&summary("beta", 1, 100, 300, 20));
        metrics.record_failed(&NetworkName::new("beta"));

        let snap = metrics.snapshot();
        assert_eq!(snap.batches_submitted, 2);
        assert_eq!(snap.batches_written, 3);
        assert_eq!(snap.batches_failed, 1);
        assert_eq!(snap.ledgers_written, 600);
        assert_eq!(snap.rows_written, 800);
        assert_eq!(snap.avg_write_latency(), Duration::from_millis(20));

        let a = snap.network(&alpha).unwrap();
        assert_eq!(a.batches_written, 2);
        assert_eq!(a.ledgers_written, 500);
        assert_eq!(a.avg_write_latency(), Duration::from_millis(20));
        assert!(a.last_write_ms.is_some());

        let b = snap.network(&NetworkName::new("beta")).unwrap();
        assert_eq!(b.batches_failed, 1);
        assert_eq!(b.rows_written, 300);
    }

    #[test]
    fn test_averages_with_no_batches() {
        let snap = WriteQueueMetrics::new(4).snapshot();
        assert_eq!(snap.avg_write_latency(), Duration::ZERO);
        assert_eq!(NetworkStats::default().avg_queue_wait(), Duration::ZERO);
    }

    #[test]
    fn test_utilization() {
        let mut snap = WriteQueueMetrics::new(4).snapshot();
        snap.queue_depth = 3;
        assert!((snap.utilization_pct() - 75.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_timeouts_counted() {
        let metrics = WriteQueueMetrics::new(1);
        metrics.record_submit_timeout(&NetworkName::new("alpha"));
        let snap = metrics.snapshot();
        assert_eq!(snap.submit_timeouts, 1);
        assert_eq!(snap.network(&NetworkName::new("alpha")).unwrap().submit_timeouts, 1);
    }
}
