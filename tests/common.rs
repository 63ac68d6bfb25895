#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::time::Duration;

use ledgerlake::config::{QueueConfig, StorageConfig};
use ledgerlake::synthetic::{ledger_row, SyntheticSource};
use ledgerlake::{
    AppConfig, BatchSink, Error, LedgerRange, LedgerSource, LedgerTable, NetworkName, Result, SchemaName,
    SourceConfig, TableRows, WriteBatch, WriteSummary,
};
use rusqlite::{Connection, OpenFlags};
use tokio::sync::mpsc;

pub fn temp_db() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join("ledgers.db");
    (dir, path)
}

/// An AppConfig over `path` with one source entry per network, tuned for tests.
pub fn app_config(path: &Path, networks: &[&str], batch_size: usize) -> AppConfig {
    let mut config = AppConfig::default();
    config.storage = StorageConfig {
        path: path.to_path_buf(),
        ..StorageConfig::default()
    };
    config.queue.monitor_enabled = false;
    config.query.readers = 2;
    config.sources = networks
        .iter()
        .map(|n| SourceConfig {
            batch_size,
            flush_interval: Duration::from_millis(200),
            ..SourceConfig::named(*n)
        })
        .collect();
    config
}

pub fn sources(networks: &[&str], ledgers: u32) -> Vec<Box<dyn LedgerSource>> {
    networks
        .iter()
        .map(|n| Box::new(SyntheticSource::new(*n, 1, ledgers)) as Box<dyn LedgerSource>)
        .collect()
}

pub fn queue_config(capacity: usize, submit_timeout: Duration) -> QueueConfig {
    QueueConfig {
        capacity,
        submit_timeout,
        monitor_enabled: false,
        ..QueueConfig::default()
    }
}

pub fn schema(network: &str) -> SchemaName {
    SchemaName::for_network(&NetworkName::new(network)).expect("valid schema")
}

/// A batch with one `ledgers` row per ledger in `start..=end`.
pub fn batch(network: &str, start: u32, end: u32) -> WriteBatch {
    let net = NetworkName::new(network);
    let mut tables = TableRows::new();
    for seq in start..=end {
        tables.push(LedgerTable::Ledgers, ledger_row(&net, seq, 0, 0));
    }
    WriteBatch::new(
        net,
        schema(network),
        LedgerRange::new(start, end).expect("valid range"),
        tables,
    )
}

pub fn open_read_only(path: &Path) -> Connection {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .expect("open read-only connection")
}

pub fn count(conn: &Connection, network: &str, table: LedgerTable) -> i64 {
    let sql = format!("SELECT COUNT(*) FROM {}__{}", schema(network), table.name());
    conn.query_row(&sql, [], |row| row.get(0)).expect("count rows")
}

pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}

// =============================================================================
// Instrumented Sinks
// =============================================================================

/// Records every write and flags any overlapping call.
#[derive(Clone, Default)]
pub struct GuardSink {
    in_write: Arc<AtomicBool>,
    pub overlaps: Arc<AtomicUsize>,
    pub written: Arc<Mutex<Vec<(NetworkName, LedgerRange)>>>,
    pub closed: Arc<AtomicBool>,
    pub hold: Duration,
}

impl GuardSink {
    pub fn new(hold: Duration) -> Self {
        Self {
            hold,
            ..Self::default()
        }
    }

    pub fn written(&self) -> Vec<(NetworkName, LedgerRange)> {
        self.written.lock().unwrap().clone()
    }
}

impl BatchSink for GuardSink {
    fn write(&mut self, batch: &WriteBatch) -> Result<WriteSummary> {
        if self.in_write.swap(true, Ordering::SeqCst) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        std::thread::sleep(self.hold);
        self.written
            .lock()
            .unwrap()
            .push((batch.network.clone(), batch.range));
        self.in_write.store(false, Ordering::SeqCst);
        Ok(WriteSummary::from_batch(batch, self.hold, false))
    }

    fn close(&mut self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Blocks inside `write` until the test releases it.
///
/// Each call announces its batch range on `entered`, then waits for one unit
/// on the gate. Dropping the gate sender releases every later call.
pub struct GatedSink {
    gate: std_mpsc::Receiver<()>,
    entered: mpsc::UnboundedSender<LedgerRange>,
    fail_network: Option<NetworkName>,
}

pub struct Gate {
    pub release: std_mpsc::Sender<()>,
    pub entered: mpsc::UnboundedReceiver<LedgerRange>,
}

impl Gate {
    pub fn open(&self, n: usize) {
        for _ in 0..n {
            let _ = self.release.send(());
        }
    }
}

impl GatedSink {
    pub fn new() -> (Self, Gate) {
        let (release, gate) = std_mpsc::channel();
        let (entered_tx, entered) = mpsc::unbounded_channel();
        (
            Self {
                gate,
                entered: entered_tx,
                fail_network: None,
            },
            Gate { release, entered },
        )
    }

    /// Fails every batch of `network` after it passes the gate.
    pub fn failing(mut self, network: &str) -> Self {
        self.fail_network = Some(NetworkName::new(network));
        self
    }
}

impl BatchSink for GatedSink {
    fn write(&mut self, batch: &WriteBatch) -> Result<WriteSummary> {
        let _ = self.entered.send(batch.range);
        let _ = self.gate.recv();
        if self.fail_network.as_ref() == Some(&batch.network) {
            return Err(Error::Schema(format!("injected failure for {}", batch.network)));
        }
        Ok(WriteSummary::from_batch(batch, Duration::ZERO, false))
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
