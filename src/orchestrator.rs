//! # Orchestrator
//!
//! Wires storage, the write queue, the batch writer, the read pool and one
//! source runner per network into a single process lifecycle.
//!
//! ## Lifecycle
//!
//! ```text
//!  init() ──► Initialized ──start()──► Running ──stop()──► Stopped
//!    │                                    │
//!    ├─ open storage                      ├─ consumer thread owns the writer
//!    ├─ provision every schema (fatal)    ├─ monitor task
//!    ├─ build the write queue             └─ one tokio task per source runner
//!    └─ open the read pool
//! ```
//!
//! `stop()` tears down in dependency order: runners first (they stop
//! producing and settle their in-flight batches), then the queue (drains and
//! closes the writer, which flushes every appender and truncates the WAL),
//! then the read pool, then the storage handle.
//!
//! ## Fatal Errors
//!
//! A lock conflict means something else is writing to the database file. The
//! queue cancels the fatal token; the orchestrator reacts by cancelling the
//! shutdown token so every runner stops. [`Orchestrator::run_until`] returns
//! early in that case.

use std::collections::HashSet;
use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::checkpoint::ResumeStore;
use crate::config::{AppConfig, SourceConfig};
use crate::error::{Error, Result};
use crate::metrics::MetricsSnapshot;
use crate::queue::{WriteQueue, WriteQueueHandle};
use crate::reader::ReadPool;
use crate::source::{LedgerSource, RunnerExit, RunnerReport, SourceRunner};
use crate::storage::Storage;
use crate::subscription::CompletionSubscription;
use crate::types::{NetworkName, SchemaName};
use crate::writer::BatchWriter;

/// Where the orchestrator is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Storage open, schemas provisioned, nothing running.
    Initialized,
    /// Writer and runners active.
    Running,
    /// Everything shut down.
    Stopped,
}

/// One network's binding: names, settings and (until start) its source.
struct NetworkBinding {
    network: NetworkName,
    schema: SchemaName,
    config: SourceConfig,
    source: Option<Box<dyn LedgerSource>>,
}

/// Outcome of a full run.
#[derive(Debug)]
pub struct OrchestratorReport {
    /// One report per runner that was started.
    pub runners: Vec<RunnerReport>,
    /// Final queue counters.
    pub metrics: MetricsSnapshot,
    /// True if a fatal writer error occurred.
    pub fatal: bool,
    /// First error hit while closing the writer or storage.
    pub shutdown_error: Option<Error>,
}

impl OrchestratorReport {
    /// Report of `network`'s runner.
    pub fn runner(&self, network: &NetworkName) -> Option<&RunnerReport> {
        self.runners.iter().find(|r| &r.network == network)
    }

    /// True if nothing failed: no fatal error, no failed runner, clean close.
    pub fn is_clean(&self) -> bool {
        !self.fatal && self.shutdown_error.is_none() && self.runners.iter().all(|r| !r.exit.is_failure())
    }
}

/// The top-level ingestion process.
pub struct Orchestrator {
    config: AppConfig,
    state: LifecycleState,
    storage: Option<Storage>,
    queue: WriteQueue,
    bindings: Vec<NetworkBinding>,
    read_pool: Option<ReadPool>,
    runners: Vec<JoinHandle<RunnerReport>>,
    finished: Vec<RunnerReport>,
    shutdown: CancellationToken,
    fatal: CancellationToken,
    fatal_watch: Option<JoinHandle<()>>,
}

impl Orchestrator {
    /// Validates `config`, opens storage and provisions one schema per source.
    ///
    /// `sources[i]` is bound to `config.sources[i]`.
    ///
    /// # Errors
    ///
    /// - `Error::Config` for invalid settings, mismatched source counts, or
    ///   two sources resolving to the same network or schema
    /// - `Error::Schema` if provisioning fails; nothing is started
    pub fn init(config: AppConfig, sources: Vec<Box<dyn LedgerSource>>) -> Result<Self> {
        config.validate()?;
        if sources.len() != config.sources.len() {
            return Err(Error::Config(format!(
                "{} sources supplied for {} configured networks",
                sources.len(),
                config.sources.len()
            )));
        }

        let mut bindings = Vec::with_capacity(sources.len());
        let mut seen_networks = HashSet::new();
        let mut seen_schemas = HashSet::new();
        for (i, (source_config, source)) in config.sources.iter().zip(sources).enumerate() {
            let network = source_config.network_name(i);
            let schema = SchemaName::for_network(&network)?;
            if !seen_networks.insert(network.clone()) {
                return Err(Error::Config(format!("network '{}' configured twice", network)));
            }
            if !seen_schemas.insert(schema.clone()) {
                return Err(Error::Config(format!(
                    "network '{}' maps to schema '{}', which another network already uses",
                    network, schema
                )));
            }
            bindings.push(NetworkBinding {
                network,
                schema,
                config: source_config.clone(),
                source: Some(source),
            });
        }

        let storage = Storage::open(&config.storage)?;
        for binding in &bindings {
            if let Err(e) = storage.provision(&binding.network, &binding.schema) {
                error!(network = %binding.network, schema = %binding.schema, error = %e, "schema provisioning failed");
                return Err(e);
            }
        }

        let fatal = CancellationToken::new();
        let queue = WriteQueue::new(config.queue.clone())?.with_fatal_token(fatal.clone());
        let read_pool = if config.query.enabled {
            Some(storage.open_read_pool(&config.query)?)
        } else {
            None
        };

        info!(
            networks = bindings.len(),
            path = %config.storage.path.display(),
            query_surface = read_pool.is_some(),
            "orchestrator initialized"
        );

        Ok(Self {
            config,
            state: LifecycleState::Initialized,
            storage: Some(storage),
            queue,
            bindings,
            read_pool,
            runners: Vec::new(),
            finished: Vec::new(),
            shutdown: CancellationToken::new(),
            fatal,
            fatal_watch: None,
        })
    }

    /// Starts the writer, the monitor and every source runner.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(&mut self) -> Result<()> {
        if self.state != LifecycleState::Initialized {
            return Err(Error::Config(format!("cannot start from state {:?}", self.state)));
        }
        let storage = self.storage.as_mut().ok_or(Error::WriterShutdown)?;

        let writer = BatchWriter::new(storage.take_writer()?, self.config.writer.clone(), Some(storage.wal_path()))?;
        self.queue.start(writer)?;
        self.queue.start_monitor();

        let fatal = self.fatal.clone();
        let shutdown = self.shutdown.clone();
        self.fatal_watch = Some(tokio::spawn(async move {
            tokio::select! {
                _ = fatal.cancelled() => {
                    error!("fatal writer error; stopping all source runners");
                    shutdown.cancel();
                }
                _ = shutdown.cancelled() => {}
            }
        }));

        for binding in &mut self.bindings {
            let Some(source) = binding.source.take() else {
                continue;
            };
            let mut runner = SourceRunner::new(
                binding.network.clone(),
                binding.schema.clone(),
                source,
                self.queue.handle(),
                binding.config.clone(),
                self.shutdown.child_token(),
            );
            if self.config.resume.enabled {
                runner = runner.with_resume(ResumeStore::new(&self.config.resume.dir, &binding.network));
            }
            self.runners.push(tokio::spawn(runner.run()));
        }

        self.state = LifecycleState::Running;
        info!(runners = self.runners.len(), "orchestrator running");
        Ok(())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// (network, schema) bindings in configuration order.
    pub fn networks(&self) -> Vec<(NetworkName, SchemaName)> {
        self.bindings
            .iter()
            .map(|b| (b.network.clone(), b.schema.clone()))
            .collect()
    }

    /// Schema bound to `network`.
    pub fn schema_for(&self, network: &NetworkName) -> Option<&SchemaName> {
        self.bindings.iter().find(|b| &b.network == network).map(|b| &b.schema)
    }

    /// Submit handle for extra producers.
    pub fn queue_handle(&self) -> WriteQueueHandle {
        self.queue.handle()
    }

    /// Current queue counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.queue.metrics()
    }

    /// The query surface, if enabled.
    pub fn read_pool(&self) -> Option<&ReadPool> {
        self.read_pool.as_ref()
    }

    /// Subscribes to batch completion records.
    pub fn subscribe_completions(&self) -> CompletionSubscription {
        self.queue.subscribe_completions()
    }

    /// Cancelled when the writer hits a fatal error.
    pub fn fatal_token(&self) -> CancellationToken {
        self.fatal.clone()
    }

    /// Waits for every runner to finish on its own (source exhausted or failed).
    ///
    /// Cancel safe: reports of runners that already finished are kept.
    pub async fn join_runners(&mut self) {
        while let Some(handle) = self.runners.first_mut() {
            let joined = handle.await;
            self.runners.remove(0);
            match joined {
                Ok(report) => self.finished.push(report),
                Err(e) => error!(error = %e, "source runner task panicked"),
            }
        }
    }

    /// Stops everything in dependency order and reports the run.
    ///
    /// # Errors
    ///
    /// `Error::Config` if already stopped. Failures while closing are
    /// reported in [`OrchestratorReport::shutdown_error`].
    pub async fn stop(&mut self) -> Result<OrchestratorReport> {
        if self.state == LifecycleState::Stopped {
            return Err(Error::Config("orchestrator already stopped".into()));
        }
        info!("orchestrator stopping");
        self.shutdown.cancel();
        self.join_runners().await;

        if let Some(watch) = self.fatal_watch.take() {
            let _ = watch.await;
        }

        let mut shutdown_error = None;
        if let Err(e) = self.queue.stop().await {
            error!(error = %e, "closing the batch writer failed");
            shutdown_error.get_or_insert(e);
        }
        if let Some(pool) = self.read_pool.take() {
            pool.shutdown().await;
        }
        if let Some(storage) = self.storage.take() {
            if let Err(e) = storage.close() {
                error!(error = %e, "closing storage failed");
                shutdown_error.get_or_insert(e);
            }
        }
        self.state = LifecycleState::Stopped;

        let runners = std::mem::take(&mut self.finished);
        for report in &runners {
            if let RunnerExit::Failed(e) = &report.exit {
                warn!(network = %report.network, error = %e, "runner ended with failure");
            }
        }
        let report = OrchestratorReport {
            runners,
            metrics: self.queue.metrics(),
            fatal: self.fatal.is_cancelled(),
            shutdown_error,
        };
        info!(
            batches_written = report.metrics.batches_written,
            batches_failed = report.metrics.batches_failed,
            fatal = report.fatal,
            "orchestrator stopped"
        );
        Ok(report)
    }

    /// Starts (if needed), runs until `signal` resolves, every runner
    /// finishes, or a fatal error occurs, then stops.
    pub async fn run_until<F>(&mut self, signal: F) -> Result<OrchestratorReport>
    where
        F: Future<Output = ()>,
    {
        if self.state == LifecycleState::Initialized {
            self.start()?;
        }
        let fatal = self.fatal.clone();
        tokio::select! {
            _ = signal => info!("shutdown signal received"),
            _ = fatal.cancelled() => warn!("fatal error; shutting down"),
            _ = self.join_runners() => info!("all source runners finished"),
        }
        self.stop().await
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
