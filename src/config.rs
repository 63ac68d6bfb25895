//! Configuration
//!
//! Every section deserializes from TOML with `#[serde(default)]`, so a minimal
//! file only names what differs from the defaults. Durations use humantime
//! strings (`"30s"`, `"250ms"`).
//!
//! ```toml
//! [storage]
//! path = "ingest.db"
//!
//! [queue]
//! capacity = 100
//! submit_timeout = "30s"
//!
//! [writer]
//! commit_mode = "atomic"
//!
//! [writer.checkpoint]
//! policy = "every_n_batches"
//! batches = 10
//!
//! [[sources]]
//! passphrase = "Public Global Stellar Network ; September 2015"
//! start_ledger = 50000000
//! batch_size = 100
//! ```
//!
//! # Defaults
//!
//! Queue capacity 100, submit timeout 30s, monitor interval 10s: the values the
//! ingestion service has run with in production. The WAL auto-checkpoint
//! threshold defaults to 262144 pages (1 GiB at 4 KiB pages); the batch writer
//! checkpoints far more often than that.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::types::{network_name_from_passphrase, NetworkName};

// =============================================================================
// Top Level
// =============================================================================

/// Complete configuration of one ingestion process.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Database file and engine settings.
    pub storage: StorageConfig,
    /// Write queue sizing and timeouts.
    pub queue: QueueConfig,
    /// Batch writer commit and checkpoint behaviour.
    pub writer: WriterConfig,
    /// Read-only query surface.
    pub query: QueryConfig,
    /// Per-network resume checkpoints.
    pub resume: ResumeConfig,
    /// Logging.
    pub log: LogConfig,
    /// One entry per network, in the same order as the supplied sources.
    pub sources: Vec<SourceConfig>,
}

impl AppConfig {
    /// Reads and parses a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        text.parse()
    }

    /// Checks values serde cannot express as types.
    pub fn validate(&self) -> Result<()> {
        if self.queue.capacity == 0 {
            return Err(Error::Config("queue.capacity must be at least 1".into()));
        }
        if self.queue.submit_timeout.is_zero() {
            return Err(Error::Config("queue.submit_timeout must be greater than zero".into()));
        }
        if self.queue.monitor_enabled && self.queue.monitor_interval.is_zero() {
            return Err(Error::Config("queue.monitor_interval must be greater than zero".into()));
        }
        if self.query.enabled && self.query.readers == 0 {
            return Err(Error::Config("query.readers must be at least 1".into()));
        }
        if let CheckpointPolicy::EveryNBatches { batches: 0 } = self.writer.checkpoint {
            return Err(Error::Config("writer.checkpoint.batches must be at least 1".into()));
        }
        for (i, source) in self.sources.iter().enumerate() {
            source.validate().map_err(|e| Error::Config(format!("sources[{}]: {}", i, e)))?;
        }
        Ok(())
    }
}

impl FromStr for AppConfig {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(s).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

// =============================================================================
// Storage
// =============================================================================

/// Database file settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file, created if missing.
    /// Default: ledgerlake.db
    pub path: PathBuf,

    /// Engine auto-checkpoint threshold in WAL pages, configured once at open.
    /// Default: 262144
    pub wal_autocheckpoint_pages: u32,

    /// How long the writer waits on a held lock before reporting a conflict.
    /// Default: 5s
    #[serde(with = "humantime_serde")]
    pub busy_timeout: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("ledgerlake.db"),
            wal_autocheckpoint_pages: 262_144,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

// =============================================================================
// Queue
// =============================================================================

/// Write queue settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum batches waiting for the writer.
    /// Default: 100
    pub capacity: usize,

    /// Longest a submit waits for space before failing.
    /// Default: 30s
    #[serde(with = "humantime_serde")]
    pub submit_timeout: Duration,

    /// Log queue statistics periodically.
    /// Default: true
    pub monitor_enabled: bool,

    /// Statistics interval.
    /// Default: 10s
    #[serde(with = "humantime_serde")]
    pub monitor_interval: Duration,

    /// Batch completion records buffered per subscriber before it lags.
    /// Default: 1024
    pub completion_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            submit_timeout: Duration::from_secs(30),
            monitor_enabled: true,
            monitor_interval: Duration::from_secs(10),
            completion_capacity: 1024,
        }
    }
}

// =============================================================================
// Writer
// =============================================================================

/// How table appends of one batch are committed.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommitMode {
    /// Each table's flush commits on its own. A failure on a later table
    /// leaves earlier tables of the same batch committed.
    PerTable,
    /// The whole batch commits in one transaction, or not at all.
    #[default]
    Atomic,
}

/// When the writer checkpoints the WAL after a successful batch.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum CheckpointPolicy {
    /// After every batch.
    #[default]
    EveryBatch,
    /// After every `batches` batches.
    EveryNBatches {
        /// Batches between checkpoints
        batches: u64,
    },
    /// When the WAL file reaches `bytes`.
    SizeThreshold {
        /// WAL size that triggers a checkpoint
        bytes: u64,
    },
    /// When `interval` has passed since the last checkpoint.
    Periodic {
        /// Minimum time between checkpoints
        #[serde(with = "humantime_serde")]
        interval: Duration,
    },
    /// Never; rely on the engine's auto-checkpoint.
    Disabled,
}

/// Batch writer settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Commit granularity.
    /// Default: atomic
    pub commit_mode: CommitMode,

    /// Post-batch checkpoint policy.
    /// Default: every_batch
    pub checkpoint: CheckpointPolicy,
}

// =============================================================================
// Query Surface
// =============================================================================

/// Read-only query surface settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Open the read pool at start.
    /// Default: true
    pub enabled: bool,

    /// Reader threads, each with its own read-only connection.
    /// Default: 4
    pub readers: usize,

    /// Longest a single query may run.
    /// Default: 30s
    #[serde(with = "humantime_serde")]
    pub query_timeout: Duration,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            readers: 4,
            query_timeout: Duration::from_secs(30),
        }
    }
}

// =============================================================================
// Resume Checkpoints
// =============================================================================

/// Where per-network resume files live.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResumeConfig {
    /// Persist and honour resume files.
    /// Default: false
    pub enabled: bool,

    /// Directory holding `checkpoint-<network>.json`.
    /// Default: current directory
    pub dir: PathBuf,
}

impl Default for ResumeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: PathBuf::from("."),
        }
    }
}

// =============================================================================
// Logging
// =============================================================================

/// Log level
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level - very verbose
    Trace,
    /// Debug level - per-batch detail
    Debug,
    /// Info level - lifecycle and throughput (default)
    #[default]
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl LogLevel {
    /// Convert to tracing level filter string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable console output (default)
    #[default]
    Console,
    /// JSON structured logging
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Level filter; `RUST_LOG` overrides it when set.
    pub level: LogLevel,
    /// Output format.
    pub format: LogFormat,
}

// =============================================================================
// Sources
// =============================================================================

/// What a source runner does when the writer fails one of its batches.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Exit the runner.
    #[default]
    Stop,
    /// Log the lost range and keep ingesting.
    Skip,
}

/// Per-network source runner settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Explicit network name; wins over `passphrase`.
    pub network: Option<String>,

    /// Network passphrase, mapped to a well-known name.
    pub passphrase: Option<String>,

    /// First ledger to ingest when no resume file exists.
    /// Default: 1
    pub start_ledger: u32,

    /// Ledgers per batch.
    /// Default: 50
    pub batch_size: usize,

    /// Submit a partial batch after this long.
    /// Default: 5s
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Submitted batches awaiting their outcome at once.
    /// Default: 2
    pub max_in_flight: usize,

    /// Resubmissions after a submit timeout. 0 surfaces the first timeout.
    /// Default: 0
    pub submit_retries: u32,

    /// Pause before each resubmission.
    /// Default: 1s
    #[serde(with = "humantime_serde")]
    pub submit_backoff: Duration,

    /// Reaction to a failed batch.
    /// Default: stop
    pub on_write_failure: FailurePolicy,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            network: None,
            passphrase: None,
            start_ledger: 1,
            batch_size: 50,
            flush_interval: Duration::from_secs(5),
            max_in_flight: 2,
            submit_retries: 0,
            submit_backoff: Duration::from_secs(1),
            on_write_failure: FailurePolicy::Stop,
        }
    }
}

impl SourceConfig {
    /// A config for a named network with default settings.
    pub fn named(network: impl Into<String>) -> Self {
        Self {
            network: Some(network.into()),
            ..Self::default()
        }
    }

    /// Resolves the network name of the source at position `index`.
    ///
    /// Explicit name first, then a well-known passphrase, then `network_<index>`.
    pub fn network_name(&self, index: usize) -> NetworkName {
        if let Some(name) = &self.network {
            return NetworkName::new(name.clone());
        }
        if let Some(name) = self.passphrase.as_deref().and_then(network_name_from_passphrase) {
            return NetworkName::new(name);
        }
        NetworkName::new(format!("network_{}", index))
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.batch_size == 0 {
            return Err("batch_size must be at least 1".into());
        }
        if self.max_in_flight == 0 {
            return Err("max_in_flight must be at least 1".into());
        }
        if self.flush_interval.is_zero() {
            return Err("flush_interval must be greater than zero".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MAINNET_PASSPHRASE, TESTNET_PASSPHRASE};

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.queue.capacity, 100);
        assert_eq!(config.queue.submit_timeout, Duration::from_secs(30));
        assert_eq!(config.queue.monitor_interval, Duration::from_secs(10));
        assert_eq!(config.writer.commit_mode, CommitMode::Atomic);
        assert_eq!(config.writer.checkpoint, CheckpointPolicy::EveryBatch);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_empty() {
        let config: AppConfig = "".parse().unwrap();
        assert_eq!(config.queue.capacity, 100);
        assert!(config.sources.is_empty());
    }

    #[test]
    fn test_deserialize_full() {
        let toml = r#"
[storage]
path = "/var/lib/ingest/ledgers.db"
busy_timeout = "250ms"

[queue]
capacity = 8
submit_timeout = "1s"
monitor_enabled = false

[writer]
commit_mode = "per_table"

[writer.checkpoint]
policy = "periodic"
interval = "2m"

[query]
readers = 2
query_timeout = "5s"

[log]
level = "debug"
format = "json"

[[sources]]
passphrase = "Test SDF Network ; September 2015"
start_ledger = 1000
batch_size = 250
submit_retries = 3
on_write_failure = "skip"

[[sources]]
network = "alpha"
"#;
        let config: AppConfig = toml.parse().unwrap();
        assert_eq!(config.storage.path, PathBuf::from("/var/lib/ingest/ledgers.db"));
        assert_eq!(config.storage.busy_timeout, Duration::from_millis(250));
        assert_eq!(config.queue.capacity, 8);
        assert!(!config.queue.monitor_enabled);
        assert_eq!(config.writer.commit_mode, CommitMode::PerTable);
        assert_eq!(
            config.writer.checkpoint,
            CheckpointPolicy::Periodic {
                interval: Duration::from_secs(120)
            }
        );
        assert_eq!(config.query.readers, 2);
        assert_eq!(config.log.level, LogLevel::Debug);
        assert_eq!(config.log.format, LogFormat::Json);

        assert_eq!(config.sources.len(), 2);
        assert_eq!(config.sources[0].network_name(0).as_str(), "testnet");
        assert_eq!(config.sources[0].batch_size, 250);
        assert_eq!(config.sources[0].submit_retries, 3);
        assert_eq!(config.sources[0].on_write_failure, FailurePolicy::Skip);
        assert_eq!(config.sources[1].network_name(1).as_str(), "alpha");
        assert_eq!(config.sources[1].batch_size, 50);
    }

    #[test]
    fn test_checkpoint_policy_variants() {
        let policy: WriterConfig = toml::from_str(
            r#"
[checkpoint]
policy = "size_threshold"
bytes = 67108864
"#,
        )
        .unwrap();
        assert_eq!(policy.checkpoint, CheckpointPolicy::SizeThreshold { bytes: 64 << 20 });

        let policy: WriterConfig = toml::from_str("[checkpoint]\npolicy = \"disabled\"\n").unwrap();
        assert_eq!(policy.checkpoint, CheckpointPolicy::Disabled);
    }

    #[test]
    fn test_network_name_resolution() {
        let explicit = SourceConfig {
            network: Some("custom".into()),
            passphrase: Some(MAINNET_PASSPHRASE.into()),
            ..SourceConfig::default()
        };
        assert_eq!(explicit.network_name(0).as_str(), "custom");

        let known = SourceConfig {
            passphrase: Some(TESTNET_PASSPHRASE.into()),
            ..SourceConfig::default()
        };
        assert_eq!(known.network_name(3).as_str(), "testnet");

        let unknown = SourceConfig {
            passphrase: Some("Standalone Network ; February 2017".into()),
            ..SourceConfig::default()
        };
        assert_eq!(unknown.network_name(3).as_str(), "network_3");
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        assert!("[queue]\ncapacity = 0\n".parse::<AppConfig>().is_err());
        assert!("[queue]\nsubmit_timeout = \"0s\"\n".parse::<AppConfig>().is_err());
        assert!("[writer.checkpoint]\npolicy = \"every_n_batches\"\nbatches = 0\n"
            .parse::<AppConfig>()
            .is_err());
        assert!("[[sources]]\nbatch_size = 0\n".parse::<AppConfig>().is_err());
        assert!("[[sources]]\nmax_in_flight = 0\n".parse::<AppConfig>().is_err());
    }
}
