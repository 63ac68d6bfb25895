//! ledgerlake Stress Test Binary
//!
//! Runs several synthetic networks through one orchestrator and checks that
//! every ledger landed in its own schema.
//! Run with: `cargo run --bin stress_test -- [OPTIONS]`
//!
//! # Examples
//!
//! ```bash
//! # Default: 3 networks, 1000 ledgers each
//! cargo run --release --bin stress_test
//!
//! # Heavy ledgers through a tiny queue
//! cargo run --release --bin stress_test -- --networks 8 --txs 20 --ops 3 --queue-capacity 2
//!
//! # Start from a TOML config; sources are replaced by synthetic ones
//! cargo run --release --bin stress_test -- --config ledgerlake.toml
//! ```

use std::path::PathBuf;
use std::process::exit;
use std::str::FromStr;
use std::time::Instant;

use ledgerlake::logging::init_logging;
use ledgerlake::{AppConfig, CommitMode, LedgerSource, LedgerTable, Orchestrator, SourceConfig};
use ledgerlake::synthetic::SyntheticSource;

/// Stress test configuration
struct Config {
    /// Number of synthetic networks
    networks: usize,
    /// Ledgers per network
    ledgers: u32,
    /// Ledgers per batch
    batch_size: usize,
    /// Write queue capacity
    queue_capacity: usize,
    /// Transactions per ledger
    txs: usize,
    /// Operations per transaction
    ops: usize,
    /// Commit granularity
    commit_mode: CommitMode,
    /// Base TOML config
    config_path: Option<PathBuf>,
    /// Path to database file (or temp if None)
    db_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            networks: 3,
            ledgers: 1000,
            batch_size: 50,
            queue_capacity: 100,
            txs: 2,
            ops: 2,
            commit_mode: CommitMode::Atomic,
            config_path: None,
            db_path: None,
        }
    }
}

fn value<T: FromStr>(args: &[String], i: usize, flag: &str) -> T {
    match args.get(i).map(|s| s.parse()) {
        Some(Ok(v)) => v,
        _ => {
            eprintln!("Invalid or missing value for {}", flag);
            exit(1);
        }
    }
}

fn parse_args() -> Config {
    let args: Vec<String> = std::env::args().collect();
    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--networks" | "-n" => {
                i += 1;
                config.networks = value(&args, i, "--networks");
            }
            "--ledgers" | "-l" => {
                i += 1;
                config.ledgers = value(&args, i, "--ledgers");
            }
            "--batch-size" | "-b" => {
                i += 1;
                config.batch_size = value(&args, i, "--batch-size");
            }
            "--queue-capacity" | "-q" => {
                i += 1;
                config.queue_capacity = value(&args, i, "--queue-capacity");
            }
            "--txs" => {
                i += 1;
                config.txs = value(&args, i, "--txs");
            }
            "--ops" => {
                i += 1;
                config.ops = value(&args, i, "--ops");
            }
            "--per-table" => {
                config.commit_mode = CommitMode::PerTable;
            }
            "--config" | "-c" => {
                i += 1;
                config.config_path = Some(value(&args, i, "--config"));
            }
            "--db" | "-d" => {
                i += 1;
                config.db_path = Some(value(&args, i, "--db"));
            }
            "--help" | "-h" => {
                println!(
                    r#"ledgerlake Stress Test

Usage: stress_test [OPTIONS]

Options:
  -n, --networks <N>        Synthetic networks (default: 3)
  -l, --ledgers <N>         Ledgers per network (default: 1000)
  -b, --batch-size <N>      Ledgers per batch (default: 50)
  -q, --queue-capacity <N>  Write queue capacity (default: 100)
  --txs <N>                 Transactions per ledger (default: 2)
  --ops <N>                 Operations per transaction (default: 2)
  --per-table               Commit each table separately
  -c, --config <PATH>       Base TOML config
  -d, --db <PATH>           Database path (default: temp file)
  -h, --help                Show this help
"#
                );
                exit(0);
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                exit(1);
            }
        }
        i += 1;
    }

    config
}

#[tokio::main]
async fn main() {
    let args = parse_args();

    let mut config = match &args.config_path {
        Some(path) => AppConfig::load(path).unwrap_or_else(|e| {
            eprintln!("{}", e);
            exit(1);
        }),
        None => AppConfig::default(),
    };
    if let Err(e) = init_logging(&config.log) {
        eprintln!("{}", e);
        exit(1);
    }

    let temp_dir = std::env::temp_dir().join(format!("ledgerlake-stress-{}", std::process::id()));
    if let Err(e) = std::fs::create_dir_all(&temp_dir) {
        eprintln!("cannot create {}: {}", temp_dir.display(), e);
        exit(1);
    }
    config.storage.path = args.db_path.clone().unwrap_or_else(|| temp_dir.join("stress.db"));
    config.queue.capacity = args.queue_capacity;
    config.writer.commit_mode = args.commit_mode;

    println!("ledgerlake Stress Test");
    println!("======================");
    println!("Networks:    {}", args.networks);
    println!("Ledgers:     {} per network", args.ledgers);
    println!("Batch size:  {}", args.batch_size);
    println!("Queue:       {}", args.queue_capacity);
    println!("Rows/ledger: {}", 1 + args.txs + args.txs * args.ops);
    println!("Commit mode: {:?}", args.commit_mode);
    println!("Database:    {}", config.storage.path.display());
    println!();

    let mut sources: Vec<Box<dyn LedgerSource>> = Vec::with_capacity(args.networks);
    config.sources.clear();
    for n in 0..args.networks {
        let name = format!("net{}", n);
        config.sources.push(SourceConfig {
            batch_size: args.batch_size,
            ..SourceConfig::named(name.clone())
        });
        sources.push(Box::new(
            SyntheticSource::new(name.as_str(), 1, args.ledgers)
                .with_transactions(args.txs)
                .with_operations(args.ops),
        ));
    }

    let mut orchestrator = match Orchestrator::init(config, sources) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("init failed: {}", e);
            exit(1);
        }
    };

    println!("Starting stress test...");
    let start = Instant::now();
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let report = match orchestrator.run_until(ctrl_c).await {
        Ok(r) => r,
        Err(e) => {
            eprintln!("run failed: {}", e);
            exit(1);
        }
    };
    let elapsed = start.elapsed();
    let m = &report.metrics;

    println!();
    println!("Results");
    println!("-------");
    println!("Batches written:  {}", m.batches_written);
    println!("Batches failed:   {}", m.batches_failed);
    println!("Submit timeouts:  {}", m.submit_timeouts);
    println!("Ledgers written:  {}", m.ledgers_written);
    println!("Rows written:     {}", m.rows_written);
    println!("Avg write:        {:?}", m.avg_write_latency());
    println!("Duration:         {:?}", elapsed);
    println!("Throughput:       {:.2} rows/sec", m.rows_written as f64 / elapsed.as_secs_f64());
    println!();

    // Verify from a fresh read-only connection
    println!("Verifying...");
    let conn = match rusqlite::Connection::open_with_flags(
        &report_path(&args, &temp_dir),
        rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
    ) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("cannot reopen database: {}", e);
            exit(1);
        }
    };

    let mut failed = !report.is_clean();
    for n in 0..args.networks {
        let table = format!("net{}__{}", n, LedgerTable::Ledgers.name());
        let count: i64 = conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
            .unwrap_or(-1);
        let ok = count == i64::from(args.ledgers);
        failed |= !ok;
        println!("  net{}: {} ledgers {}", n, count, if ok { "✓" } else { "✗" });
    }

    println!();
    if failed {
        println!("Stress test FAILED");
        exit(1);
    }
    println!("Stress test PASSED ✓");
}

fn report_path(args: &Config, temp_dir: &std::path::Path) -> PathBuf {
    args.db_path.clone().unwrap_or_else(|| temp_dir.join("stress.db"))
}
