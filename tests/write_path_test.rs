//! The real writer behind the queue: commit modes and lock conflicts.

mod common;

use std::time::Duration;

use common::{app_config, count, open_read_only, queue_config, schema, sources, temp_db};
use ledgerlake::config::StorageConfig;
use ledgerlake::schema::table_def;
use ledgerlake::synthetic::{ledger_row, operation_row, transaction_row};
use ledgerlake::{
    BatchWriter, CommitMode, Error, LedgerRange, LedgerTable, NetworkName, Orchestrator, Row, RunnerExit, Storage,
    TableRows, WriteBatch, WriteQueue, WriterConfig,
};
use rusqlite::types::Value;
use rusqlite::Connection;

/// Five non-empty tables; the third (operations) holds one malformed row.
fn five_table_batch(network: &str) -> WriteBatch {
    let net = NetworkName::new(network);
    let mut tables = TableRows::new();
    tables.push(LedgerTable::Ledgers, ledger_row(&net, 1, 1, 1));
    tables.push(LedgerTable::Transactions, transaction_row(&net, 1, 0, 1));
    tables.push(LedgerTable::Operations, operation_row(&net, 1, 0, 0));
    tables.push(LedgerTable::Operations, Row::new(vec![Value::Integer(1)]));
    for table in [LedgerTable::Effects, LedgerTable::Trades] {
        let arity = table_def(table).arity();
        tables.push(table, Row::new(vec![Value::Integer(1); arity]));
    }
    WriteBatch::new(net, schema(network), LedgerRange::single(1), tables)
}

async fn write_through_queue(commit_mode: CommitMode) -> (tempfile::TempDir, Connection, Error) {
    let (dir, path) = temp_db();
    let mut storage = Storage::open(&StorageConfig {
        path: path.clone(),
        ..StorageConfig::default()
    })
    .unwrap();
    storage.provision(&NetworkName::new("alpha"), &schema("alpha")).unwrap();
    let writer = BatchWriter::new(
        storage.take_writer().unwrap(),
        WriterConfig {
            commit_mode,
            ..WriterConfig::default()
        },
        Some(storage.wal_path()),
    )
    .unwrap();

    let mut queue = WriteQueue::new(queue_config(4, Duration::from_secs(5))).unwrap();
    queue.start(writer).unwrap();
    let ticket = queue.submit(five_table_batch("alpha")).await.unwrap();
    let err = ticket.outcome().await.unwrap_err();
    queue.stop().await.unwrap();
    storage.close().unwrap();

    (dir, open_read_only(&path), err)
}

#[tokio::test]
async fn test_third_table_failure_keeps_first_two_per_table() {
    let (_dir, conn, err) = write_through_queue(CommitMode::PerTable).await;

    let Error::TableAppend { table, source } = err else {
        panic!("expected a table append error, got {:?}", err);
    };
    assert_eq!(table, LedgerTable::Operations);
    assert!(matches!(*source, Error::MalformedRow { actual: 1, .. }));

    assert_eq!(count(&conn, "alpha", LedgerTable::Ledgers), 1);
    assert_eq!(count(&conn, "alpha", LedgerTable::Transactions), 1);
    assert_eq!(count(&conn, "alpha", LedgerTable::Operations), 0);
    assert_eq!(count(&conn, "alpha", LedgerTable::Effects), 0);
    assert_eq!(count(&conn, "alpha", LedgerTable::Trades), 0);
}

#[tokio::test]
async fn test_third_table_failure_rolls_back_atomic() {
    let (_dir, conn, err) = write_through_queue(CommitMode::Atomic).await;

    assert!(matches!(err, Error::TableAppend { table: LedgerTable::Operations, .. }));
    for table in LedgerTable::ALL {
        assert_eq!(count(&conn, "alpha", table), 0, "{} not rolled back", table);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_foreign_writer_is_fatal() {
    let (_dir, path) = temp_db();
    let networks = ["alpha"];
    let mut config = app_config(&path, &networks, 5);
    config.storage.busy_timeout = Duration::from_millis(50);

    let mut orchestrator = Orchestrator::init(config, sources(&networks, 10)).unwrap();
    let fatal = orchestrator.fatal_token();

    // Someone else grabs the write lock before the first batch arrives.
    let intruder = Connection::open(&path).unwrap();
    intruder.execute_batch("BEGIN IMMEDIATE").unwrap();

    let report = tokio::time::timeout(
        Duration::from_secs(10),
        orchestrator.run_until(std::future::pending()),
    )
    .await
    .expect("fatal error stops the run")
    .unwrap();

    assert!(fatal.is_cancelled());
    assert!(report.fatal);
    assert!(!report.is_clean());
    assert!(report.metrics.batches_failed >= 1);
    assert_eq!(report.metrics.batches_written, 0);

    let runner = report.runner(&NetworkName::new("alpha")).unwrap();
    let RunnerExit::Failed(e) = &runner.exit else {
        panic!("expected runner failure, got {:?}", runner.exit);
    };
    assert!(e.is_lock_conflict());

    intruder.execute_batch("ROLLBACK").unwrap();
    assert_eq!(count(&open_read_only(&path), "alpha", LedgerTable::Ledgers), 0);
}
