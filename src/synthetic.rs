//! Deterministic synthetic ledgers.
//!
//! [`SyntheticSource`] stands in for a real extraction pipeline in tests and
//! in the stress binary. Every value is derived from (network, ledger, index)
//! so two runs over the same range produce identical rows and checksums.

use std::time::Duration;

use async_trait::async_trait;
use rusqlite::types::Value;
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{Error, Result};
use crate::source::{LedgerRows, LedgerSource};
use crate::types::{LedgerTable, NetworkName, QualityCheckResult, Row};

/// Ledger close time of sequence 0, seconds.
const GENESIS_CLOSE: i64 = 1_700_000_000;

/// Protocol version stamped on every ledger.
const PROTOCOL_VERSION: i64 = 21;

fn hash_hex(network: &NetworkName, parts: &[u64]) -> String {
    let mut buf = network.as_str().as_bytes().to_vec();
    for p in parts {
        buf.extend_from_slice(&p.to_le_bytes());
    }
    format!("{:016x}", xxh3_64(&buf))
}

fn account(network: &NetworkName, seed: u64) -> String {
    format!("G{}", hash_hex(network, &[u64::MAX, seed]).to_uppercase())
}

/// The `ledgers` row for `sequence`.
pub fn ledger_row(network: &NetworkName, sequence: u32, transactions: usize, operations: usize) -> Row {
    Row::new(vec![
        Value::Integer(i64::from(sequence)),
        Value::Text(hash_hex(network, &[u64::from(sequence)])),
        Value::Integer(GENESIS_CLOSE + i64::from(sequence) * 5),
        Value::Integer(transactions as i64),
        Value::Integer(operations as i64),
        Value::Integer(PROTOCOL_VERSION),
    ])
}

/// The `transactions` row for transaction `index` of `sequence`.
pub fn transaction_row(network: &NetworkName, sequence: u32, index: usize, operations: usize) -> Row {
    Row::new(vec![
        Value::Integer(i64::from(sequence)),
        Value::Text(hash_hex(network, &[u64::from(sequence), index as u64])),
        Value::Text(account(network, index as u64)),
        Value::Integer(100 * (index as i64 + 1)),
        Value::Integer(operations as i64),
        Value::Integer(1),
    ])
}

/// The `operations` row for operation `op` of transaction `tx` in `sequence`.
pub fn operation_row(network: &NetworkName, sequence: u32, tx: usize, op: usize) -> Row {
    Row::new(vec![
        Value::Integer(i64::from(sequence)),
        Value::Text(hash_hex(network, &[u64::from(sequence), tx as u64])),
        Value::Integer(op as i64),
        Value::Text("payment".to_string()),
        if op % 2 == 0 {
            Value::Null
        } else {
            Value::Text(account(network, op as u64))
        },
        Value::Null,
    ])
}

/// A [`LedgerSource`] producing `count` ledgers from `start`.
///
/// Each ledger yields one `ledgers` row, `transactions` transaction rows and
/// `transactions * operations` operation rows. By default there are no
/// transactions, so a ledger is exactly one row.
#[derive(Debug, Clone)]
pub struct SyntheticSource {
    network: NetworkName,
    start: u32,
    end: u64,
    next: u32,
    transactions: usize,
    operations: usize,
    pace: Option<Duration>,
    fail_at: Option<u32>,
    malformed_at: Option<(u32, LedgerTable)>,
}

impl SyntheticSource {
    /// Ledgers `start .. start + count` for `network`.
    pub fn new(network: impl Into<NetworkName>, start: u32, count: u32) -> Self {
        Self {
            network: network.into(),
            start,
            end: u64::from(start) + u64::from(count),
            next: start,
            transactions: 0,
            operations: 0,
            pace: None,
            fail_at: None,
            malformed_at: None,
        }
    }

    /// Transactions per ledger.
    pub fn with_transactions(mut self, transactions: usize) -> Self {
        self.transactions = transactions;
        self
    }

    /// Operations per transaction.
    pub fn with_operations(mut self, operations: usize) -> Self {
        self.operations = operations;
        self
    }

    /// Delay before each ledger.
    pub fn with_pace(mut self, pace: Duration) -> Self {
        self.pace = Some(pace);
        self
    }

    /// Fails with a source error instead of producing ledger `sequence`.
    pub fn fail_at(mut self, sequence: u32) -> Self {
        self.fail_at = Some(sequence);
        self
    }

    /// Adds a row with the wrong column count to `table` in ledger `sequence`,
    /// which the writer rejects.
    pub fn malformed_at(mut self, sequence: u32, table: LedgerTable) -> Self {
        self.malformed_at = Some((sequence, table));
        self
    }

    /// Rows one ledger contributes.
    pub fn rows_per_ledger(&self) -> usize {
        1 + self.transactions + self.transactions * self.operations
    }

    fn build(&self, sequence: u32) -> LedgerRows {
        let mut ledger = LedgerRows::new(sequence);
        let ops_total = self.transactions * self.operations;

        ledger.tables.push(
            LedgerTable::Ledgers,
            ledger_row(&self.network, sequence, self.transactions, ops_total),
        );
        for tx in 0..self.transactions {
            ledger.tables.push(
                LedgerTable::Transactions,
                transaction_row(&self.network, sequence, tx, self.operations),
            );
            for op in 0..self.operations {
                ledger
                    .tables
                    .push(LedgerTable::Operations, operation_row(&self.network, sequence, tx, op));
            }
        }
        if let Some((at, table)) = self.malformed_at {
            if at == sequence {
                ledger.tables.push(table, Row::new(vec![Value::Integer(i64::from(sequence))]));
            }
        }

        ledger.quality.push(QualityCheckResult::passed("transaction_count"));
        ledger
    }
}

#[async_trait]
impl LedgerSource for SyntheticSource {
    fn describe(&self) -> String {
        format!("synthetic ledgers {}..{} for {}", self.start, self.end, self.network)
    }

    async fn resume_from(&mut self, ledger: u32) -> Result<()> {
        self.next = ledger.max(self.start);
        Ok(())
    }

    async fn next_ledger(&mut self) -> Result<Option<LedgerRows>> {
        if let Some(pace) = self.pace {
            tokio::time::sleep(pace).await;
        }
        if u64::from(self.next) >= self.end {
            return Ok(None);
        }
        let sequence = self.next;
        if self.fail_at == Some(sequence) {
            return Err(Error::Source {
                network: self.network.clone(),
                message: format!("injected failure at ledger {}", sequence),
            });
        }
        let ledger = self.build(sequence);
        self.next += 1;
        Ok(Some(ledger))
    }
}
