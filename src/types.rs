//! # Domain Types for ledgerlake
//!
//! This module defines the types that flow through the write path: networks,
//! schemas, ledger ranges, logical tables, rows and batches.
//!
//! ## Design Philosophy: Newtypes for Safety
//!
//! Network names and schema names are both strings, but they mean different
//! things. A batch targets a *schema*; metrics and logs are keyed by *network*.
//! Wrapping them in distinct types makes it impossible to pass one where the
//! other is expected.
//!
//! ## Invariants
//!
//! - [`SchemaName`] is a validated SQL identifier, so it can be embedded in
//!   table names without quoting hazards
//! - [`LedgerRange`] always has `start <= end`
//! - [`TableRows`] iterates tables in [`LedgerTable::ALL`] order, never in
//!   insertion order, so write failure points are reproducible

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use rusqlite::types::Value;

use crate::error::{Error, Result};

// =============================================================================
// Network and Schema Identification
// =============================================================================

/// The name of a source network, e.g. `"mainnet"`.
///
/// Stable for the lifetime of a source runner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetworkName(String);

impl NetworkName {
    /// Creates a network name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NetworkName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NetworkName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Maximum length of a schema name.
pub const MAX_SCHEMA_NAME_LEN: usize = 48;

/// The storage namespace holding one network's tables.
///
/// # Validation
///
/// Schema names are embedded in table identifiers, so they are restricted to
/// `[a-z_][a-z0-9_]*` and at most [`MAX_SCHEMA_NAME_LEN`] characters. Two
/// consecutive underscores are rejected because `__` separates schema and
/// table in qualified names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SchemaName(String);

impl SchemaName {
    /// Validates and wraps a schema name.
    pub fn parse(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let mut chars = name.chars();
        let valid_first = matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_');
        let valid_rest = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

        if !valid_first || !valid_rest || name.len() > MAX_SCHEMA_NAME_LEN || name.contains("__") {
            return Err(Error::InvalidSchemaName { name });
        }
        Ok(Self(name))
    }

    /// Derives the schema name for a network.
    ///
    /// Lowercases the network name and replaces anything outside
    /// `[a-z0-9_]` with `_`. Names starting with a digit get an `n_` prefix.
    ///
    /// ```rust
    /// use ledgerlake::types::{NetworkName, SchemaName};
    ///
    /// let schema = SchemaName::for_network(&NetworkName::new("Pub-Net 2")).unwrap();
    /// assert_eq!(schema.as_str(), "pub_net_2");
    /// ```
    pub fn for_network(network: &NetworkName) -> Result<Self> {
        let mut name = String::with_capacity(network.as_str().len() + 2);
        for c in network.as_str().chars() {
            let c = c.to_ascii_lowercase();
            let c = if c.is_ascii_lowercase() || c.is_ascii_digit() { c } else { '_' };
            // Collapse runs so the result never contains the `__` separator.
            if c == '_' && name.ends_with('_') {
                continue;
            }
            name.push(c);
        }
        if name.starts_with(|c: char| c.is_ascii_digit()) {
            name.insert_str(0, "n_");
        }
        Self::parse(name)
    }

    /// Returns the string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SchemaName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stellar public network passphrase.
pub const MAINNET_PASSPHRASE: &str = "Public Global Stellar Network ; September 2015";

/// Stellar test network passphrase.
pub const TESTNET_PASSPHRASE: &str = "Test SDF Network ; September 2015";

/// Stellar future network passphrase.
pub const FUTURENET_PASSPHRASE: &str = "Test SDF Future Network ; October 2022";

/// Maps a well-known network passphrase to its short network name.
///
/// Returns `None` for unknown passphrases; the orchestrator then falls back to
/// `network_<index>`.
pub fn network_name_from_passphrase(passphrase: &str) -> Option<&'static str> {
    match passphrase {
        MAINNET_PASSPHRASE => Some("mainnet"),
        TESTNET_PASSPHRASE => Some("testnet"),
        FUTURENET_PASSPHRASE => Some("futurenet"),
        _ => None,
    }
}

// =============================================================================
// Ledger Ranges
// =============================================================================

/// An inclusive range of ledger sequence numbers.
///
/// # Invariant
///
/// `start <= end`. The fields are private, so [`LedgerRange::new`] and
/// [`LedgerRange::single`] are the only constructors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LedgerRange {
    start: u32,
    end: u32,
}

impl LedgerRange {
    /// Creates a range, rejecting `start > end`.
    pub fn new(start: u32, end: u32) -> Result<Self> {
        if start > end {
            return Err(Error::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// A range covering one ledger.
    pub fn single(sequence: u32) -> Self {
        Self {
            start: sequence,
            end: sequence,
        }
    }

    /// First ledger (inclusive).
    pub fn start(&self) -> u32 {
        self.start
    }

    /// Last ledger (inclusive).
    pub fn end(&self) -> u32 {
        self.end
    }

    /// Number of ledgers covered.
    pub fn ledger_count(&self) -> u64 {
        u64::from(self.end.saturating_sub(self.start)) + 1
    }

    /// True if `sequence` falls inside the range.
    pub fn contains(&self, sequence: u32) -> bool {
        self.start <= sequence && sequence <= self.end
    }

    /// True if this range starts strictly after `previous` ends.
    ///
    /// Successive batches of one network must satisfy this: no overlap, no
    /// regression. Gaps are allowed (a source may skip a lost range).
    pub fn follows(&self, previous: &LedgerRange) -> bool {
        self.start > previous.end
    }
}

impl fmt::Display for LedgerRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

// =============================================================================
// Logical Tables
// =============================================================================

/// The fixed set of logical ledger tables present in every network schema.
///
/// # Ordering
///
/// The declaration order is the write order. `derive(Ord)` follows it, so
/// sorted maps keyed by table iterate in write order too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LedgerTable {
    /// One row per closed ledger.
    Ledgers,
    /// One row per transaction.
    Transactions,
    /// One row per operation.
    Operations,
    /// Operation side effects.
    Effects,
    /// DEX trades.
    Trades,
    /// Account state snapshots.
    Accounts,
    /// Trustline state snapshots.
    Trustlines,
    /// Smart contract events.
    ContractEvents,
}

impl LedgerTable {
    /// Number of logical tables.
    pub const COUNT: usize = 8;

    /// Every table, in write order.
    pub const ALL: [LedgerTable; LedgerTable::COUNT] = [
        LedgerTable::Ledgers,
        LedgerTable::Transactions,
        LedgerTable::Operations,
        LedgerTable::Effects,
        LedgerTable::Trades,
        LedgerTable::Accounts,
        LedgerTable::Trustlines,
        LedgerTable::ContractEvents,
    ];

    /// Unqualified table name.
    pub fn name(&self) -> &'static str {
        match self {
            LedgerTable::Ledgers => "ledgers",
            LedgerTable::Transactions => "transactions",
            LedgerTable::Operations => "operations",
            LedgerTable::Effects => "effects",
            LedgerTable::Trades => "trades",
            LedgerTable::Accounts => "accounts",
            LedgerTable::Trustlines => "trustlines",
            LedgerTable::ContractEvents => "contract_events",
        }
    }

    /// Position in [`LedgerTable::ALL`].
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Looks a table up by its unqualified name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.name() == name)
    }
}

impl fmt::Display for LedgerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Rows
// =============================================================================

/// One typed row, columns in table-definition order.
#[derive(Debug, Clone, PartialEq)]
pub struct Row(Vec<Value>);

impl Row {
    /// Wraps column values.
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    /// Column values.
    pub fn values(&self) -> &[Value] {
        &self.0
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True for a row with no columns.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<Value>> for Row {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

/// Per-table row counts, iterated in write order.
pub type RowCounts = BTreeMap<LedgerTable, usize>;

/// One ordered row sequence per logical table.
///
/// Row order within a table is insertion order. Nothing here reorders,
/// deduplicates or sorts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableRows {
    tables: [Vec<Row>; LedgerTable::COUNT],
}

impl TableRows {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a row to `table`.
    pub fn push(&mut self, table: LedgerTable, row: Row) {
        self.tables[table.index()].push(row);
    }

    /// Appends many rows to `table`.
    pub fn extend(&mut self, table: LedgerTable, rows: impl IntoIterator<Item = Row>) {
        self.tables[table.index()].extend(rows);
    }

    /// Moves every row of `other` to the end of the matching table here.
    pub fn append(&mut self, other: &mut TableRows) {
        for (mine, theirs) in self.tables.iter_mut().zip(other.tables.iter_mut()) {
            mine.append(theirs);
        }
    }

    /// Rows buffered for `table`.
    pub fn rows(&self, table: LedgerTable) -> &[Row] {
        &self.tables[table.index()]
    }

    /// Tables in write order with their rows, empty ones included.
    pub fn iter(&self) -> impl Iterator<Item = (LedgerTable, &[Row])> {
        LedgerTable::ALL
            .into_iter()
            .map(move |t| (t, self.tables[t.index()].as_slice()))
    }

    /// Tables in write order that hold at least one row.
    pub fn non_empty(&self) -> impl Iterator<Item = (LedgerTable, &[Row])> {
        self.iter().filter(|(_, rows)| !rows.is_empty())
    }

    /// Total rows across all tables.
    pub fn total_rows(&self) -> usize {
        self.tables.iter().map(Vec::len).sum()
    }

    /// True if no table holds a row.
    pub fn is_empty(&self) -> bool {
        self.tables.iter().all(Vec::is_empty)
    }

    /// Row counts of non-empty tables.
    pub fn row_counts(&self) -> RowCounts {
        self.non_empty().map(|(t, rows)| (t, rows.len())).collect()
    }
}

// =============================================================================
// Quality Checks
// =============================================================================

/// A data-quality check result computed by the ingestion pipeline.
///
/// The write path never evaluates checks; it carries them through to the
/// batch completion record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualityCheckResult {
    /// Check identifier, e.g. `"tx_count_matches"`.
    pub check: String,
    /// Whether the check passed.
    pub passed: bool,
    /// Optional failure detail.
    pub detail: Option<String>,
}

impl QualityCheckResult {
    /// A passing check.
    pub fn passed(check: impl Into<String>) -> Self {
        Self {
            check: check.into(),
            passed: true,
            detail: None,
        }
    }

    /// A failing check with detail.
    pub fn failed(check: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            check: check.into(),
            passed: false,
            detail: Some(detail.into()),
        }
    }
}

// =============================================================================
// Write Batches
// =============================================================================

/// The unit of work submitted to the write queue.
///
/// # Lifecycle
///
/// ```text
/// SourceRunner builds ──► queue submit stamps submitted_at ──► consumer writes
///                                                                   │
///                        result delivered on the ticket ◄───────────┘
/// ```
///
/// The single-slot result channel is created at submission and travels with
/// the batch through the queue (see [`crate::queue`]); it is not part of the
/// batch value itself, so a rejected batch can be resubmitted as-is.
#[derive(Debug, Clone)]
pub struct WriteBatch {
    /// Source network.
    pub network: NetworkName,
    /// Target schema, provisioned at startup.
    pub schema: SchemaName,
    /// Rows per logical table.
    pub tables: TableRows,
    /// Ledgers covered by this batch.
    pub range: LedgerRange,
    /// Quality checks computed upstream.
    pub quality: Vec<QualityCheckResult>,
    /// Set by the queue the instant the batch is submitted.
    pub submitted_at: Option<Instant>,
}

impl WriteBatch {
    /// Creates a batch with no quality results.
    pub fn new(network: NetworkName, schema: SchemaName, range: LedgerRange, tables: TableRows) -> Self {
        Self {
            network,
            schema,
            tables,
            range,
            quality: Vec::new(),
            submitted_at: None,
        }
    }

    /// Attaches quality-check results.
    pub fn with_quality(mut self, quality: Vec<QualityCheckResult>) -> Self {
        self.quality = quality;
        self
    }

    /// Total rows across all tables.
    pub fn total_rows(&self) -> usize {
        self.tables.total_rows()
    }

    /// Time since submission, if submitted.
    pub fn queue_wait(&self) -> Option<Duration> {
        self.submitted_at.map(|t| t.elapsed())
    }
}

/// Outcome of one successfully written batch.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteSummary {
    /// Source network.
    pub network: NetworkName,
    /// Target schema.
    pub schema: SchemaName,
    /// Ledgers written.
    pub range: LedgerRange,
    /// Rows written per non-empty table.
    pub row_counts: RowCounts,
    /// Rows written in total.
    pub total_rows: usize,
    /// Time spent appending and flushing.
    pub write_duration: Duration,
    /// Time spent waiting in the queue.
    pub queue_wait: Duration,
    /// Whether a checkpoint ran after this batch.
    pub checkpointed: bool,
}

impl WriteSummary {
    /// Summarises a written batch. Queue wait is taken from `submitted_at`.
    pub fn from_batch(batch: &WriteBatch, write_duration: Duration, checkpointed: bool) -> Self {
        Self {
            network: batch.network.clone(),
            schema: batch.schema.clone(),
            range: batch.range,
            row_counts: batch.tables.row_counts(),
            total_rows: batch.total_rows(),
            write_duration,
            queue_wait: batch.queue_wait().unwrap_or_default(),
            checkpointed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(seq: i64) -> Row {
        Row::new(vec![Value::Integer(seq)])
    }

    #[test]
    fn test_schema_name_validation() {
        assert!(SchemaName::parse("mainnet").is_ok());
        assert!(SchemaName::parse("network_1").is_ok());
        assert!(SchemaName::parse("_private").is_ok());

        assert!(SchemaName::parse("").is_err());
        assert!(SchemaName::parse("Mainnet").is_err());
        assert!(SchemaName::parse("1net").is_err());
        assert!(SchemaName::parse("main-net").is_err());
        assert!(SchemaName::parse("a__b").is_err());
        assert!(SchemaName::parse("x".repeat(MAX_SCHEMA_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn test_schema_for_network() {
        let schema = SchemaName::for_network(&NetworkName::new("Alpha")).unwrap();
        assert_eq!(schema.as_str(), "alpha");

        let schema = SchemaName::for_network(&NetworkName::new("test -- net")).unwrap();
        assert_eq!(schema.as_str(), "test_net");

        let schema = SchemaName::for_network(&NetworkName::new("42")).unwrap();
        assert_eq!(schema.as_str(), "n_42");
    }

    #[test]
    fn test_passphrase_mapping() {
        assert_eq!(network_name_from_passphrase(MAINNET_PASSPHRASE), Some("mainnet"));
        assert_eq!(network_name_from_passphrase(TESTNET_PASSPHRASE), Some("testnet"));
        assert_eq!(network_name_from_passphrase(FUTURENET_PASSPHRASE), Some("futurenet"));
        assert_eq!(network_name_from_passphrase("Private Network ; 2024"), None);
    }

    #[test]
    fn test_ledger_range() {
        assert!(LedgerRange::new(5, 4).is_err());

        let r = LedgerRange::new(100, 349).unwrap();
        assert_eq!(r.ledger_count(), 250);
        assert!(r.contains(100));
        assert!(r.contains(349));
        assert!(!r.contains(350));

        let next = LedgerRange::new(350, 599).unwrap();
        assert!(next.follows(&r));
        assert!(!r.follows(&next));

        let overlapping = LedgerRange::new(349, 400).unwrap();
        assert!(!overlapping.follows(&r));

        assert_eq!(LedgerRange::single(7).ledger_count(), 1);
    }

    #[test]
    fn test_ledger_range_extremes() {
        let all = LedgerRange::new(0, u32::MAX).unwrap();
        assert_eq!(all.ledger_count(), u64::from(u32::MAX) + 1);
        assert_eq!((all.start(), all.end()), (0, u32::MAX));
        assert!(matches!(
            LedgerRange::new(10, 5),
            Err(Error::InvalidRange { start: 10, end: 5 })
        ));
    }

    #[test]
    fn test_table_order_is_fixed() {
        for (i, table) in LedgerTable::ALL.iter().enumerate() {
            assert_eq!(table.index(), i);
            assert_eq!(LedgerTable::from_name(table.name()), Some(*table));
        }
        assert!(LedgerTable::Ledgers < LedgerTable::ContractEvents);
    }

    #[test]
    fn test_table_rows_iterate_in_table_order() {
        let mut rows = TableRows::new();
        rows.push(LedgerTable::Trades, row(3));
        rows.push(LedgerTable::Ledgers, row(1));
        rows.push(LedgerTable::Trades, row(4));

        let order: Vec<_> = rows.non_empty().map(|(t, r)| (t, r.len())).collect();
        assert_eq!(order, vec![(LedgerTable::Ledgers, 1), (LedgerTable::Trades, 2)]);

        // insertion order preserved within a table
        assert_eq!(rows.rows(LedgerTable::Trades), &[row(3), row(4)]);
        assert_eq!(rows.total_rows(), 3);
    }

    #[test]
    fn test_table_rows_append() {
        let mut a = TableRows::new();
        a.push(LedgerTable::Ledgers, row(1));
        let mut b = TableRows::new();
        b.push(LedgerTable::Ledgers, row(2));
        b.push(LedgerTable::Effects, row(2));

        a.append(&mut b);
        assert!(b.is_empty());
        assert_eq!(a.rows(LedgerTable::Ledgers), &[row(1), row(2)]);

        let counts = a.row_counts();
        assert_eq!(counts.get(&LedgerTable::Ledgers), Some(&2));
        assert_eq!(counts.get(&LedgerTable::Effects), Some(&1));
        assert_eq!(counts.get(&LedgerTable::Trades), None);
    }

    #[test]
    fn test_batch_submitted_at_unset_until_submit() {
        let batch = WriteBatch::new(
            NetworkName::new("alpha"),
            SchemaName::parse("alpha").unwrap(),
            LedgerRange::single(1),
            TableRows::new(),
        );
        assert!(batch.submitted_at.is_none());
        assert!(batch.queue_wait().is_none());
    }
}
