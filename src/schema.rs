//! # Ledger Table Catalog and Schema Provisioning
//!
//! This module defines the fixed set of ledger tables every network schema
//! holds, and creates them idempotently at startup.
//!
//! ## Namespaces in a Single File
//!
//! SQLite has no `CREATE SCHEMA` inside one database file, so a network schema
//! is a table-name namespace. Table `T` of schema `S` is stored as `S__T`:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           ingest.db                                     │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ledgerlake_schemas          mainnet__ledgers      testnet__ledgers     │
//! │  ┌──────────────────┐        mainnet__transactions testnet__transactions│
//! │  │ schema_name (PK) │        mainnet__operations   testnet__operations  │
//! │  │ network_name     │        ...                   ...                  │
//! │  │ created_ms       │                                                   │
//! │  └──────────────────┘                                                   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`SchemaName`] validation forbids `__`, so qualified names never collide
//! across schemas.
//!
//! ## Idempotency
//!
//! Every statement is `CREATE ... IF NOT EXISTS` or `INSERT OR IGNORE`.
//! Provisioning runs on every startup against an existing file and never drops
//! or rewrites data.
//!
//! ## STRICT Tables
//!
//! Tables are declared `STRICT`, so a value of the wrong type fails the insert
//! instead of being silently coerced. Type mismatches surface as batch
//! failures during development, not as corrupt rows.

use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use crate::codec::current_time_ms;
use crate::error::{Error, Result};
use crate::types::{LedgerTable, NetworkName, SchemaName};

// =============================================================================
// Catalog Types
// =============================================================================

/// One column of a ledger table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnDef {
    /// Column name.
    pub name: &'static str,
    /// STRICT type: INTEGER, REAL, TEXT or BLOB.
    pub sql_type: &'static str,
    /// Whether NULL is allowed.
    pub nullable: bool,
}

const fn col(name: &'static str, sql_type: &'static str) -> ColumnDef {
    ColumnDef {
        name,
        sql_type,
        nullable: false,
    }
}

const fn nullable(name: &'static str, sql_type: &'static str) -> ColumnDef {
    ColumnDef {
        name,
        sql_type,
        nullable: true,
    }
}

/// Definition of one logical ledger table.
#[derive(Debug, Clone, Copy)]
pub struct TableDef {
    /// Which logical table.
    pub table: LedgerTable,
    /// Columns in row order.
    pub columns: &'static [ColumnDef],
}

/// Every table's first column; range reads filter on it.
pub const LEDGER_SEQUENCE_COLUMN: &str = "ledger_sequence";

impl TableDef {
    /// Number of columns a row must have.
    pub fn arity(&self) -> usize {
        self.columns.len()
    }

    /// Column names in row order.
    pub fn column_names(&self) -> impl Iterator<Item = &'static str> {
        self.columns.iter().map(|c| c.name)
    }
}

// =============================================================================
// Table Definitions
// =============================================================================
// Column sets are the stable subset the extraction layer emits for each
// table. Amounts are TEXT: they are 64-bit stroop values that may exceed
// i64 once summed downstream.

const LEDGERS: &[ColumnDef] = &[
    col(LEDGER_SEQUENCE_COLUMN, "INTEGER"),
    col("ledger_hash", "TEXT"),
    col("closed_at", "INTEGER"),
    col("transaction_count", "INTEGER"),
    col("operation_count", "INTEGER"),
    col("protocol_version", "INTEGER"),
];

const TRANSACTIONS: &[ColumnDef] = &[
    col(LEDGER_SEQUENCE_COLUMN, "INTEGER"),
    col("transaction_hash", "TEXT"),
    col("source_account", "TEXT"),
    col("fee_charged", "INTEGER"),
    col("operation_count", "INTEGER"),
    col("successful", "INTEGER"),
];

const OPERATIONS: &[ColumnDef] = &[
    col(LEDGER_SEQUENCE_COLUMN, "INTEGER"),
    col("transaction_hash", "TEXT"),
    col("operation_index", "INTEGER"),
    col("operation_type", "TEXT"),
    nullable("source_account", "TEXT"),
    nullable("details", "TEXT"),
];

const EFFECTS: &[ColumnDef] = &[
    col(LEDGER_SEQUENCE_COLUMN, "INTEGER"),
    col("operation_id", "TEXT"),
    col("effect_index", "INTEGER"),
    col("effect_type", "TEXT"),
    nullable("account", "TEXT"),
    nullable("amount", "TEXT"),
];

const TRADES: &[ColumnDef] = &[
    col(LEDGER_SEQUENCE_COLUMN, "INTEGER"),
    nullable("offer_id", "INTEGER"),
    col("base_asset", "TEXT"),
    col("base_amount", "TEXT"),
    col("counter_asset", "TEXT"),
    col("counter_amount", "TEXT"),
    col("price", "REAL"),
];

const ACCOUNTS: &[ColumnDef] = &[
    col(LEDGER_SEQUENCE_COLUMN, "INTEGER"),
    col("account_id", "TEXT"),
    col("balance", "TEXT"),
    col("sequence_number", "INTEGER"),
    col("num_subentries", "INTEGER"),
];

const TRUSTLINES: &[ColumnDef] = &[
    col(LEDGER_SEQUENCE_COLUMN, "INTEGER"),
    col("account_id", "TEXT"),
    col("asset_code", "TEXT"),
    col("asset_issuer", "TEXT"),
    col("balance", "TEXT"),
    col("trust_limit", "TEXT"),
];

const CONTRACT_EVENTS: &[ColumnDef] = &[
    col(LEDGER_SEQUENCE_COLUMN, "INTEGER"),
    col("transaction_hash", "TEXT"),
    nullable("contract_id", "TEXT"),
    col("event_type", "TEXT"),
    col("topics", "TEXT"),
    nullable("data", "TEXT"),
];

/// Returns the definition of `table`.
pub fn table_def(table: LedgerTable) -> TableDef {
    let columns = match table {
        LedgerTable::Ledgers => LEDGERS,
        LedgerTable::Transactions => TRANSACTIONS,
        LedgerTable::Operations => OPERATIONS,
        LedgerTable::Effects => EFFECTS,
        LedgerTable::Trades => TRADES,
        LedgerTable::Accounts => ACCOUNTS,
        LedgerTable::Trustlines => TRUSTLINES,
        LedgerTable::ContractEvents => CONTRACT_EVENTS,
    };
    TableDef { table, columns }
}

// =============================================================================
// DDL
// =============================================================================

/// Registry of provisioned schemas.
///
/// # Columns
///
/// - `schema_name`: Namespace prefix of the schema's tables (PK)
/// - `network_name`: Network the schema belongs to; one schema per network
/// - `created_ms`: First provisioning time, never updated
const CREATE_SCHEMA_REGISTRY: &str = r#"
CREATE TABLE IF NOT EXISTS ledgerlake_schemas (
    schema_name  TEXT PRIMARY KEY,
    network_name TEXT NOT NULL UNIQUE,
    created_ms   INTEGER NOT NULL
)
"#;

/// Storage-level name of `table` in `schema` (unquoted).
pub fn table_name(schema: &SchemaName, table: LedgerTable) -> String {
    format!("{}__{}", schema.as_str(), table.name())
}

/// Quoted identifier of `table` in `schema`, safe to embed in SQL.
pub fn qualified(schema: &SchemaName, table: LedgerTable) -> String {
    format!("\"{}\"", table_name(schema, table))
}

/// `CREATE TABLE IF NOT EXISTS` for `table` in `schema`.
pub fn create_table_sql(schema: &SchemaName, table: LedgerTable) -> String {
    let def = table_def(table);
    let columns: Vec<String> = def
        .columns
        .iter()
        .map(|c| {
            let null = if c.nullable { "" } else { " NOT NULL" };
            format!("    {} {}{}", c.name, c.sql_type, null)
        })
        .collect();
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n{}\n) STRICT",
        qualified(schema, table),
        columns.join(",\n")
    )
}

/// `CREATE INDEX IF NOT EXISTS` on the ledger sequence column.
pub fn create_range_index_sql(schema: &SchemaName, table: LedgerTable) -> String {
    format!(
        "CREATE INDEX IF NOT EXISTS \"{}_seq_idx\" ON {} ({})",
        table_name(schema, table),
        qualified(schema, table),
        LEDGER_SEQUENCE_COLUMN
    )
}

/// Parameterised `INSERT` for `table` in `schema`.
pub fn insert_sql(schema: &SchemaName, table: LedgerTable) -> String {
    let def = table_def(table);
    let names: Vec<&str> = def.column_names().collect();
    let placeholders: Vec<String> = (1..=def.arity()).map(|i| format!("?{}", i)).collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        qualified(schema, table),
        names.join(", "),
        placeholders.join(", ")
    )
}

// =============================================================================
// Provisioning
// =============================================================================

/// Creates the schema registry if missing.
pub fn initialize_registry(conn: &Connection) -> Result<()> {
    conn.execute_batch(CREATE_SCHEMA_REGISTRY)?;
    Ok(())
}

/// Idempotently creates `schema` and all of its tables for `network`.
///
/// Runs in one transaction: either the schema is fully provisioned or
/// nothing changes.
///
/// # Errors
///
/// - `Error::Schema` if `schema` is already registered to another network,
///   or `network` already owns another schema
/// - `Error::Sqlite` if any DDL fails
pub fn provision_schema(conn: &Connection, network: &NetworkName, schema: &SchemaName) -> Result<()> {
    initialize_registry(conn)?;

    conn.execute_batch("BEGIN IMMEDIATE")?;
    match provision_in_tx(conn, network, schema) {
        Ok(()) => {
            conn.execute_batch("COMMIT")?;
            Ok(())
        }
        Err(e) => {
            if let Err(rollback_err) = conn.execute_batch("ROLLBACK") {
                warn!(schema = %schema, error = %rollback_err, "rolling back schema provisioning failed");
            }
            Err(e)
        }
    }
}

fn provision_in_tx(conn: &Connection, network: &NetworkName, schema: &SchemaName) -> Result<()> {
    let owner: Option<String> = conn
        .query_row(
            "SELECT network_name FROM ledgerlake_schemas WHERE schema_name = ?",
            params![schema.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(owner) = owner {
        if owner != network.as_str() {
            return Err(Error::Schema(format!(
                "schema '{}' already belongs to network '{}', cannot reuse it for '{}'",
                schema, owner, network
            )));
        }
    }

    let existing: Option<String> = conn
        .query_row(
            "SELECT schema_name FROM ledgerlake_schemas WHERE network_name = ?",
            params![network.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(existing) = existing {
        if existing != schema.as_str() {
            return Err(Error::Schema(format!(
                "network '{}' is already provisioned as schema '{}', not '{}'",
                network, existing, schema
            )));
        }
    }

    for table in LedgerTable::ALL {
        conn.execute_batch(&create_table_sql(schema, table))?;
        conn.execute_batch(&create_range_index_sql(schema, table))?;
    }

    conn.execute(
        "INSERT OR IGNORE INTO ledgerlake_schemas (schema_name, network_name, created_ms)
         VALUES (?, ?, ?)",
        params![schema.as_str(), network.as_str(), current_time_ms() as i64],
    )?;

    Ok(())
}

/// Network that owns `schema`, or `None` if it was never provisioned.
pub fn schema_owner(conn: &Connection, schema: &SchemaName) -> Result<Option<NetworkName>> {
    let registry: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'ledgerlake_schemas'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    if registry.is_none() {
        return Ok(None);
    }

    let owner: Option<String> = conn
        .query_row(
            "SELECT network_name FROM ledgerlake_schemas WHERE schema_name = ?",
            params![schema.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(owner.map(NetworkName::new))
}

/// True if `schema` was provisioned.
pub fn schema_exists(conn: &Connection, schema: &SchemaName) -> Result<bool> {
    Ok(schema_owner(conn, schema)?.is_some())
}

/// Lists provisioned schemas with their networks, ordered by schema name.
pub fn provisioned_schemas(conn: &Connection) -> Result<Vec<(SchemaName, NetworkName)>> {
    let mut stmt = conn.prepare(
        "SELECT schema_name, network_name FROM ledgerlake_schemas ORDER BY schema_name",
    )?;
    let rows = stmt.query_map([], |row| {
        let schema: String = row.get(0)?;
        let network: String = row.get(1)?;
        Ok((schema, network))
    })?;

    let mut out = Vec::new();
    for row in rows {
        let (schema, network) = row?;
        out.push((SchemaName::parse(schema)?, NetworkName::new(network)));
    }
    Ok(out)
}
