//! # Append Handles
//!
//! An append handle is a table-bound write cursor, opened once per
//! (schema, table) and reused for every batch the process writes.
//!
//! Rows are not held in memory. Each row is inserted as it is appended, and
//! the open savepoint keeps it pending, invisible to readers, until `flush`.
//!
//! ## Mapping onto SQLite
//!
//! ```text
//! append_row ──► SAVEPOINT "append_<table>"   (first row since last flush)
//!            ──► cached INSERT statement, executed per row
//! flush      ──► RELEASE "append_<table>"
//! discard    ──► ROLLBACK TO + RELEASE        (table left without partial rows)
//! ```
//!
//! A SAVEPOINT outside any transaction behaves like `BEGIN`, and releasing it
//! commits. Inside the batch writer's `BEGIN IMMEDIATE` it nests instead, so
//! the same handle works under both commit modes:
//!
//! - **PerTable**: every `flush` is a commit
//! - **Atomic**: `flush` only releases the savepoint; the batch commits once
//!
//! The prepared INSERT lives in the connection's statement cache, keyed by its
//! SQL text. The handle keeps the key, not the statement, so it holds no
//! borrow of the connection between batches.
//!
//! ## Lifecycle
//!
//! [`SchemaAppenderSet`]s are created lazily on the first batch for a schema
//! and live until the writer closes, when every handle is flushed and closed.

use rusqlite::{params_from_iter, Connection};

use crate::error::{Error, Result};
use crate::schema::{insert_sql, qualified, table_def};
use crate::types::{LedgerTable, NetworkName, Row, SchemaName};

// =============================================================================
// Table Appender
// =============================================================================

/// Append handle for one table of one schema.
#[derive(Debug)]
pub struct TableAppender {
    table: LedgerTable,
    qualified: String,
    insert_sql: String,
    savepoint: String,
    arity: usize,
    /// Rows appended since the last flush.
    pending: usize,
    /// Rows made durable by flushes (or by the enclosing commit).
    flushed: u64,
    flushes: u64,
    closed: bool,
}

impl TableAppender {
    /// Opens an append handle for `table` in `schema`.
    pub fn new(schema: &SchemaName, table: LedgerTable) -> Self {
        Self {
            table,
            qualified: qualified(schema, table),
            insert_sql: insert_sql(schema, table),
            savepoint: format!("\"append_{}\"", table.name()),
            arity: table_def(table).arity(),
            pending: 0,
            flushed: 0,
            flushes: 0,
            closed: false,
        }
    }

    /// The table this handle writes to.
    pub fn table(&self) -> LedgerTable {
        self.table
    }

    /// Quoted storage identifier of the table.
    pub fn qualified_name(&self) -> &str {
        &self.qualified
    }

    /// Rows appended but not yet flushed.
    pub fn pending_rows(&self) -> usize {
        self.pending
    }

    /// Rows flushed over the handle's lifetime.
    pub fn flushed_rows(&self) -> u64 {
        self.flushed
    }

    /// Flushes over the handle's lifetime.
    pub fn flush_count(&self) -> u64 {
        self.flushes
    }

    /// Appends one row.
    ///
    /// # Errors
    ///
    /// - `Error::MalformedRow` if the column count is wrong; nothing is written
    /// - `Error::Sqlite` if the insert fails (type mismatch, NULL in a
    ///   NOT NULL column, lock conflict)
    pub fn append_row(&mut self, conn: &Connection, row: &Row) -> Result<()> {
        if self.closed {
            return Err(Error::Schema(format!("append handle for {} is closed", self.qualified)));
        }
        if row.len() != self.arity {
            return Err(Error::MalformedRow {
                table: self.table,
                expected: self.arity,
                actual: row.len(),
            });
        }

        if self.pending == 0 {
            conn.execute_batch(&format!("SAVEPOINT {}", self.savepoint))?;
        }
        // Count before executing: a failed first insert still leaves an open
        // savepoint for discard() to roll back.
        self.pending += 1;

        let mut stmt = conn.prepare_cached(&self.insert_sql)?;
        stmt.execute(params_from_iter(row.values()))?;
        Ok(())
    }

    /// Makes appended rows durable (or nested in the caller's transaction).
    pub fn flush(&mut self, conn: &Connection) -> Result<usize> {
        if self.pending == 0 {
            return Ok(0);
        }
        conn.execute_batch(&format!("RELEASE {}", self.savepoint))?;
        let rows = self.pending;
        self.pending = 0;
        self.flushed += rows as u64;
        self.flushes += 1;
        Ok(rows)
    }

    /// Drops rows appended since the last flush.
    pub fn discard(&mut self, conn: &Connection) -> Result<()> {
        if self.pending == 0 {
            return Ok(());
        }
        self.pending = 0;
        conn.execute_batch(&format!(
            "ROLLBACK TO {sp}; RELEASE {sp}",
            sp = self.savepoint
        ))?;
        Ok(())
    }

    /// Forgets rows counted as flushed that the enclosing transaction rolled back.
    pub(crate) fn unflush(&mut self, rows: usize) {
        self.flushed = self.flushed.saturating_sub(rows as u64);
    }

    /// Flushes pending rows and closes the handle.
    pub fn close(&mut self, conn: &Connection) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.flush(conn)?;
        self.closed = true;
        Ok(())
    }

    /// True once closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

// =============================================================================
// Schema Appender Set
// =============================================================================

/// One append handle per logical table, for one schema.
#[derive(Debug)]
pub struct SchemaAppenderSet {
    schema: SchemaName,
    /// Network the schema is registered to.
    network: NetworkName,
    appenders: Vec<TableAppender>,
    batches: u64,
}

impl SchemaAppenderSet {
    /// Opens handles for every table of `schema`, owned by `network`.
    pub fn new(schema: SchemaName, network: NetworkName) -> Self {
        let appenders = LedgerTable::ALL
            .iter()
            .map(|&t| TableAppender::new(&schema, t))
            .collect();
        Self {
            schema,
            network,
            appenders,
            batches: 0,
        }
    }

    /// The schema these handles write to.
    pub fn schema(&self) -> &SchemaName {
        &self.schema
    }

    /// The network that owns the schema.
    pub fn network(&self) -> &NetworkName {
        &self.network
    }

    /// Handle for `table`.
    pub fn appender(&self, table: LedgerTable) -> &TableAppender {
        &self.appenders[table.index()]
    }

    /// Mutable handle for `table`.
    pub fn appender_mut(&mut self, table: LedgerTable) -> &mut TableAppender {
        &mut self.appenders[table.index()]
    }

    /// Batches written through this set.
    pub fn batch_count(&self) -> u64 {
        self.batches
    }

    pub(crate) fn record_batch(&mut self) {
        self.batches += 1;
    }

    /// Rows flushed across all tables.
    pub fn flushed_rows(&self) -> u64 {
        self.appenders.iter().map(TableAppender::flushed_rows).sum()
    }

    /// Flushes every handle, stopping at the first failure.
    pub fn flush_all(&mut self, conn: &Connection) -> Result<usize> {
        let mut rows = 0;
        for appender in &mut self.appenders {
            rows += appender.flush(conn)?;
        }
        Ok(rows)
    }

    /// Discards unflushed rows on every handle.
    pub fn discard_all(&mut self, conn: &Connection) -> Result<()> {
        let mut first_err = None;
        for appender in &mut self.appenders {
            if let Err(e) = appender.discard(conn) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Flushes and closes every handle, reporting the first failure.
    pub fn close(&mut self, conn: &Connection) -> Result<()> {
        let mut first_err = None;
        for appender in &mut self.appenders {
            if let Err(e) = appender.close(conn) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
