//! # Read Pool
//!
//! The query surface. Reads never go through the write queue: each reader
//! thread owns a read-only connection and sees the latest committed data
//! through WAL mode, concurrently with the writer.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          ReadPool                               │
//! │                                                                 │
//! │   query() / count_rows() / fetch_rows()                         │
//! │        │                                                        │
//! │        ▼                                                        │
//! │   bounded mpsc ──► Arc<Mutex<Receiver>> (threads compete)       │
//! │                        │            │            │              │
//! │                  ┌─────┴───┐  ┌─────┴───┐  ┌─────┴───┐          │
//! │                  │Reader 1 │  │Reader 2 │  │Reader N │          │
//! │                  │ RO conn │  │ RO conn │  │ RO conn │          │
//! │                  └─────────┘  └─────────┘  └─────────┘          │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Timeouts
//!
//! Every request is bounded by the pool's query timeout, measured from the
//! moment it is issued. When it elapses the caller gets
//! `Error::QueryTimeout` and, if a reader is executing that request, its
//! statement is interrupted so the thread is freed.
//!
//! Connections are opened `SQLITE_OPEN_READ_ONLY`: a statement that slipped
//! past the read-only check still cannot modify the database.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, InterruptHandle, OpenFlags};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::schema::{qualified, table_def, LEDGER_SEQUENCE_COLUMN};
use crate::types::{LedgerRange, LedgerTable, Row, SchemaName};

/// Maximum number of pending read requests.
const READ_CHANNEL_SIZE: usize = 1024;

/// Rows and column names of an ad-hoc query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    /// Column names in result order.
    pub columns: Vec<String>,
    /// Result rows.
    pub rows: Vec<Row>,
}

/// Row counts per table of one schema.
pub type TableCounts = BTreeMap<LedgerTable, u64>;

// =============================================================================
// Requests
// =============================================================================

enum ReadOp {
    Query {
        sql: String,
        params: Vec<Value>,
        response: oneshot::Sender<Result<QueryResult>>,
    },
    CountRows {
        schema: SchemaName,
        table: LedgerTable,
        range: Option<LedgerRange>,
        response: oneshot::Sender<Result<u64>>,
    },
    CountAll {
        schema: SchemaName,
        response: oneshot::Sender<Result<TableCounts>>,
    },
    FetchRows {
        schema: SchemaName,
        table: LedgerTable,
        range: Option<LedgerRange>,
        response: oneshot::Sender<Result<Vec<Row>>>,
    },
    Ping {
        response: oneshot::Sender<Result<()>>,
    },
}

impl ReadOp {
    /// True if the caller has stopped waiting.
    fn is_abandoned(&self) -> bool {
        match self {
            ReadOp::Query { response, .. } => response.is_closed(),
            ReadOp::CountRows { response, .. } => response.is_closed(),
            ReadOp::CountAll { response, .. } => response.is_closed(),
            ReadOp::FetchRows { response, .. } => response.is_closed(),
            ReadOp::Ping { response } => response.is_closed(),
        }
    }
}

struct ReadRequest {
    id: u64,
    op: ReadOp,
}

/// What one reader thread is doing, for interrupting timed-out requests.
struct ReaderSlot {
    interrupt: InterruptHandle,
    current: Mutex<Option<u64>>,
}

impl ReaderSlot {
    fn set_current(&self, id: Option<u64>) {
        *self.current.lock().unwrap_or_else(|p| p.into_inner()) = id;
    }

    /// Interrupts the running statement if it belongs to request `id`.
    fn interrupt_if_running(&self, id: u64) -> bool {
        let current = self.current.lock().unwrap_or_else(|p| p.into_inner());
        if *current == Some(id) {
            self.interrupt.interrupt();
            return true;
        }
        false
    }
}

// =============================================================================
// Read Pool
// =============================================================================

/// Pool of read-only reader threads.
pub struct ReadPool {
    tx: Option<mpsc::Sender<ReadRequest>>,
    slots: Arc<Vec<ReaderSlot>>,
    threads: Vec<JoinHandle<()>>,
    query_timeout: Duration,
    next_id: AtomicU64,
}

impl ReadPool {
    /// Opens `readers` read-only connections to `path` and starts one thread
    /// per connection.
    pub fn open(path: &Path, readers: usize, query_timeout: Duration) -> Result<Self> {
        let readers = readers.max(1);
        let (tx, rx) = mpsc::channel(READ_CHANNEL_SIZE);
        let rx = Arc::new(Mutex::new(rx));

        let mut conns = Vec::with_capacity(readers);
        let mut slots = Vec::with_capacity(readers);
        for _ in 0..readers {
            let conn = Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            slots.push(ReaderSlot {
                interrupt: conn.get_interrupt_handle(),
                current: Mutex::new(None),
            });
            conns.push(conn);
        }
        let slots = Arc::new(slots);

        let mut threads = Vec::with_capacity(readers);
        for (i, conn) in conns.into_iter().enumerate() {
            let rx = Arc::clone(&rx);
            let slots = Arc::clone(&slots);
            let handle = thread::Builder::new()
                .name(format!("ledgerlake-reader-{}", i))
                .spawn(move || run_reader(conn, i, slots, rx))?;
            threads.push(handle);
        }

        info!(readers, path = %path.display(), "read pool started");
        Ok(Self {
            tx: Some(tx),
            slots,
            threads,
            query_timeout,
            next_id: AtomicU64::new(1),
        })
    }

    /// Number of reader threads.
    pub fn size(&self) -> usize {
        self.threads.len()
    }

    /// Per-request timeout.
    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }

    /// Runs a read-only SQL statement with positional parameters.
    ///
    /// # Errors
    ///
    /// - `Error::NotReadOnly` if the statement would write
    /// - `Error::QueryTimeout` if it ran past the query timeout
    pub async fn query(&self, sql: impl Into<String>, params: Vec<Value>) -> Result<QueryResult> {
        let sql = sql.into();
        self.request(|response| ReadOp::Query { sql, params, response }).await
    }

    /// Rows of `table` in `schema`, optionally limited to a ledger range.
    pub async fn count_rows(&self, schema: &SchemaName, table: LedgerTable, range: Option<LedgerRange>) -> Result<u64> {
        let schema = schema.clone();
        self.request(|response| ReadOp::CountRows {
            schema,
            table,
            range,
            response,
        })
        .await
    }

    /// Rows of every table in `schema`.
    pub async fn count_all(&self, schema: &SchemaName) -> Result<TableCounts> {
        let schema = schema.clone();
        self.request(|response| ReadOp::CountAll { schema, response }).await
    }

    /// Rows of `table` in `schema` in insertion order, optionally limited to a
    /// ledger range.
    pub async fn fetch_rows(
        &self,
        schema: &SchemaName,
        table: LedgerTable,
        range: Option<LedgerRange>,
    ) -> Result<Vec<Row>> {
        let schema = schema.clone();
        self.request(|response| ReadOp::FetchRows {
            schema,
            table,
            range,
            response,
        })
        .await
    }

    /// Round trip through a reader thread.
    pub async fn ping(&self) -> Result<()> {
        self.request(|response| ReadOp::Ping { response }).await
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<Result<T>>) -> ReadOp) -> Result<T> {
        let tx = self.tx.as_ref().ok_or(Error::ReadPoolClosed)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (response, rx) = oneshot::channel();
        let request = ReadRequest {
            id,
            op: build(response),
        };

        let exchange = async {
            tx.send(request).await.map_err(|_| Error::ReadPoolClosed)?;
            rx.await.map_err(|_| Error::ReadPoolClosed)?
        };

        match tokio::time::timeout(self.query_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                let interrupted = self.slots.iter().any(|slot| slot.interrupt_if_running(id));
                warn!(
                    request = id,
                    timeout_ms = self.query_timeout.as_millis() as u64,
                    interrupted,
                    "read query timed out"
                );
                Err(Error::QueryTimeout {
                    timeout: self.query_timeout,
                })
            }
        }
    }

    /// Stops accepting requests and joins the reader threads.
    pub async fn shutdown(mut self) {
        self.tx.take();
        let threads = std::mem::take(&mut self.threads);
        let joined = tokio::task::spawn_blocking(move || {
            threads.into_iter().map(JoinHandle::join).filter(|joined| joined.is_err()).count()
        })
        .await;
        match joined {
            Ok(0) => info!("read pool stopped"),
            Ok(panicked) => warn!(panicked, "read pool stopped; reader threads panicked"),
            Err(e) => warn!(error = %e, "joining reader threads failed"),
        }
    }
}

// =============================================================================
// Reader Loop
// =============================================================================

/// Pooled reader loop.
///
/// Threads compete for the receiver lock; whichever is free takes the next
/// request.
fn run_reader(
    conn: Connection,
    index: usize,
    slots: Arc<Vec<ReaderSlot>>,
    rx: Arc<Mutex<mpsc::Receiver<ReadRequest>>>,
) {
    let slot = &slots[index];
    loop {
        let request = {
            let mut guard = rx.lock().unwrap_or_else(|p| p.into_inner());
            guard.blocking_recv()
        };
        let Some(ReadRequest { id, op }) = request else {
            break;
        };
        if op.is_abandoned() {
            debug!(request = id, "skipping abandoned read request");
            continue;
        }

        slot.set_current(Some(id));
        match op {
            ReadOp::Query { sql, params, response } => {
                let _ = response.send(run_query(&conn, &sql, &params));
            }
            ReadOp::CountRows {
                schema,
                table,
                range,
                response,
            } => {
                let _ = response.send(count_rows(&conn, &schema, table, range));
            }
            ReadOp::CountAll { schema, response } => {
                let result = LedgerTable::ALL
                    .into_iter()
                    .map(|t| count_rows(&conn, &schema, t, None).map(|n| (t, n)))
                    .collect();
                let _ = response.send(result);
            }
            ReadOp::FetchRows {
                schema,
                table,
                range,
                response,
            } => {
                let _ = response.send(fetch_rows(&conn, &schema, table, range));
            }
            ReadOp::Ping { response } => {
                let _ = response.send(conn.query_row("SELECT 1", [], |_| Ok(())).map_err(Error::from));
            }
        }
        slot.set_current(None);
    }
    debug!(reader = index, "reader thread exiting");
}

// =============================================================================
// Queries
// =============================================================================

fn collect_rows(stmt: &mut rusqlite::Statement<'_>, params: &[Value]) -> Result<Vec<Row>> {
    let width = stmt.column_count();
    let rows = stmt
        .query_map(params_from_iter(params.iter()), |row| {
            (0..width)
                .map(|i| row.get::<_, Value>(i))
                .collect::<rusqlite::Result<Vec<_>>>()
                .map(Row::new)
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn run_query(conn: &Connection, sql: &str, params: &[Value]) -> Result<QueryResult> {
    let mut stmt = conn.prepare(sql)?;
    if !stmt.readonly() {
        return Err(Error::NotReadOnly { sql: sql.to_string() });
    }
    let columns = stmt.column_names().into_iter().map(String::from).collect();
    let rows = collect_rows(&mut stmt, params)?;
    Ok(QueryResult { columns, rows })
}

/// `WHERE` clause and parameters for an optional ledger range.
fn range_filter(range: Option<LedgerRange>) -> (String, Vec<Value>) {
    match range {
        Some(r) => (
            format!(" WHERE {} BETWEEN ?1 AND ?2", LEDGER_SEQUENCE_COLUMN),
            vec![Value::Integer(i64::from(r.start())), Value::Integer(i64::from(r.end()))],
        ),
        None => (String::new(), Vec::new()),
    }
}

fn count_rows(conn: &Connection, schema: &SchemaName, table: LedgerTable, range: Option<LedgerRange>) -> Result<u64> {
    let (filter, params) = range_filter(range);
    let sql = format!("SELECT COUNT(*) FROM {}{}", qualified(schema, table), filter);
    let count: i64 = conn.query_row(&sql, params_from_iter(params.iter()), |row| row.get(0))?;
    Ok(count as u64)
}

fn fetch_rows(
    conn: &Connection,
    schema: &SchemaName,
    table: LedgerTable,
    range: Option<LedgerRange>,
) -> Result<Vec<Row>> {
    let (filter, params) = range_filter(range);
    let columns: Vec<&str> = table_def(table).column_names().collect();
    let sql = format!(
        "SELECT {} FROM {}{} ORDER BY rowid",
        columns.join(", "),
        qualified(schema, table),
        filter
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    collect_rows(&mut stmt, &params)
}
