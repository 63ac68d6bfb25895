//! # Shared Storage Handle
//!
//! [`Storage`] owns the database file for the lifetime of the orchestrator. It
//! opens the one connection allowed to write, configures the engine once, and
//! provisions network schemas before any batch flows.
//!
//! ## Connection Roles
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Storage                              │
//! │                                                              │
//! │   writer connection ──take_writer()──► BatchWriter           │
//! │   (provisioning, then                  (consumer thread,     │
//! │    handed off exactly once)             process lifetime)    │
//! │                                                              │
//! │   open_read_pool() ──────────────────► ReadPool              │
//! │                                        (N read-only conns)   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! After `take_writer()` the handle holds no write-capable connection, so no
//! code path can open a second writer through it.
//!
//! ## Engine Settings
//!
//! - `journal_mode = WAL`: readers never block the writer and vice versa
//! - `synchronous = NORMAL`: durable at checkpoint, safe against corruption
//! - `wal_autocheckpoint`: the engine's own threshold, set once here
//! - `busy_timeout`: bounds how long a lock conflict takes to surface

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use rusqlite::Connection;
use tracing::{debug, info};

use crate::config::{QueryConfig, StorageConfig};
use crate::error::{Error, Result};
use crate::reader::ReadPool;
use crate::schema;
use crate::types::{NetworkName, SchemaName};

/// Appends `-wal` to a database path.
pub fn wal_path_for(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push("-wal");
    PathBuf::from(name)
}

/// Current size of the WAL file in bytes, 0 if absent.
pub fn wal_size_bytes(wal_path: &Path) -> u64 {
    std::fs::metadata(wal_path).map(|m| m.len()).unwrap_or(0)
}

/// Runs a pragma, discarding whatever rows it reports back.
fn apply_pragma(conn: &Connection, sql: &str) -> Result<()> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query([])?;
    while rows.next()?.is_some() {}
    Ok(())
}

/// Applies engine settings to a write-capable connection.
pub fn configure_writer_connection(conn: &Connection, config: &StorageConfig) -> Result<()> {
    apply_pragma(conn, "PRAGMA journal_mode = WAL")?;
    apply_pragma(conn, "PRAGMA synchronous = NORMAL")?;
    apply_pragma(
        conn,
        &format!("PRAGMA wal_autocheckpoint = {}", config.wal_autocheckpoint_pages),
    )?;
    conn.busy_timeout(config.busy_timeout)?;
    Ok(())
}

/// The shared database handle.
pub struct Storage {
    path: PathBuf,
    writer: Option<Connection>,
}

impl Storage {
    /// Opens (creating if needed) the database file and configures the engine.
    ///
    /// # Errors
    ///
    /// - `Error::Io` if the parent directory cannot be created
    /// - `Error::Sqlite` if the file cannot be opened or configured
    pub fn open(config: &StorageConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&config.path)?;
        configure_writer_connection(&conn, config)?;
        schema::initialize_registry(&conn)?;

        info!(
            path = %config.path.display(),
            wal_autocheckpoint_pages = config.wal_autocheckpoint_pages,
            "storage opened"
        );

        Ok(Self {
            path: config.path.clone(),
            writer: Some(conn),
        })
    }

    /// Database file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// WAL file path.
    pub fn wal_path(&self) -> PathBuf {
        wal_path_for(&self.path)
    }

    /// Idempotently provisions `schema` for `network`.
    ///
    /// Must run before [`Storage::take_writer`].
    pub fn provision(&self, network: &NetworkName, schema: &SchemaName) -> Result<()> {
        let conn = self.writer_ref()?;
        schema::provision_schema(conn, network, schema).map_err(|e| match e {
            e @ Error::Schema(_) => e,
            other => Error::Schema(format!(
                "provisioning schema '{}' for network '{}' failed: {}",
                schema, network, other
            )),
        })?;
        debug!(network = %network, schema = %schema, "schema provisioned");
        Ok(())
    }

    /// Provisioned schemas with their networks.
    pub fn provisioned_schemas(&self) -> Result<Vec<(SchemaName, NetworkName)>> {
        schema::provisioned_schemas(self.writer_ref()?)
    }

    /// Hands the write-capable connection to its single owner.
    ///
    /// # Errors
    ///
    /// `Error::Schema` on a second call.
    pub fn take_writer(&mut self) -> Result<Connection> {
        self.writer
            .take()
            .ok_or_else(|| Error::Schema("writer connection already taken".to_string()))
    }

    /// Opens the read-only connection pool against the same file.
    pub fn open_read_pool(&self, config: &QueryConfig) -> Result<ReadPool> {
        ReadPool::open(&self.path, config.readers, config.query_timeout)
    }

    /// Closes the handle, including the writer connection if never taken.
    pub fn close(mut self) -> Result<()> {
        if let Some(conn) = self.writer.take() {
            conn.close().map_err(|(_, e)| Error::Sqlite(e))?;
        }
        info!(path = %self.path.display(), "storage closed");
        Ok(())
    }

    fn writer_ref(&self) -> Result<&Connection> {
        self.writer
            .as_ref()
            .ok_or_else(|| Error::Schema("writer connection already handed to the batch writer".to_string()))
    }
}
