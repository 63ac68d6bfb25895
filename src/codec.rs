//! # Canonical Row Encoding and Checksums
//!
//! Batch completion records carry a content checksum so the downstream audit
//! chain can detect a batch whose stored rows differ from what was ingested.
//!
//! ## Canonical Form
//!
//! Rows are hashed table by table in write order. Each table contributes its
//! name and row count, then every value as a one-byte type tag followed by its
//! bytes:
//!
//! ```text
//! [table name][u64 row count] [tag][value] [tag][value] ... [table name] ...
//!
//! tag 0 = NULL       (no payload)
//! tag 1 = INTEGER    (i64, little endian)
//! tag 2 = REAL       (f64 bits, little endian)
//! tag 3 = TEXT       (u64 length, utf-8 bytes)
//! tag 4 = BLOB       (u64 length, bytes)
//! ```
//!
//! Length prefixes keep `["ab", "c"]` and `["a", "bc"]` distinct. Type tags
//! keep `Integer(1)` and `Text("1")` distinct.

use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::types::Value;
use xxhash_rust::xxh3::Xxh3;

use crate::types::TableRows;

const TAG_NULL: u8 = 0;
const TAG_INTEGER: u8 = 1;
const TAG_REAL: u8 = 2;
const TAG_TEXT: u8 = 3;
const TAG_BLOB: u8 = 4;

/// Feeds one value's canonical encoding into `hasher`.
fn hash_value(hasher: &mut Xxh3, value: &Value) {
    match value {
        Value::Null => hasher.update(&[TAG_NULL]),
        Value::Integer(i) => {
            hasher.update(&[TAG_INTEGER]);
            hasher.update(&i.to_le_bytes());
        }
        Value::Real(f) => {
            hasher.update(&[TAG_REAL]);
            hasher.update(&f.to_bits().to_le_bytes());
        }
        Value::Text(s) => {
            hasher.update(&[TAG_TEXT]);
            hasher.update(&(s.len() as u64).to_le_bytes());
            hasher.update(s.as_bytes());
        }
        Value::Blob(b) => {
            hasher.update(&[TAG_BLOB]);
            hasher.update(&(b.len() as u64).to_le_bytes());
            hasher.update(b);
        }
    }
}

/// Computes the XXH3-64 content checksum of a batch's rows.
///
/// Empty tables contribute nothing, so adding an empty table to a batch does
/// not change its checksum.
pub fn compute_checksum(tables: &TableRows) -> u64 {
    let mut hasher = Xxh3::new();
    for (table, rows) in tables.non_empty() {
        hasher.update(table.name().as_bytes());
        hasher.update(&(rows.len() as u64).to_le_bytes());
        for row in rows {
            for value in row.values() {
                hash_value(&mut hasher, value);
            }
        }
    }
    hasher.digest()
}

/// Returns the current time in milliseconds since Unix epoch.
pub fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
