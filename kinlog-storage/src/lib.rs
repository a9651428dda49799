//! DuckDB storage layer for Kinlog.
//!
//! Persists sealed timeline entries and the child roster in a single DuckDB
//! file. Everything stored here is either ciphertext or wrapped key
//! material; the store never sees a password or plaintext.
//!
//! # Architecture
//!
//! - `entries` holds each sealed body as JSON text, exactly as written
//! - `entry_targets` indexes entries by timeline for discovery queries
//! - `children` holds profiles with their wrapped credential records

mod duckdb_store;
mod error;

pub use duckdb_store::DuckDbStore;
pub use error::{StorageError, StorageResult};

use tracing::warn;

/// DuckDB memory ceiling for a timeline store. Stores hold one family's
/// sealed entries, so this is far more than a healthy store touches.
pub const DEFAULT_MEMORY_LIMIT: &str = "256MB";

/// DuckDB worker threads for a timeline store. Queries are single-timeline
/// index lookups; decryption happens outside the database.
pub const DEFAULT_THREADS: u32 = 2;

/// Open a timeline store database, recovering from a stale WAL and capping
/// DuckDB's memory and threads.
///
/// If the first open fails while a `.wal` file sits next to the database,
/// the WAL is removed and the open is retried once. Entries are written in
/// single transactions, so a discarded WAL loses at most the write that was
/// in flight when the process died.
pub fn open_duckdb_with_wal_recovery(
    path: &std::path::Path,
    memory_limit: &str,
    threads: u32,
) -> StorageResult<duckdb::Connection> {
    let conn = match duckdb::Connection::open(path) {
        Ok(c) => c,
        Err(first_err) => {
            let wal_path = path.with_extension(
                path.extension()
                    .map(|ext| format!("{}.wal", ext.to_string_lossy()))
                    .unwrap_or_else(|| "wal".to_string()),
            );
            if wal_path.exists() {
                warn!(
                    db = %path.display(),
                    wal = %wal_path.display(),
                    error = %first_err,
                    "Timeline store failed to open, discarding stale WAL"
                );
                if std::fs::remove_file(&wal_path).is_ok() {
                    let c = duckdb::Connection::open(path)?;
                    apply_resource_limits(&c, memory_limit, threads)?;
                    return Ok(c);
                }
            }
            return Err(first_err.into());
        }
    };
    apply_resource_limits(&conn, memory_limit, threads)?;
    Ok(conn)
}

fn apply_resource_limits(
    conn: &duckdb::Connection,
    memory_limit: &str,
    threads: u32,
) -> StorageResult<()> {
    conn.execute_batch(&format!(
        "PRAGMA memory_limit='{memory_limit}'; PRAGMA threads={threads};"
    ))?;
    Ok(())
}
