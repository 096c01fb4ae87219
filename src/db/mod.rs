// Database module
//
// Both services share one SQLite database file in WAL mode. Connections are
// short-lived; async callers go through the `Db` handle, which opens a fresh
// connection on a blocking thread per call.

pub mod migrations;
pub mod schema;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::Connection;

use crate::error::{OtError, Result};

/// Open a connection, apply per-connection pragmas, and run migrations.
pub fn open_db(db_path: &Path) -> Result<Connection> {
    let conn = open_connection(db_path)?;
    migrations::run_migrations(&conn)?;
    Ok(conn)
}

/// Open a connection without running migrations (fast path for per-request use).
pub fn open_connection(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(Duration::from_secs(5))?;

    // Enable foreign keys (must be done per connection)
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;

    // WAL mode for reader/writer concurrency between the two services
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;

    Ok(conn)
}

/// Cloneable handle that runs closures against a fresh connection on the
/// blocking thread pool. Keeps rusqlite out of async contexts.
#[derive(Clone)]
pub struct Db {
    path: Arc<PathBuf>,
}

impl Db {
    /// Open the database, running migrations once up front.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = open_db(path)?;
        drop(conn);
        Ok(Db {
            path: Arc::new(path.to_path_buf()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a connection synchronously. For worker threads and the CLI.
    pub fn connect(&self) -> Result<Connection> {
        open_connection(&self.path)
    }

    /// Run a closure with a fresh connection on the blocking pool.
    pub async fn call<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let path = Arc::clone(&self.path);
        tokio::task::spawn_blocking(move || {
            let mut conn = open_connection(&path)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| OtError::Internal(format!("database task panicked: {}", e)))?
    }
}

/// Current UTC time in the canonical stored format (microsecond precision,
/// no offset suffix). This exact string participates in audit entry hashes,
/// so the format must never change.
pub fn now_iso() -> String {
    Utc::now().naive_utc().format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

/// Format a naive UTC datetime in the canonical stored format.
pub fn to_iso(dt: NaiveDateTime) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

/// Parse a client-supplied ISO-8601 timestamp. Accepts a trailing `Z`, an
/// explicit offset, or a bare naive datetime; the result is naive UTC.
pub fn parse_client_timestamp(s: &str) -> Result<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc).naive_utc());
    }
    // Trailing Z with no fractional offset support in some client formats
    let trimmed = s.trim_end_matches('Z');
    if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(dt);
    }
    Err(OtError::Validation(format!("Invalid timestamp: {}", s)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_client_timestamp_variants() {
        assert!(parse_client_timestamp("2025-06-15T10:30:00Z").is_ok());
        assert!(parse_client_timestamp("2025-06-15T10:30:00+02:00").is_ok());
        assert!(parse_client_timestamp("2025-06-15T10:30:00.123456").is_ok());
        assert!(parse_client_timestamp("not-a-date").is_err());
    }

    #[test]
    fn test_now_iso_has_microseconds() {
        let s = now_iso();
        // "2026-01-01T00:00:00.000000" is 26 chars
        assert_eq!(s.len(), 26, "unexpected format: {}", s);
        assert!(s.contains('.'));
        assert!(!s.ends_with('Z'));
    }
}
