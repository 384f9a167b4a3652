//! SQLite connection setup and the store error type.
//!
//! Every actor (poller, notifier, console, plot worker) opens its own
//! connection. All of them run in WAL mode with a busy timeout so that a
//! writer holding the lock makes the others wait instead of failing.

use core::fmt;
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::SqliteConnection;
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use log::{debug, info};
use std::error::Error;
use std::time::Duration;

use crate::timestamp::TimestampError;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

#[derive(Debug)]
pub enum StoreError {
    /// No row at the requested key.
    NotFound(String),
    /// Duplicate-key write (two writers raced for the same timestamp).
    IntegrityConflict(String),
    /// A stored key could not be parsed; the database is corrupt.
    InvalidTimestamp(TimestampError),
    /// A write whose merged value cannot be stored.
    InvalidValue(String),
    Database(DieselError),
    Connection(String),
    Migration(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound(key) => write!(f, "{} : not found", key),
            StoreError::IntegrityConflict(msg) => write!(f, "integrity conflict: {}", msg),
            StoreError::InvalidTimestamp(e) => write!(f, "stored row has {}", e),
            StoreError::InvalidValue(msg) => write!(f, "invalid value: {}", msg),
            StoreError::Database(e) => write!(f, "database error: {}", e),
            StoreError::Connection(msg) => write!(f, "connection failed: {}", msg),
            StoreError::Migration(msg) => write!(f, "applying migrations failed: {}", msg),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StoreError::InvalidTimestamp(e) => Some(e),
            StoreError::Database(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DieselError> for StoreError {
    fn from(value: DieselError) -> Self {
        match value {
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                StoreError::IntegrityConflict(info.message().to_string())
            }
            other => StoreError::Database(other),
        }
    }
}

impl From<TimestampError> for StoreError {
    fn from(value: TimestampError) -> Self {
        StoreError::InvalidTimestamp(value)
    }
}

/// Open (or create) the database at `path`, configure it for concurrent use
/// and bring the schema up to date.
pub fn open(path: &str, busy_timeout: Duration) -> Result<SqliteConnection, StoreError> {
    let mut conn = SqliteConnection::establish(path).map_err(|e| StoreError::Connection(format!("{}: {}", path, e)))?;
    configure(&mut conn, busy_timeout)?;
    apply_migrations(&mut conn)?;
    debug!("Opened database at {}", path);
    Ok(conn)
}

/// Private in-memory database with the schema applied.
pub fn open_in_memory() -> Result<SqliteConnection, StoreError> {
    open(":memory:", Duration::from_millis(0))
}

fn configure(conn: &mut SqliteConnection, busy_timeout: Duration) -> Result<(), StoreError> {
    conn.batch_execute(&format!(
        "PRAGMA busy_timeout = {}; PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;",
        busy_timeout.as_millis()
    ))?;
    Ok(())
}

fn apply_migrations(conn: &mut SqliteConnection) -> Result<(), StoreError> {
    let applied = conn
        .run_pending_migrations(MIGRATIONS)
        .map_err(|e| StoreError::Migration(e.to_string()))?;
    if !applied.is_empty() {
        let names = applied.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ");
        info!("Applied {} database migration(s): {}", applied.len(), names);
    }
    Ok(())
}
