//! Database module for meshdeck.
//!
//! SQLite storage for the registries, the audit log and the telemetry
//! append log, with embedded migrations.

mod audit;
mod models;
mod store;
mod telemetry;

pub use models::*;
pub use store::*;
pub use telemetry::*;

use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("precondition failed: {0}")]
    Precondition(String),
    #[error("connection lock poisoned")]
    Poisoned,
}

/// Open a connection with the pragmas every meshdeck connection uses.
pub(crate) fn open_connection<P: AsRef<Path>>(path: P) -> Result<Connection, DbError> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    // WAL lets readers keep a snapshot while the ingest writer appends.
    conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;
    Ok(conn)
}

/// Apply the embedded migrations.
pub(crate) fn migrate(conn: &Connection) -> Result<(), DbError> {
    conn.execute_batch(include_str!("../../migrations/000001_registry.up.sql"))
        .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
    conn.execute_batch(include_str!("../../migrations/000002_telemetry.up.sql"))
        .map_err(|e| DbError::Migration(format!("Migration 2 failed: {}", e)))?;
    Ok(())
}
