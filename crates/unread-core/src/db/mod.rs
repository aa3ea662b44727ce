//! SQLite marker store utilities.
//!
//! Runtime defaults:
//! - `journal_mode = WAL` so unread queries proceed while a writer commits
//! - `busy_timeout` from [`StoreConfig`] to ride out writer contention
//! - `foreign_keys = ON` for host schemas that cascade reader deletion
//!
//! Every multi-row mutation goes through [`with_transaction`], which takes
//! the write lock up front (`BEGIN IMMEDIATE`). That lock is what serializes
//! concurrent mark and compaction calls for the same reader.

pub mod markers;
pub mod migrations;
pub mod runs;
pub mod schema;

use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::Path;

use crate::config::StoreConfig;
use crate::error::{Result, UnreadError};

/// Open (or create) the marker database, apply runtime pragmas, and migrate
/// the schema to the latest version.
///
/// # Errors
///
/// Returns an error if opening, configuring, or migrating the database fails,
/// or if the on-disk schema is newer than this build.
pub fn open_store(path: &Path, config: &StoreConfig) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            UnreadError::Config(format!(
                "create marker db directory {}: {e}",
                parent.display()
            ))
        })?;
    }

    let mut conn = Connection::open(path)?;
    prepare(&mut conn, config)?;
    tracing::debug!(path = %path.display(), "opened marker store");
    Ok(conn)
}

/// In-memory marker store, mostly for tests and simulation.
///
/// # Errors
///
/// Returns an error if configuring or migrating the database fails.
pub fn open_in_memory(config: &StoreConfig) -> Result<Connection> {
    let mut conn = Connection::open_in_memory()?;
    prepare(&mut conn, config)?;
    Ok(conn)
}

/// Run `f` inside a `BEGIN IMMEDIATE` transaction.
///
/// The transaction commits only when `f` returns `Ok`; any error (or panic)
/// drops it, which rolls back every statement `f` issued.
///
/// # Errors
///
/// Returns the error from `f`, or a store error if begin/commit fails.
pub fn with_transaction<T>(
    conn: &Connection,
    f: impl FnOnce(&Transaction<'_>) -> Result<T>,
) -> Result<T> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
}

fn prepare(conn: &mut Connection, config: &StoreConfig) -> Result<()> {
    configure_connection(conn, config)?;

    let found = migrations::current_schema_version(conn)?;
    if found > migrations::LATEST_SCHEMA_VERSION {
        return Err(UnreadError::SchemaTooNew {
            found,
            supported: migrations::LATEST_SCHEMA_VERSION,
        });
    }
    migrations::migrate(conn)?;
    Ok(())
}

fn configure_connection(conn: &Connection, config: &StoreConfig) -> rusqlite::Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    let _journal_mode: String =
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.busy_timeout(config.busy_timeout())?;
    Ok(())
}
