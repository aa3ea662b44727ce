//! Reader providers: the narrow view of the host's identity system.

use std::collections::BTreeSet;
use std::fmt::Debug;

use rusqlite::{Connection, OptionalExtension, params};

use crate::error::Result;
use crate::model::{Reader, ReaderId};
use crate::registry::{quote, validate_identifier};

/// Enumerates and resolves readers.
pub trait ReaderProvider: Send + Sync + Debug {
    /// Every reader known to the host, in ascending id order.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be read.
    fn all_readers(&self, conn: &Connection) -> Result<Vec<Reader>>;

    /// Resolve one reader, or `None` if the host does not know it.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be read.
    fn resolve(&self, conn: &Connection, id: ReaderId) -> Result<Option<Reader>>;

    /// A `SELECT` yielding one column of valid reader ids, for providers
    /// backed by the same database. Lets collection-wide writes run as a
    /// single `INSERT ... SELECT`.
    fn id_query(&self) -> Option<String> {
        None
    }
}

/// Readers stored in a host table with an integer id column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderTable {
    table: String,
    id_column: String,
}

impl ReaderTable {
    /// # Errors
    ///
    /// Returns [`UnreadError::InvalidArgument`](crate::UnreadError::InvalidArgument)
    /// if either name is not a plain SQL identifier.
    pub fn new(table: &str, id_column: &str) -> Result<Self> {
        validate_identifier(table)?;
        validate_identifier(id_column)?;
        Ok(Self {
            table: table.to_string(),
            id_column: id_column.to_string(),
        })
    }
}

impl ReaderProvider for ReaderTable {
    fn all_readers(&self, conn: &Connection) -> Result<Vec<Reader>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {col} FROM {table} ORDER BY {col}",
            col = quote(&self.id_column),
            table = quote(&self.table),
        ))?;
        let readers = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .map(|id| id.map(Reader::new))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(readers)
    }

    fn resolve(&self, conn: &Connection, id: ReaderId) -> Result<Option<Reader>> {
        let found = conn
            .query_row(
                &format!(
                    "SELECT {col} FROM {table} WHERE {col} = ?1",
                    col = quote(&self.id_column),
                    table = quote(&self.table),
                ),
                params![id.get()],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(found.map(Reader::new))
    }

    fn id_query(&self) -> Option<String> {
        Some(format!(
            "SELECT DISTINCT {col} FROM {table} WHERE {col} > 0",
            col = quote(&self.id_column),
            table = quote(&self.table),
        ))
    }
}

/// Fixed reader set, for hosts whose readers do not live in SQLite.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticReaders {
    ids: BTreeSet<ReaderId>,
}

impl StaticReaders {
    pub fn new(ids: impl IntoIterator<Item = i64>) -> Self {
        Self {
            ids: ids.into_iter().map(ReaderId).collect(),
        }
    }
}

impl ReaderProvider for StaticReaders {
    fn all_readers(&self, _conn: &Connection) -> Result<Vec<Reader>> {
        Ok(self.ids.iter().map(|id| Reader { id: *id }).collect())
    }

    fn resolve(&self, _conn: &Connection, id: ReaderId) -> Result<Option<Reader>> {
        Ok(self.ids.contains(&id).then_some(Reader { id }))
    }
}
