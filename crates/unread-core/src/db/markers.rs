//! Marker store: point lookup, upsert, filtered delete, and bulk insert over
//! the `read_markers` table.
//!
//! Functions take `&Connection`, so they run equally inside a
//! [`super::with_transaction`] closure (a `Transaction` derefs to its
//! connection) or in autocommit mode for read-only lookups.

use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use serde::Serialize;

use crate::error::Result;
use crate::model::{NewMarker, ReadMarker, ReaderId};

/// Rows per multi-row `INSERT` in [`bulk_insert`]. Four bound values per row
/// keeps each statement well under SQLite's bound-parameter limit.
pub const BULK_INSERT_CHUNK: usize = 500;

const MARKER_COLUMNS: &str = "marker_id, reader_id, collection_type, item_id, read_at_us";

/// Which kinds of markers a [`MarkerFilter`] matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MarkerScope {
    /// Global and item markers.
    #[default]
    Any,
    /// Only the global baseline (`item_id IS NULL`).
    Global,
    /// Only per-item markers.
    Items,
}

/// Predicate for [`delete_where`] and [`count_where`].
///
/// All set fields combine with AND semantics. The collection is always
/// required, so a filter can never span collections by accident.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerFilter {
    pub collection_type: String,
    pub reader_id: Option<ReaderId>,
    pub scope: MarkerScope,
    /// Match only markers with `read_at_us` strictly below this value.
    pub read_before_us: Option<i64>,
}

impl MarkerFilter {
    #[must_use]
    pub fn collection(collection_type: &str) -> Self {
        Self {
            collection_type: collection_type.to_string(),
            reader_id: None,
            scope: MarkerScope::Any,
            read_before_us: None,
        }
    }

    #[must_use]
    pub const fn reader(mut self, reader_id: ReaderId) -> Self {
        self.reader_id = Some(reader_id);
        self
    }

    #[must_use]
    pub const fn scope(mut self, scope: MarkerScope) -> Self {
        self.scope = scope;
        self
    }

    #[must_use]
    pub const fn read_before(mut self, read_at_us: i64) -> Self {
        self.read_before_us = Some(read_at_us);
        self
    }

    fn where_clause(&self) -> (String, Vec<Value>) {
        let mut clauses = vec!["collection_type = ?".to_string()];
        let mut values = vec![Value::Text(self.collection_type.clone())];

        if let Some(reader_id) = self.reader_id {
            clauses.push("reader_id = ?".to_string());
            values.push(Value::Integer(reader_id.get()));
        }

        match self.scope {
            MarkerScope::Any => {}
            MarkerScope::Global => clauses.push("item_id IS NULL".to_string()),
            MarkerScope::Items => clauses.push("item_id IS NOT NULL".to_string()),
        }

        if let Some(before) = self.read_before_us {
            clauses.push("read_at_us < ?".to_string());
            values.push(Value::Integer(before));
        }

        (clauses.join(" AND "), values)
    }
}

/// Marker counts for one collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MarkerStats {
    pub global_markers: u64,
    pub item_markers: u64,
}

fn row_to_marker(row: &Row<'_>) -> rusqlite::Result<ReadMarker> {
    Ok(ReadMarker {
        marker_id: row.get(0)?,
        reader_id: ReaderId(row.get(1)?),
        collection_type: row.get(2)?,
        item_id: row.get(3)?,
        read_at_us: row.get(4)?,
    })
}

/// Point lookup. `item_id == None` fetches the global marker.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn find(
    conn: &Connection,
    reader_id: ReaderId,
    collection_type: &str,
    item_id: Option<&str>,
) -> Result<Option<ReadMarker>> {
    let marker = match item_id {
        Some(item_id) => conn
            .query_row(
                &format!(
                    "SELECT {MARKER_COLUMNS} FROM read_markers \
                     WHERE reader_id = ?1 AND collection_type = ?2 AND item_id = ?3"
                ),
                params![reader_id.get(), collection_type, item_id],
                row_to_marker,
            )
            .optional()?,
        None => conn
            .query_row(
                &format!(
                    "SELECT {MARKER_COLUMNS} FROM read_markers \
                     WHERE reader_id = ?1 AND collection_type = ?2 AND item_id IS NULL"
                ),
                params![reader_id.get(), collection_type],
                row_to_marker,
            )
            .optional()?,
    };
    Ok(marker)
}

/// Insert a marker, or move an existing one for the same slot to the new
/// `read_at_us`. Never creates a second marker for the same slot.
///
/// # Errors
///
/// Returns an error if the statement fails.
pub fn upsert(conn: &Connection, marker: &NewMarker) -> Result<()> {
    match marker.item_id.as_deref() {
        Some(item_id) => {
            conn.execute(
                "INSERT INTO read_markers (reader_id, collection_type, item_id, read_at_us)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (reader_id, collection_type, item_id) WHERE item_id IS NOT NULL
                 DO UPDATE SET read_at_us = excluded.read_at_us",
                params![
                    marker.reader_id.get(),
                    marker.collection_type,
                    item_id,
                    marker.read_at_us
                ],
            )?;
        }
        None => {
            conn.execute(
                "INSERT INTO read_markers (reader_id, collection_type, item_id, read_at_us)
                 VALUES (?1, ?2, NULL, ?3)
                 ON CONFLICT (reader_id, collection_type) WHERE item_id IS NULL
                 DO UPDATE SET read_at_us = excluded.read_at_us",
                params![
                    marker.reader_id.get(),
                    marker.collection_type,
                    marker.read_at_us
                ],
            )?;
        }
    }
    Ok(())
}

/// Delete every marker matching `filter`, returning the number removed.
///
/// # Errors
///
/// Returns an error if the statement fails.
pub fn delete_where(conn: &Connection, filter: &MarkerFilter) -> Result<usize> {
    let (clause, values) = filter.where_clause();
    let deleted = conn.execute(
        &format!("DELETE FROM read_markers WHERE {clause}"),
        params_from_iter(values),
    )?;
    Ok(deleted)
}

/// Count markers matching `filter`.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn count_where(conn: &Connection, filter: &MarkerFilter) -> Result<u64> {
    let (clause, values) = filter.where_clause();
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM read_markers WHERE {clause}"),
        params_from_iter(values),
        |row| row.get(0),
    )?;
    Ok(u64::try_from(count).unwrap_or_default())
}

/// Insert many markers with multi-row `INSERT` statements, one per
/// [`BULK_INSERT_CHUNK`] rows.
///
/// Plain insert, not upsert: callers clear the target slots first. A
/// conflicting row fails the whole statement.
///
/// # Errors
///
/// Returns an error if any statement fails.
pub fn bulk_insert(conn: &Connection, markers: &[NewMarker]) -> Result<usize> {
    let mut inserted = 0;
    for chunk in markers.chunks(BULK_INSERT_CHUNK) {
        let placeholders = vec!["(?, ?, ?, ?)"; chunk.len()].join(", ");
        let sql = format!(
            "INSERT INTO read_markers (reader_id, collection_type, item_id, read_at_us) \
             VALUES {placeholders}"
        );

        let mut values = Vec::with_capacity(chunk.len() * 4);
        for marker in chunk {
            values.push(Value::Integer(marker.reader_id.get()));
            values.push(Value::Text(marker.collection_type.clone()));
            values.push(
                marker
                    .item_id
                    .as_ref()
                    .map_or(Value::Null, |id| Value::Text(id.clone())),
            );
            values.push(Value::Integer(marker.read_at_us));
        }

        inserted += conn.execute(&sql, params_from_iter(values))?;
    }
    Ok(inserted)
}

/// Insert one global marker per reader id produced by `id_sql`, in a single
/// `INSERT ... SELECT`. Same plain-insert contract as [`bulk_insert`].
///
/// # Errors
///
/// Returns an error if the statement fails.
pub fn insert_globals_from(
    conn: &Connection,
    collection_type: &str,
    read_at_us: i64,
    id_sql: &str,
) -> Result<usize> {
    let sql = format!(
        "WITH ids(reader_id) AS ({id_sql}) \
         INSERT INTO read_markers (reader_id, collection_type, item_id, read_at_us) \
         SELECT reader_id, ?1, NULL, ?2 FROM ids"
    );
    Ok(conn.execute(&sql, params![collection_type, read_at_us])?)
}

/// All markers one reader holds in a collection, global marker first, then
/// item markers by `read_at_us`.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn list_for_reader(
    conn: &Connection,
    reader_id: ReaderId,
    collection_type: &str,
) -> Result<Vec<ReadMarker>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MARKER_COLUMNS} FROM read_markers \
         WHERE reader_id = ?1 AND collection_type = ?2 \
         ORDER BY item_id IS NOT NULL, read_at_us, item_id"
    ))?;
    let markers = stmt
        .query_map(params![reader_id.get(), collection_type], row_to_marker)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(markers)
}

/// Remove every marker a reader holds, across all collections.
///
/// Hosts call this when a reader account is deleted.
///
/// # Errors
///
/// Returns an error if the statement fails.
pub fn purge_reader(conn: &Connection, reader_id: ReaderId) -> Result<usize> {
    let deleted = conn.execute(
        "DELETE FROM read_markers WHERE reader_id = ?1",
        params![reader_id.get()],
    )?;
    Ok(deleted)
}

/// Count global and item markers in a collection.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn marker_stats(conn: &Connection, collection_type: &str) -> Result<MarkerStats> {
    let (global, items): (i64, i64) = conn.query_row(
        "SELECT
             COALESCE(SUM(CASE WHEN item_id IS NULL THEN 1 ELSE 0 END), 0),
             COALESCE(SUM(CASE WHEN item_id IS NOT NULL THEN 1 ELSE 0 END), 0)
         FROM read_markers
         WHERE collection_type = ?1",
        params![collection_type],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(MarkerStats {
        global_markers: u64::try_from(global).unwrap_or_default(),
        item_markers: u64::try_from(items).unwrap_or_default(),
    })
}
