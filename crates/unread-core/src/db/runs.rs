//! Compaction run history (`compaction_runs`).

use rusqlite::{Connection, OptionalExtension, params};

use crate::compaction::{CompactionReport, ReaderFailure};
use crate::error::Result;

/// A recorded compaction run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionRun {
    pub run_id: i64,
    pub collection_type: String,
    pub started_at_us: i64,
    pub finished_at_us: i64,
    pub readers_visited: u64,
    pub readers_compacted: u64,
    pub readers_reset: u64,
    pub readers_failed: u64,
    pub markers_deleted: u64,
    pub failures: Vec<ReaderFailure>,
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

/// Append a finished run to the history table.
///
/// # Errors
///
/// Returns an error if serializing failures or inserting the row fails.
pub fn record_run(conn: &Connection, report: &CompactionReport) -> Result<i64> {
    let failures_json = serde_json::to_string(&report.failures)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;

    conn.execute(
        "INSERT INTO compaction_runs (
            collection_type, started_at_us, finished_at_us,
            readers_visited, readers_compacted, readers_reset, readers_failed,
            markers_deleted, failures_json
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            report.collection_type,
            report.started_at_us,
            report.finished_at_us,
            to_i64(report.readers_visited),
            to_i64(report.readers_compacted),
            to_i64(report.readers_reset),
            to_i64(report.readers_failed()),
            to_i64(report.markers_deleted),
            failures_json,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Most recent run for a collection, if any.
///
/// # Errors
///
/// Returns an error if the query fails or stored failures cannot be decoded.
pub fn last_run(conn: &Connection, collection_type: &str) -> Result<Option<CompactionRun>> {
    let row = conn
        .query_row(
            "SELECT run_id, collection_type, started_at_us, finished_at_us,
                    readers_visited, readers_compacted, readers_reset, readers_failed,
                    markers_deleted, failures_json
             FROM compaction_runs
             WHERE collection_type = ?1
             ORDER BY started_at_us DESC, run_id DESC
             LIMIT 1",
            params![collection_type],
            |row| {
                Ok((
                    CompactionRun {
                        run_id: row.get(0)?,
                        collection_type: row.get(1)?,
                        started_at_us: row.get(2)?,
                        finished_at_us: row.get(3)?,
                        readers_visited: to_u64(row.get(4)?),
                        readers_compacted: to_u64(row.get(5)?),
                        readers_reset: to_u64(row.get(6)?),
                        readers_failed: to_u64(row.get(7)?),
                        markers_deleted: to_u64(row.get(8)?),
                        failures: Vec::new(),
                    },
                    row.get::<_, String>(9)?,
                ))
            },
        )
        .optional()?;

    let Some((mut run, failures_json)) = row else {
        return Ok(None);
    };
    run.failures = serde_json::from_str(&failures_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Some(run))
}
