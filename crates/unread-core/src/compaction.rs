//! Marker compaction: fold item markers into the global baseline.
//!
//! For one reader and collection, inside one transaction:
//!
//! 1. find the smallest read key among the reader's unread, visible items
//! 2. the candidate baseline sits just below it, or at now when nothing is
//!    unread
//! 3. the baseline never moves backwards past the current global marker
//! 4. drop every item marker at or below the baseline and store it as the
//!    new global marker
//!
//! Every item at or below the new baseline was already read, so unread
//! checks return the same answers before and after. Only storage shrinks.
//!
//! The batch job visits every reader. Store failures and unknown readers are
//! isolated to the reader they happened on: the job logs them, records them
//! in the report, and moves on. Any other error aborts the run.

use std::path::Path;
use std::thread;
use std::time::Instant;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::db::markers::{self, MarkerFilter, MarkerScope};
use crate::db::{open_store, runs, with_transaction};
use crate::engine::ReadState;
use crate::error::{Result, UnreadError};
use crate::model::{NewMarker, Reader, ReaderId};
use crate::query::UnreadQuery;

/// What compaction did for one reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReaderCompaction {
    /// Unread items remain; the baseline now sits just below the oldest one.
    Advanced {
        baseline_us: i64,
        markers_deleted: usize,
    },
    /// Nothing was unread; the baseline moved to now, or stayed put if it
    /// was already later.
    Reset {
        baseline_us: i64,
        markers_deleted: usize,
    },
}

impl ReaderCompaction {
    #[must_use]
    pub const fn markers_deleted(&self) -> usize {
        match self {
            Self::Advanced {
                markers_deleted, ..
            }
            | Self::Reset {
                markers_deleted, ..
            } => *markers_deleted,
        }
    }

    #[must_use]
    pub const fn baseline_us(&self) -> i64 {
        match self {
            Self::Advanced { baseline_us, .. } | Self::Reset { baseline_us, .. } => *baseline_us,
        }
    }
}

/// A reader the job could not compact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaderFailure {
    pub reader_id: ReaderId,
    pub code: String,
    pub message: String,
}

/// Outcome of one [`ReadState::compact_all`] run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionReport {
    pub collection_type: String,
    pub started_at_us: i64,
    pub finished_at_us: i64,
    pub readers_visited: u64,
    /// Readers whose baseline advanced below an unread item.
    pub readers_compacted: u64,
    /// Readers with nothing unread; the baseline moved to now unless it was
    /// already later.
    pub readers_reset: u64,
    /// Item markers removed across all readers.
    pub markers_deleted: u64,
    pub failures: Vec<ReaderFailure>,
}

impl CompactionReport {
    fn empty(collection_type: &str, started_at_us: i64) -> Self {
        Self {
            collection_type: collection_type.to_string(),
            started_at_us,
            finished_at_us: started_at_us,
            readers_visited: 0,
            readers_compacted: 0,
            readers_reset: 0,
            markers_deleted: 0,
            failures: Vec::new(),
        }
    }

    #[must_use]
    pub fn readers_failed(&self) -> u64 {
        self.failures.len() as u64
    }

    #[must_use]
    pub const fn duration_us(&self) -> i64 {
        self.finished_at_us - self.started_at_us
    }

    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.failures.is_empty()
    }

    fn absorb(&mut self, other: Self) {
        self.readers_visited += other.readers_visited;
        self.readers_compacted += other.readers_compacted;
        self.readers_reset += other.readers_reset;
        self.markers_deleted += other.markers_deleted;
        self.failures.extend(other.failures);
    }
}

impl ReadState {
    /// Compact one reader in its own transaction.
    ///
    /// # Errors
    ///
    /// `UnknownReader` for an invalid reader id or one the reader provider
    /// does not know, `InvalidArgument` for an unregistered collection, or
    /// `Store` (rolled back).
    pub fn compact_reader(
        &self,
        conn: &Connection,
        reader: &Reader,
        collection_type: &str,
    ) -> Result<ReaderCompaction> {
        self.assert_reader(conn, reader)?;
        with_transaction(conn, |tx| self.compact_reader_in(tx, reader, collection_type))
    }

    /// Compact every reader known to the reader provider.
    ///
    /// The run is appended to the compaction history.
    ///
    /// # Errors
    ///
    /// Aborts before touching any reader when the collection is not
    /// registered or the reader list cannot be loaded. `Store` and
    /// `UnknownReader` failures for one reader do not abort; they are listed
    /// in the report. Any other error stops the run and is returned.
    pub fn compact_all(
        &self,
        conn: &Connection,
        collection_type: &str,
    ) -> Result<CompactionReport> {
        self.registry.get(collection_type)?;
        let started_at_us = self.clock.now_us();
        let timer = Instant::now();

        let readers = self.readers.all_readers(conn)?;
        let mut report = CompactionReport::empty(collection_type, started_at_us);
        report.absorb(self.compact_readers(conn, &readers, collection_type, started_at_us)?);

        self.finish_run(conn, report, timer)
    }

    /// Compact every reader using `compaction.workers` threads, each with its
    /// own connection to the database at `path`.
    ///
    /// Readers are partitioned by id, so one reader is only ever touched by
    /// one worker.
    ///
    /// # Errors
    ///
    /// As [`Self::compact_all`], plus failures opening worker connections.
    pub fn compact_all_at(&self, path: &Path, collection_type: &str) -> Result<CompactionReport> {
        let conn = open_store(path, &self.config.store)?;
        let workers = self.config.compaction.workers;
        if workers <= 1 {
            return self.compact_all(&conn, collection_type);
        }

        self.registry.get(collection_type)?;
        let started_at_us = self.clock.now_us();
        let timer = Instant::now();

        let readers = self.readers.all_readers(&conn)?;
        let partitions = partition_readers(readers, workers);
        debug!(collection_type, workers, "starting parallel compaction");

        let partials: Vec<Result<CompactionReport>> = thread::scope(|scope| {
            let handles: Vec<_> = partitions
                .iter()
                .filter(|part| !part.is_empty())
                .map(|part| {
                    scope.spawn(move || -> Result<CompactionReport> {
                        let worker_conn = open_store(path, &self.config.store)?;
                        self.compact_readers(&worker_conn, part, collection_type, started_at_us)
                    })
                })
                .collect();

            handles
                .into_iter()
                .map(|handle| match handle.join() {
                    Ok(partial) => partial,
                    Err(panic) => std::panic::resume_unwind(panic),
                })
                .collect()
        });

        let mut report = CompactionReport::empty(collection_type, started_at_us);
        for partial in partials {
            report.absorb(partial?);
        }

        self.finish_run(&conn, report, timer)
    }

    fn compact_readers(
        &self,
        conn: &Connection,
        readers: &[Reader],
        collection_type: &str,
        started_at_us: i64,
    ) -> Result<CompactionReport> {
        let mut report = CompactionReport::empty(collection_type, started_at_us);

        // Readers come from the provider, so only the id check in
        // compact_reader_in applies here.
        for reader in readers {
            let outcome =
                with_transaction(conn, |tx| self.compact_reader_in(tx, reader, collection_type));
            tally(&mut report, reader, outcome)?;
        }

        Ok(report)
    }

    fn finish_run(
        &self,
        conn: &Connection,
        mut report: CompactionReport,
        timer: Instant,
    ) -> Result<CompactionReport> {
        report.finished_at_us = self.clock.now_us().max(report.started_at_us);

        if let Err(err) = runs::record_run(conn, &report) {
            warn!(
                collection_type = %report.collection_type,
                error = %err,
                "failed to record compaction run"
            );
        }

        info!(
            collection_type = %report.collection_type,
            readers_visited = report.readers_visited,
            readers_compacted = report.readers_compacted,
            readers_reset = report.readers_reset,
            readers_failed = report.readers_failed(),
            markers_deleted = report.markers_deleted,
            elapsed_ms = u64::try_from(timer.elapsed().as_millis()).unwrap_or(u64::MAX),
            "compaction run finished"
        );
        Ok(report)
    }

    pub(crate) fn compact_reader_in(
        &self,
        conn: &Connection,
        reader: &Reader,
        collection_type: &str,
    ) -> Result<ReaderCompaction> {
        if !reader.id.is_valid() {
            return Err(UnreadError::UnknownReader(format!(
                "reader id {} is not a valid identifier",
                reader.id
            )));
        }

        let visible = self.registry.visible_items(collection_type, reader)?;
        let oldest_unread = UnreadQuery::new(reader.id, visible).oldest_read_key(conn)?;

        let candidate = oldest_unread.map_or_else(
            || self.clock.now_us(),
            |key| key.saturating_sub(self.config.compaction.baseline_gap_us),
        );

        // The baseline never moves backwards. A wide gap, a rewound clock or
        // a future-keyed item would otherwise reopen items the current
        // baseline already covers.
        let current = markers::find(conn, reader.id, collection_type, None)?.map(|m| m.read_at_us);
        let baseline_us = current.map_or(candidate, |current| current.max(candidate));

        let markers_deleted = markers::delete_where(
            conn,
            &MarkerFilter::collection(collection_type)
                .reader(reader.id)
                .scope(MarkerScope::Items)
                .read_before(baseline_us.saturating_add(1)),
        )?;
        markers::upsert(conn, &NewMarker::global(reader.id, collection_type, baseline_us))?;

        debug!(
            reader_id = %reader.id,
            collection_type,
            ?oldest_unread,
            baseline_us,
            markers_deleted,
            "reader compacted"
        );
        Ok(if oldest_unread.is_some() {
            ReaderCompaction::Advanced {
                baseline_us,
                markers_deleted,
            }
        } else {
            ReaderCompaction::Reset {
                baseline_us,
                markers_deleted,
            }
        })
    }
}

/// Fold one reader's outcome into the report. Per-reader errors are
/// recorded; anything else is handed back to abort the run.
fn tally(
    report: &mut CompactionReport,
    reader: &Reader,
    outcome: Result<ReaderCompaction>,
) -> Result<()> {
    report.readers_visited += 1;
    match outcome {
        Ok(outcome) => {
            report.markers_deleted += outcome.markers_deleted() as u64;
            match outcome {
                ReaderCompaction::Advanced { .. } => report.readers_compacted += 1,
                ReaderCompaction::Reset { .. } => report.readers_reset += 1,
            }
        }
        Err(err) if err.is_per_reader() => {
            warn!(
                reader_id = %reader.id,
                collection_type = %report.collection_type,
                code = %err.code(),
                error = %err,
                "compaction failed for reader; continuing"
            );
            report.failures.push(ReaderFailure {
                reader_id: reader.id,
                code: err.code().code().to_string(),
                message: err.to_string(),
            });
        }
        Err(err) => return Err(err),
    }
    Ok(())
}

fn partition_readers(readers: Vec<Reader>, workers: usize) -> Vec<Vec<Reader>> {
    let mut partitions: Vec<Vec<Reader>> = vec![Vec::new(); workers];
    let buckets = i64::try_from(workers).unwrap_or(i64::MAX);
    for reader in readers {
        let slot = usize::try_from(reader.id.get().rem_euclid(buckets)).unwrap_or_default();
        partitions[slot].push(reader);
    }
    partitions
}
