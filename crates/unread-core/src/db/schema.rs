//! SQLite schema for read markers.
//!
//! - `read_markers` holds both global baselines (`item_id IS NULL`) and
//!   per-item markers; two partial unique indexes keep at most one of each
//!   per reader and collection
//! - `marker_meta` mirrors the schema version for diagnostics
//! - `compaction_runs` records every compaction job run

/// Migration v1: marker table, uniqueness indexes, and metadata row.
pub const MIGRATION_V1_SQL: &str = r"
CREATE TABLE IF NOT EXISTS read_markers (
    marker_id INTEGER PRIMARY KEY AUTOINCREMENT,
    reader_id INTEGER NOT NULL,
    collection_type TEXT NOT NULL CHECK (length(trim(collection_type)) > 0),
    item_id TEXT,
    read_at_us INTEGER NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_read_markers_item
    ON read_markers(reader_id, collection_type, item_id)
    WHERE item_id IS NOT NULL;

CREATE UNIQUE INDEX IF NOT EXISTS idx_read_markers_global
    ON read_markers(reader_id, collection_type)
    WHERE item_id IS NULL;

CREATE INDEX IF NOT EXISTS idx_read_markers_collection_read_at
    ON read_markers(collection_type, reader_id, read_at_us);

CREATE TABLE IF NOT EXISTS marker_meta (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    schema_version INTEGER NOT NULL
);

INSERT OR IGNORE INTO marker_meta (id, schema_version) VALUES (1, 1);
";

/// Migration v2: compaction run history.
pub const MIGRATION_V2_SQL: &str = r"
CREATE TABLE IF NOT EXISTS compaction_runs (
    run_id INTEGER PRIMARY KEY AUTOINCREMENT,
    collection_type TEXT NOT NULL,
    started_at_us INTEGER NOT NULL,
    finished_at_us INTEGER NOT NULL,
    readers_visited INTEGER NOT NULL DEFAULT 0,
    readers_compacted INTEGER NOT NULL DEFAULT 0,
    readers_reset INTEGER NOT NULL DEFAULT 0,
    readers_failed INTEGER NOT NULL DEFAULT 0,
    markers_deleted INTEGER NOT NULL DEFAULT 0,
    failures_json TEXT NOT NULL DEFAULT '[]'
);

CREATE INDEX IF NOT EXISTS idx_compaction_runs_collection_started
    ON compaction_runs(collection_type, started_at_us DESC);

UPDATE marker_meta
SET schema_version = 2
WHERE id = 1;
";

/// Indexes expected by lookup, compaction, and run-history paths.
pub const REQUIRED_INDEXES: &[&str] = &[
    "idx_read_markers_item",
    "idx_read_markers_global",
    "idx_read_markers_collection_read_at",
    "idx_compaction_runs_collection_started",
];
