//! unread-core library.
//!
//! Per-reader read/unread tracking over SQLite with bounded storage. Each
//! reader holds, per collection, one global baseline marker plus item markers
//! for items read individually. The compaction job folds item markers into
//! the baseline without changing any unread answer.
//!
//! # Conventions
//!
//! - **Errors**: Library calls return [`error::Result`]; config loading uses
//!   `anyhow` context internally.
//! - **Logging**: Use `tracing` macros (`info!`, `warn!`, `debug!`). No
//!   subscriber is installed here.

pub mod clock;
pub mod compaction;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod model;
pub mod query;
pub mod readers;
pub mod registry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use compaction::{CompactionReport, ReaderCompaction, ReaderFailure};
pub use config::UnreadConfig;
pub use engine::{MarkTarget, ReadState, ReadStateBuilder};
pub use error::{ErrorCode, Result, UnreadError};
pub use model::{ReadMarker, ReadableItem, Reader, ReaderId};
pub use query::{MarkedItem, ReadMarkJoin, UnreadOrder, UnreadQuery};
pub use readers::{ReaderProvider, ReaderTable, StaticReaders};
pub use registry::{ItemSource, ReadScope, Readable, ScopedCollection};
