//! Read-state engine: marking, unread checks, and collection-wide resets.
//!
//! A reader's state in one collection is a global baseline plus a handful of
//! item markers. An item is read when a marker certifies its current read key
//! or when its read key is at or below the baseline. Everything else is
//! unread.

use std::sync::Arc;

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::UnreadConfig;
use crate::db::markers::{self, MarkerFilter, MarkerScope, MarkerStats};
use crate::db::with_transaction;
use crate::error::{Result, UnreadError};
use crate::model::{NewMarker, ReadMarker, ReadableItem, Reader, ReaderId};
use crate::query::{ReadMarkJoin, UnreadQuery};
use crate::readers::ReaderProvider;
use crate::registry::{CollectionRegistry, Readable};

/// What [`ReadState::mark_as_read`] should mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkTarget<'a> {
    /// Everything in the collection up to now.
    All,
    /// Exactly these items.
    Items(&'a [ReadableItem]),
}

/// Assembles a [`ReadState`].
#[derive(Debug)]
pub struct ReadStateBuilder {
    registry: CollectionRegistry,
    readers: Option<Arc<dyn ReaderProvider>>,
    clock: Arc<dyn Clock>,
    config: UnreadConfig,
}

impl Default for ReadStateBuilder {
    fn default() -> Self {
        Self {
            registry: CollectionRegistry::new(),
            readers: None,
            clock: Arc::new(SystemClock),
            config: UnreadConfig::default(),
        }
    }
}

impl ReadStateBuilder {
    /// Register a readable collection.
    ///
    /// # Errors
    ///
    /// Returns [`UnreadError::InvalidArgument`] on duplicate registration.
    pub fn collection(mut self, readable: impl Readable + 'static) -> Result<Self> {
        self.registry.register(readable)?;
        Ok(self)
    }

    #[must_use]
    pub fn readers(mut self, provider: impl ReaderProvider + 'static) -> Self {
        self.readers = Some(Arc::new(provider));
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn config(mut self, config: UnreadConfig) -> Self {
        self.config = config;
        self
    }

    /// Finish building.
    ///
    /// # Errors
    ///
    /// Returns [`UnreadError::NoReaderRegistered`] when no reader provider was
    /// supplied, or [`UnreadError::Config`] for an invalid config.
    pub fn build(self) -> Result<ReadState> {
        let readers = self.readers.ok_or(UnreadError::NoReaderRegistered)?;
        self.config.validate()?;
        debug!(
            collections = ?self.registry.collection_types().collect::<Vec<_>>(),
            "read state initialized"
        );
        Ok(ReadState {
            registry: self.registry,
            readers,
            clock: self.clock,
            config: self.config,
        })
    }
}

/// Read/unread tracking over a set of registered collections.
///
/// Holds no connection; every call takes the connection to run on, so one
/// engine can serve many threads each with its own connection.
#[derive(Debug)]
pub struct ReadState {
    pub(crate) registry: CollectionRegistry,
    pub(crate) readers: Arc<dyn ReaderProvider>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: UnreadConfig,
}

impl ReadState {
    #[must_use]
    pub fn builder() -> ReadStateBuilder {
        ReadStateBuilder::default()
    }

    #[must_use]
    pub const fn registry(&self) -> &CollectionRegistry {
        &self.registry
    }

    #[must_use]
    pub const fn config(&self) -> &UnreadConfig {
        &self.config
    }

    #[must_use]
    pub fn reader_provider(&self) -> &dyn ReaderProvider {
        self.readers.as_ref()
    }

    #[must_use]
    pub fn now_us(&self) -> i64 {
        self.clock.now_us()
    }

    /// Check that `reader` has a usable id and is known to the provider.
    ///
    /// # Errors
    ///
    /// Returns [`UnreadError::UnknownReader`] otherwise.
    pub fn assert_reader(&self, conn: &Connection, reader: &Reader) -> Result<()> {
        if !reader.id.is_valid() {
            return Err(UnreadError::UnknownReader(format!(
                "reader id {} is not a valid identifier",
                reader.id
            )));
        }
        if self.readers.resolve(conn, reader.id)?.is_none() {
            return Err(UnreadError::UnknownReader(format!(
                "reader {} is not known to the reader provider",
                reader.id
            )));
        }
        Ok(())
    }

    /// Mark either the whole collection or a list of items as read.
    ///
    /// Returns the number of markers written.
    ///
    /// # Errors
    ///
    /// `UnknownReader` for an unknown reader, `InvalidArgument` for an
    /// unregistered collection or a foreign item, `Store` if the
    /// transaction fails (nothing is committed in that case).
    pub fn mark_as_read(
        &self,
        conn: &Connection,
        reader: &Reader,
        target: MarkTarget<'_>,
        collection_type: &str,
    ) -> Result<usize> {
        match target {
            MarkTarget::All => {
                self.mark_all_read(conn, reader, collection_type)?;
                Ok(1)
            }
            MarkTarget::Items(items) => self.mark_read(conn, reader, items, collection_type),
        }
    }

    /// Mark specific items as read, all-or-nothing.
    ///
    /// Items that are already read are skipped; the rest get an item marker
    /// at their read key. Returns how many markers were written.
    ///
    /// # Errors
    ///
    /// See [`Self::mark_as_read`].
    pub fn mark_read(
        &self,
        conn: &Connection,
        reader: &Reader,
        items: &[ReadableItem],
        collection_type: &str,
    ) -> Result<usize> {
        self.assert_reader(conn, reader)?;
        self.registry.get(collection_type)?;
        for item in items {
            item.ensure_in(collection_type)?;
        }

        let written = with_transaction(conn, |tx| {
            let mut written = 0;
            for item in items {
                if self.is_unread_direct(tx, reader.id, item)? {
                    markers::upsert(tx, &NewMarker::for_item(reader.id, item))?;
                    written += 1;
                }
            }
            Ok(written)
        })?;

        debug!(
            reader_id = %reader.id,
            collection_type,
            requested = items.len(),
            written,
            "marked items read"
        );
        Ok(written)
    }

    /// Replace every marker the reader holds in the collection with one
    /// global marker at now.
    ///
    /// # Errors
    ///
    /// See [`Self::mark_as_read`].
    pub fn mark_all_read(
        &self,
        conn: &Connection,
        reader: &Reader,
        collection_type: &str,
    ) -> Result<()> {
        self.assert_reader(conn, reader)?;
        self.registry.get(collection_type)?;

        let now = self.clock.now_us();
        let removed = with_transaction(conn, |tx| {
            Self::reset_reader_in(tx, reader.id, collection_type, now)
        })?;

        debug!(
            reader_id = %reader.id,
            collection_type,
            removed_item_markers = removed,
            read_at_us = now,
            "marked all read"
        );
        Ok(())
    }

    /// Whether `item` is unread for `reader`, using point lookups.
    ///
    /// # Errors
    ///
    /// `UnknownReader`, `InvalidArgument` for an unregistered collection,
    /// or `Store`.
    pub fn is_unread(
        &self,
        conn: &Connection,
        reader: &Reader,
        item: &ReadableItem,
    ) -> Result<bool> {
        self.assert_reader(conn, reader)?;
        self.registry.ordering_key(&item.collection_type, item)?;
        self.is_unread_direct(conn, reader.id, item)
    }

    /// Restartable query over the reader's unread, visible items.
    ///
    /// # Errors
    ///
    /// `UnknownReader` or `InvalidArgument` for an unregistered collection.
    pub fn list_unread(
        &self,
        conn: &Connection,
        reader: &Reader,
        collection_type: &str,
    ) -> Result<UnreadQuery> {
        self.assert_reader(conn, reader)?;
        let visible = self.registry.visible_items(collection_type, reader)?;
        Ok(UnreadQuery::new(reader.id, visible))
    }

    /// Every visible item joined with the reader's markers; unread checks on
    /// the result need no further queries.
    ///
    /// # Errors
    ///
    /// `UnknownReader`, `InvalidArgument`, or `Store`.
    pub fn with_read_marks(
        &self,
        conn: &Connection,
        reader: &Reader,
        collection_type: &str,
    ) -> Result<ReadMarkJoin> {
        self.assert_reader(conn, reader)?;
        let visible = self.registry.visible_items(collection_type, reader)?;
        ReadMarkJoin::load(conn, reader.id, &visible)
    }

    /// The reader's global baseline in a collection, if any.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for an unregistered collection, or `Store`.
    pub fn global_marker(
        &self,
        conn: &Connection,
        reader: &Reader,
        collection_type: &str,
    ) -> Result<Option<ReadMarker>> {
        self.registry.get(collection_type)?;
        markers::find(conn, reader.id, collection_type, None)
    }

    /// Global and item marker counts for a collection.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for an unregistered collection, or `Store`.
    pub fn marker_stats(&self, conn: &Connection, collection_type: &str) -> Result<MarkerStats> {
        self.registry.get(collection_type)?;
        markers::marker_stats(conn, collection_type)
    }

    /// Invalidate the read state of a whole collection: drop every marker and
    /// give each known reader a fresh global marker at now.
    ///
    /// Table-backed reader providers get their markers from one
    /// `INSERT ... SELECT`; others from chunked multi-row inserts. Readers
    /// without a valid id are skipped either way.
    ///
    /// Returns the number of global markers inserted.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for an unregistered collection, or `Store`
    /// (nothing is committed in that case).
    pub fn reset_all(&self, conn: &Connection, collection_type: &str) -> Result<usize> {
        self.registry.get(collection_type)?;
        let now = self.clock.now_us();

        let (removed, inserted) = with_transaction(conn, |tx| {
            let removed = markers::delete_where(tx, &MarkerFilter::collection(collection_type))?;
            if let Some(id_sql) = self.readers.id_query() {
                let inserted = markers::insert_globals_from(tx, collection_type, now, &id_sql)?;
                return Ok((removed, inserted));
            }

            let readers = self.readers.all_readers(tx)?;
            let fresh: Vec<NewMarker> = readers
                .iter()
                .filter(|reader| {
                    let valid = reader.id.is_valid();
                    if !valid {
                        warn!(reader_id = %reader.id, "skipping reader without a valid id");
                    }
                    valid
                })
                .map(|reader| NewMarker::global(reader.id, collection_type, now))
                .collect();
            let inserted = markers::bulk_insert(tx, &fresh)?;
            Ok((removed, inserted))
        })?;

        info!(
            collection_type,
            removed,
            inserted,
            read_at_us = now,
            "reset read state for collection"
        );
        Ok(inserted)
    }

    pub(crate) fn is_unread_direct(
        &self,
        conn: &Connection,
        reader_id: ReaderId,
        item: &ReadableItem,
    ) -> Result<bool> {
        let collection_type = item.collection_type.as_str();
        let marker = markers::find(conn, reader_id, collection_type, Some(&item.item_id))?;
        if marker.is_some_and(|marker| marker.read_at_us >= item.read_key) {
            return Ok(false);
        }

        Ok(markers::find(conn, reader_id, collection_type, None)?
            .is_none_or(|global| item.read_key > global.read_at_us))
    }

    /// Drop all of a reader's item markers in a collection and move the
    /// global marker to `now_us` (in place if one exists). Returns how many
    /// item markers were dropped.
    pub(crate) fn reset_reader_in(
        conn: &Connection,
        reader_id: ReaderId,
        collection_type: &str,
        now_us: i64,
    ) -> Result<usize> {
        let items = markers::delete_where(
            conn,
            &MarkerFilter::collection(collection_type)
                .reader(reader_id)
                .scope(MarkerScope::Items),
        )?;
        markers::upsert(conn, &NewMarker::global(reader_id, collection_type, now_us))?;
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::StoreConfig;
    use crate::db::open_in_memory;
    use crate::readers::StaticReaders;
    use crate::registry::ItemSource;

    const ARTICLE: &str = "Article";

    fn setup() -> (Connection, ReadState, Arc<ManualClock>) {
        let conn = open_in_memory(&StoreConfig::default()).expect("open");
        conn.execute_batch(
            "CREATE TABLE articles (id INTEGER PRIMARY KEY, updated_at_us INTEGER NOT NULL);
             INSERT INTO articles VALUES (1, 10), (2, 20), (3, 30);",
        )
        .expect("seed");

        let clock = Arc::new(ManualClock::new(1_000));
        let state = ReadState::builder()
            .collection(
                ItemSource::new(ARTICLE, "articles", "id", "updated_at_us").expect("source"),
            )
            .expect("register")
            .readers(StaticReaders::new([1, 2]))
            .clock(clock.clone())
            .build()
            .expect("build");
        (conn, state, clock)
    }

    fn article(id: &str, key: i64) -> ReadableItem {
        ReadableItem::new(ARTICLE, id, key)
    }

    #[test]
    fn build_without_readers_fails() {
        let err = ReadState::builder().build().expect_err("no readers");
        assert!(matches!(err, UnreadError::NoReaderRegistered));
    }

    #[test]
    fn never_marked_items_are_unread() {
        let (conn, state, _) = setup();
        let reader = Reader::new(1);
        for (id, key) in [("1", 10), ("2", 20), ("3", 30)] {
            assert!(state.is_unread(&conn, &reader, &article(id, key)).expect("check"));
        }
    }

    #[test]
    fn mark_read_writes_only_unread_items() {
        let (conn, state, _) = setup();
        let reader = Reader::new(1);
        let items = [article("1", 10), article("2", 20)];

        assert_eq!(state.mark_read(&conn, &reader, &items, ARTICLE).expect("mark"), 2);
        assert_eq!(state.mark_read(&conn, &reader, &items, ARTICLE).expect("again"), 0);
        assert!(!state.is_unread(&conn, &reader, &items[0]).expect("check"));
        assert!(state.is_unread(&conn, &reader, &article("3", 30)).expect("check"));
    }

    #[test]
    fn updated_item_becomes_unread_again() {
        let (conn, state, _) = setup();
        let reader = Reader::new(1);
        state
            .mark_read(&conn, &reader, &[article("1", 10)], ARTICLE)
            .expect("mark");

        let updated = article("1", 15);
        assert!(state.is_unread(&conn, &reader, &updated).expect("check"));
        let rewritten = state
            .mark_read(&conn, &reader, &[updated.clone()], ARTICLE)
            .expect("remark");
        assert_eq!(rewritten, 1);
        assert!(!state.is_unread(&conn, &reader, &updated).expect("check"));

        let markers = markers::list_for_reader(&conn, ReaderId(1), ARTICLE).expect("list");
        assert_eq!(markers.len(), 1, "re-marking updates in place");
        assert_eq!(markers[0].read_at_us, 15);
    }

    #[test]
    fn foreign_item_rejects_whole_batch() {
        let (conn, state, _) = setup();
        let reader = Reader::new(1);
        let items = [article("1", 10), ReadableItem::new("Comment", "9", 5)];

        let err = state.mark_read(&conn, &reader, &items, ARTICLE).expect_err("foreign");
        assert!(matches!(err, UnreadError::InvalidArgument(_)));
        assert!(state.is_unread(&conn, &reader, &items[0]).expect("check"));
    }

    #[test]
    fn unknown_reader_is_rejected() {
        let (conn, state, _) = setup();
        for reader in [Reader::new(0), Reader::new(99)] {
            let err = state
                .mark_read(&conn, &reader, &[article("1", 10)], ARTICLE)
                .expect_err("unknown");
            assert!(matches!(err, UnreadError::UnknownReader(_)));
        }
    }

    #[test]
    fn unregistered_collection_is_rejected() {
        let (conn, state, _) = setup();
        let err = state
            .mark_all_read(&conn, &Reader::new(1), "Comment")
            .expect_err("unregistered");
        assert!(matches!(err, UnreadError::InvalidArgument(_)));
    }

    #[test]
    fn mark_all_read_replaces_markers_with_baseline() {
        let (conn, state, clock) = setup();
        let reader = Reader::new(1);
        state
            .mark_read(&conn, &reader, &[article("1", 10)], ARTICLE)
            .expect("mark");

        state
            .mark_as_read(&conn, &reader, MarkTarget::All, ARTICLE)
            .expect("mark all");

        let markers = markers::list_for_reader(&conn, ReaderId(1), ARTICLE).expect("list");
        assert_eq!(markers.len(), 1);
        assert!(markers[0].is_global());
        assert_eq!(markers[0].read_at_us, 1_000);

        assert!(!state.is_unread(&conn, &reader, &article("3", 30)).expect("old item"));
        let future = article("4", clock.advance(5));
        assert!(state.is_unread(&conn, &reader, &future).expect("future item"));
    }

    #[test]
    fn list_unread_and_join_agree_with_is_unread() {
        let (conn, state, _) = setup();
        let reader = Reader::new(1);
        state
            .mark_read(&conn, &reader, &[article("2", 20)], ARTICLE)
            .expect("mark");

        let unread = state
            .list_unread(&conn, &reader, ARTICLE)
            .expect("query")
            .items(&conn)
            .expect("items");
        let mut ids: Vec<_> = unread.iter().map(|i| i.item_id.clone()).collect();
        ids.sort();
        assert_eq!(ids, vec!["1", "3"]);

        let join = state.with_read_marks(&conn, &reader, ARTICLE).expect("join");
        for marked in &join.items {
            assert_eq!(
                join.is_unread(marked),
                state.is_unread(&conn, &reader, &marked.item).expect("direct")
            );
        }
    }

    #[test]
    fn reset_all_gives_each_reader_one_fresh_baseline() {
        let (conn, state, _) = setup();
        state
            .mark_read(&conn, &Reader::new(1), &[article("1", 10)], ARTICLE)
            .expect("mark");
        state
            .mark_all_read(&conn, &Reader::new(2), ARTICLE)
            .expect("mark all");

        assert_eq!(state.reset_all(&conn, ARTICLE).expect("reset"), 2);

        let stats = markers::marker_stats(&conn, ARTICLE).expect("stats");
        assert_eq!(stats.global_markers, 2);
        assert_eq!(stats.item_markers, 0);
        for id in [1, 2] {
            let global = state
                .global_marker(&conn, &Reader::new(id), ARTICLE)
                .expect("query")
                .expect("present");
            assert_eq!(global.read_at_us, 1_000);
        }
    }
}
