//! Collection registry: where each collection's items live, how they are
//! ordered, and which of them a given reader may see.
//!
//! A collection is any host table with an id column and an integer read-key
//! column (microseconds, e.g. `updated_at_us`). The registry never owns those
//! rows; it only describes how to join them against `read_markers`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{Result, UnreadError};
use crate::model::{ReadableItem, Reader};

/// SQL alias the item table is bound to in every generated query. Scope
/// predicates refer to item columns through it, e.g. `i.author_id != ?`.
pub const ITEM_ALIAS: &str = "i";

/// Subset of a collection visible to one reader.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ReadScope {
    /// Every row of the item table.
    #[default]
    All,
    /// Rows matching a SQL predicate over [`ITEM_ALIAS`], with positional
    /// `?` parameters bound in order.
    Filter { predicate: String, params: Vec<Value> },
}

impl ReadScope {
    #[must_use]
    pub fn filter(predicate: impl Into<String>, params: Vec<Value>) -> Self {
        Self::Filter {
            predicate: predicate.into(),
            params,
        }
    }
}

/// Location of a collection's items in the host schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemSource {
    collection_type: String,
    table: String,
    id_column: String,
    read_key_column: String,
}

impl ItemSource {
    /// Describe a collection backed by `table`.
    ///
    /// # Errors
    ///
    /// Returns [`UnreadError::InvalidArgument`] if the collection type is blank
    /// or any identifier is not a plain SQL identifier.
    pub fn new(
        collection_type: &str,
        table: &str,
        id_column: &str,
        read_key_column: &str,
    ) -> Result<Self> {
        if collection_type.trim().is_empty() {
            return Err(UnreadError::InvalidArgument(
                "collection type must not be blank".to_string(),
            ));
        }
        for ident in [table, id_column, read_key_column] {
            validate_identifier(ident)?;
        }
        Ok(Self {
            collection_type: collection_type.to_string(),
            table: table.to_string(),
            id_column: id_column.to_string(),
            read_key_column: read_key_column.to_string(),
        })
    }

    #[must_use]
    pub fn collection_type(&self) -> &str {
        &self.collection_type
    }

    /// Quoted table name.
    #[must_use]
    pub fn table_sql(&self) -> String {
        quote(&self.table)
    }

    /// Item id expression as text, qualified by [`ITEM_ALIAS`].
    #[must_use]
    pub fn id_sql(&self) -> String {
        format!("CAST({ITEM_ALIAS}.{} AS TEXT)", quote(&self.id_column))
    }

    /// Read-key expression, qualified by [`ITEM_ALIAS`].
    #[must_use]
    pub fn read_key_sql(&self) -> String {
        format!("{ITEM_ALIAS}.{}", quote(&self.read_key_column))
    }

    /// Load one item by id, or `None` if the host table has no such row.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn load(&self, conn: &Connection, item_id: &str) -> Result<Option<ReadableItem>> {
        let sql = format!(
            "SELECT {id}, {key} FROM {table} AS {ITEM_ALIAS} WHERE {id} = ?1",
            id = self.id_sql(),
            key = self.read_key_sql(),
            table = self.table_sql(),
        );
        let item = conn
            .query_row(&sql, params![item_id], |row| {
                Ok(ReadableItem {
                    collection_type: self.collection_type.clone(),
                    item_id: row.get(0)?,
                    read_key: row.get(1)?,
                })
            })
            .optional()?;
        Ok(item)
    }
}

/// Capability set a collection type provides to the engine.
pub trait Readable: Send + Sync {
    /// Where the items live.
    fn source(&self) -> &ItemSource;

    /// Items `reader` is allowed to see. Defaults to the whole collection.
    fn read_scope(&self, _reader: &Reader) -> ReadScope {
        ReadScope::All
    }
}

impl Readable for ItemSource {
    fn source(&self) -> &ItemSource {
        self
    }
}

type ScopeFn = dyn Fn(&Reader) -> ReadScope + Send + Sync;

/// A collection with a per-reader visibility rule.
pub struct ScopedCollection {
    source: ItemSource,
    scope: Box<ScopeFn>,
}

impl ScopedCollection {
    pub fn new(
        source: ItemSource,
        scope: impl Fn(&Reader) -> ReadScope + Send + Sync + 'static,
    ) -> Self {
        Self {
            source,
            scope: Box::new(scope),
        }
    }
}

impl fmt::Debug for ScopedCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedCollection")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl Readable for ScopedCollection {
    fn source(&self) -> &ItemSource {
        &self.source
    }

    fn read_scope(&self, reader: &Reader) -> ReadScope {
        (self.scope)(reader)
    }
}

/// The visible part of one collection for one reader.
#[derive(Debug, Clone, PartialEq)]
pub struct VisibleItems {
    pub source: ItemSource,
    pub scope: ReadScope,
}

/// Registered collections keyed by collection type.
#[derive(Clone, Default)]
pub struct CollectionRegistry {
    collections: BTreeMap<String, Arc<dyn Readable>>,
}

impl fmt::Debug for CollectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionRegistry")
            .field("collections", &self.collections.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CollectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a collection.
    ///
    /// # Errors
    ///
    /// Returns [`UnreadError::InvalidArgument`] if the collection type is
    /// already registered.
    pub fn register(&mut self, readable: impl Readable + 'static) -> Result<()> {
        let collection_type = readable.source().collection_type().to_string();
        if self.collections.contains_key(&collection_type) {
            return Err(UnreadError::InvalidArgument(format!(
                "collection type '{collection_type}' registered twice"
            )));
        }
        self.collections.insert(collection_type, Arc::new(readable));
        Ok(())
    }

    /// Look up a registered collection.
    ///
    /// # Errors
    ///
    /// Returns [`UnreadError::InvalidArgument`] for unknown collection types.
    pub fn get(&self, collection_type: &str) -> Result<&dyn Readable> {
        self.collections
            .get(collection_type)
            .map(AsRef::as_ref)
            .ok_or_else(|| UnreadError::unknown_collection(collection_type))
    }

    /// Ordering key of `item` within `collection_type`.
    ///
    /// # Errors
    ///
    /// Returns [`UnreadError::InvalidArgument`] if the collection is unknown or
    /// the item belongs elsewhere.
    pub fn ordering_key(&self, collection_type: &str, item: &ReadableItem) -> Result<i64> {
        self.get(collection_type)?;
        item.ensure_in(collection_type)?;
        Ok(item.read_key)
    }

    /// The part of `collection_type` that `reader` may see.
    ///
    /// # Errors
    ///
    /// Returns [`UnreadError::InvalidArgument`] for unknown collection types.
    pub fn visible_items(&self, collection_type: &str, reader: &Reader) -> Result<VisibleItems> {
        let readable = self.get(collection_type)?;
        Ok(VisibleItems {
            source: readable.source().clone(),
            scope: readable.read_scope(reader),
        })
    }

    /// Registered collection types in sorted order.
    pub fn collection_types(&self) -> impl Iterator<Item = &str> {
        self.collections.keys().map(String::as_str)
    }
}

pub(crate) fn validate_identifier(ident: &str) -> Result<()> {
    let mut chars = ident.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Ok(());
    }
    Err(UnreadError::InvalidArgument(format!(
        "'{ident}' is not a valid SQL identifier"
    )))
}

pub(crate) fn quote(ident: &str) -> String {
    format!("\"{ident}\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn articles() -> ItemSource {
        ItemSource::new("Article", "articles", "id", "updated_at_us").expect("valid source")
    }

    #[test]
    fn identifiers_are_validated() {
        assert!(ItemSource::new("Article", "articles; DROP TABLE x", "id", "k").is_err());
        assert!(ItemSource::new("Article", "articles", "1id", "k").is_err());
        assert!(ItemSource::new("  ", "articles", "id", "k").is_err());
        assert!(ItemSource::new("Article", "_articles2", "id", "updated_at_us").is_ok());
    }

    #[test]
    fn generated_sql_is_qualified_and_quoted() {
        let source = articles();
        assert_eq!(source.table_sql(), "\"articles\"");
        assert_eq!(source.id_sql(), "CAST(i.\"id\" AS TEXT)");
        assert_eq!(source.read_key_sql(), "i.\"updated_at_us\"");
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = CollectionRegistry::new();
        registry.register(articles()).expect("first");
        let err = registry.register(articles()).expect_err("second");
        assert!(matches!(err, UnreadError::InvalidArgument(_)));
    }

    #[test]
    fn unknown_collection_is_invalid_argument() {
        let registry = CollectionRegistry::new();
        let err = registry
            .visible_items("Article", &Reader::new(1))
            .expect_err("unknown");
        assert!(matches!(err, UnreadError::InvalidArgument(_)));
    }

    #[test]
    fn ordering_key_checks_membership() {
        let mut registry = CollectionRegistry::new();
        registry.register(articles()).expect("register");

        let item = ReadableItem::new("Article", "1", 42);
        assert_eq!(registry.ordering_key("Article", &item).expect("key"), 42);

        let foreign = ReadableItem::new("Comment", "1", 42);
        assert!(registry.ordering_key("Article", &foreign).is_err());
    }

    #[test]
    fn default_scope_is_all_and_custom_scope_sees_reader() {
        let mut registry = CollectionRegistry::new();
        registry.register(articles()).expect("register");
        registry
            .register(ScopedCollection::new(
                ItemSource::new("Message", "messages", "id", "sent_at_us").expect("source"),
                |reader| {
                    ReadScope::filter(
                        "i.recipient_id = ?",
                        vec![Value::Integer(reader.id.get())],
                    )
                },
            ))
            .expect("register scoped");

        let reader = Reader::new(7);
        assert_eq!(
            registry.visible_items("Article", &reader).expect("visible").scope,
            ReadScope::All
        );
        assert_eq!(
            registry.visible_items("Message", &reader).expect("visible").scope,
            ReadScope::filter("i.recipient_id = ?", vec![Value::Integer(7)])
        );
        assert_eq!(
            registry.collection_types().collect::<Vec<_>>(),
            vec!["Article", "Message"]
        );
    }

    #[test]
    fn load_reads_host_row() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch(
            "CREATE TABLE articles (id INTEGER PRIMARY KEY, updated_at_us INTEGER NOT NULL);
             INSERT INTO articles VALUES (5, 1000);",
        )
        .expect("seed");

        let source = articles();
        let item = source.load(&conn, "5").expect("load").expect("present");
        assert_eq!(item, ReadableItem::new("Article", "5", 1_000));
        assert!(source.load(&conn, "6").expect("load").is_none());
    }
}
