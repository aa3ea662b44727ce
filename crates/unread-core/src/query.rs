//! Set-based unread queries.
//!
//! Both query shapes join the item table against `read_markers`:
//!
//! - an item marker *matches* an item when it belongs to the same reader,
//!   collection, and item id and its `read_at_us` is at least the item's read
//!   key (a marker for an older version of the item does not count)
//! - the global marker hides every item whose read key is at or below it
//!
//! [`UnreadQuery`] is a value, not a cursor: every execution re-reads the
//! markers, so the same query can be run again after marks or compaction.

use rusqlite::types::Value;
use rusqlite::{Connection, params_from_iter};

use crate::db::markers;
use crate::error::Result;
use crate::model::{ReadableItem, ReaderId};
use crate::registry::{ITEM_ALIAS, ReadScope, VisibleItems};

/// Requested ordering of unread results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnreadOrder {
    /// Whatever order SQLite produces.
    #[default]
    Unordered,
    /// Ascending read key, then item id.
    OldestFirst,
    /// Descending read key, then item id.
    NewestFirst,
}

impl UnreadOrder {
    const fn sql_clause(self) -> &'static str {
        match self {
            Self::Unordered => "",
            Self::OldestFirst => " ORDER BY 2 ASC, 1 ASC",
            Self::NewestFirst => " ORDER BY 2 DESC, 1 ASC",
        }
    }
}

/// Restartable query over one reader's unread items in one collection.
#[derive(Debug, Clone, PartialEq)]
pub struct UnreadQuery {
    reader_id: ReaderId,
    visible: VisibleItems,
    order: UnreadOrder,
    limit: Option<u32>,
}

impl UnreadQuery {
    pub(crate) const fn new(reader_id: ReaderId, visible: VisibleItems) -> Self {
        Self {
            reader_id,
            visible,
            order: UnreadOrder::Unordered,
            limit: None,
        }
    }

    #[must_use]
    pub const fn order(mut self, order: UnreadOrder) -> Self {
        self.order = order;
        self
    }

    #[must_use]
    pub const fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn collection_type(&self) -> &str {
        self.visible.source.collection_type()
    }

    #[must_use]
    pub const fn reader_id(&self) -> ReaderId {
        self.reader_id
    }

    /// Run the query and collect the unread items.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn items(&self, conn: &Connection) -> Result<Vec<ReadableItem>> {
        let source = &self.visible.source;
        let (from_where, mut values) = self.from_where(None);
        let mut sql = format!(
            "SELECT {id}, {key} {from_where}{order}",
            id = source.id_sql(),
            key = source.read_key_sql(),
            order = self.order.sql_clause(),
        );
        if let Some(limit) = self.limit {
            sql.push_str(" LIMIT ?");
            values.push(Value::Integer(i64::from(limit)));
        }

        let collection_type = source.collection_type().to_string();
        let mut stmt = conn.prepare(&sql)?;
        let items = stmt
            .query_map(params_from_iter(values), |row| {
                Ok(ReadableItem {
                    collection_type: collection_type.clone(),
                    item_id: row.get(0)?,
                    read_key: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }

    /// Number of unread items (ignores ordering and limit).
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn count(&self, conn: &Connection) -> Result<u64> {
        let (from_where, values) = self.from_where(None);
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) {from_where}"),
            params_from_iter(values),
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Whether one specific item is in the unread set.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn contains(&self, conn: &Connection, item_id: &str) -> Result<bool> {
        let (from_where, values) = self.from_where(Some(item_id));
        let exists: bool = conn.query_row(
            &format!("SELECT EXISTS(SELECT 1 {from_where})"),
            params_from_iter(values),
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Smallest read key among unread items, or `None` when nothing is unread.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn oldest_read_key(&self, conn: &Connection) -> Result<Option<i64>> {
        let (from_where, values) = self.from_where(None);
        let oldest: Option<i64> = conn.query_row(
            &format!(
                "SELECT MIN({key}) {from_where}",
                key = self.visible.source.read_key_sql()
            ),
            params_from_iter(values),
            |row| row.get(0),
        )?;
        Ok(oldest)
    }

    fn from_where(&self, item_id: Option<&str>) -> (String, Vec<Value>) {
        let source = &self.visible.source;
        let id = source.id_sql();
        let key = source.read_key_sql();

        let mut values = item_marker_join_values(self.reader_id, source.collection_type());
        let mut sql = format!(
            "FROM {table} AS {ITEM_ALIAS} {join} \
             WHERE m.marker_id IS NULL \
             AND NOT EXISTS (\
                 SELECT 1 FROM read_markers AS g \
                 WHERE g.reader_id = ? AND g.collection_type = ? \
                 AND g.item_id IS NULL AND g.read_at_us >= {key})",
            table = source.table_sql(),
            join = item_marker_join(&id, &key),
        );
        values.push(Value::Integer(self.reader_id.get()));
        values.push(Value::Text(source.collection_type().to_string()));

        push_scope(&mut sql, &mut values, &self.visible.scope);

        if let Some(item_id) = item_id {
            sql.push_str(&format!(" AND {id} = ?"));
            values.push(Value::Text(item_id.to_string()));
        }

        (sql, values)
    }
}

/// One visible item plus the id of its matching item marker, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkedItem {
    pub item: ReadableItem,
    pub read_mark_id: Option<i64>,
}

/// Every visible item of a collection joined with one reader's markers.
///
/// Built once per listing so that per-item unread checks need no further
/// queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadMarkJoin {
    pub reader_id: ReaderId,
    pub global_read_at_us: Option<i64>,
    pub items: Vec<MarkedItem>,
}

impl ReadMarkJoin {
    /// Execute the join for `reader_id` over `visible`.
    ///
    /// # Errors
    ///
    /// Returns an error if either query fails.
    pub(crate) fn load(
        conn: &Connection,
        reader_id: ReaderId,
        visible: &VisibleItems,
    ) -> Result<Self> {
        let source = &visible.source;
        let id = source.id_sql();
        let key = source.read_key_sql();

        let mut values = item_marker_join_values(reader_id, source.collection_type());
        let mut sql = format!(
            "SELECT {id}, {key}, m.marker_id FROM {table} AS {ITEM_ALIAS} {join} WHERE 1 = 1",
            table = source.table_sql(),
            join = item_marker_join(&id, &key),
        );
        push_scope(&mut sql, &mut values, &visible.scope);
        sql.push_str(" ORDER BY 2 ASC, 1 ASC");

        let collection_type = source.collection_type().to_string();
        let mut stmt = conn.prepare(&sql)?;
        let items = stmt
            .query_map(params_from_iter(values), |row| {
                Ok(MarkedItem {
                    item: ReadableItem {
                        collection_type: collection_type.clone(),
                        item_id: row.get(0)?,
                        read_key: row.get(1)?,
                    },
                    read_mark_id: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let global_read_at_us = markers::find(conn, reader_id, source.collection_type(), None)?
            .map(|marker| marker.read_at_us);

        Ok(Self {
            reader_id,
            global_read_at_us,
            items,
        })
    }

    /// Unread check that uses only the joined data.
    #[must_use]
    pub fn is_unread(&self, marked: &MarkedItem) -> bool {
        if marked.read_mark_id.is_some() {
            return false;
        }
        self.global_read_at_us
            .is_none_or(|global| marked.item.read_key > global)
    }

    /// Look up a joined item by id.
    #[must_use]
    pub fn get(&self, item_id: &str) -> Option<&MarkedItem> {
        self.items.iter().find(|marked| marked.item.item_id == item_id)
    }

    /// Joined items that are unread, in read-key order.
    pub fn unread(&self) -> impl Iterator<Item = &MarkedItem> {
        self.items.iter().filter(|marked| self.is_unread(marked))
    }
}

fn item_marker_join(id: &str, key: &str) -> String {
    format!(
        "LEFT JOIN read_markers AS m \
         ON m.reader_id = ? AND m.collection_type = ? \
         AND m.item_id = {id} AND m.read_at_us >= {key}"
    )
}

fn item_marker_join_values(reader_id: ReaderId, collection_type: &str) -> Vec<Value> {
    vec![
        Value::Integer(reader_id.get()),
        Value::Text(collection_type.to_string()),
    ]
}

fn push_scope(sql: &mut String, values: &mut Vec<Value>, scope: &ReadScope) {
    if let ReadScope::Filter { predicate, params } = scope {
        sql.push_str(&format!(" AND ({predicate})"));
        values.extend(params.iter().cloned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::db::open_in_memory;
    use crate::model::NewMarker;
    use crate::registry::ItemSource;

    fn seeded() -> (Connection, VisibleItems) {
        let conn = open_in_memory(&StoreConfig::default()).expect("open");
        conn.execute_batch(
            "CREATE TABLE articles (
                 id INTEGER PRIMARY KEY,
                 author_id INTEGER NOT NULL,
                 updated_at_us INTEGER NOT NULL
             );
             INSERT INTO articles VALUES (1, 100, 10), (2, 100, 20), (3, 200, 30), (4, 200, 40);",
        )
        .expect("seed");
        let visible = VisibleItems {
            source: ItemSource::new("Article", "articles", "id", "updated_at_us")
                .expect("source"),
            scope: ReadScope::All,
        };
        (conn, visible)
    }

    fn ids(items: &[ReadableItem]) -> Vec<&str> {
        items.iter().map(|item| item.item_id.as_str()).collect()
    }

    #[test]
    fn everything_is_unread_without_markers() {
        let (conn, visible) = seeded();
        let query = UnreadQuery::new(ReaderId(1), visible).order(UnreadOrder::OldestFirst);
        assert_eq!(ids(&query.items(&conn).expect("items")), vec!["1", "2", "3", "4"]);
        assert_eq!(query.count(&conn).expect("count"), 4);
        assert_eq!(query.oldest_read_key(&conn).expect("oldest"), Some(10));
    }

    #[test]
    fn item_marker_must_cover_current_read_key() {
        let (conn, visible) = seeded();
        let item = ReadableItem::new("Article", "1", 10);
        markers::upsert(&conn, &NewMarker::for_item(ReaderId(1), &item))
            .expect("fresh marker");
        let item = ReadableItem::new("Article", "2", 15);
        markers::upsert(&conn, &NewMarker::for_item(ReaderId(1), &item))
            .expect("stale marker");

        let query = UnreadQuery::new(ReaderId(1), visible).order(UnreadOrder::OldestFirst);
        assert_eq!(ids(&query.items(&conn).expect("items")), vec!["2", "3", "4"]);
        assert!(!query.contains(&conn, "1").expect("contains"));
        assert!(query.contains(&conn, "2").expect("contains"));
    }

    #[test]
    fn global_marker_hides_items_at_or_below_it() {
        let (conn, visible) = seeded();
        markers::upsert(&conn, &NewMarker::global(ReaderId(1), "Article", 30)).expect("global");

        let query = UnreadQuery::new(ReaderId(1), visible.clone());
        assert_eq!(ids(&query.items(&conn).expect("items")), vec!["4"]);
        assert_eq!(query.oldest_read_key(&conn).expect("oldest"), Some(40));

        let other_reader = UnreadQuery::new(ReaderId(2), visible);
        assert_eq!(other_reader.count(&conn).expect("count"), 4);
    }

    #[test]
    fn oldest_read_key_is_none_when_all_read() {
        let (conn, visible) = seeded();
        markers::upsert(&conn, &NewMarker::global(ReaderId(1), "Article", 1_000)).expect("global");
        let query = UnreadQuery::new(ReaderId(1), visible);
        assert_eq!(query.oldest_read_key(&conn).expect("oldest"), None);
        assert_eq!(query.count(&conn).expect("count"), 0);
    }

    #[test]
    fn scope_filter_restricts_results() {
        let (conn, mut visible) = seeded();
        visible.scope = ReadScope::filter("i.author_id = ?", vec![Value::Integer(200)]);
        let query = UnreadQuery::new(ReaderId(1), visible).order(UnreadOrder::NewestFirst);
        assert_eq!(ids(&query.items(&conn).expect("items")), vec!["4", "3"]);
        assert!(!query.contains(&conn, "1").expect("contains"));
    }

    #[test]
    fn limit_applies_after_ordering() {
        let (conn, visible) = seeded();
        let query = UnreadQuery::new(ReaderId(1), visible)
            .order(UnreadOrder::NewestFirst)
            .limit(2);
        assert_eq!(ids(&query.items(&conn).expect("items")), vec!["4", "3"]);
        assert_eq!(query.count(&conn).expect("count"), 4);
    }

    #[test]
    fn query_is_restartable() {
        let (conn, visible) = seeded();
        let query = UnreadQuery::new(ReaderId(1), visible);
        assert_eq!(query.count(&conn).expect("first run"), 4);

        markers::upsert(&conn, &NewMarker::global(ReaderId(1), "Article", 20)).expect("global");
        assert_eq!(query.count(&conn).expect("second run"), 2);
    }

    #[test]
    fn join_agrees_with_unread_query() {
        let (conn, visible) = seeded();
        markers::upsert(&conn, &NewMarker::global(ReaderId(1), "Article", 15)).expect("global");
        let item = ReadableItem::new("Article", "3", 30);
        markers::upsert(&conn, &NewMarker::for_item(ReaderId(1), &item))
            .expect("item");

        let join = ReadMarkJoin::load(&conn, ReaderId(1), &visible).expect("join");
        assert_eq!(join.global_read_at_us, Some(15));
        assert_eq!(join.items.len(), 4);

        let query = UnreadQuery::new(ReaderId(1), visible);
        for marked in &join.items {
            assert_eq!(
                join.is_unread(marked),
                query.contains(&conn, &marked.item.item_id).expect("contains"),
                "item {}",
                marked.item.item_id
            );
        }
        let unread: Vec<_> = join.unread().map(|m| m.item.item_id.as_str()).collect();
        assert_eq!(unread, vec!["2", "4"]);
        assert!(join.get("3").expect("joined").read_mark_id.is_some());
    }
}
