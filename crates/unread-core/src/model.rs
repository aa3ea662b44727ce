//! Core value types: readers, readable items, and read markers.
//!
//! All timestamps and read keys are signed microseconds since the Unix
//! epoch, matching the `_us` columns in the marker schema.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, UnreadError};

/// Stable identifier of a reader, supplied by the host's identity system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReaderId(pub i64);

impl ReaderId {
    /// Raw integer value as stored in `read_markers.reader_id`.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }

    /// Readers must carry a positive id to own markers.
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for ReaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A reader whose progress is tracked.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reader {
    pub id: ReaderId,
}

impl Reader {
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self { id: ReaderId(id) }
    }
}

/// One item of a readable collection, as seen through the collection registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReadableItem {
    /// Collection partition this item belongs to.
    pub collection_type: String,
    /// Text form of the host's primary key.
    pub item_id: String,
    /// Ordering key compared against marker timestamps.
    pub read_key: i64,
}

impl ReadableItem {
    #[must_use]
    pub fn new(
        collection_type: impl Into<String>,
        item_id: impl Into<String>,
        read_key: i64,
    ) -> Self {
        Self {
            collection_type: collection_type.into(),
            item_id: item_id.into(),
            read_key,
        }
    }

    /// Reject items that belong to a different collection than the one named.
    ///
    /// # Errors
    ///
    /// Returns [`UnreadError::InvalidArgument`] on mismatch.
    pub fn ensure_in(&self, collection_type: &str) -> Result<()> {
        if self.collection_type == collection_type {
            return Ok(());
        }
        Err(UnreadError::InvalidArgument(format!(
            "item {} belongs to '{}', not '{collection_type}'",
            self.item_id, self.collection_type
        )))
    }
}

/// A persisted read marker.
///
/// `item_id == None` denotes the global baseline for the collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadMarker {
    pub marker_id: i64,
    pub reader_id: ReaderId,
    pub collection_type: String,
    pub item_id: Option<String>,
    pub read_at_us: i64,
}

impl ReadMarker {
    #[must_use]
    pub const fn is_global(&self) -> bool {
        self.item_id.is_none()
    }
}

/// A marker that has not been written yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMarker {
    pub reader_id: ReaderId,
    pub collection_type: String,
    pub item_id: Option<String>,
    pub read_at_us: i64,
}

impl NewMarker {
    /// Global baseline marker.
    #[must_use]
    pub fn global(reader_id: ReaderId, collection_type: &str, read_at_us: i64) -> Self {
        Self {
            reader_id,
            collection_type: collection_type.to_string(),
            item_id: None,
            read_at_us,
        }
    }

    /// Marker certifying a single item as read at its current read key.
    #[must_use]
    pub fn for_item(reader_id: ReaderId, item: &ReadableItem) -> Self {
        Self {
            reader_id,
            collection_type: item.collection_type.clone(),
            item_id: Some(item.item_id.clone()),
            read_at_us: item.read_key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_id_validity() {
        assert!(ReaderId(1).is_valid());
        assert!(!ReaderId(0).is_valid());
        assert!(!ReaderId(-7).is_valid());
    }

    #[test]
    fn ensure_in_rejects_foreign_collection() {
        let item = ReadableItem::new("Article", "7", 10);
        assert!(item.ensure_in("Article").is_ok());
        let err = item.ensure_in("Comment").expect_err("must reject");
        assert!(matches!(err, UnreadError::InvalidArgument(_)));
    }

    #[test]
    fn item_marker_uses_read_key() {
        let item = ReadableItem::new("Article", "7", 1_234);
        let marker = NewMarker::for_item(ReaderId(3), &item);
        assert_eq!(marker.item_id.as_deref(), Some("7"));
        assert_eq!(marker.read_at_us, 1_234);
        assert_eq!(marker.collection_type, "Article");
    }
}
