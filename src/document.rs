//! Stored documents and change events.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Name of the collection every database starts with.
pub const DEFAULT_COLLECTION: &str = "_default";

/// A stored JSON document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Document id, unique within its collection.
    pub id: String,
    /// Store-wide sequence assigned by the last write to this document.
    pub sequence: u64,
    /// Document body; always a JSON object.
    pub body: Value,
}

impl Document {
    /// Creates a document.
    #[must_use]
    pub fn new(id: impl Into<String>, sequence: u64, body: Value) -> Self {
        Self {
            id: id.into(),
            sequence,
            body,
        }
    }
}

/// Notification that documents in a collection changed.
///
/// Consumers must treat this as "something changed"; the id list is a hint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Collection the write touched.
    pub collection: String,
    /// Ids of the documents written or deleted.
    pub document_ids: Vec<String>,
}
