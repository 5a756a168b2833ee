//! Abstract storage traits for docql.
//!
//! These traits define the contract the query engine needs from a storage
//! backend: consistent collection snapshots, change notification, and a
//! persistent index catalog.

use std::sync::Arc;

use thiserror::Error;

use crate::document::{ChangeEvent, Document};
use crate::index::IndexSpec;

/// Errors that can occur during storage operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// Collection not found.
    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    /// Document body was not a JSON object.
    #[error("Invalid document '{0}': body must be a JSON object")]
    InvalidDocument(String),

    /// Key already exists.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),
}

/// Identifier of a registered change observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(pub u64);

/// Which writes an observer is interested in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObserverScope {
    /// Every write in the database.
    Database,
    /// Writes to a single collection.
    Collection(String),
}

impl ObserverScope {
    /// Returns true if a write to `collection` falls in this scope.
    #[must_use]
    pub fn covers(&self, collection: &str) -> bool {
        match self {
            Self::Database => true,
            Self::Collection(name) => name == collection,
        }
    }
}

/// Receives change notifications.
///
/// Called synchronously on the writer's thread after the write is visible.
/// Implementations must not block.
pub trait ChangeObserver: Send + Sync {
    /// Invoked once per committed write.
    fn on_change(&self, event: &ChangeEvent);
}

impl<F> ChangeObserver for F
where
    F: Fn(&ChangeEvent) + Send + Sync,
{
    fn on_change(&self, event: &ChangeEvent) {
        self(event);
    }
}

/// Storage trait for documents.
///
/// # Safety Considerations
/// - `snapshot` must return a view unaffected by writes that commit after it returns
/// - Implementations should handle concurrent access safely
pub trait DocumentStore: Send + Sync {
    /// Returns every document in `collection`, ordered by document id.
    fn snapshot(&self, collection: &str) -> Result<Vec<Arc<Document>>, StorageError>;

    /// Registers an observer for writes within `scope`.
    fn add_observer(
        &self,
        scope: ObserverScope,
        observer: Arc<dyn ChangeObserver>,
    ) -> Result<ObserverId, StorageError>;

    /// Unregisters an observer. Returns false if it was not registered.
    fn remove_observer(&self, id: ObserverId) -> Result<bool, StorageError>;
}

/// Storage trait for the persistent index catalog.
pub trait IndexCatalog: Send + Sync {
    /// Get the spec stored under `name`.
    fn get_index(&self, name: &str) -> Result<Option<IndexSpec>, StorageError>;

    /// Store `spec` under `name`, atomically replacing any previous entry.
    fn put_index(&self, name: &str, spec: IndexSpec) -> Result<(), StorageError>;

    /// Remove the entry for `name`. Returns false if there was none.
    fn remove_index(&self, name: &str) -> Result<bool, StorageError>;

    /// All catalog entries, ordered by name.
    fn list_indexes(&self) -> Result<Vec<(String, IndexSpec)>, StorageError>;

    /// Names of all indexes, ordered.
    fn index_names(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.list_indexes()?.into_iter().map(|(name, _)| name).collect())
    }
}
