//! In-memory storage backend.
//!
//! This module provides thread-safe in-memory implementations of the storage traits.
//! It is intended for embedded usage, tests, and as a reference implementation.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde_json::Value;

use crate::document::{ChangeEvent, Document, DEFAULT_COLLECTION};
use crate::index::IndexSpec;
use crate::storage::traits::{
    ChangeObserver, DocumentStore, IndexCatalog, ObserverId, ObserverScope, StorageError,
};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

fn normalize_collection(name: &str) -> String {
    name.trim().to_string()
}

#[derive(Debug)]
struct DocumentState {
    collections: HashMap<String, BTreeMap<String, Arc<Document>>>,
    last_sequence: u64,
}

impl Default for DocumentState {
    fn default() -> Self {
        let mut collections = HashMap::new();
        collections.insert(DEFAULT_COLLECTION.to_string(), BTreeMap::new());
        Self {
            collections,
            last_sequence: 0,
        }
    }
}

struct ObserverEntry {
    scope: ObserverScope,
    observer: Arc<dyn ChangeObserver>,
}

/// Thread-safe in-memory document store.
///
/// Writes are applied under a single write lock; observers are notified after
/// the lock is released, on the writer's thread.
#[derive(Default)]
pub struct InMemoryDocumentStore {
    state: RwLock<DocumentState>,
    observers: RwLock<BTreeMap<ObserverId, ObserverEntry>>,
    next_observer: AtomicU64,
}

impl std::fmt::Debug for InMemoryDocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryDocumentStore").finish_non_exhaustive()
    }
}

impl InMemoryDocumentStore {
    /// Create a new store containing only the default collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a collection. Returns false if it already existed.
    pub fn create_collection(&self, name: &str) -> Result<bool, StorageError> {
        let name = normalize_collection(name);
        if name.is_empty() {
            return Err(StorageError::BackendError(
                "collection name cannot be empty".to_string(),
            ));
        }
        let mut state = self.state.write().map_err(|_| lock_err("collection.create"))?;
        if state.collections.contains_key(&name) {
            return Ok(false);
        }
        state.collections.insert(name, BTreeMap::new());
        Ok(true)
    }

    /// Delete a collection and all of its documents.
    pub fn delete_collection(&self, name: &str) -> Result<(), StorageError> {
        let name = normalize_collection(name);
        let removed = {
            let mut state = self.state.write().map_err(|_| lock_err("collection.delete"))?;
            state
                .collections
                .remove(&name)
                .ok_or_else(|| StorageError::CollectionNotFound(name.clone()))?
        };
        self.notify(ChangeEvent {
            collection: name,
            document_ids: removed.into_keys().collect(),
        });
        Ok(())
    }

    /// Names of all collections, sorted.
    pub fn collection_names(&self) -> Result<Vec<String>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("collection.list"))?;
        let mut names: Vec<String> = state.collections.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    /// Insert or replace a document. Returns the sequence assigned to the write.
    pub fn put(&self, collection: &str, id: &str, body: Value) -> Result<u64, StorageError> {
        if !body.is_object() {
            return Err(StorageError::InvalidDocument(id.to_string()));
        }
        let collection = normalize_collection(collection);
        let sequence = {
            let mut state = self.state.write().map_err(|_| lock_err("document.put"))?;
            let sequence = state.last_sequence + 1;
            let docs = state
                .collections
                .get_mut(&collection)
                .ok_or_else(|| StorageError::CollectionNotFound(collection.clone()))?;
            docs.insert(id.to_string(), Arc::new(Document::new(id, sequence, body)));
            state.last_sequence = sequence;
            sequence
        };
        self.notify(ChangeEvent {
            collection,
            document_ids: vec![id.to_string()],
        });
        Ok(sequence)
    }

    /// Delete a document. Returns false if it did not exist.
    pub fn delete(&self, collection: &str, id: &str) -> Result<bool, StorageError> {
        let collection = normalize_collection(collection);
        let existed = {
            let mut state = self.state.write().map_err(|_| lock_err("document.delete"))?;
            let docs = state
                .collections
                .get_mut(&collection)
                .ok_or_else(|| StorageError::CollectionNotFound(collection.clone()))?;
            let existed = docs.remove(id).is_some();
            if existed {
                state.last_sequence += 1;
            }
            existed
        };
        if existed {
            self.notify(ChangeEvent {
                collection,
                document_ids: vec![id.to_string()],
            });
        }
        Ok(existed)
    }

    /// Get a document by id.
    pub fn get(&self, collection: &str, id: &str) -> Result<Option<Arc<Document>>, StorageError> {
        let collection = normalize_collection(collection);
        let state = self.state.read().map_err(|_| lock_err("document.get"))?;
        let docs = state
            .collections
            .get(&collection)
            .ok_or(StorageError::CollectionNotFound(collection))?;
        Ok(docs.get(id).cloned())
    }

    /// Number of registered observers.
    pub fn observer_count(&self) -> Result<usize, StorageError> {
        Ok(self.observers.read().map_err(|_| lock_err("observer.count"))?.len())
    }

    fn notify(&self, event: ChangeEvent) {
        // Snapshot the observer list so callbacks may (un)register observers.
        let targets: Vec<Arc<dyn ChangeObserver>> = match self.observers.read() {
            Ok(guard) => guard
                .values()
                .filter(|entry| entry.scope.covers(&event.collection))
                .map(|entry| Arc::clone(&entry.observer))
                .collect(),
            Err(_) => return,
        };
        for observer in targets {
            observer.on_change(&event);
        }
    }
}

impl DocumentStore for InMemoryDocumentStore {
    fn snapshot(&self, collection: &str) -> Result<Vec<Arc<Document>>, StorageError> {
        let collection = normalize_collection(collection);
        let state = self.state.read().map_err(|_| lock_err("document.snapshot"))?;
        let docs = state
            .collections
            .get(&collection)
            .ok_or(StorageError::CollectionNotFound(collection))?;
        Ok(docs.values().cloned().collect())
    }

    fn add_observer(
        &self,
        scope: ObserverScope,
        observer: Arc<dyn ChangeObserver>,
    ) -> Result<ObserverId, StorageError> {
        let id = ObserverId(self.next_observer.fetch_add(1, Ordering::Relaxed) + 1);
        let mut observers = self.observers.write().map_err(|_| lock_err("observer.add"))?;
        observers.insert(id, ObserverEntry { scope, observer });
        Ok(id)
    }

    fn remove_observer(&self, id: ObserverId) -> Result<bool, StorageError> {
        let mut observers = self.observers.write().map_err(|_| lock_err("observer.remove"))?;
        Ok(observers.remove(&id).is_some())
    }
}

/// Thread-safe in-memory index catalog.
#[derive(Debug, Default)]
pub struct InMemoryIndexCatalog {
    indexes: RwLock<BTreeMap<String, IndexSpec>>,
}

impl InMemoryIndexCatalog {
    /// Create a new empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl IndexCatalog for InMemoryIndexCatalog {
    fn get_index(&self, name: &str) -> Result<Option<IndexSpec>, StorageError> {
        let indexes = self.indexes.read().map_err(|_| lock_err("index.get"))?;
        Ok(indexes.get(name).cloned())
    }

    fn put_index(&self, name: &str, spec: IndexSpec) -> Result<(), StorageError> {
        let mut indexes = self.indexes.write().map_err(|_| lock_err("index.put"))?;
        indexes.insert(name.to_string(), spec);
        Ok(())
    }

    fn remove_index(&self, name: &str) -> Result<bool, StorageError> {
        let mut indexes = self.indexes.write().map_err(|_| lock_err("index.remove"))?;
        Ok(indexes.remove(name).is_some())
    }

    fn list_indexes(&self) -> Result<Vec<(String, IndexSpec)>, StorageError> {
        let indexes = self.indexes.read().map_err(|_| lock_err("index.list"))?;
        Ok(indexes.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }
}

/// Convenience bundle of in-memory stores.
///
/// The handles are shared: hand clones to a `Database` and keep these for
/// writes and inspection.
#[allow(missing_docs)]
#[derive(Debug, Default, Clone)]
pub struct InMemoryStores {
    pub documents: Arc<InMemoryDocumentStore>,
    pub indexes: Arc<InMemoryIndexCatalog>,
}

impl InMemoryStores {
    /// Create empty stores.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}
