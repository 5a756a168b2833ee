//! Storage layer for docql.

pub mod memory;
pub mod traits;

pub use memory::{InMemoryDocumentStore, InMemoryIndexCatalog, InMemoryStores};
pub use traits::{
    ChangeObserver, DocumentStore, IndexCatalog, ObserverId, ObserverScope, StorageError,
};
