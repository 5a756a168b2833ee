//! Database entry point.

use std::sync::Arc;

use tracing::debug;

use crate::config::DatabaseConfig;
use crate::error::DocqlResult;
use crate::index::{IndexManager, IndexSpec};
use crate::language::{DefaultCompiler, QueryCompiler, QueryLanguage};
use crate::query::Query;
use crate::storage::{DocumentStore, IndexCatalog, InMemoryDocumentStore, InMemoryStores};

/// A document database: storage, index catalog and query compiler.
#[derive(Clone)]
pub struct Database {
    documents: Arc<dyn DocumentStore>,
    indexes: Arc<IndexManager>,
    compiler: Arc<dyn QueryCompiler>,
    config: DatabaseConfig,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Create a database over the given stores with the built-in compiler.
    #[must_use]
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        catalog: Arc<dyn IndexCatalog>,
        config: DatabaseConfig,
    ) -> Self {
        Self::with_compiler(documents, catalog, Arc::new(DefaultCompiler), config)
    }

    /// Create a database with an explicit query compiler.
    #[must_use]
    pub fn with_compiler(
        documents: Arc<dyn DocumentStore>,
        catalog: Arc<dyn IndexCatalog>,
        compiler: Arc<dyn QueryCompiler>,
        config: DatabaseConfig,
    ) -> Self {
        let indexes = Arc::new(IndexManager::new(catalog, Arc::clone(&compiler)));
        Self {
            documents,
            indexes,
            compiler,
            config,
        }
    }

    /// Create an in-memory database. The returned store is used for writes.
    #[must_use]
    pub fn in_memory() -> (Self, Arc<InMemoryDocumentStore>) {
        let stores = InMemoryStores::new();
        let db = Self::new(
            Arc::clone(&stores.documents) as Arc<dyn DocumentStore>,
            stores.indexes,
            DatabaseConfig::default(),
        );
        (db, stores.documents)
    }

    /// Get a reference to the document store.
    pub fn document_store(&self) -> &Arc<dyn DocumentStore> {
        &self.documents
    }

    /// The configuration queries are created with.
    #[must_use]
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Compiles a query. Compile errors carry a message and, when known, the
    /// byte offset of the problem in `text`.
    pub fn create_query(&self, language: QueryLanguage, text: &str) -> DocqlResult<Query> {
        let plan = self.compiler.compile(language, text)?;
        debug!(%language, collection = %plan.collection, columns = plan.columns.len(), "query compiled");
        Ok(Query::new(
            language,
            text,
            plan,
            Arc::clone(&self.documents),
            Arc::clone(&self.indexes),
            self.config.live.clone(),
        ))
    }

    /// Creates an index, or replaces a differing index of the same name.
    pub fn create_index(&self, name: &str, spec: IndexSpec) -> DocqlResult<()> {
        self.indexes.create_index(name, spec)
    }

    /// Deletes an index. Returns false if there was no index by that name.
    pub fn delete_index(&self, name: &str) -> DocqlResult<bool> {
        self.indexes.drop_index(name)
    }

    /// Names of all indexes, sorted.
    pub fn index_names(&self) -> DocqlResult<Vec<String>> {
        self.indexes.index_names()
    }
}
