//! # docql - Live queries over an embedded document store
//!
//! docql compiles queries written in a JSON query schema or in N1QL, runs
//! them against collections of JSON documents, and keeps "live" queries up to
//! date: a query with change listeners re-runs in the background whenever the
//! database changes and notifies its listeners only when the results differ.
//!
//! ## Core Concepts
//!
//! - **Database**: binds a document store, an index catalog and a query compiler
//! - **Query**: a compiled query with parameter bindings; clone-cheap handle
//! - **ResultSet**: a single-pass cursor over one execution's rows
//! - **Live query**: a query with listeners, re-run on change, coalescing bursts
//!
//! ## Usage
//!
//! ```rust,ignore
//! use docql::{Database, QueryLanguage};
//! use serde_json::json;
//!
//! let (db, store) = Database::in_memory();
//! let query = db.create_query(
//!     QueryLanguage::Json,
//!     r#"{"WHAT": [[".name"]], "WHERE": ["=", [".type"], "task"]}"#,
//! )?;
//!
//! let token = query.add_change_listener(|change| {
//!     if let Ok(Some(mut rows)) = change.results() {
//!         while rows.advance() {
//!             println!("{:?}", rows.value_for("name"));
//!         }
//!     }
//! })?;
//!
//! store.put("_default", "t1", json!({"type": "task", "name": "write docs"}))?;
//! query.remove_change_listener(token);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod config;
pub mod document;
pub mod error;
pub mod value;

// Language, storage and execution
pub mod executor;
pub mod index;
pub mod language;
pub mod result_set;
pub mod storage;

// Live queries and the public entry points
pub mod database;
pub mod live;
pub mod query;

// Re-export primary types at crate root for convenience
pub use config::{DatabaseConfig, LiveQueryConfig};
pub use database::Database;
pub use document::{ChangeEvent, Document, DEFAULT_COLLECTION};
pub use error::{CompileError, DocqlError, DocqlResult, ExecutionError, IndexError};
pub use executor::QueryExecutor;
pub use index::{IndexKind, IndexManager, IndexSpec};
pub use language::{DefaultCompiler, QueryCompiler, QueryLanguage, QueryPlan};
pub use live::{ListenerToken, LiveQueryStats, LiveQueryStream, LiveState};
pub use query::{ChangeCallback, Query, QueryChange};
pub use result_set::ResultSet;
pub use storage::{
    ChangeObserver, DocumentStore, InMemoryDocumentStore, InMemoryIndexCatalog, InMemoryStores,
    IndexCatalog, ObserverId, ObserverScope, StorageError,
};
pub use value::Parameters;
