//! Database index management.
//!
//! Indexes live in the storage layer's persistent catalog. The manager
//! validates specs and keeps create/replace/drop atomic from the caller's
//! perspective. Indexes influence plan choice (see `Query::explain`), never
//! query results.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{DocqlResult, IndexError};
use crate::language::{Expr, QueryCompiler};
use crate::storage::{IndexCatalog, StorageError};

/// Types of database indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    /// Index on the values of one or more expressions.
    Value,
    /// Full-text index on a single expression.
    FullText,
}

/// Parameters for creating a database index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    /// Value or full-text.
    pub kind: IndexKind,
    /// JSON array of key expressions, e.g. `[[".type"], [".name"]]`.
    pub key_expressions: String,
    /// Full-text only: ignore diacritical marks.
    #[serde(default)]
    pub ignore_accents: bool,
    /// Full-text only: language used for stemming and stop words.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl IndexSpec {
    /// Value index over the given key expressions.
    #[must_use]
    pub fn value(key_expressions: impl Into<String>) -> Self {
        Self {
            kind: IndexKind::Value,
            key_expressions: key_expressions.into(),
            ignore_accents: false,
            language: None,
        }
    }

    /// Full-text index over a single key expression.
    #[must_use]
    pub fn full_text(
        key_expressions: impl Into<String>,
        ignore_accents: bool,
        language: Option<String>,
    ) -> Self {
        Self {
            kind: IndexKind::FullText,
            key_expressions: key_expressions.into(),
            ignore_accents,
            language,
        }
    }
}

fn catalog_err(err: StorageError) -> IndexError {
    IndexError::Catalog {
        message: err.to_string(),
    }
}

/// Creates, replaces, drops and lists named indexes.
pub struct IndexManager {
    catalog: Arc<dyn IndexCatalog>,
    compiler: Arc<dyn QueryCompiler>,
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for IndexManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexManager").finish_non_exhaustive()
    }
}

impl IndexManager {
    /// Create a manager over `catalog`, validating key expressions with `compiler`.
    #[must_use]
    pub fn new(catalog: Arc<dyn IndexCatalog>, compiler: Arc<dyn QueryCompiler>) -> Self {
        Self {
            catalog,
            compiler,
            write_lock: Mutex::new(()),
        }
    }

    /// Creates an index.
    ///
    /// If an identical index with that name already exists, nothing happens.
    /// If a different index with that name exists, it is replaced.
    pub fn create_index(&self, name: &str, spec: IndexSpec) -> DocqlResult<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(IndexError::EmptyName.into());
        }
        self.validate(name, &spec)?;

        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| IndexError::Catalog {
                message: "poisoned lock: index.create".to_string(),
            })?;

        match self.catalog.get_index(name).map_err(catalog_err)? {
            Some(existing) if existing == spec => {
                debug!(index = name, "index already exists with identical spec");
                Ok(())
            }
            Some(_) => {
                self.catalog.put_index(name, spec).map_err(catalog_err)?;
                info!(index = name, "replaced index with new spec");
                Ok(())
            }
            None => {
                self.catalog.put_index(name, spec).map_err(catalog_err)?;
                info!(index = name, "created index");
                Ok(())
            }
        }
    }

    /// Deletes an index. Returns false if no index had that name.
    pub fn drop_index(&self, name: &str) -> DocqlResult<bool> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| IndexError::Catalog {
                message: "poisoned lock: index.drop".to_string(),
            })?;
        let removed = self.catalog.remove_index(name.trim()).map_err(catalog_err)?;
        if removed {
            info!(index = name, "dropped index");
        } else {
            debug!(index = name, "drop requested for unknown index");
        }
        Ok(removed)
    }

    /// Names of all indexes, sorted.
    pub fn index_names(&self) -> DocqlResult<Vec<String>> {
        Ok(self.catalog.index_names().map_err(catalog_err)?)
    }

    /// Finds a value index whose leading key is one of `paths`.
    pub fn covering_index(&self, paths: &[&[String]]) -> DocqlResult<Option<String>> {
        if paths.is_empty() {
            return Ok(None);
        }
        for (name, spec) in self.catalog.list_indexes().map_err(catalog_err)? {
            if spec.kind != IndexKind::Value {
                continue;
            }
            let Ok(keys) = self.parse_keys(&name, &spec) else {
                continue;
            };
            if let Some(Expr::Property(lead)) = keys.first() {
                if paths.iter().any(|p| *p == lead.as_slice()) {
                    return Ok(Some(name));
                }
            }
        }
        Ok(None)
    }

    fn validate(&self, name: &str, spec: &IndexSpec) -> Result<(), IndexError> {
        let keys = self.parse_keys(name, spec)?;
        let invalid = |reason: &str| IndexError::InvalidSpec {
            name: name.to_string(),
            reason: reason.to_string(),
        };
        match spec.kind {
            IndexKind::FullText if keys.len() != 1 => {
                Err(invalid("a full-text index takes exactly one key expression"))
            }
            IndexKind::Value if spec.ignore_accents || spec.language.is_some() => {
                Err(invalid("full-text options are not valid on a value index"))
            }
            _ => Ok(()),
        }
    }

    fn parse_keys(&self, name: &str, spec: &IndexSpec) -> Result<Vec<Expr>, IndexError> {
        let invalid = |reason: String| IndexError::InvalidSpec {
            name: name.to_string(),
            reason,
        };
        let parsed: serde_json::Value = serde_json::from_str(&spec.key_expressions)
            .map_err(|e| invalid(format!("key expressions are not valid JSON: {e}")))?;
        let serde_json::Value::Array(items) = parsed else {
            return Err(invalid("key expressions must be a JSON array".to_string()));
        };
        if items.is_empty() {
            return Err(invalid("at least one key expression is required".to_string()));
        }
        items
            .iter()
            .map(|item| {
                self.compiler
                    .compile_expression(item)
                    .map_err(|e| invalid(format!("invalid key expression: {e}")))
            })
            .collect()
    }
}
