//! Query execution against a storage snapshot.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::debug;

use crate::document::Document;
use crate::error::{DocqlError, DocqlResult, ExecutionError};
use crate::language::{EvalContext, Expr, QueryPlan};
use crate::result_set::{ResultRows, ResultSet};
use crate::storage::{DocumentStore, StorageError};
use crate::value::{collate, is_truthy, Parameters};

/// Runs compiled plans with a set of parameter bindings.
///
/// Each execution reads one consistent snapshot of the collection; writes
/// committed afterwards are not visible in the returned rows.
#[derive(Clone)]
pub struct QueryExecutor {
    store: Arc<dyn DocumentStore>,
}

impl std::fmt::Debug for QueryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryExecutor").finish_non_exhaustive()
    }
}

impl QueryExecutor {
    /// Creates an executor reading from `store`.
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Executes `plan`. Parameters the plan does not reference are ignored;
    /// referenced but unbound parameters evaluate to MISSING.
    pub fn execute(&self, plan: &QueryPlan, parameters: &Parameters) -> DocqlResult<ResultSet> {
        let started = Instant::now();
        let docs = self.store.snapshot(&plan.collection).map_err(|err| match err {
            StorageError::CollectionNotFound(name) => {
                DocqlError::from(ExecutionError::CollectionNotFound { name })
            }
            other => DocqlError::from(other),
        })?;
        let scanned = docs.len();

        let mut matched: Vec<Arc<Document>> = match &plan.filter {
            Some(filter) => docs
                .into_iter()
                .filter(|doc| {
                    let ctx = EvalContext {
                        document: doc,
                        parameters,
                    };
                    is_truthy(filter.eval(&ctx).as_ref())
                })
                .collect(),
            None => docs,
        };

        if !plan.order_by.is_empty() {
            sort_documents(&mut matched, plan, parameters);
        }

        let mut rows: Vec<Vec<Option<Value>>> = matched
            .iter()
            .map(|doc| {
                let ctx = EvalContext {
                    document: doc,
                    parameters,
                };
                plan.columns.iter().map(|c| c.expr.eval(&ctx)).collect()
            })
            .collect();

        if plan.distinct {
            let mut seen = HashSet::with_capacity(rows.len());
            rows.retain(|row| seen.insert(row_key(row)));
        }

        let offset = resolve_count(plan.offset.as_ref(), "OFFSET", parameters)?.unwrap_or(0);
        let limit = resolve_count(plan.limit.as_ref(), "LIMIT", parameters)?;
        let rows: Vec<_> = rows
            .into_iter()
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
            .take(limit.map_or(usize::MAX, |l| usize::try_from(l).unwrap_or(usize::MAX)))
            .collect();

        debug!(
            collection = %plan.collection,
            scanned,
            rows = rows.len(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "query executed"
        );

        let columns: Arc<[String]> = plan.column_names().into();
        Ok(ResultSet::from_rows(Arc::new(ResultRows::new(columns, rows))))
    }
}

fn sort_documents(docs: &mut [Arc<Document>], plan: &QueryPlan, parameters: &Parameters) {
    // Stable sort over id-ordered input, so ties stay in document-id order.
    let mut keyed: Vec<(Vec<Option<Value>>, Arc<Document>)> = docs
        .iter()
        .map(|doc| {
            let ctx = EvalContext {
                document: doc,
                parameters,
            };
            let keys = plan.order_by.iter().map(|t| t.expr.eval(&ctx)).collect();
            (keys, Arc::clone(doc))
        })
        .collect();

    keyed.sort_by(|(a, _), (b, _)| {
        for ((ka, kb), term) in a.iter().zip(b).zip(&plan.order_by) {
            let ord = collate(ka.as_ref(), kb.as_ref());
            let ord = if term.descending { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });

    for (slot, (_, doc)) in docs.iter_mut().zip(keyed) {
        *slot = doc;
    }
}

/// LIMIT/OFFSET value: a non-negative integer. MISSING or null means no clause.
fn resolve_count(
    expr: Option<&Expr>,
    clause: &'static str,
    parameters: &Parameters,
) -> DocqlResult<Option<u64>> {
    let Some(expr) = expr else {
        return Ok(None);
    };
    let value = match expr {
        Expr::Literal(v) => Some(v.clone()),
        Expr::Parameter(name) => parameters.get(name).cloned(),
        _ => {
            return Err(ExecutionError::InvalidClause {
                clause,
                reason: format!("unsupported expression {expr}"),
            }
            .into())
        }
    };
    let invalid = |reason: String| -> DocqlError { ExecutionError::InvalidClause { clause, reason }.into() };
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => {
            if let Some(v) = n.as_u64() {
                Ok(Some(v))
            } else if let Some(f) = n.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0) {
                Ok(Some(f as u64))
            } else {
                Err(invalid(format!("expected a non-negative integer, got {n}")))
            }
        }
        Some(other) => Err(invalid(format!("expected a non-negative integer, got {other}"))),
    }
}

/// Hashable identity of a row; keeps MISSING distinct from null.
fn row_key(row: &[Option<Value>]) -> String {
    let mut key = String::new();
    for cell in row {
        match cell {
            None => key.push('M'),
            Some(v) => {
                key.push('V');
                key.push_str(&v.to_string());
            }
        }
        key.push('\u{1f}');
    }
    key
}
