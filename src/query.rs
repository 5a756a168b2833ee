//! Query handles.
//!
//! A `Query` is a compiled query bound to a database. It can be executed on
//! demand, or made live by adding change listeners: the query then re-runs in
//! the background whenever the database changes and notifies listeners when
//! its results differ.

use std::sync::Arc;

use crossbeam_channel::bounded;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::config::LiveQueryConfig;
use crate::error::{DocqlError, DocqlResult};
use crate::executor::QueryExecutor;
use crate::index::IndexManager;
use crate::language::{Expr, QueryLanguage, QueryPlan};
use crate::live::{
    ListenerToken, LiveQueryController, LiveQueryStats, LiveQueryStream, LiveSource, LiveState,
};
use crate::result_set::ResultSet;
use crate::storage::{DocumentStore, ObserverScope};
use crate::value::Parameters;

/// Listener callback stored by a live query.
pub type ChangeCallback = Arc<dyn Fn(&QueryChange<'_>) + Send + Sync>;

/// Passed to a change listener when a query's results change.
#[derive(Debug)]
pub struct QueryChange<'a> {
    query: &'a Query,
    token: ListenerToken,
    generation: u64,
}

impl QueryChange<'_> {
    /// The query whose results changed.
    #[must_use]
    pub const fn query(&self) -> &Query {
        self.query
    }

    /// The listener being notified.
    #[must_use]
    pub const fn token(&self) -> ListenerToken {
        self.token
    }

    /// Number of the run that produced these results. Increases with every
    /// notification a listener receives.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// The new results, or the error the run failed with.
    pub fn results(&self) -> DocqlResult<Option<ResultSet>> {
        self.query.current_results(self.token)
    }
}

pub(crate) struct QueryInner {
    label: String,
    language: QueryLanguage,
    text: String,
    plan: QueryPlan,
    documents: Arc<dyn DocumentStore>,
    executor: QueryExecutor,
    indexes: Arc<IndexManager>,
    controller: LiveQueryController<ChangeCallback>,
}

impl LiveSource for QueryInner {
    type Callback = ChangeCallback;

    fn controller(&self) -> &LiveQueryController<ChangeCallback> {
        &self.controller
    }

    fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.documents
    }

    fn observer_scope(&self) -> ObserverScope {
        ObserverScope::Collection(self.plan.collection.clone())
    }

    fn execute_with(&self, parameters: &Parameters) -> DocqlResult<ResultSet> {
        self.executor.execute(&self.plan, parameters)
    }

    fn deliver(this: &Arc<Self>, callback: &ChangeCallback, token: ListenerToken, generation: u64) {
        let query = Query {
            inner: Arc::clone(this),
        };
        callback(&QueryChange {
            query: &query,
            token,
            generation,
        });
    }
}

impl Drop for QueryInner {
    fn drop(&mut self) {
        self.controller.shutdown(self.documents.as_ref());
        debug!(query = %self.label, "query released");
    }
}

/// A compiled database query.
///
/// Cloning is cheap; clones share parameters, listeners and live state. The
/// query is released, and any live watch stopped, when the last clone drops.
/// A listener callback that captures a clone of its own query keeps the query
/// alive until that listener is removed.
#[derive(Clone)]
pub struct Query {
    inner: Arc<QueryInner>,
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("label", &self.inner.label)
            .field("language", &self.inner.language)
            .field("text", &self.inner.text)
            .finish_non_exhaustive()
    }
}

impl Query {
    pub(crate) fn new(
        language: QueryLanguage,
        text: &str,
        plan: QueryPlan,
        documents: Arc<dyn DocumentStore>,
        indexes: Arc<IndexManager>,
        config: LiveQueryConfig,
    ) -> Self {
        let mut label = Uuid::new_v4().simple().to_string();
        label.truncate(8);
        Self {
            inner: Arc::new(QueryInner {
                controller: LiveQueryController::new(label.clone(), config, Parameters::new()),
                label,
                language,
                text: text.to_string(),
                plan,
                executor: QueryExecutor::new(Arc::clone(&documents)),
                documents,
                indexes,
            }),
        }
    }

    /// Language the query was written in.
    #[must_use]
    pub fn language(&self) -> QueryLanguage {
        self.inner.language
    }

    /// The query text as given to `Database::create_query`.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.inner.text
    }

    /// The compiled plan.
    #[must_use]
    pub fn plan(&self) -> &QueryPlan {
        &self.inner.plan
    }

    /// Number of columns in each result row.
    #[must_use]
    pub fn column_count(&self) -> usize {
        self.inner.plan.columns.len()
    }

    /// Name of the column at `index`.
    #[must_use]
    pub fn column_name(&self, index: usize) -> Option<&str> {
        self.inner.plan.columns.get(index).map(|c| c.name.as_str())
    }

    /// The current parameter bindings.
    #[must_use]
    pub fn parameters(&self) -> Parameters {
        self.inner.controller.parameters()
    }

    /// Replaces the parameter bindings.
    ///
    /// On a live query this counts as a change: the query re-runs and listeners
    /// hear about any difference in results.
    pub fn set_parameters(&self, parameters: Parameters) {
        self.inner.controller.set_parameters(parameters);
    }

    /// Replaces the parameter bindings from a JSON object.
    ///
    /// Malformed JSON, or JSON that is not an object, is a parameter error and
    /// leaves the bindings unchanged.
    pub fn set_parameters_json(&self, json: &str) -> DocqlResult<()> {
        let parsed: Value = serde_json::from_str(json)
            .map_err(|e| DocqlError::parameter(format!("invalid parameters JSON: {e}")))?;
        let Value::Object(parameters) = parsed else {
            return Err(DocqlError::parameter("parameters must be a JSON object"));
        };
        self.set_parameters(parameters);
        Ok(())
    }

    /// Runs the query against the current database contents.
    pub fn execute(&self) -> DocqlResult<ResultSet> {
        let parameters = self.parameters();
        self.inner.executor.execute(&self.inner.plan, &parameters)
    }

    /// Describes how the query would be run: the normalized query text, the
    /// access strategy, and any extra sort step.
    pub fn explain(&self) -> DocqlResult<String> {
        let plan = &self.inner.plan;
        let mut out = plan.to_n1ql();
        out.push('\n');

        let paths = plan
            .filter
            .as_ref()
            .map(Expr::equality_paths)
            .unwrap_or_default();
        match self.inner.indexes.covering_index(&paths)? {
            Some(index) => out.push_str(&format!("SEARCH {} USING INDEX {index}", plan.collection)),
            None => out.push_str(&format!("SCAN {}", plan.collection)),
        }
        if !plan.order_by.is_empty() {
            out.push_str("\nUSE TEMP B-TREE FOR ORDER BY");
        }
        let parameters = plan.parameter_names();
        if !parameters.is_empty() {
            let names: Vec<String> = parameters.into_iter().map(|p| format!("${p}")).collect();
            out.push_str(&format!("\nPARAMETERS {}", names.join(", ")));
        }
        Ok(out)
    }

    /// Adds a listener to be called whenever the query's results change.
    ///
    /// The first listener makes the query live: it runs at once in the
    /// background and the listener is called with its results. Callbacks run
    /// on the query's worker thread and may call back into the query.
    pub fn add_change_listener<F>(&self, callback: F) -> DocqlResult<ListenerToken>
    where
        F: Fn(&QueryChange<'_>) + Send + Sync + 'static,
    {
        let callback: ChangeCallback = Arc::new(callback);
        self.inner.controller.add_listener(&self.inner, callback)
    }

    /// Removes a listener. After this returns, the listener is not called again.
    ///
    /// If the listener is running on the worker thread, this waits for it to
    /// return. Called from inside a callback, it returns at once. Do not call it
    /// while holding a lock that a callback waits on.
    ///
    /// Removing the last listener stops the live query. Returns false if the
    /// token was not registered.
    pub fn remove_change_listener(&self, token: ListenerToken) -> bool {
        self.inner
            .controller
            .remove_listener(self.inner.documents.as_ref(), token)
    }

    /// The latest results delivered to a listener.
    ///
    /// `Ok(None)` before the listener's first notification and for unknown or
    /// removed tokens. If the delivered run failed, its error is returned.
    /// Each call returns a fresh cursor over the same immutable rows.
    pub fn current_results(&self, token: ListenerToken) -> DocqlResult<Option<ResultSet>> {
        self.inner.controller.current(token)
    }

    /// Subscribes with a stream instead of a callback.
    pub fn subscribe(&self) -> DocqlResult<LiveQueryStream> {
        let (tx, rx) = bounded::<()>(1);
        let token = self.add_change_listener(move |_change| {
            // Full means the reader has a notification pending already.
            let _ = tx.try_send(());
        })?;
        Ok(LiveQueryStream::new(self.clone(), token, rx))
    }

    /// Current live state.
    #[must_use]
    pub fn live_state(&self) -> LiveState {
        self.inner.controller.state()
    }

    /// Run, dispatch and notification counters.
    #[must_use]
    pub fn live_stats(&self) -> LiveQueryStats {
        self.inner.controller.stats()
    }

    /// Number of registered change listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.controller.listener_count()
    }
}
