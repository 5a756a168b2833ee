//! Listener bookkeeping for a live query.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DocqlError;
use crate::result_set::ResultRows;

/// Opaque handle identifying one registered change listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListenerToken(Uuid);

impl ListenerToken {
    /// Create a new random token.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ListenerToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ListenerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// The outcome of one live run, as handed to listeners.
#[derive(Debug)]
pub(crate) struct Delivery {
    pub(crate) outcome: Result<Arc<ResultRows>, DocqlError>,
    /// Run number that produced this outcome; increases over the query's life.
    pub(crate) generation: u64,
    pub(crate) completed_at: DateTime<Utc>,
}

#[derive(Debug)]
struct ListenerEntry<C> {
    token: ListenerToken,
    callback: C,
    /// Last delivery handed to this listener; None until first served.
    snapshot: Option<Arc<Delivery>>,
}

/// Registered listeners in registration order, each with its own snapshot.
#[derive(Debug)]
pub(crate) struct ListenerRegistry<C> {
    entries: Vec<ListenerEntry<C>>,
}

impl<C> Default for ListenerRegistry<C> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<C: Clone> ListenerRegistry<C> {
    pub(crate) fn add(&mut self, callback: C) -> ListenerToken {
        let token = ListenerToken::new();
        self.entries.push(ListenerEntry {
            token,
            callback,
            snapshot: None,
        });
        token
    }

    pub(crate) fn remove(&mut self, token: ListenerToken) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.token != token);
        self.entries.len() != before
    }

    pub(crate) fn contains(&self, token: ListenerToken) -> bool {
        self.entries.iter().any(|e| e.token == token)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    /// The listener's current snapshot. None for unknown tokens and for
    /// listeners not yet served.
    pub(crate) fn snapshot(&self, token: ListenerToken) -> Option<Arc<Delivery>> {
        self.entries
            .iter()
            .find(|e| e.token == token)
            .and_then(|e| e.snapshot.clone())
    }

    /// Records `delivery` for every listener that should see it and returns
    /// the callbacks to invoke. Unchanged results still go to listeners that
    /// have never been served.
    pub(crate) fn dispatch(
        &mut self,
        delivery: &Arc<Delivery>,
        changed: bool,
    ) -> Vec<(ListenerToken, C)> {
        let mut out = Vec::new();
        for entry in &mut self.entries {
            if changed || entry.snapshot.is_none() {
                entry.snapshot = Some(Arc::clone(delivery));
                out.push((entry.token, entry.callback.clone()));
            }
        }
        out
    }

    /// Serves one listener that has not been served yet.
    pub(crate) fn serve(&mut self, token: ListenerToken, delivery: &Arc<Delivery>) -> Option<C> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.token == token && e.snapshot.is_none())?;
        entry.snapshot = Some(Arc::clone(delivery));
        Some(entry.callback.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result_set::tests::rows;

    fn delivery(generation: u64) -> Arc<Delivery> {
        Arc::new(Delivery {
            outcome: Ok(rows(&["_id"], Vec::new())),
            generation,
            completed_at: Utc::now(),
        })
    }

    #[test]
    fn add_remove_and_contains() {
        let mut reg = ListenerRegistry::default();
        let a = reg.add("a");
        let b = reg.add("b");
        assert_ne!(a, b);
        assert_eq!(reg.len(), 2);
        assert!(reg.remove(a));
        assert!(!reg.remove(a));
        assert!(!reg.contains(a));
        assert!(reg.contains(b));
        reg.clear();
        assert!(reg.is_empty());
    }

    #[test]
    fn unchanged_results_only_reach_unserved_listeners() {
        let mut reg = ListenerRegistry::default();
        let a = reg.add("a");
        let first = delivery(1);
        assert_eq!(reg.dispatch(&first, true), vec![(a, "a")]);

        let b = reg.add("b");
        let second = delivery(2);
        assert_eq!(reg.dispatch(&second, false), vec![(b, "b")]);
        assert_eq!(reg.snapshot(a).map(|d| d.generation), Some(1));
        assert_eq!(reg.snapshot(b).map(|d| d.generation), Some(2));

        let third = delivery(3);
        assert_eq!(reg.dispatch(&third, true).len(), 2);
    }

    #[test]
    fn serve_only_fills_empty_snapshots() {
        let mut reg = ListenerRegistry::default();
        let a = reg.add("a");
        assert!(reg.snapshot(a).is_none());
        let d = delivery(1);
        assert_eq!(reg.serve(a, &d), Some("a"));
        assert_eq!(reg.serve(a, &d), None);
        assert_eq!(reg.serve(ListenerToken::new(), &d), None);
    }
}
