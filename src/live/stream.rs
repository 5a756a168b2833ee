use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};

use crate::error::{DocqlError, DocqlResult, ExecutionError};
use crate::query::Query;
use crate::result_set::ResultSet;

use super::registry::ListenerToken;

/// A pull-style subscription to a live query.
///
/// Each receive returns the most recent results; notifications that arrive
/// while the reader is busy collapse into one. Dropping the stream removes
/// its listener.
#[derive(Debug)]
pub struct LiveQueryStream {
    query: Query,
    token: ListenerToken,
    rx: Receiver<()>,
    unsubscribed: AtomicBool,
}

fn disconnected() -> DocqlError {
    DocqlError::Execution(ExecutionError::Disconnected {
        path: "live_query_stream".to_string(),
    })
}

impl LiveQueryStream {
    pub(crate) fn new(query: Query, token: ListenerToken, rx: Receiver<()>) -> Self {
        Self {
            query,
            token,
            rx,
            unsubscribed: AtomicBool::new(false),
        }
    }

    /// The listener token backing this stream.
    #[must_use]
    pub const fn token(&self) -> ListenerToken {
        self.token
    }

    /// The query this stream observes.
    #[must_use]
    pub const fn query(&self) -> &Query {
        &self.query
    }

    /// Removes the listener. Idempotent; later receives report disconnection.
    pub fn unsubscribe(&self) {
        if !self.unsubscribed.swap(true, Ordering::AcqRel) {
            self.query.remove_change_listener(self.token);
        }
    }

    /// Blocks until results change, then returns the latest results.
    pub fn recv(&self) -> DocqlResult<ResultSet> {
        if self.unsubscribed.load(Ordering::Acquire) {
            return Err(disconnected());
        }
        self.rx.recv().map_err(|_| disconnected())?;
        self.latest()
    }

    /// Like [`LiveQueryStream::recv`], giving up after `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> DocqlResult<ResultSet> {
        if self.unsubscribed.load(Ordering::Acquire) {
            return Err(disconnected());
        }
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => DocqlError::Execution(ExecutionError::Timeout {
                duration_ms: timeout.as_millis().min(u128::from(u64::MAX)) as u64,
            }),
            RecvTimeoutError::Disconnected => disconnected(),
        })?;
        self.latest()
    }

    /// Returns the latest results if a change is pending, without blocking.
    pub fn try_recv(&self) -> DocqlResult<Option<ResultSet>> {
        if self.unsubscribed.load(Ordering::Acquire) {
            return Err(disconnected());
        }
        match self.rx.try_recv() {
            Ok(()) => self.latest().map(Some),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(disconnected()),
        }
    }

    fn latest(&self) -> DocqlResult<ResultSet> {
        self.query
            .current_results(self.token)?
            .ok_or_else(disconnected)
    }
}

impl Drop for LiveQueryStream {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
