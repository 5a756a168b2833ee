//! Live-query state machine and background worker.
//!
//! A live query is Idle until its first listener arrives. It then owns an
//! observer on the document store and a worker thread. Change notifications
//! move it from Settled to Scheduled; the worker re-executes, compares the new
//! rows against the last delivered ones, and dispatches to listeners only when
//! they differ. Notifications that arrive while a run is pending or in flight
//! coalesce into at most one follow-up run.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, ThreadId};
use std::time::Instant;

use chrono::Utc;
use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::LiveQueryConfig;
use crate::document::ChangeEvent;
use crate::error::{DocqlResult, ExecutionError};
use crate::result_set::ResultSet;
use crate::storage::{DocumentStore, ObserverId, ObserverScope};
use crate::value::Parameters;

use super::comparator::equivalent;
use super::registry::{Delivery, ListenerRegistry, ListenerToken};

/// Lifecycle state of a live query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiveState {
    /// No listeners; not observing the database.
    Idle,
    /// A run is pending on the worker. Also reported while a run is still
    /// executing if a change arrived after it started: one more run follows.
    Scheduled,
    /// A run is executing and no change has arrived since it started.
    Running,
    /// The last run's results have been delivered.
    Settled,
}

/// Counters describing a live query's activity.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LiveQueryStats {
    pub runs: u64,
    pub dispatches: u64,
    pub notifications: u64,
    pub coalesced: u64,
}

#[derive(Debug, Default)]
struct LiveCounters {
    runs: AtomicU64,
    dispatches: AtomicU64,
    notifications: AtomicU64,
    coalesced: AtomicU64,
}

/// What the controller needs from the query that owns it.
pub(crate) trait LiveSource: Send + Sync + 'static {
    type Callback: Clone + Send + Sync + 'static;

    fn controller(&self) -> &LiveQueryController<Self::Callback>;

    fn store(&self) -> &Arc<dyn DocumentStore>;

    fn observer_scope(&self) -> ObserverScope;

    fn execute_with(&self, parameters: &Parameters) -> DocqlResult<ResultSet>;

    /// Invokes one listener. Called on the worker thread, outside the state lock.
    fn deliver(this: &Arc<Self>, callback: &Self::Callback, token: ListenerToken, generation: u64);
}

#[derive(Debug)]
struct ControllerState<C> {
    parameters: Parameters,
    phase: LiveState,
    rerun_requested: bool,
    /// Bumped whenever the query goes Idle; a worker whose session no longer
    /// matches discards its run and exits.
    session: u64,
    last: Option<Arc<Delivery>>,
    listeners: ListenerRegistry<C>,
    wake_tx: Option<Sender<()>>,
    attach_tx: Option<Sender<ListenerToken>>,
    observer: Option<ObserverId>,
}

/// Per-query live state, guarded by one mutex.
///
/// Holds the parameter bindings too, so a run always executes with the
/// bindings current at its start.
#[derive(Debug)]
pub(crate) struct LiveQueryController<C> {
    label: String,
    config: LiveQueryConfig,
    state: Mutex<ControllerState<C>>,
    counters: LiveCounters,
    /// Held for the duration of each listener callback.
    delivery: Mutex<()>,
    /// Thread currently holding `delivery`.
    deliverer: Mutex<Option<ThreadId>>,
}

/// Marks one callback in progress; removals from other threads wait for it.
struct DeliveryGuard<'a> {
    deliverer: &'a Mutex<Option<ThreadId>>,
    _held: MutexGuard<'a, ()>,
}

impl Drop for DeliveryGuard<'_> {
    fn drop(&mut self) {
        *self.deliverer.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl<C: Clone + Send + Sync + 'static> LiveQueryController<C> {
    pub(crate) fn new(label: String, config: LiveQueryConfig, parameters: Parameters) -> Self {
        Self {
            label,
            config,
            state: Mutex::new(ControllerState {
                parameters,
                phase: LiveState::Idle,
                rerun_requested: false,
                session: 0,
                last: None,
                listeners: ListenerRegistry::default(),
                wake_tx: None,
                attach_tx: None,
                observer: None,
            }),
            counters: LiveCounters::default(),
            delivery: Mutex::new(()),
            deliverer: Mutex::new(None),
        }
    }

    fn begin_delivery(&self) -> DeliveryGuard<'_> {
        let held = self.delivery.lock().unwrap_or_else(PoisonError::into_inner);
        *self.deliverer.lock().unwrap_or_else(PoisonError::into_inner) = Some(thread::current().id());
        DeliveryGuard {
            deliverer: &self.deliverer,
            _held: held,
        }
    }

    fn delivering_on_current_thread(&self) -> bool {
        *self.deliverer.lock().unwrap_or_else(PoisonError::into_inner) == Some(thread::current().id())
    }

    fn lock(&self) -> MutexGuard<'_, ControllerState<C>> {
        // Listener callbacks never run under this lock, so poisoning can only
        // come from an internal panic; the state is still consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn parameters(&self) -> Parameters {
        self.lock().parameters.clone()
    }

    /// Replaces the bindings. A live query treats this as a change.
    pub(crate) fn set_parameters(&self, parameters: Parameters) {
        let mut state = self.lock();
        state.parameters = parameters;
        if state.phase != LiveState::Idle {
            self.counters.notifications.fetch_add(1, Ordering::Relaxed);
            self.schedule_rerun(&mut state);
        }
    }

    pub(crate) fn state(&self) -> LiveState {
        self.lock().phase
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    pub(crate) fn stats(&self) -> LiveQueryStats {
        LiveQueryStats {
            runs: self.counters.runs.load(Ordering::Relaxed),
            dispatches: self.counters.dispatches.load(Ordering::Relaxed),
            notifications: self.counters.notifications.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
        }
    }

    /// Registers a listener, starting the query if it was Idle.
    pub(crate) fn add_listener<S>(&self, source: &Arc<S>, callback: C) -> DocqlResult<ListenerToken>
    where
        S: LiveSource<Callback = C>,
    {
        let mut state = self.lock();
        let token = state.listeners.add(callback);
        match state.phase {
            LiveState::Idle => {
                if let Err(err) = self.start_session(&mut state, source) {
                    state.listeners.remove(token);
                    return Err(err);
                }
            }
            LiveState::Settled => self.request_serve(&mut state, token),
            // The pending or in-flight run serves every listener not yet served.
            LiveState::Scheduled | LiveState::Running => {}
        }
        debug!(query = %self.label, listener = %token, listeners = state.listeners.len(), "listener added");
        Ok(token)
    }

    /// Removes a listener. Removing the last one stops the query.
    ///
    /// Waits for a callback running on another thread to return, so the
    /// listener is never invoked after this returns. From inside a callback
    /// it returns at once.
    pub(crate) fn remove_listener(&self, store: &dyn DocumentStore, token: ListenerToken) -> bool {
        let _wait = if self.delivering_on_current_thread() {
            None
        } else {
            Some(self.delivery.lock().unwrap_or_else(PoisonError::into_inner))
        };
        let mut state = self.lock();
        let removed = state.listeners.remove(token);
        if removed {
            debug!(query = %self.label, listener = %token, "listener removed");
            if state.listeners.is_empty() {
                self.stop_session(&mut state, store);
            }
        }
        removed
    }

    pub(crate) fn is_registered(&self, token: ListenerToken) -> bool {
        self.lock().listeners.contains(token)
    }

    /// The listener's most recent results.
    ///
    /// `Ok(None)` if the token is unknown or nothing has been delivered to it
    /// yet; `Err` if the delivered run failed.
    pub(crate) fn current(&self, token: ListenerToken) -> DocqlResult<Option<ResultSet>> {
        let snapshot = self.lock().listeners.snapshot(token);
        match snapshot {
            None => Ok(None),
            Some(delivery) => match &delivery.outcome {
                Ok(rows) => Ok(Some(ResultSet::from_rows(Arc::clone(rows)))),
                Err(err) => Err(err.clone()),
            },
        }
    }

    /// Database change notification. Called on the writer's thread; never
    /// blocks beyond the brief per-query lock.
    pub(crate) fn notify_change(&self) {
        let mut state = self.lock();
        if state.phase == LiveState::Idle {
            return;
        }
        self.counters.notifications.fetch_add(1, Ordering::Relaxed);
        self.schedule_rerun(&mut state);
    }

    /// Drops every listener and stops the query.
    pub(crate) fn shutdown(&self, store: &dyn DocumentStore) {
        let mut state = self.lock();
        state.listeners.clear();
        self.stop_session(&mut state, store);
    }

    fn schedule_rerun(&self, state: &mut ControllerState<C>) {
        match state.phase {
            LiveState::Idle => {}
            LiveState::Settled => {
                state.phase = LiveState::Scheduled;
                if let Some(tx) = &state.wake_tx {
                    match tx.try_send(()) {
                        Ok(()) | Err(TrySendError::Full(())) => {}
                        Err(TrySendError::Disconnected(())) => {
                            warn!(query = %self.label, "live query worker is gone");
                        }
                    }
                }
            }
            LiveState::Scheduled => {
                self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
            }
            LiveState::Running => {
                // The in-flight run finishes, then the worker runs again.
                state.rerun_requested = true;
                state.phase = LiveState::Scheduled;
            }
        }
    }

    fn request_serve(&self, state: &mut ControllerState<C>, token: ListenerToken) {
        let queued = state
            .attach_tx
            .as_ref()
            .is_some_and(|tx| tx.try_send(token).is_ok());
        if !queued {
            // A fresh run serves every unserved listener.
            self.schedule_rerun(state);
        }
    }

    fn start_session<S>(&self, state: &mut ControllerState<C>, source: &Arc<S>) -> DocqlResult<()>
    where
        S: LiveSource<Callback = C>,
    {
        state.session += 1;
        let session = state.session;
        let (wake_tx, wake_rx) = bounded::<()>(1);
        let (attach_tx, attach_rx) = bounded::<ListenerToken>(self.config.attach_queue_capacity.max(1));

        let observer_source = Arc::downgrade(source);
        let observer = source.store().add_observer(
            source.observer_scope(),
            Arc::new(move |_event: &ChangeEvent| {
                if let Some(source) = observer_source.upgrade() {
                    source.controller().notify_change();
                }
            }),
        )?;

        let worker_source = Arc::downgrade(source);
        let spawned = thread::Builder::new()
            .name(format!("{}-{}", self.config.worker_name_prefix, self.label))
            .spawn(move || worker_loop(worker_source, session, wake_rx, attach_rx));
        if let Err(err) = spawned {
            warn!(query = %self.label, error = %err, "failed to spawn live query worker");
            if let Err(remove_err) = source.store().remove_observer(observer) {
                warn!(query = %self.label, error = %remove_err, "failed to remove observer");
            }
            return Err(ExecutionError::WorkerUnavailable {
                reason: err.to_string(),
            }
            .into());
        }

        state.phase = LiveState::Scheduled;
        state.rerun_requested = false;
        state.wake_tx = Some(wake_tx);
        state.attach_tx = Some(attach_tx);
        state.observer = Some(observer);
        info!(query = %self.label, session, "live query started");
        Ok(())
    }

    fn stop_session(&self, state: &mut ControllerState<C>, store: &dyn DocumentStore) {
        if state.phase == LiveState::Idle {
            return;
        }
        state.phase = LiveState::Idle;
        state.session += 1;
        state.rerun_requested = false;
        state.last = None;
        // Dropping the senders disconnects the worker's channels.
        state.wake_tx = None;
        state.attach_tx = None;
        if let Some(id) = state.observer.take() {
            if let Err(err) = store.remove_observer(id) {
                warn!(query = %self.label, error = %err, "failed to remove observer");
            }
        }
        info!(query = %self.label, "live query stopped");
    }
}

fn worker_loop<S: LiveSource>(
    source: Weak<S>,
    session: u64,
    wake_rx: Receiver<()>,
    attach_rx: Receiver<ListenerToken>,
) {
    let mut pending = true;
    loop {
        while pending {
            match run_once(&source, session) {
                Some(again) => pending = again,
                None => {
                    debug!(session, "live query worker exiting");
                    return;
                }
            }
        }

        select! {
            recv(wake_rx) -> msg => match msg {
                Ok(()) => pending = true,
                Err(_) => break,
            },
            recv(attach_rx) -> msg => match msg {
                Ok(token) => {
                    if !serve_late(&source, session, token) {
                        break;
                    }
                }
                Err(_) => break,
            },
        }
    }
    debug!(session, "live query worker exiting");
}

/// Executes one run and dispatches its outcome.
///
/// Returns whether another run is due, or None once the session is over.
fn run_once<S: LiveSource>(source: &Weak<S>, session: u64) -> Option<bool> {
    let source = source.upgrade()?;
    let controller = source.controller();

    let parameters = {
        let mut state = controller.lock();
        if state.session != session || state.phase == LiveState::Idle {
            return None;
        }
        state.phase = LiveState::Running;
        state.rerun_requested = false;
        state.parameters.clone()
    };

    let generation = controller.counters.runs.fetch_add(1, Ordering::Relaxed) + 1;
    let started = Instant::now();
    let outcome = source.execute_with(&parameters).map(ResultSet::into_rows);
    if let Err(err) = &outcome {
        warn!(query = %controller.label, generation, error = %err, "live query run failed");
    }
    let delivery = Arc::new(Delivery {
        outcome,
        generation,
        completed_at: Utc::now(),
    });

    let (targets, dispatched, again, changed) = {
        let mut state = controller.lock();
        if state.session != session || state.phase == LiveState::Idle {
            debug!(query = %controller.label, generation, "discarding result of cancelled run");
            return None;
        }

        // Failures always count as a change so listeners hear about them.
        let changed = match (state.last.as_ref().map(|d| &d.outcome), &delivery.outcome) {
            (Some(Ok(prev)), Ok(next)) => !equivalent(
                ResultSet::from_rows(Arc::clone(prev)),
                ResultSet::from_rows(Arc::clone(next)),
            ),
            _ => true,
        };
        let dispatched = if changed {
            state.last = Some(Arc::clone(&delivery));
            delivery
        } else {
            state.last.clone().unwrap_or(delivery)
        };
        let targets = state.listeners.dispatch(&dispatched, changed);

        let again = state.rerun_requested;
        state.rerun_requested = false;
        state.phase = if again {
            LiveState::Scheduled
        } else {
            LiveState::Settled
        };
        (targets, dispatched, again, changed)
    };

    debug!(
        query = %controller.label,
        generation,
        changed,
        rows = dispatched.outcome.as_ref().map_or(0, |rows| rows.len()),
        listeners = targets.len(),
        elapsed_us = started.elapsed().as_micros() as u64,
        at = %dispatched.completed_at,
        "live query run complete"
    );
    invoke(&source, targets, dispatched.generation);
    Some(again)
}

fn serve_late<S: LiveSource>(source: &Weak<S>, session: u64, token: ListenerToken) -> bool {
    let Some(source) = source.upgrade() else {
        return false;
    };
    let controller = source.controller();
    let served = {
        let mut state = controller.lock();
        if state.session != session || state.phase == LiveState::Idle {
            return false;
        }
        if state.phase != LiveState::Settled {
            return true;
        }
        let Some(last) = state.last.clone() else {
            return true;
        };
        state
            .listeners
            .serve(token, &last)
            .map(|callback| (callback, last.generation))
    };
    if let Some((callback, generation)) = served {
        invoke(&source, vec![(token, callback)], generation);
    }
    true
}

fn invoke<S: LiveSource>(source: &Arc<S>, targets: Vec<(ListenerToken, S::Callback)>, generation: u64) {
    let controller = source.controller();
    for (token, callback) in targets {
        let _delivery = controller.begin_delivery();
        // Removal takes effect before the next callback.
        if !controller.is_registered(token) {
            continue;
        }
        controller.counters.dispatches.fetch_add(1, Ordering::Relaxed);
        let result = catch_unwind(AssertUnwindSafe(|| {
            S::deliver(source, &callback, token, generation);
        }));
        if result.is_err() {
            error!(query = %controller.label, listener = %token, "live query listener panicked");
        }
    }
}
