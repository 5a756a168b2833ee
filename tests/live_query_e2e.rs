use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde_json::{json, Value};

use docql::{
    ChangeObserver, Database, DatabaseConfig, DocqlError, Document, DocumentStore, ExecutionError,
    InMemoryDocumentStore, InMemoryIndexCatalog, LiveState, ObserverId, ObserverScope, Query,
    QueryLanguage, ResultSet, StorageError,
};

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(150);

fn ids(mut rs: ResultSet) -> Vec<String> {
    let mut out = Vec::new();
    while rs.advance() {
        if let Some(Value::String(id)) = rs.value_for("_id") {
            out.push(id.clone());
        }
    }
    out
}

type Seen = Result<Vec<String>, DocqlError>;

/// Adds a listener that forwards every notification's ids (or error).
fn listen(query: &Query) -> (docql::ListenerToken, Receiver<Seen>) {
    let (tx, rx) = unbounded();
    let token = query
        .add_change_listener(move |change| {
            let seen = change.results().map(|rs| rs.map(ids).unwrap_or_default());
            let _ = tx.send(seen);
        })
        .unwrap();
    (token, rx)
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

fn task_query(db: &Database) -> Query {
    db.create_query(
        QueryLanguage::Json,
        r#"{"WHERE": ["=", [".", "type"], "task"]}"#,
    )
    .unwrap()
}

/// Document store whose scans can be held open by the test, to keep a live
/// run in `Running` for as long as needed.
struct GatedStore {
    inner: Arc<InMemoryDocumentStore>,
    permits: Mutex<Option<Receiver<()>>>,
    started: Sender<()>,
}

impl GatedStore {
    fn new(inner: Arc<InMemoryDocumentStore>) -> (Arc<Self>, Receiver<()>) {
        let (started, started_rx) = unbounded();
        let store = Arc::new(Self {
            inner,
            permits: Mutex::new(None),
            started,
        });
        (store, started_rx)
    }

    /// From now on every scan waits for one permit.
    fn close(&self) -> Sender<()> {
        let (tx, rx) = unbounded();
        *self.permits.lock().unwrap() = Some(rx);
        tx
    }
}

impl DocumentStore for GatedStore {
    fn snapshot(&self, collection: &str) -> Result<Vec<Arc<Document>>, StorageError> {
        // Scan first so the snapshot reflects the moment the run began.
        let docs = self.inner.snapshot(collection)?;
        let permits = self.permits.lock().unwrap().clone();
        if let Some(permits) = permits {
            let _ = self.started.send(());
            let _ = permits.recv_timeout(WAIT);
        }
        Ok(docs)
    }

    fn add_observer(
        &self,
        scope: ObserverScope,
        observer: Arc<dyn ChangeObserver>,
    ) -> Result<ObserverId, StorageError> {
        self.inner.add_observer(scope, observer)
    }

    fn remove_observer(&self, id: ObserverId) -> Result<bool, StorageError> {
        self.inner.remove_observer(id)
    }
}

#[test]
fn listener_sees_match_ignores_unrelated_and_sees_unmatch() {
    let (db, store) = Database::in_memory();
    store.put("_default", "t1", json!({"type": "task"})).unwrap();

    let query = task_query(&db);
    let (_token, rx) = listen(&query);
    assert_eq!(rx.recv_timeout(WAIT).unwrap().unwrap(), vec!["t1".to_string()]);

    store.put("_default", "n1", json!({"type": "note"})).unwrap();
    assert!(rx.recv_timeout(QUIET).is_err(), "unrelated write must not notify");

    store.put("_default", "t1", json!({"type": "done"})).unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap().unwrap(), Vec::<String>::new());
    assert!(rx.recv_timeout(QUIET).is_err());
}

#[test]
fn first_run_on_empty_database_delivers_empty_results() {
    let (db, _store) = Database::in_memory();
    let query = task_query(&db);
    assert_eq!(query.live_state(), LiveState::Idle);

    let (token, rx) = listen(&query);
    assert_eq!(rx.recv_timeout(WAIT).unwrap().unwrap(), Vec::<String>::new());

    let mut rs = query.current_results(token).unwrap().unwrap();
    assert!(!rs.advance());
    assert_eq!(rs.column_names(), ["_id".to_string()]);
}

#[test]
fn notifications_during_a_run_coalesce_into_exactly_one_more_run() {
    let memory = Arc::new(InMemoryDocumentStore::new());
    let (gated, started) = GatedStore::new(memory.clone());
    let db = Database::new(
        gated.clone(),
        Arc::new(InMemoryIndexCatalog::new()),
        DatabaseConfig::default(),
    );
    let query = task_query(&db);
    let (_token, rx) = listen(&query);
    assert_eq!(rx.recv_timeout(WAIT).unwrap().unwrap(), Vec::<String>::new());
    wait_until("settled", || query.live_state() == LiveState::Settled);

    let permits = gated.close();
    memory.put("_default", "t1", json!({"type": "task"})).unwrap();
    started.recv_timeout(WAIT).unwrap();
    assert_eq!(query.live_state(), LiveState::Running);

    for i in 2..=11 {
        memory
            .put("_default", &format!("t{i:02}"), json!({"type": "task"}))
            .unwrap();
    }
    let stats = query.live_stats();
    assert_eq!(stats.runs, 2);
    assert_eq!(stats.coalesced, 9);
    // The in-flight run is still going, but another one is already due.
    assert_eq!(query.live_state(), LiveState::Scheduled);

    permits.send(()).unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap().unwrap(), vec!["t1".to_string()]);

    started.recv_timeout(WAIT).unwrap();
    permits.send(()).unwrap();
    let last = rx.recv_timeout(WAIT).unwrap().unwrap();
    assert_eq!(last.len(), 11);

    wait_until("settled", || query.live_state() == LiveState::Settled);
    assert!(rx.recv_timeout(QUIET).is_err());
    assert_eq!(query.live_stats().runs, 3);
}

#[test]
fn unobservable_change_then_real_change_dispatches_once() {
    let (db, store) = Database::in_memory();
    let query = task_query(&db);
    let (_token, rx) = listen(&query);
    assert_eq!(rx.recv_timeout(WAIT).unwrap().unwrap(), Vec::<String>::new());

    // M1 touches nothing the query can see; M2 adds a match.
    store.put("_default", "n1", json!({"type": "note"})).unwrap();
    store.put("_default", "t1", json!({"type": "task"})).unwrap();

    assert_eq!(rx.recv_timeout(WAIT).unwrap().unwrap(), vec!["t1".to_string()]);
    wait_until("settled", || query.live_state() == LiveState::Settled);
    assert!(rx.recv_timeout(QUIET).is_err());
}

#[test]
fn failed_runs_are_delivered_and_watching_continues() {
    let (db, store) = Database::in_memory();
    let query = db
        .create_query(QueryLanguage::N1ql, "SELECT meta().id FROM tasks")
        .unwrap();
    let (token, rx) = listen(&query);

    let err = rx.recv_timeout(WAIT).unwrap().unwrap_err();
    assert!(matches!(
        err,
        DocqlError::Execution(ExecutionError::CollectionNotFound { .. })
    ));
    assert!(query.current_results(token).is_err());
    wait_until("settled", || query.live_state() == LiveState::Settled);

    store.create_collection("tasks").unwrap();
    store.put("tasks", "a", json!({"title": "first"})).unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap().unwrap(), vec!["a".to_string()]);
    assert!(query.current_results(token).unwrap().is_some());
}

#[test]
fn late_listener_is_served_without_waiting_for_a_change() {
    let (db, store) = Database::in_memory();
    store.put("_default", "t1", json!({"type": "task"})).unwrap();
    let query = task_query(&db);

    let (_first, rx1) = listen(&query);
    rx1.recv_timeout(WAIT).unwrap().unwrap();
    wait_until("settled", || query.live_state() == LiveState::Settled);

    let (second, rx2) = listen(&query);
    assert_eq!(rx2.recv_timeout(WAIT).unwrap().unwrap(), vec!["t1".to_string()]);
    assert!(rx1.recv_timeout(QUIET).is_err());
    assert_eq!(query.live_stats().runs, 1);
    assert_eq!(query.listener_count(), 2);
    assert!(query.current_results(second).unwrap().is_some());
}

#[test]
fn each_read_of_current_results_is_a_fresh_cursor() {
    let (db, store) = Database::in_memory();
    store.put("_default", "t1", json!({"type": "task"})).unwrap();
    store.put("_default", "t2", json!({"type": "task"})).unwrap();
    let query = task_query(&db);
    let (token, rx) = listen(&query);
    rx.recv_timeout(WAIT).unwrap().unwrap();

    let first = ids(query.current_results(token).unwrap().unwrap());
    let second = ids(query.current_results(token).unwrap().unwrap());
    assert_eq!(first, vec!["t1".to_string(), "t2".to_string()]);
    assert_eq!(first, second);
}

#[test]
fn removing_a_listener_stops_its_notifications() {
    let (db, store) = Database::in_memory();
    let query = task_query(&db);
    let (keep, rx_keep) = listen(&query);
    let (gone, rx_gone) = listen(&query);
    rx_keep.recv_timeout(WAIT).unwrap().unwrap();
    rx_gone.recv_timeout(WAIT).unwrap().unwrap();

    assert!(query.remove_change_listener(gone));
    assert!(!query.remove_change_listener(gone));
    assert!(query.current_results(gone).unwrap().is_none());

    store.put("_default", "t1", json!({"type": "task"})).unwrap();
    assert_eq!(rx_keep.recv_timeout(WAIT).unwrap().unwrap(), vec!["t1".to_string()]);
    assert!(rx_gone.recv_timeout(QUIET).is_err());
    assert!(query.current_results(keep).unwrap().is_some());
}

#[test]
fn removing_the_last_listener_goes_idle_and_stops_observing() {
    let (db, store) = Database::in_memory();
    let query = task_query(&db);
    let (token, rx) = listen(&query);
    rx.recv_timeout(WAIT).unwrap().unwrap();
    assert_eq!(store.observer_count().unwrap(), 1);

    assert!(query.remove_change_listener(token));
    assert_eq!(query.live_state(), LiveState::Idle);
    assert_eq!(store.observer_count().unwrap(), 0);

    let runs = query.live_stats().runs;
    store.put("_default", "t1", json!({"type": "task"})).unwrap();
    thread::sleep(QUIET);
    assert_eq!(query.live_stats().runs, runs);

    // Going live again starts from scratch.
    let (_token, rx) = listen(&query);
    assert_eq!(rx.recv_timeout(WAIT).unwrap().unwrap(), vec!["t1".to_string()]);
}

#[test]
fn in_flight_run_is_discarded_after_the_last_listener_leaves() {
    let memory = Arc::new(InMemoryDocumentStore::new());
    let (gated, started) = GatedStore::new(memory.clone());
    let db = Database::new(
        gated.clone(),
        Arc::new(InMemoryIndexCatalog::new()),
        DatabaseConfig::default(),
    );
    let query = task_query(&db);
    let permits = gated.close();

    let (token, rx) = listen(&query);
    started.recv_timeout(WAIT).unwrap();
    assert!(query.remove_change_listener(token));
    permits.send(()).unwrap();

    assert!(rx.recv_timeout(QUIET).is_err());
    assert_eq!(query.live_state(), LiveState::Idle);
    assert!(query.current_results(token).unwrap().is_none());
}

#[test]
fn listener_can_remove_itself_from_its_callback() {
    let (db, store) = Database::in_memory();
    let query = task_query(&db);
    let (tx, rx) = unbounded();
    query
        .add_change_listener(move |change| {
            let _ = tx.send(change.generation());
            change.query().remove_change_listener(change.token());
        })
        .unwrap();

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), 1);
    wait_until("idle", || query.live_state() == LiveState::Idle);
    store.put("_default", "t1", json!({"type": "task"})).unwrap();
    assert!(rx.recv_timeout(QUIET).is_err());
}

#[test]
fn removal_from_another_thread_waits_for_a_running_callback() {
    let (db, store) = Database::in_memory();
    let query = task_query(&db);
    let (entered_tx, entered) = unbounded();
    let (release_tx, release) = unbounded::<()>();
    let (finished_tx, finished) = unbounded();
    let token = query
        .add_change_listener(move |change| {
            let _ = entered_tx.send(change.generation());
            let _ = release.recv_timeout(WAIT);
            let _ = finished_tx.send(change.generation());
        })
        .unwrap();
    assert_eq!(entered.recv_timeout(WAIT).unwrap(), 1);

    let remover = {
        let query = query.clone();
        thread::spawn(move || query.remove_change_listener(token))
    };
    thread::sleep(QUIET);
    assert!(!remover.is_finished(), "removal returned while the callback was running");

    release_tx.send(()).unwrap();
    assert!(remover.join().unwrap());
    // The callback had fully returned before the removal did.
    assert_eq!(finished.try_recv().unwrap(), 1);
    assert_eq!(query.live_state(), LiveState::Idle);

    store.put("_default", "t1", json!({"type": "task"})).unwrap();
    assert!(entered.recv_timeout(QUIET).is_err());
}

#[test]
fn changing_parameters_reruns_a_live_query() {
    let (db, store) = Database::in_memory();
    store.put("_default", "t1", json!({"type": "task"})).unwrap();
    store.put("_default", "n1", json!({"type": "note"})).unwrap();

    let query = db
        .create_query(QueryLanguage::N1ql, "SELECT meta().id FROM _ WHERE type = $kind")
        .unwrap();
    query.set_parameters_json(r#"{"kind": "task"}"#).unwrap();
    let (_token, rx) = listen(&query);
    assert_eq!(rx.recv_timeout(WAIT).unwrap().unwrap(), vec!["t1".to_string()]);

    query.set_parameters_json(r#"{"kind": "note"}"#).unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap().unwrap(), vec!["n1".to_string()]);

    assert!(query.set_parameters_json("{oops").is_err());
    assert!(rx.recv_timeout(QUIET).is_err());
}

#[test]
fn generations_increase_per_listener() {
    let (db, store) = Database::in_memory();
    let query = task_query(&db);
    let (tx, rx) = unbounded();
    query
        .add_change_listener(move |change| {
            let _ = tx.send(change.generation());
        })
        .unwrap();

    for i in 0..20 {
        store
            .put("_default", &format!("t{i:02}"), json!({"type": "task"}))
            .unwrap();
    }
    wait_until("all writes seen", || {
        query.live_state() == LiveState::Settled && query.live_stats().runs >= 2
    });

    let mut last = 0;
    while let Ok(generation) = rx.recv_timeout(QUIET) {
        assert!(generation > last, "generation {generation} after {last}");
        last = generation;
    }
    assert!(last >= 2);
}

#[test]
fn stream_yields_latest_results_and_unsubscribes_on_drop() {
    let (db, store) = Database::in_memory();
    let query = task_query(&db);

    let stream = query.subscribe().unwrap();
    assert!(ids(stream.recv_timeout(WAIT).unwrap()).is_empty());
    assert!(stream.try_recv().unwrap().is_none());

    for i in 0..5 {
        store
            .put("_default", &format!("t{i}"), json!({"type": "task"}))
            .unwrap();
    }

    // A slow reader sees monotonically newer snapshots and ends on the latest.
    let mut seen = 0;
    while seen < 5 {
        let now = ids(stream.recv_timeout(WAIT).unwrap()).len();
        assert!(now >= seen);
        seen = now;
    }

    assert_eq!(query.listener_count(), 1);
    drop(stream);
    assert_eq!(query.listener_count(), 0);
    assert_eq!(query.live_state(), LiveState::Idle);
}

#[test]
fn stream_recv_timeout_reports_timeout() {
    let (db, _store) = Database::in_memory();
    let query = task_query(&db);
    let stream = query.subscribe().unwrap();
    stream.recv_timeout(WAIT).unwrap();

    let err = stream.recv_timeout(Duration::from_millis(20)).unwrap_err();
    assert!(matches!(
        err,
        DocqlError::Execution(ExecutionError::Timeout { .. })
    ));

    stream.unsubscribe();
    assert!(stream.recv_timeout(Duration::from_millis(20)).is_err());
}

#[test]
fn releasing_the_query_stops_the_watch() {
    let (db, store) = Database::in_memory();
    let query = task_query(&db);
    let (_token, rx) = listen(&query);
    rx.recv_timeout(WAIT).unwrap().unwrap();
    assert_eq!(store.observer_count().unwrap(), 1);

    drop(query);
    wait_until("observer removed", || store.observer_count().unwrap() == 0);
    store.put("_default", "t1", json!({"type": "task"})).unwrap();
    assert!(rx.recv_timeout(QUIET).is_err());
}

#[test]
fn writers_do_not_wait_for_running_queries() {
    let memory = Arc::new(InMemoryDocumentStore::new());
    let (gated, started) = GatedStore::new(memory.clone());
    let db = Database::new(
        gated.clone(),
        Arc::new(InMemoryIndexCatalog::new()),
        DatabaseConfig::default(),
    );
    let query = task_query(&db);
    let permits = gated.close();
    let (_token, rx) = listen(&query);
    started.recv_timeout(WAIT).unwrap();

    // The run is blocked in its scan; writes must still complete promptly.
    let begin = Instant::now();
    for i in 0..50 {
        memory
            .put("_default", &format!("t{i:02}"), json!({"type": "task"}))
            .unwrap();
    }
    assert!(begin.elapsed() < Duration::from_secs(2));

    drop(gated.permits.lock().unwrap().take());
    drop(permits);
    rx.recv_timeout(WAIT).unwrap().unwrap();
}
