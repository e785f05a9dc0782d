mod support;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};

use jacs_core::computation::{StagedComputation, stage};
use jacs_core::models::{
    CoreError, CoreErrorKind, PageRequest, PageResult, ServiceEventType, ServiceId, ServiceRecord,
    ServiceState,
};
use jacs_core::orchestration::{DispatchPass, ServiceDispatcher};
use jacs_core::persistence::{InMemoryServiceStore, PersistenceResult, ServiceStore};
use jacs_core::sqlite::SqliteStore;

use support::{
    Gate, Journal, fast_config, labelled, registry_with, succeeds, test_db_path, wait_terminal,
    wait_until_idle,
};

/// Fails the first `failures` updates with a storage error.
struct FlakyStore {
    inner: InMemoryServiceStore,
    failures: usize,
    attempts: AtomicUsize,
}

impl FlakyStore {
    fn new(failures: usize) -> Self {
        Self {
            inner: InMemoryServiceStore::new(),
            failures,
            attempts: AtomicUsize::new(0),
        }
    }
}

impl ServiceStore for FlakyStore {
    fn save(&self, record: &ServiceRecord) -> PersistenceResult<ServiceRecord> {
        self.inner.save(record)
    }

    fn update(&self, record: &ServiceRecord) -> PersistenceResult<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            return Err(CoreError::new(
                CoreErrorKind::StorageFailure,
                "database is locked",
            ));
        }
        self.inner.update(record)
    }

    fn find_by_id(&self, id: ServiceId) -> PersistenceResult<Option<ServiceRecord>> {
        self.inner.find_by_id(id)
    }

    fn find_by_state(
        &self,
        states: &[ServiceState],
        page: PageRequest,
    ) -> PersistenceResult<PageResult<ServiceRecord>> {
        self.inner.find_by_state(states, page)
    }

    fn find_child_services(&self, parent_id: ServiceId) -> PersistenceResult<Vec<ServiceRecord>> {
        self.inner.find_child_services(parent_id)
    }

    fn find_service_hierarchy(&self, id: ServiceId) -> PersistenceResult<Vec<ServiceRecord>> {
        self.inner.find_service_hierarchy(id)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum PausePoint {
    /// After the record is stored, before `save` returns.
    AfterSave,
    /// Before the record is written.
    BeforeUpdate,
}

/// Blocks the first call at `point` until the test releases it.
struct PausingStore {
    inner: InMemoryServiceStore,
    point: PausePoint,
    armed: AtomicBool,
    reached: Mutex<mpsc::Sender<()>>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl PausingStore {
    fn new(point: PausePoint) -> (Arc<Self>, mpsc::Receiver<()>, mpsc::Sender<()>) {
        let (reached_tx, reached_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let store = Self {
            inner: InMemoryServiceStore::new(),
            point,
            armed: AtomicBool::new(true),
            reached: Mutex::new(reached_tx),
            release: Mutex::new(release_rx),
        };
        (Arc::new(store), reached_rx, release_tx)
    }

    fn pause_at(&self, point: PausePoint) {
        if self.point == point && self.armed.swap(false, Ordering::SeqCst) {
            let _ = self.reached.lock().unwrap().send(());
            let _ = self.release.lock().unwrap().recv();
        }
    }
}

impl ServiceStore for PausingStore {
    fn save(&self, record: &ServiceRecord) -> PersistenceResult<ServiceRecord> {
        let saved = self.inner.save(record)?;
        self.pause_at(PausePoint::AfterSave);
        Ok(saved)
    }

    fn update(&self, record: &ServiceRecord) -> PersistenceResult<()> {
        self.pause_at(PausePoint::BeforeUpdate);
        self.inner.update(record)
    }

    fn find_by_id(&self, id: ServiceId) -> PersistenceResult<Option<ServiceRecord>> {
        self.inner.find_by_id(id)
    }

    fn find_by_state(
        &self,
        states: &[ServiceState],
        page: PageRequest,
    ) -> PersistenceResult<PageResult<ServiceRecord>> {
        self.inner.find_by_state(states, page)
    }

    fn find_child_services(&self, parent_id: ServiceId) -> PersistenceResult<Vec<ServiceRecord>> {
        self.inner.find_child_services(parent_id)
    }

    fn find_service_hierarchy(&self, id: ServiceId) -> PersistenceResult<Vec<ServiceRecord>> {
        self.inner.find_service_hierarchy(id)
    }
}

async fn wait_for_pause(reached: mpsc::Receiver<()>) {
    tokio::task::spawn_blocking(move || reached.recv())
        .await
        .unwrap()
        .expect("store should reach the pause point");
}

fn persisted_in(store: &dyn ServiceStore, state: ServiceState, name: &str) -> ServiceRecord {
    let mut record = ServiceRecord::new(name);
    record.transition_to(ServiceState::Queued).unwrap();
    record.add_event(ServiceEventType::Queued, "queued for dispatch");
    if state == ServiceState::Running {
        record.transition_to(ServiceState::Running).unwrap();
        record.add_event(ServiceEventType::Started, "processing started");
    }
    store.save(&record).unwrap()
}

#[tokio::test]
async fn restart_recovers_pending_records_from_sqlite() {
    let path = test_db_path("recovery");
    let (queued_id, running_id, finished_id) = {
        let store = SqliteStore::new(&path);
        store.migrate_to_latest().unwrap();
        let queued = persisted_in(&store, ServiceState::Queued, "noop");
        let running = persisted_in(&store, ServiceState::Running, "noop");
        let mut finished = persisted_in(&store, ServiceState::Running, "noop");
        finished.transition_to(ServiceState::Successful).unwrap();
        store.update(&finished).unwrap();
        (
            queued.id.unwrap(),
            running.id.unwrap(),
            finished.id.unwrap(),
        )
    };

    // a fresh store on the same file stands in for the restarted process
    let store = Arc::new(SqliteStore::new(&path));
    store.migrate_to_latest().unwrap();
    let dispatcher =
        ServiceDispatcher::new(registry_with(vec![("noop", succeeds())]), store, fast_config(2));

    assert_eq!(dispatcher.sync_service_queue().await.unwrap(), 2);
    assert_eq!(
        dispatcher.server_stats().unwrap().waiting_services,
        vec![queued_id, running_id]
    );
    // records already tracked are not merged twice
    assert_eq!(dispatcher.sync_service_queue().await.unwrap(), 0);

    dispatcher.dispatch_services().unwrap();
    let queued = wait_terminal(&dispatcher, queued_id).await;
    let running = wait_terminal(&dispatcher, running_id).await;

    assert_eq!(queued.state, ServiceState::Successful);
    assert_eq!(running.state, ServiceState::Successful);
    assert!(
        running
            .events
            .iter()
            .any(|event| event.event_type == ServiceEventType::Recovered)
    );
    assert!(
        !queued
            .events
            .iter()
            .any(|event| event.event_type == ServiceEventType::Recovered)
    );

    let finished = dispatcher.store().find_by_id(finished_id).unwrap().unwrap();
    assert_eq!(finished.events.len(), 2, "finished records are left alone");

    wait_until_idle(&dispatcher).await;
    assert_eq!(dispatcher.sync_service_queue().await.unwrap(), 0);

    let _ = std::fs::remove_file(path);
}

#[tokio::test]
async fn panicking_computation_settles_as_error_and_frees_its_slot() {
    let cleanups = Arc::new(AtomicUsize::new(0));
    let panics = StagedComputation::new(stage(|record| async move {
        if record.name == "panics" {
            panic!("computation exploded");
        }
        Ok(record)
    }))
    .with_post_process({
        let cleanups = cleanups.clone();
        move |_record, _error| {
            let cleanups = cleanups.clone();
            async move {
                cleanups.fetch_add(1, Ordering::SeqCst);
            }
        }
    });
    let store = Arc::new(InMemoryServiceStore::new());
    let dispatcher = ServiceDispatcher::new(
        registry_with(vec![("panics", panics), ("noop", succeeds())]),
        store,
        fast_config(1),
    );

    let failing = dispatcher
        .submit_async("panics", Vec::new(), None)
        .await
        .unwrap();
    let healthy = dispatcher.submit_async("noop", Vec::new(), None).await.unwrap();
    dispatcher.dispatch_services().unwrap();

    let failed = wait_terminal(&dispatcher, failing.id.unwrap()).await;
    assert_eq!(failed.state, ServiceState::Error);
    assert!(failed.error_message.unwrap().contains("panicked"));
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);

    // the freed slot admits the next record
    let finished = wait_terminal(&dispatcher, healthy.id.unwrap()).await;
    assert_eq!(finished.state, ServiceState::Successful);

    wait_until_idle(&dispatcher).await;
    assert_eq!(dispatcher.available_slots().unwrap(), 1);
}

#[tokio::test]
async fn transient_storage_failures_are_retried() {
    let store = Arc::new(FlakyStore::new(2));
    let dispatcher = ServiceDispatcher::new(
        registry_with(vec![("noop", succeeds())]),
        store.clone(),
        fast_config(1),
    );

    let submitted = dispatcher.submit_async("noop", Vec::new(), None).await.unwrap();
    dispatcher.dispatch_services().unwrap();

    let finished = wait_terminal(&dispatcher, submitted.id.unwrap()).await;
    assert_eq!(finished.state, ServiceState::Successful);
    assert!(store.attempts.load(Ordering::SeqCst) >= 4);
}

#[tokio::test]
async fn persistent_storage_failure_leaves_record_recoverable() {
    let store = Arc::new(FlakyStore::new(usize::MAX));
    let dispatcher = ServiceDispatcher::new(
        registry_with(vec![("noop", succeeds())]),
        store.clone(),
        fast_config(1),
    );

    let submitted = dispatcher.submit_async("noop", Vec::new(), None).await.unwrap();
    let id = submitted.id.unwrap();
    dispatcher.dispatch_services().unwrap();
    wait_until_idle(&dispatcher).await;

    assert_eq!(dispatcher.available_slots().unwrap(), 1);
    let persisted = store.find_by_id(id).unwrap().unwrap();
    assert_eq!(persisted.state, ServiceState::Queued);
    // the next sync picks it up again
    assert_eq!(dispatcher.sync_service_queue().await.unwrap(), 1);
    assert_eq!(dispatcher.server_stats().unwrap().waiting_services, vec![id]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sync_during_submission_does_not_run_a_record_twice() {
    let (store, reached, release) = PausingStore::new(PausePoint::AfterSave);
    let gate = Gate::new();
    let journal = Journal::new();
    let dispatcher = ServiceDispatcher::new(
        registry_with(vec![("gated", StagedComputation::new(gate.stage(&journal)))]),
        store,
        fast_config(2),
    );

    let submit = tokio::spawn({
        let dispatcher = dispatcher.clone();
        async move {
            dispatcher
                .submit_service_async(labelled("gated", "only"), None)
                .await
        }
    });
    wait_for_pause(reached).await;

    // the record is persisted but submission has not queued it yet
    assert_eq!(dispatcher.sync_service_queue().await.unwrap(), 1);
    let id = ServiceId(1);
    assert_eq!(
        dispatcher.dispatch_services().unwrap(),
        DispatchPass::Dispatched(vec![id])
    );

    release.send(()).unwrap();
    let submitted = submit.await.unwrap().unwrap();
    assert_eq!(submitted.id, Some(id));
    assert!(dispatcher.server_stats().unwrap().waiting_services.is_empty());
    assert_eq!(dispatcher.dispatch_services().unwrap(), DispatchPass::Idle);

    gate.open(2);
    let finished = wait_terminal(&dispatcher, id).await;
    assert_eq!(finished.state, ServiceState::Successful);
    wait_until_idle(&dispatcher).await;
    assert_eq!(journal.entries(), vec!["only"]);
    assert_eq!(dispatcher.available_slots().unwrap(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sync_during_cancellation_does_not_requeue_the_record() {
    let (store, reached, release) = PausingStore::new(PausePoint::BeforeUpdate);
    let dispatcher = ServiceDispatcher::new(
        registry_with(vec![("noop", succeeds())]),
        store.clone(),
        fast_config(1),
    );

    let submitted = dispatcher.submit_async("noop", Vec::new(), None).await.unwrap();
    let id = submitted.id.unwrap();

    let cancel = tokio::spawn({
        let dispatcher = dispatcher.clone();
        async move { dispatcher.cancel_service(id).await }
    });
    wait_for_pause(reached).await;

    // CANCELED is not written yet, so the store still reports QUEUED
    assert_eq!(
        store.find_by_id(id).unwrap().unwrap().state,
        ServiceState::Queued
    );
    assert_eq!(dispatcher.sync_service_queue().await.unwrap(), 0);
    assert_eq!(dispatcher.dispatch_services().unwrap(), DispatchPass::Idle);

    release.send(()).unwrap();
    let cancelled = cancel.await.unwrap().unwrap();
    assert_eq!(cancelled.state, ServiceState::Canceled);

    let persisted = store.find_by_id(id).unwrap().unwrap();
    assert_eq!(persisted.state, ServiceState::Canceled);
    assert_eq!(
        persisted.events.last().map(|event| event.event_type),
        Some(ServiceEventType::Canceled)
    );
    assert_eq!(dispatcher.sync_service_queue().await.unwrap(), 0);
    assert_eq!(dispatcher.dispatch_services().unwrap(), DispatchPass::Idle);
    assert_eq!(dispatcher.available_slots().unwrap(), 1);
}
