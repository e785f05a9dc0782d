mod support;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use jacs_core::computation::{StagedComputation, stage};
use jacs_core::models::{
    CoreErrorKind, ServiceEventType, ServiceId, ServiceRecord, ServiceState,
};
use jacs_core::orchestration::{DispatchPass, ServiceDispatcher};
use jacs_core::persistence::{InMemoryServiceStore, ServiceStore};

use support::{Gate, Journal, fast_config, labelled, registry_with, succeeds, wait_terminal};

fn dispatcher_with(
    services: Vec<(&str, StagedComputation)>,
    slots: i64,
) -> (ServiceDispatcher, Arc<InMemoryServiceStore>) {
    let store = Arc::new(InMemoryServiceStore::new());
    let dispatcher = ServiceDispatcher::new(registry_with(services), store.clone(), fast_config(slots));
    (dispatcher, store)
}

#[tokio::test]
async fn submission_persists_queued_record() {
    let (dispatcher, store) = dispatcher_with(vec![("noop", succeeds())], 1);

    let submitted = dispatcher
        .submit_service_async(ServiceRecord::new("noop").parameter("x", 1), None)
        .await
        .unwrap();

    let id = submitted.id.expect("submitted record must have an id");
    assert_eq!(submitted.state, ServiceState::Queued);
    let persisted = store.find_by_id(id).unwrap().unwrap();
    assert_eq!(persisted.state, ServiceState::Queued);
    let events: Vec<_> = persisted.events.iter().map(|event| event.event_type).collect();
    assert_eq!(events, vec![ServiceEventType::Created, ServiceEventType::Queued]);

    let stats = dispatcher.server_stats().unwrap();
    assert_eq!(stats.waiting_services, vec![id]);
    assert_eq!(stats.running_count(), 0);
}

#[tokio::test]
async fn resubmitting_a_submitted_record_is_rejected() {
    let (dispatcher, _store) = dispatcher_with(vec![("noop", succeeds())], 1);
    let submitted = dispatcher
        .submit_service_async(ServiceRecord::new("noop"), None)
        .await
        .unwrap();

    let error = dispatcher
        .submit_service_async(submitted, None)
        .await
        .unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::InvalidInput);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slots_bound_concurrency_and_are_returned() {
    let gate = Gate::new();
    let journal = Journal::new();
    let (dispatcher, _store) = dispatcher_with(
        vec![("gated", StagedComputation::new(gate.stage(&journal)))],
        2,
    );

    let mut ids = Vec::new();
    for label in ["a", "b", "c", "d"] {
        let record = dispatcher
            .submit_service_async(labelled("gated", label), None)
            .await
            .unwrap();
        ids.push(record.id.unwrap());
    }

    let pass = dispatcher.dispatch_services().unwrap();
    assert_eq!(pass, DispatchPass::Dispatched(vec![ids[0], ids[1]]));
    assert_eq!(dispatcher.available_slots().unwrap(), 0);

    let pass = dispatcher.dispatch_services().unwrap();
    assert_eq!(pass, DispatchPass::NoAvailableSlots { waiting: 2 });

    let stats = dispatcher.server_stats().unwrap();
    assert_eq!(stats.running_services, vec![ids[0], ids[1]]);
    assert_eq!(stats.waiting_services, vec![ids[2], ids[3]]);

    gate.open(4);
    for id in &ids {
        let record = wait_terminal(&dispatcher, *id).await;
        assert_eq!(record.state, ServiceState::Successful);
    }

    // settlement happens just before the slot is handed back
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(dispatcher.available_slots().unwrap(), 2);
    assert_eq!(journal.entries().len(), 4);
    let stats = dispatcher.server_stats().unwrap();
    assert_eq!(stats.running_count(), 0);
    assert_eq!(stats.waiting_count(), 0);
}

#[tokio::test]
async fn no_dispatch_without_slots() {
    let journal = Journal::new();
    let (dispatcher, store) =
        dispatcher_with(vec![("noop", StagedComputation::new(journal.stage()))], 0);

    let record = dispatcher
        .submit_service_async(labelled("noop", "only"), None)
        .await
        .unwrap();
    let pass = dispatcher.dispatch_services().unwrap();
    assert_eq!(pass, DispatchPass::NoAvailableSlots { waiting: 1 });

    tokio::time::sleep(Duration::from_millis(30)).await;
    let id = record.id.unwrap();
    assert_eq!(store.find_by_id(id).unwrap().unwrap().state, ServiceState::Queued);
    assert!(journal.entries().is_empty());

    dispatcher.set_available_slots(1).unwrap();
    dispatcher.dispatch_services().unwrap();
    assert_eq!(wait_terminal(&dispatcher, id).await.state, ServiceState::Successful);
}

#[tokio::test]
async fn admission_is_first_in_first_out() {
    let journal = Journal::new();
    let (dispatcher, _store) =
        dispatcher_with(vec![("ordered", StagedComputation::new(journal.stage()))], 1);

    let mut ids = Vec::new();
    for label in ["first", "second", "third"] {
        let record = dispatcher
            .submit_service_async(labelled("ordered", label), None)
            .await
            .unwrap();
        ids.push(record.id.unwrap());
    }

    dispatcher.dispatch_services().unwrap();
    for id in &ids {
        wait_terminal(&dispatcher, *id).await;
    }

    assert_eq!(journal.entries(), vec!["first", "second", "third"]);
}

#[tokio::test]
async fn unknown_service_settles_as_error() {
    let (dispatcher, _store) = dispatcher_with(vec![("noop", succeeds())], 1);

    let record = dispatcher
        .submit_service_async(ServiceRecord::new("does-not-exist"), None)
        .await
        .unwrap();
    dispatcher.dispatch_services().unwrap();

    let settled = wait_terminal(&dispatcher, record.id.unwrap()).await;
    assert_eq!(settled.state, ServiceState::Error);
    assert!(
        settled
            .error_message
            .as_deref()
            .unwrap_or_default()
            .contains("no service registered")
    );
    assert_eq!(
        settled.events.last().map(|event| event.event_type),
        Some(ServiceEventType::Failed)
    );

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(dispatcher.available_slots().unwrap(), 1);
}

#[tokio::test]
async fn stage_failure_records_error_message_and_runs_post_process() {
    let post_calls = Arc::new(AtomicUsize::new(0));
    let computation = StagedComputation::new(support::fails_with(
        CoreErrorKind::ComputationFailure,
        "simulated processing failure",
    ))
    .with_post_process({
        let post_calls = post_calls.clone();
        move |_record, error| {
            let post_calls = post_calls.clone();
            async move {
                assert!(error.is_some());
                post_calls.fetch_add(1, Ordering::SeqCst);
            }
        }
    });
    let (dispatcher, _store) = dispatcher_with(vec![("broken", computation)], 1);

    let record = dispatcher
        .submit_service_async(ServiceRecord::new("broken"), None)
        .await
        .unwrap();
    dispatcher.dispatch_services().unwrap();

    let settled = wait_terminal(&dispatcher, record.id.unwrap()).await;
    assert_eq!(settled.state, ServiceState::Error);
    assert!(
        settled
            .error_message
            .as_deref()
            .unwrap_or_default()
            .contains("simulated processing failure")
    );
    assert_eq!(post_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn successful_run_assigns_working_directory_and_events() {
    let (dispatcher, _store) = dispatcher_with(vec![("noop", succeeds())], 1);
    let record = dispatcher
        .submit_service_async(ServiceRecord::new("noop"), None)
        .await
        .unwrap();
    let id = record.id.unwrap();
    dispatcher.dispatch_services().unwrap();

    let settled = wait_terminal(&dispatcher, id).await;
    assert_eq!(settled.state, ServiceState::Successful);
    assert_eq!(
        settled.working_directory,
        Some(fast_config(1).default_working_dir.join(format!("noop_{id}")))
    );
    assert!(settled.process_started_at.is_some());
    let events: Vec<_> = settled.events.iter().map(|event| event.event_type).collect();
    assert_eq!(
        events,
        vec![
            ServiceEventType::Created,
            ServiceEventType::Queued,
            ServiceEventType::Started,
            ServiceEventType::Completed,
        ]
    );
}

#[tokio::test]
async fn terminal_records_are_not_run_again() {
    let runs = Arc::new(AtomicUsize::new(0));
    let computation = StagedComputation::new(stage({
        let runs = runs.clone();
        move |record| {
            let runs = runs.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(record)
            }
        }
    }));
    let (dispatcher, store) = dispatcher_with(vec![("counted", computation)], 1);

    let record = dispatcher
        .submit_service_async(ServiceRecord::new("counted"), None)
        .await
        .unwrap();
    let id = record.id.unwrap();

    // another writer finishes the record before it is admitted
    let mut finished = store.find_by_id(id).unwrap().unwrap();
    finished.transition_to(ServiceState::Canceled).unwrap();
    store.update(&finished).unwrap();

    dispatcher.dispatch_services().unwrap();
    let settled = wait_terminal(&dispatcher, id).await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(settled.state, ServiceState::Canceled);
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert_eq!(dispatcher.available_slots().unwrap(), 1);
}

#[tokio::test]
async fn settlement_keeps_terminal_state_written_during_run() {
    let gate = Gate::new();
    let journal = Journal::new();
    let (dispatcher, store) = dispatcher_with(
        vec![("gated", StagedComputation::new(gate.stage(&journal)))],
        1,
    );
    let record = dispatcher
        .submit_service_async(labelled("gated", "raced"), None)
        .await
        .unwrap();
    let id = record.id.unwrap();
    dispatcher.dispatch_services().unwrap();

    while journal.entries().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let mut running = store.find_by_id(id).unwrap().unwrap();
    assert_eq!(running.state, ServiceState::Running);
    running.transition_to(ServiceState::Error).unwrap();
    running.error_message = Some("failed elsewhere".to_string());
    store.update(&running).unwrap();

    gate.open(1);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let settled = store.find_by_id(id).unwrap().unwrap();
    assert_eq!(settled.state, ServiceState::Error);
    assert_eq!(settled.error_message.as_deref(), Some("failed elsewhere"));
}

#[tokio::test]
async fn cancelling_a_queued_service_settles_it_immediately() {
    let journal = Journal::new();
    let (dispatcher, store) =
        dispatcher_with(vec![("noop", StagedComputation::new(journal.stage()))], 0);
    let record = dispatcher
        .submit_service_async(labelled("noop", "doomed"), None)
        .await
        .unwrap();
    let id = record.id.unwrap();

    let cancelled = dispatcher.cancel_service(id).await.unwrap();
    assert_eq!(cancelled.state, ServiceState::Canceled);
    assert_eq!(store.find_by_id(id).unwrap().unwrap().state, ServiceState::Canceled);
    assert!(dispatcher.server_stats().unwrap().waiting_services.is_empty());

    // cancelling again is a no-op on a terminal record
    let again = dispatcher.cancel_service(id).await.unwrap();
    assert_eq!(again.state, ServiceState::Canceled);

    dispatcher.set_available_slots(1).unwrap();
    dispatcher.dispatch_services().unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(journal.entries().is_empty());
}

#[tokio::test]
async fn cancelling_a_running_service_stops_it_between_stages() {
    let gate = Gate::new();
    let journal = Journal::new();
    let completion_runs = Arc::new(AtomicUsize::new(0));
    let computation = StagedComputation::new(gate.stage(&journal)).with_completion(stage({
        let completion_runs = completion_runs.clone();
        move |record| {
            let completion_runs = completion_runs.clone();
            async move {
                completion_runs.fetch_add(1, Ordering::SeqCst);
                Ok(record)
            }
        }
    }));
    let (dispatcher, _store) = dispatcher_with(vec![("gated", computation)], 1);

    let record = dispatcher
        .submit_service_async(labelled("gated", "cancel-me"), None)
        .await
        .unwrap();
    let id = record.id.unwrap();
    dispatcher.dispatch_services().unwrap();

    while journal.entries().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let requested = dispatcher.cancel_service(id).await.unwrap();
    assert_eq!(requested.state, ServiceState::Running);
    gate.open(1);

    let settled = wait_terminal(&dispatcher, id).await;
    assert_eq!(settled.state, ServiceState::Canceled);
    assert_eq!(completion_runs.load(Ordering::SeqCst), 0);
    assert_eq!(
        settled.events.last().map(|event| event.event_type),
        Some(ServiceEventType::Canceled)
    );
}

#[tokio::test]
async fn wait_for_terminal_times_out_for_stuck_service() {
    let (dispatcher, _store) = dispatcher_with(vec![("noop", succeeds())], 0);
    let record = dispatcher
        .submit_service_async(ServiceRecord::new("noop"), None)
        .await
        .unwrap();

    let error = dispatcher
        .wait_for_terminal(record.id.unwrap(), Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::Timeout);

    let error = dispatcher
        .wait_for_terminal(ServiceId(9_999), Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::InvalidInput);
}

#[tokio::test]
async fn run_loop_dispatches_until_shutdown() {
    let (dispatcher, _store) = dispatcher_with(vec![("noop", succeeds())], 2);
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let runner = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            dispatcher
                .run(async {
                    let _ = shutdown_rx.await;
                })
                .await;
        })
    };

    let record = dispatcher
        .submit_service_async(ServiceRecord::new("noop"), None)
        .await
        .unwrap();
    let settled = wait_terminal(&dispatcher, record.id.unwrap()).await;
    assert_eq!(settled.state, ServiceState::Successful);

    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(1), runner)
        .await
        .expect("run loop should stop on shutdown")
        .unwrap();
}

#[tokio::test]
async fn submitting_a_child_leaves_the_parent_untouched() {
    let (dispatcher, store) = dispatcher_with(vec![("noop", succeeds())], 0);

    let parent = dispatcher
        .submit_service_async(ServiceRecord::new("noop"), None)
        .await
        .unwrap();
    let parent_id = parent.id.unwrap();
    let before = store.find_by_id(parent_id).unwrap().unwrap();

    let child = dispatcher
        .submit_service_async(ServiceRecord::new("noop"), Some(&before))
        .await
        .unwrap();

    let after = store.find_by_id(parent_id).unwrap().unwrap();
    assert_eq!(after, before);
    assert_eq!(after.state, ServiceState::Queued);
    assert_eq!(after.modified_at, before.modified_at);
    assert_eq!(after.events, before.events);

    assert_eq!(child.parent_id, Some(parent_id));
    assert_eq!(child.root_id, Some(parent_id));
    let persisted_child = store.find_by_id(child.id.unwrap()).unwrap().unwrap();
    assert_eq!(persisted_child.parent_id, Some(parent_id));
    assert_eq!(persisted_child.root_id, Some(parent_id));
    assert_eq!(
        store.find_child_services(parent_id).unwrap(),
        vec![persisted_child]
    );
}
