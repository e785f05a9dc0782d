#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::Semaphore;

use jacs_core::computation::{StageFn, StagedComputation, stage};
use jacs_core::config::DispatcherConfig;
use jacs_core::models::{
    CoreError, CoreErrorKind, ServiceId, ServiceMetaData, ServiceRecord,
};
use jacs_core::orchestration::ServiceDispatcher;
use jacs_core::registry::ServiceRegistry;

pub fn test_db_path(test_name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("jacs-{test_name}-{nanos}.sqlite3"))
}

pub fn fast_config(available_slots: i64) -> DispatcherConfig {
    DispatcherConfig {
        available_slots,
        dispatch_interval: Duration::from_millis(20),
        sync_interval: Duration::from_millis(200),
        default_working_dir: std::env::temp_dir().join("jacs-tests"),
        readiness_poll_interval: Duration::from_millis(10),
        result_retries: 5,
        result_retry_wait: Duration::from_millis(10),
        persistence_retry_backoff: Duration::from_millis(5),
        ..DispatcherConfig::default()
    }
}

pub fn registry_with(services: Vec<(&str, StagedComputation)>) -> Arc<ServiceRegistry> {
    let mut registry = ServiceRegistry::new();
    for (name, computation) in services {
        registry.register(
            ServiceMetaData::new(name, "test service"),
            move || Box::new(computation.clone()),
        );
    }
    Arc::new(registry)
}

pub fn passthrough() -> StageFn {
    stage(|record| async move { Ok(record) })
}

pub fn succeeds() -> StagedComputation {
    StagedComputation::new(passthrough())
}

pub fn fails_with(kind: CoreErrorKind, message: &'static str) -> StageFn {
    stage(move |_record| async move { Err(CoreError::new(kind, message)) })
}

pub async fn wait_terminal(dispatcher: &ServiceDispatcher, id: ServiceId) -> ServiceRecord {
    dispatcher
        .wait_for_terminal(id, Some(Duration::from_secs(5)))
        .await
        .expect("service should reach a terminal state")
}

/// Polls until every admitted service has returned its slot.
pub async fn wait_until_idle(dispatcher: &ServiceDispatcher) {
    let started = Instant::now();
    while dispatcher.server_stats().unwrap().running_count() > 0 {
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "dispatcher never released its slots"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Holds stages until the test opens it.
#[derive(Clone)]
pub struct Gate {
    permits: Arc<Semaphore>,
}

impl Gate {
    pub fn new() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(0)),
        }
    }

    pub fn open(&self, count: usize) {
        self.permits.add_permits(count);
    }

    /// A stage that records the service's `label` parameter, then waits for a permit.
    pub fn stage(&self, journal: &Journal) -> StageFn {
        let permits = self.permits.clone();
        let journal = journal.clone();
        stage(move |record| {
            let permits = permits.clone();
            let journal = journal.clone();
            async move {
                journal.push(label_of(&record));
                let permit = permits.acquire_owned().await.map_err(|error| {
                    CoreError::new(CoreErrorKind::Internal, error.to_string())
                })?;
                permit.forget();
                Ok(record)
            }
        })
    }
}

#[derive(Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.entries.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    /// A stage that records the service's `label` parameter and passes through.
    pub fn stage(&self) -> StageFn {
        let journal = self.clone();
        stage(move |record| {
            let journal = journal.clone();
            async move {
                journal.push(label_of(&record));
                Ok(record)
            }
        })
    }
}

pub fn label_of(record: &ServiceRecord) -> String {
    record
        .string_parameter("label")
        .unwrap_or(record.name.as_str())
        .to_string()
}

pub fn labelled(name: &str, label: &str) -> ServiceRecord {
    ServiceRecord::new(name).parameter("label", label)
}
