pub mod in_memory;

pub use in_memory::InMemoryServiceStore;

use std::sync::Arc;
use std::time::Duration;

use crate::models::{
    CoreError, CoreErrorKind, PageRequest, PageResult, ServiceId, ServiceRecord, ServiceState,
};

pub type PersistenceResult<T> = Result<T, CoreError>;

pub trait MigrationStore: Send + Sync {
    fn current_version(&self) -> PersistenceResult<i64>;

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()>;
}

pub trait ServiceStore: Send + Sync {
    /// Persists a new record and returns it with its assigned id.
    fn save(&self, record: &ServiceRecord) -> PersistenceResult<ServiceRecord>;

    fn update(&self, record: &ServiceRecord) -> PersistenceResult<()>;

    fn find_by_id(&self, id: ServiceId) -> PersistenceResult<Option<ServiceRecord>>;

    fn find_by_state(
        &self,
        states: &[ServiceState],
        page: PageRequest,
    ) -> PersistenceResult<PageResult<ServiceRecord>>;

    fn find_child_services(&self, parent_id: ServiceId) -> PersistenceResult<Vec<ServiceRecord>>;

    /// The record followed by all of its descendants.
    fn find_service_hierarchy(&self, id: ServiceId) -> PersistenceResult<Vec<ServiceRecord>>;
}

/// Runs a store call on the blocking pool.
pub async fn run_blocking<T, F>(
    store: &Arc<dyn ServiceStore>,
    operation_name: &'static str,
    operation: F,
) -> PersistenceResult<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn ServiceStore) -> PersistenceResult<T> + Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || operation(store.as_ref()))
        .await
        .map_err(|join_error| {
            CoreError::new(
                CoreErrorKind::Internal,
                format!("service store '{operation_name}' join failure: {join_error}"),
            )
        })?
}

/// Updates a record, retrying storage failures with a linear backoff.
pub async fn update_with_retry(
    store: &Arc<dyn ServiceStore>,
    record: &ServiceRecord,
    retries: u32,
    backoff: Duration,
) -> PersistenceResult<()> {
    let mut attempt = 0;
    loop {
        let snapshot = record.clone();
        match run_blocking(store, "update", move |store| store.update(&snapshot)).await {
            Ok(()) => return Ok(()),
            Err(error) if attempt < retries && error.kind == CoreErrorKind::StorageFailure => {
                attempt += 1;
                tracing::warn!(
                    service_id = %record.display_id(),
                    service_name = %record.name,
                    attempt,
                    message = %error.message,
                    "retrying service record update"
                );
                tokio::time::sleep(backoff * attempt).await;
            }
            Err(error) => return Err(error.attribute(record)),
        }
    }
}

/// Collects every page of records in the given states.
pub fn find_all_by_state(
    store: &dyn ServiceStore,
    states: &[ServiceState],
    page_size: usize,
) -> PersistenceResult<Vec<ServiceRecord>> {
    let mut page = PageRequest::new(0, page_size);
    let mut records = Vec::new();
    loop {
        let result = store.find_by_state(states, page)?;
        let is_last = result.is_last();
        records.extend(result.result_list);
        if is_last {
            return Ok(records);
        }
        page = page.next();
    }
}

pub(crate) fn missing_record_error(id: ServiceId) -> CoreError {
    CoreError {
        service: Some(id),
        service_name: None,
        kind: CoreErrorKind::InvalidInput,
        message: format!("unknown service id '{id}'"),
    }
}
