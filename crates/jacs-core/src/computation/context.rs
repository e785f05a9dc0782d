use std::sync::Arc;
use std::time::Duration;

use crate::computation::{ComputationFuture, ComputationResult};
use crate::config::DispatcherConfig;
use crate::models::{CoreError, CoreErrorKind, ServiceMetaData, ServiceRecord};
use crate::orchestration::CancellationToken;
use crate::persistence::{PersistenceResult, ServiceStore, missing_record_error, run_blocking};

/// Queues new records for execution. Implemented by the dispatcher.
pub trait ServiceSubmitter: Send + Sync {
    fn submit_service<'a>(
        &'a self,
        record: ServiceRecord,
        parent: Option<&'a ServiceRecord>,
    ) -> ComputationFuture<'a, ServiceRecord>;
}

/// Everything a running computation may reach outside its own record.
#[derive(Clone)]
pub struct ServiceContext {
    store: Arc<dyn ServiceStore>,
    metadata: Arc<ServiceMetaData>,
    submitter: Option<Arc<dyn ServiceSubmitter>>,
    token: CancellationToken,
    readiness_poll_interval: Duration,
    result_retries: u32,
    result_retry_wait: Duration,
}

impl ServiceContext {
    pub fn new(store: Arc<dyn ServiceStore>, metadata: Arc<ServiceMetaData>) -> Self {
        Self::from_config(store, metadata, &DispatcherConfig::default())
    }

    pub fn from_config(
        store: Arc<dyn ServiceStore>,
        metadata: Arc<ServiceMetaData>,
        config: &DispatcherConfig,
    ) -> Self {
        Self {
            store,
            metadata,
            submitter: None,
            token: CancellationToken::new(),
            readiness_poll_interval: config.readiness_poll_interval,
            result_retries: config.result_retries,
            result_retry_wait: config.result_retry_wait,
        }
    }

    pub fn with_submitter(mut self, submitter: Arc<dyn ServiceSubmitter>) -> Self {
        self.submitter = Some(submitter);
        self
    }

    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn with_readiness_poll_interval(mut self, interval: Duration) -> Self {
        self.readiness_poll_interval = interval;
        self
    }

    pub fn with_result_retries(mut self, retries: u32, wait: Duration) -> Self {
        self.result_retries = retries;
        self.result_retry_wait = wait;
        self
    }

    pub fn store(&self) -> &Arc<dyn ServiceStore> {
        &self.store
    }

    pub fn metadata(&self) -> &ServiceMetaData {
        &self.metadata
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn readiness_poll_interval(&self) -> Duration {
        self.readiness_poll_interval
    }

    pub fn result_retries(&self) -> u32 {
        self.result_retries
    }

    pub fn result_retry_wait(&self) -> Duration {
        self.result_retry_wait
    }

    pub fn check_cancelled(&self, record: &ServiceRecord) -> ComputationResult<()> {
        if self.token.is_cancelled() {
            return Err(cancelled_error(record));
        }
        Ok(())
    }

    /// Sleeps for `duration`, returning early with `Cancelled` if the token fires.
    pub async fn sleep(&self, record: &ServiceRecord, duration: Duration) -> ComputationResult<()> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.token.cancelled() => Err(cancelled_error(record)),
        }
    }

    pub async fn resolve_parameters(&self, record: ServiceRecord) -> ComputationResult<ServiceRecord> {
        let parameters = self
            .metadata
            .resolve_parameters(&record.parameters)
            .map_err(|error| error.attribute(&record))?;
        Ok(ServiceRecord {
            parameters,
            ..record
        })
    }

    pub async fn wait_for_dependencies(
        &self,
        record: ServiceRecord,
    ) -> ComputationResult<ServiceRecord> {
        if record.dependency_ids.is_empty() {
            return Ok(record);
        }

        loop {
            self.check_cancelled(&record)?;

            let dependency_ids = record.dependency_ids.clone();
            let dependencies = run_blocking(&self.store, "find_by_id", move |store| {
                dependency_ids
                    .iter()
                    .map(|id| store.find_by_id(*id)?.ok_or_else(|| missing_record_error(*id)))
                    .collect::<PersistenceResult<Vec<_>>>()
            })
            .await
            .map_err(|error| error.attribute(&record))?;

            let failed: Vec<String> = dependencies
                .iter()
                .filter(|dependency| dependency.has_completed_unsuccessfully())
                .map(|dependency| {
                    format!("{} ({})", dependency.display_id(), dependency.state.as_str())
                })
                .collect();
            if !failed.is_empty() {
                return Err(CoreError::for_record(
                    &record,
                    CoreErrorKind::DependencyFailure,
                    format!(
                        "dependencies finished unsuccessfully: {}",
                        failed.join(", ")
                    ),
                ));
            }

            let pending = dependencies
                .iter()
                .filter(|dependency| !dependency.has_completed())
                .count();
            if pending == 0 {
                return Ok(record);
            }

            tracing::debug!(
                service_id = %record.display_id(),
                service_name = %record.name,
                pending,
                "waiting for dependencies"
            );
            self.sleep(&record, self.readiness_poll_interval).await?;
        }
    }

    /// Waits until every child of `record` is terminal and returns them in id order.
    ///
    /// Fails with `DependencyFailure` as soon as any child finishes unsuccessfully.
    pub async fn wait_for_children(
        &self,
        record: &ServiceRecord,
    ) -> ComputationResult<Vec<ServiceRecord>> {
        let parent_id = record.required_id()?;
        loop {
            self.check_cancelled(record)?;

            let children = run_blocking(&self.store, "find_child_services", move |store| {
                store.find_child_services(parent_id)
            })
            .await
            .map_err(|error| error.attribute(record))?;

            if let Some(failed) = children
                .iter()
                .find(|child| child.has_completed_unsuccessfully())
            {
                return Err(CoreError::for_record(
                    record,
                    CoreErrorKind::DependencyFailure,
                    format!(
                        "child service {} '{}' finished as {}",
                        failed.display_id(),
                        failed.name,
                        failed.state.as_str()
                    ),
                ));
            }

            if children.iter().all(ServiceRecord::has_completed) {
                return Ok(children);
            }

            self.sleep(record, self.readiness_poll_interval).await?;
        }
    }

    /// Submits `child` under `parent`. The parent's own state is left untouched.
    pub async fn submit_child(
        &self,
        parent: &ServiceRecord,
        child: ServiceRecord,
    ) -> ComputationResult<ServiceRecord> {
        let Some(submitter) = &self.submitter else {
            return Err(CoreError::for_record(
                parent,
                CoreErrorKind::Internal,
                "no service submitter is attached to this context",
            ));
        };
        submitter.submit_service(child, Some(parent)).await
    }
}

fn cancelled_error(record: &ServiceRecord) -> CoreError {
    CoreError::for_record(
        record,
        CoreErrorKind::Cancelled,
        format!("service {} was cancelled", record.display_id()),
    )
}
