use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;

use crate::computation::{
    ComputationFuture, PipelineOutcome, PipelinePolicy, ServiceContext, ServiceSubmitter,
    run_pipeline,
};
use crate::config::DispatcherConfig;
use crate::models::{
    CoreError, CoreErrorKind, CoreResult, ServerStats, ServiceEventType, ServiceId, ServiceRecord,
    ServiceState,
};
use crate::orchestration::CancellationToken;
use crate::persistence::{
    ServiceStore, find_all_by_state, missing_record_error, run_blocking, update_with_retry,
};
use crate::registry::ServiceRegistry;

/// What a single scheduling pass did.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DispatchPass {
    /// Slots were exhausted; the queue was left untouched.
    NoAvailableSlots { waiting: usize },
    Idle,
    Dispatched(Vec<ServiceId>),
}

/// Admits queued services into bounded concurrent execution.
///
/// Cloning is cheap; clones share the queue, slots and running set.
#[derive(Clone)]
pub struct ServiceDispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    registry: Arc<ServiceRegistry>,
    store: Arc<dyn ServiceStore>,
    config: DispatcherConfig,
    state: Mutex<DispatcherState>,
    wakeup: Notify,
    settled: Notify,
}

struct DispatcherState {
    available_slots: i64,
    queue: VecDeque<ServiceRecord>,
    queued_ids: HashSet<ServiceId>,
    running: HashMap<ServiceId, CancellationToken>,
    /// Ids whose `CANCELED` state is being persisted; never queued meanwhile.
    cancelling: HashSet<ServiceId>,
}

/// Moves a fresh record to `QUEUED`, linking it under `parent` when given.
///
/// The returned record is ready to be saved; nothing is persisted here.
pub fn prepare_submission(
    mut record: ServiceRecord,
    parent: Option<&ServiceRecord>,
) -> CoreResult<ServiceRecord> {
    if record.id.is_some() || record.state != ServiceState::Created {
        return Err(CoreError::for_record(
            &record,
            CoreErrorKind::InvalidInput,
            format!(
                "service {} was already submitted (state {})",
                record.display_id(),
                record.state.as_str()
            ),
        ));
    }

    if let Some(parent) = parent {
        parent.required_id()?;
        record.update_parent(parent);
    }

    record.add_event(ServiceEventType::Created, "service record created");
    record.transition_to(ServiceState::Queued)?;
    record.add_event(ServiceEventType::Queued, "queued for dispatch");
    Ok(record)
}

impl ServiceDispatcher {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        store: Arc<dyn ServiceStore>,
        config: DispatcherConfig,
    ) -> Self {
        let available_slots = config.available_slots;
        Self {
            inner: Arc::new(DispatcherInner {
                registry,
                store,
                config,
                state: Mutex::new(DispatcherState {
                    available_slots,
                    queue: VecDeque::new(),
                    queued_ids: HashSet::new(),
                    running: HashMap::new(),
                    cancelling: HashSet::new(),
                }),
                wakeup: Notify::new(),
                settled: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.inner.registry
    }

    pub fn store(&self) -> &Arc<dyn ServiceStore> {
        &self.inner.store
    }

    /// Persists `record` as `QUEUED` and appends it to the in-memory queue.
    pub async fn submit_service_async(
        &self,
        record: ServiceRecord,
        parent: Option<&ServiceRecord>,
    ) -> CoreResult<ServiceRecord> {
        let record = prepare_submission(record, parent)?;
        let saved = run_blocking(&self.inner.store, "save", move |store| store.save(&record))
            .await
            .inspect_err(|error| {
                tracing::error!(
                    service_name = ?error.service_name,
                    kind = ?error.kind,
                    message = %error.message,
                    "failed to persist submitted service"
                );
            })?;
        let id = saved.required_id()?;

        {
            let mut state = self.lock_state()?;
            // a sync may already have merged and admitted the saved record
            if !state.running.contains_key(&id)
                && !state.cancelling.contains(&id)
                && state.queued_ids.insert(id)
            {
                state.queue.push_back(saved.clone());
            }
        }
        self.inner.wakeup.notify_one();

        tracing::info!(
            service_id = %id,
            service_name = %saved.name,
            parent_id = ?saved.parent_id,
            "service submitted"
        );
        Ok(saved)
    }

    pub async fn submit_async(
        &self,
        service_name: &str,
        parameters: impl IntoIterator<Item = (String, Value)>,
        parent: Option<&ServiceRecord>,
    ) -> CoreResult<ServiceRecord> {
        let record = ServiceRecord::new(service_name).parameters(parameters.into_iter().collect());
        self.submit_service_async(record, parent).await
    }

    /// Admits queued records in FIFO order while free slots remain.
    pub fn dispatch_services(&self) -> CoreResult<DispatchPass> {
        let admitted = {
            let mut state = self.lock_state()?;
            if state.available_slots <= 0 {
                let waiting = state.queue.len();
                if waiting > 0 {
                    tracing::info!(
                        waiting,
                        available_slots = state.available_slots,
                        "no available processing slots"
                    );
                }
                return Ok(DispatchPass::NoAvailableSlots { waiting });
            }

            let mut admitted = Vec::new();
            while state.available_slots > 0 {
                let Some(record) = state.queue.pop_front() else {
                    break;
                };
                let Some(id) = record.id else {
                    continue;
                };
                state.queued_ids.remove(&id);
                if state.running.contains_key(&id) || state.cancelling.contains(&id) {
                    tracing::debug!(service_id = %id, "dropping stale queue entry");
                    continue;
                }
                state.available_slots -= 1;
                let token = CancellationToken::new();
                state.running.insert(id, token.clone());
                admitted.push((id, record, token));
            }
            admitted
        };

        if admitted.is_empty() {
            return Ok(DispatchPass::Idle);
        }

        let mut ids = Vec::with_capacity(admitted.len());
        for (id, record, token) in admitted {
            tracing::debug!(service_id = %id, service_name = %record.name, "admitting service");
            ids.push(id);
            tokio::spawn(self.clone().run_service(id, record, token));
        }
        Ok(DispatchPass::Dispatched(ids))
    }

    /// Merges pending persisted records that are not tracked in memory.
    ///
    /// Returns how many records were added to the queue.
    pub async fn sync_service_queue(&self) -> CoreResult<usize> {
        let page_size = self.inner.config.sync_page_size;
        let pending = run_blocking(&self.inner.store, "find_by_state", move |store| {
            find_all_by_state(store, &ServiceState::PENDING, page_size)
        })
        .await?;

        let merged = {
            let mut state = self.lock_state()?;
            let mut merged = 0;
            for record in pending {
                let Some(id) = record.id else {
                    continue;
                };
                if state.queued_ids.contains(&id)
                    || state.running.contains_key(&id)
                    || state.cancelling.contains(&id)
                {
                    continue;
                }
                state.queued_ids.insert(id);
                state.queue.push_back(record);
                merged += 1;
            }
            merged
        };

        if merged > 0 {
            tracing::info!(merged, "recovered pending services from the store");
            self.inner.wakeup.notify_one();
        } else {
            tracing::debug!("service queue already in sync with the store");
        }
        Ok(merged)
    }

    /// Sets the number of free slots. Services already running return
    /// their slot on settlement on top of `slots`.
    pub fn set_available_slots(&self, slots: i64) -> CoreResult<()> {
        {
            let mut state = self.lock_state()?;
            state.available_slots = slots;
        }
        self.inner.wakeup.notify_one();
        Ok(())
    }

    pub fn available_slots(&self) -> CoreResult<i64> {
        Ok(self.lock_state()?.available_slots)
    }

    pub fn server_stats(&self) -> CoreResult<ServerStats> {
        let state = self.lock_state()?;
        let mut running_services: Vec<ServiceId> = state.running.keys().copied().collect();
        running_services.sort_unstable();
        Ok(ServerStats {
            available_slots: state.available_slots,
            waiting_services: state.queue.iter().filter_map(|record| record.id).collect(),
            running_services,
        })
    }

    /// Cancels a service. Queued records are settled as `CANCELED` at once;
    /// running ones observe the request between stages.
    pub async fn cancel_service(&self, id: ServiceId) -> CoreResult<ServiceRecord> {
        let running = {
            let mut state = self.lock_state()?;
            if let Some(token) = state.running.get(&id) {
                token.cancel();
                true
            } else {
                if state.queued_ids.remove(&id) {
                    state.queue.retain(|record| record.id != Some(id));
                }
                state.cancelling.insert(id);
                false
            }
        };

        if running {
            let record = self.load(id).await?;
            tracing::info!(
                service_id = %id,
                service_name = %record.name,
                state = record.state.as_str(),
                "cancellation requested"
            );
            return Ok(record);
        }

        let cancelled = self.cancel_pending(id).await;
        match self.lock_state() {
            Ok(mut state) => {
                state.cancelling.remove(&id);
            }
            Err(error) => tracing::error!(
                service_id = %id,
                message = %error.message,
                "could not clear pending cancellation"
            ),
        }
        cancelled
    }

    async fn cancel_pending(&self, id: ServiceId) -> CoreResult<ServiceRecord> {
        let mut record = self.load(id).await?;
        if record.has_completed() {
            return Ok(record);
        }

        record.transition_to(ServiceState::Canceled)?;
        record.error_message = Some("cancelled before execution".to_string());
        record.add_event(ServiceEventType::Canceled, "cancelled before execution");
        self.persist(&record).await?;
        self.inner.settled.notify_waiters();

        tracing::info!(service_id = %id, service_name = %record.name, "service cancelled");
        Ok(record)
    }

    async fn load(&self, id: ServiceId) -> CoreResult<ServiceRecord> {
        run_blocking(&self.inner.store, "find_by_id", move |store| {
            store.find_by_id(id)
        })
        .await?
        .ok_or_else(|| missing_record_error(id))
    }

    /// Resolves with the persisted record once it reaches a terminal state.
    pub async fn wait_for_terminal(
        &self,
        id: ServiceId,
        timeout_duration: Option<Duration>,
    ) -> CoreResult<ServiceRecord> {
        match timeout_duration {
            Some(duration) => tokio::time::timeout(duration, self.await_terminal(id))
                .await
                .map_err(|_| CoreError {
                    service: Some(id),
                    service_name: None,
                    kind: CoreErrorKind::Timeout,
                    message: format!("timed out waiting for service '{id}' to finish"),
                })?,
            None => self.await_terminal(id).await,
        }
    }

    async fn await_terminal(&self, id: ServiceId) -> CoreResult<ServiceRecord> {
        loop {
            let notified = self.inner.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let record = self.load(id).await?;
            if record.has_completed() {
                return Ok(record);
            }

            // settlements wake us; the poll covers other writers of the store
            let _ = tokio::time::timeout(self.inner.config.dispatch_interval, notified).await;
        }
    }

    /// Drives the dispatcher until `shutdown` resolves.
    ///
    /// Services already running keep running on their own tasks.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) {
        let mut dispatch_tick = tokio::time::interval(self.inner.config.dispatch_interval);
        dispatch_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sync_tick = tokio::time::interval(self.inner.config.sync_interval);
        sync_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        tracing::info!(
            available_slots = self.inner.config.available_slots,
            services = ?self.inner.registry.service_names(),
            "service dispatcher started"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = sync_tick.tick() => {
                    if let Err(error) = self.sync_service_queue().await {
                        tracing::error!(
                            kind = ?error.kind,
                            message = %error.message,
                            "service queue sync failed"
                        );
                    }
                    self.dispatch_logged();
                }
                _ = dispatch_tick.tick() => self.dispatch_logged(),
                _ = self.inner.wakeup.notified() => self.dispatch_logged(),
            }
        }

        tracing::info!("service dispatcher stopped");
    }

    fn dispatch_logged(&self) {
        if let Err(error) = self.dispatch_services() {
            tracing::error!(
                kind = ?error.kind,
                message = %error.message,
                "dispatch pass failed"
            );
        }
    }

    async fn run_service(self, id: ServiceId, record: ServiceRecord, token: CancellationToken) {
        match self.execute(record, token).await {
            Ok(record) => tracing::info!(
                service_id = %id,
                service_name = %record.name,
                state = record.state.as_str(),
                "service settled"
            ),
            Err(error) => tracing::error!(
                service_id = %id,
                service_name = ?error.service_name,
                kind = ?error.kind,
                message = %error.message,
                "service could not be settled; it stays recoverable in the store"
            ),
        }

        self.release_slot(id);
        self.inner.settled.notify_waiters();
        self.dispatch_logged();
    }

    async fn execute(
        &self,
        record: ServiceRecord,
        token: CancellationToken,
    ) -> CoreResult<ServiceRecord> {
        let id = record.required_id()?;
        let mut record = self.load(id).await?;

        if record.has_completed() {
            tracing::debug!(
                service_id = %id,
                state = record.state.as_str(),
                "skipping service that already finished"
            );
            return Ok(record);
        }

        if token.is_cancelled() {
            let error = CoreError::for_record(
                &record,
                CoreErrorKind::Cancelled,
                "cancelled before execution",
            );
            return self.settle(record, Some(error)).await;
        }

        let descriptor = match self.inner.registry.lookup(&record.name) {
            Ok(descriptor) => descriptor.clone(),
            Err(error) => {
                let error = error.attribute(&record);
                return self.settle(record, Some(error)).await;
            }
        };

        let recovered = record.state == ServiceState::Running;
        record.transition_to(ServiceState::Running)?;
        if record.working_directory.is_none() {
            record.working_directory = Some(self.default_working_directory(&record, id));
        }
        record.process_started_at = Some(SystemTime::now());
        if recovered {
            record.add_event(
                ServiceEventType::Recovered,
                "restarted after being found running in the store",
            );
        } else {
            record.add_event(ServiceEventType::Started, "processing started");
        }
        self.persist(&record).await?;

        tracing::info!(
            service_id = %id,
            service_name = %record.name,
            recovered,
            "service started"
        );

        let submitter: Arc<dyn ServiceSubmitter> = Arc::new(self.clone());
        let ctx = ServiceContext::from_config(
            self.inner.store.clone(),
            descriptor.shared_metadata(),
            &self.inner.config,
        )
        .with_submitter(submitter)
        .with_token(token.clone());
        let policy = PipelinePolicy {
            readiness: self.inner.config.readiness_policy,
            completion_timeout: self.inner.config.service_timeout,
        };
        let mut computation = descriptor.create_computation_instance();
        let started = record.clone();

        let handle = tokio::spawn(async move {
            run_pipeline(computation.as_mut(), &ctx, started, policy).await
        });
        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(join_error) => PipelineOutcome {
                error: Some(CoreError::for_record(
                    &record,
                    CoreErrorKind::Internal,
                    format!("service computation panicked: {join_error}"),
                )),
                record,
            },
        };

        let PipelineOutcome {
            record: mut finished,
            mut error,
        } = outcome;
        if error.is_none() && token.is_cancelled() {
            error = Some(CoreError::for_record(
                &finished,
                CoreErrorKind::Cancelled,
                "cancelled while running",
            ));
        }
        // stages never own the lifecycle state
        finished.state = ServiceState::Running;
        self.settle(finished, error).await
    }

    async fn settle(
        &self,
        mut record: ServiceRecord,
        error: Option<CoreError>,
    ) -> CoreResult<ServiceRecord> {
        let id = record.required_id()?;
        let persisted = run_blocking(&self.inner.store, "find_by_id", move |store| {
            store.find_by_id(id)
        })
        .await?;
        if let Some(persisted) = persisted
            && persisted.has_completed()
        {
            tracing::debug!(
                service_id = %id,
                state = persisted.state.as_str(),
                "keeping terminal state already persisted"
            );
            return Ok(persisted);
        }

        match error {
            None => {
                record.transition_to(ServiceState::Successful)?;
                record.add_event(ServiceEventType::Completed, "completed successfully");
            }
            Some(error) if error.is_cancellation() => {
                tracing::warn!(
                    service_id = %id,
                    service_name = %record.name,
                    message = %error.message,
                    "service cancelled"
                );
                record.transition_to(ServiceState::Canceled)?;
                record.add_event(ServiceEventType::Canceled, error.message.clone());
                record.error_message = Some(error.message);
            }
            Some(error) => {
                tracing::error!(
                    service_id = %id,
                    service_name = %record.name,
                    kind = ?error.kind,
                    message = %error.message,
                    "service failed"
                );
                let event_type = if error.kind == CoreErrorKind::Timeout {
                    ServiceEventType::Timeout
                } else {
                    ServiceEventType::Failed
                };
                let message = error.to_string();
                record.transition_to(ServiceState::Error)?;
                record.add_event(event_type, message.clone());
                record.error_message = Some(message);
            }
        }

        self.persist(&record).await?;
        Ok(record)
    }

    async fn persist(&self, record: &ServiceRecord) -> CoreResult<()> {
        update_with_retry(
            &self.inner.store,
            record,
            self.inner.config.persistence_retries,
            self.inner.config.persistence_retry_backoff,
        )
        .await
        .inspect_err(|error| {
            tracing::error!(
                service_id = %record.display_id(),
                service_name = %record.name,
                state = record.state.as_str(),
                message = %error.message,
                "failed to persist service record"
            );
        })
    }

    fn default_working_directory(&self, record: &ServiceRecord, id: ServiceId) -> PathBuf {
        self.inner
            .config
            .default_working_dir
            .join(format!("{}_{}", record.name, id))
    }

    fn release_slot(&self, id: ServiceId) {
        match self.lock_state() {
            Ok(mut state) => {
                if state.running.remove(&id).is_some() {
                    state.available_slots += 1;
                }
            }
            Err(error) => tracing::error!(
                service_id = %id,
                message = %error.message,
                "could not release processing slot"
            ),
        }
    }

    fn lock_state(&self) -> CoreResult<MutexGuard<'_, DispatcherState>> {
        self.inner.state.lock().map_err(|_| {
            CoreError::new(CoreErrorKind::Internal, "dispatcher state mutex poisoned")
        })
    }
}

impl ServiceSubmitter for ServiceDispatcher {
    fn submit_service<'a>(
        &'a self,
        record: ServiceRecord,
        parent: Option<&'a ServiceRecord>,
    ) -> ComputationFuture<'a, ServiceRecord> {
        Box::pin(self.submit_service_async(record, parent))
    }
}
