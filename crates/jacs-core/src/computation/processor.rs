use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::computation::{
    ComputationFuture, ComputationResult, PipelinePolicy, ServiceComputation, ServiceContext,
    run_pipeline,
};
use crate::models::{CoreError, CoreErrorKind, ServiceEventType, ServiceRecord};

/// A computation split into prepare, local processing and result retrieval.
///
/// `ProcessorComputation` skips `local_process_data` whenever
/// `is_result_available` already holds, which makes re-runs idempotent.
pub trait ServiceProcessor: Send + Sync + 'static {
    type Prepared: Send + Sync + 'static;
    type Output: Serialize + DeserializeOwned + Send + Sync + 'static;

    fn prepare<'a>(
        &'a mut self,
        ctx: &'a ServiceContext,
        record: &'a ServiceRecord,
    ) -> ComputationFuture<'a, Self::Prepared>;

    fn is_result_available<'a>(
        &'a self,
        prepared: &'a Self::Prepared,
        record: &'a ServiceRecord,
    ) -> ComputationFuture<'a, bool>;

    fn local_process_data<'a>(
        &'a mut self,
        ctx: &'a ServiceContext,
        prepared: &'a Self::Prepared,
        record: ServiceRecord,
    ) -> ComputationFuture<'a, ServiceRecord>;

    fn retrieve_result<'a>(
        &'a self,
        prepared: &'a Self::Prepared,
        record: &'a ServiceRecord,
    ) -> ComputationFuture<'a, Self::Output>;
}

pub struct ProcessorComputation<P: ServiceProcessor> {
    processor: P,
    prepared: Option<P::Prepared>,
}

impl<P: ServiceProcessor> ProcessorComputation<P> {
    pub fn new(processor: P) -> Self {
        Self {
            processor,
            prepared: None,
        }
    }

    pub fn processor(&self) -> &P {
        &self.processor
    }
}

impl<P: ServiceProcessor> ServiceComputation for ProcessorComputation<P> {
    fn pre_process_data<'a>(
        &'a mut self,
        ctx: &'a ServiceContext,
        record: ServiceRecord,
    ) -> ComputationFuture<'a, ServiceRecord> {
        Box::pin(async move {
            let record = ctx.resolve_parameters(record).await?;
            let prepared = self.processor.prepare(ctx, &record).await?;
            self.prepared = Some(prepared);
            Ok(record)
        })
    }

    fn process_data<'a>(
        &'a mut self,
        ctx: &'a ServiceContext,
        record: ServiceRecord,
    ) -> ComputationFuture<'a, ServiceRecord> {
        Box::pin(async move {
            let prepared = self
                .prepared
                .as_ref()
                .ok_or_else(|| not_prepared(&record))?;

            if self.processor.is_result_available(prepared, &record).await? {
                tracing::info!(
                    service_id = %record.display_id(),
                    service_name = %record.name,
                    "result already available, skipping local processing"
                );
                let mut record = record;
                record.add_event(
                    ServiceEventType::Started,
                    "result already available, local processing skipped",
                );
                return Ok(record);
            }

            self.processor.local_process_data(ctx, prepared, record).await
        })
    }

    fn is_done<'a>(
        &'a mut self,
        ctx: &'a ServiceContext,
        record: ServiceRecord,
    ) -> ComputationFuture<'a, ServiceRecord> {
        Box::pin(async move {
            let prepared = self
                .prepared
                .as_ref()
                .ok_or_else(|| not_prepared(&record))?;
            let output = retrieve_result_when_ready(&self.processor, ctx, prepared, &record).await?;

            let mut record = record;
            record.set_result(&output)?;
            Ok(record)
        })
    }
}

/// Polls `is_result_available` up to `ctx.result_retries()` times before
/// retrieving the result. Running out of retries is a `Timeout`.
pub async fn retrieve_result_when_ready<P: ServiceProcessor>(
    processor: &P,
    ctx: &ServiceContext,
    prepared: &P::Prepared,
    record: &ServiceRecord,
) -> ComputationResult<P::Output> {
    let retries = ctx.result_retries().max(1);
    for attempt in 1..=retries {
        ctx.check_cancelled(record)?;
        if processor.is_result_available(prepared, record).await? {
            return processor.retrieve_result(prepared, record).await;
        }
        tracing::debug!(
            service_id = %record.display_id(),
            attempt,
            retries,
            "result not available yet"
        );
        if attempt < retries {
            ctx.sleep(record, ctx.result_retry_wait()).await?;
        }
    }

    Err(CoreError::for_record(
        record,
        CoreErrorKind::Timeout,
        format!(
            "results of service {} could not be retrieved after {retries} attempts",
            record.display_id()
        ),
    ))
}

/// Runs `processor` through the full pipeline and returns its typed result.
pub async fn run_processor<P: ServiceProcessor>(
    processor: P,
    ctx: &ServiceContext,
    record: ServiceRecord,
    policy: PipelinePolicy,
) -> ComputationResult<P::Output> {
    let mut computation = ProcessorComputation::new(processor);
    let outcome = run_pipeline(&mut computation, ctx, record, policy).await;
    if let Some(error) = outcome.error {
        return Err(error);
    }
    outcome.record.get_result::<P::Output>()?.ok_or_else(|| {
        CoreError::for_record(
            &outcome.record,
            CoreErrorKind::Internal,
            "processor completed without a result",
        )
    })
}

fn not_prepared(record: &ServiceRecord) -> CoreError {
    CoreError::for_record(
        record,
        CoreErrorKind::Internal,
        "processor was not prepared before processing",
    )
}
