use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, SystemTime};

use futures::FutureExt;

use crate::computation::{ComputationFuture, ComputationResult, ServiceComputation, ServiceContext};
use crate::config::ReadinessPolicy;
use crate::models::{CoreError, CoreErrorKind, ServiceRecord};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PipelinePolicy {
    pub readiness: ReadinessPolicy,
    /// Bounds the completion stage, measured from the record's process start.
    pub completion_timeout: Option<Duration>,
}

#[derive(Clone, Debug)]
pub struct PipelineOutcome {
    /// The last record a stage produced.
    pub record: ServiceRecord,
    pub error: Option<CoreError>,
}

impl PipelineOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Runs pre-process, readiness, process and completion in order, then
/// post-process exactly once with the first failure, if any.
pub async fn run_pipeline(
    computation: &mut dyn ServiceComputation,
    ctx: &ServiceContext,
    record: ServiceRecord,
    policy: PipelinePolicy,
) -> PipelineOutcome {
    let mut current = record;
    let error = run_stages(computation, ctx, &mut current, policy)
        .await
        .err()
        .map(|error| error.attribute(&current));

    let post_process = computation.post_process_data(ctx, &current, error.as_ref());
    if let Err(payload) = AssertUnwindSafe(post_process).catch_unwind().await {
        tracing::error!(
            service_id = %current.display_id(),
            service_name = %current.name,
            panic = %panic_message(payload.as_ref()),
            "post-process stage panicked"
        );
    }

    PipelineOutcome {
        record: current,
        error,
    }
}

async fn run_stages(
    computation: &mut dyn ServiceComputation,
    ctx: &ServiceContext,
    current: &mut ServiceRecord,
    policy: PipelinePolicy,
) -> ComputationResult<()> {
    ctx.check_cancelled(current)?;
    let pre_process = computation.pre_process_data(ctx, current.clone());
    let prepared = guarded(pre_process, current, "pre-process").await?;
    *current = prepared;

    ctx.check_cancelled(current)?;
    let readiness = guarded(computation.is_ready(ctx, current.clone()), current, "readiness");
    let ready = match policy.readiness {
        ReadinessPolicy::WaitIndefinitely => readiness.await?,
        ReadinessPolicy::Deadline(limit) => {
            with_deadline(limit, readiness, current, "readiness").await?
        }
    };
    *current = ready;

    ctx.check_cancelled(current)?;
    let process = computation.process_data(ctx, current.clone());
    let processed = guarded(process, current, "process").await?;
    *current = processed;

    ctx.check_cancelled(current)?;
    let completion = guarded(computation.is_done(ctx, current.clone()), current, "completion");
    let done = match current.timeout.or(policy.completion_timeout) {
        Some(limit) => {
            let elapsed = current
                .process_started_at
                .and_then(|started_at| SystemTime::now().duration_since(started_at).ok())
                .unwrap_or_default();
            with_deadline(limit.saturating_sub(elapsed), completion, current, "completion").await?
        }
        None => completion.await?,
    };
    *current = done;

    Ok(())
}

/// Turns a panic inside `stage` into an `Internal` error.
async fn guarded(
    stage: ComputationFuture<'_, ServiceRecord>,
    record: &ServiceRecord,
    stage_name: &str,
) -> ComputationResult<ServiceRecord> {
    match AssertUnwindSafe(stage).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(CoreError::for_record(
            record,
            CoreErrorKind::Internal,
            format!(
                "service computation panicked in {stage_name} stage: {}",
                panic_message(payload.as_ref())
            ),
        )),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        return message;
    }
    payload
        .downcast_ref::<String>()
        .map(String::as_str)
        .unwrap_or("non-string panic payload")
}

async fn with_deadline(
    limit: Duration,
    stage: impl Future<Output = ComputationResult<ServiceRecord>>,
    record: &ServiceRecord,
    stage_name: &str,
) -> ComputationResult<ServiceRecord> {
    match tokio::time::timeout(limit, stage).await {
        Ok(result) => result,
        Err(_) => Err(CoreError::for_record(
            record,
            CoreErrorKind::Timeout,
            format!(
                "service {} {stage_name} stage exceeded {}ms",
                record.display_id(),
                limit.as_millis()
            ),
        )),
    }
}
