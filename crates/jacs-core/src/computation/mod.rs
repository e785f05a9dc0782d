pub mod context;
pub mod pipeline;
pub mod processor;
pub mod staged;

pub use context::{ServiceContext, ServiceSubmitter};
pub use pipeline::{PipelineOutcome, PipelinePolicy, run_pipeline};
pub use processor::{
    ProcessorComputation, ServiceProcessor, retrieve_result_when_ready, run_processor,
};
pub use staged::{PostProcessFn, StageFn, StagedComputation, stage};

use std::future::Future;
use std::pin::Pin;

use crate::models::{CoreError, ServiceRecord};

pub type ComputationResult<T> = Result<T, CoreError>;

pub type ComputationFuture<'a, T> =
    Pin<Box<dyn Future<Output = ComputationResult<T>> + Send + 'a>>;

pub type PostProcessFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// The staged lifecycle of one service run.
///
/// Each stage receives the record produced by the previous one. The dispatcher
/// creates a fresh instance per run and drops it after `post_process_data`.
pub trait ServiceComputation: Send {
    /// Validates parameters against the service metadata and applies defaults.
    fn pre_process_data<'a>(
        &'a mut self,
        ctx: &'a ServiceContext,
        record: ServiceRecord,
    ) -> ComputationFuture<'a, ServiceRecord> {
        Box::pin(ctx.resolve_parameters(record))
    }

    /// Waits until every dependency has completed successfully.
    fn is_ready<'a>(
        &'a mut self,
        ctx: &'a ServiceContext,
        record: ServiceRecord,
    ) -> ComputationFuture<'a, ServiceRecord> {
        Box::pin(ctx.wait_for_dependencies(record))
    }

    fn process_data<'a>(
        &'a mut self,
        ctx: &'a ServiceContext,
        record: ServiceRecord,
    ) -> ComputationFuture<'a, ServiceRecord>;

    fn is_done<'a>(
        &'a mut self,
        _ctx: &'a ServiceContext,
        record: ServiceRecord,
    ) -> ComputationFuture<'a, ServiceRecord> {
        Box::pin(async move { Ok(record) })
    }

    /// Runs exactly once per run, after success or any failure.
    fn post_process_data<'a>(
        &'a mut self,
        _ctx: &'a ServiceContext,
        _record: &'a ServiceRecord,
        _error: Option<&'a CoreError>,
    ) -> PostProcessFuture<'a> {
        Box::pin(async {})
    }
}
