use std::future::Future;
use std::sync::Arc;

use crate::computation::{
    ComputationFuture, ComputationResult, PostProcessFuture, ServiceComputation, ServiceContext,
};
use crate::models::{CoreError, ServiceRecord};

pub type StageFn =
    Arc<dyn Fn(ServiceRecord) -> ComputationFuture<'static, ServiceRecord> + Send + Sync>;

pub type PostProcessFn =
    Arc<dyn Fn(ServiceRecord, Option<CoreError>) -> PostProcessFuture<'static> + Send + Sync>;

/// Wraps an async closure as a pipeline stage.
pub fn stage<F, Fut>(operation: F) -> StageFn
where
    F: Fn(ServiceRecord) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ComputationResult<ServiceRecord>> + Send + 'static,
{
    Arc::new(move |record| Box::pin(operation(record)))
}

/// A computation assembled from independent stage closures.
///
/// Stages left unset fall back to the trait defaults, so a caller only
/// supplies the behaviour it cares about.
#[derive(Clone)]
pub struct StagedComputation {
    pre_process: Option<StageFn>,
    is_ready: Option<StageFn>,
    process: StageFn,
    is_done: Option<StageFn>,
    post_process: Option<PostProcessFn>,
}

impl StagedComputation {
    pub fn new(process: StageFn) -> Self {
        Self {
            pre_process: None,
            is_ready: None,
            process,
            is_done: None,
            post_process: None,
        }
    }

    pub fn with_pre_process(mut self, stage: StageFn) -> Self {
        self.pre_process = Some(stage);
        self
    }

    pub fn with_readiness(mut self, stage: StageFn) -> Self {
        self.is_ready = Some(stage);
        self
    }

    pub fn with_completion(mut self, stage: StageFn) -> Self {
        self.is_done = Some(stage);
        self
    }

    pub fn with_post_process<F, Fut>(mut self, operation: F) -> Self
    where
        F: Fn(ServiceRecord, Option<CoreError>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.post_process = Some(Arc::new(move |record, error| {
            Box::pin(operation(record, error))
        }));
        self
    }
}

impl ServiceComputation for StagedComputation {
    fn pre_process_data<'a>(
        &'a mut self,
        ctx: &'a ServiceContext,
        record: ServiceRecord,
    ) -> ComputationFuture<'a, ServiceRecord> {
        match &self.pre_process {
            Some(stage) => stage(record),
            None => Box::pin(ctx.resolve_parameters(record)),
        }
    }

    fn is_ready<'a>(
        &'a mut self,
        ctx: &'a ServiceContext,
        record: ServiceRecord,
    ) -> ComputationFuture<'a, ServiceRecord> {
        match &self.is_ready {
            Some(stage) => stage(record),
            None => Box::pin(ctx.wait_for_dependencies(record)),
        }
    }

    fn process_data<'a>(
        &'a mut self,
        _ctx: &'a ServiceContext,
        record: ServiceRecord,
    ) -> ComputationFuture<'a, ServiceRecord> {
        (self.process)(record)
    }

    fn is_done<'a>(
        &'a mut self,
        _ctx: &'a ServiceContext,
        record: ServiceRecord,
    ) -> ComputationFuture<'a, ServiceRecord> {
        match &self.is_done {
            Some(stage) => stage(record),
            None => Box::pin(async move { Ok(record) }),
        }
    }

    fn post_process_data<'a>(
        &'a mut self,
        _ctx: &'a ServiceContext,
        record: &'a ServiceRecord,
        error: Option<&'a CoreError>,
    ) -> PostProcessFuture<'a> {
        match &self.post_process {
            Some(operation) => operation(record.clone(), error.cloned()),
            None => Box::pin(async {}),
        }
    }
}
