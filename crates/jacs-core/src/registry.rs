use std::collections::HashMap;
use std::sync::Arc;

use crate::computation::{ProcessorComputation, ServiceComputation, ServiceProcessor};
use crate::models::{CoreError, CoreErrorKind, CoreResult, ServiceMetaData};

pub type ComputationFactory = Arc<dyn Fn() -> Box<dyn ServiceComputation> + Send + Sync>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ServiceKind {
    Computation,
    Processor,
}

#[derive(Clone)]
pub struct ServiceDescriptor {
    metadata: Arc<ServiceMetaData>,
    kind: ServiceKind,
    factory: ComputationFactory,
}

impl ServiceDescriptor {
    pub fn metadata(&self) -> &ServiceMetaData {
        &self.metadata
    }

    pub fn shared_metadata(&self) -> Arc<ServiceMetaData> {
        self.metadata.clone()
    }

    pub fn kind(&self) -> ServiceKind {
        self.kind
    }

    /// Builds a fresh computation for a single run.
    pub fn create_computation_instance(&self) -> Box<dyn ServiceComputation> {
        (self.factory)()
    }
}

/// Maps service names to their metadata and computation factories.
///
/// Built once at startup and shared read-only with the dispatcher.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    services: HashMap<String, ServiceDescriptor>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` under the metadata's service name. A later
    /// registration for the same name replaces the earlier one.
    pub fn register<F>(&mut self, metadata: ServiceMetaData, factory: F) -> &mut Self
    where
        F: Fn() -> Box<dyn ServiceComputation> + Send + Sync + 'static,
    {
        self.insert(metadata, ServiceKind::Computation, Arc::new(factory));
        self
    }

    pub fn register_processor<P, F>(&mut self, metadata: ServiceMetaData, factory: F) -> &mut Self
    where
        P: ServiceProcessor,
        F: Fn() -> P + Send + Sync + 'static,
    {
        self.insert(
            metadata,
            ServiceKind::Processor,
            Arc::new(move || -> Box<dyn ServiceComputation> {
                Box::new(ProcessorComputation::new(factory()))
            }),
        );
        self
    }

    pub fn lookup(&self, service_name: &str) -> CoreResult<&ServiceDescriptor> {
        self.services.get(service_name).ok_or_else(|| CoreError {
            service: None,
            service_name: Some(service_name.to_string()),
            kind: CoreErrorKind::UnknownService,
            message: format!("no service registered under '{service_name}'"),
        })
    }

    pub fn contains(&self, service_name: &str) -> bool {
        self.services.contains_key(service_name)
    }

    pub fn service_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.services.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    fn insert(&mut self, metadata: ServiceMetaData, kind: ServiceKind, factory: ComputationFactory) {
        let service_name = metadata.service_name.clone();
        let descriptor = ServiceDescriptor {
            metadata: Arc::new(metadata),
            kind,
            factory,
        };
        if self.services.insert(service_name.clone(), descriptor).is_some() {
            tracing::debug!(%service_name, "replaced existing service registration");
        }
    }
}
