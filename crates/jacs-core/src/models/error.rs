use thiserror::Error;

use crate::models::{ServiceId, ServiceRecord};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CoreErrorKind {
    InvalidInput,
    UnknownService,
    ComputationFailure,
    DependencyFailure,
    Timeout,
    Cancelled,
    StorageFailure,
    Internal,
}

#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("{kind:?}: {message}")]
pub struct CoreError {
    pub service: Option<ServiceId>,
    pub service_name: Option<String>,
    pub kind: CoreErrorKind,
    pub message: String,
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    pub fn new(kind: CoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            service: None,
            service_name: None,
            kind,
            message: message.into(),
        }
    }

    pub fn for_record(record: &ServiceRecord, kind: CoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            service: record.id,
            service_name: Some(record.name.clone()),
            kind,
            message: message.into(),
        }
    }

    /// Fills in the service identity when the error was raised without it.
    pub fn attribute(self, record: &ServiceRecord) -> Self {
        Self {
            service: self.service.or(record.id),
            service_name: self.service_name.or_else(|| Some(record.name.clone())),
            kind: self.kind,
            message: self.message,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        self.kind == CoreErrorKind::Cancelled
    }
}
