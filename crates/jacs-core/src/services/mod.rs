pub mod batch;
pub mod echo;
pub mod exec;
pub mod write_file;

pub use batch::{BATCH_SERVICE, BatchService, batch_metadata};
pub use echo::{ECHO_SERVICE, EchoService, echo_metadata};
pub use exec::{EXEC_SERVICE, ExecOutput, ExecService, exec_metadata};
pub use write_file::{WRITE_FILE_SERVICE, WriteFileOutput, WriteFileProcessor, write_file_metadata};

use std::path::Path;
use std::sync::Arc;

use crate::execution::ProcessExecutor;
use crate::models::{CoreError, CoreErrorKind, ServiceRecord};
use crate::registry::ServiceRegistry;

pub fn register_builtin_services(
    registry: &mut ServiceRegistry,
    executor: Arc<dyn ProcessExecutor>,
) -> &mut ServiceRegistry {
    registry
        .register(echo_metadata(), || Box::new(EchoService))
        .register(exec_metadata(), move || {
            Box::new(ExecService::new(executor.clone()))
        })
        .register_processor(write_file_metadata(), || WriteFileProcessor)
        .register(batch_metadata(), || Box::new(BatchService::default()))
}

pub(crate) fn working_directory(record: &ServiceRecord) -> Result<&Path, CoreError> {
    record.working_directory.as_deref().ok_or_else(|| {
        CoreError::for_record(
            record,
            CoreErrorKind::InvalidInput,
            format!("service {} has no working directory", record.display_id()),
        )
    })
}

pub(crate) fn invalid_parameter(record: &ServiceRecord, message: impl Into<String>) -> CoreError {
    CoreError::for_record(record, CoreErrorKind::InvalidInput, message)
}
