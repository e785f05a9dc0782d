use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::computation::{ComputationFuture, ServiceContext, ServiceProcessor};
use crate::models::{CoreError, CoreErrorKind, ServiceMetaData, ServiceRecord};
use crate::services::{invalid_parameter, working_directory};

pub const WRITE_FILE_SERVICE: &str = "write_file";

pub fn write_file_metadata() -> ServiceMetaData {
    ServiceMetaData::new(
        WRITE_FILE_SERVICE,
        "Writes text content to a file under the working directory",
    )
    .required_arg("path", "relative path of the output file")
    .required_arg("content", "text to write")
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct WriteFileOutput {
    pub files: Vec<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct PreparedWrite {
    pub target: PathBuf,
    pub content: String,
}

pub struct WriteFileProcessor;

impl ServiceProcessor for WriteFileProcessor {
    type Prepared = PreparedWrite;
    type Output = WriteFileOutput;

    fn prepare<'a>(
        &'a mut self,
        _ctx: &'a ServiceContext,
        record: &'a ServiceRecord,
    ) -> ComputationFuture<'a, PreparedWrite> {
        Box::pin(async move {
            let relative = record
                .string_parameter("path")
                .ok_or_else(|| invalid_parameter(record, "'path' must be a string"))?;
            let content = record
                .string_parameter("content")
                .ok_or_else(|| invalid_parameter(record, "'content' must be a string"))?;

            let relative = Path::new(relative);
            if relative
                .components()
                .any(|component| !matches!(component, Component::Normal(_) | Component::CurDir))
            {
                return Err(invalid_parameter(
                    record,
                    format!(
                        "'path' must stay inside the working directory: {}",
                        relative.display()
                    ),
                ));
            }

            Ok(PreparedWrite {
                target: working_directory(record)?.join(relative),
                content: content.to_string(),
            })
        })
    }

    fn is_result_available<'a>(
        &'a self,
        prepared: &'a PreparedWrite,
        record: &'a ServiceRecord,
    ) -> ComputationFuture<'a, bool> {
        Box::pin(async move {
            match tokio::fs::read_to_string(&prepared.target).await {
                Ok(existing) => Ok(existing == prepared.content),
                Err(error) if error.kind() == ErrorKind::NotFound => Ok(false),
                Err(error) => Err(io_failure(record, &prepared.target, "read", error)),
            }
        })
    }

    fn local_process_data<'a>(
        &'a mut self,
        _ctx: &'a ServiceContext,
        prepared: &'a PreparedWrite,
        record: ServiceRecord,
    ) -> ComputationFuture<'a, ServiceRecord> {
        Box::pin(async move {
            if let Some(parent) = prepared.target.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|error| io_failure(&record, parent, "create", error))?;
            }
            tokio::fs::write(&prepared.target, prepared.content.as_bytes())
                .await
                .map_err(|error| io_failure(&record, &prepared.target, "write", error))?;

            tracing::debug!(
                service_id = %record.display_id(),
                target = %prepared.target.display(),
                "wrote output file"
            );
            Ok(record)
        })
    }

    fn retrieve_result<'a>(
        &'a self,
        prepared: &'a PreparedWrite,
        _record: &'a ServiceRecord,
    ) -> ComputationFuture<'a, WriteFileOutput> {
        Box::pin(async move {
            Ok(WriteFileOutput {
                files: vec![prepared.target.clone()],
            })
        })
    }
}

fn io_failure(record: &ServiceRecord, path: &Path, verb: &str, error: std::io::Error) -> CoreError {
    CoreError::for_record(
        record,
        CoreErrorKind::ComputationFailure,
        format!("failed to {verb} '{}': {error}", path.display()),
    )
}
