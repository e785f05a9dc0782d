use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::computation::{ComputationFuture, PostProcessFuture, ServiceComputation, ServiceContext};
use crate::execution::{
    CommandSpec, ProcessExecutor, ProcessExitStatus, ProcessSpawnRequest, RunningProcess,
    spawn_validated,
};
use crate::models::{CoreError, CoreErrorKind, ServiceMetaData, ServiceRecord};
use crate::services::{invalid_parameter, working_directory};

pub const EXEC_SERVICE: &str = "exec";

pub fn exec_metadata() -> ServiceMetaData {
    ServiceMetaData::new(
        EXEC_SERVICE,
        "Runs an external command inside the service working directory",
    )
    .required_arg("command", "program to execute")
    .optional_arg("args", "list of string arguments", Some(json!([])))
    .optional_arg("env", "extra environment variables", Some(json!({})))
    .optional_arg("timeout_ms", "kills the process after this many milliseconds", None)
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub status: ProcessExitStatus,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

/// Launches the process in `process_data` and collects it in `is_done`.
pub struct ExecService {
    executor: Arc<dyn ProcessExecutor>,
    process: Option<Box<dyn RunningProcess>>,
}

impl ExecService {
    pub fn new(executor: Arc<dyn ProcessExecutor>) -> Self {
        Self {
            executor,
            process: None,
        }
    }
}

impl ServiceComputation for ExecService {
    fn process_data<'a>(
        &'a mut self,
        _ctx: &'a ServiceContext,
        record: ServiceRecord,
    ) -> ComputationFuture<'a, ServiceRecord> {
        Box::pin(async move {
            let id = record.required_id()?;
            let request = spawn_request(&record)?.service(id);

            if let Some(dir) = &request.command.working_dir {
                tokio::fs::create_dir_all(dir).await.map_err(|error| {
                    CoreError::for_record(
                        &record,
                        CoreErrorKind::ComputationFailure,
                        format!("failed to create working directory '{}': {error}", dir.display()),
                    )
                })?;
            }

            let process = spawn_validated(self.executor.as_ref(), request)
                .map_err(|error| error.attribute(&record))?;
            tracing::info!(
                service_id = %id,
                pid = ?process.pid(),
                "service process launched"
            );
            self.process = Some(process);
            Ok(record)
        })
    }

    fn is_done<'a>(
        &'a mut self,
        ctx: &'a ServiceContext,
        record: ServiceRecord,
    ) -> ComputationFuture<'a, ServiceRecord> {
        Box::pin(async move {
            let process = self.process.take().ok_or_else(|| {
                CoreError::for_record(
                    &record,
                    CoreErrorKind::Internal,
                    "no process was launched for this service",
                )
            })?;

            // dropping the wait future kills the child
            let output = tokio::select! {
                output = process.wait() => output.map_err(|error| error.attribute(&record))?,
                _ = ctx.token().cancelled() => {
                    return Err(CoreError::for_record(
                        &record,
                        CoreErrorKind::Cancelled,
                        "process killed on cancellation",
                    ));
                }
            };

            let result = ExecOutput {
                status: output.status,
                stdout: output.stdout_tail(),
                stderr: output.stderr_tail(),
            };

            if !output.status.success() {
                let detail = match output.status {
                    ProcessExitStatus::ExitCode(code) => format!("process exited with code {code}"),
                    ProcessExitStatus::Terminated => "process was terminated by signal".to_string(),
                };
                let stderr = result.stderr.as_deref().unwrap_or_default().trim();
                return Err(CoreError::for_record(
                    &record,
                    CoreErrorKind::ComputationFailure,
                    if stderr.is_empty() {
                        detail
                    } else {
                        format!("{detail}: {stderr}")
                    },
                ));
            }

            let mut record = record;
            record.set_result(&result)?;
            Ok(record)
        })
    }

    fn post_process_data<'a>(
        &'a mut self,
        _ctx: &'a ServiceContext,
        record: &'a ServiceRecord,
        _error: Option<&'a CoreError>,
    ) -> PostProcessFuture<'a> {
        Box::pin(async move {
            // a failure between launch and collection leaves the process behind
            if let Some(process) = self.process.take()
                && let Err(error) = process.terminate()
            {
                tracing::warn!(
                    service_id = %record.display_id(),
                    message = %error.message,
                    "failed to kill abandoned service process"
                );
            }
        })
    }
}

fn spawn_request(record: &ServiceRecord) -> Result<ProcessSpawnRequest, CoreError> {
    let program = record
        .string_parameter("command")
        .ok_or_else(|| invalid_parameter(record, "'command' must be a string"))?;

    let args = match record.parameters.get("args") {
        None | Some(Value::Null) => Vec::new(),
        Some(value) => serde_json::from_value::<Vec<String>>(value.clone()).map_err(|error| {
            invalid_parameter(record, format!("'args' must be a list of strings: {error}"))
        })?,
    };

    let env = match record.parameters.get("env") {
        None | Some(Value::Null) => BTreeMap::new(),
        Some(value) => {
            serde_json::from_value::<BTreeMap<String, String>>(value.clone()).map_err(|error| {
                invalid_parameter(record, format!("'env' must map names to strings: {error}"))
            })?
        }
    };

    let mut command = CommandSpec::new(program).args(args);
    for (key, value) in env {
        command = command.env(key, value);
    }
    command = command.working_dir(working_directory(record)?);

    let mut request = ProcessSpawnRequest::new(command);
    if let Some(timeout_ms) = record.parameters.get("timeout_ms").and_then(Value::as_u64) {
        request = request.timeout(Duration::from_millis(timeout_ms));
    }
    Ok(request)
}
