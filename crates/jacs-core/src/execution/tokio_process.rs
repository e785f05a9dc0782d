use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use tokio::io::AsyncReadExt;

use crate::execution::{
    ExecutionResult, ProcessExecutor, ProcessExitStatus, ProcessOutput, ProcessSpawnRequest,
    ProcessWaitFuture, RunningProcess,
};
use crate::models::{CoreError, CoreErrorKind, ServiceId};

pub struct TokioProcessExecutor;

impl ProcessExecutor for TokioProcessExecutor {
    fn spawn(&self, request: ProcessSpawnRequest) -> ExecutionResult<Box<dyn RunningProcess>> {
        let mut cmd = tokio::process::Command::new(&request.command.program);
        cmd.args(&request.command.args);

        for (key, value) in &request.command.env {
            cmd.env(key, value);
        }

        if let Some(dir) = &request.command.working_dir {
            cmd.current_dir(dir);
        }

        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let child = cmd.spawn().map_err(|error| {
            process_failure(
                request.service,
                format!(
                    "failed to spawn '{}': {error}",
                    request.command.program.display()
                ),
            )
        })?;

        let pid = child.id();
        tracing::debug!(
            service_id = ?request.service,
            program = %request.command.program.display(),
            pid = ?pid,
            "spawned service process"
        );

        Ok(Box::new(TokioRunningProcess {
            child: Mutex::new(Some(child)),
            pid,
            started_at: SystemTime::now(),
            timeout: request.timeout,
            service: request.service,
        }))
    }
}

struct TokioRunningProcess {
    child: Mutex<Option<tokio::process::Child>>,
    pid: Option<u32>,
    started_at: SystemTime,
    timeout: Option<Duration>,
    service: Option<ServiceId>,
}

impl RunningProcess for TokioRunningProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn terminate(&self) -> ExecutionResult<()> {
        let mut child = self
            .child
            .lock()
            .map_err(|_| process_failure(self.service, "process handle mutex poisoned"))?;
        match child.as_mut() {
            Some(child) => child.start_kill().map_err(|error| {
                process_failure(self.service, format!("failed to kill process: {error}"))
            }),
            // wait() owns the child; dropping its future kills the process
            None => Ok(()),
        }
    }

    fn wait(self: Box<Self>) -> ProcessWaitFuture {
        let TokioRunningProcess {
            child,
            started_at,
            timeout,
            service,
            ..
        } = *self;
        let child = child.into_inner().ok().flatten();

        Box::pin(async move {
            let mut child = child
                .ok_or_else(|| process_failure(service, "child process already consumed"))?;

            let stdout_reader = {
                let mut stdout = child.stdout.take();
                tokio::spawn(async move {
                    let mut buffer = Vec::new();
                    if let Some(mut handle) = stdout.take() {
                        let _ = handle.read_to_end(&mut buffer).await;
                    }
                    buffer
                })
            };
            let stderr_reader = {
                let mut stderr = child.stderr.take();
                tokio::spawn(async move {
                    let mut buffer = Vec::new();
                    if let Some(mut handle) = stderr.take() {
                        let _ = handle.read_to_end(&mut buffer).await;
                    }
                    buffer
                })
            };

            let deadline = async {
                match timeout {
                    Some(timeout_duration) => tokio::time::sleep(timeout_duration).await,
                    None => std::future::pending::<()>().await,
                }
            };

            let status = tokio::select! {
                status = child.wait() => status.map_err(|error| {
                    process_failure(service, format!("failed to wait for process: {error}"))
                })?,
                _ = deadline => {
                    let _ = child.start_kill();
                    let _ = tokio::time::timeout(Duration::from_secs(1), child.wait()).await;
                    stdout_reader.abort();
                    stderr_reader.abort();
                    return Err(CoreError {
                        service,
                        service_name: None,
                        kind: CoreErrorKind::Timeout,
                        message: format!(
                            "process timed out after {}ms",
                            timeout.unwrap_or_default().as_millis()
                        ),
                    });
                }
            };

            // Descendants can hold the pipes open after exit, so reads get a bounded window.
            let read_deadline = Duration::from_millis(250);
            let stdout = match tokio::time::timeout(read_deadline, stdout_reader).await {
                Ok(Ok(buffer)) => buffer,
                _ => Vec::new(),
            };
            let stderr = match tokio::time::timeout(read_deadline, stderr_reader).await {
                Ok(Ok(buffer)) => buffer,
                _ => Vec::new(),
            };

            let status = match status.code() {
                Some(code) => ProcessExitStatus::ExitCode(code),
                None => ProcessExitStatus::Terminated,
            };

            Ok(ProcessOutput {
                status,
                stdout,
                stderr,
                started_at,
                finished_at: SystemTime::now(),
            })
        })
    }
}

fn process_failure(service: Option<ServiceId>, message: impl Into<String>) -> CoreError {
    CoreError {
        service,
        service_name: None,
        kind: CoreErrorKind::ComputationFailure,
        message: message.into(),
    }
}
