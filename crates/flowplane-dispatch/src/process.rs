// Local subprocess backend.

use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::backend::{BackendStatus, ExecutionBackend, JobSpec};
use crate::error::{DispatchError, DispatchResult};

pub const PROCESS_KIND: &str = "process";

/// A job still running, or one whose exit has not been collected by `poll`.
enum Tracked {
    Live(Child),
    Exited(BackendStatus),
}

/// Runs each job as a child process of the control plane.
///
/// The job configuration must carry a `command`, either a shell string or an
/// argv array, and may carry an `env` object. The run id and JSON-encoded
/// parameters are exported as `FLOWPLANE_RUN_ID` and `FLOWPLANE_PARAMETERS`.
/// A handle is forgotten once `poll` has reported its terminal status.
#[derive(Clone, Default)]
pub struct ProcessBackend {
    children: Arc<Mutex<HashMap<String, Tracked>>>,
}

impl ProcessBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn command(job: &JobSpec) -> DispatchResult<Command> {
        let mut cmd = match job.configuration.get("command") {
            Some(Value::String(line)) if !line.trim().is_empty() => {
                let mut c = Command::new("sh");
                c.arg("-c").arg(line);
                c
            }
            Some(Value::Array(argv)) if !argv.is_empty() => {
                let argv: Vec<&str> = argv.iter().filter_map(Value::as_str).collect();
                let Some((program, args)) = argv.split_first() else {
                    return Err(DispatchError::Configuration(
                        "command array must contain strings".to_string(),
                    ));
                };
                let mut c = Command::new(program);
                c.args(args);
                c
            }
            _ => {
                return Err(DispatchError::Configuration(format!(
                    "job configuration for {} has no command",
                    job.deployment_key
                )));
            }
        };

        if let Some(env) = job.configuration.get("env").and_then(Value::as_object) {
            for (key, value) in env {
                match value {
                    Value::Null => {}
                    Value::String(s) => {
                        cmd.env(key, s);
                    }
                    other => {
                        cmd.env(key, other.to_string());
                    }
                }
            }
        }
        for (key, value) in &job.environment.env {
            cmd.env(key, value);
        }
        let parameters = serde_json::to_string(&job.parameters)
            .map_err(|e| DispatchError::Configuration(e.to_string()))?;
        cmd.env("FLOWPLANE_RUN_ID", job.run_id.to_string())
            .env("FLOWPLANE_ENTRYPOINT", &job.environment.entrypoint)
            .env("FLOWPLANE_PARAMETERS", parameters);

        if !job.environment.working_dir.is_empty() {
            cmd.current_dir(&job.environment.working_dir);
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd)
    }
}

#[async_trait]
impl ExecutionBackend for ProcessBackend {
    fn kind(&self) -> &str {
        PROCESS_KIND
    }

    async fn submit(&self, job: &JobSpec) -> DispatchResult<String> {
        let mut cmd = Self::command(job)?;
        let mut child = cmd
            .spawn()
            .map_err(|e| DispatchError::Submission(format!("spawning process: {e}")))?;

        let pid = child.id().unwrap_or_default();
        let handle = format!("process:{}:{pid}", job.run_id);

        // Drain both pipes so the child never blocks on a full buffer.
        if let Some(stdout) = child.stdout.take() {
            let run = job.run_id;
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(run_id = %run, "stdout: {}", line);
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let run = job.run_id;
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(run_id = %run, "stderr: {}", line);
                }
            });
        }

        info!(run_id = %job.run_id, pid, deployment = %job.deployment_key, "process started");
        self.children
            .lock()
            .await
            .insert(handle.clone(), Tracked::Live(child));
        Ok(handle)
    }

    async fn poll(&self, handle: &str) -> DispatchResult<BackendStatus> {
        let mut children = self.children.lock().await;
        let exited = match children.get_mut(handle) {
            None => return Ok(BackendStatus::Unknown),
            Some(Tracked::Exited(status)) => {
                let status = status.clone();
                children.remove(handle);
                return Ok(status);
            }
            Some(Tracked::Live(child)) => child
                .try_wait()
                .map_err(|e| DispatchError::Backend(format!("polling {handle}: {e}")))?,
        };
        let Some(exit) = exited else {
            return Ok(BackendStatus::Running);
        };
        children.remove(handle);
        info!(handle, code = exit.code().unwrap_or(-1), "process exited");
        Ok(exit_status(exit))
    }

    async fn cancel(&self, handle: &str) -> DispatchResult<()> {
        let mut child = {
            let mut children = self.children.lock().await;
            match children.remove(handle) {
                Some(Tracked::Live(child)) => child,
                Some(exited) => {
                    children.insert(handle.to_string(), exited);
                    return Ok(());
                }
                None => {
                    warn!(handle, "cancel requested for unknown process");
                    return Ok(());
                }
            }
        };

        if let Err(e) = child.start_kill() {
            debug!(handle, error = %e, "kill failed; process may already have exited");
        }
        child
            .wait()
            .await
            .map_err(|e| DispatchError::Backend(format!("waiting for {handle}: {e}")))?;
        info!(handle, "process killed");
        self.children
            .lock()
            .await
            .insert(handle.to_string(), Tracked::Exited(BackendStatus::Cancelled));
        Ok(())
    }
}

fn exit_status(exit: ExitStatus) -> BackendStatus {
    if exit.success() {
        return BackendStatus::Completed;
    }
    match exit.code() {
        Some(code) => BackendStatus::Failed {
            message: format!("process exited with code {code}"),
        },
        None => BackendStatus::Crashed {
            message: "process terminated by signal".to_string(),
        },
    }
}
