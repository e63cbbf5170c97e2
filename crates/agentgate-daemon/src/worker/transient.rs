//! One-shot agent worker, used when the persistent worker is unavailable.
//!
//! Each call launches a fresh process with the request passed as command-line
//! flags and waits for it to exit. The process mixes diagnostics into its
//! output; only the first line shaped like a JSON object is the answer.

use std::process::Stdio;

use agentgate_core::config::FallbackConfig;
use agentgate_core::frame::{AgentRequest, WorkerResponse, extract_json_line};
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{AgentInvoker, WorkerError, passthrough_env};

/// Spawns one worker process per request.
#[derive(Debug, Clone)]
pub struct TransientInvoker {
    config: FallbackConfig,
}

impl TransientInvoker {
    pub const fn new(config: FallbackConfig) -> Self {
        Self { config }
    }

    /// Run one request to completion in a fresh process.
    pub async fn run(&self, request: &AgentRequest) -> Result<WorkerResponse, WorkerError> {
        let mut cmd = self.command(request);

        info!(
            program = %self.config.program.display(),
            session_id = ?request.session_id,
            "Spawning transient agent worker"
        );
        let child = cmd.spawn().map_err(|e| WorkerError::SpawnFailed {
            reason: e.to_string(),
        })?;

        let timeout = self.config.timeout();
        // On timeout the child is dropped, and `kill_on_drop` reaps it.
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(WorkerError::ProcessFailed {
                    code: None,
                    output: format!("failed to collect output: {e}"),
                });
            }
            Err(_) => {
                warn!(timeout_secs = timeout.as_secs(), "Transient worker did not exit in time");
                return Err(WorkerError::ProcessFailed {
                    code: None,
                    output: format!("killed after {}s without exiting", timeout.as_secs()),
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            let diagnostics = if stderr.trim().is_empty() {
                stdout.trim()
            } else {
                stderr.trim()
            };
            warn!(code = ?output.status.code(), "Transient worker failed");
            return Err(WorkerError::ProcessFailed {
                code: output.status.code(),
                output: diagnostics.to_string(),
            });
        }

        let combined = format!("{stdout}\n{stderr}");
        let frame = parse_payload(&combined)?;
        debug!(success = frame.success, "Transient worker answered");

        if frame.success {
            Ok(frame)
        } else {
            Err(WorkerError::Agent {
                message: frame.error_message(),
            })
        }
    }

    fn command(&self, request: &AgentRequest) -> Command {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .arg("--message")
            .arg(&request.message);
        if let Some(session_id) = &request.session_id {
            cmd.arg("--session-id").arg(session_id);
        }
        cmd.arg("--enable-trace")
            .arg(if request.enable_trace { "true" } else { "false" })
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_directory {
            cmd.current_dir(dir);
        }
        passthrough_env(&mut cmd);
        cmd
    }
}

impl AgentInvoker for TransientInvoker {
    async fn invoke(&self, request: &AgentRequest) -> Result<WorkerResponse, WorkerError> {
        self.run(request).await
    }
}

/// Pick the JSON payload out of the process output.
pub fn extract_payload(output: &str) -> Result<Value, WorkerError> {
    let line = extract_json_line(output).ok_or(WorkerError::NoJsonResponse)?;
    serde_json::from_str(line).map_err(|e| WorkerError::ParseFailed {
        reason: e.to_string(),
    })
}

/// Pick the payload and decode it as a response frame.
pub fn parse_payload(output: &str) -> Result<WorkerResponse, WorkerError> {
    let value = extract_payload(output)?;
    serde_json::from_value(value).map_err(|e| WorkerError::ParseFailed {
        reason: e.to_string(),
    })
}
