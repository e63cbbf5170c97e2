//! Agent worker processes.
//!
//! Two ways of reaching the agent sit behind the same [`AgentInvoker`] seam:
//!
//! - [`PersistentWorker`]: one long-lived process spoken to over
//!   newline-delimited JSON, with a readiness handshake, request correlation,
//!   per-call timeouts, and restart after a crash.
//! - [`TransientInvoker`]: a throwaway process per request, used only when the
//!   persistent worker fails.

pub mod persistent;
pub mod transient;

use std::future::Future;
use std::time::Duration;

use agentgate_core::frame::{AgentRequest, WorkerResponse};
use tokio::process::{Child, Command};
use tracing::warn;

pub use persistent::{PersistentWorker, WorkerPhase};
pub use transient::TransientInvoker;

/// Environment forwarded to worker processes even when the daemon runs with a
/// stripped environment (e.g. under systemd).
const PASSTHROUGH_ENV: &[&str] = &[
    "HOME",
    "PATH",
    "BEDROCK_AGENT_ID",
    "BEDROCK_AGENT_ALIAS_ID",
    "AWS_DEFAULT_REGION",
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
    "AWS_SESSION_TOKEN",
];

/// Something that can answer one agent request.
///
/// Implementations return `Ok` only for frames the worker marked successful;
/// an agent-reported failure is [`WorkerError::Agent`].
pub trait AgentInvoker: Send + Sync + 'static {
    fn invoke(
        &self,
        request: &AgentRequest,
    ) -> impl Future<Output = Result<WorkerResponse, WorkerError>> + Send;

    /// Release any process held between calls.
    fn shutdown(&self) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Errors from worker operations.
///
/// `Clone` so a single startup failure can be handed to every caller that was
/// waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    #[error("Failed to spawn worker: {reason}")]
    SpawnFailed { reason: String },

    #[error("Worker did not print its ready line within {secs}s")]
    StartupTimeout { secs: u64 },

    #[error("Worker exited before becoming ready: {reason}")]
    StartupFailed { reason: String },

    #[error("Request {request_id} timed out after {secs}s")]
    Timeout { request_id: u64, secs: u64 },

    #[error("Worker process closed")]
    ProcessClosed,

    #[error("Worker process failed ({}): {output}", exit_label(.code))]
    ProcessFailed { code: Option<i32>, output: String },

    #[error("No valid JSON response from worker")]
    NoJsonResponse,

    #[error("Failed to parse response: {reason}")]
    ParseFailed { reason: String },

    #[error("Agent error: {message}")]
    Agent { message: String },

    #[error("Worker protocol error: {reason}")]
    Protocol { reason: String },
}

#[allow(clippy::ref_option)]
fn exit_label(code: &Option<i32>) -> String {
    code.map_or_else(|| "no exit code".to_string(), |c| format!("exit code {c}"))
}

fn passthrough_env(cmd: &mut Command) {
    for key in PASSTHROUGH_ENV {
        if let Ok(val) = std::env::var(key) {
            cmd.env(key, val);
        }
    }
}

/// Stop a worker: SIGINT (the worker exits cleanly on it), wait `grace`,
/// then SIGKILL.
async fn terminate_process(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: pid is a valid process ID obtained from our own Child handle.
            // kill(2) with SIGINT is safe to call on any owned subprocess.
            #[allow(unsafe_code, clippy::cast_possible_wrap)]
            let ret = unsafe { libc::kill(pid as i32, libc::SIGINT) };
            if ret != 0 {
                let err = std::io::Error::last_os_error();
                warn!(pid, error = %err, "Failed to send SIGINT");
            }
        }
    }

    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        warn!("Grace period expired, killing worker");
        let _ = child.kill().await;
    }
}
