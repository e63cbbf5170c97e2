//! Frame types for the agent worker protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Line the persistent worker prints once it is ready to take requests.
pub const READY_SENTINEL: &str = "AGENT_READY";

/// A chat request as the rest of the system sees it, before correlation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRequest {
    pub message: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub enable_trace: bool,
}

impl AgentRequest {
    pub fn new(message: impl Into<String>, session_id: Option<String>, enable_trace: bool) -> Self {
        Self {
            message: message.into(),
            session_id,
            enable_trace,
        }
    }

    /// Attach a correlation id, producing the frame written to the worker's stdin.
    pub fn to_frame(&self, request_id: u64) -> WorkerRequest {
        WorkerRequest {
            request_id,
            message: self.message.clone(),
            session_id: self.session_id.clone(),
            enable_trace: self.enable_trace,
        }
    }
}

/// Request frame sent to the persistent worker, one per line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub request_id: u64,
    pub message: String,
    pub session_id: Option<String>,
    pub enable_trace: bool,
}

/// Response frame from either worker flavour.
///
/// The persistent worker always sets `request_id`; the transient worker never
/// does. Fields beyond `success`, `response` and `error` are passed through
/// when the worker provides them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

const fn default_success() -> bool {
    true
}

impl WorkerResponse {
    /// Error text carried by a failed frame, with a fallback when the worker
    /// sent none.
    pub fn error_message(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| "agent reported failure without an error message".to_string())
    }
}

/// Final result handed back to a caller of the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub response: String,
    pub session_id: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_data: Option<Value>,
}
