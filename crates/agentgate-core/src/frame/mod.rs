//! Wire frames for the agent worker protocol.
//!
//! The persistent worker speaks newline-delimited JSON over its standard
//! streams after printing a readiness sentinel. The transient worker prints a
//! single JSON object somewhere in otherwise free-form output. This module
//! holds the frame types and the tolerant line-level decoding for both.

mod parser;
mod types;

pub use parser::{LineBuffer, MAX_LINE_BYTES, extract_json_line, is_ready_line, parse_response_line};
pub use types::*;
