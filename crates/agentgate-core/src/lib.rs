//! `agentgate` Core Library
//!
//! Shared functionality for `agentgate` components:
//! - Wire frames and line framing for the agent worker protocol
//! - Greeting removal for agent answers
//! - Configuration resolution and hierarchy
//! - Common error types

pub mod config;
pub mod error;
pub mod frame;
pub mod sanitize;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
pub use sanitize::sanitize_response;
