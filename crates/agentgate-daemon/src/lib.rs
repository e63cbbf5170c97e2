//! Agentgate daemon library
//!
//! Everything between a caller's question and the agent process:
//! - Admission queue with global and per-session rate limiting
//! - Response cache keyed on the normalized question
//! - Persistent worker channel with NDJSON framing and crash recovery
//! - One-shot worker used as a fallback

pub mod scheduler;
pub mod worker;
