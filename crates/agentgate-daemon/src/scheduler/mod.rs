//! Admission control in front of the agent worker.
//!
//! - [`Scheduler`]: FIFO queue with a single consumer that applies the rate
//!   limits, answers repeats from the cache and falls back to a one-shot
//!   worker when the persistent one fails.
//! - [`ResponseCache`]: expiring, bounded map of prior answers.
//! - [`RateLimiter`]: global and per-session dispatch spacing.

pub mod cache;
pub mod queue;
pub mod rate_limit;

pub use cache::{ResponseCache, cache_key};
pub use queue::{Scheduler, SchedulerStats, SubmitError};
pub use rate_limit::RateLimiter;
