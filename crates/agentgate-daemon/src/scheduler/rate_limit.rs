//! Global and per-session dispatch spacing.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

/// Above this many tracked sessions, records that can no longer impose a
/// wait are dropped on the next dispatch.
const SESSION_PRUNE_THRESHOLD: usize = 1024;

/// Tracks when the last dispatch happened, overall and per session.
#[derive(Debug)]
pub struct RateLimiter {
    global_min_interval: Duration,
    session_min_interval: Duration,
    global_last: Option<Instant>,
    session_last: HashMap<String, Instant>,
}

impl RateLimiter {
    pub fn new(global_min_interval: Duration, session_min_interval: Duration) -> Self {
        Self {
            global_min_interval,
            session_min_interval,
            global_last: None,
            session_last: HashMap::new(),
        }
    }

    /// How long a dispatch for `session` has to wait at `now`.
    pub fn delay_for(&self, session: &str, now: Instant) -> Duration {
        let global_wait = remaining(self.global_last, self.global_min_interval, now);
        let session_wait = remaining(
            self.session_last.get(session).copied(),
            self.session_min_interval,
            now,
        );
        global_wait.max(session_wait)
    }

    /// Record a dispatch for `session` at `now`.
    pub fn record(&mut self, session: &str, now: Instant) {
        self.global_last = Some(now);
        self.session_last.insert(session.to_string(), now);
        if self.session_last.len() > SESSION_PRUNE_THRESHOLD {
            self.prune(now);
        }
    }

    #[cfg(test)]
    fn tracked_sessions(&self) -> usize {
        self.session_last.len()
    }

    fn prune(&mut self, now: Instant) {
        let min = self.session_min_interval;
        self.session_last
            .retain(|_, last| now.saturating_duration_since(*last) < min);
    }
}

fn remaining(last: Option<Instant>, min: Duration, now: Instant) -> Duration {
    last.map_or(Duration::ZERO, |at| {
        min.saturating_sub(now.saturating_duration_since(at))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(Duration::from_millis(2000), Duration::from_millis(1000))
    }

    #[test]
    fn first_dispatch_is_free() {
        let limiter = limiter();
        assert_eq!(limiter.delay_for("s1", Instant::now()), Duration::ZERO);
    }

    #[test]
    fn global_interval_applies_across_sessions() {
        let mut limiter = limiter();
        let t0 = Instant::now();
        limiter.record("s1", t0);
        assert_eq!(
            limiter.delay_for("s2", t0 + Duration::from_millis(500)),
            Duration::from_millis(1500)
        );
    }

    #[test]
    fn longer_of_the_two_waits_wins() {
        let mut limiter = RateLimiter::new(Duration::from_millis(100), Duration::from_millis(1000));
        let t0 = Instant::now();
        limiter.record("s1", t0);
        let at = t0 + Duration::from_millis(300);
        assert_eq!(limiter.delay_for("s1", at), Duration::from_millis(700));
        assert_eq!(limiter.delay_for("s2", at), Duration::ZERO);
    }

    #[test]
    fn no_wait_once_intervals_elapse() {
        let mut limiter = limiter();
        let t0 = Instant::now();
        limiter.record("s1", t0);
        assert_eq!(
            limiter.delay_for("s1", t0 + Duration::from_secs(5)),
            Duration::ZERO
        );
    }

    #[test]
    fn stale_sessions_are_pruned() {
        let mut limiter = RateLimiter::new(Duration::ZERO, Duration::from_millis(1000));
        let t0 = Instant::now();
        for i in 0..=SESSION_PRUNE_THRESHOLD {
            limiter.record(&format!("s{i}"), t0);
        }
        let later = t0 + Duration::from_secs(2);
        limiter.record("fresh", later);
        assert_eq!(limiter.tracked_sessions(), 1);
        assert_eq!(limiter.delay_for("s0", later), Duration::ZERO);
    }
}
