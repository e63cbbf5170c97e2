//! Time-bounded response cache with insertion-order eviction.
//!
//! Eviction is FIFO, not LRU: a hit never moves an entry, so the entry
//! evicted on overflow is always the one inserted longest ago.

use std::num::NonZeroUsize;
use std::time::Duration;

use agentgate_core::frame::AgentResponse;
use lru::LruCache;
use tokio::time::Instant;
use tracing::debug;

/// Session key used when a request carries no session id.
pub const DEFAULT_SESSION: &str = "default";

/// Session key for rate limiting and caching. Empty ids count as absent.
pub fn session_key(session_id: Option<&str>) -> &str {
    session_id.filter(|s| !s.is_empty()).unwrap_or(DEFAULT_SESSION)
}

/// Cache key: lowercased, trimmed, whitespace-collapsed message plus session.
pub fn cache_key(message: &str, session_id: Option<&str>) -> String {
    let normalized = message
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    format!("{normalized}:{}", session_key(session_id))
}

#[derive(Debug)]
struct CacheEntry {
    response: AgentResponse,
    inserted_at: Instant,
}

/// Bounded, expiring map from cache key to a prior response.
///
/// Lookups use `peek`, so recency only ever changes on insert and the LRU
/// order is insertion order.
#[derive(Debug)]
pub struct ResponseCache {
    entries: LruCache<String, CacheEntry>,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            ttl,
        }
    }

    /// Look up a live entry. An expired entry is removed and reported as a miss.
    pub fn get(&mut self, key: &str, now: Instant) -> Option<AgentResponse> {
        let entry = self.entries.peek(key)?;
        if now.saturating_duration_since(entry.inserted_at) >= self.ttl {
            self.entries.pop(key);
            return None;
        }
        Some(entry.response.clone())
    }

    /// Store a response. Re-inserting a key moves it to the back of the
    /// eviction order.
    pub fn insert(&mut self, key: String, response: AgentResponse, now: Instant) {
        let entry = CacheEntry {
            response,
            inserted_at: now,
        };
        if let Some((evicted, _)) = self.entries.push(key.clone(), entry)
            && evicted != key
        {
            debug!(key = %evicted, "Evicted oldest cache entry");
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}
