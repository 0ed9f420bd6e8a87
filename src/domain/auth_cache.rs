//! Local idTag authorization cache.
//!
//! Caches the outcome of an `Authorize.conf` for a short TTL so a
//! station doesn't round-trip to the CSMS for every swipe of a badge
//! that was just rejected or accepted.

use std::time::{Duration, Instant};

use dashmap::DashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachedOutcome {
    Accepted,
    Rejected,
    Blocked,
    Expired,
}

struct CacheEntry {
    outcome: CachedOutcome,
    recorded_at: Instant,
}

pub struct AuthCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
}

impl AuthCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn record(&self, id_tag: impl Into<String>, outcome: CachedOutcome) {
        self.entries.insert(
            id_tag.into(),
            CacheEntry {
                outcome,
                recorded_at: Instant::now(),
            },
        );
    }

    /// Look up a cached outcome, evicting and returning `None` if it has
    /// aged past the TTL.
    pub fn lookup(&self, id_tag: &str) -> Option<CachedOutcome> {
        let expired = match self.entries.get(id_tag) {
            Some(entry) => entry.recorded_at.elapsed() > self.ttl,
            None => return None,
        };
        if expired {
            self.entries.remove(id_tag);
            return None;
        }
        self.entries.get(id_tag).map(|e| e.outcome)
    }

    pub fn invalidate(&self, id_tag: &str) {
        self.entries.remove(id_tag);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_within_ttl() {
        let cache = AuthCache::new(Duration::from_secs(60));
        cache.record("TAG1", CachedOutcome::Rejected);
        assert_eq!(cache.lookup("TAG1"), Some(CachedOutcome::Rejected));
    }

    #[test]
    fn expired_entry_is_evicted() {
        let cache = AuthCache::new(Duration::from_millis(0));
        cache.record("TAG1", CachedOutcome::Accepted);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.lookup("TAG1"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn missing_entry_is_none() {
        let cache = AuthCache::new(Duration::from_secs(60));
        assert_eq!(cache.lookup("UNKNOWN"), None);
    }
}
