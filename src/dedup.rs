//! Bounded-TTL dedup cache
//!
//! Tracks recently seen message keys so re-deliveries from reconnects and
//! bus retries can be suppressed. Suppression is a noise optimization, not a
//! correctness mechanism: callers stay safe if a duplicate slips through.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::interval;

/// Concurrent map of recently seen keys with a fixed retention window
pub struct DedupCache {
    entries: DashMap<String, Instant>,
    ttl: Duration,
}

impl DedupCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Check-and-insert: returns true if the key was already seen within the
    /// retention window. A stale entry is refreshed and reported as unseen.
    pub fn seen(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut hit = false;

        self.entries
            .entry(key.to_string())
            .and_modify(|seen_at| {
                if now.duration_since(*seen_at) < self.ttl {
                    hit = true;
                } else {
                    *seen_at = now;
                }
            })
            .or_insert(now);

        hit
    }

    /// Drop expired entries. Keeps the cache bounded between sweeps driven
    /// by [`spawn_sweeper`](Self::spawn_sweeper).
    pub fn sweep(&self) {
        let ttl = self.ttl;
        self.entries.retain(|_, seen_at| seen_at.elapsed() < ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Spawn a background task sweeping expired entries on a fixed period.
    pub fn spawn_sweeper(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                self.sweep();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn test_first_sighting_is_unseen() {
        let cache = DedupCache::new(Duration::from_secs(1));
        assert!(!cache.seen("BTCUSD-1672531200000"));
        assert!(cache.seen("BTCUSD-1672531200000"));
    }

    #[test]
    fn test_distinct_keys_do_not_collide() {
        let cache = DedupCache::new(Duration::from_secs(1));
        assert!(!cache.seen("BTCUSD-1672531200000"));
        assert!(!cache.seen("ETHUSD-1672531200000"));
        assert!(!cache.seen("BTCUSD-1672531200001"));
    }

    #[test]
    fn test_entry_expires_after_ttl() {
        let cache = DedupCache::new(Duration::from_millis(20));
        assert!(!cache.seen("key"));
        sleep(Duration::from_millis(40));
        assert!(!cache.seen("key"));
        assert!(cache.seen("key"));
    }

    #[test]
    fn test_sweep_drops_expired_entries() {
        let cache = DedupCache::new(Duration::from_millis(20));
        cache.seen("a");
        cache.seen("b");
        assert_eq!(cache.len(), 2);

        sleep(Duration::from_millis(40));
        cache.sweep();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_sweeper_task_runs() {
        let cache = Arc::new(DedupCache::new(Duration::from_millis(10)));
        cache.seen("a");

        let handle = Arc::clone(&cache).spawn_sweeper(Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cache.is_empty());
        handle.abort();
    }
}
