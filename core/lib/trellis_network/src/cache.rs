use std::{
    num::NonZeroUsize,
    sync::Mutex,
    time::{Duration, Instant},
};

use lru::LruCache;
use trellis_types::PeerId;

use crate::key::Key;

struct CacheEntry {
    peer: PeerId,
    expires_at: Instant,
}

/// Bounded, TTL-expiring map from key to the peer that last coordinated it.
/// Written through after successful pends; consulted first on lookup.
pub struct CoordinatorCache {
    entries: Mutex<LruCache<Key, CacheEntry>>,
    default_ttl: Duration,
}

impl CoordinatorCache {
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least one");
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            default_ttl,
        }
    }

    pub fn get(&self, key: &Key) -> Option<PeerId> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.peer.clone()),
            Some(_) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    }

    pub fn record(&self, key: &Key, peer: &PeerId, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.default_ttl);
        self.entries.lock().unwrap().put(
            *key,
            CacheEntry {
                peer: peer.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Drops a cached coordinator, e.g. after it failed to respond.
    pub fn invalidate(&self, key: &Key) {
        self.entries.lock().unwrap().pop(key);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for CoordinatorCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorCache")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use trellis_types::BlockId;

    use super::*;

    #[test]
    fn records_and_returns_within_ttl() {
        let cache = CoordinatorCache::new(4, Duration::from_secs(60));
        let key = Key::for_block(&BlockId::new("b1"));
        cache.record(&key, &PeerId::new("p1"), None);
        assert_eq!(cache.get(&key), Some(PeerId::new("p1")));
    }

    #[test]
    fn expired_entries_are_dropped() {
        let cache = CoordinatorCache::new(4, Duration::from_millis(0));
        let key = Key::for_block(&BlockId::new("b1"));
        cache.record(&key, &PeerId::new("p1"), Some(Duration::from_millis(0)));
        assert_eq!(cache.get(&key), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn capacity_bounds_the_cache() {
        let cache = CoordinatorCache::new(2, Duration::from_secs(60));
        for i in 0..3 {
            let key = Key::for_block(&BlockId::new(format!("b{i}")));
            cache.record(&key, &PeerId::new("p"), None);
        }
        assert_eq!(cache.len(), 2);
        // The oldest entry was evicted.
        assert_eq!(cache.get(&Key::for_block(&BlockId::new("b0"))), None);
    }
}
