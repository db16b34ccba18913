//! Fixed-shard concurrent TTL cache.
//!
//! Sixty-four shards, FNV-32 over the key picks the shard. Expired
//! entries miss on read and are reclaimed either lazily or by a
//! background sweep. Locks are shard-local; readers and writers never
//! block across shards.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use std::time::{Duration, Instant};

const SHARD_COUNT: usize = 64;

/// Sweep cadence of the background eviction task.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// A TTL cache sharded by key hash.
pub struct ShardedCache<V> {
    shards: Vec<RwLock<HashMap<String, Entry<V>>>>,
    ttl: Duration,
}

impl<V: Clone> ShardedCache<V> {
    /// Create a cache whose entries live `ttl` past their last write.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
            ttl,
        }
    }

    fn shard(&self, key: &str) -> &RwLock<HashMap<String, Entry<V>>> {
        &self.shards[fnv32(key) as usize % SHARD_COUNT]
    }

    /// Insert or refresh an entry.
    pub fn set(&self, key: &str, value: V) {
        let entry = Entry {
            value,
            expires_at: Instant::now() + self.ttl,
        };
        self.shard(key)
            .write()
            .expect("cache shard poisoned")
            .insert(key.to_string(), entry);
    }

    /// Fetch a live entry; expired entries miss and are removed.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<V> {
        let shard = self.shard(key);
        {
            let guard = shard.read().expect("cache shard poisoned");
            match guard.get(key) {
                None => return None,
                Some(entry) if entry.expires_at > Instant::now() => {
                    return Some(entry.value.clone())
                }
                Some(_) => {}
            }
        }
        shard.write().expect("cache shard poisoned").remove(key);
        None
    }

    /// Remove an entry.
    pub fn delete(&self, key: &str) {
        self.shard(key)
            .write()
            .expect("cache shard poisoned")
            .remove(key);
    }

    /// Fetch a live entry or insert the one `make` builds, atomically
    /// within the shard.
    pub fn load_or_store(&self, key: &str, make: impl FnOnce() -> V) -> V {
        let mut guard = self.shard(key).write().expect("cache shard poisoned");
        if let Some(entry) = guard.get(key) {
            if entry.expires_at > Instant::now() {
                return entry.value.clone();
            }
        }
        let value = make();
        guard.insert(
            key.to_string(),
            Entry {
                value: value.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        value
    }

    /// Count of live entries.
    #[must_use]
    pub fn item_count(&self) -> usize {
        let now = Instant::now();
        self.shards
            .iter()
            .map(|shard| {
                shard
                    .read()
                    .expect("cache shard poisoned")
                    .values()
                    .filter(|e| e.expires_at > now)
                    .count()
            })
            .sum()
    }

    /// Drop every expired entry.
    pub fn sweep(&self) {
        let now = Instant::now();
        for shard in &self.shards {
            shard
                .write()
                .expect("cache shard poisoned")
                .retain(|_, e| e.expires_at > now);
        }
    }
}

/// Spawn the minute sweep for a cache; the task ends when the cache is
/// dropped.
pub fn spawn_sweeper<V>(cache: &Arc<ShardedCache<V>>)
where
    V: Clone + Send + Sync + 'static,
{
    let weak: Weak<ShardedCache<V>> = Arc::downgrade(cache);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match weak.upgrade() {
                Some(cache) => cache.sweep(),
                None => break,
            }
        }
    });
}

fn fnv32(key: &str) -> u32 {
    let mut hash: u32 = 2_166_136_261;
    for byte in key.as_bytes() {
        hash = hash.wrapping_mul(16_777_619);
        hash ^= u32::from(*byte);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_delete() {
        let cache = ShardedCache::new(Duration::from_secs(60));
        cache.set("a", 1u32);
        assert_eq!(cache.get("a"), Some(1));
        cache.delete("a");
        assert_eq!(cache.get("a"), None);
    }

    #[test]
    fn test_expiry() {
        let cache = ShardedCache::new(Duration::from_millis(20));
        cache.set("a", 1u32);
        assert_eq!(cache.get("a"), Some(1));
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.get("a"), None);
    }

    #[test]
    fn test_set_refreshes_ttl() {
        let cache = ShardedCache::new(Duration::from_millis(60));
        cache.set("a", 1u32);
        std::thread::sleep(Duration::from_millis(40));
        cache.set("a", 2u32);
        std::thread::sleep(Duration::from_millis(40));
        // First TTL would have lapsed; the rewrite kept it alive
        assert_eq!(cache.get("a"), Some(2));
    }

    #[test]
    fn test_load_or_store() {
        let cache = ShardedCache::new(Duration::from_secs(60));
        assert_eq!(cache.load_or_store("k", || 7u32), 7);
        // Existing entry wins
        assert_eq!(cache.load_or_store("k", || 9u32), 7);
    }

    #[test]
    fn test_item_count_and_sweep() {
        let cache = ShardedCache::new(Duration::from_millis(20));
        cache.set("a", 1u32);
        cache.set("b", 2u32);
        assert_eq!(cache.item_count(), 2);
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.item_count(), 0);
        cache.sweep();
        for shard in &cache.shards {
            assert!(shard.read().unwrap().is_empty());
        }
    }

    #[test]
    fn test_keys_spread_across_shards() {
        let cache = ShardedCache::new(Duration::from_secs(60));
        for i in 0..512 {
            cache.set(&format!("key-{i}"), i);
        }
        let populated = cache
            .shards
            .iter()
            .filter(|s| !s.read().unwrap().is_empty())
            .count();
        assert!(populated > SHARD_COUNT / 2, "populated {populated} shards");
    }

    #[tokio::test]
    async fn test_sweeper_stops_after_drop() {
        let cache = Arc::new(ShardedCache::<u32>::new(Duration::from_secs(1)));
        spawn_sweeper(&cache);
        let weak = Arc::downgrade(&cache);
        drop(cache);
        // The task holds only a weak reference, so the cache is gone
        assert!(weak.upgrade().is_none());
    }
}
