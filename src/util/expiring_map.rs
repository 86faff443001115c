use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;


/// A concurrent map whose entries expire a fixed time after they were inserted. Expired entries
///  are invisible to all read operations right away, and they are physically removed by
///  [ExpiringMap::purge_expired] which is expected to be called periodically.
///
/// All operations are safe to call concurrently without external locking. Operations on the
///  same key are serialized by the underlying shard lock, so 'insert if absent' is atomic.
///
/// NB: Updating a value does *not* extend its lifetime - the TTL runs from first insertion
pub struct ExpiringMap<K, V> {
    ttl: Duration,
    entries: DashMap<K, ExpiringEntry<V>>,
}

struct ExpiringEntry<V> {
    value: V,
    expires_at: Instant,
}
impl<V> ExpiringEntry<V> {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

impl<K: Hash + Eq, V: Clone> ExpiringMap<K, V> {
    pub fn new(ttl: Duration) -> ExpiringMap<K, V> {
        ExpiringMap {
            ttl,
            entries: DashMap::default(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Stores `value` unless there is a live entry for `key` already. Returns the previously
    ///  stored value if there was one, `None` if `value` was inserted.
    pub fn insert_if_absent(&self, key: K, value: V) -> Option<V> {
        let now = Instant::now();
        match self.entries.entry(key) {
            Entry::Occupied(mut e) => {
                if e.get().is_live(now) {
                    return Some(e.get().value.clone());
                }
                e.insert(ExpiringEntry { value, expires_at: now + self.ttl });
                None
            }
            Entry::Vacant(e) => {
                e.insert(ExpiringEntry { value, expires_at: now + self.ttl });
                None
            }
        }
    }

    /// Applies `f` to the live value for `key`, initializing the entry with `init` if there is
    ///  none. `f` runs while the key's shard is locked, so it must not call back into the map.
    pub fn update_or_insert_with<R>(&self, key: K, init: impl FnOnce() -> V, f: impl FnOnce(&mut V) -> R) -> R {
        let now = Instant::now();
        let mut entry = match self.entries.entry(key) {
            Entry::Occupied(mut e) => {
                if !e.get().is_live(now) {
                    // the entry expired but was not purged yet: start over
                    e.insert(ExpiringEntry { value: init(), expires_at: now + self.ttl });
                }
                e.into_ref()
            }
            Entry::Vacant(e) => e.insert(ExpiringEntry { value: init(), expires_at: now + self.ttl }),
        };
        f(&mut entry.value)
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        self.entries.get(key)
            .and_then(|e| if e.is_live(now) { Some(e.value.clone()) } else { None })
    }

    /// Removes all expired entries, returning the number of removed entries
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut num_removed = 0;
        self.entries.retain(|_, e| {
            let live = e.is_live(now);
            if !live {
                num_removed += 1;
            }
            live
        });
        num_removed
    }

    /// NB: This includes expired entries that were not purged yet
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
    use std::sync::Arc;
    use tokio::time::advance;

    #[tokio::test(start_paused = true)]
    async fn test_insert_if_absent() {
        let map = ExpiringMap::<u32, &str>::new(Duration::from_millis(100));

        assert_eq!(map.insert_if_absent(1, "a"), None);
        assert_eq!(map.insert_if_absent(1, "b"), Some("a"));
        assert_eq!(map.insert_if_absent(2, "c"), None);

        assert_eq!(map.get(&1), Some("a"));
        assert_eq!(map.get(&2), Some("c"));
        assert_eq!(map.get(&3), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry() {
        let map = ExpiringMap::<u32, &str>::new(Duration::from_millis(100));
        map.insert_if_absent(1, "a");

        advance(Duration::from_millis(99)).await;
        assert!(map.get(&1).is_some());

        advance(Duration::from_millis(1)).await;
        assert!(map.get(&1).is_none());
        assert_eq!(map.len(), 1);

        // an expired entry can be replaced
        assert_eq!(map.insert_if_absent(1, "b"), None);
        assert_eq!(map.get(&1), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_does_not_extend_ttl() {
        let map = ExpiringMap::<u32, Vec<u32>>::new(Duration::from_millis(100));

        let len = map.update_or_insert_with(1, Vec::new, |v| { v.push(5); v.len() });
        assert_eq!(len, 1);

        advance(Duration::from_millis(50)).await;
        let len = map.update_or_insert_with(1, Vec::new, |v| { v.push(6); v.len() });
        assert_eq!(len, 2);
        assert_eq!(map.get(&1), Some(vec![5, 6]));

        advance(Duration::from_millis(50)).await;
        assert_eq!(map.get(&1), None);

        let len = map.update_or_insert_with(1, Vec::new, |v| { v.push(7); v.len() });
        assert_eq!(len, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let map = ExpiringMap::<u32, u32>::new(Duration::from_millis(100));
        map.insert_if_absent(1, 1);
        advance(Duration::from_millis(60)).await;
        map.insert_if_absent(2, 2);
        advance(Duration::from_millis(60)).await;

        assert_eq!(map.purge_expired(), 1);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(&2), Some(2));

        advance(Duration::from_millis(60)).await;
        assert_eq!(map.purge_expired(), 1);
        assert!(map.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_insert_if_absent_has_single_winner() {
        let map = Arc::new(ExpiringMap::<u32, usize>::new(Duration::from_secs(60)));

        let mut handles = Vec::new();
        for n in 0..16 {
            let map = map.clone();
            handles.push(tokio::spawn(async move {
                map.insert_if_absent(7, n).is_none()
            }));
        }

        let mut num_winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                num_winners += 1;
            }
        }
        assert_eq!(num_winners, 1);
    }
}
