use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::hash::Hash;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;


/// A shared timer facility with at most one pending timer per key. Scheduling a timer for a key
///  replaces (i.e. cancels) a previously scheduled timer for that key, and the two steps happen
///  while the key's entry is locked so there is never more than one live timer per key.
///
/// NB: A timer whose action is already running can not be recalled. Actions that must not act
///      on stale state need to check for that themselves (e.g. by comparing a generation counter).
pub struct KeyedTimer<K: Hash + Eq> {
    timers: DashMap<K, JoinHandle<()>>,
}

impl<K: Hash + Eq> Default for KeyedTimer<K> {
    fn default() -> Self {
        KeyedTimer {
            timers: DashMap::default(),
        }
    }
}

impl<K: Hash + Eq> KeyedTimer<K> {
    pub fn schedule(&self, key: K, delay: Duration, action: impl FnOnce() + Send + 'static) {
        match self.timers.entry(key) {
            Entry::Occupied(mut e) => {
                e.get().abort();
                e.insert(Self::spawn_timer(delay, action));
            }
            Entry::Vacant(e) => {
                e.insert(Self::spawn_timer(delay, action));
            }
        }
    }

    fn spawn_timer(delay: Duration, action: impl FnOnce() + Send + 'static) -> JoinHandle<()> {
        tokio::spawn(async move {
            time::sleep(delay).await;
            action();
        })
    }

    pub fn cancel_all(&self) {
        self.timers.retain(|_, handle| {
            handle.abort();
            false
        });
    }

    #[cfg(test)]
    pub fn is_pending(&self, key: &K) -> bool {
        self.timers.get(key)
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }
}

impl<K: Hash + Eq> Drop for KeyedTimer<K> {
    fn drop(&mut self) {
        for entry in self.timers.iter() {
            entry.value().abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::sleep;

    fn counting_action(counter: &Arc<AtomicU32>) -> impl FnOnce() + Send + 'static {
        let counter = counter.clone();
        move || { counter.fetch_add(1, Ordering::SeqCst); }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires() {
        let timer = KeyedTimer::default();
        let counter = Arc::new(AtomicU32::new(0));

        timer.schedule("a", Duration::from_millis(100), counting_action(&counter));
        assert!(timer.is_pending(&"a"));

        sleep(Duration::from_millis(99)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        sleep(Duration::from_millis(2)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!timer.is_pending(&"a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_pending_timer() {
        let timer = KeyedTimer::default();
        let counter = Arc::new(AtomicU32::new(0));

        timer.schedule("a", Duration::from_millis(100), counting_action(&counter));
        sleep(Duration::from_millis(80)).await;
        timer.schedule("a", Duration::from_millis(100), counting_action(&counter));

        sleep(Duration::from_millis(90)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        sleep(Duration::from_millis(20)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let timer = KeyedTimer::default();
        let counter_a = Arc::new(AtomicU32::new(0));
        let counter_b = Arc::new(AtomicU32::new(0));

        timer.schedule("a", Duration::from_millis(100), counting_action(&counter_a));
        timer.schedule("b", Duration::from_millis(200), counting_action(&counter_b));

        sleep(Duration::from_millis(150)).await;
        assert_eq!(counter_a.load(Ordering::SeqCst), 1);
        assert_eq!(counter_b.load(Ordering::SeqCst), 0);

        sleep(Duration::from_millis(100)).await;
        assert_eq!(counter_b.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all() {
        let timer = KeyedTimer::default();
        let counter = Arc::new(AtomicU32::new(0));

        timer.schedule("a", Duration::from_millis(100), counting_action(&counter));
        timer.schedule("b", Duration::from_millis(100), counting_action(&counter));
        timer.cancel_all();
        assert!(!timer.is_pending(&"a"));

        sleep(Duration::from_millis(200)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        timer.schedule("c", Duration::from_millis(100), counting_action(&counter));
        sleep(Duration::from_millis(200)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
