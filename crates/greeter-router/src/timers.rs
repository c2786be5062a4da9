//! Keyed, cancellable one-shot timers.
//!
//! Arming a key replaces (and aborts) any timer already armed for it.
//! Each armed timer carries a generation; when the sleep elapses the task
//! removes its own entry only if the generation is still current, and only
//! then runs the callback. A callback that started running is never aborted
//! by a later `arm` or `cancel` of the same key.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::AbortHandle;

struct Armed {
    generation: u64,
    handle: AbortHandle,
}

/// A map of cancellable timers keyed by `K`.
pub struct TimerSet<K> {
    armed: Arc<Mutex<HashMap<K, Armed>>>,
    generation: AtomicU64,
}

impl<K> TimerSet<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// Empty set.
    pub fn new() -> Self {
        Self {
            armed: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    /// Run `on_fire` after `after` unless re-armed or cancelled first.
    pub fn arm<F>(&self, key: K, after: Duration, on_fire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let armed = Arc::clone(&self.armed);
        let task_key = key.clone();

        // Spawn under the lock so the task cannot look itself up before it is inserted.
        let mut map = self.armed.lock();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let current = {
                let mut map = armed.lock();
                match map.get(&task_key) {
                    Some(entry) if entry.generation == generation => {
                        let _ = map.remove(&task_key);
                        true
                    }
                    _ => false,
                }
            };
            if current {
                on_fire.await;
            }
        })
        .abort_handle();

        if let Some(previous) = map.insert(key, Armed { generation, handle }) {
            previous.handle.abort();
        }
    }

    /// Disarm `key`. Returns whether a timer was pending.
    pub fn cancel(&self, key: &K) -> bool {
        match self.armed.lock().remove(key) {
            Some(entry) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Whether a timer is pending for `key`.
    pub fn is_armed(&self, key: &K) -> bool {
        self.armed.lock().contains_key(key)
    }

    /// Number of pending timers.
    pub fn len(&self) -> usize {
        self.armed.lock().len()
    }

    /// Whether no timer is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Disarm everything.
    pub fn cancel_all(&self) {
        for (_, entry) in self.armed.lock().drain() {
            entry.handle.abort();
        }
    }
}

impl<K> Default for TimerSet<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> std::fmt::Debug for TimerSet<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerSet")
            .field("armed", &self.armed.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn counter_future(hits: &Arc<AtomicUsize>) -> impl Future<Output = ()> + Send + 'static {
        let hits = Arc::clone(hits);
        async move {
            let _ = hits.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_duration() {
        let timers = TimerSet::new();
        let hits = Arc::new(AtomicUsize::new(0));
        timers.arm("k", Duration::from_secs(20), counter_future(&hits));
        assert!(timers.is_armed(&"k"));

        tokio::time::sleep(Duration::from_secs(19)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!timers.is_armed(&"k"));
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_replaces_previous() {
        let timers = TimerSet::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        timers.arm("k", Duration::from_secs(10), counter_future(&first));
        timers.arm("k", Duration::from_secs(30), counter_future(&second));
        assert_eq!(timers.len(), 1);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_fire() {
        let timers = TimerSet::new();
        let hits = Arc::new(AtomicUsize::new(0));
        timers.arm(1_u32, Duration::from_secs(5), counter_future(&hits));
        assert!(timers.cancel(&1));
        assert!(!timers.cancel(&1));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(timers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_disarms_every_key() {
        let timers = TimerSet::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for k in 0..3_u32 {
            timers.arm(k, Duration::from_secs(1), counter_future(&hits));
        }
        timers.cancel_all();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
