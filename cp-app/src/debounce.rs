//! Keyed single-shot coalescing timers.
//!
//! Arming a key cancels whatever timer is pending for it, so at most one
//! timer per key is outstanding and it fires `delay` after the last arm.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

struct PendingTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

type TimerMap<K> = Arc<Mutex<HashMap<K, PendingTimer>>>;

pub struct Debouncer<K> {
    timers: TimerMap<K>,
    next_generation: AtomicU64,
}

impl<K> Default for Debouncer<K> {
    fn default() -> Self {
        Self {
            timers: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
        }
    }
}

fn lock<K>(timers: &TimerMap<K>) -> MutexGuard<'_, HashMap<K, PendingTimer>> {
    timers.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<K> Debouncer<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `task` to run after `delay`, replacing any timer pending for `key`.
    ///
    /// A replaced timer is aborted before it runs, dropping whatever its
    /// closure captured. Once a timer starts running it can no longer be
    /// replaced.
    pub fn arm<F, Fut>(&self, key: K, delay: Duration, task: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let timers = Arc::clone(&self.timers);
        let task_key = key.clone();

        let mut guard = lock(&self.timers);
        let rearmed = match guard.remove(&key) {
            Some(previous) => {
                previous.handle.abort();
                true
            }
            None => false,
        };
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut guard = lock(&timers);
                match guard.get(&task_key) {
                    Some(current) if current.generation == generation => {
                        guard.remove(&task_key);
                    }
                    _ => return,
                }
            }
            task().await;
        });
        guard.insert(key, PendingTimer { generation, handle });
        tracing::trace!(generation, rearmed, "coalescing timer armed");
    }

    /// Cancels the pending timer for `key`. Returns whether one was pending.
    pub fn cancel(&self, key: &K) -> bool {
        match lock(&self.timers).remove(key) {
            Some(pending) => {
                pending.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, key: &K) -> bool {
        lock(&self.timers).contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.timers).len()
    }

    /// Aborts every pending timer.
    pub fn cancel_all(&self) {
        for (_, pending) in lock(&self.timers).drain() {
            pending.handle.abort();
        }
    }
}
