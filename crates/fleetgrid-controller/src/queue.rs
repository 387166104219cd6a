//! Rate-limited, deduplicating work queue.
//!
//! Keys move through three sets:
//!
//! - `dirty`: needs processing (queued, or re-added while in flight)
//! - `queue`: FIFO of dirty keys not currently in flight
//! - `processing`: handed to a worker and not yet `done`
//!
//! A key is in `queue` at most once and is never handed to two workers at
//! the same time.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tracing::debug;

use crate::rate_limiter::RateLimiter;

struct QueueState<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    shutting_down: bool,
}

struct Inner<K> {
    name: String,
    state: Mutex<QueueState<K>>,
    limiter: Mutex<Box<dyn RateLimiter<K>>>,
    notify: Notify,
}

/// Cloneable handle to a shared work queue.
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// Create a named queue that delays re-queued keys with `limiter`.
    pub fn new(name: &str, limiter: impl RateLimiter<K> + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                limiter: Mutex::new(Box::new(limiter)),
                notify: Notify::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Mark `key` as needing processing.
    ///
    /// No-op if the key is already waiting or the queue is shut down. A key
    /// that is in flight is queued again when its worker calls `done`.
    pub async fn add(&self, key: K) {
        {
            let mut state = self.inner.state.lock().await;
            if state.shutting_down || !state.dirty.insert(key.clone()) {
                return;
            }
            if state.processing.contains(&key) {
                return;
            }
            state.queue.push_back(key);
        }
        self.inner.notify.notify_one();
    }

    /// Add `key` once `delay` has elapsed.
    pub async fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key).await;
            return;
        }
        debug!(queue = %self.inner.name, ?delay, "delayed add scheduled");
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key).await;
        });
    }

    /// Add `key` after the delay the rate limiter assigns to it.
    pub async fn add_rate_limited(&self, key: K) {
        let delay = self.inner.limiter.lock().await.when(&key);
        self.add_after(key, delay).await;
    }

    /// Reset the rate limiter's backoff for `key`.
    pub async fn forget(&self, key: &K) {
        self.inner.limiter.lock().await.forget(key);
    }

    /// Number of rate-limited re-adds of `key` since it was last forgotten.
    pub async fn num_requeues(&self, key: &K) -> u32 {
        self.inner.limiter.lock().await.num_requeues(key)
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    ///
    /// The caller owns the key until it calls [`done`](Self::done).
    pub async fn get(&self) -> Option<K> {
        loop {
            // Register for wakeups before inspecting state so a concurrent
            // add or shutdown between the check and the await is not lost.
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock().await;
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Release `key` after processing. Re-queues it if it was added while
    /// in flight.
    pub async fn done(&self, key: &K) {
        let requeued = {
            let mut state = self.inner.state.lock().await;
            state.processing.remove(key);
            if state.dirty.contains(key) && !state.shutting_down {
                state.queue.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.inner.notify.notify_one();
        }
    }

    /// Stop handing out keys. Every pending and future `get` returns `None`.
    pub async fn shut_down(&self) {
        {
            let mut state = self.inner.state.lock().await;
            state.shutting_down = true;
        }
        self.inner.notify.notify_waiters();
        debug!(queue = %self.inner.name, "work queue shut down");
    }

    pub async fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().await.shutting_down
    }

    /// Number of keys waiting to be handed out.
    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.queue.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
