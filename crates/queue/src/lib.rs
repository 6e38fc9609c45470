//! Vigil work queue: a deduplicating, delaying, rate-limited queue of work items.
//!
//! Every item is in at most one of three places at a time:
//! - pending: waiting in FIFO order to be handed to a worker,
//! - processing: owned by a worker between [`WorkQueue::get`] and [`WorkQueue::done`],
//! - waiting: parked by [`WorkQueue::add_after`] until its delay expires.
//!
//! Adding an item that is already pending is a no-op. Adding an item that is processing marks it
//! dirty; it is re-queued once when the worker calls `done`. Two workers never hold the same item.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

mod rate_limit;

pub use rate_limit::{
    default_controller_rate_limiter, BucketRateLimiter, ItemExponentialFailureRateLimiter, MaxOfRateLimiter,
    RateLimiter,
};

/// Longest delay [`WorkQueue::add_after`] honours; longer delays are clamped to it.
pub const MAX_DELAY: Duration = Duration::from_secs(30 * 24 * 60 * 60);

struct State<K> {
    queue: VecDeque<K>,
    /// Items that need processing: everything pending plus processing items added again.
    dirty: FxHashSet<K>,
    processing: FxHashSet<K>,
    /// Delayed items, the instant they become ready, and their timer.
    waiting: FxHashMap<K, (Instant, AbortHandle)>,
    enqueued_at: FxHashMap<K, Instant>,
    started_at: FxHashMap<K, Instant>,
    shutting_down: bool,
}

struct Inner<K> {
    name: String,
    state: Mutex<State<K>>,
    /// Wakes workers blocked in `get`.
    ready: Notify,
    /// Wakes `shutdown_with_drain` when the processing set empties.
    drained: Notify,
    limiter: Box<dyn RateLimiter<K>>,
}

/// Shared handle to a work queue. Clones refer to the same queue.
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self { Self { inner: Arc::clone(&self.inner) } }
}

impl<K> WorkQueue<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// Queue using [`default_controller_rate_limiter`].
    pub fn new(name: &str) -> Self { Self::with_rate_limiter(name, default_controller_rate_limiter()) }

    pub fn with_rate_limiter(name: &str, limiter: impl RateLimiter<K> + 'static) -> Self {
        let state = State {
            queue: VecDeque::new(),
            dirty: FxHashSet::default(),
            processing: FxHashSet::default(),
            waiting: FxHashMap::default(),
            enqueued_at: FxHashMap::default(),
            started_at: FxHashMap::default(),
            shutting_down: false,
        };
        Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                state: Mutex::new(state),
                ready: Notify::new(),
                drained: Notify::new(),
                limiter: Box::new(limiter),
            }),
        }
    }

    pub fn name(&self) -> &str { &self.inner.name }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        // Bookkeeping is updated atomically under the lock, so a poisoned guard is still consistent.
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn report_depth(&self, depth: usize) {
        gauge!("vigil_queue_depth", depth as f64, "queue" => self.inner.name.clone());
    }

    /// Mark `item` as needing processing. Never blocks beyond the internal lock.
    pub fn add(&self, item: K) {
        let depth = {
            let mut st = self.lock();
            if st.shutting_down || st.dirty.contains(&item) {
                return;
            }
            st.dirty.insert(item.clone());
            if st.processing.contains(&item) {
                // Re-queued by `done`.
                return;
            }
            st.enqueued_at.insert(item.clone(), Instant::now());
            st.queue.push_back(item);
            st.queue.len()
        };
        counter!("vigil_queue_adds_total", 1u64, "queue" => self.inner.name.clone());
        self.report_depth(depth);
        self.inner.ready.notify_one();
    }

    /// Wait for the oldest pending item and take ownership of it.
    ///
    /// Returns `None` once the queue has been shut down and no pending items remain.
    pub async fn get(&self) -> Option<K> {
        loop {
            // Register interest before inspecting state so a concurrent add or shutdown is not missed.
            let notified = self.inner.ready.notified();
            {
                let mut st = self.lock();
                if let Some(item) = st.queue.pop_front() {
                    st.dirty.remove(&item);
                    st.processing.insert(item.clone());
                    let now = Instant::now();
                    if let Some(t) = st.enqueued_at.remove(&item) {
                        histogram!("vigil_queue_latency_seconds", now.saturating_duration_since(t).as_secs_f64(), "queue" => self.inner.name.clone());
                    }
                    st.started_at.insert(item.clone(), now);
                    let depth = st.queue.len();
                    drop(st);
                    self.report_depth(depth);
                    if depth > 0 {
                        self.inner.ready.notify_one();
                    }
                    return Some(item);
                }
                if st.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Release `item` after processing. Re-queues it if it was added again meanwhile.
    pub fn done(&self, item: &K) {
        let (requeued, depth, idle) = {
            let mut st = self.lock();
            st.processing.remove(item);
            if let Some(t) = st.started_at.remove(item) {
                histogram!("vigil_queue_work_duration_seconds", t.elapsed().as_secs_f64(), "queue" => self.inner.name.clone());
            }
            let requeued = st.dirty.contains(item);
            if requeued {
                st.enqueued_at.insert(item.clone(), Instant::now());
                st.queue.push_back(item.clone());
            }
            (requeued, st.queue.len(), st.processing.is_empty())
        };
        if requeued {
            self.report_depth(depth);
            self.inner.ready.notify_one();
        }
        if idle {
            self.inner.drained.notify_waiters();
        }
    }

    /// Add `item` once `delay` has elapsed. Repeated delayed adds of a waiting item keep the earliest
    /// deadline; a superseded timer is cancelled. Delays are capped at [`MAX_DELAY`].
    pub fn add_after(&self, item: K, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let delay = delay.min(MAX_DELAY);
        let ready_at = Instant::now() + delay;
        {
            let mut st = self.lock();
            if st.shutting_down {
                return;
            }
            if let Some((existing, timer)) = st.waiting.get(&item) {
                if *existing <= ready_at {
                    return;
                }
                timer.abort();
            }
            let timer = tokio::spawn(self.clone().fire_at(item.clone(), ready_at));
            st.waiting.insert(item, (ready_at, timer.abort_handle()));
        }
        trace!(queue = %self.inner.name, delay_ms = delay.as_millis() as u64, "item parked");
    }

    async fn fire_at(self, item: K, ready_at: Instant) {
        tokio::time::sleep_until(ready_at).await;
        let fire = {
            let mut st = self.lock();
            match st.waiting.get(&item) {
                // Only the timer owning the current deadline delivers.
                Some((t, _)) if *t == ready_at => {
                    st.waiting.remove(&item);
                    true
                }
                _ => false,
            }
        };
        if fire {
            self.add(item);
        }
    }

    /// Re-queue `item` after the delay chosen by the rate limiter. Counts as one failure.
    pub fn add_rate_limited(&self, item: K) {
        let delay = self.inner.limiter.when(&item);
        counter!("vigil_queue_retries_total", 1u64, "queue" => self.inner.name.clone());
        self.add_after(item, delay);
    }

    /// Reset the failure history of `item`.
    pub fn forget(&self, item: &K) { self.inner.limiter.forget(item) }

    pub fn num_requeues(&self, item: &K) -> u32 { self.inner.limiter.num_requeues(item) }

    /// Number of pending items.
    pub fn len(&self) -> usize { self.lock().queue.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn is_shutting_down(&self) -> bool { self.lock().shutting_down }

    /// Stop accepting items and wake every waiting worker. Pending items are still handed out.
    pub fn shutdown(&self) {
        {
            let mut st = self.lock();
            if st.shutting_down {
                return;
            }
            st.shutting_down = true;
            for (_, (_, timer)) in st.waiting.drain() {
                timer.abort();
            }
        }
        debug!(queue = %self.inner.name, "queue shutting down");
        self.inner.ready.notify_waiters();
    }

    /// [`shutdown`](Self::shutdown), then wait until no item is being processed.
    pub async fn shutdown_with_drain(&self) {
        self.shutdown();
        loop {
            let notified = self.inner.drained.notified();
            if self.lock().processing.is_empty() {
                return;
            }
            notified.await;
        }
    }
}
