//! Skiff work queue: deduplicating, rate-limited delivery of work items to workers.
//!
//! An item is either pending (in the queue), in flight (handed out by [`WorkQueue::get`] and
//! not yet [`WorkQueue::done`]), or both dirty and in flight when it was added again while being
//! processed. An in-flight item is never handed out a second time; its dirty copy is queued
//! again once `done` is called.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use metrics::{counter, gauge};
use rustc_hash::FxHashSet;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

mod limiter;

pub use limiter::{
    controller_rate_limiter, default_controller_rate_limiter, BucketRateLimiter, ItemExponentialBackoff,
    MaxOfRateLimiter, RateLimiter,
};

struct State<T> {
    queue: VecDeque<T>,
    /// Items that need processing: everything pending, plus in-flight items added again.
    dirty: FxHashSet<T>,
    processing: FxHashSet<T>,
    shutting_down: bool,
}

struct Inner<T> {
    name: String,
    state: Mutex<State<T>>,
    notify: Notify,
    limiter: Box<dyn RateLimiter<T>>,
    shutdown: CancellationToken,
}

impl<T> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }
}

/// Cloneable handle to a shared work queue.
pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self { Self { inner: Arc::clone(&self.inner) } }
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, limiter: impl RateLimiter<T> + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: FxHashSet::default(),
                    processing: FxHashSet::default(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                limiter: Box::new(limiter),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn name(&self) -> &str { &self.inner.name }

    /// Queue `item` unless it is already pending. An in-flight item is only marked dirty.
    pub fn add(&self, item: T) {
        let mut st = self.inner.lock();
        if st.shutting_down {
            return;
        }
        if !st.dirty.insert(item.clone()) {
            return;
        }
        counter!("skiff_queue_adds_total", 1u64, "queue" => self.inner.name.clone());
        if st.processing.contains(&item) {
            trace!(queue = %self.inner.name, "item in flight; marked dirty");
            return;
        }
        st.queue.push_back(item);
        gauge!("skiff_queue_depth", st.queue.len() as f64, "queue" => self.inner.name.clone());
        drop(st);
        self.inner.notify.notify_one();
    }

    /// Wait for the next item and mark it in flight. `None` once the queue is shut down.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // register before looking, so an add between the check and the await is not missed
            notified.as_mut().enable();
            {
                let mut st = self.inner.lock();
                if st.shutting_down {
                    return None;
                }
                if let Some(item) = st.queue.pop_front() {
                    st.dirty.remove(&item);
                    st.processing.insert(item.clone());
                    gauge!("skiff_queue_depth", st.queue.len() as f64, "queue" => self.inner.name.clone());
                    return Some(item);
                }
            }
            notified.await;
        }
    }

    /// Release an item handed out by `get`; queues it again if it was added meanwhile.
    pub fn done(&self, item: &T) {
        let mut st = self.inner.lock();
        st.processing.remove(item);
        if st.dirty.contains(item) {
            st.queue.push_back(item.clone());
            gauge!("skiff_queue_depth", st.queue.len() as f64, "queue" => self.inner.name.clone());
            drop(st);
            self.inner.notify.notify_one();
        }
    }

    /// Add `item` once `delay` has passed, without blocking the caller.
    pub fn add_after(&self, item: T, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let queue = self.clone();
        let token = self.inner.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => queue.add(item),
            }
        });
    }

    /// Add `item` after the delay its retry history calls for, and count the retry.
    pub fn add_rate_limited(&self, item: T) {
        if self.is_shutting_down() {
            return;
        }
        let delay = self.inner.limiter.when(&item);
        counter!("skiff_queue_retries_total", 1u64, "queue" => self.inner.name.clone());
        debug!(queue = %self.inner.name, delay_ms = delay.as_millis() as u64, "rate-limited requeue");
        self.add_after(item, delay);
    }

    /// Clear the retry history of `item`. Does not touch queue membership.
    pub fn forget(&self, item: &T) { self.inner.limiter.forget(item) }

    pub fn num_requeues(&self, item: &T) -> u32 { self.inner.limiter.num_requeues(item) }

    /// Stop handing out items and wake every waiting `get`. Idempotent.
    pub fn shut_down(&self) {
        let mut st = self.inner.lock();
        if st.shutting_down {
            return;
        }
        st.shutting_down = true;
        drop(st);
        self.inner.shutdown.cancel();
        self.inner.notify.notify_waiters();
        debug!(queue = %self.inner.name, "work queue shut down");
    }

    pub fn is_shutting_down(&self) -> bool { self.inner.lock().shutting_down }

    /// Number of pending items (not counting in-flight ones).
    pub fn len(&self) -> usize { self.inner.lock().queue.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Number of items handed out and not yet done.
    pub fn in_flight(&self) -> usize { self.inner.lock().processing.len() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> WorkQueue<&'static str> {
        WorkQueue::new("test", ItemExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1)))
    }

    #[tokio::test]
    async fn pending_items_are_deduplicated() {
        let q = queue();
        q.add("a");
        q.add("a");
        q.add("b");
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await, Some("a"));
        assert_eq!(q.get().await, Some("b"));
        assert!(q.is_empty());
        assert_eq!(q.in_flight(), 2);
    }

    #[tokio::test]
    async fn add_while_in_flight_is_redelivered_once_after_done() {
        let q = queue();
        q.add("a");
        let item = q.get().await.unwrap();
        q.add("a");
        q.add("a");
        assert_eq!(q.len(), 0, "in-flight item must not be queued twice");
        q.done(&item);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some("a"));
        q.done(&"a");
        assert!(q.is_empty());
        assert_eq!(q.in_flight(), 0);
    }

    #[tokio::test]
    async fn done_without_re_add_leaves_queue_empty() {
        let q = queue();
        q.add("a");
        let item = q.get().await.unwrap();
        q.done(&item);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn forget_keeps_membership() {
        let q = queue();
        q.add("a");
        q.forget(&"a");
        assert_eq!(q.len(), 1);
    }
}
