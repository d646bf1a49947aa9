//! Per-kind work queue.
//!
//! Keys are deduplicated while queued, and a key that is being reconciled is
//! never handed out a second time: an add against an active key marks it
//! dirty and it is requeued when the reconcile finishes. Failed keys come
//! back with exponential per-key backoff.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::trace;

use crate::translate::refs::ResourceRef;

const BASE_DELAY: Duration = Duration::from_millis(100);
const MAX_DELAY: Duration = Duration::from_secs(30);

#[derive(Default)]
struct State {
    queue: VecDeque<ResourceRef>,
    queued: HashSet<ResourceRef>,
    active: HashSet<ResourceRef>,
    dirty: HashSet<ResourceRef>,
    failures: HashMap<ResourceRef, u32>,
    shutdown: bool,
}

pub struct WorkQueue {
    state: Mutex<State>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
        })
    }

    /// Enqueue a key. No-op while the key is already queued; marks the key
    /// dirty while it is actively being reconciled.
    pub fn add(&self, key: ResourceRef) {
        let mut state = self.state.lock().unwrap();
        if state.shutdown {
            return;
        }
        if state.active.contains(&key) {
            state.dirty.insert(key);
            return;
        }
        if state.queued.insert(key.clone()) {
            state.queue.push_back(key);
            self.notify.notify_one();
        }
    }

    /// Next key to reconcile; `None` once the queue is shut down
    pub async fn next(&self) -> Option<ResourceRef> {
        loop {
            let notified = {
                let mut state = self.state.lock().unwrap();
                if let Some(key) = state.queue.pop_front() {
                    state.queued.remove(&key);
                    state.active.insert(key.clone());
                    return Some(key);
                }
                if state.shutdown {
                    // Cascade so every parked worker observes the shutdown.
                    self.notify.notify_one();
                    return None;
                }
                self.notify.notified()
            };
            notified.await;
        }
    }

    /// Mark a reconcile as finished successfully
    pub fn done(&self, key: &ResourceRef) {
        let mut state = self.state.lock().unwrap();
        state.active.remove(key);
        state.failures.remove(key);
        if state.dirty.remove(key) && state.queued.insert(key.clone()) {
            state.queue.push_back(key.clone());
            self.notify.notify_one();
        }
    }

    /// Mark a reconcile as failed and requeue the key after its per-key
    /// backoff delay
    pub fn requeue_after_failure(self: &Arc<Self>, key: ResourceRef) {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.active.remove(&key);
            state.dirty.remove(&key);
            let failures = state.failures.entry(key.clone()).or_insert(0);
            *failures += 1;
            Self::backoff_for(*failures)
        };
        trace!(key = %key, delay_ms = delay.as_millis(), "requeueing after failure");

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Exponential backoff for the n-th consecutive failure, capped
    pub fn backoff_for(failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        let delay = BASE_DELAY.saturating_mul(1u32 << exp);
        delay.min(MAX_DELAY)
    }

    /// Stop handing out keys; parked workers wake up and drain
    pub fn shut_down(&self) {
        let mut state = self.state.lock().unwrap();
        state.shutdown = true;
        state.queue.clear();
        state.queued.clear();
        drop(state);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    #[cfg(test)]
    fn queued_len(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> ResourceRef {
        ResourceRef::new("test", name)
    }

    #[tokio::test]
    async fn adds_are_deduplicated_while_queued() {
        let queue = WorkQueue::new();
        queue.add(key("a"));
        queue.add(key("a"));
        queue.add(key("b"));
        assert_eq!(queue.queued_len(), 2);
    }

    #[tokio::test]
    async fn active_key_is_requeued_not_delivered_twice() {
        let queue = WorkQueue::new();
        queue.add(key("a"));

        let got = queue.next().await.unwrap();
        assert_eq!(got, key("a"));

        // While "a" is active, a new event must not hand it out again.
        queue.add(key("a"));
        assert_eq!(queue.queued_len(), 0);

        // Finishing the reconcile surfaces the dirty key once more.
        queue.done(&got);
        assert_eq!(queue.queued_len(), 1);
        assert_eq!(queue.next().await.unwrap(), key("a"));
    }

    #[tokio::test]
    async fn backoff_grows_and_caps() {
        assert_eq!(WorkQueue::backoff_for(1), Duration::from_millis(100));
        assert_eq!(WorkQueue::backoff_for(2), Duration::from_millis(200));
        assert_eq!(WorkQueue::backoff_for(4), Duration::from_millis(800));
        assert_eq!(WorkQueue::backoff_for(20), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn success_resets_backoff() {
        let queue = WorkQueue::new();
        queue.add(key("a"));
        let got = queue.next().await.unwrap();
        queue.requeue_after_failure(got.clone());
        {
            let state = queue.state.lock().unwrap();
            assert_eq!(state.failures.get(&key("a")), Some(&1));
        }
        // The spawned timer re-adds it; simulate the next round directly.
        queue.add(key("a"));
        let got = queue.next().await.unwrap();
        queue.done(&got);
        let state = queue.state.lock().unwrap();
        assert!(state.failures.is_empty());
    }

    #[tokio::test]
    async fn shutdown_wakes_all_workers() {
        let queue = WorkQueue::new();
        let q1 = Arc::clone(&queue);
        let q2 = Arc::clone(&queue);
        let w1 = tokio::spawn(async move { q1.next().await });
        let w2 = tokio::spawn(async move { q2.next().await });

        tokio::task::yield_now().await;
        queue.shut_down();

        assert!(w1.await.unwrap().is_none());
        assert!(w2.await.unwrap().is_none());
    }
}
