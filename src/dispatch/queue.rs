//! Work queue with per-key deduplication and serialization.
//!
//! Guarantees the scheduling model the engine relies on: at most one
//! in-flight reconcile per object key, with events arriving during a
//! reconcile marking the key dirty for immediate re-enqueue once it
//! completes. Delayed adds implement requeue directives.

use std::collections::{BinaryHeap, HashSet, VecDeque};
use std::cmp::Reverse;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::api::ObjectKey;

#[derive(Default)]
struct QueueState {
    ready: VecDeque<ObjectKey>,
    queued: HashSet<ObjectKey>,
    in_flight: HashSet<ObjectKey>,
    dirty: HashSet<ObjectKey>,
    delayed: BinaryHeap<Reverse<DelayedEntry>>,
}

#[derive(PartialEq, Eq)]
struct DelayedEntry {
    due: Instant,
    key: ObjectKey,
}

impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due.cmp(&other.due).then_with(|| self.key.cmp(&other.key))
    }
}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    /// Enqueue a key. Duplicates of a queued key collapse; a key currently
    /// being reconciled is marked dirty and re-enqueued on completion.
    pub fn add(&self, key: ObjectKey) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.in_flight.contains(&key) {
            state.dirty.insert(key);
            return;
        }
        if state.queued.insert(key.clone()) {
            state.ready.push_back(key);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Enqueue a key after a delay; used for requeue directives and error
    /// backoff.
    pub fn add_after(&self, key: ObjectKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.delayed.push(Reverse(DelayedEntry {
            due: Instant::now() + delay,
            key,
        }));
        drop(state);
        // Wake a waiter so it recomputes its sleep deadline.
        self.notify.notify_one();
    }

    /// Await the next key, marking it in-flight. The caller must pair every
    /// returned key with a [`WorkQueue::done`] call.
    pub async fn next(&self) -> ObjectKey {
        loop {
            let wait_until = {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                let now = Instant::now();

                // Move due delayed entries into the ready queue.
                while state
                    .delayed
                    .peek()
                    .is_some_and(|Reverse(entry)| entry.due <= now)
                {
                    if let Some(Reverse(entry)) = state.delayed.pop() {
                        if state.in_flight.contains(&entry.key) {
                            state.dirty.insert(entry.key);
                        } else if state.queued.insert(entry.key.clone()) {
                            state.ready.push_back(entry.key);
                        }
                    }
                }

                if let Some(key) = state.ready.pop_front() {
                    state.queued.remove(&key);
                    state.in_flight.insert(key.clone());
                    if !state.ready.is_empty() {
                        // More work is ready; pass the wakeup on to the next
                        // waiting worker.
                        self.notify.notify_one();
                    }
                    return key;
                }

                state.delayed.peek().map(|Reverse(entry)| entry.due)
            };

            match wait_until {
                Some(due) => {
                    tokio::select! {
                        () = tokio::time::sleep_until(due) => {}
                        () = self.notify.notified() => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }

    /// Mark a key's reconcile finished. If events arrived for it in the
    /// meantime it is immediately re-enqueued.
    pub fn done(&self, key: &ObjectKey) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.in_flight.remove(key);
        if state.dirty.remove(key) && state.queued.insert(key.clone()) {
            state.ready.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new("ns", name)
    }

    #[tokio::test]
    async fn duplicate_adds_collapse() {
        let queue = WorkQueue::new();
        queue.add(key("a"));
        queue.add(key("a"));
        queue.add(key("b"));

        let first = queue.next().await;
        let second = queue.next().await;
        assert_eq!(first, key("a"));
        assert_eq!(second, key("b"));

        // Nothing else queued: a timed poll must not yield a third key.
        let extra = tokio::time::timeout(Duration::from_millis(50), queue.next()).await;
        assert!(extra.is_err());
    }

    #[tokio::test]
    async fn in_flight_key_is_requeued_after_done() {
        let queue = WorkQueue::new();
        queue.add(key("a"));
        let k = queue.next().await;

        // Event arrives while the key is being reconciled.
        queue.add(key("a"));
        let extra = tokio::time::timeout(Duration::from_millis(50), queue.next()).await;
        assert!(extra.is_err(), "key must not be handed out twice concurrently");

        queue.done(&k);
        let again = tokio::time::timeout(Duration::from_millis(50), queue.next()).await;
        assert_eq!(again.unwrap(), key("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_adds_become_ready_after_delay() {
        let queue = WorkQueue::new();
        queue.add_after(key("a"), Duration::from_secs(5));

        let early = tokio::time::timeout(Duration::from_secs(1), queue.next()).await;
        assert!(early.is_err());

        let late = tokio::time::timeout(Duration::from_secs(10), queue.next()).await;
        assert_eq!(late.unwrap(), key("a"));
    }
}
