//! Dispatch layer: event fan-in, worker pool and error backoff.
//!
//! Consumes the store's change feed, deduplicates it through the work queue
//! and runs up to `maxConcurrentReconciles` reconciles concurrently, never
//! two for the same key. Errors get capped exponential backoff with jitter;
//! requeue directives get timed re-adds; every object is resynced
//! periodically even when fully converged.

pub mod queue;

pub use queue::WorkQueue;

use futures::{Stream, StreamExt};
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::api::{ObjectKey, ObjectSpec};
use crate::engine::config::ControllerConfig;
use crate::engine::reconciler::Reconciler;

/// Per-key failure counter feeding capped exponential backoff. Reset on the
/// first successful reconcile.
struct Backoff {
    base: Duration,
    max: Duration,
    attempts: Mutex<HashMap<ObjectKey, u32>>,
}

impl Backoff {
    fn new(config: &ControllerConfig) -> Self {
        Self {
            base: Duration::from_secs(config.backoff.base_seconds),
            max: Duration::from_secs(config.backoff.max_seconds),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    fn next_delay(&self, key: &ObjectKey) -> Duration {
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        let n = attempts.entry(key.clone()).or_insert(0);
        *n = n.saturating_add(1);
        let exp = n.saturating_sub(1).min(16);
        let delay = self
            .base
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max);
        // Jitter between 50% and 100% of the computed delay spreads retries
        // of correlated failures.
        let jitter = rand::thread_rng().gen_range(0.5..=1.0);
        delay.mul_f64(jitter)
    }

    fn reset(&self, key: &ObjectKey) {
        self.attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }
}

pub struct Dispatcher {
    config: Arc<ControllerConfig>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(config: Arc<ControllerConfig>) -> Self {
        Self { config }
    }

    /// Run the dispatch loop until the event stream ends. Production stores
    /// supply an unending change feed, so this runs for the controller's
    /// lifetime; closing the feed is the shutdown signal.
    pub async fn run<S, E>(&self, reconciler: Arc<Reconciler<S>>, events: E)
    where
        S: ObjectSpec,
        E: Stream<Item = ObjectKey> + Send + 'static,
    {
        let queue = Arc::new(WorkQueue::new());
        let backoff = Arc::new(Backoff::new(&self.config));

        // Event pump: store change feed -> queue.
        let pump = {
            let queue = queue.clone();
            tokio::spawn(async move {
                futures::pin_mut!(events);
                while let Some(key) = events.next().await {
                    queue.add(key);
                }
                debug!("Event stream ended");
            })
        };

        // Periodic resync: even converged objects are re-verified.
        let resync = {
            let queue = queue.clone();
            let store = reconciler.context().store.clone();
            let period = self.config.reconcile_period();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    match store.list_keys().await {
                        Ok(keys) => {
                            debug!(count = keys.len(), "Resyncing all objects");
                            for key in keys {
                                queue.add(key);
                            }
                        }
                        Err(e) => warn!(error = %e, "Resync listing failed"),
                    }
                }
            })
        };

        let workers: Vec<_> = (0..self.config.controller.max_concurrent_reconciles)
            .map(|worker_id| {
                let queue = queue.clone();
                let backoff = backoff.clone();
                let reconciler = reconciler.clone();
                let timeout = self.config.reconcile_timeout();
                tokio::spawn(async move {
                    info!(worker_id, "Reconcile worker started");
                    loop {
                        let key = queue.next().await;
                        let result =
                            tokio::time::timeout(timeout, reconciler.reconcile(&key)).await;
                        queue.done(&key);

                        match result {
                            Ok(Ok(action)) => {
                                backoff.reset(&key);
                                if let Some(delay) = action.requeue_after() {
                                    queue.add_after(key, delay);
                                }
                            }
                            Ok(Err(e)) => {
                                let delay = backoff.next_delay(&key);
                                error!(
                                    object = %key,
                                    error = %e,
                                    backoff_ms = delay.as_millis() as u64,
                                    "Reconcile failed, backing off"
                                );
                                queue.add_after(key, delay);
                            }
                            Err(_) => {
                                let delay = backoff.next_delay(&key);
                                error!(
                                    object = %key,
                                    backoff_ms = delay.as_millis() as u64,
                                    "Reconcile deadline exceeded, backing off"
                                );
                                queue.add_after(key, delay);
                            }
                        }
                    }
                })
            })
            .collect();

        let _ = pump.await;
        resync.abort();
        for worker in workers {
            worker.abort();
        }
    }
}
