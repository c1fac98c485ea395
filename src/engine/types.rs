//! Shared engine types: error taxonomy, reconcile actions, step outcomes and
//! the per-controller context.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::api::{ObjectKey, ObjectSpec};
use crate::engine::config::ControllerConfig;
use crate::store::{JobBackend, ObjectStore, ResourceCleaner};

/// Sentinel finalizer owned by the engine. Present on every object between
/// first apply and full delete-checklist completion.
pub const FINALIZER_NAME: &str = "reconcile.cto.dev/finalizer";

#[derive(Error, Debug)]
pub enum Error {
    /// Optimistic-concurrency mismatch on a store write. Recovered inside the
    /// reconciler by refetch-and-rerun; never surfaced to the dispatch layer.
    #[error("Write conflict: {0}")]
    Conflict(String),

    /// A create raced an existing resource. The job tracker treats this as
    /// "found" on the next pass.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Structurally invalid spec. Fatal for the current generation; clears
    /// only on a spec edit.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Store unreachable or misbehaving. Surfaced for dispatch-layer backoff.
    #[error("Store error: {0}")]
    Store(String),

    /// Job backend unreachable or misbehaving. Surfaced for dispatch-layer
    /// backoff.
    #[error("Job backend error: {0}")]
    JobBackend(String),

    /// The external side effect reported failure. No automatic retry beyond
    /// the dispatch layer's paced re-attempts.
    #[error("Execution job {job} failed: {message}")]
    JobExecutionFailed { job: ObjectKey, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Requeue directive returned to the dispatch layer, mirroring the
/// `requeue`/`await_change` pair controllers return upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    /// Re-invoke reconciliation after the given delay.
    #[must_use]
    pub fn requeue(after: Duration) -> Self {
        Self {
            requeue_after: Some(after),
        }
    }

    /// Nothing left to do until the object changes again.
    #[must_use]
    pub fn await_change() -> Self {
        Self {
            requeue_after: None,
        }
    }

    #[must_use]
    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }
}

/// Tri-state result of one checklist step.
///
/// `StillRunning` is a normal, non-erroring outcome ("nothing is wrong, just
/// not done yet") that produces a timed requeue; only `Failed` feeds the
/// dispatch layer's error backoff. Steps must express waiting through
/// `StillRunning` rather than blocking, so the shared worker pool never
/// starves.
#[derive(Debug)]
pub enum StepOutcome {
    Completed,
    StillRunning {
        reason: String,
        requeue_after: Duration,
    },
    Failed {
        error: Error,
    },
}

impl StepOutcome {
    #[must_use]
    pub fn still_running(reason: impl Into<String>, requeue_after: Duration) -> Self {
        StepOutcome::StillRunning {
            reason: reason.into(),
            requeue_after,
        }
    }

    #[must_use]
    pub fn failed(error: Error) -> Self {
        StepOutcome::Failed { error }
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, StepOutcome::Completed)
    }
}

/// Shared per-controller context handed to every step: the collaborator
/// capabilities plus configuration.
pub struct Context<S: ObjectSpec> {
    pub store: Arc<dyn ObjectStore<S>>,
    pub jobs: Arc<dyn JobBackend>,
    pub cleaner: Arc<dyn ResourceCleaner>,
    pub config: Arc<ControllerConfig>,
}

impl<S: ObjectSpec> Clone for Context<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            jobs: self.jobs.clone(),
            cleaner: self.cleaner.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: ObjectSpec> Context<S> {
    #[must_use]
    pub fn new(
        store: Arc<dyn ObjectStore<S>>,
        jobs: Arc<dyn JobBackend>,
        cleaner: Arc<dyn ResourceCleaner>,
        config: Arc<ControllerConfig>,
    ) -> Self {
        Self {
            store,
            jobs,
            cleaner,
            config,
        }
    }
}
