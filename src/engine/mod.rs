//! The reconciliation engine: loop, checklist executor, job phase tracker,
//! finalizer protocol and owned-resource ledger.

use futures::Stream;
use std::sync::Arc;
use tracing::{info, instrument};

pub mod checklist;
pub mod config;
pub mod finalizer;
pub mod job;
pub mod owned;
pub mod reconciler;
pub mod types;

// Re-export commonly used items
pub use checklist::{Checklist, ChecklistEntry, ChecklistExecutor, ChecklistOutcome, Step, StepRegistry};
pub use config::ControllerConfig;
pub use finalizer::FinalizerManager;
pub use job::{job_name, JobPhase, JobPhaseTracker, JobStep};
pub use reconciler::Reconciler;
pub use types::{Action, Context, Error, Result, StepOutcome, FINALIZER_NAME};

use crate::api::{ObjectKey, ObjectSpec};
use crate::dispatch::Dispatcher;

/// Main entry point for one controller: wires the reconciler to the dispatch
/// layer and runs until the event stream ends.
///
/// `events` is the store's change feed (watch/resync delivery is the store's
/// concern, not the engine's); the dispatch layer deduplicates it, serializes
/// per key and fans out to the worker pool.
#[instrument(skip(reconciler, events), fields(kind = %reconciler.kind()))]
pub async fn run_controller<S, E>(reconciler: Arc<Reconciler<S>>, events: E) -> Result<()>
where
    S: ObjectSpec,
    E: Stream<Item = ObjectKey> + Send + 'static,
{
    let config = reconciler.context().config.clone();
    config
        .validate()
        .map_err(|e| Error::Config(e.to_string()))?;

    info!(
        kind = %reconciler.kind(),
        workers = config.controller.max_concurrent_reconciles,
        period_seconds = config.controller.reconcile_period_seconds,
        "Starting controller"
    );

    Dispatcher::new(config).run(reconciler, events).await;

    info!("Controller shutting down");
    Ok(())
}
