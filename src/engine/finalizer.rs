//! Finalizer-gated deletion protocol.
//!
//! The sentinel finalizer must be on the object before any apply side effect
//! runs, so a deletion request can never slip in before cleanup is
//! registered. On deletion the delete checklist runs through the same
//! executor as apply; only once it fully completes (and the owned-resource
//! ledger is drained) is the finalizer removed, at which point the store is
//! free to erase the object.

use tracing::{debug, info, warn};

use crate::api::{ManagedObject, ObjectSpec, Phase};
use crate::engine::checklist::{Checklist, ChecklistExecutor, ChecklistOutcome, StepRegistry};
use crate::engine::owned;
use crate::engine::types::{Action, Context, Result, StepOutcome, FINALIZER_NAME};

pub struct FinalizerManager;

impl FinalizerManager {
    /// Ensure the sentinel finalizer is present. Returns `true` when it was
    /// just added — the caller must end the reconcile there and requeue, so
    /// apply logic only ever runs once the finalizer is confirmed present.
    pub async fn ensure<S: ObjectSpec>(
        ctx: &Context<S>,
        obj: &mut ManagedObject<S>,
    ) -> Result<bool> {
        if obj.has_finalizer(FINALIZER_NAME) {
            return Ok(false);
        }

        info!(object = %obj.key(), "Adding finalizer before first apply");
        obj.meta.finalizers.push(FINALIZER_NAME.to_string());
        *obj = ctx.store.update(obj).await?;
        Ok(true)
    }

    /// Run the delete checklist to completion, then drain the owned-resource
    /// ledger and remove the finalizer.
    ///
    /// A `Failed` delete checklist keeps the finalizer and surfaces the
    /// error: deletion stalls safely instead of leaking the external
    /// resource.
    pub async fn finalize<S: ObjectSpec>(
        ctx: &Context<S>,
        registry: &StepRegistry<S>,
        delete_checklist: &Checklist,
        obj: &mut ManagedObject<S>,
    ) -> Result<Action> {
        if !obj.has_finalizer(FINALIZER_NAME) {
            // Deletion was requested before the first apply got anywhere;
            // nothing to clean up and nothing blocks the store.
            debug!(object = %obj.key(), "No finalizer present, nothing to finalize");
            return Ok(Action::await_change());
        }

        let executor = ChecklistExecutor::new(ctx, registry);
        match executor.execute(delete_checklist, obj).await? {
            ChecklistOutcome::AllCompleted => {
                if !owned::cleanup_owned(ctx, obj).await? {
                    // Some owned resource could not be deleted. The finalizer
                    // stays on until the ledger drains, otherwise the store
                    // would erase the object and leak the resource.
                    warn!(
                        object = %obj.key(),
                        remaining = obj.status.owned_resources.len(),
                        "Owned resources not fully cleaned up, keeping finalizer"
                    );
                    return Ok(Action::requeue(ctx.config.finalizer_requeue()));
                }

                info!(object = %obj.key(), "Delete checklist completed, removing finalizer");
                obj.meta.finalizers.retain(|f| f != FINALIZER_NAME);
                *obj = ctx.store.update(obj).await?;
                Ok(Action::await_change())
            }
            ChecklistOutcome::Halted { step, outcome } => match outcome {
                StepOutcome::StillRunning {
                    reason,
                    requeue_after,
                } => {
                    debug!(object = %obj.key(), step = %step, reason = %reason, "Delete checklist still running");
                    Ok(Action::requeue(requeue_after))
                }
                StepOutcome::Failed { error } => {
                    obj.status.phase = Phase::Failed;
                    obj.status.message = Some(format!("deletion blocked: {error}"));
                    *obj = ctx.store.update_status(obj).await?;
                    Err(error)
                }
                // The executor never halts on Completed; re-walk shortly.
                StepOutcome::Completed => Ok(Action::requeue(ctx.config.finalizer_requeue())),
            },
        }
    }
}
