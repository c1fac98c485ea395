//! Top-level per-object reconcile state machine.
//!
//! One `Reconciler` per controller: it owns the apply and delete checklists,
//! the step registry and the shared context, and exposes the single
//! `reconcile(key)` entry point the dispatch layer invokes. The loop never
//! blocks on external work and never panics; waiting is a requeue, failure is
//! an error the dispatch layer backs off on.

use tracing::{debug, info, instrument, warn};

use crate::api::{CheckRecord, ManagedObject, ObjectKey, ObjectSpec, Phase, LABEL_CONTROLLER};
use crate::engine::checklist::{Checklist, ChecklistExecutor, ChecklistOutcome, StepRegistry};
use crate::engine::finalizer::FinalizerManager;
use crate::engine::types::{Action, Context, Error, Result, StepOutcome};

pub struct Reconciler<S: ObjectSpec> {
    kind: String,
    ctx: Context<S>,
    apply_checklist: Checklist,
    delete_checklist: Checklist,
    registry: StepRegistry<S>,
}

impl<S: ObjectSpec> Reconciler<S> {
    #[must_use]
    pub fn new(
        kind: impl Into<String>,
        ctx: Context<S>,
        apply_checklist: Checklist,
        delete_checklist: Checklist,
        registry: StepRegistry<S>,
    ) -> Self {
        Self {
            kind: kind.into(),
            ctx,
            apply_checklist,
            delete_checklist,
            registry,
        }
    }

    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    #[must_use]
    pub fn context(&self) -> &Context<S> {
        &self.ctx
    }

    /// Reconcile one object by key.
    ///
    /// Write conflicts are recovered here by refetching and re-running; the
    /// dispatch layer only ever sees real errors.
    #[instrument(skip(self), fields(kind = %self.kind, object = %key))]
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let retries = self.ctx.config.controller.conflict_retries;
        let mut attempt = 0;
        loop {
            match self.reconcile_inner(key).await {
                Err(Error::Conflict(detail)) if attempt < retries => {
                    attempt += 1;
                    debug!(
                        object = %key,
                        attempt,
                        detail = %detail,
                        "Write conflict, refetching and re-running"
                    );
                }
                Err(Error::Conflict(detail)) => {
                    warn!(object = %key, detail = %detail, "Write conflicts persist, requeueing");
                    return Ok(Action::requeue(self.ctx.config.finalizer_requeue()));
                }
                other => return other,
            }
        }
    }

    async fn reconcile_inner(&self, key: &ObjectKey) -> Result<Action> {
        let Some(mut obj) = self.ctx.store.get(key).await? else {
            // Object is gone; terminal success, nothing to retry.
            debug!(object = %key, "Object not found, nothing to do");
            return Ok(Action::await_change());
        };

        info!(
            object = %key,
            generation = obj.generation(),
            phase = %obj.status.phase,
            "Reconciling"
        );

        if obj.is_marked_for_deletion() {
            return FinalizerManager::finalize(
                &self.ctx,
                &self.registry,
                &self.delete_checklist,
                &mut obj,
            )
            .await;
        }

        if self.ensure_bookkeeping(&mut obj).await? {
            // Finalizer was just added; that update triggers its own
            // reconcile, and apply must not start before it is confirmed.
            return Ok(Action::requeue(self.ctx.config.finalizer_requeue()));
        }

        let executor = ChecklistExecutor::new(&self.ctx, &self.registry);
        match executor.execute(&self.apply_checklist, &mut obj).await? {
            ChecklistOutcome::AllCompleted => {
                if !obj.status.is_ready
                    || obj.status.phase != Phase::Succeeded
                    || obj.status.message.is_some()
                {
                    obj.status.is_ready = true;
                    obj.status.phase = Phase::Succeeded;
                    obj.status.message = None;
                    obj = self.ctx.store.update_status(&obj).await?;
                }
                info!(
                    object = %key,
                    generation = obj.generation(),
                    "Converged; scheduling periodic resync"
                );
                Ok(Action::requeue(self.ctx.config.reconcile_period()))
            }
            ChecklistOutcome::Halted { step, outcome } => match outcome {
                StepOutcome::StillRunning {
                    reason,
                    requeue_after,
                } => {
                    debug!(object = %key, step = %step, reason = %reason, "Not converged yet");
                    Ok(Action::requeue(requeue_after))
                }
                StepOutcome::Failed { error } => {
                    let message = Some(error.to_string());
                    if obj.status.phase != Phase::Failed || obj.status.message != message {
                        obj.status.phase = Phase::Failed;
                        obj.status.message = message;
                        self.ctx.store.update_status(&obj).await?;
                    }
                    warn!(object = %key, step = %step, error = %error, "Reconcile failed");
                    Err(error)
                }
                // The executor never halts on Completed.
                StepOutcome::Completed => Ok(Action::requeue(self.ctx.config.finalizer_requeue())),
            },
        }
    }

    /// Normal-path bookkeeping before the apply checklist runs: default
    /// labels, the sentinel finalizer, an initialized check entry for every
    /// declared apply step, and an honest readiness flag.
    ///
    /// Returns `true` when the finalizer was just added and the reconcile
    /// must stop here.
    async fn ensure_bookkeeping(&self, obj: &mut ManagedObject<S>) -> Result<bool> {
        if obj
            .meta
            .labels
            .insert(LABEL_CONTROLLER.to_string(), self.kind.clone())
            .as_deref()
            != Some(self.kind.as_str())
        {
            *obj = self.ctx.store.update(obj).await?;
        }

        if FinalizerManager::ensure(&self.ctx, obj).await? {
            return Ok(true);
        }

        let generation = obj.generation();
        let mut status_dirty = false;

        for entry in self.apply_checklist.iter() {
            if entry.debug_only || obj.status.checks.contains_key(&entry.name) {
                continue;
            }
            obj.status
                .checks
                .insert(entry.name.clone(), CheckRecord::running(generation, "not started"));
            status_dirty = true;
        }

        // isReady holds exactly when every apply step completed at the
        // current generation; anything else (including a fresh generation)
        // clears it before the checklist runs.
        let all_fresh = self
            .apply_checklist
            .iter()
            .filter(|entry| !entry.debug_only)
            .all(|entry| {
                obj.status
                    .checks
                    .get(&entry.name)
                    .is_some_and(|record| record.is_fresh_completed(generation))
            });
        if obj.status.is_ready && !all_fresh {
            obj.status.is_ready = false;
            if obj.status.phase == Phase::Succeeded {
                obj.status.phase = Phase::Pending;
            }
            status_dirty = true;
        }

        if status_dirty {
            *obj = self.ctx.store.update_status(obj).await?;
        }
        Ok(false)
    }
}
