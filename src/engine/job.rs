//! Job phase tracking: at most one live execution job per object generation.
//!
//! Side effects (provisioning a VM, running a migration, creating a
//! namespace) run inside an external job so they are neither duplicated nor
//! lost across retries and controller restarts. The tracker binds each job to
//! the generation that spawned it through the phase annotation and drives the
//! create / monitor / retire state machine without ever blocking on the
//! backend.

use async_trait::async_trait;
use std::fmt;
use tracing::{debug, info, warn};

use crate::api::{
    encode_phase, ExecState, JobSpec, ManagedObject, ObjectKey, ObjectSpec, Phase, ResourceRef,
    ANNOTATION_PHASE, LABEL_CONTROLLER, LABEL_PHASE_KIND,
};
use crate::engine::owned;
use crate::engine::types::{Context, Error, Result, StepOutcome};

/// Which side of the lifecycle a job executes for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Apply,
    Delete,
}

impl JobPhase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            JobPhase::Apply => "apply",
            JobPhase::Delete => "delete",
        }
    }
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deterministic job name for an object and phase kind. Deterministic naming
/// is what makes "at most one job per object+phase" enforceable: a create
/// conflict simply means the job is already there.
#[must_use]
pub fn job_name<S: ObjectSpec>(kind: &str, obj: &ManagedObject<S>, phase: JobPhase) -> ObjectKey {
    ObjectKey::new(
        obj.meta.namespace.clone(),
        format!("{}-{}-{}", kind, obj.meta.name, phase.as_str()),
    )
}

pub struct JobPhaseTracker;

impl JobPhaseTracker {
    /// Drive the job state machine one step for the given object and phase.
    ///
    /// Never blocks waiting for the backend: every wait state is expressed as
    /// `StillRunning` plus a requeue delay.
    pub async fn track<S: ObjectSpec>(
        kind: &str,
        ctx: &Context<S>,
        obj: &mut ManagedObject<S>,
        phase: JobPhase,
    ) -> Result<StepOutcome> {
        let job_key = job_name(kind, obj, phase);

        let Some(job) = ctx.jobs.get_job(&job_key).await? else {
            return Self::submit(kind, ctx, obj, phase, &job_key).await;
        };

        // Jobs survive controller restarts; make sure the ledger knows about
        // this one even if the reconcile that created it lost the race.
        owned::add_owned(ctx, obj, ResourceRef::new("Job", &job.namespace, &job.name)).await?;

        let current = encode_phase(obj.generation());
        if job.annotations.get(ANNOTATION_PHASE) != Some(&current) {
            return Self::retire_stale(ctx, obj, &job_key, job.exec_state()).await;
        }

        match job.exec_state() {
            ExecState::Active => {
                debug!(job = %job_key, "Execution job is active");
                obj.status.phase = Phase::Running;
                Ok(StepOutcome::still_running(
                    "waiting for job to finish",
                    ctx.config.job_running_requeue(),
                ))
            }
            ExecState::Succeeded => {
                info!(job = %job_key, generation = obj.generation(), "Execution job succeeded");
                obj.status.phase = Phase::Succeeded;
                Ok(StepOutcome::Completed)
            }
            ExecState::Failed => {
                warn!(job = %job_key, generation = obj.generation(), "Execution job failed");
                obj.status.phase = Phase::Failed;
                Ok(StepOutcome::failed(Error::JobExecutionFailed {
                    job: job_key,
                    message: format!(
                        "{} job reported failure for generation {}",
                        phase,
                        obj.generation()
                    ),
                }))
            }
            ExecState::None => {
                debug!(job = %job_key, "Execution job accepted but not scheduled yet");
                obj.status.phase = Phase::Pending;
                Ok(StepOutcome::still_running(
                    "job is pending",
                    ctx.config.job_pending_requeue(),
                ))
            }
        }
    }

    /// No job exists for this object+phase: construct and submit one, stamped
    /// with the current generation.
    async fn submit<S: ObjectSpec>(
        kind: &str,
        ctx: &Context<S>,
        obj: &mut ManagedObject<S>,
        phase: JobPhase,
        job_key: &ObjectKey,
    ) -> Result<StepOutcome> {
        let mut labels = obj.meta.labels.clone();
        labels.insert(LABEL_CONTROLLER.to_string(), kind.to_string());
        labels.insert(LABEL_PHASE_KIND.to_string(), phase.as_str().to_string());

        let mut annotations = obj.meta.annotations.clone();
        annotations.insert(
            ANNOTATION_PHASE.to_string(),
            encode_phase(obj.generation()),
        );

        let spec = JobSpec {
            name: job_key.name.clone(),
            namespace: job_key.namespace.clone(),
            labels,
            annotations,
            owner: ResourceRef::new(kind, &obj.meta.namespace, &obj.meta.name),
            payload: serde_json::to_value(&obj.spec)?,
        };

        match ctx.jobs.create_job(&spec).await {
            Ok(()) => {
                info!(
                    job = %job_key,
                    generation = obj.generation(),
                    phase = %phase,
                    "Submitted execution job"
                );
                owned::add_owned(
                    ctx,
                    obj,
                    ResourceRef::new("Job", &spec.namespace, &spec.name),
                )
                .await?;
            }
            // Another reconcile won the create race; the next pass observes
            // the job as found.
            Err(Error::AlreadyExists(_)) => {
                debug!(job = %job_key, "Job already exists, treating as found on next pass");
            }
            Err(e) => return Err(e),
        }

        Ok(StepOutcome::still_running(
            "waiting for job to be created",
            ctx.config.job_pending_requeue(),
        ))
    }

    /// The job on the backend belongs to an earlier generation.
    ///
    /// A stale job that is still running is never force-deleted; killing it
    /// could abandon an external side effect mid-flight. Terminal stale jobs
    /// are retired so the next reconcile can create the fresh one.
    async fn retire_stale<S: ObjectSpec>(
        ctx: &Context<S>,
        obj: &mut ManagedObject<S>,
        job_key: &ObjectKey,
        state: ExecState,
    ) -> Result<StepOutcome> {
        if !state.is_terminal() {
            debug!(job = %job_key, "Stale-generation job still in flight, waiting");
            return Ok(StepOutcome::still_running(
                "waiting for previous generation job to finish",
                ctx.config.job_running_requeue(),
            ));
        }

        info!(job = %job_key, generation = obj.generation(), "Retiring terminal stale-generation job");
        ctx.jobs.delete_job(job_key).await?;
        owned::remove_owned(
            ctx,
            obj,
            &ResourceRef::new("Job", &job_key.namespace, &job_key.name),
        )
        .await?;

        Ok(StepOutcome::still_running(
            "waiting for previous generation job to be replaced",
            ctx.config.stale_job_requeue(),
        ))
    }
}

/// Checklist step adapter around the tracker, used directly by controllers
/// for their apply/delete execution phases.
pub struct JobStep {
    kind: String,
    phase: JobPhase,
}

impl JobStep {
    #[must_use]
    pub fn new(kind: impl Into<String>, phase: JobPhase) -> Self {
        Self {
            kind: kind.into(),
            phase,
        }
    }
}

#[async_trait]
impl<S: ObjectSpec> super::checklist::Step<S> for JobStep {
    async fn run(&self, ctx: &Context<S>, obj: &mut ManagedObject<S>) -> Result<StepOutcome> {
        JobPhaseTracker::track(&self.kind, ctx, obj, self.phase).await
    }
}
