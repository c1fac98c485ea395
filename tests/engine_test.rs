//! End-to-end engine tests against the in-memory collaborators: the full
//! lifecycle walkthrough plus the readiness, idempotence, job-uniqueness,
//! staleness, finalizer-ordering and stopping-rule properties.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reconciler::api::{CheckState, ExecState};
use reconciler::engine::job::job_name;
use reconciler::{
    Action, Checklist, ChecklistEntry, Context, ControllerConfig, Error, JobPhase, JobStep,
    ManagedObject, ObjectKey, ObjectStore, Phase, Reconciler, ResourceCleaner, ResourceRef, Step,
    StepOutcome, StepRegistry, FINALIZER_NAME,
};
use reconciler::store::memory::{InMemoryJobBackend, InMemoryStore};

const KIND: &str = "database";

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct DatabaseSpec {
    engine: String,
    replicas: u32,
}

fn sample_spec() -> DatabaseSpec {
    DatabaseSpec {
        engine: "postgres".to_string(),
        replicas: 3,
    }
}

/// Spec validation step: rejects zero replicas for the current generation.
struct ValidateStep;

#[async_trait]
impl Step<DatabaseSpec> for ValidateStep {
    async fn run(
        &self,
        _ctx: &Context<DatabaseSpec>,
        obj: &mut ManagedObject<DatabaseSpec>,
    ) -> reconciler::Result<StepOutcome> {
        if obj.spec.replicas == 0 {
            return Ok(StepOutcome::failed(Error::Validation(
                "spec.replicas must be at least 1".to_string(),
            )));
        }
        Ok(StepOutcome::Completed)
    }
}

struct Harness {
    store: Arc<InMemoryStore<DatabaseSpec>>,
    jobs: Arc<InMemoryJobBackend>,
    reconciler: Arc<Reconciler<DatabaseSpec>>,
    key: ObjectKey,
}

impl Harness {
    fn new() -> Self {
        init_tracing();
        let store = Arc::new(InMemoryStore::new());
        let jobs = Arc::new(InMemoryJobBackend::new());
        let config = Arc::new(ControllerConfig::default());
        let ctx = Context::new(store.clone(), jobs.clone(), jobs.clone(), config);

        let apply = Checklist::new(vec![
            ChecklistEntry::new("validate", "Validate spec"),
            ChecklistEntry::new("provision", "Provision database"),
        ]);
        let delete = Checklist::new(vec![ChecklistEntry::new(
            "deprovision",
            "Deprovision database",
        )]);
        let registry = StepRegistry::new()
            .register("validate", Arc::new(ValidateStep))
            .register("provision", Arc::new(JobStep::new(KIND, JobPhase::Apply)))
            .register("deprovision", Arc::new(JobStep::new(KIND, JobPhase::Delete)));

        let reconciler = Arc::new(Reconciler::new(KIND, ctx, apply, delete, registry));
        Self {
            store,
            jobs,
            reconciler,
            key: ObjectKey::new("tenants", "db-1"),
        }
    }

    fn create(&self, spec: DatabaseSpec) {
        self.store.create(self.key.clone(), spec);
    }

    async fn reconcile(&self) -> reconciler::Result<Action> {
        self.reconciler.reconcile(&self.key).await
    }

    fn object(&self) -> ManagedObject<DatabaseSpec> {
        self.store.get_cloned(&self.key).expect("object present")
    }

    fn apply_job_key(&self) -> ObjectKey {
        job_name(KIND, &self.object(), JobPhase::Apply)
    }

    fn delete_job_key(&self) -> ObjectKey {
        job_name(KIND, &self.object(), JobPhase::Delete)
    }

    /// Drive reconciles until the apply checklist converges, completing the
    /// execution job when it shows up.
    async fn converge(&self) {
        // Bookkeeping pass adds the finalizer.
        self.reconcile().await.unwrap();
        // Creates the job.
        self.reconcile().await.unwrap();
        self.jobs.mark_succeeded(&self.apply_job_key());
        self.reconcile().await.unwrap();
        assert!(self.object().status.is_ready);
    }
}

#[tokio::test]
async fn lifecycle_walkthrough() {
    let h = Harness::new();
    h.create(sample_spec());

    // Before any reconcile the finalizer is absent.
    assert!(!h.object().has_finalizer(FINALIZER_NAME));

    // First pass: bookkeeping only, finalizer added, short requeue.
    let action = h.reconcile().await.unwrap();
    assert!(action.requeue_after().is_some());
    assert!(h.object().has_finalizer(FINALIZER_NAME));
    assert_eq!(h.jobs.created_count(), 0);

    // Second pass: validation completes, job submitted for generation 1.
    let action = h.reconcile().await.unwrap();
    assert_eq!(action.requeue_after(), Some(Duration::from_secs(1)));
    assert_eq!(h.jobs.created_count(), 1);
    let job = h.jobs.get_cloned(&h.apply_job_key()).expect("job exists");
    assert_eq!(job.phase_generation(), Some(1));
    assert_eq!(job.exec_state(), ExecState::None);

    // Job accepted but not scheduled: pending, no duplicate submission.
    h.reconcile().await.unwrap();
    assert_eq!(h.object().status.phase, Phase::Pending);
    assert_eq!(h.jobs.created_count(), 1);

    // Job running: still waiting, no duplicate submission.
    h.jobs.mark_active(&h.apply_job_key());
    h.reconcile().await.unwrap();
    assert_eq!(h.object().status.phase, Phase::Running);
    assert_eq!(h.jobs.created_count(), 1);

    // Job succeeded: checklist converges, readiness set (P1).
    h.jobs.mark_succeeded(&h.apply_job_key());
    let action = h.reconcile().await.unwrap();
    let obj = h.object();
    assert!(obj.status.is_ready);
    assert_eq!(obj.status.phase, Phase::Succeeded);
    assert!(obj
        .status
        .checks
        .values()
        .all(|c| c.state == CheckState::Completed && c.generation == obj.generation()));
    // Converged objects still get a periodic resync.
    assert_eq!(
        action.requeue_after(),
        Some(Duration::from_secs(
            ControllerConfig::default().controller.reconcile_period_seconds
        ))
    );

    // Spec edit bumps the generation; the old job is terminal, so it is
    // retired and a fresh one is created for generation 2.
    h.store
        .apply_spec(
            &h.key,
            DatabaseSpec {
                engine: "postgres".to_string(),
                replicas: 5,
            },
        )
        .unwrap();
    assert_eq!(h.object().generation(), 2);

    h.reconcile().await.unwrap();
    assert!(
        h.jobs.get_cloned(&h.apply_job_key()).is_none(),
        "terminal stale job is retired"
    );
    let obj = h.object();
    assert!(!obj.status.is_ready, "readiness cleared for the new generation");

    h.reconcile().await.unwrap();
    let job = h.jobs.get_cloned(&h.apply_job_key()).expect("fresh job");
    assert_eq!(job.phase_generation(), Some(2));
    assert_eq!(h.jobs.created_count(), 2);

    h.jobs.mark_succeeded(&h.apply_job_key());
    h.reconcile().await.unwrap();
    assert!(h.object().status.is_ready);

    // Deletion: the delete checklist runs its own job phase; the finalizer
    // stays until it completes, then the store erases the object.
    let apply_job_key = h.apply_job_key();
    let delete_job_key = h.delete_job_key();
    h.store.mark_for_deletion(&h.key).unwrap();
    assert!(h.store.contains(&h.key), "finalizer blocks erasure");

    h.reconcile().await.unwrap();
    assert!(h.object().has_finalizer(FINALIZER_NAME));
    let delete_job = h.jobs.get_cloned(&delete_job_key).expect("delete job");
    assert_eq!(delete_job.phase_generation(), Some(2));

    h.jobs.mark_succeeded(&delete_job_key);
    let action = h.reconcile().await.unwrap();
    assert_eq!(action, Action::await_change());
    assert!(!h.store.contains(&h.key), "object erased after finalize");
    assert!(
        h.jobs.get_cloned(&delete_job_key).is_none(),
        "owned resources cleaned up"
    );
    assert!(
        h.jobs.get_cloned(&apply_job_key).is_none(),
        "succeeded apply job cleaned up on finalize"
    );
}

#[tokio::test]
async fn reconcile_is_idempotent_when_converged() {
    let h = Harness::new();
    h.create(sample_spec());
    h.converge().await;

    let before = serde_json::to_string(&h.object().status).unwrap();
    let created_before = h.jobs.created_count();

    h.reconcile().await.unwrap();

    let after = serde_json::to_string(&h.object().status).unwrap();
    assert_eq!(before, after, "status must be byte-identical");
    assert_eq!(h.jobs.created_count(), created_before, "no new jobs");
}

#[tokio::test]
async fn stale_active_job_is_never_deleted() {
    let h = Harness::new();
    h.create(sample_spec());
    h.reconcile().await.unwrap();
    h.reconcile().await.unwrap();
    let gen1_job_key = h.apply_job_key();
    h.jobs.mark_active(&gen1_job_key);

    // Generation advances while the generation-1 job is still running.
    h.store
        .apply_spec(
            &h.key,
            DatabaseSpec {
                engine: "postgres".to_string(),
                replicas: 7,
            },
        )
        .unwrap();

    for _ in 0..3 {
        let action = h.reconcile().await.unwrap();
        assert!(action.requeue_after().is_some());
        let job = h
            .jobs
            .get_cloned(&gen1_job_key)
            .expect("active stale job must not be deleted");
        assert_eq!(job.exec_state(), ExecState::Active);
        assert_eq!(job.phase_generation(), Some(1));
        // At most one live job for the object+phase at any point.
        assert!(h.jobs.active_count() <= 1);
    }
    assert_eq!(h.jobs.created_count(), 1, "no replacement while stale job runs");

    // Once terminal, the stale job is retired and replaced.
    h.jobs.mark_succeeded(&gen1_job_key);
    h.reconcile().await.unwrap();
    assert!(h.jobs.get_cloned(&gen1_job_key).is_none());
    h.reconcile().await.unwrap();
    let fresh = h.jobs.get_cloned(&h.apply_job_key()).expect("fresh job");
    assert_eq!(fresh.phase_generation(), Some(2));
    h.jobs.mark_active(&h.apply_job_key());
    assert!(h.jobs.active_count() <= 1);
}

#[tokio::test]
async fn job_failure_surfaces_and_clears_on_new_generation() {
    let h = Harness::new();
    h.create(sample_spec());
    h.reconcile().await.unwrap();
    h.reconcile().await.unwrap();
    h.jobs.mark_failed(&h.apply_job_key());

    let err = h.reconcile().await.unwrap_err();
    assert!(matches!(err, Error::JobExecutionFailed { .. }));
    let obj = h.object();
    assert_eq!(obj.status.phase, Phase::Failed);
    assert_eq!(
        obj.status.checks.get("provision").unwrap().state,
        CheckState::Errored
    );
    assert!(!obj.status.is_ready);

    // A spec edit produces a fresh generation: the failed job is stale and
    // terminal, so it is retired and the step re-attempted.
    h.store
        .apply_spec(
            &h.key,
            DatabaseSpec {
                engine: "postgres".to_string(),
                replicas: 4,
            },
        )
        .unwrap();
    h.reconcile().await.unwrap();
    h.reconcile().await.unwrap();
    h.jobs.mark_succeeded(&h.apply_job_key());
    h.reconcile().await.unwrap();

    let obj = h.object();
    assert!(obj.status.is_ready);
    assert_eq!(obj.status.phase, Phase::Succeeded);
}

#[tokio::test]
async fn validation_failure_blocks_later_steps() {
    let h = Harness::new();
    h.create(DatabaseSpec {
        engine: "postgres".to_string(),
        replicas: 0,
    });

    h.reconcile().await.unwrap();
    let err = h.reconcile().await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let obj = h.object();
    assert_eq!(obj.status.phase, Phase::Failed);
    assert_eq!(
        obj.status.checks.get("validate").unwrap().state,
        CheckState::Errored
    );
    // Stopping rule: the provision step never ran, so no job was submitted.
    assert_eq!(h.jobs.created_count(), 0);

    // Fixing the spec clears the failure on the next generation.
    h.store.apply_spec(&h.key, sample_spec()).unwrap();
    h.reconcile().await.unwrap();
    assert_eq!(h.jobs.created_count(), 1);
}

#[tokio::test]
async fn deletion_stalls_while_delete_job_fails() {
    let h = Harness::new();
    h.create(sample_spec());
    h.converge().await;

    let delete_job_key = h.delete_job_key();
    h.store.mark_for_deletion(&h.key).unwrap();
    h.reconcile().await.unwrap();
    h.jobs.mark_failed(&delete_job_key);

    let err = h.reconcile().await.unwrap_err();
    assert!(matches!(err, Error::JobExecutionFailed { .. }));
    assert!(
        h.store.contains(&h.key),
        "finalizer retained while cleanup fails"
    );
    assert!(h.object().has_finalizer(FINALIZER_NAME));
}

#[tokio::test]
async fn missing_object_is_terminal_success() {
    let h = Harness::new();
    let action = h.reconciler.reconcile(&h.key).await.unwrap();
    assert_eq!(action, Action::await_change());
}

/// Cleaner that refuses deletes until released; models an unreachable
/// subsidiary-resource API during finalize.
struct FlakyCleaner {
    inner: Arc<InMemoryJobBackend>,
    healthy: AtomicBool,
}

#[async_trait]
impl ResourceCleaner for FlakyCleaner {
    async fn delete_resource(&self, resource: &ResourceRef) -> reconciler::Result<()> {
        if !self.healthy.load(Ordering::SeqCst) {
            return Err(Error::Store("cleanup endpoint unavailable".to_string()));
        }
        self.inner.delete_resource(resource).await
    }
}

#[tokio::test]
async fn finalizer_retained_until_owned_cleanup_succeeds() {
    init_tracing();
    let store: Arc<InMemoryStore<DatabaseSpec>> = Arc::new(InMemoryStore::new());
    let jobs = Arc::new(InMemoryJobBackend::new());
    let cleaner = Arc::new(FlakyCleaner {
        inner: jobs.clone(),
        healthy: AtomicBool::new(false),
    });
    let config = Arc::new(ControllerConfig::default());
    let ctx = Context::new(store.clone(), jobs.clone(), cleaner.clone(), config);

    let apply = Checklist::new(vec![ChecklistEntry::new("provision", "Provision database")]);
    let delete = Checklist::new(vec![ChecklistEntry::new(
        "deprovision",
        "Deprovision database",
    )]);
    let registry = StepRegistry::new()
        .register("provision", Arc::new(JobStep::new(KIND, JobPhase::Apply)))
        .register("deprovision", Arc::new(JobStep::new(KIND, JobPhase::Delete)));
    let engine = Reconciler::new(KIND, ctx, apply, delete, registry);

    let key = ObjectKey::new("tenants", "db-1");
    store.create(key.clone(), sample_spec());
    engine.reconcile(&key).await.unwrap();
    engine.reconcile(&key).await.unwrap();
    let apply_job_key = job_name(KIND, &store.get_cloned(&key).unwrap(), JobPhase::Apply);
    jobs.mark_succeeded(&apply_job_key);
    engine.reconcile(&key).await.unwrap();
    assert!(store.get_cloned(&key).unwrap().status.is_ready);

    store.mark_for_deletion(&key).unwrap();
    engine.reconcile(&key).await.unwrap();
    let delete_job_key = job_name(KIND, &store.get_cloned(&key).unwrap(), JobPhase::Delete);
    jobs.mark_succeeded(&delete_job_key);

    // Delete checklist completes but the cleaner is down: the finalizer must
    // stay on and the object must not be erased, or the owned jobs would be
    // orphaned with nothing left to retry their deletion.
    let action = engine.reconcile(&key).await.unwrap();
    assert!(action.requeue_after().is_some());
    let obj = store.get_cloned(&key).expect("object retained while cleanup fails");
    assert!(obj.has_finalizer(FINALIZER_NAME));
    assert!(!obj.status.owned_resources.is_empty());
    assert!(jobs.get_cloned(&apply_job_key).is_some());

    // Cleaner recovers: the next pass drains the ledger and lets the store
    // erase the object.
    cleaner.healthy.store(true, Ordering::SeqCst);
    let action = engine.reconcile(&key).await.unwrap();
    assert_eq!(action, Action::await_change());
    assert!(!store.contains(&key));
    assert!(jobs.get_cloned(&apply_job_key).is_none());
    assert!(jobs.get_cloned(&delete_job_key).is_none());
}

/// Step whose first run writes to the object out of band, so the executor's
/// status write hits a version conflict.
struct OutOfBandWriter {
    store: Arc<InMemoryStore<DatabaseSpec>>,
    runs: Arc<AtomicUsize>,
}

#[async_trait]
impl Step<DatabaseSpec> for OutOfBandWriter {
    async fn run(
        &self,
        _ctx: &Context<DatabaseSpec>,
        obj: &mut ManagedObject<DatabaseSpec>,
    ) -> reconciler::Result<StepOutcome> {
        if self.runs.fetch_add(1, Ordering::SeqCst) == 0 {
            let mut fresh = self.store.get_cloned(&obj.key()).expect("object present");
            fresh
                .meta
                .labels
                .insert("external-writer".to_string(), "raced".to_string());
            ObjectStore::update(self.store.as_ref(), &fresh).await?;
        }
        Ok(StepOutcome::Completed)
    }
}

#[tokio::test]
async fn write_conflicts_are_retried_inside_reconcile() {
    init_tracing();
    let store: Arc<InMemoryStore<DatabaseSpec>> = Arc::new(InMemoryStore::new());
    let jobs = Arc::new(InMemoryJobBackend::new());
    let config = Arc::new(ControllerConfig::default());
    let ctx = Context::new(store.clone(), jobs.clone(), jobs.clone(), config);

    let runs = Arc::new(AtomicUsize::new(0));
    let apply = Checklist::new(vec![ChecklistEntry::new("settle", "Settle state")]);
    let registry = StepRegistry::new().register(
        "settle",
        Arc::new(OutOfBandWriter {
            store: store.clone(),
            runs: runs.clone(),
        }),
    );
    let engine = Reconciler::new(KIND, ctx, apply, Checklist::default(), registry);

    let key = ObjectKey::new("tenants", "db-1");
    store.create(key.clone(), sample_spec());
    engine.reconcile(&key).await.unwrap();

    // The out-of-band write lands mid-reconcile; the conflicted status write
    // is recovered internally by refetch-and-rerun and never surfaces.
    let action = engine.reconcile(&key).await.unwrap();
    assert_eq!(
        action.requeue_after(),
        Some(Duration::from_secs(
            ControllerConfig::default().controller.reconcile_period_seconds
        ))
    );
    assert_eq!(runs.load(Ordering::SeqCst), 2, "one conflicted run plus one retry");

    let obj = store.get_cloned(&key).unwrap();
    assert!(obj.status.is_ready);
    assert_eq!(
        obj.meta.labels.get("external-writer").map(String::as_str),
        Some("raced"),
        "the racing write is preserved"
    );
    assert_eq!(
        obj.status.checks.get("settle").unwrap().state,
        CheckState::Completed
    );
}
