//! In-memory collaborator implementations.
//!
//! Reference semantics for the traits in [`super`]: optimistic concurrency on
//! a monotonic version token, store-side generation bumping on spec change,
//! finalizer-gated physical deletion and a broadcast change feed. Every
//! integration test runs against these, and embedded controllers can too.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::Stream;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::api::{
    Job, JobSpec, ManagedObject, ObjectKey, ObjectMeta, ObjectSpec, ObjectStatus, ResourceRef,
};
use crate::engine::types::{Error, Result};
use crate::store::{JobBackend, ObjectStore, ResourceCleaner};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// In-memory declarative object store.
pub struct InMemoryStore<S: ObjectSpec> {
    objects: DashMap<ObjectKey, ManagedObject<S>>,
    version: AtomicU64,
    events: broadcast::Sender<ObjectKey>,
}

impl<S: ObjectSpec> Default for InMemoryStore<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: ObjectSpec> InMemoryStore<S> {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            objects: DashMap::new(),
            version: AtomicU64::new(0),
            events,
        }
    }

    fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn emit(&self, key: &ObjectKey) {
        // No subscribers is fine; the send result only reports that.
        let _ = self.events.send(key.clone());
    }

    /// Operator surface: create a fresh object at generation 1.
    pub fn create(&self, key: ObjectKey, spec: S) -> ManagedObject<S> {
        let obj = ManagedObject {
            meta: ObjectMeta {
                name: key.name.clone(),
                namespace: key.namespace.clone(),
                uid: Uuid::new_v4().to_string(),
                generation: 1,
                resource_version: self.next_version(),
                deletion_timestamp: None,
                labels: BTreeMap::new(),
                annotations: BTreeMap::new(),
                finalizers: Vec::new(),
            },
            spec,
            status: ObjectStatus::default(),
        };
        self.objects.insert(key.clone(), obj.clone());
        self.emit(&key);
        obj
    }

    /// Operator surface: edit the spec. Bumps the generation when the spec
    /// actually changed, exactly like a declarative store would.
    pub fn apply_spec(&self, key: &ObjectKey, spec: S) -> Result<ManagedObject<S>> {
        let mut entry = self
            .objects
            .get_mut(key)
            .ok_or_else(|| Error::Store(format!("no such object: {key}")))?;
        if entry.spec != spec {
            entry.meta.generation += 1;
            entry.spec = spec;
        }
        entry.meta.resource_version = self.next_version();
        let updated = entry.clone();
        drop(entry);
        self.emit(key);
        Ok(updated)
    }

    /// Operator surface: request deletion. Sets the deletion timestamp; the
    /// object is physically removed once its finalizers are empty.
    pub fn mark_for_deletion(&self, key: &ObjectKey) -> Result<()> {
        let remove_now = {
            let mut entry = self
                .objects
                .get_mut(key)
                .ok_or_else(|| Error::Store(format!("no such object: {key}")))?;
            if entry.meta.deletion_timestamp.is_none() {
                entry.meta.deletion_timestamp = Some(Utc::now());
                entry.meta.resource_version = self.next_version();
            }
            entry.meta.finalizers.is_empty()
        };
        if remove_now {
            self.objects.remove(key);
        }
        self.emit(key);
        Ok(())
    }

    /// Direct read for assertions; no copy-on-write games, just a clone.
    #[must_use]
    pub fn get_cloned(&self, key: &ObjectKey) -> Option<ManagedObject<S>> {
        self.objects.get(key).map(|entry| entry.clone())
    }

    #[must_use]
    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.objects.contains_key(key)
    }

    /// Change feed of touched keys. Slow consumers that lag simply drop
    /// intermediate notifications; the periodic resync covers the gap.
    pub fn watch(&self) -> impl Stream<Item = ObjectKey> + Send + 'static {
        let rx = self.events.subscribe();
        futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(key) => return Some((key, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
    }

    fn check_version(stored: u64, incoming: u64, key: &ObjectKey) -> Result<()> {
        if stored != incoming {
            return Err(Error::Conflict(format!(
                "{key}: stored version {stored}, write carried {incoming}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl<S: ObjectSpec> ObjectStore<S> for InMemoryStore<S> {
    async fn get(&self, key: &ObjectKey) -> Result<Option<ManagedObject<S>>> {
        Ok(self.get_cloned(key))
    }

    async fn update(&self, obj: &ManagedObject<S>) -> Result<ManagedObject<S>> {
        let key = obj.key();
        let (updated, remove_now) = {
            let mut entry = self
                .objects
                .get_mut(&key)
                .ok_or_else(|| Error::Store(format!("no such object: {key}")))?;
            Self::check_version(entry.meta.resource_version, obj.meta.resource_version, &key)?;

            let mut meta = obj.meta.clone();
            if entry.spec != obj.spec {
                meta.generation = entry.meta.generation + 1;
                entry.spec = obj.spec.clone();
            } else {
                meta.generation = entry.meta.generation;
            }
            // Deletion requests only come through mark_for_deletion.
            meta.deletion_timestamp = entry.meta.deletion_timestamp;
            meta.resource_version = self.next_version();
            entry.meta = meta;

            let remove_now =
                entry.meta.deletion_timestamp.is_some() && entry.meta.finalizers.is_empty();
            (entry.clone(), remove_now)
        };

        if remove_now {
            debug!(object = %key, "Finalizers drained, erasing object");
            self.objects.remove(&key);
        }
        self.emit(&key);
        Ok(updated)
    }

    async fn update_status(&self, obj: &ManagedObject<S>) -> Result<ManagedObject<S>> {
        let key = obj.key();
        let updated = {
            let mut entry = self
                .objects
                .get_mut(&key)
                .ok_or_else(|| Error::Store(format!("no such object: {key}")))?;
            Self::check_version(entry.meta.resource_version, obj.meta.resource_version, &key)?;
            entry.status = obj.status.clone();
            entry.meta.resource_version = self.next_version();
            entry.clone()
        };
        self.emit(&key);
        Ok(updated)
    }

    async fn list_keys(&self) -> Result<Vec<ObjectKey>> {
        Ok(self.objects.iter().map(|entry| entry.key().clone()).collect())
    }
}

/// In-memory execution backend. Tests drive job completion through the
/// `mark_*` methods; the created-jobs counter backs the duplicate-submission
/// assertions.
pub struct InMemoryJobBackend {
    jobs: DashMap<ObjectKey, Job>,
    created: AtomicU64,
}

impl Default for InMemoryJobBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryJobBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            jobs: DashMap::new(),
            created: AtomicU64::new(0),
        }
    }

    /// Total jobs ever submitted, including retired ones.
    #[must_use]
    pub fn created_count(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }

    /// Number of jobs currently reporting Active.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.jobs
            .iter()
            .filter(|entry| entry.exec_state() == crate::api::ExecState::Active)
            .count()
    }

    #[must_use]
    pub fn get_cloned(&self, key: &ObjectKey) -> Option<Job> {
        self.jobs.get(key).map(|entry| entry.clone())
    }

    /// Simulate the backend scheduling the job.
    pub fn mark_active(&self, key: &ObjectKey) {
        if let Some(mut job) = self.jobs.get_mut(key) {
            job.active = 1;
            job.succeeded = 0;
            job.failed = 0;
        }
    }

    /// Simulate successful completion.
    pub fn mark_succeeded(&self, key: &ObjectKey) {
        if let Some(mut job) = self.jobs.get_mut(key) {
            job.active = 0;
            job.succeeded = 1;
            job.failed = 0;
        }
    }

    /// Simulate failure.
    pub fn mark_failed(&self, key: &ObjectKey) {
        if let Some(mut job) = self.jobs.get_mut(key) {
            job.active = 0;
            job.succeeded = 0;
            job.failed = 1;
        }
    }
}

#[async_trait]
impl JobBackend for InMemoryJobBackend {
    async fn create_job(&self, spec: &JobSpec) -> Result<()> {
        let key = spec.key();
        if self.jobs.contains_key(&key) {
            return Err(Error::AlreadyExists(key.to_string()));
        }
        self.jobs.insert(
            key,
            Job {
                name: spec.name.clone(),
                namespace: spec.namespace.clone(),
                labels: spec.labels.clone(),
                annotations: spec.annotations.clone(),
                owner: spec.owner.clone(),
                active: 0,
                succeeded: 0,
                failed: 0,
            },
        );
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_job(&self, key: &ObjectKey) -> Result<Option<Job>> {
        Ok(self.get_cloned(key))
    }

    async fn delete_job(&self, key: &ObjectKey) -> Result<()> {
        self.jobs.remove(key);
        Ok(())
    }
}

#[async_trait]
impl ResourceCleaner for InMemoryJobBackend {
    async fn delete_resource(&self, resource: &ResourceRef) -> Result<()> {
        if resource.api_kind == "Job" {
            self.jobs.remove(&resource.key());
        }
        Ok(())
    }
}
