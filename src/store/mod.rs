//! Collaborator capabilities the engine consumes.
//!
//! The engine never talks to a concrete control plane; it is written against
//! these three traits. Production controllers adapt their store and job
//! runtime behind them, tests use the in-memory implementations in
//! [`memory`].

pub mod memory;

use async_trait::async_trait;

use crate::api::{Job, JobSpec, ManagedObject, ObjectKey, ObjectSpec, ResourceRef};
use crate::engine::types::Result;

/// Declarative object store with optimistic concurrency.
///
/// Both write methods must reject a write whose `resource_version` does not
/// match the stored one with [`Error::Conflict`](crate::engine::types::Error);
/// the reconciler recovers by refetching and re-running. `update` covers
/// metadata and spec (the store bumps the generation itself when the spec
/// changed); `update_status` covers status only.
#[async_trait]
pub trait ObjectStore<S: ObjectSpec>: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> Result<Option<ManagedObject<S>>>;

    async fn update(&self, obj: &ManagedObject<S>) -> Result<ManagedObject<S>>;

    async fn update_status(&self, obj: &ManagedObject<S>) -> Result<ManagedObject<S>>;

    /// Keys of every stored object; used by the dispatch layer's periodic
    /// resync.
    async fn list_keys(&self) -> Result<Vec<ObjectKey>>;
}

/// External execution backend. All calls are non-blocking reads or creates;
/// waiting for a job is expressed by the caller requeueing, never by blocking
/// here.
#[async_trait]
pub trait JobBackend: Send + Sync {
    /// Submit a job. Must fail with
    /// [`Error::AlreadyExists`](crate::engine::types::Error) when a job with
    /// the same key exists; the tracker treats that as "found" on the next
    /// reconcile.
    async fn create_job(&self, spec: &JobSpec) -> Result<()>;

    async fn get_job(&self, key: &ObjectKey) -> Result<Option<Job>>;

    /// Delete a job. Not-found is tolerated and must not be an error.
    async fn delete_job(&self, key: &ObjectKey) -> Result<()>;
}

/// Best-effort deleter for owned subsidiary resources, consumed by the
/// finalize path. Implementations must tolerate not-found.
#[async_trait]
pub trait ResourceCleaner: Send + Sync {
    async fn delete_resource(&self, resource: &ResourceRef) -> Result<()>;
}
