//! Core resource model for reconciled objects.
//!
//! Every controller on the platform reconciles some `ManagedObject<S>` where
//! `S` is its own spec type. The engine only ever touches metadata and status;
//! the spec is opaque except for change detection (generation bumping happens
//! in the store, never here).

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Annotation that enables debug-only checklist entries for a single object.
pub const ANNOTATION_DEBUG_CHECKS: &str = "reconcile.cto.dev/debug-checks";

/// Label recording which controller manages an object (and the jobs it spawns).
pub const LABEL_CONTROLLER: &str = "reconcile.cto.dev/controller";

/// Bounds every controller spec type must satisfy.
///
/// `PartialEq` is required so the store can detect spec edits and bump the
/// generation; everything else is the usual serde + threading contract.
pub trait ObjectSpec:
    Clone + fmt::Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> ObjectSpec for T where
    T: Clone + fmt::Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Namespaced identity of an object (or a job) in the store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Opaque handle to a subsidiary resource created while reconciling.
///
/// The engine records these in the owned-resource ledger and hands them to the
/// `ResourceCleaner` on finalize; it never dereferences them itself.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceRef {
    #[serde(rename = "apiKind")]
    pub api_kind: String,
    pub namespace: String,
    pub name: String,
}

impl ResourceRef {
    #[must_use]
    pub fn new(
        api_kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api_kind: api_kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    #[must_use]
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace.clone(), self.name.clone())
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.api_kind, self.namespace, self.name)
    }
}

/// Object metadata maintained by the store.
///
/// `generation` is bumped by the store on spec change, never by controllers.
/// `resource_version` is the optimistic-concurrency token checked on every
/// write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub generation: i64,
    pub resource_version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
}

/// Observed lifecycle phase of an object, driven by the job phase tracker and
/// the reconciler loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Pending => "Pending",
            Phase::Running => "Running",
            Phase::Succeeded => "Succeeded",
            Phase::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Status block persisted on every managed object.
///
/// All intermediate reconcile state lives here rather than in process memory,
/// so a restarted controller picks up exactly where the previous one stopped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStatus {
    #[serde(default)]
    pub is_ready: bool,
    #[serde(default)]
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub checks: BTreeMap<String, super::check::CheckRecord>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub owned_resources: BTreeSet<ResourceRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// The unit of reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "S: ObjectSpec")]
pub struct ManagedObject<S> {
    pub meta: ObjectMeta,
    pub spec: S,
    #[serde(default)]
    pub status: ObjectStatus,
}

impl<S: ObjectSpec> ManagedObject<S> {
    #[must_use]
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.meta.namespace.clone(), self.meta.name.clone())
    }

    #[must_use]
    pub fn generation(&self) -> i64 {
        self.meta.generation
    }

    /// True once the store has recorded a deletion request.
    #[must_use]
    pub fn is_marked_for_deletion(&self) -> bool {
        self.meta.deletion_timestamp.is_some()
    }

    #[must_use]
    pub fn has_finalizer(&self, name: &str) -> bool {
        self.meta.finalizers.iter().any(|f| f == name)
    }

    /// Whether debug-only checklist entries should run for this object.
    #[must_use]
    pub fn debug_checks_enabled(&self) -> bool {
        self.meta
            .annotations
            .get(ANNOTATION_DEBUG_CHECKS)
            .is_some_and(|value| value.eq_ignore_ascii_case("true"))
    }
}
