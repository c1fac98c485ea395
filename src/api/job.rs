//! External execution job model.
//!
//! A job is the asynchronous unit of work a reconcile hands to the execution
//! backend (provision a VM, run a migration, create a namespace). The engine
//! binds each job to the object generation that spawned it through the
//! `reconcile.cto.dev/phase` annotation and never runs two live jobs for the
//! same object+phase.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::object::{ObjectKey, ResourceRef};

/// Annotation binding a job to the object generation that created it.
pub const ANNOTATION_PHASE: &str = "reconcile.cto.dev/phase";

/// Label recording which phase kind (apply/delete) a job belongs to.
pub const LABEL_PHASE_KIND: &str = "reconcile.cto.dev/phase-kind";

/// Encode a generation for the phase annotation. Decimal, stable, comparable
/// by string equality only.
#[must_use]
pub fn encode_phase(generation: i64) -> String {
    generation.to_string()
}

/// Execution state derived from the backend's `{active, succeeded, failed}`
/// counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecState {
    /// Accepted by the backend but not scheduled yet (no counters set).
    None,
    Active,
    Succeeded,
    Failed,
}

impl ExecState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecState::Succeeded | ExecState::Failed)
    }
}

/// Creation request handed to the job backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Deterministic owner reference back to the managed object, so the
    /// backend can garbage-collect orphaned jobs.
    pub owner: ResourceRef,
    /// Serialized spec the job is expected to realize.
    pub payload: serde_json::Value,
}

impl JobSpec {
    #[must_use]
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace.clone(), self.name.clone())
    }
}

/// Observed job, as reported by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    pub owner: ResourceRef,
    #[serde(default)]
    pub active: i32,
    #[serde(default)]
    pub succeeded: i32,
    #[serde(default)]
    pub failed: i32,
}

impl Job {
    #[must_use]
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace.clone(), self.name.clone())
    }

    /// Derive the execution state from the status counters. Failure wins over
    /// success so a partially-retried failed job is never read as succeeded.
    #[must_use]
    pub fn exec_state(&self) -> ExecState {
        if self.failed > 0 {
            ExecState::Failed
        } else if self.succeeded > 0 {
            ExecState::Succeeded
        } else if self.active > 0 {
            ExecState::Active
        } else {
            ExecState::None
        }
    }

    /// The generation this job was created for, if the phase annotation is
    /// present and well-formed.
    #[must_use]
    pub fn phase_generation(&self) -> Option<i64> {
        self.annotations
            .get(ANNOTATION_PHASE)
            .and_then(|raw| raw.trim().parse::<i64>().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_with_counts(active: i32, succeeded: i32, failed: i32) -> Job {
        Job {
            name: "db-1-apply".to_string(),
            namespace: "tenants".to_string(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            owner: ResourceRef::new("Database", "tenants", "db-1"),
            active,
            succeeded,
            failed,
        }
    }

    #[test]
    fn exec_state_derivation() {
        assert_eq!(job_with_counts(0, 0, 0).exec_state(), ExecState::None);
        assert_eq!(job_with_counts(1, 0, 0).exec_state(), ExecState::Active);
        assert_eq!(job_with_counts(0, 1, 0).exec_state(), ExecState::Succeeded);
        assert_eq!(job_with_counts(0, 0, 1).exec_state(), ExecState::Failed);
        // Failure wins even when a success was also recorded.
        assert_eq!(job_with_counts(0, 1, 1).exec_state(), ExecState::Failed);
    }

    #[test]
    fn phase_generation_parses_annotation() {
        let mut job = job_with_counts(0, 0, 0);
        assert_eq!(job.phase_generation(), None);

        job.annotations
            .insert(ANNOTATION_PHASE.to_string(), encode_phase(7));
        assert_eq!(job.phase_generation(), Some(7));

        job.annotations
            .insert(ANNOTATION_PHASE.to_string(), "not-a-number".to_string());
        assert_eq!(job.phase_generation(), None);
    }
}
