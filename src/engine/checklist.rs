//! Ordered checklist of named reconciliation steps and its executor.
//!
//! Each controller declares two checklists (apply and delete) plus a registry
//! mapping step names to implementations, built once at registration. The
//! executor walks the list strictly in order, skipping steps whose check
//! record is fresh and completed, and halts at the first step that is not.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::api::{CheckRecord, ManagedObject, ObjectSpec};
use crate::engine::types::{Context, Error, Result, StepOutcome};

/// One named entry in a checklist. Order within the list is significant: a
/// step may assume every earlier entry completed at the current generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecklistEntry {
    pub name: String,
    pub title: String,
    pub debug_only: bool,
}

impl ChecklistEntry {
    #[must_use]
    pub fn new(name: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            title: title.into(),
            debug_only: false,
        }
    }

    #[must_use]
    pub fn debug_only(mut self) -> Self {
        self.debug_only = true;
        self
    }
}

/// Ordered sequence of checklist entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Checklist {
    entries: Vec<ChecklistEntry>,
}

impl Checklist {
    #[must_use]
    pub fn new(entries: Vec<ChecklistEntry>) -> Self {
        Self { entries }
    }

    #[must_use]
    pub fn entries(&self) -> &[ChecklistEntry] {
        &self.entries
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ChecklistEntry> {
        self.entries.iter()
    }
}

/// A single idempotent reconciliation step.
///
/// Implementations perform their side effect or observation and report the
/// tri-state outcome. `Err` is reserved for infrastructure faults (store or
/// backend unreachable); a domain failure is `StepOutcome::Failed` so the
/// check record ends up `Errored` and the stopping rule still applies.
#[async_trait]
pub trait Step<S: ObjectSpec>: Send + Sync {
    async fn run(&self, ctx: &Context<S>, obj: &mut ManagedObject<S>) -> Result<StepOutcome>;
}

/// Static table mapping step names to implementations, built once when the
/// controller registers itself.
pub struct StepRegistry<S: ObjectSpec> {
    steps: BTreeMap<String, Arc<dyn Step<S>>>,
}

impl<S: ObjectSpec> Default for StepRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: ObjectSpec> StepRegistry<S> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            steps: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn register(mut self, name: impl Into<String>, step: Arc<dyn Step<S>>) -> Self {
        self.steps.insert(name.into(), step);
        self
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Step<S>>> {
        self.steps.get(name)
    }
}

/// Result of one checklist walk.
#[derive(Debug)]
pub enum ChecklistOutcome {
    /// Every (non-skipped) entry has a fresh completed record.
    AllCompleted,
    /// The walk stopped at `step` with a non-completed outcome; later entries
    /// were not attempted.
    Halted {
        step: String,
        outcome: StepOutcome,
    },
}

/// Walks a checklist for one object, persisting a check record after every
/// executed step.
pub struct ChecklistExecutor<'a, S: ObjectSpec> {
    ctx: &'a Context<S>,
    registry: &'a StepRegistry<S>,
}

impl<'a, S: ObjectSpec> ChecklistExecutor<'a, S> {
    #[must_use]
    pub fn new(ctx: &'a Context<S>, registry: &'a StepRegistry<S>) -> Self {
        Self { ctx, registry }
    }

    /// Execute the checklist strictly in order.
    ///
    /// A fresh `Completed` record skips the step entirely; a stale or absent
    /// record forces a full re-run, since nothing computed for an earlier
    /// generation can be trusted. The first non-completed outcome halts the
    /// walk.
    pub async fn execute(
        &self,
        checklist: &Checklist,
        obj: &mut ManagedObject<S>,
    ) -> Result<ChecklistOutcome> {
        let generation = obj.generation();
        let debug_enabled =
            obj.debug_checks_enabled() || self.ctx.config.debug.force_debug_checks;

        for entry in checklist.iter() {
            if entry.debug_only && !debug_enabled {
                debug!(step = %entry.name, "Skipping debug-only step");
                continue;
            }

            if let Some(record) = obj.status.checks.get(&entry.name) {
                if record.is_fresh_completed(generation) {
                    debug!(
                        step = %entry.name,
                        generation,
                        "Step already completed at current generation, skipping"
                    );
                    continue;
                }
                if record.is_stale(generation) {
                    debug!(
                        step = %entry.name,
                        record_generation = record.generation,
                        generation,
                        "Check record is stale, re-running step"
                    );
                }
            }

            let step = self.registry.get(&entry.name).ok_or_else(|| {
                Error::Config(format!(
                    "checklist entry '{}' has no registered step implementation",
                    entry.name
                ))
            })?;

            info!(step = %entry.name, title = %entry.title, generation, "Running checklist step");
            let status_before = obj.status.clone();
            let outcome = step.run(self.ctx, obj).await?;

            let record = match &outcome {
                StepOutcome::Completed => {
                    CheckRecord::completed(generation, format!("{} completed", entry.title))
                }
                StepOutcome::StillRunning { reason, .. } => {
                    CheckRecord::running(generation, reason.clone())
                }
                StepOutcome::Failed { error } => {
                    warn!(step = %entry.name, error = %error, "Checklist step failed");
                    CheckRecord::errored(generation, error.to_string())
                }
            };
            obj.status.checks.insert(entry.name.clone(), record);
            // Persist only real changes; a byte-identical write would ripple
            // a pointless change event back through the dispatch layer.
            if obj.status != status_before {
                *obj = self.ctx.store.update_status(obj).await?;
            }

            if !outcome.is_completed() {
                return Ok(ChecklistOutcome::Halted {
                    step: entry.name.clone(),
                    outcome,
                });
            }
        }

        Ok(ChecklistOutcome::AllCompleted)
    }
}
