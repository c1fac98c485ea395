/*
 * 5D Labs Agent Platform - Kubernetes Orchestrator for AI Coding Agents
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! Platform reconciliation engine
//!
//! This crate provides the shared reconciliation core every platform
//! controller runs inside: the ordered checklist executor with
//! generation-staleness semantics, the external-job phase tracker, the
//! finalizer-gated deletion protocol, the owned-resource ledger and the
//! dispatch layer that serializes reconciles per object key.

pub mod api;
pub mod dispatch;
pub mod engine;
pub mod store;

// Re-export commonly used types
pub use api::{
    CheckRecord, CheckState, ExecState, Job, JobSpec, ManagedObject, ObjectKey, ObjectMeta,
    ObjectSpec, ObjectStatus, Phase, ResourceRef,
};
pub use engine::{
    run_controller, Action, Checklist, ChecklistEntry, Context, ControllerConfig, Error, JobPhase,
    JobStep, Reconciler, Result, Step, StepOutcome, StepRegistry, FINALIZER_NAME,
};
pub use store::{JobBackend, ObjectStore, ResourceCleaner};
