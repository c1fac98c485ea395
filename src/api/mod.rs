//! Resource model shared by every controller: managed objects, check records
//! and execution jobs.

pub mod check;
pub mod job;
pub mod object;

pub use check::{CheckRecord, CheckState};
pub use job::{encode_phase, ExecState, Job, JobSpec, ANNOTATION_PHASE, LABEL_PHASE_KIND};
pub use object::{
    ManagedObject, ObjectKey, ObjectMeta, ObjectSpec, ObjectStatus, Phase, ResourceRef,
    ANNOTATION_DEBUG_CHECKS, LABEL_CONTROLLER,
};
