//! Per-step check records with generation-staleness semantics.

use serde::{Deserialize, Serialize};

/// Outcome of a single checklist step, as persisted in object status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckState {
    Running,
    Completed,
    Errored,
}

/// Persisted result of one checklist step, tagged with the object generation
/// it was computed for.
///
/// A record whose generation does not match the object's current generation is
/// stale and must be recomputed; a cached `Completed` is never trusted without
/// this comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckRecord {
    pub generation: i64,
    pub state: CheckState,
    #[serde(default)]
    pub message: String,
}

impl CheckRecord {
    #[must_use]
    pub fn running(generation: i64, message: impl Into<String>) -> Self {
        Self {
            generation,
            state: CheckState::Running,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn completed(generation: i64, message: impl Into<String>) -> Self {
        Self {
            generation,
            state: CheckState::Completed,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn errored(generation: i64, message: impl Into<String>) -> Self {
        Self {
            generation,
            state: CheckState::Errored,
            message: message.into(),
        }
    }

    /// A record computed for any other generation must be recomputed.
    #[must_use]
    pub fn is_stale(&self, object_generation: i64) -> bool {
        self.generation != object_generation
    }

    /// Fresh and completed: the only state that lets the executor skip a step.
    #[must_use]
    pub fn is_fresh_completed(&self, object_generation: i64) -> bool {
        !self.is_stale(object_generation) && self.state == CheckState::Completed
    }
}
