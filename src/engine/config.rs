//! Engine configuration.
//!
//! Loaded once at process start from a mounted YAML file (the same shape the
//! platform charts render for every controller), validated before the first
//! reconcile runs.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main controller configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ControllerConfig {
    /// Reconcile loop settings
    #[serde(default)]
    pub controller: ControllerSettings,

    /// Requeue delays for the non-error wait states
    #[serde(default)]
    pub requeue: RequeueConfig,

    /// Error backoff applied by the dispatch layer
    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Debug-check gating
    #[serde(default)]
    pub debug: DebugConfig,
}

/// Reconcile loop settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControllerSettings {
    /// Steady-state resync interval; converged objects are re-verified this
    /// often.
    #[serde(default = "default_reconcile_period", rename = "reconcilePeriodSeconds")]
    pub reconcile_period_seconds: u64,

    /// Worker pool size: how many distinct objects reconcile concurrently.
    #[serde(default = "default_max_concurrent", rename = "maxConcurrentReconciles")]
    pub max_concurrent_reconciles: usize,

    /// Per-reconcile deadline enforced by the dispatch layer.
    #[serde(default = "default_reconcile_timeout", rename = "reconcileTimeoutSeconds")]
    pub reconcile_timeout_seconds: u64,

    /// How many times a single reconcile refetches and re-runs on a write
    /// conflict before giving up and requeueing.
    #[serde(default = "default_conflict_retries", rename = "conflictRetries")]
    pub conflict_retries: u32,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            reconcile_period_seconds: default_reconcile_period(),
            max_concurrent_reconciles: default_max_concurrent(),
            reconcile_timeout_seconds: default_reconcile_timeout(),
            conflict_retries: default_conflict_retries(),
        }
    }
}

/// Requeue delays for the non-error wait states.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RequeueConfig {
    /// After submitting a job or seeing an unscheduled one.
    #[serde(default = "default_job_pending", rename = "jobPendingSeconds")]
    pub job_pending_seconds: u64,

    /// While a job is actively running.
    #[serde(default = "default_job_running", rename = "jobRunningSeconds")]
    pub job_running_seconds: u64,

    /// After retiring a terminal stale-generation job.
    #[serde(default = "default_stale_job", rename = "staleJobSeconds")]
    pub stale_job_seconds: u64,

    /// After adding the sentinel finalizer, before the first apply pass.
    #[serde(default = "default_finalizer", rename = "finalizerSeconds")]
    pub finalizer_seconds: u64,
}

impl Default for RequeueConfig {
    fn default() -> Self {
        Self {
            job_pending_seconds: default_job_pending(),
            job_running_seconds: default_job_running(),
            stale_job_seconds: default_stale_job(),
            finalizer_seconds: default_finalizer(),
        }
    }
}

/// Exponential backoff applied by the dispatch layer to keys whose reconcile
/// returned an error. Reset on the first success.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_base", rename = "baseSeconds")]
    pub base_seconds: u64,

    #[serde(default = "default_backoff_max", rename = "maxSeconds")]
    pub max_seconds: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_seconds: default_backoff_base(),
            max_seconds: default_backoff_max(),
        }
    }
}

/// Debug-check gating.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DebugConfig {
    /// Run debug-only checklist entries for every object, regardless of the
    /// per-object annotation.
    #[serde(default, rename = "forceDebugChecks")]
    pub force_debug_checks: bool,
}

fn default_reconcile_period() -> u64 {
    300
}

fn default_max_concurrent() -> usize {
    4
}

fn default_reconcile_timeout() -> u64 {
    120
}

fn default_conflict_retries() -> u32 {
    3
}

fn default_job_pending() -> u64 {
    1
}

fn default_job_running() -> u64 {
    30
}

fn default_stale_job() -> u64 {
    1
}

fn default_finalizer() -> u64 {
    1
}

fn default_backoff_base() -> u64 {
    5
}

fn default_backoff_max() -> u64 {
    300
}

impl ControllerConfig {
    /// Load configuration from a mounted YAML file.
    pub fn from_mounted_file(config_path: &str) -> Result<Self, anyhow::Error> {
        let config_str = std::fs::read_to_string(config_path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {config_path}: {e}"))?;

        let config: ControllerConfig = serde_yaml::from_str(&config_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse config YAML: {e}"))?;

        Ok(config)
    }

    /// Validate configuration has sane values.
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.controller.max_concurrent_reconciles == 0 {
            return Err(anyhow::anyhow!(
                "controller.maxConcurrentReconciles must be at least 1"
            ));
        }
        if self.controller.reconcile_period_seconds == 0 {
            return Err(anyhow::anyhow!(
                "controller.reconcilePeriodSeconds must be at least 1"
            ));
        }
        if self.controller.reconcile_timeout_seconds == 0 {
            return Err(anyhow::anyhow!(
                "controller.reconcileTimeoutSeconds must be at least 1"
            ));
        }
        if self.backoff.base_seconds == 0 {
            return Err(anyhow::anyhow!("backoff.baseSeconds must be at least 1"));
        }
        if self.backoff.max_seconds < self.backoff.base_seconds {
            return Err(anyhow::anyhow!(
                "backoff.maxSeconds must be >= backoff.baseSeconds"
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn reconcile_period(&self) -> Duration {
        Duration::from_secs(self.controller.reconcile_period_seconds)
    }

    #[must_use]
    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.controller.reconcile_timeout_seconds)
    }

    #[must_use]
    pub fn job_pending_requeue(&self) -> Duration {
        Duration::from_secs(self.requeue.job_pending_seconds)
    }

    #[must_use]
    pub fn job_running_requeue(&self) -> Duration {
        Duration::from_secs(self.requeue.job_running_seconds)
    }

    #[must_use]
    pub fn stale_job_requeue(&self) -> Duration {
        Duration::from_secs(self.requeue.stale_job_seconds)
    }

    #[must_use]
    pub fn finalizer_requeue(&self) -> Duration {
        Duration::from_secs(self.requeue.finalizer_seconds)
    }
}
