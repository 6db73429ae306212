//! Runtime configuration for the registry, dispatcher and orchestrator.
//!
//! Every field carries a serde default so partial YAML files work:
//!
//! ```yaml
//! registry:
//!   offlineAfterFailures: 5
//! dispatch:
//!   maxAttempts: 2
//!   perAttemptTimeoutMs: 10000
//! orchestrator:
//!   maxParallelSteps: 4
//! ```

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::MeshError;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MeshConfig {
    pub registry: RegistryConfig,
    pub dispatch: RetryPolicy,
    pub orchestrator: OrchestratorConfig,
}

impl MeshConfig {
    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, MeshError> {
        serde_yaml::from_str(yaml)
            .map_err(|e| MeshError::Config(format!("Failed to parse config YAML: {}", e)))
    }

    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> Result<Self, MeshError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            MeshError::Config(format!("Failed to read config file '{}': {}", path, e))
        })?;
        Self::from_yaml(&content)
    }
}

// ─── Registry ──────────────────────────────────────────────────────────────

/// Health thresholds and grace periods for the agent registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistryConfig {
    /// Probe latency above this marks the agent Degraded.
    pub slow_threshold_ms: u64,
    /// Consecutive unreachable samples before an agent goes Offline.
    pub offline_after_failures: u32,
    /// Expected interval between heartbeats.
    pub heartbeat_interval_ms: u64,
    /// Missed heartbeat intervals before the sweeper marks an agent Offline.
    pub missed_heartbeat_limit: u32,
    /// How long an agent may stay Offline before it is removed.
    pub offline_grace_ms: u64,
    /// Smoothing factor for the latency moving average, in (0, 1].
    pub latency_ewma_alpha: f64,
    /// Feed transient dispatch failures back as unreachable health samples.
    pub downgrade_on_dispatch_failure: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            slow_threshold_ms: 1_000,
            offline_after_failures: 3,
            heartbeat_interval_ms: 60_000,
            missed_heartbeat_limit: 3,
            offline_grace_ms: 300_000,
            latency_ewma_alpha: 0.3,
            downgrade_on_dispatch_failure: true,
        }
    }
}

impl RegistryConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn offline_grace(&self) -> Duration {
        Duration::from_millis(self.offline_grace_ms)
    }

    /// Silence longer than this means the agent missed too many heartbeats.
    pub fn stale_after(&self) -> Duration {
        self.heartbeat_interval() * self.missed_heartbeat_limit.max(1)
    }
}

// ─── Dispatch ──────────────────────────────────────────────────────────────

/// Retry, timeout and backoff policy shared by every invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Attempts per candidate agent, including the first one.
    pub max_attempts: u32,
    pub per_attempt_timeout_ms: u64,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Random spread applied to each delay, as a ratio of the delay.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            per_attempt_timeout_ms: 30_000,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn per_attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.per_attempt_timeout_ms)
    }

    /// Exponential backoff before retry number `attempt` (1-based attempt that
    /// just failed), capped at `max_delay_ms` and spread by `jitter`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let raw = self.base_delay_ms.saturating_mul(1u64 << exp);
        let capped = raw.min(self.max_delay_ms) as f64;

        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter))
        } else {
            1.0
        };
        Duration::from_millis((capped * factor).round() as u64)
    }
}

// ─── Orchestrator ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrchestratorConfig {
    /// Fan-out limit for independent steps within one run.
    pub max_parallel_steps: usize,
    /// Applied when a definition does not set `timeoutMs`.
    pub default_timeout_ms: u64,
    /// Best-effort runs abort once the failed-step ratio exceeds this.
    pub max_failure_ratio: f64,
    /// Capacity of the run event broadcast channel.
    pub event_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_parallel_steps: 8,
            default_timeout_ms: 300_000,
            max_failure_ratio: 0.5,
            event_capacity: 256,
        }
    }
}
