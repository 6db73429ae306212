//! Task dispatcher: performs the remote call for one step with timeout,
//! retry and candidate fallback.
//!
//! Candidates are tried in discovery order. A transient failure (timeout,
//! connection error) retries the same agent with backoff until
//! `max_attempts`, then falls through to the next candidate. A permanent
//! failure moves on immediately.

pub mod http;
pub mod simulated;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::RetryPolicy;
use crate::error::MeshError;
use crate::models::agent::AgentRecord;
use crate::registry::{AgentRegistry, DispatchSample};

pub use http::HttpAgentInvoker;
pub use simulated::{SimulatedBehavior, SimulatedFailure, SimulatedInvoker};

// ─── Invocation seam ──────────────────────────────────────────────────────

/// Identifies one in-flight attempt, for best-effort cancellation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvocationHandle(pub String);

impl InvocationHandle {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for InvocationHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub handle: InvocationHandle,
    pub agent_id: String,
    pub endpoint: String,
    pub capability: String,
    pub parameters: Value,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InvocationError {
    /// Timeout, connection error or overload; worth retrying.
    #[error("transient failure: {0}")]
    Transient(String),
    /// The agent rejected the request as malformed or unsupported.
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl InvocationError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Performs the actual call to an agent endpoint.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(&self, request: InvocationRequest) -> Result<Value, InvocationError>;

    /// Best-effort cancellation of an in-flight attempt.
    async fn cancel(&self, _handle: &InvocationHandle) {}
}

// ─── Dispatcher ────────────────────────────────────────────────────────────

/// What the dispatcher needs to know about a step.
#[derive(Debug, Clone)]
pub struct DispatchTask {
    pub step_id: String,
    pub capability: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Succeeded {
        agent_id: String,
        output: Value,
        attempts: u32,
    },
    Failed {
        error: MeshError,
        agent_id: Option<String>,
        attempts: u32,
    },
    Cancelled {
        attempts: u32,
    },
}

impl StepOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Succeeded { attempts, .. }
            | Self::Failed { attempts, .. }
            | Self::Cancelled { attempts } => *attempts,
        }
    }
}

/// Attempt transitions reported while a dispatch is in progress.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptEvent {
    Dispatched { agent_id: String, attempt: u32 },
    Retrying { agent_id: String, attempt: u32, error: String },
}

pub type ProgressFn = dyn Fn(AttemptEvent) + Send + Sync;

#[derive(Clone)]
pub struct TaskDispatcher {
    registry: AgentRegistry,
    invoker: Arc<dyn AgentInvoker>,
    policy: RetryPolicy,
}

impl TaskDispatcher {
    pub fn new(registry: AgentRegistry, invoker: Arc<dyn AgentInvoker>, policy: RetryPolicy) -> Self {
        Self {
            registry,
            invoker,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// Resolve candidates from the registry and dispatch with the default policy.
    pub async fn dispatch_step(
        &self,
        task: &DispatchTask,
        cancel: &CancellationToken,
        progress: &ProgressFn,
    ) -> StepOutcome {
        let candidates = self.registry.candidates(&task.capability);
        self.dispatch(task, &candidates, &self.policy, cancel, progress)
            .await
    }

    pub async fn dispatch(
        &self,
        task: &DispatchTask,
        candidates: &[AgentRecord],
        policy: &RetryPolicy,
        cancel: &CancellationToken,
        progress: &ProgressFn,
    ) -> StepOutcome {
        let max_attempts = policy.max_attempts.max(1);
        let mut total = 0u32;
        let mut last_agent: Option<String> = None;
        let mut last_error: Option<String> = None;

        if candidates.is_empty() {
            last_error = Some(format!("no available agent for capability '{}'", task.capability));
        }

        for (ci, candidate) in candidates.iter().enumerate() {
            let more_candidates = ci + 1 < candidates.len();
            last_agent = Some(candidate.id.clone());

            for attempt in 1..=max_attempts {
                if cancel.is_cancelled() {
                    return StepOutcome::Cancelled { attempts: total };
                }
                total += 1;
                progress(AttemptEvent::Dispatched {
                    agent_id: candidate.id.clone(),
                    attempt: total,
                });

                let error = match self.attempt(task, candidate, policy, cancel).await {
                    AttemptResult::Ok(output) => {
                        tracing::info!(
                            "[Dispatcher] Step {} succeeded on {} (attempt {})",
                            task.step_id,
                            candidate.id,
                            total
                        );
                        return StepOutcome::Succeeded {
                            agent_id: candidate.id.clone(),
                            output,
                            attempts: total,
                        };
                    }
                    AttemptResult::Cancelled => return StepOutcome::Cancelled { attempts: total },
                    AttemptResult::Err(e) => e,
                };

                tracing::warn!(
                    "[Dispatcher] Step {} attempt {} on {} failed: {}",
                    task.step_id,
                    total,
                    candidate.id,
                    error
                );
                let transient = error.is_transient();
                last_error = Some(error.to_string());

                let retry_same = transient && attempt < max_attempts;
                if !retry_same && !more_candidates {
                    break;
                }
                progress(AttemptEvent::Retrying {
                    agent_id: candidate.id.clone(),
                    attempt: total,
                    error: error.to_string(),
                });
                if !retry_same {
                    break;
                }

                let delay = policy.backoff(attempt);
                tokio::select! {
                    _ = cancel.cancelled() => return StepOutcome::Cancelled { attempts: total },
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        tracing::error!(
            "[Dispatcher] Step {} exhausted {} candidate(s) after {} attempt(s)",
            task.step_id,
            candidates.len(),
            total
        );
        StepOutcome::Failed {
            error: MeshError::AllCandidatesExhausted {
                step: task.step_id.clone(),
                attempts: total,
                last_error,
            },
            agent_id: last_agent,
            attempts: total,
        }
    }

    async fn attempt(
        &self,
        task: &DispatchTask,
        candidate: &AgentRecord,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> AttemptResult {
        let handle = InvocationHandle::new();
        let timeout = policy.per_attempt_timeout();
        let request = InvocationRequest {
            handle: handle.clone(),
            agent_id: candidate.id.clone(),
            endpoint: candidate.endpoint.clone(),
            capability: task.capability.clone(),
            parameters: task.parameters.clone(),
            timeout,
        };

        let started = Instant::now();
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                self.invoker.cancel(&handle).await;
                return AttemptResult::Cancelled;
            }
            r = tokio::time::timeout(timeout, self.invoker.invoke(request)) => r,
        };

        let result = match result {
            Ok(inner) => inner,
            Err(_) => {
                self.invoker.cancel(&handle).await;
                Err(InvocationError::Transient(format!(
                    "attempt timed out after {}ms",
                    timeout.as_millis()
                )))
            }
        };

        let sample = match &result {
            Ok(_) => DispatchSample::Success {
                latency_ms: started.elapsed().as_secs_f64() * 1000.0,
            },
            Err(e) => DispatchSample::Failure {
                transient: e.is_transient(),
            },
        };
        if let Err(e) = self.registry.record_dispatch(&candidate.id, sample) {
            tracing::debug!("[Dispatcher] Metrics not recorded for {}: {}", candidate.id, e);
        }

        match result {
            Ok(output) => AttemptResult::Ok(output),
            Err(e) => AttemptResult::Err(e),
        }
    }
}

enum AttemptResult {
    Ok(Value),
    Err(InvocationError),
    Cancelled,
}
