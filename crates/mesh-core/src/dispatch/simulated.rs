//! Scripted in-process invoker.
//!
//! Stands in for remote agents in tests and in `mesh run --simulate`. Each
//! agent id gets a behaviour: a fixed latency, an optional failure mode
//! (optionally only for the first N calls) and optional canned outputs.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{AgentInvoker, InvocationError, InvocationHandle, InvocationRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulatedFailure {
    Transient,
    Permanent,
    /// Never answers; the attempt runs into its timeout.
    Hang,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulatedBehavior {
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<SimulatedFailure>,
    /// Fail only the first N calls; every call when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_times: Option<u32>,
    /// Output of call n is `outputs[n]`, repeating the last entry. An echo of
    /// the request is returned when empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<Value>,
}

impl SimulatedBehavior {
    pub fn with_latency(latency_ms: u64) -> Self {
        Self {
            latency_ms,
            ..Self::default()
        }
    }

    pub fn failing(failure: SimulatedFailure) -> Self {
        Self {
            failure: Some(failure),
            ..Self::default()
        }
    }

    pub fn times(mut self, n: u32) -> Self {
        self.fail_times = Some(n);
        self
    }

    pub fn latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn outputs(mut self, outputs: impl IntoIterator<Item = Value>) -> Self {
        self.outputs = outputs.into_iter().collect();
        self
    }
}

#[derive(Default)]
pub struct SimulatedInvoker {
    behaviors: RwLock<HashMap<String, SimulatedBehavior>>,
    calls: Mutex<HashMap<String, u32>>,
    cancelled: Mutex<Vec<InvocationHandle>>,
}

impl SimulatedInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_behavior(&self, agent_id: &str, behavior: SimulatedBehavior) {
        if let Ok(mut behaviors) = self.behaviors.write() {
            behaviors.insert(agent_id.to_string(), behavior);
        }
    }

    /// Number of invocations received by an agent.
    pub fn calls(&self, agent_id: &str) -> u32 {
        self.calls
            .lock()
            .ok()
            .and_then(|c| c.get(agent_id).copied())
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.calls.lock().map(|c| c.values().sum()).unwrap_or(0)
    }

    /// Handles passed to `cancel`, in order.
    pub fn cancelled(&self) -> Vec<InvocationHandle> {
        self.cancelled.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl AgentInvoker for SimulatedInvoker {
    async fn invoke(&self, request: InvocationRequest) -> Result<Value, InvocationError> {
        let behavior = self
            .behaviors
            .read()
            .ok()
            .and_then(|b| b.get(&request.agent_id).cloned())
            .unwrap_or_default();

        let call = match self.calls.lock() {
            Ok(mut calls) => {
                let n = calls.entry(request.agent_id.clone()).or_insert(0);
                *n += 1;
                *n
            }
            Err(_) => 1,
        };

        if behavior.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(behavior.latency_ms)).await;
        }

        let failing = behavior
            .failure
            .filter(|_| behavior.fail_times.map_or(true, |n| call <= n));
        match failing {
            Some(SimulatedFailure::Transient) => {
                return Err(InvocationError::Transient(format!(
                    "{} unavailable (simulated)",
                    request.agent_id
                )))
            }
            Some(SimulatedFailure::Permanent) => {
                return Err(InvocationError::Permanent(format!(
                    "{} rejected {} (simulated)",
                    request.agent_id, request.capability
                )))
            }
            Some(SimulatedFailure::Hang) => {
                // Long enough to outlive any sane attempt timeout.
                tokio::time::sleep(Duration::from_secs(24 * 60 * 60)).await;
                return Err(InvocationError::Transient("no response".into()));
            }
            None => {}
        }

        let index = (call as usize).saturating_sub(1);
        let output = match behavior.outputs.get(index).or(behavior.outputs.last()) {
            Some(v) => v.clone(),
            None => json!({
                "agentId": request.agent_id,
                "capability": request.capability,
                "parameters": request.parameters,
                "status": "completed",
            }),
        };
        Ok(output)
    }

    async fn cancel(&self, handle: &InvocationHandle) {
        if let Ok(mut cancelled) = self.cancelled.lock() {
            cancelled.push(handle.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(agent: &str) -> InvocationRequest {
        InvocationRequest {
            handle: InvocationHandle::new(),
            agent_id: agent.into(),
            endpoint: format!("sim://{}", agent),
            capability: "grammar_check".into(),
            parameters: json!({ "text": "hello" }),
            timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_echo_by_default() {
        let inv = SimulatedInvoker::new();
        let out = inv.invoke(request("grammar-bot")).await.unwrap();
        assert_eq!(out["capability"], "grammar_check");
        assert_eq!(out["parameters"]["text"], "hello");
        assert_eq!(inv.calls("grammar-bot"), 1);
    }

    #[tokio::test]
    async fn test_fail_times_then_outputs_sequence() {
        let inv = SimulatedInvoker::new();
        inv.set_behavior(
            "bot",
            SimulatedBehavior::failing(SimulatedFailure::Transient)
                .times(1)
                .outputs([json!(1), json!(2), json!(3)]),
        );
        assert!(inv.invoke(request("bot")).await.unwrap_err().is_transient());
        assert_eq!(inv.invoke(request("bot")).await.unwrap(), json!(2));
        assert_eq!(inv.invoke(request("bot")).await.unwrap(), json!(3));
        assert_eq!(inv.invoke(request("bot")).await.unwrap(), json!(3));
        assert_eq!(inv.total_calls(), 4);
    }

    #[test]
    fn test_behavior_yaml() {
        let b: SimulatedBehavior = serde_yaml::from_str("latencyMs: 25\nfailure: permanent\n").unwrap();
        assert_eq!(b, SimulatedBehavior::failing(SimulatedFailure::Permanent).latency(25));
    }
}
