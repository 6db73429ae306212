use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RegistryConfig;
use crate::dispatch::simulated::SimulatedBehavior;
use crate::error::MeshError;

/// Health state of a registered agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Online,
    Degraded,
    Offline,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "ONLINE",
            Self::Degraded => "DEGRADED",
            Self::Offline => "OFFLINE",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "ONLINE" => Some(Self::Online),
            "DEGRADED" => Some(Self::Degraded),
            "OFFLINE" => Some(Self::Offline),
            _ => None,
        }
    }

    /// Online and Degraded agents are eligible for discovery and dispatch.
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Online | Self::Degraded)
    }
}

impl Default for AgentStatus {
    fn default() -> Self {
        Self::Online
    }
}

/// Call counters and smoothed latency for one agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMetrics {
    #[serde(default)]
    pub total_calls: u64,
    #[serde(default)]
    pub total_failures: u64,
    /// Exponentially weighted moving average; `None` until the first sample.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_latency_ms: Option<f64>,
}

impl AgentMetrics {
    pub fn observe_latency(&mut self, latency_ms: f64, alpha: f64) {
        let alpha = alpha.clamp(f64::EPSILON, 1.0);
        self.avg_latency_ms = Some(match self.avg_latency_ms {
            Some(prev) => alpha * latency_ms + (1.0 - alpha) * prev,
            None => latency_ms,
        });
    }
}

/// A known agent, its capabilities and its current health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    pub id: String,
    pub display_name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub capabilities: BTreeSet<String>,
    /// Opaque address handed to the invocation collaborator.
    pub endpoint: String,
    #[serde(default)]
    pub supported_protocols: BTreeSet<String>,
    #[serde(default)]
    pub status: AgentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metrics: AgentMetrics,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offline_since: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl AgentRecord {
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        capabilities: impl IntoIterator<Item = impl Into<String>>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            version: default_version(),
            description: None,
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            endpoint: endpoint.into(),
            supported_protocols: BTreeSet::new(),
            status: AgentStatus::Online,
            last_heartbeat_at: None,
            metrics: AgentMetrics::default(),
            consecutive_failures: 0,
            offline_since: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_protocols(mut self, protocols: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.supported_protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_latency(mut self, latency_ms: f64) -> Self {
        self.metrics.avg_latency_ms = Some(latency_ms);
        self
    }

    pub fn validate(&self) -> Result<(), MeshError> {
        if self.id.trim().is_empty() {
            return Err(MeshError::InvalidRecord("agent id must not be blank".into()));
        }
        if self.capabilities.iter().all(|c| c.trim().is_empty()) {
            return Err(MeshError::InvalidRecord(format!(
                "agent '{}' must declare at least one capability",
                self.id
            )));
        }
        Ok(())
    }

    /// Normalised capability keys as stored in the capability index.
    pub fn capability_keys(&self) -> impl Iterator<Item = String> + '_ {
        self.capabilities
            .iter()
            .map(|c| normalize_key(c))
            .filter(|c| !c.is_empty())
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        let wanted = normalize_key(capability);
        self.capability_keys().any(|c| c == wanted)
    }

    pub fn supports_protocol(&self, protocol: &str) -> bool {
        let wanted = normalize_key(protocol);
        self.supported_protocols
            .iter()
            .any(|p| normalize_key(p) == wanted)
    }

    /// Recompute status from one health sample.
    ///
    /// Healthy and degraded samples refresh `last_heartbeat_at` and reset the
    /// failure streak. Unreachable samples keep the agent Degraded until the
    /// streak reaches `offline_after_failures`, then mark it Offline.
    pub fn apply_health(&mut self, sample: &HealthSample, cfg: &RegistryConfig, now: DateTime<Utc>) {
        match sample.outcome {
            HealthOutcome::Healthy | HealthOutcome::Degraded => {
                self.last_heartbeat_at = Some(now);
                self.consecutive_failures = 0;
                self.offline_since = None;
                if let Some(latency) = sample.latency_ms {
                    self.metrics.observe_latency(latency, cfg.latency_ewma_alpha);
                }
                let slow = sample
                    .latency_ms
                    .map(|l| l > cfg.slow_threshold_ms as f64)
                    .unwrap_or(false);
                self.status = if sample.outcome == HealthOutcome::Degraded || slow {
                    AgentStatus::Degraded
                } else {
                    AgentStatus::Online
                };
            }
            HealthOutcome::Unreachable => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if self.consecutive_failures >= cfg.offline_after_failures.max(1) {
                    self.mark_offline(now);
                } else {
                    self.status = AgentStatus::Degraded;
                }
            }
        }
    }

    pub fn mark_offline(&mut self, now: DateTime<Utc>) {
        if self.status != AgentStatus::Offline || self.offline_since.is_none() {
            self.offline_since = Some(now);
        }
        self.status = AgentStatus::Offline;
    }
}

/// Case-folded, trimmed form used for capability and protocol matching.
pub fn normalize_key(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Result of one health probe, supplied by an external probe source or by
/// the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthOutcome {
    Healthy,
    /// Slow or partial response.
    Degraded,
    Unreachable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSample {
    pub outcome: HealthOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
}

impl HealthSample {
    pub fn healthy(latency_ms: f64) -> Self {
        Self {
            outcome: HealthOutcome::Healthy,
            latency_ms: Some(latency_ms),
        }
    }

    pub fn degraded() -> Self {
        Self {
            outcome: HealthOutcome::Degraded,
            latency_ms: None,
        }
    }

    pub fn unreachable() -> Self {
        Self {
            outcome: HealthOutcome::Unreachable,
            latency_ms: None,
        }
    }
}

/// Discovery filter. Statuses default to Online + Degraded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statuses: Option<BTreeSet<AgentStatus>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl DiscoveryQuery {
    pub fn capability(capability: impl Into<String>) -> Self {
        Self {
            capability: Some(capability.into()),
            ..Self::default()
        }
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = AgentStatus>) -> Self {
        self.statuses = Some(statuses.into_iter().collect());
        self
    }

    pub fn accepts_status(&self, status: AgentStatus) -> bool {
        match &self.statuses {
            Some(set) => set.contains(&status),
            None => status.is_available(),
        }
    }
}

// ─── Roster files ──────────────────────────────────────────────────────────

/// One roster entry: an agent record plus optional simulated behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    #[serde(flatten)]
    pub record: AgentRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simulate: Option<SimulatedBehavior>,
}

/// A YAML list of agents to register at startup.
///
/// ```yaml
/// agents:
///   - id: email-bot
///     displayName: EmailBot
///     capabilities: [email_draft, writing_assistance]
///     endpoint: http://localhost:8101
///     supportedProtocols: [mcp, a2a]
///     simulate:
///       latencyMs: 50
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentRoster {
    #[serde(default)]
    pub agents: Vec<RosterEntry>,
}

impl AgentRoster {
    pub fn from_yaml(yaml: &str) -> Result<Self, MeshError> {
        serde_yaml::from_str(yaml)
            .map_err(|e| MeshError::Config(format!("Failed to parse agent roster YAML: {}", e)))
    }

    pub fn from_file(path: &str) -> Result<Self, MeshError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            MeshError::Config(format!("Failed to read agent roster '{}': {}", path, e))
        })?;
        Self::from_yaml(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> AgentRecord {
        AgentRecord::new("email-bot", "EmailBot", ["email_draft"], "http://localhost:8101")
    }

    #[test]
    fn test_validate_rejects_blank_id_and_empty_capabilities() {
        let mut r = record();
        r.id = "  ".into();
        assert!(matches!(r.validate(), Err(MeshError::InvalidRecord(_))));

        let mut r = record();
        r.capabilities.clear();
        assert!(matches!(r.validate(), Err(MeshError::InvalidRecord(_))));

        assert!(record().validate().is_ok());
    }

    #[test]
    fn test_unreachable_streak_goes_offline() {
        let cfg = RegistryConfig::default();
        let now = Utc::now();
        let mut r = record();

        r.apply_health(&HealthSample::unreachable(), &cfg, now);
        assert_eq!(r.status, AgentStatus::Degraded);
        r.apply_health(&HealthSample::unreachable(), &cfg, now);
        assert_eq!(r.status, AgentStatus::Degraded);
        r.apply_health(&HealthSample::unreachable(), &cfg, now);
        assert_eq!(r.status, AgentStatus::Offline);
        assert_eq!(r.offline_since, Some(now));

        r.apply_health(&HealthSample::healthy(20.0), &cfg, now);
        assert_eq!(r.status, AgentStatus::Online);
        assert_eq!(r.consecutive_failures, 0);
        assert!(r.offline_since.is_none());
    }

    #[test]
    fn test_slow_probe_degrades() {
        let cfg = RegistryConfig::default();
        let mut r = record();
        r.apply_health(&HealthSample::healthy(5_000.0), &cfg, Utc::now());
        assert_eq!(r.status, AgentStatus::Degraded);
        assert!(r.last_heartbeat_at.is_some());
    }

    #[test]
    fn test_ewma_latency() {
        let mut m = AgentMetrics::default();
        m.observe_latency(100.0, 0.5);
        m.observe_latency(200.0, 0.5);
        assert_eq!(m.avg_latency_ms, Some(150.0));
    }

    #[test]
    fn test_parse_roster() {
        let roster = AgentRoster::from_yaml(
            r#"
agents:
  - id: grammar-bot
    displayName: GrammarBot
    capabilities: [grammar_check]
    endpoint: sim://grammar
    simulate:
      latencyMs: 10
"#,
        )
        .unwrap();
        assert_eq!(roster.agents.len(), 1);
        assert!(roster.agents[0].record.has_capability("GRAMMAR_CHECK"));
        assert_eq!(roster.agents[0].record.status, AgentStatus::Online);
        assert!(roster.agents[0].simulate.is_some());
    }
}
