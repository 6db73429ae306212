//! Agent registry: registration, discovery and health tracking.
//!
//! Lock order is always store membership → agent slot → capability index,
//! so the index is updated inside the same critical section as the record it
//! derives from. No lock is held across an `.await`.

pub mod capability_index;

use std::cmp::Ordering;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::RegistryConfig;
use crate::error::MeshError;
use crate::models::agent::{AgentRecord, AgentStatus, DiscoveryQuery, HealthSample};
use crate::store::agent_store::{poisoned, AgentRecordStore};

pub use capability_index::CapabilityIndex;

/// Dispatch-side observation fed back into an agent's metrics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DispatchSample {
    Success { latency_ms: f64 },
    Failure { transient: bool },
}

struct RegistryInner {
    store: AgentRecordStore,
    index: RwLock<CapabilityIndex>,
    config: RegistryConfig,
}

/// Owned registry handle; clones share the same tables.
#[derive(Clone)]
pub struct AgentRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl AgentRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                store: AgentRecordStore::new(),
                index: RwLock::new(CapabilityIndex::new()),
                config,
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Insert or replace an agent by id.
    pub fn register(&self, mut record: AgentRecord) -> Result<(), MeshError> {
        record.validate()?;
        if record.last_heartbeat_at.is_none() {
            record.last_heartbeat_at = Some(Utc::now());
        }
        if record.status == AgentStatus::Offline && record.offline_since.is_none() {
            record.offline_since = record.last_heartbeat_at;
        }

        let id = record.id.clone();
        let mut agents = self.inner.store.write()?;
        let mut index = self.inner.index.write().map_err(poisoned)?;
        index.sync(&record);
        let replaced = agents
            .insert(id.clone(), Arc::new(Mutex::new(record)))
            .is_some();

        tracing::info!(
            "[Registry] {} agent {} ({} total)",
            if replaced { "Replaced" } else { "Registered" },
            id,
            agents.len()
        );
        Ok(())
    }

    pub fn deregister(&self, agent_id: &str) -> Result<AgentRecord, MeshError> {
        let mut agents = self.inner.store.write()?;
        let slot = agents
            .remove(agent_id)
            .ok_or_else(|| MeshError::NotFound(format!("agent {}", agent_id)))?;
        self.inner.index.write().map_err(poisoned)?.remove(agent_id);

        tracing::info!("[Registry] Deregistered agent {}", agent_id);
        let record = slot.lock().map_err(poisoned)?.clone();
        Ok(record)
    }

    /// Apply a health sample and return the recomputed status.
    pub fn heartbeat(&self, agent_id: &str, sample: HealthSample) -> Result<AgentStatus, MeshError> {
        self.mutate(agent_id, |record, cfg| {
            let before = record.status;
            record.apply_health(&sample, cfg, Utc::now());
            if before != record.status {
                tracing::info!(
                    "[Registry] Agent {} {} -> {}",
                    record.id,
                    before.as_str(),
                    record.status.as_str()
                );
            }
            record.status
        })
    }

    /// Metric update after one dispatch attempt.
    ///
    /// Success refreshes `last_heartbeat_at` and ends the failure streak. A
    /// transient failure is also fed through the heartbeat path as an
    /// unreachable sample when `downgrade_on_dispatch_failure` is set, and a
    /// later success then counts as a healthy sample.
    pub fn record_dispatch(&self, agent_id: &str, sample: DispatchSample) -> Result<AgentStatus, MeshError> {
        self.mutate(agent_id, |record, cfg| {
            let now = Utc::now();
            record.metrics.total_calls += 1;
            match sample {
                DispatchSample::Success { latency_ms } => {
                    if cfg.downgrade_on_dispatch_failure && record.consecutive_failures > 0 {
                        // The streak came from dispatch failures; a completed
                        // call counts as a healthy sample.
                        let before = record.status;
                        record.apply_health(&HealthSample::healthy(latency_ms), cfg, now);
                        if before != record.status {
                            tracing::info!(
                                "[Registry] Agent {} recovered {} -> {} after successful dispatch",
                                record.id,
                                before.as_str(),
                                record.status.as_str()
                            );
                        }
                    } else {
                        record.consecutive_failures = 0;
                        record.metrics.observe_latency(latency_ms, cfg.latency_ewma_alpha);
                        record.last_heartbeat_at = Some(now);
                    }
                }
                DispatchSample::Failure { transient } => {
                    record.metrics.total_failures += 1;
                    if transient && cfg.downgrade_on_dispatch_failure {
                        let before = record.status;
                        record.apply_health(&HealthSample::unreachable(), cfg, now);
                        if before != record.status {
                            tracing::warn!(
                                "[Registry] Agent {} downgraded {} -> {} after dispatch failure",
                                record.id,
                                before.as_str(),
                                record.status.as_str()
                            );
                        }
                    }
                }
            }
            record.status
        })
    }

    fn mutate<R>(
        &self,
        agent_id: &str,
        f: impl FnOnce(&mut AgentRecord, &RegistryConfig) -> R,
    ) -> Result<R, MeshError> {
        let agents = self.inner.store.read()?;
        let slot = agents
            .get(agent_id)
            .ok_or_else(|| MeshError::NotFound(format!("agent {}", agent_id)))?;
        let mut record = slot.lock().map_err(poisoned)?;
        let out = f(&mut record, &self.inner.config);
        self.inner.index.write().map_err(poisoned)?.sync(&record);
        Ok(out)
    }

    /// Matching records ordered by ascending average latency, then id.
    /// Agents without a latency sample sort last.
    pub fn discover(&self, query: &DiscoveryQuery) -> Vec<AgentRecord> {
        let Ok(agents) = self.inner.store.read() else {
            return Vec::new();
        };

        let only_available = query
            .statuses
            .as_ref()
            .map(|s| s.iter().all(|st| st.is_available()))
            .unwrap_or(true);

        let mut matches: Vec<AgentRecord> = match (&query.capability, only_available) {
            (Some(capability), true) => {
                let ids = self
                    .inner
                    .index
                    .read()
                    .map(|index| index.ids(capability))
                    .unwrap_or_default();
                ids.iter()
                    .filter_map(|id| agents.get(id))
                    .filter_map(|slot| slot.lock().ok().map(|r| r.clone()))
                    .collect()
            }
            (capability, _) => agents
                .values()
                .filter_map(|slot| slot.lock().ok().map(|r| r.clone()))
                .filter(|r| capability.as_ref().map_or(true, |c| r.has_capability(c)))
                .collect(),
        };
        drop(agents);

        matches.retain(|r| {
            query.accepts_status(r.status)
                && query.protocol.as_ref().map_or(true, |p| r.supports_protocol(p))
        });
        matches.sort_by(compare_for_discovery);
        if let Some(limit) = query.limit {
            matches.truncate(limit);
        }
        matches
    }

    /// Candidate agents for a capability, in discovery order.
    pub fn candidates(&self, capability: &str) -> Vec<AgentRecord> {
        self.discover(&DiscoveryQuery::capability(capability))
    }

    /// Candidate ids for a capability, in discovery order.
    pub fn resolve(&self, capability: &str) -> Vec<String> {
        self.candidates(capability).into_iter().map(|r| r.id).collect()
    }

    pub fn get_status(&self, agent_id: &str) -> Result<AgentRecord, MeshError> {
        self.inner
            .store
            .snapshot(agent_id)
            .ok_or_else(|| MeshError::NotFound(format!("agent {}", agent_id)))
    }

    pub fn list(&self) -> Vec<AgentRecord> {
        self.inner.store.list()
    }

    pub fn len(&self) -> usize {
        self.inner.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.store.is_empty()
    }

    /// Capabilities currently served by at least one Online or Degraded agent.
    pub fn capabilities(&self) -> Vec<String> {
        self.inner
            .index
            .read()
            .map(|index| index.capabilities())
            .unwrap_or_default()
    }

    /// Mark silent agents Offline and remove agents Offline past the grace
    /// period. Returns the removed ids.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<Vec<String>, MeshError> {
        let cfg = &self.inner.config;
        let stale_after = to_chrono(cfg.stale_after());
        let grace = to_chrono(cfg.offline_grace());

        let mut expired = Vec::new();
        {
            let agents = self.inner.store.read()?;
            for slot in agents.values() {
                let mut record = slot.lock().map_err(poisoned)?;
                let silent = record
                    .last_heartbeat_at
                    .map(|at| now - at > stale_after)
                    .unwrap_or(true);
                if record.status != AgentStatus::Offline && silent {
                    tracing::warn!(
                        "[Registry] Agent {} missed {} heartbeats, marking offline",
                        record.id,
                        cfg.missed_heartbeat_limit
                    );
                    record.mark_offline(now);
                    self.inner.index.write().map_err(poisoned)?.sync(&record);
                }
                if is_expired(&record, now, grace) {
                    expired.push(record.id.clone());
                }
            }
        }

        if expired.is_empty() {
            return Ok(expired);
        }

        let mut removed = Vec::new();
        let mut agents = self.inner.store.write()?;
        let mut index = self.inner.index.write().map_err(poisoned)?;
        for id in expired {
            let still_expired = agents
                .get(&id)
                .and_then(|slot| slot.lock().ok().map(|r| is_expired(&r, now, grace)))
                .unwrap_or(false);
            if still_expired {
                agents.remove(&id);
                index.remove(&id);
                tracing::info!("[Registry] Removed agent {} after offline grace period", id);
                removed.push(id);
            }
        }
        Ok(removed)
    }

    /// Run `sweep` every heartbeat interval until `cancel` fires.
    pub fn spawn_health_sweeper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = self.clone();
        let period = registry.config().heartbeat_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = registry.sweep(Utc::now()) {
                            tracing::error!("[Registry] Health sweep failed: {}", e);
                        }
                    }
                }
            }
            tracing::debug!("[Registry] Health sweeper stopped");
        })
    }
}

fn is_expired(record: &AgentRecord, now: DateTime<Utc>, grace: chrono::Duration) -> bool {
    record.status == AgentStatus::Offline
        && record
            .offline_since
            .map(|since| now - since > grace)
            .unwrap_or(false)
}

fn to_chrono(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

fn compare_for_discovery(a: &AgentRecord, b: &AgentRecord) -> Ordering {
    let by_latency = match (a.metrics.avg_latency_ms, b.metrics.avg_latency_ms) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_latency.then_with(|| a.id.cmp(&b.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::agent::HealthSample;

    fn agent(id: &str, caps: &[&str], latency: Option<f64>) -> AgentRecord {
        let mut r = AgentRecord::new(id, id, caps.iter().copied(), format!("sim://{}", id));
        r.metrics.avg_latency_ms = latency;
        r
    }

    #[test]
    fn test_register_discover_deregister() {
        let registry = AgentRegistry::default();
        registry
            .register(agent("email-bot", &["email_draft"], Some(50.0)))
            .unwrap();
        let found = registry.discover(&DiscoveryQuery::capability("email_draft"));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "email-bot");

        registry.deregister("email-bot").unwrap();
        assert!(registry.discover(&DiscoveryQuery::capability("email_draft")).is_empty());
        assert!(registry.discover(&DiscoveryQuery::default()).is_empty());
        assert!(matches!(registry.deregister("email-bot"), Err(MeshError::NotFound(_))));
    }

    #[test]
    fn test_register_rejects_invalid() {
        let registry = AgentRegistry::default();
        let err = registry.register(agent("bot", &[], None)).unwrap_err();
        assert!(matches!(err, MeshError::InvalidRecord(_)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_discovery_order_latency_then_id_unknown_last() {
        let registry = AgentRegistry::default();
        registry.register(agent("slow", &["email_draft"], Some(200.0))).unwrap();
        registry.register(agent("fast", &["email_draft"], Some(50.0))).unwrap();
        registry.register(agent("new-b", &["email_draft"], None)).unwrap();
        registry.register(agent("new-a", &["email_draft"], None)).unwrap();
        registry.register(agent("tie", &["email_draft"], Some(50.0))).unwrap();

        assert_eq!(
            registry.resolve("EMAIL_DRAFT"),
            vec!["fast", "tie", "slow", "new-a", "new-b"]
        );
    }

    #[test]
    fn test_discover_filters_protocol_and_status() {
        let registry = AgentRegistry::default();
        registry
            .register(agent("a", &["grammar_check"], Some(10.0)).with_protocols(["mcp"]))
            .unwrap();
        registry
            .register(agent("b", &["grammar_check"], Some(20.0)).with_protocols(["a2a", "mcp"]))
            .unwrap();

        let q = DiscoveryQuery::capability("grammar_check").with_protocol("A2A");
        let ids: Vec<_> = registry.discover(&q).into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["b"]);

        for _ in 0..3 {
            registry.heartbeat("a", HealthSample::unreachable()).unwrap();
        }
        assert_eq!(registry.resolve("grammar_check"), vec!["b"]);

        let offline = DiscoveryQuery::capability("grammar_check").with_statuses([AgentStatus::Offline]);
        let ids: Vec<_> = registry.discover(&offline).into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["a"]);
    }

    #[test]
    fn test_heartbeat_unknown_agent() {
        let registry = AgentRegistry::default();
        assert!(matches!(
            registry.heartbeat("ghost", HealthSample::healthy(1.0)),
            Err(MeshError::NotFound(_))
        ));
        assert!(matches!(registry.get_status("ghost"), Err(MeshError::NotFound(_))));
    }

    #[test]
    fn test_record_dispatch_updates_metrics_and_health() {
        let registry = AgentRegistry::default();
        registry.register(agent("crm", &["crm_lookup"], None)).unwrap();

        registry
            .record_dispatch("crm", DispatchSample::Success { latency_ms: 40.0 })
            .unwrap();
        let status = registry
            .record_dispatch("crm", DispatchSample::Failure { transient: true })
            .unwrap();
        assert_eq!(status, AgentStatus::Degraded);
        registry
            .record_dispatch("crm", DispatchSample::Failure { transient: false })
            .unwrap();

        let record = registry.get_status("crm").unwrap();
        assert_eq!(record.metrics.total_calls, 3);
        assert_eq!(record.metrics.total_failures, 2);
        assert_eq!(record.metrics.avg_latency_ms, Some(40.0));
        assert_eq!(record.consecutive_failures, 1);
    }

    #[test]
    fn test_successful_dispatch_ends_failure_streak() {
        let registry = AgentRegistry::default();
        registry.register(agent("crm", &["crm_lookup"], None)).unwrap();

        for _ in 0..3 {
            let status = registry
                .record_dispatch("crm", DispatchSample::Failure { transient: true })
                .unwrap();
            assert_eq!(status, AgentStatus::Degraded);
            let status = registry
                .record_dispatch("crm", DispatchSample::Success { latency_ms: 20.0 })
                .unwrap();
            assert_eq!(status, AgentStatus::Online);
        }

        let record = registry.get_status("crm").unwrap();
        assert_eq!(record.consecutive_failures, 0);
        assert_eq!(record.metrics.total_failures, 3);
        assert_eq!(registry.resolve("crm_lookup"), vec!["crm"]);

        // Consecutive failures still take it offline.
        for _ in 0..3 {
            registry
                .record_dispatch("crm", DispatchSample::Failure { transient: true })
                .unwrap();
        }
        assert_eq!(registry.get_status("crm").unwrap().status, AgentStatus::Offline);
        assert!(registry.resolve("crm_lookup").is_empty());
    }

    #[test]
    fn test_unicode_capability_matches_index_and_scan() {
        let registry = AgentRegistry::default();
        registry
            .register(agent("intl", &["Übersetzung"], Some(10.0)).with_protocols(["MCP"]))
            .unwrap();

        let indexed = registry.discover(&DiscoveryQuery::capability("übersetzung"));
        let scanned = registry.discover(
            &DiscoveryQuery::capability("ÜBERSETZUNG")
                .with_statuses([AgentStatus::Online, AgentStatus::Offline]),
        );
        assert_eq!(indexed.len(), 1);
        assert_eq!(scanned.len(), 1);
        assert!(indexed[0].supports_protocol(" mcp "));
    }

    #[test]
    fn test_sweep_marks_offline_then_removes_after_grace() {
        let registry = AgentRegistry::new(RegistryConfig {
            heartbeat_interval_ms: 1_000,
            missed_heartbeat_limit: 2,
            offline_grace_ms: 10_000,
            ..RegistryConfig::default()
        });
        registry.register(agent("net", &["profile_synthesis"], None)).unwrap();
        let t0 = registry.get_status("net").unwrap().last_heartbeat_at.unwrap();

        assert!(registry.sweep(t0 + chrono::Duration::milliseconds(1_500)).unwrap().is_empty());
        assert_eq!(registry.get_status("net").unwrap().status, AgentStatus::Online);

        let t1 = t0 + chrono::Duration::milliseconds(2_500);
        assert!(registry.sweep(t1).unwrap().is_empty());
        assert_eq!(registry.get_status("net").unwrap().status, AgentStatus::Offline);
        assert!(registry.resolve("profile_synthesis").is_empty());

        let removed = registry.sweep(t1 + chrono::Duration::milliseconds(10_001)).unwrap();
        assert_eq!(removed, vec!["net"]);
        assert!(registry.get_status("net").is_err());
    }

    #[test]
    fn test_recovered_agent_is_not_removed() {
        let registry = AgentRegistry::new(RegistryConfig {
            offline_after_failures: 1,
            offline_grace_ms: 0,
            ..RegistryConfig::default()
        });
        registry.register(agent("bot", &["grammar_check"], None)).unwrap();
        registry.heartbeat("bot", HealthSample::unreachable()).unwrap();
        registry.heartbeat("bot", HealthSample::healthy(5.0)).unwrap();
        let later = Utc::now() + chrono::Duration::seconds(1);
        assert!(registry.sweep(later).unwrap().is_empty());
        assert_eq!(registry.resolve("grammar_check"), vec!["bot"]);
    }
}
