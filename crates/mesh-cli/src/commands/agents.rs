//! `mesh agents` — Inspect the agent registry.

use mesh_core::models::{AgentRecord, AgentStatus, DiscoveryQuery};
use mesh_core::WorkflowOrchestrator;

use super::print_json;

pub fn list(orchestrator: &WorkflowOrchestrator) -> Result<(), String> {
    print_json(&orchestrator.registry().list())
}

pub fn build_query(
    capability: Option<&str>,
    protocol: Option<&str>,
    status: Option<&str>,
    limit: Option<usize>,
) -> Result<DiscoveryQuery, String> {
    let mut query = DiscoveryQuery {
        capability: capability.map(str::to_string),
        limit,
        ..DiscoveryQuery::default()
    };
    if let Some(p) = protocol {
        query = query.with_protocol(p);
    }
    if let Some(s) = status {
        let status = AgentStatus::from_str(s)
            .ok_or_else(|| format!("Unknown status '{}'. Use ONLINE, DEGRADED or OFFLINE", s))?;
        query = query.with_statuses([status]);
    }
    Ok(query)
}

pub fn discover(orchestrator: &WorkflowOrchestrator, query: &DiscoveryQuery) -> Result<(), String> {
    let found: Vec<AgentRecord> = orchestrator.registry().discover(query);
    if found.is_empty() {
        tracing::info!("[Mesh] No agents match the query");
    }
    print_json(&found)
}
