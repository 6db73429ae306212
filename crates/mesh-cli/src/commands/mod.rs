//! CLI command implementations.
//!
//! Each submodule corresponds to a top-level CLI command and drives the
//! mesh-core orchestrator built by [`init_mesh`].

pub mod agents;
pub mod run;
pub mod templates;
pub mod validate;

use std::sync::Arc;

use mesh_core::models::AgentRoster;
use mesh_core::{AgentInvoker, HttpAgentInvoker, MeshConfig, SimulatedInvoker, WorkflowOrchestrator};
use serde::Serialize;

/// Load configuration from `path`, or defaults when no file is given.
pub fn load_config(path: Option<&str>) -> Result<MeshConfig, String> {
    match path {
        Some(p) => MeshConfig::from_file(p).map_err(|e| e.to_string()),
        None => Ok(MeshConfig::default()),
    }
}

/// Build an orchestrator and register the agents from a roster file.
///
/// With `simulate`, agents are served in-process using each entry's
/// `simulate` block; otherwise requests go to their HTTP endpoints.
pub fn init_mesh(
    config: MeshConfig,
    roster_path: Option<&str>,
    simulate: bool,
) -> Result<WorkflowOrchestrator, String> {
    let roster = match roster_path {
        Some(p) => AgentRoster::from_file(p).map_err(|e| e.to_string())?,
        None => AgentRoster::default(),
    };

    let invoker: Arc<dyn AgentInvoker> = if simulate {
        let sim = SimulatedInvoker::new();
        for entry in &roster.agents {
            if let Some(behavior) = &entry.simulate {
                sim.set_behavior(&entry.record.id, behavior.clone());
            }
        }
        Arc::new(sim)
    } else {
        Arc::new(HttpAgentInvoker::new())
    };

    let orchestrator = WorkflowOrchestrator::from_config(config, invoker);
    for entry in roster.agents {
        let id = entry.record.id.clone();
        orchestrator
            .registry()
            .register(entry.record)
            .map_err(|e| format!("Agent '{}': {}", id, e))?;
    }
    tracing::info!(
        "[Mesh] {} agent(s) registered ({})",
        orchestrator.registry().len(),
        if simulate { "simulated" } else { "http" }
    );
    Ok(orchestrator)
}

pub fn print_json<T: Serialize>(value: &T) -> Result<(), String> {
    let text = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    println!("{}", text);
    Ok(())
}
