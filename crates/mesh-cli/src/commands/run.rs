//! `mesh run` — Execute a workflow definition file.

use mesh_core::models::{RunStatus, WorkflowDefinition, WorkflowRun};
use mesh_core::WorkflowOrchestrator;

use super::print_json;

/// Submit a definition and wait for the run, cancelling it on Ctrl-C.
pub async fn execute(
    orchestrator: &WorkflowOrchestrator,
    mut definition: WorkflowDefinition,
    timeout_ms: Option<u64>,
) -> Result<WorkflowRun, String> {
    if let Some(ms) = timeout_ms {
        definition.timeout_ms = Some(ms);
    }
    let run_id = orchestrator.submit(definition).await.map_err(|e| e.to_string())?;

    tokio::select! {
        run = orchestrator.wait(&run_id) => run.map_err(|e| e.to_string()),
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("[Mesh] Interrupted, cancelling run {}", run_id);
            orchestrator.cancel(&run_id).map_err(|e| e.to_string())?;
            orchestrator.wait(&run_id).await.map_err(|e| e.to_string())
        }
    }
}

/// Print the final run and turn anything but success into an error.
pub fn report(run: &WorkflowRun) -> Result<(), String> {
    print_json(run)?;
    if run.status == RunStatus::Completed {
        return Ok(());
    }
    let failed: Vec<&str> = run.failed_steps().iter().map(|s| s.step_id.as_str()).collect();
    let reason = run
        .error
        .as_ref()
        .map(|e| e.message.clone())
        .unwrap_or_else(|| run.status.as_str().to_string());
    if failed.is_empty() {
        Err(format!("Workflow {}: {}", run.status.as_str(), reason))
    } else {
        Err(format!(
            "Workflow {}: {}. Failed steps: {}",
            run.status.as_str(),
            reason,
            failed.join(", ")
        ))
    }
}

pub async fn run(
    orchestrator: &WorkflowOrchestrator,
    workflow_file: &str,
    timeout_ms: Option<u64>,
) -> Result<(), String> {
    let definition = WorkflowDefinition::from_file(workflow_file).map_err(|e| e.to_string())?;
    tracing::info!(
        "[Mesh] Loaded workflow {} from '{}'",
        definition.display_name(),
        workflow_file
    );
    let run = execute(orchestrator, definition, timeout_ms).await?;
    report(&run)
}
