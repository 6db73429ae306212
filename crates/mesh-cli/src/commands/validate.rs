//! `mesh validate` — Compile a workflow file without executing it.

use mesh_core::models::WorkflowDefinition;
use mesh_core::{CompiledGraph, GraphBuilder};

pub fn compile_file(workflow_file: &str) -> Result<CompiledGraph, String> {
    let definition = WorkflowDefinition::from_file(workflow_file).map_err(|e| e.to_string())?;
    GraphBuilder::compile(&definition).map_err(|e| format!("[{}] {}", e.code(), e))
}

pub fn validate(workflow_file: &str) -> Result<(), String> {
    let graph = compile_file(workflow_file)?;
    let def = &graph.definition;

    println!("Workflow '{}' is valid", def.display_name());
    println!("   Type: {}", def.workflow_type.as_str());
    println!("   Priority: {}", def.priority.as_str());
    println!("   Nodes: {}", graph.len());

    for (i, node) in graph.nodes().iter().enumerate() {
        if node.depends_on.is_empty() {
            println!("   {}. {} ({})", i + 1, node.node_id, node.capability);
        } else {
            println!(
                "   {}. {} ({}) after {}",
                i + 1,
                node.node_id,
                node.capability,
                node.depends_on.join(", ")
            );
        }
    }
    Ok(())
}
