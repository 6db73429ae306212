//! `mesh templates` / `mesh template` — Built-in workflow templates.

use mesh_core::WorkflowOrchestrator;
use serde_json::{Map, Value};

use super::print_json;

pub fn list(orchestrator: &WorkflowOrchestrator) -> Result<(), String> {
    print_json(&orchestrator.templates())
}

/// Parse `key=value` pairs. Values that parse as JSON keep their type.
pub fn parse_inputs(pairs: &[String]) -> Result<Map<String, Value>, String> {
    let mut input = Map::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| format!("Invalid input '{}', expected key=value", pair))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(format!("Invalid input '{}', empty key", pair));
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        input.insert(key.to_string(), value);
    }
    Ok(input)
}

pub async fn run(
    orchestrator: &WorkflowOrchestrator,
    name: &str,
    inputs: &[String],
    timeout_ms: Option<u64>,
) -> Result<(), String> {
    let input = parse_inputs(inputs)?;
    let template = mesh_core::workflow::find_template(name).map_err(|e| e.to_string())?;
    let definition = template.instantiate(&input);
    let run = super::run::execute(orchestrator, definition, timeout_ms).await?;
    super::run::report(&run)
}
