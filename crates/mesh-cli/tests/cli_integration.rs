//! Integration tests for the mesh-cli commands.
//!
//! These tests exercise the same code paths as the binary, using roster and
//! workflow files written to a temp directory and simulated agents.

use std::io::Write;

use mesh_cli::commands;
use mesh_core::models::RunStatus;
use mesh_core::models::{StepStatus, WorkflowDefinition};

const ROSTER: &str = r#"
agents:
  - id: email-bot
    displayName: EmailBot
    capabilities: [email_draft, writing_assistance]
    endpoint: http://localhost:8101
    supportedProtocols: [mcp, a2a]
    simulate:
      latencyMs: 10
  - id: grammar-bot
    displayName: GrammarBot
    capabilities: [grammar_check]
    endpoint: http://localhost:8102
    supportedProtocols: [mcp]
  - id: crm-bot
    displayName: CRM
    capabilities: [contact_lookup]
    endpoint: http://localhost:8103
    simulate:
      failure: permanent
"#;

const DRAFT_WORKFLOW: &str = r#"
id: outreach
name: Outreach email
type: sequential
steps:
  - stepId: draft
    capability: email_draft
    parameters:
      recipient_email: sarah.johnson@techcorp.com
      subject: AI Research Collaboration
      body: Hi Sarah
  - stepId: polish
    capability: grammar_check
    parameters:
      text: "${steps.draft.output.parameters.body}"
"#;

fn write_file(dir: &tempfile::TempDir, name: &str, content: &str) -> String {
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path).expect("create file");
    file.write_all(content.as_bytes()).expect("write file");
    path.to_string_lossy().into_owned()
}

fn simulated_mesh(dir: &tempfile::TempDir) -> mesh_core::WorkflowOrchestrator {
    let roster = write_file(dir, "agents.yaml", ROSTER);
    commands::init_mesh(commands::load_config(None).unwrap(), Some(&roster), true)
        .expect("init mesh")
}

#[tokio::test]
async fn test_run_workflow_file() {
    let dir = tempfile::tempdir().unwrap();
    let mesh = simulated_mesh(&dir);
    assert_eq!(mesh.registry().len(), 3);

    let file = write_file(&dir, "outreach.yaml", DRAFT_WORKFLOW);
    let definition = WorkflowDefinition::from_file(&file).unwrap();
    let run = commands::run::execute(&mesh, definition, None).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    let polish = run.step("polish").unwrap();
    assert_eq!(polish.agent_id.as_deref(), Some("grammar-bot"));
    assert_eq!(polish.output.as_ref().unwrap()["parameters"]["text"], "Hi Sarah");
    assert!(commands::run::report(&run).is_ok());
}

#[tokio::test]
async fn test_failed_run_reports_error() {
    let dir = tempfile::tempdir().unwrap();
    let mesh = simulated_mesh(&dir);

    let file = write_file(
        &dir,
        "lookup.yaml",
        "id: lookup\ntype: sequential\nsteps:\n  - stepId: find\n    capability: contact_lookup\n",
    );
    let definition = WorkflowDefinition::from_file(&file).unwrap();
    let run = commands::run::execute(&mesh, definition, None).await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.step("find").unwrap().status, StepStatus::Failed);
    let err = commands::run::report(&run).unwrap_err();
    assert!(err.contains("find"), "{err}");
}

#[test]
fn test_validate_rejects_cycles() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_file(
        &dir,
        "cycle.yaml",
        r#"
id: cycle
type: parallel
steps:
  - stepId: a
    capability: grammar_check
    dependsOn: [b]
  - stepId: b
    capability: grammar_check
    dependsOn: [a]
"#,
    );
    let err = commands::validate::compile_file(&file).unwrap_err();
    assert!(err.contains("CYCLIC_DEPENDENCY"), "{err}");

    let ok = write_file(&dir, "outreach.yaml", DRAFT_WORKFLOW);
    let graph = commands::validate::compile_file(&ok).unwrap();
    assert_eq!(graph.topological_order(), vec!["draft", "polish"]);
    assert!(commands::validate::validate(&ok).is_ok());
}

#[test]
fn test_validate_rejects_bad_parameters() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_file(
        &dir,
        "bad.yaml",
        "id: bad\nsteps:\n  - stepId: draft\n    capability: email_draft\n    parameters:\n      subject: Hi\n",
    );
    let err = commands::validate::compile_file(&file).unwrap_err();
    assert!(err.contains("INVALID_PARAMETERS"), "{err}");
}

#[test]
fn test_discover_query() {
    let dir = tempfile::tempdir().unwrap();
    let mesh = simulated_mesh(&dir);

    let query = commands::agents::build_query(Some("email_draft"), Some("a2a"), None, None).unwrap();
    let found = mesh.registry().discover(&query);
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, "email-bot");

    let query = commands::agents::build_query(None, Some("mcp"), Some("online"), Some(1)).unwrap();
    assert_eq!(mesh.registry().discover(&query).len(), 1);

    assert!(commands::agents::build_query(None, None, Some("sleeping"), None).is_err());
}

#[test]
fn test_missing_roster_and_config() {
    assert!(commands::load_config(Some("/nonexistent/mesh.yaml")).is_err());
    let config = commands::load_config(None).unwrap();
    assert!(commands::init_mesh(config, Some("/nonexistent/agents.yaml"), true).is_err());
}

#[test]
fn test_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_file(
        &dir,
        "mesh.yaml",
        "dispatch:\n  maxAttempts: 5\norchestrator:\n  maxParallelSteps: 2\n",
    );
    let config = commands::load_config(Some(&file)).unwrap();
    assert_eq!(config.dispatch.max_attempts, 5);
    assert_eq!(config.orchestrator.max_parallel_steps, 2);
}
