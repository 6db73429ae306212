//! Built-in workflow templates.
//!
//! Templates are ordinary definitions whose parameters carry
//! `${input.<key>}` placeholders, filled from caller input on instantiation.

use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::error::MeshError;
use crate::models::workflow::{Priority, StepSpec, WorkflowDefinition, WorkflowType};
use crate::workflow::interpolate::resolve_inputs;

#[derive(Debug, Clone, Copy)]
pub struct WorkflowTemplate {
    pub name: &'static str,
    pub description: &'static str,
    build: fn() -> WorkflowDefinition,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateSummary {
    pub name: String,
    pub description: String,
    pub workflow_type: WorkflowType,
    pub steps: Vec<TemplateStep>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateStep {
    pub step_id: String,
    pub capability: String,
}

impl WorkflowTemplate {
    pub fn definition(&self) -> WorkflowDefinition {
        (self.build)()
    }

    pub fn summary(&self) -> TemplateSummary {
        let def = self.definition();
        TemplateSummary {
            name: self.name.to_string(),
            description: self.description.to_string(),
            workflow_type: def.workflow_type,
            steps: def
                .steps
                .iter()
                .map(|s| TemplateStep {
                    step_id: s.step_id.clone(),
                    capability: s.capability.clone(),
                })
                .collect(),
        }
    }

    /// Fill placeholders from `input`. Parameters whose placeholder has no
    /// input are dropped, so optional fields fall back to schema defaults and
    /// missing required fields fail compilation.
    pub fn instantiate(&self, input: &Map<String, Value>) -> WorkflowDefinition {
        let mut def = self.definition();
        for step in &mut def.steps {
            let resolved = resolve_inputs(&step.parameters, input);
            step.parameters = prune_unresolved(resolved);
        }
        if let Some(priority) = input
            .get("priority")
            .and_then(Value::as_str)
            .and_then(|p| serde_json::from_value::<Priority>(json!(p)).ok())
        {
            def.priority = priority;
        }
        def
    }
}

fn prune_unresolved(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !matches!(v, Value::String(s) if s.contains("${input.")))
                .map(|(k, v)| (k, prune_unresolved(v)))
                .collect(),
        ),
        other => other,
    }
}

pub fn builtin_templates() -> Vec<WorkflowTemplate> {
    vec![
        WorkflowTemplate {
            name: "email_composition",
            description: "Draft an email, enhance the writing, then check grammar",
            build: email_composition,
        },
        WorkflowTemplate {
            name: "contact_intelligence",
            description: "Look up a contact, enrich it from the CRM, then synthesize a profile",
            build: contact_intelligence,
        },
    ]
}

pub fn find_template(name: &str) -> Result<WorkflowTemplate, MeshError> {
    builtin_templates()
        .into_iter()
        .find(|t| t.name == name)
        .ok_or_else(|| MeshError::NotFound(format!("workflow template {}", name)))
}

fn email_composition() -> WorkflowDefinition {
    let mut def = WorkflowDefinition::new(
        "email_composition",
        WorkflowType::Sequential,
        vec![
            StepSpec::new("initial_draft", "email_draft").with_parameters(json!({
                "recipient_email": "${input.recipient_email}",
                "subject": "${input.subject}",
                "body": "${input.body}",
                "template_type": "${input.template_type}",
                "priority": "${input.priority}",
            })),
            StepSpec::new("content_enhancement", "writing_assistance")
                .depends_on(["initial_draft"])
                .with_parameters(json!({ "draft": "${steps.initial_draft.output}" })),
            StepSpec::new("grammar_check", "grammar_check")
                .depends_on(["content_enhancement"])
                .with_parameters(json!({ "text": "${steps.content_enhancement.output}" })),
        ],
    );
    def.name = Some("Email Composition".to_string());
    def
}

fn contact_intelligence() -> WorkflowDefinition {
    let mut def = WorkflowDefinition::new(
        "contact_intelligence",
        WorkflowType::Sequential,
        vec![
            StepSpec::new("basic_contact_info", "contact_lookup").with_parameters(json!({
                "name": "${input.name}",
                "email": "${input.email}",
                "company": "${input.company}",
                "expertise": "${input.expertise}",
            })),
            StepSpec::new("crm_enrichment", "crm_lookup")
                .depends_on(["basic_contact_info"])
                .with_parameters(json!({ "contact": "${steps.basic_contact_info.output}" })),
            StepSpec::new("profile_synthesis", "profile_synthesis")
                .depends_on(["crm_enrichment"])
                .with_parameters(json!({
                    "contact": "${steps.basic_contact_info.output}",
                    "crm": "${steps.crm_enrichment.output}",
                })),
        ],
    );
    def.name = Some("Contact Intelligence".to_string());
    def
}
