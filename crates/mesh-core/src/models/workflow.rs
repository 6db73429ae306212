//! Workflow definition types.
//!
//! A workflow YAML declares the steps to run and how they relate:
//!
//! ```yaml
//! id: outreach
//! name: "Contact outreach"
//! type: conditional
//! priority: high
//! timeoutMs: 60000
//! steps:
//!   - stepId: lookup
//!     capability: contact_lookup
//!     parameters:
//!       name: "Sarah Johnson"
//!   - stepId: draft
//!     capability: email_draft
//!     dependsOn: [lookup]
//!     condition:
//!       op: output_contains
//!       step: lookup
//!       path: company
//!       value: "TechCorp"
//!     parameters:
//!       recipient_email: "${steps.lookup.output.email}"
//!       subject: "Following up"
//!       body: "Hi ${steps.lookup.output.name}"
//! ```

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::MeshError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowType {
    #[default]
    Sequential,
    Parallel,
    Conditional,
    Loop,
}

impl WorkflowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
            Self::Conditional => "conditional",
            Self::Loop => "loop",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sequential" => Some(Self::Sequential),
            "parallel" => Some(Self::Parallel),
            "conditional" => Some(Self::Conditional),
            "loop" => Some(Self::Loop),
            _ => None,
        }
    }
}

/// Ordering hint for run listings; higher sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        }
    }
}

/// How step failures escalate to the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// First step failure fails the run (default).
    #[default]
    FailFast,
    /// Keep running independent steps until the failure ratio is exceeded.
    BestEffort,
}

/// How a Skipped dependency affects its dependents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SkipPolicy {
    /// Dependents of a skipped step are skipped too.
    #[default]
    Cascade,
    /// A step skipped by a false guard counts as resolved for its dependents.
    Unlock,
}

/// Guard predicate evaluated against already available step results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StepCondition {
    Succeeded {
        step: String,
    },
    OutputContains {
        step: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        value: String,
    },
    OutputEquals {
        step: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        value: Value,
    },
    Not {
        condition: Box<StepCondition>,
    },
    All {
        conditions: Vec<StepCondition>,
    },
    Any {
        conditions: Vec<StepCondition>,
    },
}

impl StepCondition {
    /// Every step id this predicate reads.
    pub fn referenced_steps(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_steps(&mut out);
        out
    }

    fn collect_steps<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Succeeded { step }
            | Self::OutputContains { step, .. }
            | Self::OutputEquals { step, .. } => out.push(step.as_str()),
            Self::Not { condition } => condition.collect_steps(out),
            Self::All { conditions } | Self::Any { conditions } => {
                for c in conditions {
                    c.collect_steps(out);
                }
            }
        }
    }
}

/// A single step of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSpec {
    pub step_id: String,
    pub capability: String,
    #[serde(default = "empty_parameters")]
    pub parameters: Value,
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    /// Guard; only honoured by Conditional workflows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<StepCondition>,
    /// Unroll bound; only honoured by Loop workflows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    /// Loop exit predicate checked after each iteration; a reference to the
    /// step itself reads the iteration that just finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<StepCondition>,
}

fn empty_parameters() -> Value {
    Value::Object(Map::new())
}

impl StepSpec {
    pub fn new(step_id: impl Into<String>, capability: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            capability: capability.into(),
            parameters: empty_parameters(),
            depends_on: BTreeSet::new(),
            condition: None,
            max_iterations: None,
            until: None,
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn depends_on(mut self, deps: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_condition(mut self, condition: StepCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_max_iterations(mut self, n: u32) -> Self {
        self.max_iterations = Some(n);
        self
    }

    pub fn with_until(mut self, until: StepCondition) -> Self {
        self.until = Some(until);
        self
    }
}

/// Immutable description of a multi-step workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type", default)]
    pub workflow_type: WorkflowType,
    pub steps: Vec<StepSpec>,
    #[serde(default)]
    pub priority: Priority,
    /// Falls back to the orchestrator default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub failure_mode: FailureMode,
    #[serde(default)]
    pub skip_policy: SkipPolicy,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, workflow_type: WorkflowType, steps: Vec<StepSpec>) -> Self {
        Self {
            id: id.into(),
            name: None,
            workflow_type,
            steps,
            priority: Priority::Normal,
            timeout_ms: None,
            failure_mode: FailureMode::FailFast,
            skip_policy: SkipPolicy::Cascade,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    pub fn with_skip_policy(mut self, policy: SkipPolicy) -> Self {
        self.skip_policy = policy;
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Sequential workflows always stop at the first failure.
    pub fn effective_failure_mode(&self) -> FailureMode {
        match self.workflow_type {
            WorkflowType::Sequential => FailureMode::FailFast,
            _ => self.failure_mode,
        }
    }

    /// Parse a workflow definition from a YAML (or JSON) string.
    pub fn from_yaml(yaml: &str) -> Result<Self, MeshError> {
        serde_yaml::from_str(yaml)
            .map_err(|e| MeshError::Config(format!("Failed to parse workflow YAML: {}", e)))
    }

    /// Load a workflow definition from a file path.
    pub fn from_file(path: &str) -> Result<Self, MeshError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            MeshError::Config(format!("Failed to read workflow file '{}': {}", path, e))
        })?;
        Self::from_yaml(&content)
    }
}

// ─── Typed step payloads ──────────────────────────────────────────────────

pub const EMAIL_DRAFT: &str = "email_draft";
pub const CONTACT_LOOKUP: &str = "contact_lookup";
pub const TEMPLATE_SUGGESTION: &str = "template_suggestion";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmailDraftParams {
    pub recipient_email: String,
    pub subject: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContactLookupParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expertise: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateSuggestionParams {
    #[serde(default = "default_context")]
    pub context: String,
    #[serde(default = "default_recipient_type")]
    pub recipient_type: String,
    #[serde(default = "default_urgency")]
    pub urgency: String,
}

fn default_context() -> String {
    "general".to_string()
}

fn default_recipient_type() -> String {
    "colleague".to_string()
}

fn default_urgency() -> String {
    "normal".to_string()
}

/// Step parameters decoded according to the step's capability.
#[derive(Debug, Clone, PartialEq)]
pub enum StepPayload {
    EmailDraft(EmailDraftParams),
    ContactLookup(ContactLookupParams),
    TemplateSuggestion(TemplateSuggestionParams),
    /// Capabilities without a known schema accept any JSON object.
    Generic(Map<String, Value>),
}

impl StepPayload {
    pub fn decode(capability: &str, parameters: &Value) -> Result<Self, String> {
        let parameters = match parameters {
            Value::Null => empty_parameters(),
            Value::Object(_) => parameters.clone(),
            other => return Err(format!("parameters must be an object, got {}", other)),
        };

        let payload = match capability.to_ascii_lowercase().as_str() {
            EMAIL_DRAFT => Self::EmailDraft(decode_params(parameters)?),
            CONTACT_LOOKUP => Self::ContactLookup(decode_params(parameters)?),
            TEMPLATE_SUGGESTION => Self::TemplateSuggestion(decode_params(parameters)?),
            _ => match parameters {
                Value::Object(map) => Self::Generic(map),
                _ => Self::Generic(Map::new()),
            },
        };
        Ok(payload)
    }

    /// Back to the JSON shape sent to agents, with defaults filled in.
    pub fn to_value(&self) -> Value {
        let encoded = match self {
            Self::EmailDraft(p) => serde_json::to_value(p),
            Self::ContactLookup(p) => serde_json::to_value(p),
            Self::TemplateSuggestion(p) => serde_json::to_value(p),
            Self::Generic(map) => Ok(Value::Object(map.clone())),
        };
        encoded.unwrap_or_else(|_| empty_parameters())
    }
}

fn decode_params<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, String> {
    serde_json::from_value(value).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_minimal_workflow() {
        let yaml = r#"
id: "draft-only"
steps:
  - stepId: draft
    capability: email_draft
    parameters:
      recipient_email: "sarah@techcorp.com"
      subject: "Hello"
      body: "Hi Sarah"
"#;
        let wf = WorkflowDefinition::from_yaml(yaml).unwrap();
        assert_eq!(wf.id, "draft-only");
        assert_eq!(wf.workflow_type, WorkflowType::Sequential);
        assert_eq!(wf.priority, Priority::Normal);
        assert_eq!(wf.failure_mode, FailureMode::FailFast);
        assert_eq!(wf.skip_policy, SkipPolicy::Cascade);
        assert_eq!(wf.steps.len(), 1);
        assert!(wf.steps[0].depends_on.is_empty());
    }

    #[test]
    fn test_parse_conditional_with_guard() {
        let yaml = r#"
id: "outreach"
type: conditional
priority: high
timeoutMs: 60000
skipPolicy: unlock
steps:
  - stepId: lookup
    capability: contact_lookup
  - stepId: draft
    capability: email_draft
    dependsOn: [lookup]
    condition:
      op: any
      conditions:
        - op: output_contains
          step: lookup
          path: company
          value: TechCorp
        - op: not
          condition:
            op: succeeded
            step: lookup
"#;
        let wf = WorkflowDefinition::from_yaml(yaml).unwrap();
        assert_eq!(wf.workflow_type, WorkflowType::Conditional);
        assert_eq!(wf.priority, Priority::High);
        assert_eq!(wf.timeout_ms, Some(60_000));
        assert_eq!(wf.skip_policy, SkipPolicy::Unlock);
        let guard = wf.steps[1].condition.as_ref().unwrap();
        assert_eq!(guard.referenced_steps(), vec!["lookup", "lookup"]);
    }

    #[test]
    fn test_sequential_forces_fail_fast() {
        let wf = WorkflowDefinition::new("s", WorkflowType::Sequential, vec![])
            .with_failure_mode(FailureMode::BestEffort);
        assert_eq!(wf.effective_failure_mode(), FailureMode::FailFast);

        let wf = WorkflowDefinition::new("p", WorkflowType::Parallel, vec![])
            .with_failure_mode(FailureMode::BestEffort);
        assert_eq!(wf.effective_failure_mode(), FailureMode::BestEffort);
    }

    #[test]
    fn test_payload_email_requires_fields() {
        let err = StepPayload::decode(EMAIL_DRAFT, &json!({ "subject": "Hi" })).unwrap_err();
        assert!(err.contains("recipient_email"), "{err}");

        let ok = StepPayload::decode(
            EMAIL_DRAFT,
            &json!({ "recipient_email": "a@b.c", "subject": "Hi", "body": "x", "priority": "high" }),
        )
        .unwrap();
        assert!(matches!(ok, StepPayload::EmailDraft(ref p) if p.priority == Some(Priority::High)));
    }

    #[test]
    fn test_payload_template_defaults() {
        let payload = StepPayload::decode(TEMPLATE_SUGGESTION, &Value::Null).unwrap();
        assert_eq!(
            payload.to_value(),
            json!({ "context": "general", "recipient_type": "colleague", "urgency": "normal" })
        );
    }

    #[test]
    fn test_payload_rejects_unknown_field_and_non_object() {
        assert!(StepPayload::decode(CONTACT_LOOKUP, &json!({ "phone": "123" })).is_err());
        assert!(StepPayload::decode("crm_lookup", &json!([1, 2])).is_err());
        assert!(matches!(
            StepPayload::decode("crm_lookup", &json!({ "anything": 1 })),
            Ok(StepPayload::Generic(_))
        ));
    }
}
