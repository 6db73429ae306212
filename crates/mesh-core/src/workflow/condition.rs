use serde_json::Value;

use crate::models::run::StepStatus;
use crate::models::workflow::StepCondition;
use crate::workflow::interpolate::{select_path, value_text};

/// Read access to step results, keyed by declared step id.
pub trait StepOutputs {
    fn status_of(&self, step_id: &str) -> Option<StepStatus>;
    fn output_of(&self, step_id: &str) -> Option<&Value>;
}

/// Evaluate a guard against the results available right now. Steps that
/// have not produced output make output predicates false.
pub fn evaluate(condition: &StepCondition, outputs: &dyn StepOutputs) -> bool {
    match condition {
        StepCondition::Succeeded { step } => outputs.status_of(step) == Some(StepStatus::Succeeded),
        StepCondition::OutputContains { step, path, value } => {
            selected(outputs, step, path.as_deref())
                .map(|v| value_text(v).contains(value.as_str()))
                .unwrap_or(false)
        }
        StepCondition::OutputEquals { step, path, value } => {
            selected(outputs, step, path.as_deref())
                .map(|v| v == value)
                .unwrap_or(false)
        }
        StepCondition::Not { condition } => !evaluate(condition, outputs),
        StepCondition::All { conditions } => conditions.iter().all(|c| evaluate(c, outputs)),
        StepCondition::Any { conditions } => conditions.iter().any(|c| evaluate(c, outputs)),
    }
}

fn selected<'a>(outputs: &'a dyn StepOutputs, step: &str, path: Option<&str>) -> Option<&'a Value> {
    if outputs.status_of(step) != Some(StepStatus::Succeeded) {
        return None;
    }
    let output = outputs.output_of(step)?;
    select_path(output, path.unwrap_or(""))
}
