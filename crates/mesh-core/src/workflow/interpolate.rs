//! `${steps.<id>.output[.<path>]}` references inside step parameters.
//!
//! A string that consists of exactly one reference is replaced by the
//! referenced JSON value, keeping its type. References embedded in longer
//! strings are substituted with the value's text form. Unresolvable
//! references are left untouched.

use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::Value;

use crate::workflow::condition::StepOutputs;

fn step_ref_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\$\{steps\.([A-Za-z0-9_\-]+)\.output((?:\.[A-Za-z0-9_\-]+)*)\}").unwrap()
    })
}

fn input_ref_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{input\.([A-Za-z0-9_\-]+)\}").unwrap())
}

/// A parsed output reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRef {
    pub step_id: String,
    /// Dot path into the output, empty for the whole output.
    pub path: String,
}

/// Every output reference found in the string leaves of `value`.
pub fn output_refs(value: &Value) -> Vec<OutputRef> {
    let mut refs = Vec::new();
    visit_strings(value, &mut |s| {
        for caps in step_ref_re().captures_iter(s) {
            refs.push(OutputRef {
                step_id: caps[1].to_string(),
                path: caps[2].trim_start_matches('.').to_string(),
            });
        }
    });
    refs
}

fn visit_strings(value: &Value, f: &mut impl FnMut(&str)) {
    match value {
        Value::String(s) => f(s),
        Value::Array(items) => items.iter().for_each(|v| visit_strings(v, f)),
        Value::Object(map) => map.values().for_each(|v| visit_strings(v, f)),
        _ => {}
    }
}

/// Select a dot path (`a.b.0`) inside a JSON value.
pub fn select_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|seg| !seg.is_empty())
        .try_fold(value, |current, seg| match current {
            Value::Object(map) => map.get(seg),
            Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

/// Text form used for substitution and substring checks.
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Resolve output references against finished steps.
pub fn resolve_outputs(value: &Value, outputs: &dyn StepOutputs) -> Value {
    map_strings(value, &|s| {
        let re = step_ref_re();
        let lookup = |caps: &Captures| {
            outputs
                .output_of(&caps[1])
                .and_then(|out| select_path(out, caps[2].trim_start_matches('.')))
                .cloned()
        };
        if let Some(caps) = whole_match(re, s) {
            if let Some(v) = lookup(&caps) {
                return v;
            }
        }
        Value::String(
            re.replace_all(s, |caps: &Captures| {
                lookup(caps)
                    .map(|v| value_text(&v))
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned(),
        )
    })
}

/// Substitute `${input.<key>}` placeholders from caller input.
pub fn resolve_inputs(value: &Value, input: &serde_json::Map<String, Value>) -> Value {
    map_strings(value, &|s| {
        let re = input_ref_re();
        if let Some(caps) = whole_match(re, s) {
            if let Some(v) = input.get(&caps[1]) {
                return v.clone();
            }
        }
        Value::String(
            re.replace_all(s, |caps: &Captures| {
                input
                    .get(&caps[1])
                    .map(value_text)
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned(),
        )
    })
}

fn whole_match<'t>(re: &Regex, s: &'t str) -> Option<Captures<'t>> {
    re.captures(s)
        .filter(|caps| caps.get(0).map(|m| m.as_str().len() == s.len()).unwrap_or(false))
}

fn map_strings(value: &Value, f: &dyn Fn(&str) -> Value) -> Value {
    match value {
        Value::String(s) => f(s),
        Value::Array(items) => Value::Array(items.iter().map(|v| map_strings(v, f)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), map_strings(v, f)))
                .collect(),
        ),
        other => other.clone(),
    }
}
