//! Workflow compilation: graph building, guards, output references and
//! built-in templates.

pub mod condition;
pub mod graph;
pub mod interpolate;
pub mod templates;

pub use condition::{evaluate, StepOutputs};
pub use graph::{CompiledGraph, GraphBuilder, GraphNode};
pub use templates::{builtin_templates, find_template, TemplateSummary, WorkflowTemplate};
