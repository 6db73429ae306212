//! Workflow graph builder.
//!
//! `GraphBuilder::compile` validates a definition and produces an executable
//! DAG. Rules are checked in order and the first failure wins:
//!
//! 1. the workflow has steps (`EmptyWorkflow`)
//! 2. step ids are unique (`DuplicateStep`)
//! 3. every dependency and predicate reference exists (`UnknownDependency`)
//! 4. the dependency graph is acyclic (`CyclicDependency`)
//! 5. loop steps have `maxIterations >= 1` (`InvalidLoopBound`)
//! 6. parameters match the capability's payload schema and only reference
//!    upstream outputs (`InvalidParameters`)
//!
//! Loop steps are unrolled into one node per iteration, named `<step>#<n>`.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;

use crate::error::MeshError;
use crate::models::workflow::{StepCondition, StepPayload, StepSpec, WorkflowDefinition, WorkflowType};
use crate::workflow::interpolate::output_refs;

/// One executable node of a compiled graph.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphNode {
    pub node_id: String,
    /// Declared step id this node came from.
    pub step_id: String,
    /// 1-based iteration for loop nodes.
    pub iteration: Option<u32>,
    pub capability: String,
    /// Validated parameters with schema defaults filled in.
    pub parameters: Value,
    /// Node ids that must finish first.
    pub depends_on: Vec<String>,
    pub condition: Option<StepCondition>,
    pub until: Option<StepCondition>,
}

/// Validated, topologically ordered DAG over the workflow's steps.
#[derive(Debug, Clone)]
pub struct CompiledGraph {
    pub definition: Arc<WorkflowDefinition>,
    nodes: Vec<GraphNode>,
    positions: HashMap<String, usize>,
    dependents: HashMap<String, Vec<String>>,
    iterations: HashMap<String, Vec<String>>,
}

impl CompiledGraph {
    /// Nodes in topological order.
    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn node(&self, node_id: &str) -> Option<&GraphNode> {
        self.positions.get(node_id).map(|&i| &self.nodes[i])
    }

    pub fn dependents(&self, node_id: &str) -> &[String] {
        self.dependents
            .get(node_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Node ids produced by a declared step, in iteration order.
    pub fn iterations_of(&self, step_id: &str) -> &[String] {
        self.iterations
            .get(step_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn topological_order(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.node_id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

pub struct GraphBuilder;

impl GraphBuilder {
    pub fn compile(definition: &WorkflowDefinition) -> Result<CompiledGraph, MeshError> {
        let steps = &definition.steps;
        let wf_type = definition.workflow_type;

        // 1. non-empty
        if steps.is_empty() {
            return Err(MeshError::EmptyWorkflow(definition.id.clone()));
        }

        // 2. unique ids
        let mut declared: HashMap<&str, usize> = HashMap::new();
        for (i, step) in steps.iter().enumerate() {
            if declared.insert(step.step_id.as_str(), i).is_some() {
                return Err(MeshError::DuplicateStep(step.step_id.clone()));
            }
        }

        // 3. references exist
        for step in steps {
            let predicate_refs = active_condition(step, wf_type)
                .into_iter()
                .chain(active_until(step, wf_type))
                .flat_map(|c| c.referenced_steps());
            for dep in step.depends_on.iter().map(String::as_str).chain(predicate_refs) {
                if !declared.contains_key(dep) {
                    return Err(MeshError::UnknownDependency {
                        step: step.step_id.clone(),
                        dependency: dep.to_string(),
                    });
                }
            }
        }

        // Effective edges: declared dependencies plus the implicit chain of a
        // sequential workflow.
        let edges: Vec<BTreeSet<usize>> = steps
            .iter()
            .enumerate()
            .map(|(i, step)| {
                let mut deps: BTreeSet<usize> =
                    step.depends_on.iter().map(|d| declared[d.as_str()]).collect();
                if wf_type == WorkflowType::Sequential && i > 0 {
                    deps.insert(i - 1);
                }
                deps
            })
            .collect();

        // 4. acyclic
        if let Some(cycle) = find_cycle(&edges) {
            return Err(MeshError::CyclicDependency(
                cycle.into_iter().map(|i| steps[i].step_id.clone()).collect(),
            ));
        }

        // 5. loop bounds
        if wf_type == WorkflowType::Loop {
            for step in steps {
                let n = step.max_iterations.unwrap_or(1);
                if n < 1 {
                    return Err(MeshError::InvalidLoopBound {
                        step: step.step_id.clone(),
                        max_iterations: n,
                    });
                }
            }
        }

        let order = topological_sort(&edges);
        let ancestors = ancestor_sets(&edges, &order);

        // 6. typed parameters and output references
        let mut parameters = Vec::with_capacity(steps.len());
        for (i, step) in steps.iter().enumerate() {
            let payload = StepPayload::decode(&step.capability, &step.parameters).map_err(|reason| {
                MeshError::InvalidParameters {
                    step: step.step_id.clone(),
                    reason,
                }
            })?;
            for r in output_refs(&step.parameters) {
                let upstream = declared
                    .get(r.step_id.as_str())
                    .map(|&j| ancestors[i].contains(&j))
                    .unwrap_or(false);
                let previous_iteration = wf_type == WorkflowType::Loop && r.step_id == step.step_id;
                if !upstream && !previous_iteration {
                    return Err(MeshError::InvalidParameters {
                        step: step.step_id.clone(),
                        reason: format!(
                            "references output of '{}' which is not an upstream dependency",
                            r.step_id
                        ),
                    });
                }
            }
            // Guards and loop exits only read steps that settle first.
            let predicate_refs = active_condition(step, wf_type)
                .into_iter()
                .chain(active_until(step, wf_type))
                .flat_map(|c| c.referenced_steps());
            for referenced in predicate_refs {
                let upstream = ancestors[i].contains(&declared[referenced]);
                let own_iteration = wf_type == WorkflowType::Loop && referenced == step.step_id;
                if !upstream && !own_iteration {
                    return Err(MeshError::InvalidParameters {
                        step: step.step_id.clone(),
                        reason: format!(
                            "predicate reads '{}' which is not an upstream dependency",
                            referenced
                        ),
                    });
                }
            }
            parameters.push(payload.to_value());
        }

        let graph = unroll(definition, &edges, &order, parameters);
        tracing::debug!(
            "[GraphBuilder] Compiled workflow {} ({}): {} step(s) -> {} node(s)",
            definition.id,
            wf_type.as_str(),
            steps.len(),
            graph.len()
        );
        Ok(graph)
    }
}

fn active_condition(step: &StepSpec, wf_type: WorkflowType) -> Option<&StepCondition> {
    match wf_type {
        WorkflowType::Conditional => step.condition.as_ref(),
        _ => None,
    }
}

fn active_until(step: &StepSpec, wf_type: WorkflowType) -> Option<&StepCondition> {
    match wf_type {
        WorkflowType::Loop => step.until.as_ref(),
        _ => None,
    }
}

/// DFS colouring; returns the cycle path (first node repeated at the end).
fn find_cycle(edges: &[BTreeSet<usize>]) -> Option<Vec<usize>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Colour {
        White,
        Grey,
        Black,
    }

    fn visit(
        node: usize,
        edges: &[BTreeSet<usize>],
        colour: &mut [Colour],
        stack: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        colour[node] = Colour::Grey;
        stack.push(node);
        for &dep in &edges[node] {
            match colour[dep] {
                Colour::Grey => {
                    let start = stack.iter().position(|&n| n == dep).unwrap_or(0);
                    let mut cycle: Vec<usize> = stack[start..].to_vec();
                    cycle.push(dep);
                    return Some(cycle);
                }
                Colour::White => {
                    if let Some(cycle) = visit(dep, edges, colour, stack) {
                        return Some(cycle);
                    }
                }
                Colour::Black => {}
            }
        }
        stack.pop();
        colour[node] = Colour::Black;
        None
    }

    let mut colour = vec![Colour::White; edges.len()];
    let mut stack = Vec::new();
    (0..edges.len()).find_map(|start| {
        if colour[start] == Colour::White {
            visit(start, edges, &mut colour, &mut stack)
        } else {
            None
        }
    })
}

/// Kahn's algorithm, breaking ties by declaration order. Assumes no cycles.
fn topological_sort(edges: &[BTreeSet<usize>]) -> Vec<usize> {
    let mut remaining: Vec<usize> = edges.iter().map(|deps| deps.len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); edges.len()];
    for (node, deps) in edges.iter().enumerate() {
        for &dep in deps {
            dependents[dep].push(node);
        }
    }

    let mut ready: BTreeSet<usize> = (0..edges.len()).filter(|&i| remaining[i] == 0).collect();
    let mut order = Vec::with_capacity(edges.len());
    while let Some(node) = ready.pop_first() {
        order.push(node);
        for &next in &dependents[node] {
            remaining[next] -= 1;
            if remaining[next] == 0 {
                ready.insert(next);
            }
        }
    }
    order
}

fn ancestor_sets(edges: &[BTreeSet<usize>], order: &[usize]) -> Vec<HashSet<usize>> {
    let mut ancestors: Vec<HashSet<usize>> = vec![HashSet::new(); edges.len()];
    for &node in order {
        let mut set = HashSet::new();
        for &dep in &edges[node] {
            set.insert(dep);
            set.extend(ancestors[dep].iter().copied());
        }
        ancestors[node] = set;
    }
    ancestors
}

fn unroll(
    definition: &WorkflowDefinition,
    edges: &[BTreeSet<usize>],
    order: &[usize],
    parameters: Vec<Value>,
) -> CompiledGraph {
    let wf_type = definition.workflow_type;
    let steps = &definition.steps;
    let mut iterations: HashMap<String, Vec<String>> = HashMap::new();
    let mut nodes = Vec::new();

    for &i in order {
        let step = &steps[i];
        let upstream: Vec<String> = edges[i]
            .iter()
            .flat_map(|&d| iterations[&steps[d].step_id].clone())
            .collect();

        if wf_type != WorkflowType::Loop {
            iterations.insert(step.step_id.clone(), vec![step.step_id.clone()]);
            nodes.push(GraphNode {
                node_id: step.step_id.clone(),
                step_id: step.step_id.clone(),
                iteration: None,
                capability: step.capability.clone(),
                parameters: parameters[i].clone(),
                depends_on: upstream,
                condition: active_condition(step, wf_type).cloned(),
                until: None,
            });
            continue;
        }

        // Iterations chain when the body reads its previous output or has an
        // exit predicate to check between iterations.
        let reads_self = output_refs(&step.parameters)
            .iter()
            .any(|r| r.step_id == step.step_id);
        let chained = reads_self || step.until.is_some();

        let n = step.max_iterations.unwrap_or(1);
        let mut ids = Vec::with_capacity(n as usize);
        for iter in 1..=n {
            let node_id = format!("{}#{}", step.step_id, iter);
            let mut depends_on = upstream.clone();
            if chained {
                if let Some(prev) = ids.last() {
                    depends_on.push(String::clone(prev));
                }
            }
            nodes.push(GraphNode {
                node_id: node_id.clone(),
                step_id: step.step_id.clone(),
                iteration: Some(iter),
                capability: step.capability.clone(),
                parameters: parameters[i].clone(),
                depends_on,
                condition: None,
                until: step.until.clone(),
            });
            ids.push(node_id);
        }
        iterations.insert(step.step_id.clone(), ids);
    }

    let positions = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.node_id.clone(), i))
        .collect();
    let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
    for node in &nodes {
        for dep in &node.depends_on {
            dependents
                .entry(dep.clone())
                .or_default()
                .push(node.node_id.clone());
        }
    }

    CompiledGraph {
        definition: Arc::new(definition.clone()),
        nodes,
        positions,
        dependents,
        iterations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(id: &str) -> StepSpec {
        StepSpec::new(id, "profile_synthesis")
    }

    fn wf(t: WorkflowType, steps: Vec<StepSpec>) -> WorkflowDefinition {
        WorkflowDefinition::new("wf", t, steps)
    }

    #[test]
    fn test_empty_workflow() {
        let err = GraphBuilder::compile(&wf(WorkflowType::Parallel, vec![])).unwrap_err();
        assert_eq!(err, MeshError::EmptyWorkflow("wf".into()));
    }

    #[test]
    fn test_duplicate_step_wins_over_later_rules() {
        let err = GraphBuilder::compile(&wf(
            WorkflowType::Parallel,
            vec![step("a").depends_on(["ghost"]), step("a")],
        ))
        .unwrap_err();
        assert_eq!(err, MeshError::DuplicateStep("a".into()));
    }

    #[test]
    fn test_predicate_must_read_upstream_steps() {
        let guard = StepCondition::Succeeded { step: "lookup".into() };
        let err = GraphBuilder::compile(&wf(
            WorkflowType::Conditional,
            vec![step("lookup"), step("draft").with_condition(guard.clone())],
        ))
        .unwrap_err();
        assert!(matches!(err, MeshError::InvalidParameters { ref step, .. } if step == "draft"));

        let graph = GraphBuilder::compile(&wf(
            WorkflowType::Conditional,
            vec![step("lookup"), step("draft").depends_on(["lookup"]).with_condition(guard)],
        ))
        .unwrap();
        assert!(graph.node("draft").unwrap().condition.is_some());

        // A loop exit may read its own iteration but not a sibling.
        let err = GraphBuilder::compile(&wf(
            WorkflowType::Loop,
            vec![
                step("poll").with_max_iterations(2),
                step("refine")
                    .with_max_iterations(2)
                    .with_until(StepCondition::Succeeded { step: "poll".into() }),
            ],
        ))
        .unwrap_err();
        assert!(matches!(err, MeshError::InvalidParameters { ref step, .. } if step == "refine"));

        GraphBuilder::compile(&wf(
            WorkflowType::Loop,
            vec![step("poll")
                .with_max_iterations(2)
                .with_until(StepCondition::Succeeded { step: "poll".into() })],
        ))
        .unwrap();
    }

    #[test]
    fn test_unknown_dependency_and_condition_reference() {
        let err = GraphBuilder::compile(&wf(
            WorkflowType::Parallel,
            vec![step("a"), step("b").depends_on(["c"])],
        ))
        .unwrap_err();
        assert_eq!(
            err,
            MeshError::UnknownDependency { step: "b".into(), dependency: "c".into() }
        );

        let err = GraphBuilder::compile(&wf(
            WorkflowType::Conditional,
            vec![step("a").with_condition(StepCondition::Succeeded { step: "zzz".into() })],
        ))
        .unwrap_err();
        assert!(matches!(err, MeshError::UnknownDependency { ref dependency, .. } if dependency == "zzz"));
    }

    #[test]
    fn test_cycle_detected_with_path() {
        let err = GraphBuilder::compile(&wf(
            WorkflowType::Parallel,
            vec![
                step("a").depends_on(["c"]),
                step("b").depends_on(["a"]),
                step("c").depends_on(["b"]),
            ],
        ))
        .unwrap_err();
        match err {
            MeshError::CyclicDependency(path) => {
                assert_eq!(path.len(), 4);
                assert_eq!(path.first(), path.last());
            }
            other => panic!("unexpected {other:?}"),
        }

        let err = GraphBuilder::compile(&wf(WorkflowType::Parallel, vec![step("a").depends_on(["a"])]))
            .unwrap_err();
        assert_eq!(err, MeshError::CyclicDependency(vec!["a".into(), "a".into()]));
    }

    #[test]
    fn test_sequential_back_reference_is_a_cycle() {
        let err = GraphBuilder::compile(&wf(
            WorkflowType::Sequential,
            vec![step("a").depends_on(["b"]), step("b")],
        ))
        .unwrap_err();
        assert!(matches!(err, MeshError::CyclicDependency(_)));
    }

    #[test]
    fn test_invalid_loop_bound() {
        let err = GraphBuilder::compile(&wf(
            WorkflowType::Loop,
            vec![step("poll").with_max_iterations(0)],
        ))
        .unwrap_err();
        assert_eq!(
            err,
            MeshError::InvalidLoopBound { step: "poll".into(), max_iterations: 0 }
        );
    }

    #[test]
    fn test_sequential_implicit_chain() {
        let g = GraphBuilder::compile(&wf(
            WorkflowType::Sequential,
            vec![step("a"), step("b"), step("c")],
        ))
        .unwrap();
        assert_eq!(g.topological_order(), vec!["a", "b", "c"]);
        assert_eq!(g.node("c").unwrap().depends_on, vec!["b"]);
        assert_eq!(g.dependents("a"), ["b".to_string()]);
    }

    #[test]
    fn test_parallel_steps_are_independent_and_topologically_sorted() {
        let g = GraphBuilder::compile(&wf(
            WorkflowType::Parallel,
            vec![step("join").depends_on(["x", "y"]), step("x"), step("y")],
        ))
        .unwrap();
        assert_eq!(g.topological_order(), vec!["x", "y", "join"]);
        assert!(g.node("x").unwrap().depends_on.is_empty());
        assert_eq!(g.node("join").unwrap().depends_on, vec!["x", "y"]);
    }

    #[test]
    fn test_loop_unrolls_independent_iterations() {
        let g = GraphBuilder::compile(&wf(
            WorkflowType::Loop,
            vec![step("probe").with_max_iterations(3), step("report").depends_on(["probe"])],
        ))
        .unwrap();
        assert_eq!(g.iterations_of("probe"), ["probe#1", "probe#2", "probe#3"]);
        assert!(g.node("probe#2").unwrap().depends_on.is_empty());
        assert_eq!(
            g.node("report#1").unwrap().depends_on,
            vec!["probe#1", "probe#2", "probe#3"]
        );
    }

    #[test]
    fn test_loop_chains_when_reading_previous_output() {
        let g = GraphBuilder::compile(&wf(
            WorkflowType::Loop,
            vec![step("refine")
                .with_max_iterations(3)
                .with_parameters(json!({ "draft": "${steps.refine.output.text}" }))],
        ))
        .unwrap();
        assert!(g.node("refine#1").unwrap().depends_on.is_empty());
        assert_eq!(g.node("refine#3").unwrap().depends_on, vec!["refine#2"]);
    }

    #[test]
    fn test_invalid_parameters() {
        let err = GraphBuilder::compile(&wf(
            WorkflowType::Parallel,
            vec![StepSpec::new("draft", "email_draft").with_parameters(json!({ "subject": "Hi" }))],
        ))
        .unwrap_err();
        assert!(matches!(err, MeshError::InvalidParameters { ref step, .. } if step == "draft"));
    }

    #[test]
    fn test_reference_must_be_upstream() {
        let steps = vec![
            StepSpec::new("lookup", "contact_lookup"),
            step("synth").with_parameters(json!({ "who": "${steps.lookup.output.name}" })),
        ];
        let err = GraphBuilder::compile(&wf(WorkflowType::Parallel, steps.clone())).unwrap_err();
        assert!(matches!(err, MeshError::InvalidParameters { .. }));

        // Sequential order makes every earlier step upstream.
        assert!(GraphBuilder::compile(&wf(WorkflowType::Sequential, steps)).is_ok());
    }

    #[test]
    fn test_defaults_filled_in_parameters() {
        let g = GraphBuilder::compile(&wf(
            WorkflowType::Parallel,
            vec![StepSpec::new("tpl", "template_suggestion")],
        ))
        .unwrap();
        assert_eq!(g.node("tpl").unwrap().parameters["recipient_type"], json!("colleague"));
    }
}
