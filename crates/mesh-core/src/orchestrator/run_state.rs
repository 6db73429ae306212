//! Synchronous state machine for one workflow run.
//!
//! All transitions happen under the run lock held by the orchestrator, so
//! every status query sees whole step results. Each mutating method returns
//! the events to broadcast once the lock is released.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use crate::dispatch::{AttemptEvent, DispatchTask, StepOutcome};
use crate::error::{ErrorDetail, MeshError};
use crate::models::run::{RunEvent, RunStatus, SkipReason, StepResult, StepStatus, WorkflowRun};
use crate::models::workflow::{FailureMode, SkipPolicy};
use crate::workflow::condition::{evaluate, StepOutputs};
use crate::workflow::graph::{CompiledGraph, GraphNode};
use crate::workflow::interpolate::resolve_outputs;

enum Readiness {
    Wait,
    Run,
    Skip(SkipReason),
}

pub(crate) struct RunState {
    pub(crate) run: WorkflowRun,
    graph: Arc<CompiledGraph>,
    positions: HashMap<String, usize>,
    failure_mode: FailureMode,
    skip_policy: SkipPolicy,
    max_failure_ratio: f64,
}

impl RunState {
    pub(crate) fn new(run_id: String, graph: Arc<CompiledGraph>, max_failure_ratio: f64) -> Self {
        let def = graph.definition.clone();
        let steps: Vec<StepResult> = graph
            .nodes()
            .iter()
            .map(|node| {
                let mut result = StepResult::pending(node.node_id.clone(), node.capability.clone());
                if node.iteration.is_some() {
                    result.body_step_id = Some(node.step_id.clone());
                    result.iteration = node.iteration;
                }
                result
            })
            .collect();
        let positions = graph
            .nodes()
            .iter()
            .enumerate()
            .map(|(i, n)| (n.node_id.clone(), i))
            .collect();

        Self {
            run: WorkflowRun {
                run_id,
                workflow_id: def.id.clone(),
                workflow_name: def.name.clone(),
                workflow_type: def.workflow_type,
                priority: def.priority,
                status: RunStatus::Pending,
                steps,
                error: None,
                created_at: Utc::now(),
                started_at: None,
                finished_at: None,
            },
            failure_mode: def.effective_failure_mode(),
            skip_policy: def.skip_policy,
            max_failure_ratio,
            graph,
            positions,
        }
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.run.status.is_terminal()
    }

    pub(crate) fn start(&mut self) -> Vec<RunEvent> {
        if self.run.status != RunStatus::Pending {
            return Vec::new();
        }
        self.run.status = RunStatus::Running;
        self.run.started_at = Some(Utc::now());
        vec![self.run_event()]
    }

    /// Settle guard and dependency skips, then mark up to `capacity` runnable
    /// steps Ready and return their dispatch tasks.
    pub(crate) fn promote(&mut self, capacity: usize) -> (Vec<DispatchTask>, Vec<RunEvent>) {
        let mut tasks = Vec::new();
        let mut events = Vec::new();
        if self.run.status != RunStatus::Running {
            return (tasks, events);
        }

        let graph = self.graph.clone();
        for (i, node) in graph.nodes().iter().enumerate() {
            if self.run.steps[i].status != StepStatus::Pending {
                continue;
            }
            match self.readiness(node) {
                Readiness::Wait => {}
                Readiness::Skip(reason) => self.skip(i, reason, &mut events),
                Readiness::Run if tasks.len() < capacity => {
                    let parameters: Value = resolve_outputs(&node.parameters, &*self);
                    self.set_status(i, StepStatus::Ready, &mut events);
                    tasks.push(DispatchTask {
                        step_id: node.node_id.clone(),
                        capability: node.capability.clone(),
                        parameters,
                    });
                }
                Readiness::Run => {}
            }
        }
        (tasks, events)
    }

    fn readiness(&self, node: &GraphNode) -> Readiness {
        let mut waiting = false;
        for dep in &node.depends_on {
            let Some(&pos) = self.positions.get(dep) else {
                continue;
            };
            let result = &self.run.steps[pos];
            match result.status {
                StepStatus::Succeeded => {}
                StepStatus::Skipped => match result.skip_reason {
                    Some(SkipReason::LoopExited) => {}
                    Some(SkipReason::ConditionFalse) if self.skip_policy == SkipPolicy::Unlock => {}
                    Some(SkipReason::DependencyFailed) => {
                        return Readiness::Skip(SkipReason::DependencyFailed)
                    }
                    _ => return Readiness::Skip(SkipReason::DependencySkipped),
                },
                StepStatus::Failed | StepStatus::Cancelled => {
                    return Readiness::Skip(SkipReason::DependencyFailed)
                }
                _ => waiting = true,
            }
        }
        if waiting {
            return Readiness::Wait;
        }
        match &node.condition {
            Some(guard) if !evaluate(guard, self) => Readiness::Skip(SkipReason::ConditionFalse),
            _ => Readiness::Run,
        }
    }

    /// Attempt transitions from the dispatcher. Ignored once the step or the
    /// run is terminal.
    pub(crate) fn progress(&mut self, node_id: &str, event: AttemptEvent) -> Vec<RunEvent> {
        let mut events = Vec::new();
        let Some(&i) = self.positions.get(node_id) else {
            return events;
        };
        if self.is_terminal() || self.run.steps[i].status.is_terminal() {
            return events;
        }
        let (status, agent_id, attempt) = match event {
            AttemptEvent::Dispatched { agent_id, attempt } => (StepStatus::Dispatched, agent_id, attempt),
            AttemptEvent::Retrying { agent_id, attempt, .. } => (StepStatus::Retrying, agent_id, attempt),
        };
        let step = &mut self.run.steps[i];
        step.agent_id = Some(agent_id);
        step.attempt = attempt;
        if step.started_at.is_none() {
            step.started_at = Some(Utc::now());
        }
        self.set_status(i, status, &mut events);
        events
    }

    pub(crate) fn apply_outcome(&mut self, node_id: &str, outcome: StepOutcome) -> Vec<RunEvent> {
        let mut events = Vec::new();
        let Some(&i) = self.positions.get(node_id) else {
            return events;
        };
        if self.is_terminal() || self.run.steps[i].status.is_terminal() {
            return events;
        }

        self.run.steps[i].attempt = outcome.attempts().max(self.run.steps[i].attempt);
        match outcome {
            StepOutcome::Succeeded { agent_id, output, .. } => {
                self.run.steps[i].agent_id = Some(agent_id);
                self.run.steps[i].output = Some(output);
                self.set_status(i, StepStatus::Succeeded, &mut events);
                self.check_loop_exit(node_id, &mut events);
            }
            StepOutcome::Failed { error, agent_id, .. } => {
                if agent_id.is_some() {
                    self.run.steps[i].agent_id = agent_id;
                }
                self.run.steps[i].error = Some(ErrorDetail::from(&error));
                self.set_status(i, StepStatus::Failed, &mut events);
                tracing::warn!(
                    "[Orchestrator] Run {} step {} failed: {}",
                    self.run.run_id,
                    node_id,
                    error
                );

                let abort = match self.failure_mode {
                    FailureMode::FailFast => true,
                    FailureMode::BestEffort => self.failure_ratio() > self.max_failure_ratio,
                };
                if abort {
                    let err = MeshError::StepFailed {
                        step: node_id.to_string(),
                        reason: error.to_string(),
                    };
                    events.extend(self.abort(RunStatus::Failed, err));
                }
            }
            StepOutcome::Cancelled { .. } => {
                self.set_status(i, StepStatus::Cancelled, &mut events);
            }
        }
        events
    }

    fn check_loop_exit(&mut self, node_id: &str, events: &mut Vec<RunEvent>) {
        let graph = self.graph.clone();
        let Some(node) = graph.node(node_id) else {
            return;
        };
        let (Some(until), Some(iteration)) = (&node.until, node.iteration) else {
            return;
        };
        if !evaluate(until, self) {
            return;
        }
        tracing::info!(
            "[Orchestrator] Run {} loop {} exited after iteration {}",
            self.run.run_id,
            node.step_id,
            iteration
        );
        for later in graph.iterations_of(&node.step_id).iter().skip(iteration as usize) {
            if let Some(&j) = self.positions.get(later) {
                if self.run.steps[j].status == StepStatus::Pending {
                    self.skip(j, SkipReason::LoopExited, events);
                }
            }
        }
    }

    fn failure_ratio(&self) -> f64 {
        let total = self.run.steps.len().max(1) as f64;
        self.run.count(StepStatus::Failed) as f64 / total
    }

    /// End the run early. In-flight steps become Cancelled. Pending steps are
    /// Skipped when the run failed, Cancelled otherwise.
    pub(crate) fn abort(&mut self, status: RunStatus, error: MeshError) -> Vec<RunEvent> {
        let mut events = Vec::new();
        if self.is_terminal() {
            return events;
        }
        for i in 0..self.run.steps.len() {
            let current = self.run.steps[i].status;
            if current.is_terminal() {
                continue;
            }
            if current == StepStatus::Pending && status == RunStatus::Failed {
                self.skip(i, SkipReason::RunAborted, &mut events);
            } else {
                self.set_status(i, StepStatus::Cancelled, &mut events);
            }
        }
        self.run.status = status;
        self.run.error = Some(ErrorDetail::from(&error));
        self.run.finished_at = Some(Utc::now());
        events.push(self.run_event());
        events
    }

    pub(crate) fn all_steps_terminal(&self) -> bool {
        self.run.steps.iter().all(|s| s.status.is_terminal())
    }

    /// Settle the final status once every step is terminal.
    pub(crate) fn finish(&mut self) -> Vec<RunEvent> {
        if self.is_terminal() || !self.all_steps_terminal() {
            return Vec::new();
        }
        let failed: Vec<&StepResult> = self
            .run
            .steps
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Failed | StepStatus::Cancelled))
            .collect();
        if let Some(first) = failed.first() {
            let reason = first
                .error
                .as_ref()
                .map(|e| e.message.clone())
                .unwrap_or_else(|| first.status.as_str().to_string());
            self.run.error = Some(ErrorDetail::from(&MeshError::StepFailed {
                step: first.step_id.clone(),
                reason,
            }));
            self.run.status = RunStatus::Failed;
        } else {
            self.run.status = RunStatus::Completed;
        }
        self.run.finished_at = Some(Utc::now());
        vec![self.run_event()]
    }

    fn skip(&mut self, i: usize, reason: SkipReason, events: &mut Vec<RunEvent>) {
        self.run.steps[i].skip_reason = Some(reason);
        self.set_status(i, StepStatus::Skipped, events);
    }

    fn set_status(&mut self, i: usize, status: StepStatus, events: &mut Vec<RunEvent>) {
        let step = &mut self.run.steps[i];
        if step.status == status {
            return;
        }
        step.status = status;
        if status.is_terminal() {
            step.finished_at = Some(Utc::now());
        }
        events.push(RunEvent::Step {
            run_id: self.run.run_id.clone(),
            step_id: step.step_id.clone(),
            status,
            attempt: step.attempt,
        });
    }

    fn run_event(&self) -> RunEvent {
        RunEvent::Run {
            run_id: self.run.run_id.clone(),
            status: self.run.status,
        }
    }

    fn iteration_results(&self, step_id: &str) -> impl DoubleEndedIterator<Item = &StepResult> {
        self.graph
            .iterations_of(step_id)
            .iter()
            .filter_map(|id| self.positions.get(id).map(|&i| &self.run.steps[i]))
    }
}

/// Declared step ids resolve to the latest succeeded iteration; otherwise to
/// the latest iteration that has started.
impl StepOutputs for RunState {
    fn status_of(&self, step_id: &str) -> Option<StepStatus> {
        if self.iteration_results(step_id).any(|s| s.status == StepStatus::Succeeded) {
            return Some(StepStatus::Succeeded);
        }
        self.iteration_results(step_id)
            .rev()
            .find(|s| {
                s.status != StepStatus::Pending && s.skip_reason != Some(SkipReason::LoopExited)
            })
            .or_else(|| self.iteration_results(step_id).next())
            .map(|s| s.status)
    }

    fn output_of(&self, step_id: &str) -> Option<&Value> {
        self.iteration_results(step_id)
            .rev()
            .find(|s| s.status == StepStatus::Succeeded)
            .and_then(|s| s.output.as_ref())
    }
}
