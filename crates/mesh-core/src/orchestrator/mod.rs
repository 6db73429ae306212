//! WorkflowOrchestrator - executes compiled workflows against the registry.
//!
//! Each accepted definition becomes a run executed on its own tokio task:
//!   1. Compile the definition (errors are returned synchronously, no run)
//!   2. Promote ready steps, up to the fan-out limit
//!   3. Dispatch them concurrently through the TaskDispatcher
//!   4. Apply outcomes under the run lock, unlocking dependents
//!   5. Stop on completion, failure policy, cancellation or timeout

mod run_state;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{MeshConfig, OrchestratorConfig};
use crate::dispatch::{AgentInvoker, AttemptEvent, StepOutcome, TaskDispatcher};
use crate::error::MeshError;
use crate::models::run::{RunEvent, RunStatus, WorkflowRun};
use crate::models::workflow::WorkflowDefinition;
use crate::registry::AgentRegistry;
use crate::workflow::graph::{CompiledGraph, GraphBuilder};
use crate::workflow::templates::{builtin_templates, find_template, TemplateSummary};

use run_state::RunState;

/// How long a finished run waits for cancelled dispatches to wind down.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

struct RunHandle {
    seq: u64,
    state: RwLock<RunState>,
    cancel: CancellationToken,
    done: watch::Sender<bool>,
}

impl RunHandle {
    fn snapshot(&self) -> Result<WorkflowRun, MeshError> {
        self.state
            .read()
            .map(|s| s.run.clone())
            .map_err(|_| MeshError::Internal("run state lock poisoned".into()))
    }

    /// Apply a mutation under the run lock, then publish its events.
    fn update<F>(&self, events: &broadcast::Sender<RunEvent>, f: F)
    where
        F: FnOnce(&mut RunState) -> Vec<RunEvent>,
    {
        let (out, terminal) = match self.state.write() {
            Ok(mut state) => {
                let out = f(&mut state);
                (out, state.is_terminal())
            }
            Err(_) => return,
        };
        for event in out {
            let _ = events.send(event);
        }
        if terminal {
            self.done.send_replace(true);
        }
    }
}

struct OrchestratorInner {
    dispatcher: TaskDispatcher,
    config: OrchestratorConfig,
    runs: RwLock<HashMap<String, Arc<RunHandle>>>,
    events: broadcast::Sender<RunEvent>,
    seq: AtomicU64,
}

#[derive(Clone)]
pub struct WorkflowOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl WorkflowOrchestrator {
    pub fn new(dispatcher: TaskDispatcher, config: OrchestratorConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(OrchestratorInner {
                dispatcher,
                config,
                runs: RwLock::new(HashMap::new()),
                events,
                seq: AtomicU64::new(0),
            }),
        }
    }

    /// Fresh registry and dispatcher wired from one configuration.
    pub fn from_config(config: MeshConfig, invoker: Arc<dyn AgentInvoker>) -> Self {
        let registry = AgentRegistry::new(config.registry);
        let dispatcher = TaskDispatcher::new(registry, invoker, config.dispatch);
        Self::new(dispatcher, config.orchestrator)
    }

    pub fn registry(&self) -> &AgentRegistry {
        self.inner.dispatcher.registry()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.inner.events.subscribe()
    }

    /// Compile and start a workflow. Returns the run id.
    pub async fn submit(&self, definition: WorkflowDefinition) -> Result<String, MeshError> {
        let graph = Arc::new(GraphBuilder::compile(&definition)?);
        let run_id = uuid::Uuid::new_v4().to_string();

        let (done, _) = watch::channel(false);
        let handle = Arc::new(RunHandle {
            seq: self.inner.seq.fetch_add(1, Ordering::SeqCst),
            state: RwLock::new(RunState::new(
                run_id.clone(),
                graph.clone(),
                self.inner.config.max_failure_ratio,
            )),
            cancel: CancellationToken::new(),
            done,
        });
        self.inner
            .runs
            .write()
            .map_err(|_| MeshError::Internal("run table lock poisoned".into()))?
            .insert(run_id.clone(), handle.clone());

        tracing::info!(
            "[Orchestrator] Submitted run {} for workflow {} ({}, {} node(s), priority {})",
            run_id,
            definition.display_name(),
            definition.workflow_type.as_str(),
            graph.len(),
            definition.priority.as_str()
        );

        let this = self.clone();
        tokio::spawn(async move {
            this.execute(handle, graph).await;
        });
        Ok(run_id)
    }

    /// Instantiate a built-in template with caller input and submit it.
    pub async fn submit_template(&self, name: &str, input: Map<String, Value>) -> Result<String, MeshError> {
        let template = find_template(name)?;
        self.submit(template.instantiate(&input)).await
    }

    pub fn templates(&self) -> Vec<TemplateSummary> {
        builtin_templates().iter().map(|t| t.summary()).collect()
    }

    pub fn status(&self, run_id: &str) -> Result<WorkflowRun, MeshError> {
        self.handle(run_id)?.snapshot()
    }

    /// Cancel a run. Idempotent; returns the resulting status.
    pub fn cancel(&self, run_id: &str) -> Result<RunStatus, MeshError> {
        let handle = self.handle(run_id)?;
        handle.update(&self.inner.events, |state| {
            state.abort(
                RunStatus::Cancelled,
                MeshError::Cancelled(format!("run {} cancelled", run_id)),
            )
        });
        handle.cancel.cancel();
        let status = handle.snapshot()?.status;
        tracing::info!("[Orchestrator] Cancel requested for run {} -> {}", run_id, status.as_str());
        Ok(status)
    }

    /// Wait until the run is terminal and return its final snapshot.
    pub async fn wait(&self, run_id: &str) -> Result<WorkflowRun, MeshError> {
        let handle = self.handle(run_id)?;
        let mut done = handle.done.subscribe();
        loop {
            if *done.borrow_and_update() {
                break;
            }
            if done.changed().await.is_err() {
                break;
            }
        }
        handle.snapshot()
    }

    /// Snapshots of every known run, highest priority first, then oldest first.
    pub fn list_runs(&self) -> Vec<WorkflowRun> {
        let Ok(runs) = self.inner.runs.read() else {
            return Vec::new();
        };
        let mut entries: Vec<(u64, WorkflowRun)> = runs
            .values()
            .filter_map(|h| h.snapshot().ok().map(|run| (h.seq, run)))
            .collect();
        drop(runs);
        entries.sort_by(|(sa, a), (sb, b)| b.priority.cmp(&a.priority).then(sa.cmp(sb)));
        entries.into_iter().map(|(_, run)| run).collect()
    }

    /// Discard a terminal run.
    pub fn forget(&self, run_id: &str) -> Result<WorkflowRun, MeshError> {
        let mut runs = self
            .inner
            .runs
            .write()
            .map_err(|_| MeshError::Internal("run table lock poisoned".into()))?;
        let handle = runs
            .get(run_id)
            .ok_or_else(|| MeshError::NotFound(format!("run {}", run_id)))?;
        let run = handle.snapshot()?;
        if !run.status.is_terminal() {
            return Err(MeshError::Conflict(format!("run {} is still {}", run_id, run.status.as_str())));
        }
        runs.remove(run_id);
        Ok(run)
    }

    fn handle(&self, run_id: &str) -> Result<Arc<RunHandle>, MeshError> {
        self.inner
            .runs
            .read()
            .map_err(|_| MeshError::Internal("run table lock poisoned".into()))?
            .get(run_id)
            .cloned()
            .ok_or_else(|| MeshError::NotFound(format!("run {}", run_id)))
    }

    // ─── Execution loop ────────────────────────────────────────────────────

    async fn execute(&self, handle: Arc<RunHandle>, graph: Arc<CompiledGraph>) {
        let events = &self.inner.events;
        let run_id = match handle.snapshot() {
            Ok(run) => run.run_id,
            Err(_) => return,
        };
        let timeout_ms = graph
            .definition
            .timeout_ms
            .unwrap_or(self.inner.config.default_timeout_ms);
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        let max_parallel = self.inner.config.max_parallel_steps.max(1);

        handle.update(events, |state| state.start());

        let mut in_flight: JoinSet<(String, StepOutcome)> = JoinSet::new();
        loop {
            let mut tasks = Vec::new();
            handle.update(events, |state| {
                let (ready, out) = state.promote(max_parallel.saturating_sub(in_flight.len()));
                tasks = ready;
                out
            });

            for task in tasks {
                let dispatcher = self.inner.dispatcher.clone();
                let cancel = handle.cancel.child_token();
                let step_handle = handle.clone();
                let step_events = events.clone();
                in_flight.spawn(async move {
                    let node_id = task.step_id.clone();
                    let progress = move |event: AttemptEvent| {
                        step_handle.update(&step_events, |state| state.progress(&node_id, event));
                    };
                    let outcome = dispatcher.dispatch_step(&task, &cancel, &progress).await;
                    (task.step_id, outcome)
                });
            }

            if in_flight.is_empty() {
                let mut stuck = false;
                handle.update(events, |state| {
                    let out = state.finish();
                    stuck = !state.is_terminal();
                    out
                });
                if stuck {
                    tracing::error!("[Orchestrator] Run {} has no runnable steps left", run_id);
                    handle.update(events, |state| {
                        state.abort(
                            RunStatus::Failed,
                            MeshError::Internal("no runnable steps left".into()),
                        )
                    });
                }
                break;
            }

            tokio::select! {
                _ = handle.cancel.cancelled() => break,
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::warn!("[Orchestrator] Run {} timed out after {}ms", run_id, timeout_ms);
                    handle.update(events, |state| {
                        state.abort(
                            RunStatus::TimedOut,
                            MeshError::WorkflowTimedOut { run_id: run_id.clone(), timeout_ms },
                        )
                    });
                    break;
                }
                joined = in_flight.join_next() => match joined {
                    Some(Ok((node_id, outcome))) => {
                        handle.update(events, |state| state.apply_outcome(&node_id, outcome));
                    }
                    Some(Err(e)) => {
                        tracing::error!("[Orchestrator] Run {} dispatch task failed: {}", run_id, e);
                        handle.update(events, |state| {
                            state.abort(RunStatus::Failed, MeshError::Internal(e.to_string()))
                        });
                    }
                    None => {}
                },
            }

            let terminal = handle.state.read().map(|s| s.is_terminal()).unwrap_or(true);
            if terminal {
                break;
            }
        }

        // Stop outstanding attempts; their late outcomes are ignored.
        handle.cancel.cancel();
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while in_flight.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            in_flight.shutdown().await;
        }

        if let Ok(run) = handle.snapshot() {
            tracing::info!(
                "[Orchestrator] Run {} finished: {} ({} step(s), {} failed)",
                run.run_id,
                run.status.as_str(),
                run.steps.len(),
                run.failed_steps().len()
            );
        }
    }
}
