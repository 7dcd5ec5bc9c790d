//! The pipeline execution loop: single-threaded cooperative traversal with
//! retries, goal-gate enforcement, checkpointing, event emission, and the
//! branch runner backing the parallel fan-out subsystem.

use crate::handlers::codergen::{CodergenBackend, CodergenHandler};
use crate::handlers::conditional::ConditionalHandler;
use crate::handlers::manager_loop::ManagerLoopHandler;
use crate::handlers::parallel::{BranchRequest, BranchRunner, ParallelHandler, DEFAULT_MAX_PARALLEL};
use crate::handlers::parallel_fan_in::FanInHandler;
use crate::handlers::registry::HandlerRegistry;
use crate::handlers::start_exit::{ExitHandler, StartHandler};
use crate::handlers::tool::{ShellToolRunner, ToolHandler, ToolRunner};
use crate::handlers::wait_human::WaitHumanHandler;
use crate::handlers::{SharedNodeHandler, StepContext};
use crate::interviewer::{AutoApproveInterviewer, Interviewer};
use crate::{
    apply_builtin_transforms, build_preamble, checkpoint_file_path, effective_max_retries,
    parse_dot, resolve_fidelity, resolve_thread_id, select_edge, validate_or_raise,
    AttractorError, Checkpoint, ContextSnapshot, ContextStore, Edge, Event, EventKind, EventSink,
    Graph, Node, Outcome, Preamble, RetryBackoff, StageStatus, Transform,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct EngineConfig {
    pub logs_root: Option<PathBuf>,
    pub dry_run: bool,
    pub max_steps: u32,
    pub max_parallel: usize,
    pub checkpoint_enabled: bool,
    pub backoff: RetryBackoff,
    pub interviewer: Option<Arc<dyn Interviewer>>,
    pub codergen_backend: Option<Arc<dyn CodergenBackend>>,
    pub tool_runner: Option<Arc<dyn ToolRunner>>,
    pub extra_handlers: Vec<(String, SharedNodeHandler)>,
    pub extra_transforms: Vec<Arc<dyn Transform>>,
    pub event_sink: EventSink,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            logs_root: None,
            dry_run: false,
            max_steps: 1000,
            max_parallel: DEFAULT_MAX_PARALLEL,
            checkpoint_enabled: true,
            backoff: RetryBackoff::default(),
            interviewer: None,
            codergen_backend: None,
            tool_runner: None,
            extra_handlers: Vec::new(),
            extra_transforms: Vec::new(),
            event_sink: EventSink::default(),
        }
    }
}

/// Result of driving a graph to termination (or to an unrecoverable error;
/// authoring failures surface as `Err` before any node runs).
#[derive(Clone, Debug)]
pub struct RunResult {
    pub outcome: Outcome,
    pub completed_nodes: Vec<String>,
    pub node_outcomes: BTreeMap<String, Outcome>,
    pub context: ContextSnapshot,
    pub cancelled: bool,
    pub steps: u32,
}

pub struct PipelineEngine {
    config: EngineConfig,
    registry: Arc<HandlerRegistry>,
    cancel: CancellationToken,
    events: Mutex<Vec<Event>>,
    sequence: AtomicU64,
}

impl PipelineEngine {
    pub fn new(config: EngineConfig) -> Self {
        let branch_runner = Arc::new(EngineBranchRunner {
            registry: OnceLock::new(),
            dry_run: config.dry_run,
            backoff: config.backoff.clone(),
            max_steps: config.max_steps,
        });

        let interviewer: Arc<dyn Interviewer> = config
            .interviewer
            .clone()
            .unwrap_or_else(|| Arc::new(AutoApproveInterviewer));
        let tool_runner: Arc<dyn ToolRunner> = config
            .tool_runner
            .clone()
            .unwrap_or_else(|| Arc::new(ShellToolRunner));

        let mut registry = HandlerRegistry::new();
        registry.register("start", Arc::new(StartHandler));
        registry.register("exit", Arc::new(ExitHandler));
        registry.register("conditional", Arc::new(ConditionalHandler));
        registry.register(
            "codergen",
            Arc::new(CodergenHandler::new(config.codergen_backend.clone())),
        );
        registry.register("wait.human", Arc::new(WaitHumanHandler::new(interviewer)));
        registry.register(
            "parallel",
            Arc::new(
                ParallelHandler::new(branch_runner.clone() as Arc<dyn BranchRunner>)
                    .with_max_parallel(config.max_parallel),
            ),
        );
        registry.register("parallel.fan_in", Arc::new(FanInHandler));
        registry.register("tool", Arc::new(ToolHandler::new(tool_runner)));
        registry.register("stack.manager_loop", Arc::new(ManagerLoopHandler));
        for (handler_type, handler) in &config.extra_handlers {
            registry.register(handler_type.clone(), handler.clone());
        }

        let registry = Arc::new(registry);
        branch_runner.bind(&registry);

        Self {
            config,
            registry,
            cancel: CancellationToken::new(),
            events: Mutex::new(Vec::new()),
            sequence: AtomicU64::new(0),
        }
    }

    /// Token a caller holds to request cooperative cancellation; it
    /// propagates to every handler and live branch.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Events emitted so far, in emission order.
    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Parse, transform, validate, and execute a DOT source string.
    pub async fn run_dot(&self, dot_source: &str) -> Result<RunResult, AttractorError> {
        let mut graph = parse_dot(dot_source)?;
        apply_builtin_transforms(&mut graph)?;
        for transform in &self.config.extra_transforms {
            transform.apply(&mut graph)?;
        }
        self.run(&graph).await
    }

    pub async fn run(&self, graph: &Graph) -> Result<RunResult, AttractorError> {
        self.run_with_resume(graph, None).await
    }

    /// Execute the pipeline, optionally resuming from a checkpoint. The
    /// resumed run restores context, completed nodes, and retry counts, and
    /// re-enters the loop at the successor of the checkpointed node.
    pub async fn run_with_resume(
        &self,
        graph: &Graph,
        resume_from: Option<Checkpoint>,
    ) -> Result<RunResult, AttractorError> {
        validate_or_raise(graph, &[])?;

        self.emit(
            EventKind::PipelineStart,
            None,
            data(&[("name", json!(graph.name)), ("goal", json!(graph.goal))]),
        );

        let mut completed_nodes: Vec<String>;
        let mut node_retries: BTreeMap<String, u32>;
        let mut node_outcomes: BTreeMap<String, Outcome> = BTreeMap::new();
        let context: ContextStore;
        let mut current: Option<String>;
        let mut incoming_edge: Option<Edge> = None;
        let mut previous_node: Option<String> = None;

        match resume_from {
            Some(checkpoint) => {
                context = checkpoint.restore_context();
                completed_nodes = checkpoint.completed_nodes.clone();
                node_retries = checkpoint.node_retries.clone();
                let (next, edge) = resume_successor(graph, &checkpoint);
                previous_node = if checkpoint.current_node.is_empty() {
                    None
                } else {
                    Some(checkpoint.current_node.clone())
                };
                incoming_edge = edge;
                current = next;
            }
            None => {
                context = ContextStore::new();
                seed_context(&context, graph)?;
                completed_nodes = Vec::new();
                node_retries = BTreeMap::new();
                current = graph.start_node().map(|node| node.id.clone());
            }
        }

        if let Some(logs_root) = &self.config.logs_root {
            std::fs::create_dir_all(logs_root).map_err(|error| {
                AttractorError::Runtime(format!(
                    "failed to create log directory '{}': {error}",
                    logs_root.display()
                ))
            })?;
        }
        let checkpoint_path = self
            .config
            .logs_root
            .as_ref()
            .filter(|_| self.config.checkpoint_enabled)
            .map(|root| checkpoint_file_path(root));

        let mut last_outcome = Outcome::success();
        let mut cancelled = false;
        let mut steps = 0u32;

        while let Some(current_id) = current.clone() {
            if self.cancel.is_cancelled() {
                cancelled = true;
                self.save_checkpoint(
                    &checkpoint_path,
                    &context,
                    completed_nodes.last().map(String::as_str).unwrap_or(""),
                    &completed_nodes,
                    &node_retries,
                )?;
                break;
            }
            if steps >= self.config.max_steps {
                self.emit(
                    EventKind::PipelineError,
                    Some(&current_id),
                    data(&[(
                        "error",
                        json!(format!("step limit {} exceeded", self.config.max_steps)),
                    )]),
                );
                last_outcome = Outcome::failure("step limit exceeded");
                self.save_checkpoint(
                    &checkpoint_path,
                    &context,
                    completed_nodes.last().map(String::as_str).unwrap_or(""),
                    &completed_nodes,
                    &node_retries,
                )?;
                break;
            }
            steps += 1;

            let Some(node) = graph.node(&current_id).cloned() else {
                self.emit(
                    EventKind::PipelineError,
                    Some(&current_id),
                    data(&[("error", json!("traversal reached unknown node"))]),
                );
                last_outcome = Outcome::failure(format!("unknown node '{current_id}'"));
                break;
            };

            // Execute the node (exit nodes included; their goal-gate check
            // runs after the handler returns).
            self.emit(EventKind::NodeStart, Some(&node.id), BTreeMap::new());
            let preamble = self.preamble_for(
                graph,
                &node,
                incoming_edge.as_ref(),
                previous_node.as_deref(),
                &completed_nodes,
                &node_outcomes,
                &context,
            )?;

            let env = RetryEnv {
                registry: self.registry.as_ref(),
                graph,
                context: &context,
                cancel: &self.cancel,
                logs_root: self.config.logs_root.clone(),
                backoff: &self.config.backoff,
                dry_run: self.config.dry_run,
            };
            let outcome = execute_node_with_retry(
                &env,
                &node,
                preamble,
                &mut node_retries,
                |attempt, reason| {
                    self.emit(
                        EventKind::NodeRetry,
                        Some(&node.id),
                        data(&[("attempt", json!(attempt)), ("reason", json!(reason))]),
                    );
                },
            )
            .await;
            last_outcome = outcome.clone();

            apply_outcome(&context, &outcome)?;
            completed_nodes.push(node.id.clone());
            node_outcomes.insert(node.id.clone(), outcome.clone());
            self.emit(
                EventKind::NodeComplete,
                Some(&node.id),
                data(&[("status", json!(outcome.status.as_str()))]),
            );

            if node.handler_type() == "exit" {
                match self.process_goal_gates(graph, &node_outcomes) {
                    GateDecision::AllSatisfied => {
                        self.emit(EventKind::PipelineComplete, Some(&node.id), BTreeMap::new());
                        self.save_checkpoint(
                            &checkpoint_path,
                            &context,
                            &node.id,
                            &completed_nodes,
                            &node_retries,
                        )?;
                        current = None;
                        continue;
                    }
                    GateDecision::Retry { target } => {
                        previous_node = Some(node.id.clone());
                        incoming_edge = None;
                        current = Some(target);
                        self.save_checkpoint(
                            &checkpoint_path,
                            &context,
                            &node.id,
                            &completed_nodes,
                            &node_retries,
                        )?;
                        continue;
                    }
                    GateDecision::Unrecoverable { gate_id } => {
                        last_outcome = Outcome::failure(format!(
                            "goal gate '{gate_id}' unsatisfied, no retry target"
                        ));
                        self.save_checkpoint(
                            &checkpoint_path,
                            &context,
                            &node.id,
                            &completed_nodes,
                            &node_retries,
                        )?;
                        break;
                    }
                }
            }

            let snapshot = context.snapshot()?;
            let Some(edge) = select_edge(graph, &node.id, &outcome, &snapshot.values).cloned()
            else {
                self.emit(
                    EventKind::PipelineError,
                    Some(&node.id),
                    data(&[(
                        "error",
                        json!(if outcome.is_failure() {
                            "stage failed with no outgoing fail edge"
                        } else {
                            "node has no outgoing edges and is not an exit"
                        }),
                    )]),
                );
                if !outcome.is_failure() {
                    last_outcome =
                        Outcome::failure(format!("node '{}' has no outgoing edges", node.id));
                }
                self.save_checkpoint(
                    &checkpoint_path,
                    &context,
                    &node.id,
                    &completed_nodes,
                    &node_retries,
                )?;
                break;
            };

            if edge.loop_restart {
                self.emit(
                    EventKind::LoopRestart,
                    Some(&node.id),
                    data(&[("target", json!(edge.target))]),
                );
                context.clear()?;
                seed_context(&context, graph)?;
                completed_nodes.clear();
                node_outcomes.clear();
                node_retries.clear();
                previous_node = None;
                incoming_edge = None;
                current = Some(edge.target.clone());
                self.save_checkpoint(
                    &checkpoint_path,
                    &context,
                    &node.id,
                    &completed_nodes,
                    &node_retries,
                )?;
                continue;
            }

            self.save_checkpoint(
                &checkpoint_path,
                &context,
                &node.id,
                &completed_nodes,
                &node_retries,
            )?;
            previous_node = Some(node.id.clone());
            current = Some(edge.target.clone());
            incoming_edge = Some(edge);
        }

        let mut finalize_data = BTreeMap::new();
        if cancelled {
            finalize_data.insert("cancelled".to_string(), json!(true));
        }
        self.emit(EventKind::PipelineFinalize, None, finalize_data);

        Ok(RunResult {
            outcome: last_outcome,
            completed_nodes,
            node_outcomes,
            context: context.snapshot()?,
            cancelled,
            steps,
        })
    }

    /// Walk goal-gated nodes in declaration order; the first one whose last
    /// recorded outcome is not success-class decides the gate outcome.
    fn process_goal_gates(
        &self,
        graph: &Graph,
        node_outcomes: &BTreeMap<String, Outcome>,
    ) -> GateDecision {
        for gate in graph.goal_gated_nodes() {
            let Some(outcome) = node_outcomes.get(&gate.id) else {
                continue;
            };
            if outcome.is_success() {
                continue;
            }
            if let Some(target) = resolve_retry_target(graph, gate) {
                self.emit(
                    EventKind::GoalGateRetry,
                    Some(&gate.id),
                    data(&[("target", json!(target))]),
                );
                return GateDecision::Retry { target };
            }
            self.emit(
                EventKind::PipelineError,
                Some(&gate.id),
                data(&[("error", json!("goal gate unsatisfied and no retry target"))]),
            );
            return GateDecision::Unrecoverable {
                gate_id: gate.id.clone(),
            };
        }
        GateDecision::AllSatisfied
    }

    #[allow(clippy::too_many_arguments)]
    fn preamble_for(
        &self,
        graph: &Graph,
        node: &Node,
        incoming_edge: Option<&Edge>,
        previous_node: Option<&str>,
        completed_nodes: &[String],
        node_outcomes: &BTreeMap<String, Outcome>,
        context: &ContextStore,
    ) -> Result<Preamble, AttractorError> {
        let fidelity = resolve_fidelity(graph, node, incoming_edge);
        let thread_id = resolve_thread_id(graph, node, incoming_edge, previous_node);
        let statuses: BTreeMap<String, StageStatus> = node_outcomes
            .iter()
            .map(|(node_id, outcome)| (node_id.clone(), outcome.status))
            .collect();
        let snapshot = context.snapshot()?;
        Ok(build_preamble(
            graph,
            completed_nodes,
            &statuses,
            &snapshot,
            fidelity,
            &thread_id,
        ))
    }

    fn save_checkpoint(
        &self,
        checkpoint_path: &Option<PathBuf>,
        context: &ContextStore,
        current_node: &str,
        completed_nodes: &[String],
        node_retries: &BTreeMap<String, u32>,
    ) -> Result<(), AttractorError> {
        let Some(path) = checkpoint_path else {
            return Ok(());
        };
        let snapshot = context.snapshot()?;
        Checkpoint::from_state(&snapshot, current_node, completed_nodes, node_retries).save(path)
    }

    fn emit(&self, kind: EventKind, node_id: Option<&str>, data: BTreeMap<String, Value>) {
        let mut event = Event::new(kind, node_id.map(ToOwned::to_owned), data);
        event.sequence_no = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
        self.config.event_sink.emit(&event);
    }
}

enum GateDecision {
    AllSatisfied,
    Retry { target: String },
    Unrecoverable { gate_id: String },
}

/// Node retry target, node fallback, then the graph-level equivalents; the
/// first one naming an existing node wins.
fn resolve_retry_target(graph: &Graph, node: &Node) -> Option<String> {
    [
        &node.retry_target,
        &node.fallback_retry_target,
        &graph.retry_target,
        &graph.fallback_retry_target,
    ]
    .into_iter()
    .find(|target| !target.is_empty() && graph.has_node(target))
    .cloned()
}

fn seed_context(context: &ContextStore, graph: &Graph) -> Result<(), AttractorError> {
    context.set("pipeline.name", json!(graph.name))?;
    context.set("pipeline.goal", json!(graph.goal))?;
    if !graph.goal.is_empty() {
        context.set("goal", json!(graph.goal))?;
    }
    Ok(())
}

fn apply_outcome(context: &ContextStore, outcome: &Outcome) -> Result<(), AttractorError> {
    context.apply_updates(&outcome.context_updates)?;
    context.set("outcome", json!(outcome.status.as_str()))?;
    if let Some(label) = outcome
        .preferred_label
        .as_ref()
        .filter(|label| !label.is_empty())
    {
        context.set("preferred_label", json!(label))?;
    }
    Ok(())
}

/// The successor of the checkpoint's node, resolved through the standard
/// edge selector against the outcome reconstructed from the checkpointed
/// `outcome` and `preferred_label` context keys.
fn resume_successor(graph: &Graph, checkpoint: &Checkpoint) -> (Option<String>, Option<Edge>) {
    if checkpoint.current_node.is_empty() {
        return (graph.start_node().map(|node| node.id.clone()), None);
    }

    let mut outcome = Outcome::success();
    if let Some(status) = checkpoint
        .context_values
        .get("outcome")
        .and_then(Value::as_str)
        .and_then(StageStatus::parse)
    {
        outcome.status = status;
    }
    outcome.preferred_label = checkpoint
        .context_values
        .get("preferred_label")
        .and_then(Value::as_str)
        .map(ToOwned::to_owned);

    match select_edge(
        graph,
        &checkpoint.current_node,
        &outcome,
        &checkpoint.context_values,
    ) {
        Some(edge) => (Some(edge.target.clone()), Some(edge.clone())),
        None => (None, None),
    }
}

pub(crate) struct RetryEnv<'a> {
    pub registry: &'a HandlerRegistry,
    pub graph: &'a Graph,
    pub context: &'a ContextStore,
    pub cancel: &'a CancellationToken,
    pub logs_root: Option<PathBuf>,
    pub backoff: &'a RetryBackoff,
    pub dry_run: bool,
}

/// Invoke a handler with retry, timeout, and cancellation wrapping. A throw
/// or a RETRY outcome is retried up to the effective limit; a final RETRY
/// coerces to PARTIAL_SUCCESS when `allow_partial` is set. FAIL returns are
/// routed, not retried, and no error escapes the step boundary.
pub(crate) async fn execute_node_with_retry(
    env: &RetryEnv<'_>,
    node: &Node,
    preamble: Preamble,
    node_retries: &mut BTreeMap<String, u32>,
    mut on_retry: impl FnMut(u32, &str),
) -> Outcome {
    if env.dry_run {
        return Outcome::success().with_notes(format!("[dry-run] {}", node.id));
    }

    let handler = match env.registry.resolve_or_err(node) {
        Ok(handler) => handler,
        Err(error) => return Outcome::failure(error.to_string()),
    };

    let max_retries = effective_max_retries(node, env.graph);
    let max_attempts = max_retries.saturating_add(1);
    let timeout_ms = node.timeout_millis();

    for attempt in 1..=max_attempts {
        let step_cancel = env.cancel.child_token();
        let step = StepContext {
            preamble: preamble.clone(),
            cancel: step_cancel.clone(),
            logs_root: env.logs_root.clone(),
        };

        let call = handler.execute(node, env.context, env.graph, &step);
        let result = match timeout_ms {
            Some(millis) => {
                match tokio::time::timeout(Duration::from_millis(millis), call).await {
                    Ok(result) => result,
                    Err(_) => {
                        step_cancel.cancel();
                        return Outcome::failure("timeout");
                    }
                }
            }
            None => call.await,
        };

        match result {
            Err(error) => {
                let reason = error.to_string();
                if attempt < max_attempts {
                    *node_retries.entry(node.id.clone()).or_insert(0) += 1;
                    on_retry(attempt, &reason);
                    tokio::time::sleep(env.backoff.delay_for_attempt(attempt)).await;
                    continue;
                }
                return Outcome::failure(reason);
            }
            Ok(outcome) => match outcome.status {
                StageStatus::Success | StageStatus::PartialSuccess => {
                    node_retries.remove(&node.id);
                    return outcome;
                }
                StageStatus::Retry => {
                    if attempt < max_attempts {
                        *node_retries.entry(node.id.clone()).or_insert(0) += 1;
                        on_retry(attempt, "retry requested");
                        tokio::time::sleep(env.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    if node.allow_partial {
                        return Outcome::with_status(StageStatus::PartialSuccess)
                            .with_notes("retries exhausted, partial accepted");
                    }
                    return Outcome::failure("max retries exceeded");
                }
                StageStatus::Fail | StageStatus::Skipped => return outcome,
            },
        }
    }

    Outcome::failure("max retries exceeded")
}

/// Runs one parallel branch as an isolated sub-traversal: from the branch
/// target until a fan-in node, an exit node, or a failure with no route.
/// Holds the registry weakly; the registry owns the fan-out handler that
/// owns this runner.
struct EngineBranchRunner {
    registry: OnceLock<Weak<HandlerRegistry>>,
    dry_run: bool,
    backoff: RetryBackoff,
    max_steps: u32,
}

impl EngineBranchRunner {
    fn bind(&self, registry: &Arc<HandlerRegistry>) {
        let _ = self.registry.set(Arc::downgrade(registry));
    }
}

#[async_trait::async_trait]
impl BranchRunner for EngineBranchRunner {
    async fn run_branch(&self, request: BranchRequest) -> Outcome {
        let Some(registry) = self.registry.get().and_then(Weak::upgrade) else {
            return Outcome::failure("branch runner is not bound to a handler registry");
        };

        let graph = Arc::clone(&request.graph);
        let mut current = request.target.clone();
        let mut previous_node: Option<String> = None;
        let mut incoming_edge: Option<Edge> = None;
        let mut node_retries: BTreeMap<String, u32> = BTreeMap::new();
        let mut node_statuses: BTreeMap<String, StageStatus> = BTreeMap::new();
        let mut completed: Vec<String> = Vec::new();
        let mut last_outcome = Outcome::success();
        let mut steps = 0u32;

        loop {
            if request.cancel.is_cancelled() {
                return Outcome::with_status(StageStatus::Skipped).with_notes("branch cancelled");
            }
            if steps >= self.max_steps {
                return Outcome::failure("branch step limit exceeded");
            }

            let Some(node) = graph.node(&current).cloned() else {
                return Outcome::failure(format!("branch reached unknown node '{current}'"));
            };
            let handler_type = node.handler_type();
            if handler_type == "exit" || handler_type == "parallel.fan_in" {
                return last_outcome;
            }
            steps += 1;

            let fidelity = resolve_fidelity(&graph, &node, incoming_edge.as_ref());
            let thread_id =
                resolve_thread_id(&graph, &node, incoming_edge.as_ref(), previous_node.as_deref());
            let snapshot = match request.context.snapshot() {
                Ok(snapshot) => snapshot,
                Err(error) => return Outcome::failure(error.to_string()),
            };
            let preamble = build_preamble(
                &graph,
                &completed,
                &node_statuses,
                &snapshot,
                fidelity,
                &thread_id,
            );

            let env = RetryEnv {
                registry: registry.as_ref(),
                graph: &graph,
                context: &request.context,
                cancel: &request.cancel,
                logs_root: request.logs_root.clone(),
                backoff: &self.backoff,
                dry_run: self.dry_run,
            };
            let outcome =
                execute_node_with_retry(&env, &node, preamble, &mut node_retries, |attempt, reason| {
                    debug!(
                        branch = %request.branch_id,
                        node = %node.id,
                        attempt,
                        reason,
                        "branch node retry"
                    );
                })
                .await;

            if let Err(error) = apply_outcome(&request.context, &outcome) {
                return Outcome::failure(error.to_string());
            }
            completed.push(node.id.clone());
            node_statuses.insert(node.id.clone(), outcome.status);
            last_outcome = outcome.clone();

            let snapshot = match request.context.snapshot() {
                Ok(snapshot) => snapshot,
                Err(error) => return Outcome::failure(error.to_string()),
            };
            match select_edge(&graph, &node.id, &outcome, &snapshot.values) {
                // No route ends the branch with whatever the last node
                // produced; a dangling failure stays a failure.
                None => return outcome,
                Some(edge) => {
                    incoming_edge = Some(edge.clone());
                    previous_node = Some(node.id.clone());
                    current = edge.target.clone();
                }
            }
        }
    }
}

fn data(entries: &[(&str, Value)]) -> BTreeMap<String, Value> {
    entries
        .iter()
        .map(|(key, value)| ((*key).to_string(), value.clone()))
        .collect()
}
