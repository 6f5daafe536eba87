//! Element execution engine
//!
//! Walks the execution graph as a hierarchical state machine. Every node
//! starts `pending`; entering a state runs its action chain (enter →
//! execute → exit per action), then the first transition whose guard
//! evaluates truthy is taken, falling back to the conditionless one.
//! `parallel` nodes run their branches as independently suspending tasks
//! and join once every branch is terminal; a failing branch never
//! short-circuits its siblings. Action failures become error-typed
//! StepValues routed through the workflow's error state instead of
//! crashing the run. Cancellation propagates through a token and marks
//! every non-terminal node `skipped`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::actions::{
    resolve_attributes, ActionError, ActionRegistry, ElementExecutionContext, Secrets,
};
use crate::compile::CompiledWorkflow;
use crate::datamodel::DataModelRegistry;
use crate::element::{ElementId, Role};
use crate::event_log::{EventKind, EventLog};
use crate::expr::{self, Expr};
use crate::graph::{ExecutionGraphElement, GraphEdge, GraphNodeId};
use crate::provider::{ChatMessage, Provider, TokenUsage, ToolDefinition};
use crate::step::{StepChunk, ToolCall};
use crate::stream::{ReplayableStream, StreamProducer, StreamReader};

/// Upper bound on state entries per region; loops without progress hit
/// this instead of spinning forever
const MAX_STEPS: usize = 1024;

/// Lifecycle of one graph node within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Pending,
    Running,
    Streaming,
    WaitingForStream,
    Completed,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeStatus::Completed | NodeStatus::Failed | NodeStatus::Skipped)
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("action `{element}` failed while already in the error state: {source}")]
    ErrorStateFailed {
        element: String,
        #[source]
        source: ActionError,
    },

    #[error("run exceeded {MAX_STEPS} state entries")]
    StepLimit,

    #[error("workflow has no runnable state")]
    NoInitialState,

    #[error("run cancelled")]
    Cancelled,

    #[error("engine fault: {0}")]
    Internal(String),
}

/// Input for one run
#[derive(Debug, Clone, Default)]
pub struct RunInput {
    pub user_message: String,
    pub chat_history: Vec<ChatMessage>,
    pub secrets: Secrets,
    pub client_side_tools: Vec<ToolDefinition>,
}

impl RunInput {
    pub fn message(user_message: impl Into<String>) -> Self {
        Self { user_message: user_message.into(), ..Self::default() }
    }
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Failed,
    Cancelled,
}

/// Aggregated result of a finished run, shaped like one assistant turn
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    /// Id of the state the machine stopped in
    pub final_state: String,
    /// Role of the aggregated message (always "assistant")
    pub role: String,
    /// Concatenated text output
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: TokenUsage,
    pub duration_ms: u64,
    /// Message of a failure routed through the error state, if any
    pub error: Option<String>,
}

/// Handle on an in-flight run: stream readers, cancellation, events, join
pub struct RunHandle {
    pub run_id: String,
    stream: ReplayableStream<StepChunk>,
    cancel: CancellationToken,
    events: EventLog,
    statuses: Arc<Mutex<HashMap<GraphNodeId, NodeStatus>>>,
    join: tokio::task::JoinHandle<Result<RunSummary, EngineError>>,
}

impl RunHandle {
    /// Independent replaying reader over the run's chunk stream
    pub fn reader(&self) -> StreamReader<StepChunk> {
        self.stream.reader()
    }

    pub fn stream(&self) -> ReplayableStream<StepChunk> {
        self.stream.clone()
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn status_of(&self, node: GraphNodeId) -> NodeStatus {
        self.statuses.lock().get(&node).copied().unwrap_or(NodeStatus::Pending)
    }

    /// Cancel the run: in-flight actions are dropped, non-terminal nodes
    /// become `skipped`, the producer is torn down.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the run to finish
    pub async fn wait(self) -> Result<RunSummary, EngineError> {
        match self.join.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(EngineError::Cancelled),
            Err(e) => Err(EngineError::Internal(e.to_string())),
        }
    }
}

/// The engine: an action registry reusable across runs
pub struct Engine {
    actions: Arc<ActionRegistry>,
}

impl Engine {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self { actions: Arc::new(ActionRegistry::builtin(provider)) }
    }

    pub fn with_registry(actions: ActionRegistry) -> Self {
        Self { actions: Arc::new(actions) }
    }

    /// Start a run; returns immediately with a handle whose stream begins
    /// producing as actions execute.
    pub fn start(&self, workflow: Arc<CompiledWorkflow>, input: RunInput) -> RunHandle {
        let run_id = Uuid::new_v4().to_string();
        let (stream, producer) = ReplayableStream::channel();
        let cancel = CancellationToken::new();
        let events = EventLog::new();
        let statuses: Arc<Mutex<HashMap<GraphNodeId, NodeStatus>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let run = Run {
            workflow: Arc::clone(&workflow),
            actions: Arc::clone(&self.actions),
            registry: DataModelRegistry::new(),
            stream: stream.clone(),
            producer: Arc::new(producer),
            cancel: cancel.clone(),
            events: events.clone(),
            statuses: Arc::clone(&statuses),
            run_id: Arc::from(run_id.as_str()),
            workflow_id: Arc::from(workflow.tree.root().id.as_str()),
            user_message: Arc::from(input.user_message.as_str()),
            chat_history: Arc::new(input.chat_history),
            secrets: Arc::new(input.secrets),
            client_tools: Arc::new(input.client_side_tools),
            expr_cache: Arc::new(DashMap::new()),
            last_error: Arc::new(Mutex::new(None)),
        };

        let join = tokio::spawn(run.drive());
        RunHandle { run_id, stream, cancel, events, statuses, join }
    }
}

/// How one region (top-level machine, composite body or parallel branch)
/// ended
#[derive(Debug, Clone, PartialEq)]
enum Outcome {
    /// Reached a final state or left its region
    Completed { last_state: String },
    /// An action failed; carried to the join / top level for routing
    Failed { error: String },
    Cancelled,
}

/// Per-run state shared across branches; cheap to clone into branch tasks
#[derive(Clone)]
struct Run {
    workflow: Arc<CompiledWorkflow>,
    actions: Arc<ActionRegistry>,
    registry: DataModelRegistry,
    stream: ReplayableStream<StepChunk>,
    producer: Arc<StreamProducer<StepChunk>>,
    cancel: CancellationToken,
    events: EventLog,
    statuses: Arc<Mutex<HashMap<GraphNodeId, NodeStatus>>>,
    run_id: Arc<str>,
    workflow_id: Arc<str>,
    user_message: Arc<str>,
    chat_history: Arc<Vec<ChatMessage>>,
    secrets: Arc<Secrets>,
    client_tools: Arc<Vec<ToolDefinition>>,
    /// Run-scoped cache of parsed guard expressions
    expr_cache: Arc<DashMap<String, Arc<Expr>>>,
    /// Message of the most recent routed failure
    last_error: Arc<Mutex<Option<String>>>,
}

impl Run {
    async fn drive(self) -> Result<RunSummary, EngineError> {
        let started = Instant::now();
        self.events.emit(EventKind::RunStarted {
            workflow_id: self.workflow_id.to_string(),
            run_id: self.run_id.to_string(),
        });
        self.registry
            .initialize(&self.workflow.data_model, &self.user_message)
            .await;

        let driven = self.run_region(self.workflow.graph.entry(), None).await;

        // Anything never reached stays pending → skipped; the stream must
        // finish even when the engine itself faulted, or readers hang
        self.mark_unfinished_skipped();
        let outcome = match driven {
            Ok(outcome) => outcome,
            Err(fault) => {
                self.producer.push(StepChunk::Error { message: fault.to_string() });
                self.producer.finish();
                self.events.emit(EventKind::RunFailed { error: fault.to_string() });
                return Err(fault);
            }
        };
        self.producer.finish();

        let duration_ms = started.elapsed().as_millis() as u64;
        let chunks = self.stream.snapshot();
        let content: String = chunks
            .iter()
            .filter_map(|c| match c {
                StepChunk::Text { delta } => Some(delta.as_str()),
                _ => None,
            })
            .collect();
        let tool_calls: Vec<ToolCall> = chunks
            .iter()
            .filter_map(|c| match c {
                StepChunk::ToolCall { id, name, arguments } => Some(ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    arguments: arguments.clone(),
                }),
                _ => None,
            })
            .collect();
        let usage = TokenUsage::estimate(self.user_message.len(), content.len());

        let (status, final_state, error) = match outcome {
            Outcome::Completed { last_state } => {
                let final_state = self.completed_final_state().unwrap_or(last_state);
                self.events.emit(EventKind::RunCompleted {
                    final_state: final_state.clone(),
                    total_duration_ms: duration_ms,
                });
                let error = self.last_error.lock().clone();
                (RunStatus::Completed, final_state, error)
            }
            Outcome::Failed { error } => {
                self.events.emit(EventKind::RunFailed { error: error.clone() });
                (RunStatus::Failed, "error".to_string(), Some(error))
            }
            Outcome::Cancelled => {
                self.events.emit(EventKind::RunCancelled);
                (RunStatus::Cancelled, "cancelled".to_string(), None)
            }
        };

        Ok(RunSummary {
            run_id: self.run_id.to_string(),
            status,
            final_state,
            role: "assistant".to_string(),
            content,
            tool_calls,
            usage,
            duration_ms,
            error,
        })
    }

    /// Id of the final node that actually completed, if any
    fn completed_final_state(&self) -> Option<String> {
        let statuses = self.statuses.lock();
        self.workflow
            .graph
            .iter()
            .enumerate()
            .find(|(i, n)| {
                n.is_final
                    && statuses.get(&GraphNodeId(*i)).copied() == Some(NodeStatus::Completed)
            })
            .map(|(_, n)| n.id.clone())
    }

    /// Walk states starting at `start`. `region` restricts the walk to a
    /// set of state ids (composite bodies and parallel branches); a
    /// transition out of the region completes it. Failures inside a region
    /// bubble up as `Outcome::Failed`; only the top level routes them to
    /// the error state.
    fn run_region<'a>(
        &'a self,
        start: GraphNodeId,
        region: Option<&'a HashSet<String>>,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Outcome, EngineError>> + Send + 'a>,
    > {
        Box::pin(async move {
        let mut current = start;
        let mut last_state = String::new();
        let mut steps = 0usize;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(Outcome::Cancelled);
            }
            steps += 1;
            if steps > MAX_STEPS {
                return Err(EngineError::StepLimit);
            }

            let node = self.workflow.graph.get(current);
            last_state = node.id.clone();
            self.set_status(current, NodeStatus::Running);
            self.events.emit(EventKind::StateEntered { state_id: Arc::from(node.id.as_str()) });

            if node.is_final {
                // Final states may render output actions before stopping
                if let Err(e) = self.run_actions_of(current).await {
                    warn!(state = %node.id, error = %e, "final-state action failed");
                }
                self.set_status(current, NodeStatus::Completed);
                self.events.emit(EventKind::StateExited { state_id: Arc::from(node.id.as_str()) });
                return Ok(Outcome::Completed { last_state });
            }

            // Execute the state's body. Box the recursive branch as a
            // `dyn Future + Send` to break the Send auto-trait inference cycle
            // (run_region -> run_parallel -> spawns run_region).
            let body_fut: std::pin::Pin<
                Box<dyn std::future::Future<Output = Result<(), ActionError>> + Send + '_>,
            > = if node.sub_type == "parallel" {
                Box::pin(self.run_parallel(current))
            } else {
                Box::pin(self.run_actions_of(current))
            };
            let body = body_fut.await;

            match body {
                Ok(()) => self.set_status(current, NodeStatus::Completed),
                Err(error) => {
                    self.set_status(current, NodeStatus::Failed);
                    self.events
                        .emit(EventKind::StateExited { state_id: Arc::from(node.id.as_str()) });
                    if self.cancel.is_cancelled() {
                        return Ok(Outcome::Cancelled);
                    }
                    if region.is_some() {
                        // Bubble to the join / top level
                        return Ok(Outcome::Failed { error: error.to_string() });
                    }
                    match self.route_error(current, error)? {
                        Some(error_node) => {
                            current = error_node;
                            continue;
                        }
                        None => return Ok(Outcome::Cancelled),
                    }
                }
            }

            // Pick the next edge: first truthy guard, else the sole
            // conditionless transition
            let node = self.workflow.graph.get(current);
            let Some(edge) = self.choose_edge(node) else {
                self.events.emit(EventKind::StateExited { state_id: Arc::from(node.id.as_str()) });
                return Ok(Outcome::Completed { last_state });
            };
            let target = self.workflow.graph.get(edge.target);

            // Leaving the region completes it
            if let Some(region) = region {
                if !region.contains(&target.id) {
                    self.events
                        .emit(EventKind::StateExited { state_id: Arc::from(node.id.as_str()) });
                    return Ok(Outcome::Completed { last_state });
                }
            }

            self.events.emit(EventKind::TransitionTaken {
                from: Arc::from(node.id.as_str()),
                to: Arc::from(target.id.as_str()),
                guarded: edge.when.is_some(),
            });
            if !edge.internal {
                self.events.emit(EventKind::StateExited { state_id: Arc::from(node.id.as_str()) });
            }
            current = edge.target;
        }
        })
    }

    /// Run a state's body: leaf actions in sequence, or the composite's
    /// inner machine scoped to its subtree.
    async fn run_actions_of(&self, state: GraphNodeId) -> Result<(), ActionError> {
        let tree = &self.workflow.tree;
        let element_id = self.workflow.graph.get(state).element;

        let child_states = tree.child_states(element_id);
        if !child_states.is_empty() {
            let region: HashSet<String> = descendant_state_ids(tree, element_id);
            let entry = self
                .workflow
                .graph
                .get(state)
                .next
                .iter()
                .find(|e| e.entry)
                .map(|e| e.target);
            if let Some(entry) = entry {
                return match Box::pin(self.run_region(entry, Some(&region))).await {
                    Ok(Outcome::Completed { .. }) | Ok(Outcome::Cancelled) => Ok(()),
                    Ok(Outcome::Failed { error }) => Err(ActionError::Invalid(error)),
                    Err(e) => Err(ActionError::Invalid(e.to_string())),
                };
            }
            return Ok(());
        }

        for action_element in tree.child_actions(element_id) {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            self.execute_action(action_element).await?;
        }
        Ok(())
    }

    /// Run one leaf action through its executor, forwarding its chunks
    /// into the run-level stream.
    async fn execute_action(&self, element_id: ElementId) -> Result<(), ActionError> {
        let element = self.workflow.tree.get(element_id);
        let graph_node = self.workflow.graph.node_for_element(element_id);
        let scope_path = self.workflow.tree.scope_path(element_id);
        let data = self.registry.scoped(&scope_path);

        let mut ctx = ElementExecutionContext {
            run_id: Arc::clone(&self.run_id),
            workflow_id: Arc::clone(&self.workflow_id),
            element_id: element.id.clone(),
            sub_type: element.element_type.clone(),
            attributes: element.attributes.clone(),
            content: element.content.clone(),
            data,
            user_message: Arc::clone(&self.user_message),
            chat_history: Arc::clone(&self.chat_history),
            secrets: Arc::clone(&self.secrets),
            client_tools: Arc::clone(&self.client_tools),
            last_error: self.last_error.lock().clone(),
        };

        // `when` guard on the element itself: falsy → skipped, not run
        let guard = element
            .attr_expr("when")
            .or_else(|| element.attr_str("when"))
            .map(str::to_string);
        if let Some(when) = guard {
            if !self.eval_guard(&when, &ctx) {
                debug!(element = %ctx.element_id, "guard falsy, skipping action");
                if let Some(node) = graph_node {
                    self.set_status(node, NodeStatus::Skipped);
                }
                self.events.emit(EventKind::ActionSkipped {
                    element_id: Arc::from(ctx.element_id.as_str()),
                });
                return Ok(());
            }
        }

        ctx.attributes = resolve_attributes(&element.attributes, &ctx.scope())?;

        let executor = self.actions.get(&ctx.sub_type)?;
        if let Some(node) = graph_node {
            // User-input elements wait on external input rather than compute
            let status = if ctx.sub_type == "input" {
                NodeStatus::WaitingForStream
            } else {
                NodeStatus::Running
            };
            self.set_status(node, status);
        }
        self.events.emit(EventKind::ActionStarted {
            element_id: Arc::from(ctx.element_id.as_str()),
            sub_type: ctx.sub_type.clone(),
        });
        let action_started = Instant::now();

        executor.enter(&ctx).await;
        let result = tokio::select! {
            result = executor.execute(&ctx) => result,
            _ = self.cancel.cancelled() => {
                executor.exit(&ctx).await;
                if let Some(node) = graph_node {
                    self.set_status(node, NodeStatus::Skipped);
                }
                return Ok(());
            }
        };

        match result {
            Ok(step) => {
                if let Some(node) = graph_node {
                    self.set_status(node, NodeStatus::Streaming);
                }
                // Forward every chunk into the run-level stream; readers
                // replay history so late consumers miss nothing
                let mut reader = step.stream();
                loop {
                    tokio::select! {
                        chunk = reader.next() => match chunk {
                            Some(chunk) => self.producer.push(chunk),
                            None => break,
                        },
                        _ = self.cancel.cancelled() => {
                            step.raw_stream().cancel();
                            break;
                        }
                    }
                }
                executor.exit(&ctx).await;

                if let Some(error) = step.error().await {
                    if let Some(node) = graph_node {
                        self.set_status(node, NodeStatus::Failed);
                    }
                    self.events.emit(EventKind::ActionFailed {
                        element_id: Arc::from(ctx.element_id.as_str()),
                        error: error.clone(),
                    });
                    return Err(ActionError::Provider(error));
                }

                if let Some(node) = graph_node {
                    self.set_status(node, NodeStatus::Completed);
                }
                self.events.emit(EventKind::ActionCompleted {
                    element_id: Arc::from(ctx.element_id.as_str()),
                    duration_ms: action_started.elapsed().as_millis() as u64,
                });
                Ok(())
            }
            Err(e) => {
                executor.exit(&ctx).await;
                if let Some(node) = graph_node {
                    self.set_status(node, NodeStatus::Failed);
                }
                self.events.emit(EventKind::ActionFailed {
                    element_id: Arc::from(ctx.element_id.as_str()),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Run every branch of a parallel node to a terminal state; the join
    /// fires only after all branches finish, aggregating failures.
    async fn run_parallel(&self, node: GraphNodeId) -> Result<(), ActionError> {
        let graph_node = self.workflow.graph.get(node);

        let mut join_set = JoinSet::new();
        for &branch in &graph_node.parallel {
            let run = self.clone();
            // Each branch is confined to its own subtree; a healed
            // transition pointing at a sibling branch ends this branch
            // instead of re-running the sibling
            let branch_element = self.workflow.graph.get(branch).element;
            let region = descendant_state_ids(&self.workflow.tree, branch_element);
            join_set.spawn(async move { run.run_region(branch, Some(&region)).await });
        }

        let mut failures: Vec<String> = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok(Outcome::Failed { error })) => failures.push(error),
                Ok(Ok(_)) => {}
                Ok(Err(e)) => failures.push(e.to_string()),
                Err(e) => {
                    if !e.is_cancelled() {
                        warn!(error = %e, "parallel branch panicked");
                        failures.push(e.to_string());
                    }
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ActionError::Invalid(format!(
                "{} parallel branch(es) failed: {}",
                failures.len(),
                failures.join("; ")
            )))
        }
    }

    /// Route a failure to the error state; `Err` only when the failure
    /// happened inside the error state itself.
    fn route_error(
        &self,
        failed_node: GraphNodeId,
        error: ActionError,
    ) -> Result<Option<GraphNodeId>, EngineError> {
        let failed = self.workflow.graph.get(failed_node);
        if failed.kind == Role::Error {
            return Err(EngineError::ErrorStateFailed { element: failed.id.clone(), source: error });
        }

        let message = error.to_string();
        warn!(element = %failed.id, error = %message, "routing failure to error state");
        *self.last_error.lock() = Some(message.clone());
        self.producer.push(StepChunk::Error { message });

        let error_node = self
            .workflow
            .graph
            .iter()
            .position(|n| n.kind == Role::Error)
            .map(GraphNodeId);
        match error_node {
            Some(node) => Ok(Some(node)),
            // Healing guarantees an error state; hand-built trees may lack one
            None => Err(EngineError::ErrorStateFailed {
                element: failed.id.clone(),
                source: error,
            }),
        }
    }

    /// First non-entry edge whose guard is truthy, else the conditionless
    /// transition.
    fn choose_edge<'g>(&self, node: &'g ExecutionGraphElement) -> Option<&'g GraphEdge> {
        let scope_path = self.workflow.tree.scope_path(node.element);
        let data = self.registry.scoped(&scope_path);
        let ctx = ElementExecutionContext {
            run_id: Arc::clone(&self.run_id),
            workflow_id: Arc::clone(&self.workflow_id),
            element_id: node.id.clone(),
            sub_type: node.sub_type.clone(),
            attributes: node.attributes.clone(),
            content: None,
            data,
            user_message: Arc::clone(&self.user_message),
            chat_history: Arc::clone(&self.chat_history),
            secrets: Arc::clone(&self.secrets),
            client_tools: Arc::clone(&self.client_tools),
            last_error: self.last_error.lock().clone(),
        };

        for edge in node.next.iter().filter(|e| !e.entry) {
            match &edge.when {
                None => return Some(edge),
                Some(code) => {
                    if self.eval_guard(code, &ctx) {
                        return Some(edge);
                    }
                }
            }
        }
        None
    }

    /// Evaluate a guard with the run-scoped parse cache; failures are falsy
    fn eval_guard(&self, code: &str, ctx: &ElementExecutionContext) -> bool {
        let parsed = match self.expr_cache.get(code) {
            Some(cached) => Arc::clone(&cached),
            None => match expr::parse_expression(code) {
                Ok(parsed) => {
                    let parsed = Arc::new(parsed);
                    self.expr_cache.insert(code.to_string(), Arc::clone(&parsed));
                    parsed
                }
                Err(e) => {
                    warn!(code, error = %e, "guard failed to parse, treating as false");
                    return false;
                }
            },
        };
        match expr::evaluate(&parsed, &ctx.scope()) {
            Ok(value) => expr::is_truthy(&value),
            Err(e) => {
                debug!(code, error = %e, "guard evaluation failed, treating as false");
                false
            }
        }
    }

    fn set_status(&self, node: GraphNodeId, status: NodeStatus) {
        self.statuses.lock().insert(node, status);
    }

    fn mark_unfinished_skipped(&self) {
        let mut statuses = self.statuses.lock();
        for i in 0..self.workflow.graph.len() {
            let id = GraphNodeId(i);
            let current = statuses.get(&id).copied().unwrap_or(NodeStatus::Pending);
            if !current.is_terminal() {
                statuses.insert(id, NodeStatus::Skipped);
            }
        }
    }
}

/// Ids of every state in `root`'s subtree, `root` included
fn descendant_state_ids(
    tree: &crate::element::ElementTree,
    root: ElementId,
) -> HashSet<String> {
    let mut ids = HashSet::new();
    let mut stack = vec![root];
    while let Some(current) = stack.pop() {
        let element = tree.get(current);
        if element.is_state_like() {
            ids.insert(element.id.clone());
        }
        stack.extend(element.children.iter().copied());
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::Compiler;
    use crate::provider::MockProvider;

    fn compile(src: &str) -> Arc<CompiledWorkflow> {
        let compiled = Compiler::new().compile(src).expect("compiles");
        Arc::new(compiled)
    }

    fn engine_with(provider: Arc<MockProvider>) -> Engine {
        Engine::new(provider)
    }

    #[tokio::test]
    async fn minimal_workflow_runs_to_final() {
        let workflow = compile(
            r#"<workflow id="w"><state id="s"><llm model="m" prompt="hi"/></state></workflow>"#,
        );
        let provider = Arc::new(MockProvider::new().with_default("hello back"));
        let engine = engine_with(provider);

        let handle = engine.start(workflow, RunInput::message("hi"));
        let summary = handle.wait().await.expect("run");
        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.final_state, "final");
        assert_eq!(summary.content, "hello back");
        assert!(summary.error.is_none());
    }

    #[tokio::test]
    async fn guards_choose_transitions() {
        let src = r#"<workflow id="w"><data id="score" type="number">5</data><state id="s"><transition target="high" cond={score > 3}/><transition target="low"/></state><state id="low"><log message="low"/></state><state id="high"><send content="HIGH"/></state></workflow>"#;
        let workflow = compile(src);
        let engine = engine_with(Arc::new(MockProvider::new()));

        let handle = engine.start(workflow, RunInput::message("x"));
        let summary = handle.wait().await.expect("run");
        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.content, "HIGH");
    }

    #[tokio::test]
    async fn failing_action_routes_through_error_state() {
        let workflow = compile(
            r#"<workflow id="w"><state id="s"><llm model="m" prompt="p"/></state></workflow>"#,
        );
        let provider = Arc::new(MockProvider::new());
        provider.fail_next();
        let engine = engine_with(provider);

        let handle = engine.start(workflow, RunInput::message("x"));
        let reader_chunks = {
            let mut reader = handle.reader();
            let summary = handle.wait().await.expect("run survives action failure");
            assert_eq!(summary.status, RunStatus::Completed);
            assert!(summary.error.as_deref().unwrap_or("").contains("mock failure"));

            let mut chunks = Vec::new();
            while let Some(chunk) = reader.next().await {
                chunks.push(chunk);
            }
            chunks
        };
        assert!(reader_chunks
            .iter()
            .any(|c| matches!(c, StepChunk::Error { message } if message.contains("mock failure"))));
    }

    #[tokio::test]
    async fn parallel_branches_all_complete() {
        let src = r#"<workflow id="w"><parallel id="p"><state id="x"><send content="X"/></state><state id="y"><send content="Y"/></state></parallel><state id="after"><send content="done"/></state></workflow>"#;
        let workflow = compile(src);
        let engine = engine_with(Arc::new(MockProvider::new()));

        let handle = engine.start(workflow, RunInput::message("x"));
        let summary = handle.wait().await.expect("run");
        assert_eq!(summary.status, RunStatus::Completed);
        // Branch ordering is unspecified, but both ran and the join came after
        assert!(summary.content.contains('X'));
        assert!(summary.content.contains('Y'));
        assert!(summary.content.ends_with("done"));
    }

    #[tokio::test]
    async fn cancellation_skips_remaining_nodes() {
        let workflow = compile(
            r#"<workflow id="w"><state id="s"><llm model="m" prompt="p"/></state></workflow>"#,
        );
        let engine = engine_with(Arc::new(MockProvider::new()));
        let handle = engine.start(workflow, RunInput::message("x"));
        handle.cancel();
        let summary = handle.wait().await.expect("cancel is graceful");
        // Either the run was cancelled mid-flight or it had already finished
        assert!(matches!(summary.status, RunStatus::Cancelled | RunStatus::Completed));
    }

    #[tokio::test]
    async fn sequential_actions_stream_in_order() {
        let src = r#"<workflow id="w"><state id="s"><send content="one "/><send content="two"/></state></workflow>"#;
        let workflow = compile(src);
        let engine = engine_with(Arc::new(MockProvider::new()));
        let handle = engine.start(workflow, RunInput::message("x"));
        let summary = handle.wait().await.expect("run");
        assert_eq!(summary.content, "one two");
    }

    #[tokio::test]
    async fn assign_then_guard_sees_new_value() {
        let src = r#"<workflow id="w"><data id="flag" type="boolean">false</data><state id="s"><assign location="flag" expr={true}/><transition target="yes" cond={flag}/><transition target="no"/></state><state id="no"><send content="NO"/></state><state id="yes"><send content="YES"/></state></workflow>"#;
        let workflow = compile(src);
        let engine = engine_with(Arc::new(MockProvider::new()));
        let handle = engine.start(workflow, RunInput::message("x"));
        let summary = handle.wait().await.expect("run");
        assert_eq!(summary.content, "YES");
    }

    #[tokio::test]
    async fn tool_calls_surface_in_summary() {
        let src = r#"<workflow id="w"><state id="s"><toolcall tool="search" args={{"q": "rust"}}/></state></workflow>"#;
        let workflow = compile(src);
        let engine = engine_with(Arc::new(MockProvider::new()));
        let handle = engine.start(workflow, RunInput::message("x"));
        let summary = handle.wait().await.expect("run");
        assert_eq!(summary.tool_calls.len(), 1);
        assert_eq!(summary.tool_calls[0].name, "search");
    }
}
