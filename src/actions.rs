//! Built-in action executors
//!
//! Each leaf element type maps to an [`ActionExecutor`]; the engine
//! dispatches through the [`ActionRegistry`] so new action kinds are
//! additive registrations, not engine changes. Executors receive a resolved
//! [`ElementExecutionContext`] (attributes with `$expr` values evaluated,
//! the scoped data-model view, run identifiers, secrets) and produce a
//! [`StepValue`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::info;

use crate::datamodel::{DataModelError, ScopedDataModel};
use crate::expr::{self, Scope};
use crate::provider::{ChatMessage, ChatRole, PromptRequest, Provider, ToolDefinition};
use crate::step::{StepChunk, StepValue};
use crate::stream::ReplayableStream;

/// Failure of one action execution. The engine converts these into
/// error-typed StepValues routed through the workflow's error state.
#[derive(Debug, Clone, Error)]
pub enum ActionError {
    #[error("provider error: {0}")]
    Provider(String),

    #[error("expression error: {0}")]
    Expr(String),

    #[error("data model error: {0}")]
    Data(#[from] DataModelError),

    #[error("no executor registered for `{0}`")]
    Unsupported(String),

    #[error("{0}")]
    Invalid(String),
}

/// Per-run secrets, split by origin
#[derive(Debug, Clone, Default)]
pub struct Secrets {
    pub system: Map<String, Value>,
    pub user: Map<String, Value>,
}

impl Secrets {
    fn to_json(&self) -> Value {
        json!({ "system": self.system, "user": self.user })
    }
}

/// Everything an executor may consult while running one element
#[derive(Clone)]
pub struct ElementExecutionContext {
    pub run_id: Arc<str>,
    pub workflow_id: Arc<str>,
    pub element_id: String,
    pub sub_type: String,
    /// Attributes with `$expr` values already evaluated
    pub attributes: Map<String, Value>,
    pub content: Option<String>,
    pub data: ScopedDataModel,
    pub user_message: Arc<str>,
    pub chat_history: Arc<Vec<ChatMessage>>,
    pub secrets: Arc<Secrets>,
    pub client_tools: Arc<Vec<ToolDefinition>>,
    /// Message of the failure being routed, when executing the error state
    pub last_error: Option<String>,
}

impl ElementExecutionContext {
    pub fn attr_str(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).and_then(Value::as_str)
    }

    /// Variable scope for expression evaluation: builtins layered over the
    /// scoped data model
    pub fn scope(&self) -> ContextScope<'_> {
        ContextScope { ctx: self }
    }

    /// Resolve `${...}` interpolations in a template against this context
    pub fn resolve_template(&self, template: &str) -> String {
        expr::resolve_template(template, &self.scope())
    }

    fn history_json(&self) -> Value {
        Value::Array(
            self.chat_history
                .iter()
                .map(|m| {
                    json!({
                        "role": match m.role {
                            ChatRole::User => "user",
                            ChatRole::Assistant => "assistant",
                            ChatRole::System => "system",
                        },
                        "content": m.content,
                    })
                })
                .collect(),
        )
    }
}

/// Scope adapter exposing `input`, `chatHistory`, `secrets`, `error` and
/// every visible data-model field
pub struct ContextScope<'a> {
    ctx: &'a ElementExecutionContext,
}

impl Scope for ContextScope<'_> {
    fn get_var(&self, name: &str) -> Option<Value> {
        match name {
            "input" => Some(Value::String(self.ctx.user_message.to_string())),
            "chatHistory" => Some(self.ctx.history_json()),
            "secrets" => Some(self.ctx.secrets.to_json()),
            "error" => Some(
                self.ctx
                    .last_error
                    .as_ref()
                    .map(|e| Value::String(e.clone()))
                    .unwrap_or(Value::Null),
            ),
            _ => self.ctx.data.get(name),
        }
    }
}

/// Evaluate `{"$expr": code}` attribute values against a scope, leaving
/// literals untouched.
pub fn resolve_attributes(
    attributes: &Map<String, Value>,
    scope: &dyn Scope,
) -> Result<Map<String, Value>, ActionError> {
    let mut resolved = Map::with_capacity(attributes.len());
    for (name, value) in attributes {
        let resolved_value = match value.get("$expr").and_then(Value::as_str) {
            Some(code) => expr::parse_expression(code)
                .and_then(|e| expr::evaluate(&e, scope))
                .map_err(|e| ActionError::Expr(format!("attribute `{name}`: {e}")))?,
            None => value.clone(),
        };
        resolved.insert(name.clone(), resolved_value);
    }
    Ok(resolved)
}

// ============================================================================
// EXECUTOR TRAIT + REGISTRY
// ============================================================================

/// One action kind's implementation, with optional lifecycle hooks
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// Element subtype this executor handles (`llm`, `assign`, ...)
    fn kind(&self) -> &'static str;

    /// Called once per activation before `execute`
    async fn enter(&self, _ctx: &ElementExecutionContext) {}

    async fn execute(&self, ctx: &ElementExecutionContext) -> Result<StepValue, ActionError>;

    /// Called when the element is left, on success, failure or skip
    async fn exit(&self, _ctx: &ElementExecutionContext) {}
}

/// Dispatch table from element subtype to executor
pub struct ActionRegistry {
    executors: HashMap<&'static str, Arc<dyn ActionExecutor>>,
}

impl ActionRegistry {
    /// Registry with every built-in action kind
    pub fn builtin(provider: Arc<dyn Provider>) -> Self {
        let mut registry = Self { executors: HashMap::new() };
        registry.register(Arc::new(LlmAction { provider }));
        registry.register(Arc::new(AssignAction));
        registry.register(Arc::new(LogAction));
        registry.register(Arc::new(ScriptAction));
        registry.register(Arc::new(ToolcallAction));
        registry.register(Arc::new(SendAction));
        registry.register(Arc::new(InputAction));
        registry.register(Arc::new(OutputAction));
        registry
    }

    /// New action kinds are additive
    pub fn register(&mut self, executor: Arc<dyn ActionExecutor>) {
        self.executors.insert(executor.kind(), executor);
    }

    pub fn get(&self, kind: &str) -> Result<Arc<dyn ActionExecutor>, ActionError> {
        self.executors
            .get(kind)
            .cloned()
            .ok_or_else(|| ActionError::Unsupported(kind.to_string()))
    }
}

// ============================================================================
// BUILT-IN EXECUTORS
// ============================================================================

/// `llm`: one provider call, streaming chunks through the StepValue
struct LlmAction {
    provider: Arc<dyn Provider>,
}

#[async_trait]
impl ActionExecutor for LlmAction {
    fn kind(&self) -> &'static str {
        "llm"
    }

    async fn execute(&self, ctx: &ElementExecutionContext) -> Result<StepValue, ActionError> {
        let model = ctx
            .attr_str("model")
            .unwrap_or(crate::lower::DEFAULT_MODEL)
            .to_string();
        let prompt_template = ctx
            .attr_str("prompt")
            .map(str::to_string)
            .or_else(|| ctx.content.clone())
            .ok_or_else(|| ActionError::Invalid("<llm> has no prompt".to_string()))?;
        let prompt = ctx.resolve_template(&prompt_template);

        let mut request = PromptRequest::new(prompt, model);
        if let Some(system) = ctx.attr_str("system") {
            request = request.with_system_prompt(ctx.resolve_template(system));
        }
        if ctx.attributes.get("includeChatHistory").and_then(Value::as_bool).unwrap_or(true) {
            request = request.with_history(ctx.chat_history.as_ref().clone());
        }
        if !ctx.client_tools.is_empty() && self.provider.supports_tools() {
            request = request.with_tools(ctx.client_tools.as_ref().clone());
        }
        request.temperature = ctx
            .attributes
            .get("temperature")
            .and_then(Value::as_f64)
            .map(|t| t as f32);
        request.max_tokens = ctx
            .attributes
            .get("maxTokens")
            .and_then(Value::as_u64)
            .map(|t| t as u32);

        let stream = self
            .provider
            .execute_stream(request)
            .await
            .map_err(|e| ActionError::Provider(e.to_string()))?;
        Ok(StepValue::from_stream(ReplayableStream::from_stream(stream)))
    }
}

/// `assign`: write one data-model field
struct AssignAction;

#[async_trait]
impl ActionExecutor for AssignAction {
    fn kind(&self) -> &'static str {
        "assign"
    }

    async fn execute(&self, ctx: &ElementExecutionContext) -> Result<StepValue, ActionError> {
        let location = ctx
            .attr_str("location")
            .ok_or_else(|| ActionError::Invalid("<assign> requires `location`".to_string()))?;
        let value = match ctx.attributes.get("expr") {
            // `expr` attributes arrive already evaluated by resolve_attributes
            Some(value) => value.clone(),
            None => ctx
                .attributes
                .get("value")
                .cloned()
                .unwrap_or(Value::Null),
        };
        ctx.data.set(location, value)?;
        Ok(StepValue::empty())
    }
}

/// `log`: structured log line, no visible output
struct LogAction;

#[async_trait]
impl ActionExecutor for LogAction {
    fn kind(&self) -> &'static str {
        "log"
    }

    async fn execute(&self, ctx: &ElementExecutionContext) -> Result<StepValue, ActionError> {
        let label = ctx.attr_str("label").unwrap_or("log");
        let message = ctx
            .attr_str("message")
            .map(|m| ctx.resolve_template(m))
            .or_else(|| ctx.content.as_ref().map(|c| ctx.resolve_template(c)))
            .unwrap_or_default();
        let expr_value = ctx.attributes.get("expr").cloned();
        info!(
            run_id = %ctx.run_id,
            element = %ctx.element_id,
            label,
            value = ?expr_value,
            "{message}"
        );
        Ok(StepValue::empty())
    }
}

/// `script`: run restricted-language statements, committing locals that
/// name data-model fields
struct ScriptAction;

#[async_trait]
impl ActionExecutor for ScriptAction {
    fn kind(&self) -> &'static str {
        "script"
    }

    async fn execute(&self, ctx: &ElementExecutionContext) -> Result<StepValue, ActionError> {
        let code = ctx
            .content
            .as_deref()
            .ok_or_else(|| ActionError::Invalid("<script> has no code".to_string()))?;
        let statements = expr::parse_script(code).map_err(|e| ActionError::Expr(e.to_string()))?;
        let scope = ctx.scope();
        let (locals, last) =
            expr::run_script(&statements, &scope).map_err(|e| ActionError::Expr(e.to_string()))?;

        // Locals shadowing data-model fields write through
        for (name, value) in locals {
            if ctx.data.has(&name) {
                ctx.data.set(&name, value)?;
            }
        }
        Ok(match last {
            Some(value) => StepValue::from_object(value),
            None => StepValue::empty(),
        })
    }
}

/// `toolcall`: request a client-side tool invocation
struct ToolcallAction;

#[async_trait]
impl ActionExecutor for ToolcallAction {
    fn kind(&self) -> &'static str {
        "toolcall"
    }

    async fn execute(&self, ctx: &ElementExecutionContext) -> Result<StepValue, ActionError> {
        let tool = ctx
            .attr_str("tool")
            .ok_or_else(|| ActionError::Invalid("<toolcall> requires `tool`".to_string()))?;
        let arguments = ctx.attributes.get("args").cloned().unwrap_or(json!({}));
        let id = format!("{}:{}", ctx.run_id, ctx.element_id);
        Ok(StepValue::from_chunks(vec![StepChunk::ToolCall {
            id,
            name: tool.to_string(),
            arguments,
        }]))
    }
}

/// `send`: emit content into the run's output
struct SendAction;

#[async_trait]
impl ActionExecutor for SendAction {
    fn kind(&self) -> &'static str {
        "send"
    }

    async fn execute(&self, ctx: &ElementExecutionContext) -> Result<StepValue, ActionError> {
        let content = ctx
            .attr_str("content")
            .map(str::to_string)
            .or_else(|| ctx.content.clone())
            .unwrap_or_default();
        Ok(StepValue::from_text(ctx.resolve_template(&content)))
    }
}

/// `input`: bind the run's incoming user message
struct InputAction;

#[async_trait]
impl ActionExecutor for InputAction {
    fn kind(&self) -> &'static str {
        "input"
    }

    async fn execute(&self, ctx: &ElementExecutionContext) -> Result<StepValue, ActionError> {
        Ok(StepValue::from_text(ctx.user_message.to_string()))
    }
}

/// `output`: render the workflow's visible output
struct OutputAction;

#[async_trait]
impl ActionExecutor for OutputAction {
    fn kind(&self) -> &'static str {
        "output"
    }

    async fn execute(&self, ctx: &ElementExecutionContext) -> Result<StepValue, ActionError> {
        if let Some(value) = ctx.attributes.get("expr") {
            if ctx.attr_str("format") == Some("json") {
                return Ok(StepValue::from_object(value.clone()));
            }
            return Ok(StepValue::from_text(expr::stringify(value)));
        }
        let content = ctx.content.clone().unwrap_or_default();
        Ok(StepValue::from_text(ctx.resolve_template(&content)))
    }
}
