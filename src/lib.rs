//! AIML - compiler and state-machine runtime for agent workflows

pub mod actions;
pub mod ast;
pub mod compile;
pub mod datamodel;
pub mod diagnostics;
pub mod element;
pub mod engine;
pub mod event_log;
pub mod expr;
pub mod graph;
pub mod lower;
pub mod parser;
pub mod provider;
pub mod recovery;
pub mod step;
pub mod stream;
pub mod validate;

pub use actions::{ActionError, ActionExecutor, ActionRegistry, ElementExecutionContext, Secrets};
pub use compile::{CompileError, CompiledWorkflow, Compiler, ParseResult};
pub use datamodel::{DataModelRegistry, FieldDefinition, FieldType, ScopedDataModel};
pub use diagnostics::{codes, Diagnostic, Diagnostics, Position, Severity};
pub use element::{Element, ElementId, ElementTree, Role};
pub use engine::{Engine, EngineError, NodeStatus, RunHandle, RunInput, RunStatus, RunSummary};
pub use event_log::{Event, EventKind, EventLog};
pub use graph::{ExecutionGraph, ExecutionGraphElement, GraphNodeId};
pub use parser::SyntaxError;
pub use recovery::{parse_with_recovery, RecoveredParse};
pub use step::{StepChunk, StepValue, ToolCall, ToolResult};
pub use stream::{ReplayableStream, StreamReader, StreamState};
