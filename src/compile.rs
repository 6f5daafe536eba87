//! Compile pipeline: source text → diagnostics + data model + element tree
//! + execution graph
//!
//! One facade over the stages so callers (CLI, server adapters, tests) see
//! a single entry point: recovery-parsing, attribute/expression validation,
//! data-model extraction, lowering/healing and graph building. Compilation
//! only hard-fails when the recovery budget is exhausted; every other
//! defect is a diagnostic on the (possibly degraded) result.

use thiserror::Error;

use crate::ast::AstNode;
use crate::datamodel::{extract_data_model, DataModelMap};
use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::element::ElementTree;
use crate::graph::ExecutionGraph;
use crate::lower::lower;
use crate::recovery::{parse_with_recovery, DEFAULT_MAX_ITERATIONS};
use crate::validate::validate_document;

/// Parse stage output: AST (None only on recovery exhaustion), diagnostics
/// and the extracted data model
#[derive(Debug)]
pub struct ParseResult {
    pub ast: Option<Vec<AstNode>>,
    pub diagnostics: Diagnostics,
    pub data_model: DataModelMap,
}

/// Fully compiled workflow, ready for the engine
#[derive(Debug)]
pub struct CompiledWorkflow {
    pub tree: ElementTree,
    pub graph: ExecutionGraph,
    pub data_model: DataModelMap,
    pub diagnostics: Diagnostics,
}

impl CompiledWorkflow {
    /// Error-severity diagnostics block a document from running
    pub fn is_runnable(&self) -> bool {
        !self.diagnostics.has_errors()
    }
}

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("syntax recovery failed: {}", first_message(.diagnostics))]
    Unrecoverable { diagnostics: Vec<Diagnostic> },
}

fn first_message(diagnostics: &[Diagnostic]) -> String {
    diagnostics
        .last()
        .map(|d| d.message.clone())
        .unwrap_or_else(|| "unknown error".to_string())
}

/// Pipeline configuration + entry points
#[derive(Debug, Clone)]
pub struct Compiler {
    max_recovery_iterations: usize,
}

impl Compiler {
    pub fn new() -> Self {
        Self { max_recovery_iterations: DEFAULT_MAX_ITERATIONS }
    }

    pub fn with_max_recovery(mut self, iterations: usize) -> Self {
        self.max_recovery_iterations = iterations;
        self
    }

    /// Parse + validate + extract. Always returns diagnostics; the AST is
    /// `None` only when recovery gave up.
    pub fn parse(&self, source: &str) -> ParseResult {
        let recovered = parse_with_recovery(source, self.max_recovery_iterations);
        let mut diagnostics = recovered.diagnostics;

        let Some(ast) = recovered.ast else {
            return ParseResult { ast: None, diagnostics, data_model: DataModelMap::new() };
        };

        let data_model = extract_data_model(&ast);
        validate_document(&ast, &data_model, &mut diagnostics);
        ParseResult { ast: Some(ast), diagnostics, data_model }
    }

    /// Full pipeline down to the execution graph.
    pub fn compile(&self, source: &str) -> Result<CompiledWorkflow, CompileError> {
        let parsed = self.parse(source);
        let mut diagnostics = parsed.diagnostics;
        let Some(ast) = parsed.ast else {
            return Err(CompileError::Unrecoverable { diagnostics: diagnostics.into_vec() });
        };

        let tree = lower(&ast, &mut diagnostics);
        let graph = ExecutionGraph::build(&tree);
        Ok(CompiledWorkflow { tree, graph, data_model: parsed.data_model, diagnostics })
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::Severity;

    #[test]
    fn end_to_end_compile() {
        let compiled = Compiler::new()
            .compile(r#"<workflow id="w"><state id="s"><llm model="m" prompt="hi"/></state></workflow>"#)
            .expect("compiles");

        // States [s, final, error], zero error-severity diagnostics
        let ids: Vec<_> = compiled
            .tree
            .child_states(compiled.tree.root_id())
            .into_iter()
            .map(|s| compiled.tree.get(s).id.clone())
            .collect();
        assert_eq!(ids, vec!["s", "final", "error"]);
        assert!(compiled.is_runnable(), "{:?}", compiled.diagnostics.as_slice());

        // s's single action transitions unconditionally to final
        let s = compiled.graph.find_by_id("s").expect("node");
        let action = compiled
            .graph
            .get(s.next.iter().find(|e| e.entry).expect("entry").target);
        assert!(compiled.graph.get(action.next[0].target).is_final);
    }

    #[test]
    fn recovered_documents_still_compile() {
        let compiled = Compiler::new()
            .compile(r#"<workflow id="w"><state id="s"></state>"#)
            .expect("recovered");
        assert!(compiled.tree.find_by_id("s").is_some());
        // The repair left a diagnostic
        assert!(!compiled.diagnostics.is_empty());
    }

    #[test]
    fn exhausted_recovery_is_a_hard_error() {
        let result = Compiler::new().with_max_recovery(0).compile("{a\n{b");
        assert!(matches!(result, Err(CompileError::Unrecoverable { .. })));
    }

    #[test]
    fn parse_result_carries_data_model() {
        let parsed = Compiler::new().parse(
            r#"<workflow id="w"><data id="score" type="number">3</data><state id="s"></state></workflow>"#,
        );
        assert!(parsed.ast.is_some());
        assert!(parsed.data_model["w"].contains_key("score"));
    }

    #[test]
    fn structural_errors_block_running_but_not_compiling() {
        let compiled = Compiler::new()
            .compile(r#"<workflow id="w"><state id="a"><transition target="ghost"/></state></workflow>"#)
            .expect("compiles with diagnostics");
        assert!(!compiled.is_runnable());
        assert!(compiled
            .diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error));
    }
}
