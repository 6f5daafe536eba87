//! Restricted expression mini-language
//!
//! Replaces "build a host-language function from a string" with a small
//! interpreted language: arithmetic, comparison, logic, property access,
//! ternaries, allow-listed constructor calls and a fixed set of value
//! methods. Guards, data-model `expr` sources and `script` elements all go
//! through this module — nothing here can reach the host environment.
//!
//! - `token` / `parse`: lexer and Pratt parser producing a closed AST
//! - `safety`: compile-time deny-list / allow-list validation
//! - `eval`: interpreter over `serde_json::Value` with caller-supplied scope

mod eval;
mod parse;
mod safety;
mod token;

pub use eval::{evaluate, is_truthy, run_script, stringify, Scope};
pub use parse::{parse_expression, parse_script, Expr, Stmt};
pub use safety::{validate_code_expression, ALLOWED_CONSTRUCTORS};

use thiserror::Error;

/// Errors from lexing, parsing or evaluating an expression
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExprError {
    #[error("lex error at offset {offset}: {message}")]
    Lex { message: String, offset: usize },

    #[error("parse error at offset {offset}: {message}")]
    Parse { message: String, offset: usize },

    #[error("evaluation error: {message}")]
    Eval { message: String },
}

impl ExprError {
    /// Byte offset within the expression code, when known
    pub fn offset(&self) -> Option<usize> {
        match self {
            ExprError::Lex { offset, .. } | ExprError::Parse { offset, .. } => Some(*offset),
            ExprError::Eval { .. } => None,
        }
    }
}

/// Resolve `${...}` interpolations in a template string against a scope.
/// Unresolvable segments are left verbatim so the failure is visible in the
/// output rather than silently dropped.
pub fn resolve_template(template: &str, scope: &dyn Scope) -> String {
    let mut result = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let code = &after[..end];
                match parse_expression(code).and_then(|expr| evaluate(&expr, scope)) {
                    Ok(value) => result.push_str(&stringify(&value)),
                    Err(_) => {
                        result.push_str("${");
                        result.push_str(code);
                        result.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                result.push_str(&rest[start..]);
                return result;
            }
        }
    }
    result.push_str(rest);
    result
}
