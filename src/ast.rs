//! AST node types produced by the grammar parser
//!
//! Closed tagged unions — every consumer matches exhaustively, so an
//! unhandled node kind is a compile error, not a runtime surprise.
//! Nodes are created once per parse and are immutable afterwards; the
//! recovery loop mutates the source text, never the AST.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::diagnostics::Position;

/// One parsed node of an AIML document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AstNode {
    /// Literal text content (entity-unescaped)
    Text { value: String, position: Position },
    /// `<!-- ... -->`
    Comment { value: String, position: Position },
    /// A known element with its ordered attribute list and children
    Element {
        name: String,
        attributes: Vec<Prop>,
        children: Vec<AstNode>,
        position: Position,
    },
    /// `import name from "path"`
    Import {
        binding: String,
        path: String,
        position: Position,
    },
    /// `{ ... }` expression block, raw code preserved
    Expression { code: String, position: Position },
    /// Leading `--- ... ---` YAML header
    Frontmatter {
        entries: Vec<(String, Value)>,
        position: Position,
    },
}

impl AstNode {
    pub fn position(&self) -> Position {
        match self {
            AstNode::Text { position, .. }
            | AstNode::Comment { position, .. }
            | AstNode::Element { position, .. }
            | AstNode::Import { position, .. }
            | AstNode::Expression { position, .. }
            | AstNode::Frontmatter { position, .. } => *position,
        }
    }

    /// Element name if this node is an element
    pub fn element_name(&self) -> Option<&str> {
        match self {
            AstNode::Element { name, .. } => Some(name),
            _ => None,
        }
    }

    pub fn is_whitespace_text(&self) -> bool {
        matches!(self, AstNode::Text { value, .. } if value.trim().is_empty())
    }
}

/// A named attribute with typed content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prop {
    pub name: String,
    pub value: PropValue,
    pub position: Position,
}

impl Prop {
    pub fn new(name: impl Into<String>, value: PropValue, position: Position) -> Self {
        Self { name: name.into(), value, position }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.value {
            PropValue::String(s) => Some(s),
            _ => None,
        }
    }
}

/// Typed attribute content. Expression blocks whose code is a JSON literal
/// are folded to `Object`/`Array` at parse time; arrow functions are kept
/// as `Function`; everything else stays raw `Expression` code for the
/// validator and the runtime interpreter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PropValue {
    String(String),
    Number(f64),
    Boolean(bool),
    Object(Value),
    Array(Value),
    Expression(String),
    Function(String),
}

impl PropValue {
    /// Classify raw `{...}` code into a typed prop value
    pub fn from_expression_code(code: &str) -> Self {
        let trimmed = code.trim();
        if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
            match value {
                Value::Object(_) => return PropValue::Object(value),
                Value::Array(_) => return PropValue::Array(value),
                Value::Number(n) => {
                    return PropValue::Number(n.as_f64().unwrap_or_default());
                }
                Value::Bool(b) => return PropValue::Boolean(b),
                Value::String(s) => return PropValue::String(s),
                Value::Null => {}
            }
        }
        if is_arrow_function(trimmed) {
            PropValue::Function(trimmed.to_string())
        } else {
            PropValue::Expression(trimmed.to_string())
        }
    }

    /// Static JSON rendering; expression and function content keeps its code
    /// under a `$expr`/`$fn` wrapper so schema validation can pass it through.
    pub fn to_json(&self) -> Value {
        match self {
            PropValue::String(s) => Value::String(s.clone()),
            PropValue::Number(n) => serde_json::json!(n),
            PropValue::Boolean(b) => Value::Bool(*b),
            PropValue::Object(v) | PropValue::Array(v) => v.clone(),
            PropValue::Expression(code) => serde_json::json!({ "$expr": code }),
            PropValue::Function(code) => serde_json::json!({ "$fn": code }),
        }
    }
}

fn is_arrow_function(code: &str) -> bool {
    // `(a, b) => ...` or `x => ...`
    if let Some(arrow) = code.find("=>") {
        let head = code[..arrow].trim();
        !head.is_empty()
            && (head.starts_with('(') && head.ends_with(')')
                || head.chars().all(|c| c.is_alphanumeric() || c == '_'))
    } else {
        false
    }
}

/// Find the first element with the given name, depth-first
pub fn find_element<'a>(nodes: &'a [AstNode], name: &str) -> Option<&'a AstNode> {
    for node in nodes {
        if let AstNode::Element { name: n, children, .. } = node {
            if n == name {
                return Some(node);
            }
            if let Some(found) = find_element(children, name) {
                return Some(found);
            }
        }
    }
    None
}
