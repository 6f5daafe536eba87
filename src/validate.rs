//! Attribute and expression validation
//!
//! Layered checks over the AST before lowering:
//! 1. per-tag attribute schemas (JSON Schema, compiled once)
//! 2. embedded `script` content parsed (never executed) by the restricted
//!    script parser
//! 3. every expression attribute and expression block checked by the
//!    expression safety validator against the variables visible at its scope
//!
//! Unknown tags pass through unvalidated so custom elements stay possible.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use serde_json::{json, Map, Value};

use crate::ast::{AstNode, Prop, PropValue};
use crate::datamodel::{default_element_id, DataModelMap};
use crate::diagnostics::{codes, Diagnostic, Diagnostics, Position};
use crate::expr;

/// Variables always visible to expressions regardless of data model.
/// `error` carries the routed failure message inside the error state.
pub const BUILTIN_VARS: &[&str] = &["input", "chatHistory", "secrets", "error"];

/// Value that is either a literal of the given type or an `{...}` expression
fn literal_or_expr(literal: Value) -> Value {
    json!({ "anyOf": [literal, { "type": "object", "required": ["$expr"] }] })
}

static TAG_SCHEMAS: Lazy<HashMap<&'static str, Value>> = Lazy::new(|| {
    let string_or_expr = || literal_or_expr(json!({ "type": "string" }));
    let number_or_expr = || literal_or_expr(json!({ "type": "number" }));

    let mut schemas = HashMap::new();
    schemas.insert(
        "workflow",
        json!({
            "type": "object",
            "properties": {
                "id": { "type": "string" },
                "initial": { "type": "string" },
                "version": { "type": "string" },
            },
            "additionalProperties": false,
        }),
    );
    schemas.insert(
        "state",
        json!({
            "type": "object",
            "properties": {
                "id": { "type": "string" },
                "initial": { "type": "string" },
            },
            "additionalProperties": false,
        }),
    );
    schemas.insert(
        "parallel",
        json!({
            "type": "object",
            "properties": { "id": { "type": "string" } },
            "additionalProperties": false,
        }),
    );
    schemas.insert(
        "final",
        json!({
            "type": "object",
            "properties": { "id": { "type": "string" } },
            "additionalProperties": false,
        }),
    );
    schemas.insert(
        "transition",
        json!({
            "type": "object",
            "properties": {
                "target": { "type": "string" },
                "cond": literal_or_expr(json!({ "type": "string" })),
                "event": { "type": "string" },
                "internal": { "type": "boolean" },
            },
            "required": ["target"],
            "additionalProperties": false,
        }),
    );
    schemas.insert(
        "data",
        json!({
            "type": "object",
            "properties": {
                "id": { "type": "string" },
                "type": { "enum": ["string", "number", "boolean", "json"] },
                "readonly": { "type": "boolean" },
                "fromRequest": { "type": "boolean" },
                "src": { "type": "string" },
                "expr": {},
                "default": {},
                "schema": { "type": "object" },
            },
            "required": ["id"],
            "additionalProperties": false,
        }),
    );
    schemas.insert("datamodel", json!({ "type": "object", "additionalProperties": false }));
    schemas.insert(
        "llm",
        json!({
            "type": "object",
            "properties": {
                "id": { "type": "string" },
                "when": literal_or_expr(json!({ "type": "string" })),
                "model": string_or_expr(),
                "prompt": string_or_expr(),
                "system": string_or_expr(),
                "temperature": number_or_expr(),
                "maxTokens": number_or_expr(),
                "stream": { "type": "boolean" },
                "includeChatHistory": { "type": "boolean" },
            },
            "required": ["model"],
            "additionalProperties": false,
        }),
    );
    schemas.insert(
        "toolcall",
        json!({
            "type": "object",
            "properties": {
                "id": { "type": "string" },
                "when": literal_or_expr(json!({ "type": "string" })),
                "tool": { "type": "string" },
                "args": literal_or_expr(json!({ "type": "object" })),
            },
            "required": ["tool"],
            "additionalProperties": false,
        }),
    );
    schemas.insert(
        "assign",
        json!({
            "type": "object",
            "properties": {
                "id": { "type": "string" },
                "when": literal_or_expr(json!({ "type": "string" })),
                "location": { "type": "string" },
                "expr": {},
                "value": {},
            },
            "required": ["location"],
            "additionalProperties": false,
        }),
    );
    schemas.insert(
        "send",
        json!({
            "type": "object",
            "properties": {
                "id": { "type": "string" },
                "when": literal_or_expr(json!({ "type": "string" })),
                "event": { "type": "string" },
                "target": { "type": "string" },
                "content": string_or_expr(),
            },
            "additionalProperties": false,
        }),
    );
    schemas.insert(
        "log",
        json!({
            "type": "object",
            "properties": {
                "id": { "type": "string" },
                "when": literal_or_expr(json!({ "type": "string" })),
                "label": { "type": "string" },
                "expr": {},
                "message": string_or_expr(),
            },
            "additionalProperties": false,
        }),
    );
    schemas.insert(
        "script",
        json!({
            "type": "object",
            "properties": {
                "id": { "type": "string" },
                "when": literal_or_expr(json!({ "type": "string" })),
                "language": { "enum": ["javascript"] },
            },
            "additionalProperties": false,
        }),
    );
    schemas.insert(
        "input",
        json!({
            "type": "object",
            "properties": {
                "id": { "type": "string" },
                "when": literal_or_expr(json!({ "type": "string" })),
                "prompt": string_or_expr(),
            },
            "additionalProperties": false,
        }),
    );
    schemas.insert(
        "output",
        json!({
            "type": "object",
            "properties": {
                "id": { "type": "string" },
                "when": literal_or_expr(json!({ "type": "string" })),
                "format": { "enum": ["text", "json"] },
                "expr": {},
            },
            "additionalProperties": false,
        }),
    );
    schemas.insert("prompt", json!({ "type": "object", "additionalProperties": false }));
    schemas
});

/// Attributes rendered as a JSON object for schema validation
fn attributes_object(attributes: &[Prop]) -> Value {
    let mut map = Map::with_capacity(attributes.len());
    for prop in attributes {
        map.insert(prop.name.clone(), prop.value.to_json());
    }
    Value::Object(map)
}

/// Validate one element's attributes against its tag schema. Unknown tags
/// pass. Failures add a single `ATTR001` error naming the tag.
pub fn validate_attributes(
    tag: &str,
    attributes: &[Prop],
    position: Position,
    diagnostics: &mut Diagnostics,
) {
    let Some(schema) = TAG_SCHEMAS.get(tag) else { return };
    let compiled = match jsonschema::JSONSchema::compile(schema) {
        Ok(compiled) => compiled,
        Err(e) => {
            diagnostics.push(Diagnostic::error(
                codes::ATTR_SCHEMA,
                "aiml-validator",
                format!("internal schema for <{tag}> failed to compile: {e}"),
                position,
            ));
            return;
        }
    };

    let instance = attributes_object(attributes);
    let errors: Vec<String> = match compiled.validate(&instance) {
        Ok(()) => Vec::new(),
        Err(iter) => iter.map(|e| e.to_string()).collect(),
    };
    if !errors.is_empty() {
        diagnostics.push(Diagnostic::error(
            codes::ATTR_SCHEMA,
            "aiml-validator",
            format!("<{tag}> attributes invalid: {}", errors.join("; ")),
            position,
        ));
    }
}

/// Validate the whole document: attribute schemas, script contents and
/// expression safety, with data-model fields feeding the allowed variables
/// per scope.
pub fn validate_document(ast: &[AstNode], data_model: &DataModelMap, diagnostics: &mut Diagnostics) {
    let mut counters: HashMap<String, usize> = HashMap::new();
    let mut scope_stack: Vec<String> = Vec::new();
    let has_workflow_root = ast.iter().any(|n| n.element_name() == Some("workflow"));
    if !has_workflow_root {
        scope_stack.push("root".to_string());
    }
    walk(ast, data_model, &mut scope_stack, &mut counters, diagnostics);
}

fn walk(
    nodes: &[AstNode],
    data_model: &DataModelMap,
    scope_stack: &mut Vec<String>,
    counters: &mut HashMap<String, usize>,
    diagnostics: &mut Diagnostics,
) {
    for node in nodes {
        match node {
            AstNode::Element { name, attributes, children, position } => {
                validate_attributes(name, attributes, *position, diagnostics);

                let allowed = allowed_vars(data_model, scope_stack);
                let allowed_refs: Vec<&str> = allowed.iter().map(String::as_str).collect();
                for prop in attributes {
                    validate_prop_expression(name, prop, &allowed_refs, diagnostics);
                }

                if name == "script" {
                    validate_script(attributes, children, *position, diagnostics);
                    continue;
                }

                let opens_scope = matches!(name.as_str(), "workflow" | "state" | "parallel" | "final");
                if opens_scope {
                    let id = attributes
                        .iter()
                        .find(|p| p.name == "id")
                        .and_then(|p| p.as_str().map(str::to_string))
                        .unwrap_or_else(|| {
                            let n = counters.entry(name.clone()).or_insert(0);
                            *n += 1;
                            default_element_id(name, *n)
                        });
                    scope_stack.push(id);
                    walk(children, data_model, scope_stack, counters, diagnostics);
                    scope_stack.pop();
                } else {
                    walk(children, data_model, scope_stack, counters, diagnostics);
                }
            }
            AstNode::Expression { code, position } => {
                let allowed = allowed_vars(data_model, scope_stack);
                let allowed_refs: Vec<&str> = allowed.iter().map(String::as_str).collect();
                if let Err(message) = expr::validate_code_expression(code, &allowed_refs, false) {
                    diagnostics.push(Diagnostic::error(
                        codes::ATTR_SCHEMA,
                        "aiml-validator",
                        format!("invalid expression: {message}"),
                        *position,
                    ));
                }
            }
            AstNode::Text { .. }
            | AstNode::Comment { .. }
            | AstNode::Import { .. }
            | AstNode::Frontmatter { .. } => {}
        }
    }
}

/// Expression attributes go through the code safety validator
fn validate_prop_expression(
    tag: &str,
    prop: &Prop,
    allowed: &[&str],
    diagnostics: &mut Diagnostics,
) {
    let PropValue::Expression(code) = &prop.value else { return };
    if let Err(message) = expr::validate_code_expression(code, allowed, false) {
        diagnostics.push(Diagnostic::error(
            codes::ATTR_SCHEMA,
            "aiml-validator",
            format!("<{tag} {}={{...}}> invalid expression: {message}", prop.name),
            prop.position,
        ));
    }
}

/// `script` elements need non-empty code that parses in the restricted
/// script language. Diagnostics point at the code node, not the tag.
fn validate_script(
    attributes: &[Prop],
    children: &[AstNode],
    tag_position: Position,
    diagnostics: &mut Diagnostics,
) {
    let _language = attributes
        .iter()
        .find(|p| p.name == "language")
        .and_then(|p| p.as_str())
        .unwrap_or("javascript");

    let code_node = children.iter().find(|c| matches!(c, AstNode::Text { .. }));
    let (code, code_position) = match code_node {
        Some(AstNode::Text { value, position }) => (value.as_str(), *position),
        _ => ("", tag_position),
    };

    if code.trim().is_empty() {
        diagnostics.push(Diagnostic::error(
            codes::SCRIPT_SYNTAX,
            "aiml-validator",
            "<script> requires non-empty code content",
            tag_position,
        ));
        return;
    }

    // Syntax-only parse; the script is never executed here
    if let Err(e) = expr::parse_script(code) {
        diagnostics.push(Diagnostic::error(
            codes::SCRIPT_SYNTAX,
            "aiml-validator",
            format!("script syntax error: {e}"),
            code_position,
        ));
    }
}

/// Builtins plus every field visible from the current scope
fn allowed_vars(data_model: &DataModelMap, scope_stack: &[String]) -> Vec<String> {
    let mut allowed: Vec<String> = BUILTIN_VARS.iter().map(|s| s.to_string()).collect();
    let scope = scope_stack.join(".");
    for (declared_scope, fields) in data_model {
        if scope == *declared_scope || scope.starts_with(&format!("{declared_scope}.")) {
            allowed.extend(fields.keys().cloned());
        }
    }
    allowed
}
