//! Scoped data model: extraction from the AST and the runtime registry
//!
//! Fields are declared by `<data>` elements and keyed by a dot-notation
//! scope path derived from the ids of enclosing workflow/state elements.
//! Scope paths form a tree isomorphic to the state nesting; reads walk
//! ancestor scopes by dot-segment prefix (most specific wins) and writes go
//! to the owning scope after schema and readonly checks. Each run owns its
//! own registry instance; the internal mutex makes concurrent parallel-branch
//! writes safe.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::ast::{AstNode, Prop, PropValue};
use crate::diagnostics::Position;
use crate::expr::{self, Scope};

/// Declared type of a data field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    #[default]
    String,
    Number,
    Boolean,
    Json,
}

impl FieldType {
    pub fn parse(name: &str) -> Self {
        match name {
            "number" => FieldType::Number,
            "boolean" => FieldType::Boolean,
            "json" => FieldType::Json,
            _ => FieldType::String,
        }
    }

    pub fn zero_value(self) -> Value {
        match self {
            FieldType::String => Value::String(String::new()),
            FieldType::Number => serde_json::json!(0),
            FieldType::Boolean => Value::Bool(false),
            FieldType::Json => Value::Null,
        }
    }

    pub fn accepts(self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Json => true,
        }
    }
}

/// Where a field's initial value comes from; exactly one source per field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum FieldSource {
    /// Bound to the run's incoming user message; forces readonly
    FromRequest,
    /// Fetched and parsed as JSON; falls back on failure
    Src { url: String },
    /// Evaluated against currently-resolved variables; falls back on failure
    Expr { code: String },
    /// Inline element content parsed as the declared type
    Inline { value: Value },
    /// No source: default value or the type's zero value
    Default,
}

/// Declaration of one data field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub field_type: FieldType,
    pub readonly: bool,
    pub from_request: bool,
    pub default_value: Option<Value>,
    pub schema: Option<Value>,
    pub source: FieldSource,
    pub position: Position,
}

impl FieldDefinition {
    fn fallback_value(&self) -> Value {
        self.default_value.clone().unwrap_or_else(|| self.field_type.zero_value())
    }
}

/// Extraction result: scope path → field name → definition
pub type DataModelMap = HashMap<String, HashMap<String, FieldDefinition>>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum DataModelError {
    #[error("unknown field `{field}` in scope `{scope}`")]
    UnknownField { field: String, scope: String },

    #[error("field `{field}` is readonly")]
    ReadonlyField { field: String },

    #[error("field `{field}` expects {expected:?}, got incompatible value")]
    TypeMismatch { field: String, expected: FieldType },

    #[error("field `{field}` failed schema validation: {details}")]
    SchemaFailed { field: String, details: String },
}

// ============================================================================
// EXTRACTION
// ============================================================================

/// Deterministic id for an element without an `id` attribute. The lowerer
/// uses the same numbering, so extracted scope paths match the element tree.
pub fn default_element_id(tag: &str, ordinal: usize) -> String {
    format!("{tag}_{ordinal}")
}

/// Tags that open a scope
fn is_scope_tag(tag: &str) -> bool {
    matches!(tag, "workflow" | "state" | "parallel" | "final")
}

/// Walk the AST collecting `<data>` declarations into scope-keyed tables.
pub fn extract_data_model(ast: &[AstNode]) -> DataModelMap {
    let mut model = DataModelMap::new();
    let mut counters: HashMap<String, usize> = HashMap::new();
    let mut scope_stack: Vec<String> = Vec::new();

    let has_workflow_root = ast.iter().any(|n| n.element_name() == Some("workflow"));
    if !has_workflow_root {
        // The healer will wrap everything in a synthetic root
        scope_stack.push("root".to_string());
    }

    walk(ast, &mut scope_stack, &mut counters, &mut model);
    model
}

fn walk(
    nodes: &[AstNode],
    scope_stack: &mut Vec<String>,
    counters: &mut HashMap<String, usize>,
    model: &mut DataModelMap,
) {
    for node in nodes {
        let AstNode::Element { name, attributes, children, position } = node else { continue };
        match name.as_str() {
            tag if is_scope_tag(tag) => {
                let id = attr_string(attributes, "id").unwrap_or_else(|| {
                    let n = counters.entry(tag.to_string()).or_insert(0);
                    *n += 1;
                    default_element_id(tag, *n)
                });
                scope_stack.push(id);
                walk(children, scope_stack, counters, model);
                scope_stack.pop();
            }
            "data" => {
                let Some(field_name) = attr_string(attributes, "id") else { continue };
                let scope = scope_stack.join(".");
                let definition = field_definition(attributes, children, *position);
                model.entry(scope).or_default().insert(field_name, definition);
            }
            // `datamodel` groups data declarations without opening a scope
            _ => walk(children, scope_stack, counters, model),
        }
    }
}

fn field_definition(attributes: &[Prop], children: &[AstNode], position: Position) -> FieldDefinition {
    let field_type = attr_string(attributes, "type")
        .map(|t| FieldType::parse(&t))
        .unwrap_or_default();
    let from_request = attr_flag(attributes, "fromRequest");
    let readonly = from_request || attr_flag(attributes, "readonly");

    let default_value = attributes
        .iter()
        .find(|p| p.name == "default")
        .map(|p| p.value.to_json());
    let schema = attributes.iter().find(|p| p.name == "schema").and_then(|p| match &p.value {
        PropValue::Object(v) => Some(v.clone()),
        _ => None,
    });

    // Exactly one value source, in priority order
    let source = if from_request {
        FieldSource::FromRequest
    } else if let Some(url) = attr_string(attributes, "src") {
        FieldSource::Src { url }
    } else if let Some(code) = attributes.iter().find_map(|p| match (&p.name[..], &p.value) {
        ("expr", PropValue::Expression(code)) => Some(code.clone()),
        ("expr", PropValue::String(code)) => Some(code.clone()),
        _ => None,
    }) {
        FieldSource::Expr { code }
    } else if let Some(value) = inline_content(children, field_type) {
        FieldSource::Inline { value }
    } else {
        FieldSource::Default
    };

    FieldDefinition {
        field_type,
        readonly,
        from_request,
        default_value,
        schema,
        source,
        position,
    }
}

/// Concatenated text content parsed as the declared type
fn inline_content(children: &[AstNode], field_type: FieldType) -> Option<Value> {
    let mut text = String::new();
    for child in children {
        if let AstNode::Text { value, .. } = child {
            text.push_str(value);
        }
    }
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    match field_type {
        FieldType::String => Some(Value::String(text.to_string())),
        FieldType::Number => text.parse::<f64>().ok().map(|n| serde_json::json!(n)),
        FieldType::Boolean => text.parse::<bool>().ok().map(Value::Bool),
        FieldType::Json => serde_json::from_str(text).ok(),
    }
}

fn attr_string(attributes: &[Prop], name: &str) -> Option<String> {
    attributes.iter().find(|p| p.name == name).and_then(|p| match &p.value {
        PropValue::String(s) => Some(s.clone()),
        PropValue::Number(n) => Some(expr::stringify(&serde_json::json!(n))),
        _ => None,
    })
}

fn attr_flag(attributes: &[Prop], name: &str) -> bool {
    attributes
        .iter()
        .find(|p| p.name == name)
        .map(|p| matches!(p.value, PropValue::Boolean(true)))
        .unwrap_or(false)
}

// ============================================================================
// REGISTRY
// ============================================================================

#[derive(Debug)]
struct FieldSlot {
    definition: FieldDefinition,
    value: Value,
}

#[derive(Debug, Default)]
struct RegistryInner {
    /// scope path → field name → slot
    scopes: HashMap<String, HashMap<String, FieldSlot>>,
}

/// Runtime variable store for one workflow run.
///
/// Cloning shares the underlying store; each run creates its own registry,
/// so nothing is shared across runs.
#[derive(Debug, Clone, Default)]
pub struct DataModelRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl DataModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a scope's field definitions with their fallback values.
    pub fn add_data_model(&self, scope: &str, fields: &HashMap<String, FieldDefinition>) {
        let mut inner = self.inner.lock();
        let table = inner.scopes.entry(scope.to_string()).or_default();
        for (name, definition) in fields {
            let value = definition.fallback_value();
            table.insert(name.clone(), FieldSlot { definition: definition.clone(), value });
        }
    }

    /// Populate every field from its declared source. `user_message` feeds
    /// `fromRequest` fields; `src` fetches fall back to defaults on failure.
    pub async fn initialize(&self, model: &DataModelMap, user_message: &str) {
        // Outer scopes first so `expr` sources can see ancestor fields
        let mut scopes: Vec<&String> = model.keys().collect();
        scopes.sort_by_key(|s| s.split('.').count());

        for scope in scopes {
            let fields = &model[scope];
            self.add_data_model(scope, fields);

            // `expr` sources evaluate against currently-resolved variables,
            // so they run after every other source in the scope
            let mut ordered: Vec<(&String, &FieldDefinition)> = fields.iter().collect();
            ordered.sort_by_key(|(name, definition)| {
                let rank = match definition.source {
                    FieldSource::Expr { .. } => 1,
                    _ => 0,
                };
                (rank, name.as_str())
            });

            for (name, definition) in ordered {
                let value = self.initial_value(definition, scope, user_message).await;
                if let Some(value) = value {
                    self.force_set(scope, name, value);
                }
            }
        }
    }

    async fn initial_value(
        &self,
        definition: &FieldDefinition,
        scope: &str,
        user_message: &str,
    ) -> Option<Value> {
        match &definition.source {
            FieldSource::FromRequest => Some(Value::String(user_message.to_string())),
            FieldSource::Inline { value } => Some(value.clone()),
            FieldSource::Default => None,
            FieldSource::Expr { code } => {
                let view = self.scoped(scope);
                match expr::parse_expression(code).and_then(|e| expr::evaluate(&e, &view)) {
                    Ok(value) if definition.field_type.accepts(&value) => Some(value),
                    Ok(_) | Err(_) => {
                        warn!(scope, code, "data expr failed, using fallback");
                        Some(definition.fallback_value())
                    }
                }
            }
            FieldSource::Src { url } => match fetch_json(url).await {
                Some(value) => Some(value),
                None => {
                    warn!(scope, url, "data src fetch failed, using fallback");
                    Some(definition.fallback_value())
                }
            },
        }
    }

    /// Write bypassing readonly checks; used only during initialization
    fn force_set(&self, scope: &str, field: &str, value: Value) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.scopes.get_mut(scope).and_then(|t| t.get_mut(field)) {
            slot.value = value;
        }
    }

    /// View of the registry as seen from `scope`
    pub fn scoped(&self, scope: &str) -> ScopedDataModel {
        ScopedDataModel { inner: Arc::clone(&self.inner), scope: scope.to_string() }
    }
}

async fn fetch_json(raw_url: &str) -> Option<Value> {
    let parsed = url::Url::parse(raw_url).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    let response = reqwest::get(parsed).await.ok()?;
    response.json::<Value>().await.ok()
}

/// Scope-resolving view over the registry: `has` / `get` / `set` / `to_json`.
///
/// Reads walk from the view's scope up through every registered ancestor
/// scope (dot-segment prefix matching, not substring matching), preferring
/// the most specific match. Writes resolve to the owning scope and validate
/// there.
#[derive(Debug, Clone)]
pub struct ScopedDataModel {
    inner: Arc<Mutex<RegistryInner>>,
    scope: String,
}

impl ScopedDataModel {
    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn has(&self, field: &str) -> bool {
        self.get(field).is_some()
    }

    pub fn get(&self, field: &str) -> Option<Value> {
        let inner = self.inner.lock();
        for scope in ancestor_chain(&self.scope) {
            if let Some(slot) = inner.scopes.get(scope).and_then(|t| t.get(field)) {
                return Some(slot.value.clone());
            }
        }
        None
    }

    /// Validate and commit a write to the field's owning scope.
    pub fn set(&self, field: &str, value: Value) -> Result<(), DataModelError> {
        let mut inner = self.inner.lock();
        for scope in ancestor_chain(&self.scope) {
            let Some(table) = inner.scopes.get_mut(scope) else { continue };
            let Some(slot) = table.get_mut(field) else { continue };

            if slot.definition.readonly || slot.definition.from_request {
                return Err(DataModelError::ReadonlyField { field: field.to_string() });
            }
            if !slot.definition.field_type.accepts(&value) {
                return Err(DataModelError::TypeMismatch {
                    field: field.to_string(),
                    expected: slot.definition.field_type,
                });
            }
            if let Some(schema) = &slot.definition.schema {
                validate_against_schema(field, schema, &value)?;
            }
            debug!(field, scope, "data model write");
            slot.value = value;
            return Ok(());
        }
        Err(DataModelError::UnknownField {
            field: field.to_string(),
            scope: self.scope.clone(),
        })
    }

    /// Merge every visible field into one object; ancestor values are
    /// shadowed by more specific scopes.
    pub fn to_json(&self) -> Value {
        let inner = self.inner.lock();
        let mut merged = Map::new();
        let chain: Vec<&str> = ancestor_chain(&self.scope).collect();
        // Outermost first so inner scopes overwrite on collision
        for scope in chain.into_iter().rev() {
            if let Some(table) = inner.scopes.get(scope) {
                for (name, slot) in table {
                    merged.insert(name.clone(), slot.value.clone());
                }
            }
        }
        Value::Object(merged)
    }
}

impl Scope for ScopedDataModel {
    fn get_var(&self, name: &str) -> Option<Value> {
        self.get(name)
    }
}

/// Scopes from most specific to the root: `a.b.c` → [`a.b.c`, `a.b`, `a`]
fn ancestor_chain(scope: &str) -> impl Iterator<Item = &str> {
    let mut current = Some(scope);
    std::iter::from_fn(move || {
        let scope = current?;
        current = scope.rfind('.').map(|i| &scope[..i]);
        Some(scope)
    })
}

fn validate_against_schema(field: &str, schema: &Value, value: &Value) -> Result<(), DataModelError> {
    let compiled = jsonschema::JSONSchema::compile(schema).map_err(|e| DataModelError::SchemaFailed {
        field: field.to_string(),
        details: format!("invalid schema: {e}"),
    })?;
    let errors: Vec<String> = match compiled.validate(value) {
        Ok(()) => Vec::new(),
        Err(iter) => iter.map(|e| e.to_string()).collect(),
    };
    if errors.is_empty() {
        Ok(())
    } else {
        Err(DataModelError::SchemaFailed {
            field: field.to_string(),
            details: errors.join("; "),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;
    use serde_json::json;

    fn field(field_type: FieldType) -> FieldDefinition {
        FieldDefinition {
            field_type,
            readonly: false,
            from_request: false,
            default_value: None,
            schema: None,
            source: FieldSource::Default,
            position: Position::default(),
        }
    }

    #[test]
    fn extraction_builds_scope_paths() {
        let src = r#"<workflow id="root"><data id="mood" type="string">happy</data><state id="auth"><data id="token" type="string" readonly/><state id="user"><data id="age" type="number">42</data></state></state></workflow>"#;
        let ast = parse(src).expect("parse");
        let model = extract_data_model(&ast);

        assert!(model["root"].contains_key("mood"));
        assert!(model["root.auth"].contains_key("token"));
        assert!(model["root.auth.user"].contains_key("age"));
        assert!(model["root.auth"]["token"].readonly);
        assert_eq!(
            model["root"]["mood"].source,
            FieldSource::Inline { value: json!("happy") }
        );
        assert_eq!(
            model["root.auth.user"]["age"].source,
            FieldSource::Inline { value: json!(42.0) }
        );
    }

    #[test]
    fn from_request_forces_readonly() {
        let src = r#"<workflow id="w"><data id="message" fromRequest/></workflow>"#;
        let ast = parse(src).expect("parse");
        let model = extract_data_model(&ast);
        let def = &model["w"]["message"];
        assert!(def.from_request);
        assert!(def.readonly);
        assert_eq!(def.source, FieldSource::FromRequest);
    }

    #[test]
    fn scope_inheritance_and_shadowing() {
        let registry = DataModelRegistry::new();
        let mut parent = HashMap::new();
        parent.insert("mood".to_string(), field(FieldType::String));
        registry.add_data_model("parent", &parent);

        let mut child = HashMap::new();
        child.insert("mood".to_string(), field(FieldType::String));
        registry.add_data_model("parent.child", &child);

        let parent_view = registry.scoped("parent");
        parent_view.set("mood", json!("calm")).expect("write");
        let child_view = registry.scoped("parent.child");
        child_view.set("mood", json!("wild")).expect("write");

        // The declaration at parent.child shadows parent for all of parent.child.*
        let grandchild = registry.scoped("parent.child.grandchild");
        assert_eq!(grandchild.get("mood"), Some(json!("wild")));
        assert_eq!(parent_view.get("mood"), Some(json!("calm")));

        // parent.child1 fields are not visible from parent.child2
        let mut child1 = HashMap::new();
        child1.insert("secret".to_string(), field(FieldType::String));
        registry.add_data_model("parent.child1", &child1);
        let child2 = registry.scoped("parent.child2");
        assert!(!child2.has("secret"));
        // ...and prefix matching is per dot segment, not substring
        let childish = registry.scoped("parent.child1x");
        assert!(!childish.has("secret"));
    }

    #[test]
    fn readonly_rejects_writes_without_mutation() {
        let registry = DataModelRegistry::new();
        let mut fields = HashMap::new();
        let mut def = field(FieldType::String);
        def.readonly = true;
        def.default_value = Some(json!("locked"));
        fields.insert("token".to_string(), def);
        registry.add_data_model("w", &fields);

        let view = registry.scoped("w");
        let err = view.set("token", json!("hax")).unwrap_err();
        assert!(matches!(err, DataModelError::ReadonlyField { .. }));
        assert_eq!(view.get("token"), Some(json!("locked")));
    }

    #[test]
    fn type_and_schema_validation_on_write() {
        let registry = DataModelRegistry::new();
        let mut fields = HashMap::new();
        fields.insert("count".to_string(), field(FieldType::Number));
        let mut json_field = field(FieldType::Json);
        json_field.schema = Some(json!({"type": "object", "required": ["name"]}));
        fields.insert("profile".to_string(), json_field);
        registry.add_data_model("w", &fields);

        let view = registry.scoped("w");
        assert!(matches!(
            view.set("count", json!("three")),
            Err(DataModelError::TypeMismatch { .. })
        ));
        assert!(view.set("count", json!(3)).is_ok());

        assert!(matches!(
            view.set("profile", json!({"age": 3})),
            Err(DataModelError::SchemaFailed { .. })
        ));
        assert!(view.set("profile", json!({"name": "Ada"})).is_ok());
    }

    #[test]
    fn unknown_field_write_fails() {
        let registry = DataModelRegistry::new();
        registry.add_data_model("w", &HashMap::new());
        let view = registry.scoped("w");
        assert!(matches!(
            view.set("ghost", json!(1)),
            Err(DataModelError::UnknownField { .. })
        ));
    }

    #[tokio::test]
    async fn initialize_resolves_sources() {
        let src = r#"<workflow id="w"><data id="message" fromRequest/><data id="greeting" type="string" expr={'Hello ' + message}/><data id="remote" type="number" src="not a url" default=7/></workflow>"#;
        let ast = parse(src).expect("parse");
        let model = extract_data_model(&ast);

        let registry = DataModelRegistry::new();
        registry.initialize(&model, "Ada").await;

        let view = registry.scoped("w");
        assert_eq!(view.get("message"), Some(json!("Ada")));
        assert_eq!(view.get("greeting"), Some(json!("Hello Ada")));
        // src fetch fails (invalid URL) and falls back to the default
        assert_eq!(view.get("remote"), Some(json!(7.0)));
    }

    #[test]
    fn to_json_merges_ancestors() {
        let registry = DataModelRegistry::new();
        let mut outer = HashMap::new();
        outer.insert("a".to_string(), field(FieldType::String));
        registry.add_data_model("w", &outer);
        let mut inner = HashMap::new();
        inner.insert("b".to_string(), field(FieldType::Number));
        registry.add_data_model("w.s", &inner);

        registry.scoped("w").set("a", json!("x")).expect("write");
        registry.scoped("w.s").set("b", json!(2)).expect("write");

        let merged = registry.scoped("w.s").to_json();
        assert_eq!(merged, json!({"a": "x", "b": 2}));
    }
}
