//! Role-typed element tree
//!
//! Elements live in an arena owned by [`ElementTree`]; parents are stored as
//! arena indices, so ancestry queries need no weak pointers and the tree is
//! acyclic by construction (built top-down from the AST, never re-linked).
//! The tree is created once per compiled workflow and is immutable during
//! execution.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::diagnostics::Position;

/// Execution role of an element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    State,
    Action,
    Error,
    UserInput,
    Output,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Role::State => "state",
            Role::Action => "action",
            Role::Error => "error",
            Role::UserInput => "user-input",
            Role::Output => "output",
        };
        write!(f, "{name}")
    }
}

/// Arena index of an element; stable for the life of the tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElementId(pub usize);

/// An outgoing transition extracted from a `<transition>` child
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionDef {
    pub target: String,
    /// Guard expression; `None` means unconditional
    pub cond: Option<String>,
    /// Internal transitions do not leave the current state
    pub internal: bool,
    /// Added by the healer rather than the author
    pub synthesized: bool,
    pub position: Position,
}

/// One node of the compiled workflow tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Element {
    pub index: ElementId,
    pub parent: Option<ElementId>,
    /// Author-declared or synthesized identifier, unique per document
    pub id: String,
    /// Stable cache key (`scope/tag#ordinal`), used by the graph builder
    pub key: String,
    pub tag: String,
    pub role: Role,
    /// Subtype within the role, e.g. `llm`, `assign` for actions
    pub element_type: String,
    /// Attributes as static JSON; expression values appear as `{"$expr": code}`
    pub attributes: Map<String, Value>,
    pub transitions: Vec<TransitionDef>,
    pub children: Vec<ElementId>,
    /// Concatenated text/expression content for leaf elements (prompt text,
    /// script code, log template)
    pub content: Option<String>,
    pub is_final: bool,
    /// Added by the healer rather than the author
    pub synthesized: bool,
    pub position: Position,
}

impl Element {
    pub fn attr_str(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).and_then(Value::as_str)
    }

    pub fn attr_bool(&self, name: &str) -> Option<bool> {
        self.attributes.get(name).and_then(Value::as_bool)
    }

    /// Expression code of an attribute written as `{...}`
    pub fn attr_expr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name)?.get("$expr")?.as_str()
    }

    /// First unconditional transition, if any
    pub fn default_transition(&self) -> Option<&TransitionDef> {
        self.transitions.iter().find(|t| t.cond.is_none())
    }

    pub fn is_state_like(&self) -> bool {
        matches!(self.role, Role::State | Role::Error)
    }
}

/// Arena-owned workflow tree; the root is always the `workflow` element
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElementTree {
    nodes: Vec<Element>,
    root: ElementId,
}

impl ElementTree {
    pub fn new() -> Self {
        Self { nodes: Vec::new(), root: ElementId(0) }
    }

    pub fn insert(&mut self, mut element: Element) -> ElementId {
        let id = ElementId(self.nodes.len());
        element.index = id;
        if let Some(parent) = element.parent {
            self.nodes[parent.0].children.push(id);
        }
        self.nodes.push(element);
        id
    }

    pub fn set_root(&mut self, root: ElementId) {
        self.root = root;
    }

    pub fn root(&self) -> &Element {
        &self.nodes[self.root.0]
    }

    pub fn root_id(&self) -> ElementId {
        self.root
    }

    pub fn get(&self, id: ElementId) -> &Element {
        &self.nodes[id.0]
    }

    pub fn get_mut(&mut self, id: ElementId) -> &mut Element {
        &mut self.nodes[id.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Element> {
        self.nodes.iter()
    }

    /// Walk from `id` to the root, excluding `id` itself
    pub fn ancestors(&self, id: ElementId) -> impl Iterator<Item = &Element> {
        let mut current = self.nodes[id.0].parent;
        std::iter::from_fn(move || {
            let element = &self.nodes[current?.0];
            current = element.parent;
            Some(element)
        })
    }

    /// Nearest ancestor with a state-like role (the enclosing state)
    pub fn enclosing_state(&self, id: ElementId) -> Option<&Element> {
        self.ancestors(id).find(|e| e.is_state_like())
    }

    /// Dot-joined ids of state-like ancestors, outermost first, including
    /// `id` itself when it is a state. This is the scope path.
    pub fn scope_path(&self, id: ElementId) -> String {
        let element = self.get(id);
        let mut parts: Vec<&str> = self
            .ancestors(id)
            .filter(|e| e.is_state_like())
            .map(|e| e.id.as_str())
            .collect();
        parts.reverse();
        if element.is_state_like() {
            parts.push(&element.id);
        }
        parts.join(".")
    }

    pub fn find_by_id(&self, element_id: &str) -> Option<&Element> {
        self.nodes.iter().find(|e| e.id == element_id)
    }

    /// Direct children with a state-like role
    pub fn child_states(&self, id: ElementId) -> Vec<ElementId> {
        self.get(id)
            .children
            .iter()
            .copied()
            .filter(|c| self.get(*c).is_state_like())
            .collect()
    }

    /// Direct children with the action/user-input/output roles, in order
    pub fn child_actions(&self, id: ElementId) -> Vec<ElementId> {
        self.get(id)
            .children
            .iter()
            .copied()
            .filter(|c| {
                matches!(self.get(*c).role, Role::Action | Role::UserInput | Role::Output)
            })
            .collect()
    }
}

impl Default for ElementTree {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TAG CATALOG
// ============================================================================

/// Static description of a known tag: its role and which child tags it may
/// contain. Lowering reports anything else as a nested-wrapping error.
#[derive(Debug)]
pub struct TagSpec {
    pub tag: &'static str,
    pub role: Role,
    /// May contain nested states / actions
    pub container: bool,
    pub allowed_children: &'static [&'static str],
}

const STATE_CHILDREN: &[&str] = &[
    "state", "parallel", "final", "transition", "datamodel", "data", "llm", "toolcall", "assign",
    "send", "log", "script", "input", "output",
];

const TAG_SPECS: &[TagSpec] = &[
    TagSpec {
        tag: "workflow",
        role: Role::State,
        container: true,
        allowed_children: STATE_CHILDREN,
    },
    TagSpec { tag: "state", role: Role::State, container: true, allowed_children: STATE_CHILDREN },
    TagSpec {
        tag: "parallel",
        role: Role::State,
        container: true,
        allowed_children: STATE_CHILDREN,
    },
    TagSpec {
        tag: "final",
        role: Role::State,
        container: true,
        allowed_children: &["output", "log", "data", "send"],
    },
    TagSpec { tag: "llm", role: Role::Action, container: false, allowed_children: &["prompt"] },
    TagSpec { tag: "toolcall", role: Role::Action, container: false, allowed_children: &[] },
    TagSpec { tag: "assign", role: Role::Action, container: false, allowed_children: &[] },
    TagSpec { tag: "send", role: Role::Action, container: false, allowed_children: &[] },
    TagSpec { tag: "log", role: Role::Action, container: false, allowed_children: &[] },
    TagSpec { tag: "script", role: Role::Action, container: false, allowed_children: &[] },
    TagSpec { tag: "input", role: Role::UserInput, container: false, allowed_children: &[] },
    TagSpec { tag: "output", role: Role::Output, container: false, allowed_children: &[] },
];

pub fn tag_spec(tag: &str) -> Option<&'static TagSpec> {
    TAG_SPECS.iter().find(|s| s.tag == tag)
}
