//! Tree healer / lowerer: validated AST → role-typed element tree
//!
//! Lowering converts AST nodes into arena elements and repairs structurally
//! incomplete workflows:
//!   1. a missing `workflow` root is synthesized around the document
//!   2. bare paragraphs inside states become implicit single-call actions
//!   3. actions directly under the root are wrapped in a synthetic state
//!   4. missing `final` / `error` states are synthesized
//!   5. states without a conditionless transition get one (next sibling,
//!      then nearest ancestor's next sibling, then the final state)
//!   6. reachability from the initial state is checked by fixpoint; states
//!      never reached are reported (not auto-fixed)
//!
//! Healing is idempotent: running it on an already-healed tree changes
//! nothing.

use std::collections::{HashMap, HashSet, VecDeque};

use serde_json::{Map, Value};
use tracing::debug;

use crate::ast::{AstNode, Prop, PropValue};
use crate::datamodel::default_element_id;
use crate::diagnostics::{codes, Diagnostic, Diagnostics, Position};
use crate::element::{tag_spec, Element, ElementId, ElementTree, Role, TransitionDef};

/// Model used for implicit paragraph actions
pub const DEFAULT_MODEL: &str = "default";

/// Lower an AST into a healed element tree. Never fails: structural defects
/// become diagnostics and the best-effort tree is still returned.
pub fn lower(ast: &[AstNode], diagnostics: &mut Diagnostics) -> ElementTree {
    let mut ctx = Lowering {
        tree: ElementTree::new(),
        counters: HashMap::new(),
        implicit_states: 0,
        diagnostics,
    };

    let root = ctx.build_root(ast);
    ctx.heal_terminal_states(root);
    ctx.heal_transitions(root);
    ctx.check_reachability(root);
    ctx.tree.set_root(root);
    ctx.tree
}

struct Lowering<'d> {
    tree: ElementTree,
    /// Per-tag counters for elements without an `id`, matching the
    /// data-model extractor's numbering
    counters: HashMap<String, usize>,
    implicit_states: usize,
    diagnostics: &'d mut Diagnostics,
}

impl Lowering<'_> {
    // ------------------------------------------------------------------
    // construction
    // ------------------------------------------------------------------

    fn build_root(&mut self, ast: &[AstNode]) -> ElementId {
        let workflow = ast.iter().find_map(|n| match n {
            AstNode::Element { name, attributes, children, position } if name == "workflow" => {
                Some((attributes.as_slice(), children.as_slice(), *position))
            }
            _ => None,
        });

        match workflow {
            Some((attributes, children, position)) => {
                // Content outside the workflow root is not part of the machine
                for stray in ast.iter().filter(|n| {
                    n.element_name().map(|name| name != "workflow").unwrap_or(false)
                }) {
                    self.diagnostics.push(Diagnostic::warning(
                        codes::NESTED_WRAPPING,
                        "aiml-lower",
                        format!(
                            "<{}> outside the <workflow> root is ignored",
                            stray.element_name().unwrap_or_default()
                        ),
                        stray.position(),
                    ));
                }
                let root = self.insert_element(None, "workflow", attributes, position, false);
                self.build_children(root, children);
                root
            }
            None => {
                // Step 1: synthesize a root wrapping every top-level node
                debug!("no workflow root, synthesizing one");
                self.diagnostics.push(Diagnostic::warning(
                    codes::HEALED,
                    "aiml-lower",
                    "document has no <workflow> root; one was synthesized",
                    Position::default(),
                ));
                let mut attributes = Map::new();
                attributes.insert("id".to_string(), Value::String("root".to_string()));
                let root = self.insert_raw(None, "workflow", "root", attributes, Position::default(), true);
                self.build_children(root, ast);
                root
            }
        }
    }

    fn insert_element(
        &mut self,
        parent: Option<ElementId>,
        tag: &str,
        attributes: &[Prop],
        position: Position,
        synthesized: bool,
    ) -> ElementId {
        let id = attributes
            .iter()
            .find(|p| p.name == "id")
            .and_then(|p| p.as_str().map(str::to_string))
            .unwrap_or_else(|| {
                let n = self.counters.entry(tag.to_string()).or_insert(0);
                *n += 1;
                default_element_id(tag, *n)
            });
        let mut attr_map = Map::with_capacity(attributes.len());
        for prop in attributes {
            attr_map.insert(prop.name.clone(), prop.value.to_json());
        }
        self.insert_raw(parent, tag, &id, attr_map, position, synthesized)
    }

    fn insert_raw(
        &mut self,
        parent: Option<ElementId>,
        tag: &str,
        id: &str,
        attributes: Map<String, Value>,
        position: Position,
        synthesized: bool,
    ) -> ElementId {
        let spec = tag_spec(tag);
        let mut role = spec.map(|s| s.role).unwrap_or(Role::Action);
        let is_final = tag == "final";
        // The state with id `error` is the workflow's error state
        if role == Role::State && id == "error" && !is_final {
            role = Role::Error;
        }

        let index = self.tree.insert(Element {
            index: ElementId(0),
            parent,
            id: id.to_string(),
            key: String::new(),
            tag: tag.to_string(),
            role,
            element_type: tag.to_string(),
            attributes,
            transitions: Vec::new(),
            children: Vec::new(),
            content: None,
            is_final,
            synthesized,
            position,
        });
        self.tree.get_mut(index).key = format!("{tag}@{}", index.0);
        index
    }

    fn build_children(&mut self, parent: ElementId, nodes: &[AstNode]) {
        let parent_tag = self.tree.get(parent).tag.clone();
        let parent_is_root = self.tree.get(parent).parent.is_none();
        let container = matches!(parent_tag.as_str(), "workflow" | "state" | "parallel");

        let mut paragraph: Vec<&AstNode> = Vec::new();
        for node in nodes {
            match node {
                AstNode::Text { .. } | AstNode::Expression { .. } if container => {
                    if !node.is_whitespace_text() {
                        paragraph.push(node);
                    }
                }
                AstNode::Text { value, .. } => {
                    // Paragraphs elsewhere stay plain content on the parent
                    if !value.trim().is_empty() {
                        self.append_content(parent, value);
                    }
                }
                AstNode::Expression { code, .. } => {
                    self.append_content(parent, &format!("${{{code}}}"));
                }
                AstNode::Element { name, attributes, children, position } => {
                    self.flush_paragraph(parent, parent_is_root, &mut paragraph);
                    self.build_element(parent, parent_is_root, name, attributes, children, *position);
                }
                AstNode::Comment { .. } | AstNode::Import { .. } | AstNode::Frontmatter { .. } => {}
            }
        }
        self.flush_paragraph(parent, parent_is_root, &mut paragraph);
    }

    fn build_element(
        &mut self,
        parent: ElementId,
        parent_is_root: bool,
        name: &str,
        attributes: &[Prop],
        children: &[AstNode],
        position: Position,
    ) {
        match name {
            // Transitions fold into the parent state
            "transition" => {
                let Some(target) = attr_string(attributes, "target") else { return };
                let cond = attributes.iter().find_map(|p| match (&p.name[..], &p.value) {
                    ("cond", PropValue::String(s)) => Some(s.clone()),
                    ("cond", PropValue::Expression(code)) => Some(code.clone()),
                    _ => None,
                });
                let internal = attributes
                    .iter()
                    .any(|p| p.name == "internal" && matches!(p.value, PropValue::Boolean(true)));
                self.tree.get_mut(parent).transitions.push(TransitionDef {
                    target,
                    cond,
                    internal,
                    synthesized: false,
                    position,
                });
            }
            // Data declarations were consumed by the extractor
            "data" | "datamodel" => {}
            // Prompt content folds into the enclosing llm action
            "prompt" => {
                if self.tree.get(parent).tag == "llm" {
                    let template = build_template(children);
                    if !template.trim().is_empty() {
                        self.append_content(parent, &template);
                    }
                } else {
                    self.diagnostics.push(Diagnostic::error(
                        codes::NESTED_WRAPPING,
                        "aiml-lower",
                        "<prompt> is only allowed inside <llm>",
                        position,
                    ));
                }
            }
            _ => {
                self.check_allowed_child(parent, name, position);

                // Step 3: actions directly under the root get a synthetic state
                let spec_role = tag_spec(name).map(|s| s.role).unwrap_or(Role::Action);
                let effective_parent = if parent_is_root && spec_role != Role::State {
                    self.synthetic_wrapper_state(parent, position)
                } else {
                    parent
                };

                let element = self.insert_element(Some(effective_parent), name, attributes, position, false);
                self.build_children(element, children);

                // Leaf content accumulated from `<llm>prompt text</llm>` style
                // children gets normalized once
                if matches!(spec_role, Role::Action | Role::Output | Role::UserInput) {
                    if let Some(content) = &mut self.tree.get_mut(element).content {
                        let trimmed = content.trim().to_string();
                        *content = trimmed;
                    }
                }
            }
        }
    }

    fn check_allowed_child(&mut self, parent: ElementId, child_tag: &str, position: Position) {
        let parent_tag = self.tree.get(parent).tag.clone();
        let Some(parent_spec) = tag_spec(&parent_tag) else { return };
        if tag_spec(child_tag).is_some() && !parent_spec.allowed_children.contains(&child_tag) {
            self.diagnostics.push(Diagnostic::error(
                codes::NESTED_WRAPPING,
                "aiml-lower",
                format!("<{child_tag}> is not allowed inside <{parent_tag}>"),
                position,
            ));
        }
    }

    /// Synthetic state wrapping a run of root-level actions. Consecutive
    /// actions share one wrapper so their sequence is preserved.
    fn synthetic_wrapper_state(&mut self, root: ElementId, position: Position) -> ElementId {
        if let Some(&last) = self.tree.get(root).children.last() {
            let element = self.tree.get(last);
            if element.synthesized && element.role == Role::State && element.tag == "state" {
                return last;
            }
        }
        self.implicit_states += 1;
        let id = format!("implicit_state_{}", self.implicit_states);
        self.diagnostics.push(Diagnostic::warning(
            codes::HEALED,
            "aiml-lower",
            format!("action outside any state wrapped in synthetic state `{id}`"),
            position,
        ));
        self.insert_raw(Some(root), "state", &id, Map::new(), position, true)
    }

    /// Step 2: a paragraph directly inside a state becomes an implicit
    /// single-call action with the default model.
    fn flush_paragraph(
        &mut self,
        parent: ElementId,
        parent_is_root: bool,
        paragraph: &mut Vec<&AstNode>,
    ) {
        if paragraph.is_empty() {
            return;
        }
        let nodes: Vec<&AstNode> = paragraph.drain(..).collect();
        let template = build_template_refs(&nodes);
        if template.trim().is_empty() {
            return;
        }
        let position = nodes[0].position();

        let effective_parent = if parent_is_root {
            self.synthetic_wrapper_state(parent, position)
        } else {
            parent
        };

        let mut attributes = Map::new();
        attributes.insert("model".to_string(), Value::String(DEFAULT_MODEL.to_string()));
        let action = self.insert_raw(
            Some(effective_parent),
            "llm",
            &format!("implicit_llm_{}", self.tree.len()),
            attributes,
            position,
            true,
        );
        self.tree.get_mut(action).content = Some(template);
    }

    fn append_content(&mut self, element: ElementId, text: &str) {
        let content = &mut self.tree.get_mut(element).content;
        match content {
            Some(existing) => existing.push_str(text),
            None => *content = Some(text.to_string()),
        }
    }

    // ------------------------------------------------------------------
    // healing
    // ------------------------------------------------------------------

    /// Step 4: ensure the workflow has a final state and an error state.
    fn heal_terminal_states(&mut self, root: ElementId) {
        let has_final = self
            .tree
            .child_states(root)
            .iter()
            .any(|&s| self.tree.get(s).is_final);
        if !has_final {
            self.diagnostics.push(Diagnostic::warning(
                codes::HEALED,
                "aiml-lower",
                "workflow has no final state; `final` was synthesized",
                Position::default(),
            ));
            self.insert_raw(Some(root), "final", "final", Map::new(), Position::default(), true);
        }

        let has_error = self
            .tree
            .iter()
            .any(|e| e.role == Role::Error);
        if !has_error {
            self.diagnostics.push(Diagnostic::warning(
                codes::HEALED,
                "aiml-lower",
                "workflow has no error state; `error` was synthesized",
                Position::default(),
            ));
            self.insert_raw(Some(root), "state", "error", Map::new(), Position::default(), true);
        }
    }

    /// Step 5: every non-final state gets a conditionless way forward.
    fn heal_transitions(&mut self, root: ElementId) {
        let final_id = self
            .tree
            .child_states(root)
            .iter()
            .map(|&s| self.tree.get(s))
            .find(|e| e.is_final)
            .map(|e| e.id.clone())
            .unwrap_or_else(|| "final".to_string());

        let states: Vec<ElementId> = self
            .tree
            .iter()
            .filter(|e| e.is_state_like() && !e.is_final && e.parent.is_some())
            .map(|e| e.index)
            .collect();

        for state in states {
            if self.tree.get(state).default_transition().is_some() {
                continue;
            }
            let target = self
                .next_sibling_state(state)
                .unwrap_or_else(|| final_id.clone());
            let state_id = self.tree.get(state).id.clone();
            debug!(state = %state_id, target = %target, "synthesizing transition");
            self.diagnostics.push(Diagnostic::warning(
                codes::HEALED,
                "aiml-lower",
                format!("state `{state_id}` has no unconditional transition; `{target}` targeted"),
                self.tree.get(state).position,
            ));
            self.tree.get_mut(state).transitions.push(TransitionDef {
                target,
                cond: None,
                internal: false,
                synthesized: true,
                position: Position::default(),
            });
        }
    }

    /// Next sibling state, walking up through ancestors when the state is
    /// the last of its siblings.
    fn next_sibling_state(&self, state: ElementId) -> Option<String> {
        let mut current = state;
        loop {
            let parent = self.tree.get(current).parent?;
            let siblings = self.tree.child_states(parent);
            let position = siblings.iter().position(|&s| s == current);
            if let Some(next) = position.and_then(|i| siblings.get(i + 1)) {
                return Some(self.tree.get(*next).id.clone());
            }
            current = parent;
        }
    }

    // ------------------------------------------------------------------
    // reachability
    // ------------------------------------------------------------------

    /// Step 6: fixpoint propagation from the initial state through all
    /// transition edges plus hierarchical entry.
    fn check_reachability(&mut self, root: ElementId) {
        let by_id: HashMap<String, ElementId> = self
            .tree
            .iter()
            .filter(|e| e.is_state_like())
            .map(|e| (e.id.clone(), e.index))
            .collect();

        let mut reachable: HashSet<ElementId> = HashSet::new();
        let mut queue: VecDeque<ElementId> = VecDeque::new();

        if let Some(initial) = self.initial_state(root) {
            queue.push_back(initial);
        }
        // The error state is entered through runtime error routing
        if let Some(error) = self.tree.iter().find(|e| e.role == Role::Error) {
            queue.push_back(error.index);
        }

        let mut unknown_targets: Vec<(String, Position)> = Vec::new();
        while let Some(state) = queue.pop_front() {
            if !reachable.insert(state) {
                continue;
            }
            // Hierarchical entry: parallels enter every child, composites
            // enter their initial child
            let element = self.tree.get(state);
            if element.tag == "parallel" {
                for child in self.tree.child_states(state) {
                    queue.push_back(child);
                }
            } else if let Some(initial) = self.initial_state(state) {
                queue.push_back(initial);
            }
            // Transition edges
            for transition in &element.transitions {
                match by_id.get(&transition.target) {
                    Some(&target) => queue.push_back(target),
                    None => unknown_targets.push((transition.target.clone(), transition.position)),
                }
            }
        }

        for (target, position) in unknown_targets {
            self.diagnostics.push(Diagnostic::error(
                codes::TRANSITION_TARGET,
                "aiml-lower",
                format!("transition targets unknown state `{target}`"),
                position,
            ));
        }

        let unreachable: Vec<(String, Position)> = self
            .tree
            .iter()
            .filter(|e| {
                e.is_state_like()
                    && e.parent.is_some()
                    && !e.synthesized
                    && !reachable.contains(&e.index)
            })
            .map(|e| (e.id.clone(), e.position))
            .collect();
        for (id, position) in unreachable {
            self.diagnostics.push(Diagnostic::error(
                codes::UNREACHABLE_STATE,
                "aiml-lower",
                format!("state `{id}` is unreachable from the initial state"),
                position,
            ));
        }
    }

    /// Declared (or first-child-implied) initial state of a composite
    fn initial_state(&self, state: ElementId) -> Option<ElementId> {
        let element = self.tree.get(state);
        let children = self.tree.child_states(state);
        if let Some(initial) = element.attr_str("initial") {
            if let Some(&child) = children
                .iter()
                .find(|&&c| self.tree.get(c).id == initial)
            {
                return Some(child);
            }
        }
        // Skip synthesized terminals when picking the implied initial state
        children
            .iter()
            .copied()
            .find(|&c| {
                let e = self.tree.get(c);
                !(e.synthesized && (e.is_final || e.role == Role::Error))
            })
            .or_else(|| children.first().copied())
    }
}

fn attr_string(attributes: &[Prop], name: &str) -> Option<String> {
    attributes
        .iter()
        .find(|p| p.name == name)
        .and_then(|p| p.as_str().map(str::to_string))
}

/// Text/expression children rendered as one `${...}` template string
fn build_template(nodes: &[AstNode]) -> String {
    let refs: Vec<&AstNode> = nodes.iter().collect();
    build_template_refs(&refs)
}

fn build_template_refs(nodes: &[&AstNode]) -> String {
    let mut template = String::new();
    for node in nodes {
        match node {
            AstNode::Text { value, .. } => template.push_str(value),
            AstNode::Expression { code, .. } => {
                template.push_str("${");
                template.push_str(code);
                template.push('}');
            }
            _ => {}
        }
    }
    template.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn lower_src(src: &str) -> (ElementTree, Diagnostics) {
        let ast = parse(src).expect("parse");
        let mut diagnostics = Diagnostics::new();
        let tree = lower(&ast, &mut diagnostics);
        (tree, diagnostics)
    }

    fn state_ids(tree: &ElementTree) -> Vec<String> {
        tree.child_states(tree.root_id())
            .into_iter()
            .map(|s| tree.get(s).id.clone())
            .collect()
    }

    #[test]
    fn end_to_end_minimal_workflow() {
        let (tree, diags) = lower_src(
            r#"<workflow id="w"><state id="s"><llm model="m" prompt="hi"/></state></workflow>"#,
        );
        assert_eq!(state_ids(&tree), vec!["s", "final", "error"]);
        let s = tree.find_by_id("s").expect("state s");
        let transition = s.default_transition().expect("healed transition");
        assert_eq!(transition.target, "final");
        assert!(!diags.has_errors(), "{:?}", diags.as_slice());
    }

    #[test]
    fn healing_adds_sibling_chain() {
        let (tree, _) =
            lower_src(r#"<workflow id="w"><state id="a"></state><state id="b"></state></workflow>"#);
        assert_eq!(
            tree.find_by_id("a").unwrap().default_transition().unwrap().target,
            "b"
        );
        assert_eq!(
            tree.find_by_id("b").unwrap().default_transition().unwrap().target,
            "final"
        );
    }

    #[test]
    fn healing_is_idempotent_per_tree() {
        let (tree, _) = lower_src(
            r#"<workflow id="w"><state id="a"></state><final id="done"/><state id="error"></state></workflow>"#,
        );
        // Author already has final + error: nothing extra synthesized
        let finals: Vec<_> = tree.iter().filter(|e| e.is_final).collect();
        assert_eq!(finals.len(), 1);
        let errors: Vec<_> = tree.iter().filter(|e| e.role == Role::Error).collect();
        assert_eq!(errors.len(), 1);
        // `a` has exactly one conditionless transition
        let a = tree.find_by_id("a").unwrap();
        assert_eq!(a.transitions.iter().filter(|t| t.cond.is_none()).count(), 1);
        assert_eq!(a.default_transition().unwrap().target, "done");
    }

    #[test]
    fn conditional_transitions_still_get_default() {
        let (tree, _) = lower_src(
            r#"<workflow id="w"><state id="a"><transition target="b" cond={score > 1}/></state><state id="b"></state><data id="score" type="number">0</data></workflow>"#,
        );
        let a = tree.find_by_id("a").unwrap();
        assert_eq!(a.transitions.len(), 2);
        assert!(a.transitions[0].cond.is_some());
        let fallback = a.default_transition().unwrap();
        assert!(fallback.synthesized);
        assert_eq!(fallback.target, "b");
    }

    #[test]
    fn explicit_default_transition_untouched() {
        let (tree, _) = lower_src(
            r#"<workflow id="w"><state id="a"><transition target="final"/></state><state id="b"></state></workflow>"#,
        );
        let a = tree.find_by_id("a").unwrap();
        assert_eq!(a.transitions.len(), 1);
        assert!(!a.transitions[0].synthesized);
    }

    #[test]
    fn paragraphs_become_implicit_actions() {
        let (tree, _) = lower_src(
            r#"<workflow id="w"><state id="s">Summarize {input} briefly.</state></workflow>"#,
        );
        let s = tree.find_by_id("s").unwrap();
        assert_eq!(s.children.len(), 1);
        let action = tree.get(s.children[0]);
        assert_eq!(action.tag, "llm");
        assert_eq!(action.role, Role::Action);
        assert_eq!(action.attr_str("model"), Some(DEFAULT_MODEL));
        assert_eq!(action.content.as_deref(), Some("Summarize ${input} briefly."));
    }

    #[test]
    fn root_level_actions_get_wrapped() {
        let (tree, diags) =
            lower_src(r#"<workflow id="w"><llm model="m" prompt="one"/><log message="two"/></workflow>"#);
        let states = state_ids(&tree);
        assert!(states[0].starts_with("implicit_state_"));
        let wrapper = tree.find_by_id(&states[0]).unwrap();
        // Both actions share one wrapper state
        assert_eq!(wrapper.children.len(), 2);
        assert!(diags.iter().any(|d| d.code == codes::HEALED));
    }

    #[test]
    fn missing_root_is_synthesized() {
        let (tree, diags) = lower_src(r#"<state id="s"></state>"#);
        assert_eq!(tree.root().id, "root");
        assert!(tree.root().synthesized);
        assert!(diags.iter().any(|d| d.message.contains("synthesized")));
    }

    #[test]
    fn unreachable_state_is_reported() {
        let (_, diags) = lower_src(
            r#"<workflow id="w"><state id="a"><transition target="final"/></state><state id="island"><transition target="final"/></state></workflow>"#,
        );
        let unreachable: Vec<_> = diags
            .iter()
            .filter(|d| d.code == codes::UNREACHABLE_STATE)
            .collect();
        assert_eq!(unreachable.len(), 1);
        assert!(unreachable[0].message.contains("island"));
    }

    #[test]
    fn reachable_chain_has_no_unreachable_diagnostics() {
        let (_, diags) = lower_src(
            r#"<workflow id="w"><state id="a"></state><state id="b"></state><state id="c"></state></workflow>"#,
        );
        assert!(diags.iter().all(|d| d.code != codes::UNREACHABLE_STATE));
    }

    #[test]
    fn unknown_transition_target_is_reported() {
        let (_, diags) = lower_src(
            r#"<workflow id="w"><state id="a"><transition target="ghost"/></state></workflow>"#,
        );
        assert!(diags.iter().any(|d| d.code == codes::TRANSITION_TARGET));
    }

    #[test]
    fn nested_states_and_scope_paths() {
        let (tree, _) = lower_src(
            r#"<workflow id="w"><state id="outer"><state id="inner"><llm model="m" prompt="p"/></state></state></workflow>"#,
        );
        let inner = tree.find_by_id("inner").unwrap();
        assert_eq!(tree.scope_path(inner.index), "w.outer.inner");
    }

    #[test]
    fn disallowed_child_is_nested_wrapping_error() {
        let (_, diags) = lower_src(
            r#"<workflow id="w"><state id="s"><llm model="m"><state id="bad"></state></llm></state></workflow>"#,
        );
        assert!(diags.iter().any(|d| d.code == codes::NESTED_WRAPPING));
    }

    #[test]
    fn prompt_child_folds_into_llm_content() {
        let (tree, _) = lower_src(
            r#"<workflow id="w"><state id="s"><llm model="m"><prompt>Say hi to {input}</prompt></llm></state></workflow>"#,
        );
        let s = tree.find_by_id("s").unwrap();
        let llm = tree.get(s.children[0]);
        assert_eq!(llm.content.as_deref(), Some("Say hi to ${input}"));
    }
}
