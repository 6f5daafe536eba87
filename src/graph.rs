//! Execution graph builder: element tree → deduplicated runnable graph
//!
//! A memoized traversal produces one graph node per distinct `(id, key)`
//! pair, so a state targeted by many transitions (the shared final state,
//! typically) exists once. The memo cache lives in the builder and is
//! scoped to a single build call; nothing global survives it. The graph is
//! an arena with index edges, which also makes transition cycles (loops
//! back to earlier states) representable without reference counting.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::element::{Element, ElementId, ElementTree, Role};

/// Arena index of a graph node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct GraphNodeId(pub usize);

/// Outgoing edge with an optional guard
#[derive(Debug, Clone, Serialize)]
pub struct GraphEdge {
    pub target: GraphNodeId,
    /// Guard expression evaluated against the data-model view; `None`
    /// means unconditional
    pub when: Option<String>,
    /// Internal edges fire without leaving the current state
    pub internal: bool,
    /// Entry edges descend into the node's own body (first action or
    /// initial child); they are not transitions
    pub entry: bool,
}

impl GraphEdge {
    fn transition(target: GraphNodeId, when: Option<String>, internal: bool) -> Self {
        Self { target, when, internal, entry: false }
    }

    fn entry(target: GraphNodeId) -> Self {
        Self { target, when: None, internal: false, entry: true }
    }
}

/// One runnable node of the execution graph
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionGraphElement {
    pub id: String,
    pub key: String,
    pub kind: Role,
    /// Subtype within the role (`llm`, `assign`, `state`, ...)
    pub sub_type: String,
    pub attributes: Map<String, Value>,
    pub content: Option<String>,
    /// Guard for the node itself (`when` attribute); a falsy guard skips it
    pub when: Option<String>,
    /// Ids of nodes that must complete before this one starts
    pub run_after: Vec<String>,
    /// Sequential successors (actions chain, then transition edges)
    pub next: Vec<GraphEdge>,
    /// Concurrent branch entry points (parallel states only)
    pub parallel: Vec<GraphNodeId>,
    /// Element backing this node
    pub element: ElementId,
    pub is_final: bool,
}

/// Deduplicated execution graph for one compiled workflow
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionGraph {
    nodes: Vec<ExecutionGraphElement>,
    entry: GraphNodeId,
}

impl ExecutionGraph {
    /// Build the graph from a healed element tree.
    pub fn build(tree: &ElementTree) -> Self {
        let mut builder = Builder { tree, nodes: Vec::new(), cache: HashMap::new() };
        let entry = builder.state_node(tree.root_id());
        ExecutionGraph { nodes: builder.nodes, entry }
    }

    pub fn entry(&self) -> GraphNodeId {
        self.entry
    }

    pub fn get(&self, id: GraphNodeId) -> &ExecutionGraphElement {
        &self.nodes[id.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExecutionGraphElement> {
        self.nodes.iter()
    }

    pub fn find_by_id(&self, id: &str) -> Option<&ExecutionGraphElement> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Graph node backed by the given element, if one was built
    pub fn node_for_element(&self, element: ElementId) -> Option<GraphNodeId> {
        self.nodes.iter().position(|n| n.element == element).map(GraphNodeId)
    }
}

/// Build-scoped state: arena plus the `(id, key)` memo cache
struct Builder<'t> {
    tree: &'t ElementTree,
    nodes: Vec<ExecutionGraphElement>,
    cache: HashMap<(String, String), GraphNodeId>,
}

impl Builder<'_> {
    /// Node for a state-like element, memoized. The node is inserted into
    /// the cache before recursing so transition cycles terminate.
    fn state_node(&mut self, element_id: ElementId) -> GraphNodeId {
        let element = self.tree.get(element_id);
        let cache_key = (element.id.clone(), element.key.clone());
        if let Some(&existing) = self.cache.get(&cache_key) {
            return existing;
        }
        let node = self.push_node(element);
        self.cache.insert(cache_key, node);

        // Sequential chain: actions first, transitions after the last one
        let actions = self.tree.child_actions(element_id);
        let child_states = self.tree.child_states(element_id);

        let exit_edges = self.transition_edges(element);

        let mut next: Vec<GraphEdge> = Vec::new();
        if element.tag == "parallel" {
            // Branches run concurrently; the join follows the transitions
            let branches: Vec<GraphNodeId> =
                child_states.iter().map(|&c| self.state_node(c)).collect();
            self.nodes[node.0].parallel = branches;
        } else if !actions.is_empty() {
            // Action chain with run_after sequencing; the last action also
            // carries the state's exits so the chain reads as one sequence
            let mut previous: Option<GraphNodeId> = None;
            for (i, action) in actions.iter().copied().enumerate() {
                let action_node = self.action_node(action);
                if let Some(prev) = previous {
                    let prev_id = self.nodes[prev.0].id.clone();
                    self.nodes[action_node.0].run_after.push(prev_id);
                    self.nodes[prev.0].next.push(GraphEdge::transition(action_node, None, false));
                } else {
                    next.push(GraphEdge::entry(action_node));
                }
                previous = Some(action_node);
                if i == actions.len() - 1 {
                    let exits: Vec<GraphEdge> = exit_edges
                        .iter()
                        .filter(|e| !e.internal)
                        .cloned()
                        .collect();
                    self.nodes[action_node.0].next.extend(exits);
                }
            }
        } else if !child_states.is_empty() {
            // Composite: every child state exists in the graph (the error
            // state in particular is entered by routing, not transitions);
            // the entry edge points at the initial child
            let initial = self.initial_child(element_id, &child_states);
            for &child in &child_states {
                let child_node = self.state_node(child);
                if child == initial {
                    next.push(GraphEdge::entry(child_node));
                }
            }
        }

        next.extend(exit_edges);
        self.nodes[node.0].next = next;
        node
    }

    /// Node for a leaf action, memoized like states.
    fn action_node(&mut self, element_id: ElementId) -> GraphNodeId {
        let element = self.tree.get(element_id);
        let cache_key = (element.id.clone(), element.key.clone());
        if let Some(&existing) = self.cache.get(&cache_key) {
            return existing;
        }
        let node = self.push_node(element);
        self.cache.insert(cache_key, node);
        node
    }

    fn push_node(&mut self, element: &Element) -> GraphNodeId {
        let id = GraphNodeId(self.nodes.len());
        self.nodes.push(ExecutionGraphElement {
            id: element.id.clone(),
            key: element.key.clone(),
            kind: element.role,
            sub_type: element.element_type.clone(),
            attributes: element.attributes.clone(),
            content: element.content.clone(),
            when: element
                .attr_str("when")
                .map(str::to_string)
                .or_else(|| element.attr_expr("when").map(str::to_string)),
            run_after: Vec::new(),
            next: Vec::new(),
            parallel: Vec::new(),
            element: element.index,
            is_final: element.is_final,
        });
        id
    }

    /// Transition definitions resolved to edges; unknown targets were
    /// already reported by the lowerer and are dropped here.
    fn transition_edges(&mut self, element: &Element) -> Vec<GraphEdge> {
        let transitions = element.transitions.clone();
        let mut edges = Vec::with_capacity(transitions.len());
        for transition in transitions {
            let Some(target_element) = self
                .tree
                .iter()
                .find(|e| e.is_state_like() && e.id == transition.target)
                .map(|e| e.index)
            else {
                continue;
            };
            let target = self.state_node(target_element);
            edges.push(GraphEdge::transition(target, transition.cond, transition.internal));
        }
        edges
    }

    fn initial_child(&self, state: ElementId, children: &[ElementId]) -> ElementId {
        let element = self.tree.get(state);
        if let Some(initial) = element.attr_str("initial") {
            if let Some(&child) = children.iter().find(|&&c| self.tree.get(c).id == initial) {
                return child;
            }
        }
        children
            .iter()
            .copied()
            .find(|&c| {
                let e = self.tree.get(c);
                !(e.synthesized && (e.is_final || e.role == Role::Error))
            })
            .unwrap_or(children[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::Diagnostics;
    use crate::lower::lower;
    use crate::parser::parse;

    fn graph_for(src: &str) -> ExecutionGraph {
        let ast = parse(src).expect("parse");
        let mut diagnostics = Diagnostics::new();
        let tree = lower(&ast, &mut diagnostics);
        ExecutionGraph::build(&tree)
    }

    #[test]
    fn minimal_workflow_graph_shape() {
        let graph = graph_for(
            r#"<workflow id="w"><state id="s"><llm model="m" prompt="hi"/></state></workflow>"#,
        );
        let s = graph.find_by_id("s").expect("state node");
        assert_eq!(s.kind, Role::State);
        // s enters its single action, and carries its healed exit
        let entry = s.next.iter().find(|e| e.entry).expect("entry edge");
        let action = graph.get(entry.target);
        assert_eq!(action.sub_type, "llm");
        assert!(s.next.iter().any(|e| !e.entry && e.when.is_none()));
        // The action transitions unconditionally to final
        assert_eq!(action.next.len(), 1);
        assert!(action.next[0].when.is_none());
        assert!(graph.get(action.next[0].target).is_final);
    }

    #[test]
    fn shared_final_state_is_deduplicated() {
        let graph = graph_for(
            r#"<workflow id="w"><state id="a"><transition target="final"/></state><state id="b"><transition target="final"/></state></workflow>"#,
        );
        let finals: Vec<_> = graph.iter().filter(|n| n.is_final).collect();
        assert_eq!(finals.len(), 1);

        let a = graph.find_by_id("a").unwrap();
        let b = graph.find_by_id("b").unwrap();
        assert_eq!(a.next[0].target, b.next[0].target);
    }

    #[test]
    fn guards_fold_into_edges() {
        let graph = graph_for(
            r#"<workflow id="w"><data id="score" type="number">0</data><state id="a"><transition target="b" cond={score > 1}/></state><state id="b"></state></workflow>"#,
        );
        let a = graph.find_by_id("a").unwrap();
        let guarded = a.next.iter().find(|e| e.when.is_some()).expect("guarded edge");
        assert_eq!(guarded.when.as_deref(), Some("score > 1"));
        // Healed fallback remains unconditional
        assert!(a.next.iter().any(|e| e.when.is_none()));
    }

    #[test]
    fn internal_transitions_do_not_terminate_the_chain() {
        let graph = graph_for(
            r#"<workflow id="w"><state id="a"><transition target="a" cond={score} internal/><transition target="final"/></state><data id="score" type="number">0</data></workflow>"#,
        );
        let a = graph.find_by_id("a").unwrap();
        assert!(a.next.iter().any(|e| e.internal));
        assert!(a.next.iter().any(|e| !e.internal && e.when.is_none()));
    }

    #[test]
    fn parallel_branches_are_concurrent() {
        let graph = graph_for(
            r#"<workflow id="w"><parallel id="p"><state id="x"></state><state id="y"></state></parallel><state id="after"></state></workflow>"#,
        );
        let p = graph.find_by_id("p").unwrap();
        assert_eq!(p.parallel.len(), 2);
        assert_eq!(graph.get(p.parallel[0]).id, "x");
        assert_eq!(graph.get(p.parallel[1]).id, "y");
    }

    #[test]
    fn action_chain_sets_run_after() {
        let graph = graph_for(
            r#"<workflow id="w"><state id="s"><llm id="first" model="m" prompt="a"/><log id="second" message="b"/></state></workflow>"#,
        );
        let second = graph.find_by_id("second").unwrap();
        assert_eq!(second.run_after, vec!["first".to_string()]);
        let first = graph.find_by_id("first").unwrap();
        assert_eq!(graph.get(first.next[0].target).id, "second");
    }

    #[test]
    fn rebuilds_are_deterministic() {
        let src = r#"<workflow id="w"><state id="a"></state><state id="b"></state></workflow>"#;
        let g1 = graph_for(src);
        let g2 = graph_for(src);
        assert_eq!(g1.len(), g2.len());
        let ids1: Vec<_> = g1.iter().map(|n| n.id.clone()).collect();
        let ids2: Vec<_> = g2.iter().map(|n| n.id.clone()).collect();
        assert_eq!(ids1, ids2);
    }
}
