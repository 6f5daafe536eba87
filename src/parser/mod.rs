//! Grammar parser: AIML source text → positioned AST
//!
//! pest grammar (`aiml.pest`) produces a flat stream of tag events, comments,
//! imports, expressions and text; a stack-based tree builder enforces nesting
//! and reports mismatches as structured [`SyntaxError`] values the recovery
//! driver can classify. Parsing is deterministic and single-pass with no side
//! effects beyond the returned AST.

use pest::Parser;
use pest_derive::Parser;
use serde_json::Value;
use thiserror::Error;

use crate::ast::{AstNode, Prop, PropValue};
use crate::diagnostics::Position;

#[derive(Parser)]
#[grammar = "parser/aiml.pest"]
struct AimlParser;

/// The closed tag vocabulary compiled into the grammar. Anything else after
/// `<` is literal text as far as the parser is concerned.
pub const KNOWN_TAGS: &[&str] = &[
    "workflow", "state", "parallel", "final", "transition", "datamodel", "data", "script",
    "prompt", "llm", "toolcall", "assign", "send", "log", "input", "output",
];

pub fn is_known_tag(name: &str) -> bool {
    KNOWN_TAGS.contains(&name)
}

/// Structured syntax failure with a byte offset into the original source.
///
/// The variants map one-to-one onto the recovery driver's repair rules.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyntaxError {
    #[error("unexpected closing tag </{name}>")]
    UnexpectedClosingTag { name: String, offset: usize, known: bool },

    #[error("missing closing tag for <{name}>")]
    MissingClosingTag {
        name: String,
        known: bool,
        /// Offset of the unclosed opening tag
        open_offset: usize,
        /// Insertion point for a synthetic closing tag; `None` means end of
        /// content (the unclosed tag ran to EOF)
        insert_at: Option<usize>,
    },

    #[error("unterminated tag")]
    UnterminatedTag { offset: usize },

    #[error("{message}")]
    Grammar { message: String, offset: usize },
}

impl SyntaxError {
    /// Byte offset the error points at
    pub fn offset(&self) -> usize {
        match self {
            SyntaxError::UnexpectedClosingTag { offset, .. }
            | SyntaxError::UnterminatedTag { offset }
            | SyntaxError::Grammar { offset, .. } => *offset,
            SyntaxError::MissingClosingTag { open_offset, .. } => *open_offset,
        }
    }

    pub fn position(&self, source: &str) -> Position {
        let offset = self.offset();
        Position::of_span(source, offset, offset)
    }
}

/// Parse a full document. Deterministic; either the whole document parses or
/// the first failure is reported with its offset.
pub fn parse(source: &str) -> Result<Vec<AstNode>, SyntaxError> {
    let (frontmatter, body_offset) = take_frontmatter(source);
    let body = &source[body_offset..];

    let mut pairs = AimlParser::parse(Rule::document, body)
        .map_err(|e| convert_pest_error(e, source, body_offset))?;
    let document = match pairs.next() {
        Some(pair) => pair,
        None => {
            return Err(SyntaxError::Grammar {
                message: "empty parse result".to_string(),
                offset: body_offset,
            })
        }
    };

    let mut builder = TreeBuilder::new(source, body_offset);
    for pair in document.into_inner() {
        builder.event(pair)?;
    }
    let mut nodes = builder.finish()?;

    if let Some(fm) = frontmatter {
        nodes.insert(0, fm);
    }
    Ok(nodes)
}

// ============================================================================
// FRONTMATTER
// ============================================================================

/// Split off a leading `---` YAML header. Returns the parsed node (if any)
/// and the byte offset where the grammar-parsed body begins, so every span
/// stays in original-source coordinates.
fn take_frontmatter(source: &str) -> (Option<AstNode>, usize) {
    let mut lines = source.split_inclusive('\n');
    let Some(first) = lines.next() else { return (None, 0) };
    if first.trim_end() != "---" {
        return (None, 0);
    }

    let mut consumed = first.len();
    let yaml_start = consumed;
    for line in lines {
        if line.trim_end() == "---" {
            let yaml = &source[yaml_start..consumed];
            let end = consumed + line.len();
            let node = AstNode::Frontmatter {
                entries: parse_frontmatter_entries(yaml),
                position: Position::of_span(source, 0, end),
            };
            return (Some(node), end);
        }
        consumed += line.len();
    }
    // No closing fence: not a frontmatter block, parse everything as body
    (None, 0)
}

/// YAML-like header parsing: serde_yaml first, naive `key: value` fallback
fn parse_frontmatter_entries(yaml: &str) -> Vec<(String, Value)> {
    if let Ok(serde_yaml::Value::Mapping(map)) = serde_yaml::from_str::<serde_yaml::Value>(yaml) {
        let mut entries = Vec::with_capacity(map.len());
        for (k, v) in map {
            let key = match k {
                serde_yaml::Value::String(s) => s,
                other => serde_yaml::to_string(&other).unwrap_or_default().trim().to_string(),
            };
            let value = serde_json::to_value(&v).unwrap_or(Value::Null);
            entries.push((key, value));
        }
        return entries;
    }
    yaml.lines()
        .filter_map(|line| {
            let (k, v) = line.split_once(':')?;
            let k = k.trim();
            if k.is_empty() {
                return None;
            }
            Some((k.to_string(), Value::String(v.trim().to_string())))
        })
        .collect()
}

// ============================================================================
// TREE BUILDER
// ============================================================================

struct OpenFrame {
    name: String,
    attributes: Vec<Prop>,
    children: Vec<AstNode>,
    start: usize,
}

struct TreeBuilder<'s> {
    source: &'s str,
    offset: usize,
    stack: Vec<OpenFrame>,
    top_level: Vec<AstNode>,
}

impl<'s> TreeBuilder<'s> {
    fn new(source: &'s str, offset: usize) -> Self {
        Self { source, offset, stack: Vec::new(), top_level: Vec::new() }
    }

    fn sink(&mut self) -> &mut Vec<AstNode> {
        match self.stack.last_mut() {
            Some(frame) => &mut frame.children,
            None => &mut self.top_level,
        }
    }

    fn span_of(&self, pair: &pest::iterators::Pair<'_, Rule>) -> (usize, usize) {
        let span = pair.as_span();
        (span.start() + self.offset, span.end() + self.offset)
    }

    fn position_of(&self, pair: &pest::iterators::Pair<'_, Rule>) -> Position {
        let (start, end) = self.span_of(pair);
        Position::of_span(self.source, start, end)
    }

    fn event(&mut self, pair: pest::iterators::Pair<'_, Rule>) -> Result<(), SyntaxError> {
        match pair.as_rule() {
            Rule::text => {
                let position = self.position_of(&pair);
                let value = unescape_entities(pair.as_str());
                self.sink().push(AstNode::Text { value, position });
            }
            Rule::comment => {
                let position = self.position_of(&pair);
                let value = pair
                    .into_inner()
                    .find(|p| p.as_rule() == Rule::comment_inner)
                    .map(|p| p.as_str().to_string())
                    .unwrap_or_default();
                self.sink().push(AstNode::Comment { value, position });
            }
            Rule::expr_block => {
                let position = self.position_of(&pair);
                let code = pair
                    .into_inner()
                    .find(|p| p.as_rule() == Rule::expr_inner)
                    .map(|p| p.as_str().trim().to_string())
                    .unwrap_or_default();
                self.sink().push(AstNode::Expression { code, position });
            }
            Rule::import_stmt => {
                let position = self.position_of(&pair);
                let mut binding = String::new();
                let mut path = String::new();
                for inner in pair.into_inner() {
                    match inner.as_rule() {
                        Rule::ident => binding = inner.as_str().to_string(),
                        Rule::string_lit => path = string_lit_value(inner),
                        _ => {}
                    }
                }
                self.sink().push(AstNode::Import { binding, path, position });
            }
            Rule::script_element => {
                let position = self.position_of(&pair);
                let mut attributes = Vec::new();
                let mut children = Vec::new();
                for inner in pair.into_inner() {
                    match inner.as_rule() {
                        Rule::attribute_list => {
                            for attr in inner.into_inner() {
                                if attr.as_rule() == Rule::attribute {
                                    attributes.push(self.attribute(attr));
                                }
                            }
                        }
                        Rule::script_body => {
                            if !inner.as_str().is_empty() {
                                let body_position = self.position_of(&inner);
                                children.push(AstNode::Text {
                                    value: inner.as_str().to_string(),
                                    position: body_position,
                                });
                            }
                        }
                        _ => {}
                    }
                }
                self.sink().push(AstNode::Element {
                    name: "script".to_string(),
                    attributes,
                    children,
                    position,
                });
            }
            Rule::open_tag => {
                let (start, _) = self.span_of(&pair);
                let (name, attributes) = self.tag_parts(pair);
                self.stack.push(OpenFrame { name, attributes, children: Vec::new(), start });
            }
            Rule::self_closing_tag => {
                let position = self.position_of(&pair);
                let (name, attributes) = self.tag_parts(pair);
                self.sink().push(AstNode::Element {
                    name,
                    attributes,
                    children: Vec::new(),
                    position,
                });
            }
            Rule::close_tag => {
                let (close_start, close_end) = self.span_of(&pair);
                let name = pair
                    .into_inner()
                    .find(|p| p.as_rule() == Rule::tag_name)
                    .map(|p| p.as_str().to_string())
                    .unwrap_or_default();
                self.close(name, close_start, close_end)?;
            }
            Rule::EOI => {}
            _ => {}
        }
        Ok(())
    }

    fn close(&mut self, name: String, start: usize, end: usize) -> Result<(), SyntaxError> {
        match self.stack.iter().rposition(|f| f.name == name) {
            Some(idx) if idx == self.stack.len() - 1 => {
                let frame = self.stack.pop().expect("frame exists at checked index");
                let position = Position::of_span(self.source, frame.start, end);
                let element = AstNode::Element {
                    name: frame.name,
                    attributes: frame.attributes,
                    children: frame.children,
                    position,
                };
                self.sink().push(element);
                Ok(())
            }
            Some(_) => {
                // Some inner element was never closed; report the innermost
                let unclosed = self.stack.last().expect("non-empty stack");
                Err(SyntaxError::MissingClosingTag {
                    name: unclosed.name.clone(),
                    known: is_known_tag(&unclosed.name),
                    open_offset: unclosed.start,
                    insert_at: Some(start),
                })
            }
            None => Err(SyntaxError::UnexpectedClosingTag {
                known: is_known_tag(&name),
                name,
                offset: start,
            }),
        }
    }

    fn tag_parts(&self, pair: pest::iterators::Pair<'_, Rule>) -> (String, Vec<Prop>) {
        let mut name = String::new();
        let mut attributes = Vec::new();
        for inner in pair.into_inner() {
            match inner.as_rule() {
                Rule::known_tag => name = inner.as_str().to_string(),
                Rule::attribute_list => {
                    for attr in inner.into_inner() {
                        if attr.as_rule() == Rule::attribute {
                            attributes.push(self.attribute(attr));
                        }
                    }
                }
                _ => {}
            }
        }
        (name, attributes)
    }

    fn attribute(&self, pair: pest::iterators::Pair<'_, Rule>) -> Prop {
        let position = self.position_of(&pair);
        let mut name = String::new();
        // Bare attributes are boolean flags
        let mut value = PropValue::Boolean(true);
        for inner in pair.into_inner() {
            match inner.as_rule() {
                Rule::attr_name => name = inner.as_str().to_string(),
                Rule::attr_value => {
                    if let Some(v) = inner.into_inner().next() {
                        value = match v.as_rule() {
                            Rule::string_lit => PropValue::String(string_lit_value(v)),
                            Rule::number_lit => {
                                PropValue::Number(v.as_str().parse().unwrap_or_default())
                            }
                            Rule::bool_lit => PropValue::Boolean(v.as_str() == "true"),
                            Rule::expr_block => {
                                let code = v
                                    .into_inner()
                                    .find(|p| p.as_rule() == Rule::expr_inner)
                                    .map(|p| p.as_str().to_string())
                                    .unwrap_or_default();
                                PropValue::from_expression_code(&code)
                            }
                            _ => PropValue::Boolean(true),
                        };
                    }
                }
                _ => {}
            }
        }
        Prop { name, value, position }
    }

    fn finish(mut self) -> Result<Vec<AstNode>, SyntaxError> {
        if let Some(frame) = self.stack.pop() {
            return Err(SyntaxError::MissingClosingTag {
                known: is_known_tag(&frame.name),
                name: frame.name,
                open_offset: frame.start,
                insert_at: None,
            });
        }
        Ok(self.top_level)
    }
}

fn string_lit_value(pair: pest::iterators::Pair<'_, Rule>) -> String {
    pair.into_inner()
        .find(|p| matches!(p.as_rule(), Rule::dq_inner | Rule::sq_inner))
        .map(|p| p.as_str().to_string())
        .unwrap_or_default()
}

/// Undo the recovery driver's escape markers (and plain entities in text)
fn unescape_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    text.replace("&lt;", "<").replace("&gt;", ">").replace("&amp;", "&")
}

// ============================================================================
// ERROR CONVERSION
// ============================================================================

fn convert_pest_error(
    err: pest::error::Error<Rule>,
    source: &str,
    body_offset: usize,
) -> SyntaxError {
    let rel = match err.location {
        pest::error::InputLocation::Pos(p) => p,
        pest::error::InputLocation::Span((s, _)) => s,
    };
    let offset = (rel + body_offset).min(source.len());

    // `<` before the error position with no `>` in between: an unterminated tag
    if let Some(lt) = unclosed_angle_before(source, offset) {
        return SyntaxError::UnterminatedTag { offset: lt };
    }

    SyntaxError::Grammar { message: err.variant.message().to_string(), offset }
}

/// Find the last `<` before `offset` that is not followed by any `>` up to
/// `offset`. Tags may span lines, so this looks at the whole prefix.
pub(crate) fn unclosed_angle_before(source: &str, offset: usize) -> Option<usize> {
    let prefix = &source[..offset.min(source.len())];
    let lt = prefix.rfind('<')?;
    if prefix[lt..].contains('>') {
        None
    } else {
        Some(lt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::find_element;

    #[test]
    fn parses_minimal_workflow() {
        let src = r#"<workflow id="w"><state id="s"><llm model="m" prompt="hi"/></state></workflow>"#;
        let ast = parse(src).expect("parse");
        assert_eq!(ast.len(), 1);
        let AstNode::Element { name, attributes, children, .. } = &ast[0] else {
            panic!("expected element");
        };
        assert_eq!(name, "workflow");
        assert_eq!(attributes[0].name, "id");
        assert_eq!(attributes[0].as_str(), Some("w"));
        assert_eq!(children.len(), 1);
        assert!(find_element(&ast, "llm").is_some());
    }

    #[test]
    fn unknown_tags_are_text() {
        let ast = parse("before <gadget> after").expect("parse");
        assert_eq!(ast.len(), 1);
        let AstNode::Text { value, .. } = &ast[0] else { panic!("expected text") };
        assert_eq!(value, "before <gadget> after");
    }

    #[test]
    fn expressions_and_comments() {
        let src = "<state id=\"a\">{input.name}<!-- note --></state>";
        let ast = parse(src).expect("parse");
        let AstNode::Element { children, .. } = &ast[0] else { panic!() };
        assert!(matches!(&children[0], AstNode::Expression { code, .. } if code == "input.name"));
        assert!(matches!(&children[1], AstNode::Comment { value, .. } if value.trim() == "note"));
    }

    #[test]
    fn attribute_value_forms() {
        let src = r#"<llm model="m" retries=3 stream=true when={score > 2} internal/>"#;
        let ast = parse(src).expect("parse");
        let AstNode::Element { attributes, .. } = &ast[0] else { panic!() };
        assert_eq!(attributes.len(), 5);
        assert!(matches!(attributes[1].value, PropValue::Number(n) if n == 3.0));
        assert!(matches!(attributes[2].value, PropValue::Boolean(true)));
        assert!(matches!(&attributes[3].value, PropValue::Expression(c) if c == "score > 2"));
        assert!(matches!(attributes[4].value, PropValue::Boolean(true)));
    }

    #[test]
    fn missing_closing_tag_is_reported() {
        let err = parse("<workflow id=\"w\"><state id=\"s\"></state>").unwrap_err();
        match err {
            SyntaxError::MissingClosingTag { name, known, insert_at, .. } => {
                assert_eq!(name, "workflow");
                assert!(known);
                assert!(insert_at.is_none());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn mismatched_close_reports_inner_unclosed() {
        let err = parse("<workflow><state id=\"s\"></workflow>").unwrap_err();
        match err {
            SyntaxError::MissingClosingTag { name, insert_at, .. } => {
                assert_eq!(name, "state");
                assert!(insert_at.is_some());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn unexpected_close_is_reported() {
        let err = parse("<state id=\"s\"></state></state>").unwrap_err();
        assert!(matches!(
            err,
            SyntaxError::UnexpectedClosingTag { ref name, known: true, .. } if name == "state"
        ));
    }

    #[test]
    fn unknown_close_is_reported_unknown() {
        let err = parse("hello </gadget> world").unwrap_err();
        assert!(matches!(
            err,
            SyntaxError::UnexpectedClosingTag { ref name, known: false, .. } if name == "gadget"
        ));
    }

    #[test]
    fn unterminated_tag_detected() {
        let err = parse("text\n<state id=\"s\"\nmore").unwrap_err();
        assert!(matches!(err, SyntaxError::UnterminatedTag { .. }));
    }

    #[test]
    fn script_content_is_raw() {
        let src = "<state id=\"s\"><script>let x = {a: 1}; x.a < 2</script></state>";
        let ast = parse(src).expect("parse");
        let AstNode::Element { children, .. } = &ast[0] else { panic!("expected state") };
        let AstNode::Element { name, children: body, .. } = &children[0] else {
            panic!("expected script element");
        };
        assert_eq!(name, "script");
        let AstNode::Text { value, .. } = &body[0] else { panic!("expected raw code") };
        assert!(value.contains("{a: 1}"));
        assert!(value.contains("x.a < 2"));
    }

    #[test]
    fn frontmatter_is_parsed() {
        let src = "---\ntitle: demo\ncount: 3\n---\n<state id=\"s\"></state>";
        let ast = parse(src).expect("parse");
        let AstNode::Frontmatter { entries, .. } = &ast[0] else { panic!("expected frontmatter") };
        assert_eq!(entries[0].0, "title");
        assert_eq!(entries[0].1, serde_json::json!("demo"));
        assert_eq!(entries[1].1, serde_json::json!(3));
        assert!(matches!(&ast[1], AstNode::Element { name, .. } if name == "state"));
    }

    #[test]
    fn imports_parse() {
        let ast = parse("import helper from \"./helper.aiml\"\n<state id=\"s\"></state>")
            .expect("parse");
        assert!(matches!(
            &ast[0],
            AstNode::Import { binding, path, .. } if binding == "helper" && path == "./helper.aiml"
        ));
    }

    #[test]
    fn escaped_entities_unescape_in_text() {
        let ast = parse("a &lt;gadget&gt; b").expect("parse");
        let AstNode::Text { value, .. } = &ast[0] else { panic!() };
        assert_eq!(value, "a <gadget> b");
    }

    #[test]
    fn positions_are_one_based_and_span_elements() {
        let src = "line one\n<state id=\"s\"></state>";
        let ast = parse(src).expect("parse");
        let element = &ast[1];
        let pos = element.position();
        assert_eq!(pos.line_start, 2);
        assert_eq!(pos.column_start, 1);
        assert_eq!(pos.line_end, 2);
    }
}
