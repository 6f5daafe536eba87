//! Recovery driver: bounded repair loop around the grammar parser
//!
//! On a syntax failure the driver applies exactly one textual repair chosen
//! by the error's classification, re-parses, and repeats until the document
//! parses or the iteration budget runs out. Repairs are pure
//! `&str -> String` transforms over the source text; the AST is never
//! patched in place. Every repair is recorded as a diagnostic. Greedy local
//! repair is not guaranteed to preserve author intent; the budget and the
//! one-tag-or-one-line blast radius keep it bounded.

use tracing::debug;

use crate::ast::AstNode;
use crate::diagnostics::{codes, Diagnostic, Diagnostics, Position};
use crate::parser::{self, is_known_tag, SyntaxError, KNOWN_TAGS};

/// Default repair budget; documents needing more than this are abandoned
pub const DEFAULT_MAX_ITERATIONS: usize = 10;

/// Result of a recovered parse: `ast` is `None` only when the budget was
/// exhausted. Diagnostics accumulate across every repair attempt.
#[derive(Debug)]
pub struct RecoveredParse {
    pub ast: Option<Vec<AstNode>>,
    pub diagnostics: Diagnostics,
}

/// Parse with iterative error recovery.
///
/// Idempotent on valid documents: zero repairs, zero diagnostics.
pub fn parse_with_recovery(source: &str, max_iterations: usize) -> RecoveredParse {
    let mut text = source.to_string();
    let mut diagnostics = Diagnostics::new();
    let mut repairs = 0usize;

    loop {
        match parser::parse(&text) {
            Ok(ast) => {
                return RecoveredParse { ast: Some(ast), diagnostics };
            }
            Err(err) => {
                if repairs >= max_iterations {
                    diagnostics.push(Diagnostic::error(
                        codes::RECOVERY_EXHAUSTED,
                        "aiml-parser",
                        format!(
                            "could not recover from syntax errors after {} repair attempts: {}",
                            repairs, err
                        ),
                        err.position(&text),
                    ));
                    return RecoveredParse { ast: None, diagnostics };
                }
                repairs += 1;
                debug!(repair = repairs, error = %err, "applying syntax repair");
                text = apply_repair(&text, &err, &mut diagnostics);
            }
        }
    }
}

// ============================================================================
// REPAIR RULES
// ============================================================================

/// Apply exactly one repair for `err`, emitting its diagnostic.
fn apply_repair(text: &str, err: &SyntaxError, diagnostics: &mut Diagnostics) -> String {
    let position = err.position(text);
    match err {
        SyntaxError::UnexpectedClosingTag { name, offset, known: true } => {
            diagnostics.push(parse_error(
                format!("unexpected closing tag </{name}>, removed"),
                position,
            ));
            delete_tag_at(text, *offset)
        }
        SyntaxError::UnexpectedClosingTag { name, offset, known: false } => {
            if let Some(corrected) = closest_known_tag(name) {
                diagnostics.push(Diagnostic::warning(
                    codes::TAG_CORRECTED,
                    "aiml-parser",
                    format!("unknown closing tag </{name}> corrected to </{corrected}>"),
                    position,
                ));
                rename_closing_tag(text, *offset, name, corrected)
            } else {
                diagnostics.push(parse_error(
                    format!("unknown closing tag </{name}>, treated as text"),
                    position,
                ));
                escape_tag_at(text, *offset)
            }
        }
        SyntaxError::MissingClosingTag { name, known: true, insert_at, .. } => {
            diagnostics.push(parse_error(
                format!("missing closing tag for <{name}>, inserted"),
                position,
            ));
            let at = insert_at.unwrap_or(text.len());
            let mut repaired = String::with_capacity(text.len() + name.len() + 3);
            repaired.push_str(&text[..at]);
            repaired.push_str("</");
            repaired.push_str(name);
            repaired.push('>');
            repaired.push_str(&text[at..]);
            repaired
        }
        SyntaxError::MissingClosingTag { name, known: false, open_offset, .. } => {
            diagnostics.push(parse_error(
                format!("missing closing tag for unknown <{name}>, treated as text"),
                position,
            ));
            escape_tag_at(text, *open_offset)
        }
        SyntaxError::UnterminatedTag { offset } => {
            diagnostics.push(parse_error("unterminated tag, `>` appended", position));
            let end = line_end(text, *offset);
            let mut repaired = String::with_capacity(text.len() + 1);
            repaired.push_str(&text[..end]);
            repaired.push('>');
            repaired.push_str(&text[end..]);
            repaired
        }
        SyntaxError::Grammar { message, offset } => {
            let (start, end) = line_bounds(text, *offset);
            let line = &text[start..end];
            if let Some(head) = tag_head(line) {
                if !is_known_tag(head) {
                    diagnostics.push(parse_error(
                        format!("{message}; angle brackets escaped"),
                        position,
                    ));
                    return escape_angles_in_line(text, start, end);
                }
            }
            diagnostics.push(parse_error(format!("{message}; line removed"), position));
            blank_line(text, start, end)
        }
    }
}

fn parse_error(message: impl Into<String>, position: Position) -> Diagnostic {
    Diagnostic::error(codes::PARSE_ERROR, "aiml-parser", message, position)
}

// ---- pure text transforms --------------------------------------------------

/// Delete the tag starting at `offset` through its closing `>` (or to end of
/// line if it never closes).
fn delete_tag_at(text: &str, offset: usize) -> String {
    let end = text[offset..]
        .find('>')
        .map(|i| offset + i + 1)
        .unwrap_or_else(|| line_end(text, offset));
    let mut repaired = String::with_capacity(text.len());
    repaired.push_str(&text[..offset]);
    repaired.push_str(&text[end..]);
    repaired
}

/// Escape the single tag starting at `offset` so it re-parses as text
fn escape_tag_at(text: &str, offset: usize) -> String {
    let end = text[offset..]
        .find('>')
        .map(|i| offset + i + 1)
        .unwrap_or_else(|| line_end(text, offset));
    let mut repaired = String::with_capacity(text.len() + 8);
    repaired.push_str(&text[..offset]);
    for c in text[offset..end].chars() {
        match c {
            '<' => repaired.push_str("&lt;"),
            '>' => repaired.push_str("&gt;"),
            other => repaired.push(other),
        }
    }
    repaired.push_str(&text[end..]);
    repaired
}

/// Rewrite `</old>` at `offset` to `</new>`
fn rename_closing_tag(text: &str, offset: usize, old: &str, new: &str) -> String {
    let head = offset + 2; // past "</"
    let tag_end = head + old.len();
    let mut repaired = String::with_capacity(text.len() + new.len());
    repaired.push_str(&text[..head]);
    repaired.push_str(new);
    repaired.push_str(&text[tag_end..]);
    repaired
}

/// Escape every angle bracket on one line
fn escape_angles_in_line(text: &str, start: usize, end: usize) -> String {
    let mut repaired = String::with_capacity(text.len() + 8);
    repaired.push_str(&text[..start]);
    for c in text[start..end].chars() {
        match c {
            '<' => repaired.push_str("&lt;"),
            '>' => repaired.push_str("&gt;"),
            other => repaired.push(other),
        }
    }
    repaired.push_str(&text[end..]);
    repaired
}

/// Replace one line with spaces, preserving length and line numbering
fn blank_line(text: &str, start: usize, end: usize) -> String {
    let mut repaired = String::with_capacity(text.len());
    repaired.push_str(&text[..start]);
    repaired.extend(std::iter::repeat(' ').take(text[start..end].chars().count()));
    repaired.push_str(&text[end..]);
    repaired
}

// ---- helpers ---------------------------------------------------------------

fn line_bounds(text: &str, offset: usize) -> (usize, usize) {
    let offset = offset.min(text.len());
    let start = text[..offset].rfind('\n').map(|i| i + 1).unwrap_or(0);
    let end = text[offset..].find('\n').map(|i| offset + i).unwrap_or(text.len());
    (start, end)
}

fn line_end(text: &str, offset: usize) -> usize {
    line_bounds(text, offset).1
}

/// Identifier immediately after the first `<` on a line, if any
fn tag_head(line: &str) -> Option<&str> {
    let lt = line.find('<')?;
    let rest = &line[lt + 1..];
    let rest = rest.strip_prefix('/').unwrap_or(rest);
    let end = rest
        .char_indices()
        .find(|(_, c)| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        .map(|(i, _)| i)
        .unwrap_or(rest.len());
    if end == 0 {
        None
    } else {
        Some(&rest[..end])
    }
}

/// Closest known tag by edit distance, within a distance of 2
fn closest_known_tag(name: &str) -> Option<&'static str> {
    let mut best: Option<(&'static str, usize)> = None;
    for candidate in KNOWN_TAGS {
        let d = edit_distance(name, candidate);
        if best.map(|(_, bd)| d < bd).unwrap_or(true) {
            best = Some((candidate, d));
        }
    }
    match best {
        Some((tag, d)) if d <= 2 && d < name.len() => Some(tag),
        _ => None,
    }
}

fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(prev[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut prev, &mut current);
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::find_element;
    use crate::diagnostics::Severity;

    #[test]
    fn valid_document_needs_zero_repairs() {
        let src = r#"<workflow id="w"><state id="s"><llm model="m" prompt="hi"/></state></workflow>"#;
        let result = parse_with_recovery(src, DEFAULT_MAX_ITERATIONS);
        assert!(result.ast.is_some());
        assert!(result.diagnostics.is_empty());
    }

    #[test]
    fn doubled_closing_tag_is_removed() {
        let src = r#"<workflow id="w"><state id="s"></state></state></workflow>"#;
        let result = parse_with_recovery(src, DEFAULT_MAX_ITERATIONS);
        let ast = result.ast.expect("recovered");
        assert!(find_element(&ast, "state").is_some());
        assert_eq!(result.diagnostics.len(), 1);
        assert_eq!(result.diagnostics.as_slice()[0].code, codes::PARSE_ERROR);
    }

    #[test]
    fn near_miss_closing_tag_is_corrected() {
        let src = r#"<workflow id="w"><state id="s">hi</stat></workflow>"#;
        let result = parse_with_recovery(src, DEFAULT_MAX_ITERATIONS);
        let ast = result.ast.expect("recovered");
        assert!(find_element(&ast, "state").is_some());
        let diag = &result.diagnostics.as_slice()[0];
        assert_eq!(diag.code, codes::TAG_CORRECTED);
        assert_eq!(diag.severity, Severity::Warning);
    }

    #[test]
    fn unknown_closing_tag_is_escaped() {
        let src = "hello </definitelynotatag> world";
        let result = parse_with_recovery(src, DEFAULT_MAX_ITERATIONS);
        let ast = result.ast.expect("recovered");
        let crate::ast::AstNode::Text { value, .. } = &ast[0] else { panic!("expected text") };
        assert!(value.contains("</definitelynotatag>"));
    }

    #[test]
    fn missing_closing_tag_is_appended() {
        let src = r#"<workflow id="w"><state id="s"></state>"#;
        let result = parse_with_recovery(src, DEFAULT_MAX_ITERATIONS);
        let ast = result.ast.expect("recovered");
        assert!(matches!(&ast[0], crate::ast::AstNode::Element { name, .. } if name == "workflow"));
        assert_eq!(result.diagnostics.len(), 1);
    }

    #[test]
    fn interleaved_close_heals_inner_element() {
        let src = "<workflow><state id=\"s\">text</workflow>";
        let result = parse_with_recovery(src, DEFAULT_MAX_ITERATIONS);
        let ast = result.ast.expect("recovered");
        let workflow = find_element(&ast, "workflow").expect("workflow");
        let crate::ast::AstNode::Element { children, .. } = workflow else { panic!() };
        assert!(matches!(&children[0], crate::ast::AstNode::Element { name, .. } if name == "state"));
    }

    #[test]
    fn unterminated_tag_gets_closed() {
        let src = "<state id=\"s\"\nbody</state>";
        let result = parse_with_recovery(src, DEFAULT_MAX_ITERATIONS);
        assert!(result.ast.is_some());
        assert!(!result.diagnostics.is_empty());
    }

    #[test]
    fn budget_exhaustion_returns_none() {
        let src = "{a\n{b\n{c";
        let result = parse_with_recovery(src, 1);
        assert!(result.ast.is_none());
        let last = result.diagnostics.as_slice().last().expect("diagnostic");
        assert_eq!(last.code, codes::RECOVERY_EXHAUSTED);
        assert!(last.message.contains("1 repair attempt"));
    }

    #[test]
    fn edit_distance_basics() {
        assert_eq!(edit_distance("stat", "state"), 1);
        assert_eq!(edit_distance("workflow", "workflow"), 0);
        assert_eq!(edit_distance("abc", "xyz"), 3);
    }

    #[test]
    fn closest_tag_requires_small_distance() {
        assert_eq!(closest_known_tag("stat"), Some("state"));
        assert_eq!(closest_known_tag("workflwo"), Some("workflow"));
        assert_eq!(closest_known_tag("zzzzzz"), None);
    }
}
