//! Positions and diagnostics shared by every compiler stage
//!
//! - `Position`: line/column source range attached to AST and element nodes
//! - `Diagnostic`: message + severity + stable code + range
//! - `Diagnostics`: ordered, de-duplicating accumulator for one compilation

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Stable diagnostic codes. These are part of the public contract and must
/// not change between versions (editor tooling matches on them).
pub mod codes {
    /// Syntax error recovered (or reported) by the parser
    pub const PARSE_ERROR: &str = "AIML002";
    /// Recovery iteration budget exhausted, no AST produced
    pub const RECOVERY_EXHAUSTED: &str = "AIML003";
    /// Element nested where its role is not allowed
    pub const NESTED_WRAPPING: &str = "AIML007";
    /// Tag name auto-corrected to a close known tag
    pub const TAG_CORRECTED: &str = "AIML011";
    /// Structure healed (synthesized state or transition)
    pub const HEALED: &str = "AIML012";
    /// Transition targets a state id that does not exist
    pub const TRANSITION_TARGET: &str = "AIML013";
    /// State never reached from the initial state
    pub const UNREACHABLE_STATE: &str = "unreachable_state";
    /// Attribute failed its tag schema
    pub const ATTR_SCHEMA: &str = "ATTR001";
    /// Embedded script failed to parse
    pub const SCRIPT_SYNTAX: &str = "SCRIPT001";
}

/// Source range in line/column form (1-based lines, 1-based columns)
///
/// Immutable once computed; derived from byte offsets by newline counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Position {
    pub line_start: usize,
    pub column_start: usize,
    pub line_end: usize,
    pub column_end: usize,
}

impl Position {
    pub fn new(line_start: usize, column_start: usize, line_end: usize, column_end: usize) -> Self {
        Self { line_start, column_start, line_end, column_end }
    }

    /// Collapse to the start point (used when only an offset is known)
    pub fn point(line: usize, column: usize) -> Self {
        Self::new(line, column, line, column)
    }

    /// Compute the position of `range` within `source` by counting newlines.
    /// O(n) in the source length, acceptable at document scale.
    pub fn of_span(source: &str, start: usize, end: usize) -> Self {
        let (line_start, column_start) = line_col_at(source, start);
        let (line_end, column_end) = line_col_at(source, end);
        Self { line_start, column_start, line_end, column_end }
    }
}

/// Byte offset → (line, column), both 1-based
pub fn line_col_at(source: &str, offset: usize) -> (usize, usize) {
    let clamped = offset.min(source.len());
    let prefix = &source[..clamped];
    let line = prefix.bytes().filter(|b| *b == b'\n').count() + 1;
    let column = match prefix.rfind('\n') {
        Some(nl) => prefix[nl + 1..].chars().count() + 1,
        None => prefix.chars().count() + 1,
    };
    (line, column)
}

/// Severity of a diagnostic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
        }
    }
}

/// A single diagnostic produced by any compilation stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub message: String,
    pub severity: Severity,
    /// Stable code from [`codes`]
    pub code: String,
    /// Producing stage, e.g. "aiml-parser", "aiml-validator"
    pub source: String,
    pub range: Position,
}

impl Diagnostic {
    pub fn error(code: &str, source: &str, message: impl Into<String>, range: Position) -> Self {
        Self {
            message: message.into(),
            severity: Severity::Error,
            code: code.to_string(),
            source: source.to_string(),
            range,
        }
    }

    pub fn warning(code: &str, source: &str, message: impl Into<String>, range: Position) -> Self {
        Self {
            message: message.into(),
            severity: Severity::Warning,
            code: code.to_string(),
            source: source.to_string(),
            range,
        }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}[{}] {} ({}:{})",
            self.severity, self.code, self.message, self.range.line_start, self.range.column_start
        )
    }
}

/// Ordered, de-duplicating diagnostic collection for one parse/compile.
///
/// Diagnostics never cause AST data to be discarded; every stage appends here
/// and compilation always terminates with some result plus this collection.
#[derive(Debug, Default, Clone)]
pub struct Diagnostics {
    items: Vec<Diagnostic>,
    seen: HashSet<(String, Position, String)>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append, ignoring exact duplicates (same code + range + message)
    pub fn push(&mut self, diagnostic: Diagnostic) {
        let key = (
            diagnostic.code.clone(),
            diagnostic.range,
            diagnostic.message.clone(),
        );
        if self.seen.insert(key) {
            self.items.push(diagnostic);
        }
    }

    pub fn extend(&mut self, other: impl IntoIterator<Item = Diagnostic>) {
        for d in other {
            self.push(d);
        }
    }

    pub fn has_errors(&self) -> bool {
        self.items.iter().any(|d| d.severity == Severity::Error)
    }

    pub fn error_count(&self) -> usize {
        self.items.iter().filter(|d| d.severity == Severity::Error).count()
    }

    pub fn warning_count(&self) -> usize {
        self.items.iter().filter(|d| d.severity == Severity::Warning).count()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.items.iter()
    }

    pub fn as_slice(&self) -> &[Diagnostic] {
        &self.items
    }

    pub fn into_vec(self) -> Vec<Diagnostic> {
        self.items
    }
}

impl IntoIterator for Diagnostics {
    type Item = Diagnostic;
    type IntoIter = std::vec::IntoIter<Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_col_counts_newlines() {
        let src = "ab\ncd\nef";
        assert_eq!(line_col_at(src, 0), (1, 1));
        assert_eq!(line_col_at(src, 3), (2, 1));
        assert_eq!(line_col_at(src, 4), (2, 2));
        assert_eq!(line_col_at(src, 7), (3, 2));
        // Past the end clamps to the last position
        assert_eq!(line_col_at(src, 100), (3, 3));
    }

    #[test]
    fn position_of_span() {
        let src = "line one\nline two";
        let pos = Position::of_span(src, 9, 13);
        assert_eq!(pos.line_start, 2);
        assert_eq!(pos.column_start, 1);
        assert_eq!(pos.line_end, 2);
        assert_eq!(pos.column_end, 5);
    }

    #[test]
    fn diagnostics_deduplicate() {
        let mut diags = Diagnostics::new();
        let d = Diagnostic::error(codes::PARSE_ERROR, "aiml-parser", "boom", Position::default());
        diags.push(d.clone());
        diags.push(d.clone());
        assert_eq!(diags.len(), 1);

        // Different range is a different diagnostic
        let mut other = d;
        other.range = Position::point(2, 1);
        diags.push(other);
        assert_eq!(diags.len(), 2);
    }

    #[test]
    fn diagnostics_order_is_insertion_order() {
        let mut diags = Diagnostics::new();
        diags.push(Diagnostic::warning(codes::HEALED, "aiml-lower", "first", Position::default()));
        diags.push(Diagnostic::error(
            codes::ATTR_SCHEMA,
            "aiml-validator",
            "second",
            Position::default(),
        ));
        let messages: Vec<_> = diags.iter().map(|d| d.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "second"]);
        assert!(diags.has_errors());
        assert_eq!(diags.warning_count(), 1);
    }
}
