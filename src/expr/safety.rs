//! Static safety validation for embedded expressions
//!
//! Conservative checks applied at compile time, long before any evaluation:
//! a deny-list of dangerous tokens, an allow-list of `new` targets, and a
//! closed set of variables the caller has chosen to expose. The first
//! violation found is returned as the error message.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

use super::parse::{for_each_base_identifier, parse_expression};
use super::token::{tokenize, Token};

/// Tokens that must never appear in raw expression code
const DENIED_IDENTIFIERS: &[&str] = &[
    "eval", "window", "document", "global", "process", "require", "import", "export", "throw",
    "function", "console",
];

/// Constructors permitted as `new` targets
pub const ALLOWED_CONSTRUCTORS: &[&str] = &["Date", "String", "Number", "Boolean", "Array", "Object"];

/// `${ ... }` segments of a template literal
static TEMPLATE_SEGMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([^}]*)\}").expect("static regex compiles"));

/// Validate expression code against the restricted-language rules.
///
/// Template-literal mode only rejects statement separators inside `${...}`
/// segments; raw mode applies the full deny-list, the `new` allow-list and
/// the `allowed_vars` identifier check.
pub fn validate_code_expression(
    code: &str,
    allowed_vars: &[&str],
    is_template_literal: bool,
) -> Result<(), String> {
    if is_template_literal {
        for capture in TEMPLATE_SEGMENT.captures_iter(code) {
            let segment = capture.get(1).map(|m| m.as_str()).unwrap_or_default();
            if segment.contains(';') {
                return Err(format!(
                    "statement separator `;` is not allowed in template expression `${{{segment}}}`"
                ));
            }
        }
        return Ok(());
    }

    let tokens = match tokenize(code) {
        Ok(tokens) => tokens,
        Err(e) => return Err(e.to_string()),
    };

    // Deny-list scan, including `Function(` as a call head
    for (i, spanned) in tokens.iter().enumerate() {
        if let Token::Ident(name) = &spanned.token {
            if DENIED_IDENTIFIERS.contains(&name.as_str()) {
                return Err(format!("`{name}` is not allowed in expressions"));
            }
            if name == "Function" && matches!(tokens.get(i + 1).map(|t| &t.token), Some(Token::LParen)) {
                return Err("`Function(` is not allowed in expressions".to_string());
            }
        }
    }

    // `new X(...)` targets must be allow-listed value constructors
    let allowed_constructors: HashSet<&str> = ALLOWED_CONSTRUCTORS.iter().copied().collect();
    for (i, spanned) in tokens.iter().enumerate() {
        if spanned.token == Token::New {
            match tokens.get(i + 1).map(|t| &t.token) {
                Some(Token::Ident(name)) if allowed_constructors.contains(name.as_str()) => {}
                Some(Token::Ident(name)) => {
                    return Err(format!("constructor `new {name}(...)` is not allowed"));
                }
                _ => return Err("`new` must be followed by a constructor name".to_string()),
            }
        }
    }

    // Every bare identifier must be explicitly exposed by the caller
    let expr = parse_expression(code).map_err(|e| e.to_string())?;
    let allowed: HashSet<&str> = allowed_vars.iter().copied().collect();
    let mut violation = None;
    for_each_base_identifier(&expr, &mut |name| {
        if violation.is_none()
            && !allowed.contains(name)
            && !allowed_constructors.contains(name)
        {
            violation = Some(format!("unknown variable `{name}`"));
        }
    });
    match violation {
        Some(message) => Err(message),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VARS: &[&str] = &["input", "chatHistory", "score"];

    #[test]
    fn accepts_allowed_identifiers() {
        assert!(validate_code_expression("input.message", VARS, false).is_ok());
        assert!(validate_code_expression("score > 3 ? 'hi' : 'lo'", VARS, false).is_ok());
        assert!(validate_code_expression("chatHistory.length", VARS, false).is_ok());
    }

    #[test]
    fn rejects_denied_tokens() {
        for code in [
            "eval('x')",
            "window.alert",
            "process.env",
            "require('fs')",
            "console.log(input)",
            "global.thing",
            "document.cookie",
        ] {
            let err = validate_code_expression(code, VARS, false).unwrap_err();
            assert!(err.contains("not allowed"), "{code}: {err}");
        }
    }

    #[test]
    fn rejects_function_constructor() {
        let err = validate_code_expression("Function('return 1')", VARS, false).unwrap_err();
        assert!(err.contains("Function("));
    }

    #[test]
    fn new_allow_list() {
        assert!(validate_code_expression("new Date()", VARS, false).is_ok());
        assert!(validate_code_expression("new Number(input.raw)", VARS, false).is_ok());
        let err = validate_code_expression("new XMLHttpRequest()", VARS, false).unwrap_err();
        assert!(err.contains("XMLHttpRequest"));
    }

    #[test]
    fn unknown_variables_are_first_violation() {
        let err = validate_code_expression("score + missing + alsoMissing", VARS, false).unwrap_err();
        assert_eq!(err, "unknown variable `missing`");
    }

    #[test]
    fn template_mode_only_checks_separators() {
        assert!(validate_code_expression("Hello ${anything.at.all}", VARS, true).is_ok());
        let err = validate_code_expression("Hi ${a; b}", VARS, true).unwrap_err();
        assert!(err.contains("statement separator"));
    }
}
