//! Tokenizer for the restricted expression language

use super::ExprError;

/// One lexical token with its byte offset
#[derive(Debug, Clone, PartialEq)]
pub struct SpannedToken {
    pub token: Token,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Bool(bool),
    Null,
    New,
    Let,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    Gt,
    LtEq,
    GtEq,
    AndAnd,
    OrOr,
    Not,
    Dot,
    Comma,
    Semicolon,
    Question,
    Colon,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Assign,
}

impl Token {
    pub fn describe(&self) -> String {
        match self {
            Token::Number(n) => format!("number {n}"),
            Token::Str(_) => "string".to_string(),
            Token::Ident(name) => format!("identifier `{name}`"),
            Token::Bool(b) => format!("{b}"),
            Token::Null => "null".to_string(),
            Token::New => "`new`".to_string(),
            Token::Let => "`let`".to_string(),
            other => format!("{other:?}"),
        }
    }
}

/// Tokenize `code`. Unknown characters are an error with their offset.
pub fn tokenize(code: &str) -> Result<Vec<SpannedToken>, ExprError> {
    let mut tokens = Vec::new();
    let bytes = code.as_bytes();
    let mut i = 0;

    while i < code.len() {
        let c = match code[i..].chars().next() {
            Some(c) => c,
            None => break,
        };
        let start = i;
        match c {
            ' ' | '\t' | '\r' | '\n' => {
                i += 1;
                continue;
            }
            '0'..='9' => {
                let mut end = i + 1;
                while end < code.len()
                    && (bytes[end].is_ascii_digit() || bytes[end] == b'.')
                {
                    end += 1;
                }
                let text = &code[i..end];
                let value: f64 = text.parse().map_err(|_| ExprError::Lex {
                    message: format!("invalid number `{text}`"),
                    offset: start,
                })?;
                tokens.push(SpannedToken { token: Token::Number(value), offset: start });
                i = end;
            }
            '"' | '\'' | '`' => {
                let quote = c;
                let mut value = String::new();
                let mut end = i + 1;
                let mut closed = false;
                while end < code.len() {
                    let ch = code[end..].chars().next().expect("in-bounds char");
                    if ch == '\\' {
                        let next = code[end + 1..].chars().next();
                        match next {
                            Some('n') => value.push('\n'),
                            Some('t') => value.push('\t'),
                            Some(other) => value.push(other),
                            None => break,
                        }
                        end += 1 + next.map(|c| c.len_utf8()).unwrap_or(0);
                    } else if ch == quote {
                        closed = true;
                        end += 1;
                        break;
                    } else {
                        value.push(ch);
                        end += ch.len_utf8();
                    }
                }
                if !closed {
                    return Err(ExprError::Lex {
                        message: "unterminated string literal".to_string(),
                        offset: start,
                    });
                }
                tokens.push(SpannedToken { token: Token::Str(value), offset: start });
                i = end;
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let mut end = i + c.len_utf8();
                for ch in code[end..].chars() {
                    if ch.is_alphanumeric() || ch == '_' || ch == '$' {
                        end += ch.len_utf8();
                    } else {
                        break;
                    }
                }
                let word = &code[i..end];
                let token = match word {
                    "true" => Token::Bool(true),
                    "false" => Token::Bool(false),
                    "null" | "undefined" => Token::Null,
                    "new" => Token::New,
                    "let" | "const" | "var" => Token::Let,
                    other => Token::Ident(other.to_string()),
                };
                tokens.push(SpannedToken { token, offset: start });
                i = end;
            }
            '=' => {
                if code[i..].starts_with("===") {
                    tokens.push(SpannedToken { token: Token::EqEq, offset: start });
                    i += 3;
                } else if code[i..].starts_with("==") {
                    tokens.push(SpannedToken { token: Token::EqEq, offset: start });
                    i += 2;
                } else {
                    tokens.push(SpannedToken { token: Token::Assign, offset: start });
                    i += 1;
                }
            }
            '!' => {
                if code[i..].starts_with("!==") {
                    tokens.push(SpannedToken { token: Token::NotEq, offset: start });
                    i += 3;
                } else if code[i..].starts_with("!=") {
                    tokens.push(SpannedToken { token: Token::NotEq, offset: start });
                    i += 2;
                } else {
                    tokens.push(SpannedToken { token: Token::Not, offset: start });
                    i += 1;
                }
            }
            '<' => {
                if code[i..].starts_with("<=") {
                    tokens.push(SpannedToken { token: Token::LtEq, offset: start });
                    i += 2;
                } else {
                    tokens.push(SpannedToken { token: Token::Lt, offset: start });
                    i += 1;
                }
            }
            '>' => {
                if code[i..].starts_with(">=") {
                    tokens.push(SpannedToken { token: Token::GtEq, offset: start });
                    i += 2;
                } else {
                    tokens.push(SpannedToken { token: Token::Gt, offset: start });
                    i += 1;
                }
            }
            '&' => {
                if code[i..].starts_with("&&") {
                    tokens.push(SpannedToken { token: Token::AndAnd, offset: start });
                    i += 2;
                } else {
                    return Err(ExprError::Lex {
                        message: "bitwise `&` is not supported".to_string(),
                        offset: start,
                    });
                }
            }
            '|' => {
                if code[i..].starts_with("||") {
                    tokens.push(SpannedToken { token: Token::OrOr, offset: start });
                    i += 2;
                } else {
                    return Err(ExprError::Lex {
                        message: "bitwise `|` is not supported".to_string(),
                        offset: start,
                    });
                }
            }
            '+' => {
                tokens.push(SpannedToken { token: Token::Plus, offset: start });
                i += 1;
            }
            '-' => {
                tokens.push(SpannedToken { token: Token::Minus, offset: start });
                i += 1;
            }
            '*' => {
                tokens.push(SpannedToken { token: Token::Star, offset: start });
                i += 1;
            }
            '/' => {
                tokens.push(SpannedToken { token: Token::Slash, offset: start });
                i += 1;
            }
            '%' => {
                tokens.push(SpannedToken { token: Token::Percent, offset: start });
                i += 1;
            }
            '.' => {
                tokens.push(SpannedToken { token: Token::Dot, offset: start });
                i += 1;
            }
            ',' => {
                tokens.push(SpannedToken { token: Token::Comma, offset: start });
                i += 1;
            }
            ';' => {
                tokens.push(SpannedToken { token: Token::Semicolon, offset: start });
                i += 1;
            }
            '?' => {
                tokens.push(SpannedToken { token: Token::Question, offset: start });
                i += 1;
            }
            ':' => {
                tokens.push(SpannedToken { token: Token::Colon, offset: start });
                i += 1;
            }
            '(' => {
                tokens.push(SpannedToken { token: Token::LParen, offset: start });
                i += 1;
            }
            ')' => {
                tokens.push(SpannedToken { token: Token::RParen, offset: start });
                i += 1;
            }
            '[' => {
                tokens.push(SpannedToken { token: Token::LBracket, offset: start });
                i += 1;
            }
            ']' => {
                tokens.push(SpannedToken { token: Token::RBracket, offset: start });
                i += 1;
            }
            '{' => {
                tokens.push(SpannedToken { token: Token::LBrace, offset: start });
                i += 1;
            }
            '}' => {
                tokens.push(SpannedToken { token: Token::RBrace, offset: start });
                i += 1;
            }
            other => {
                return Err(ExprError::Lex {
                    message: format!("unexpected character `{other}`"),
                    offset: start,
                });
            }
        }
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_operators_and_literals() {
        let tokens = tokenize("a.b >= 2 && !done ? 'yes' : \"no\"").expect("lex");
        let kinds: Vec<&Token> = tokens.iter().map(|t| &t.token).collect();
        assert!(matches!(kinds[0], Token::Ident(n) if n == "a"));
        assert!(matches!(kinds[1], Token::Dot));
        assert!(matches!(kinds[3], Token::GtEq));
        assert!(matches!(kinds[4], Token::Number(n) if *n == 2.0));
        assert!(matches!(kinds[5], Token::AndAnd));
        assert!(matches!(kinds[6], Token::Not));
        assert!(matches!(kinds[8], Token::Question));
        assert!(matches!(kinds[9], Token::Str(s) if s == "yes"));
    }

    #[test]
    fn strict_equality_collapses() {
        let tokens = tokenize("a === b !== c").expect("lex");
        assert!(matches!(tokens[1].token, Token::EqEq));
        assert!(matches!(tokens[3].token, Token::NotEq));
    }

    #[test]
    fn string_escapes() {
        let tokens = tokenize(r#""line\nbreak""#).expect("lex");
        assert!(matches!(&tokens[0].token, Token::Str(s) if s == "line\nbreak"));
    }

    #[test]
    fn unterminated_string_errors() {
        assert!(tokenize("'oops").is_err());
    }

    #[test]
    fn keywords() {
        let tokens = tokenize("new Date() let x = null").expect("lex");
        assert!(matches!(tokens[0].token, Token::New));
        assert!(matches!(tokens[4].token, Token::Let));
        assert!(matches!(tokens[7].token, Token::Null));
    }
}
