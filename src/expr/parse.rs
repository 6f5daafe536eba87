//! Recursive-descent / Pratt parser for the expression language
//!
//! Grammar (lowest to highest precedence):
//!   ternary   `cond ? a : b`
//!   logical   `||`, `&&`
//!   equality  `==`, `!=`
//!   relation  `<`, `>`, `<=`, `>=`
//!   additive  `+`, `-`
//!   multipl.  `*`, `/`, `%`
//!   unary     `!`, `-`
//!   postfix   `.prop`, `[index]`, `(args)` (method calls only)
//!   primary   literal, identifier, `new Ctor(args)`, `[..]`, `{..}`, `(expr)`

use serde::Serialize;

use super::token::{tokenize, SpannedToken, Token};
use super::ExprError;

/// Expression AST
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Expr {
    Null,
    Bool { value: bool },
    Number { value: f64 },
    Str { value: String },
    Ident { name: String },
    Member { object: Box<Expr>, property: String },
    Index { object: Box<Expr>, index: Box<Expr> },
    Unary { op: UnaryOp, operand: Box<Expr> },
    Binary { op: BinaryOp, left: Box<Expr>, right: Box<Expr> },
    Ternary { cond: Box<Expr>, then_branch: Box<Expr>, else_branch: Box<Expr> },
    /// Method call; the callee is always a member expression
    Call { object: Box<Expr>, method: String, args: Vec<Expr> },
    /// `new Ctor(args)` — constructor names are allow-listed by the safety
    /// validator before this is ever evaluated
    New { constructor: String, args: Vec<Expr> },
    Array { items: Vec<Expr> },
    Object { entries: Vec<(String, Expr)> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    NotEq,
    Lt,
    Gt,
    LtEq,
    GtEq,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

/// One statement of an embedded script
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Stmt {
    /// `let name = expr`
    Let { name: String, init: Expr },
    /// `target.path = expr`
    Assign { target: Vec<String>, expr: Expr },
    /// Bare expression (evaluated for its side-effect-free value)
    Expr { expr: Expr },
}

/// Parse a single expression; trailing tokens are an error.
pub fn parse_expression(code: &str) -> Result<Expr, ExprError> {
    let tokens = tokenize(code)?;
    let mut parser = Parser::new(&tokens);
    let expr = parser.ternary()?;
    parser.expect_end()?;
    Ok(expr)
}

/// Parse a script: statements separated by `;` (empty statements allowed).
pub fn parse_script(code: &str) -> Result<Vec<Stmt>, ExprError> {
    let tokens = tokenize(code)?;
    let mut parser = Parser::new(&tokens);
    let mut statements = Vec::new();
    while !parser.at_end() {
        if parser.eat(&Token::Semicolon) {
            continue;
        }
        statements.push(parser.statement()?);
        if !parser.at_end() {
            parser.expect(&Token::Semicolon)?;
        }
    }
    Ok(statements)
}

struct Parser<'t> {
    tokens: &'t [SpannedToken],
    pos: usize,
}

impl<'t> Parser<'t> {
    fn new(tokens: &'t [SpannedToken]) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|t| &t.token)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|t| t.offset)
            .unwrap_or(0)
    }

    fn advance(&mut self) -> Option<&'t Token> {
        let token = self.tokens.get(self.pos).map(|t| &t.token);
        self.pos += 1;
        token
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token) -> Result<(), ExprError> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.error(format!(
                "expected {}, found {}",
                token.describe(),
                self.peek().map(|t| t.describe()).unwrap_or_else(|| "end of input".into())
            )))
        }
    }

    fn expect_end(&self) -> Result<(), ExprError> {
        if self.at_end() {
            Ok(())
        } else {
            Err(self.error(format!(
                "unexpected {} after expression",
                self.peek().map(|t| t.describe()).unwrap_or_default()
            )))
        }
    }

    fn error(&self, message: String) -> ExprError {
        ExprError::Parse { message, offset: self.offset() }
    }

    // ---- statements ----

    fn statement(&mut self) -> Result<Stmt, ExprError> {
        if self.eat(&Token::Let) {
            let name = self.ident()?;
            self.expect(&Token::Assign)?;
            let init = self.ternary()?;
            return Ok(Stmt::Let { name, init });
        }

        // Lookahead for `path.to.field = expr`
        if let Some(target) = self.try_assignment_target() {
            let expr = self.ternary()?;
            return Ok(Stmt::Assign { target, expr });
        }

        let expr = self.ternary()?;
        Ok(Stmt::Expr { expr })
    }

    /// Consume `ident(.ident)* =` if present (not `==`), else rewind
    fn try_assignment_target(&mut self) -> Option<Vec<String>> {
        let start = self.pos;
        let mut path = Vec::new();
        match self.peek() {
            Some(Token::Ident(name)) => {
                path.push(name.clone());
                self.pos += 1;
            }
            _ => return None,
        }
        while self.eat(&Token::Dot) {
            match self.peek() {
                Some(Token::Ident(name)) => {
                    path.push(name.clone());
                    self.pos += 1;
                }
                _ => {
                    self.pos = start;
                    return None;
                }
            }
        }
        if self.eat(&Token::Assign) {
            Some(path)
        } else {
            self.pos = start;
            None
        }
    }

    fn ident(&mut self) -> Result<String, ExprError> {
        match self.advance() {
            Some(Token::Ident(name)) => Ok(name.clone()),
            other => Err(self.error(format!(
                "expected identifier, found {}",
                other.map(|t| t.describe()).unwrap_or_else(|| "end of input".into())
            ))),
        }
    }

    // ---- expressions ----

    fn ternary(&mut self) -> Result<Expr, ExprError> {
        let cond = self.logical_or()?;
        if self.eat(&Token::Question) {
            let then_branch = self.ternary()?;
            self.expect(&Token::Colon)?;
            let else_branch = self.ternary()?;
            return Ok(Expr::Ternary {
                cond: Box::new(cond),
                then_branch: Box::new(then_branch),
                else_branch: Box::new(else_branch),
            });
        }
        Ok(cond)
    }

    fn logical_or(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.logical_and()?;
        while self.eat(&Token::OrOr) {
            let right = self.logical_and()?;
            left = binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    fn logical_and(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.equality()?;
        while self.eat(&Token::AndAnd) {
            let right = self.equality()?;
            left = binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    fn equality(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.relational()?;
        loop {
            let op = match self.peek() {
                Some(Token::EqEq) => BinaryOp::Eq,
                Some(Token::NotEq) => BinaryOp::NotEq,
                _ => break,
            };
            self.pos += 1;
            let right = self.relational()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn relational(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinaryOp::Lt,
                Some(Token::Gt) => BinaryOp::Gt,
                Some(Token::LtEq) => BinaryOp::LtEq,
                Some(Token::GtEq) => BinaryOp::GtEq,
                _ => break,
            };
            self.pos += 1;
            let right = self.additive()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn additive(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.multiplicative()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn multiplicative(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Mod,
                _ => break,
            };
            self.pos += 1;
            let right = self.unary()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        if self.eat(&Token::Not) {
            let operand = self.unary()?;
            return Ok(Expr::Unary { op: UnaryOp::Not, operand: Box::new(operand) });
        }
        if self.eat(&Token::Minus) {
            let operand = self.unary()?;
            return Ok(Expr::Unary { op: UnaryOp::Neg, operand: Box::new(operand) });
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(&Token::Dot) {
                let property = self.ident()?;
                if self.eat(&Token::LParen) {
                    let args = self.arguments()?;
                    expr = Expr::Call { object: Box::new(expr), method: property, args };
                } else {
                    expr = Expr::Member { object: Box::new(expr), property };
                }
            } else if self.eat(&Token::LBracket) {
                let index = self.ternary()?;
                self.expect(&Token::RBracket)?;
                expr = Expr::Index { object: Box::new(expr), index: Box::new(index) };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn arguments(&mut self) -> Result<Vec<Expr>, ExprError> {
        let mut args = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.ternary()?);
            if self.eat(&Token::Comma) {
                continue;
            }
            self.expect(&Token::RParen)?;
            break;
        }
        Ok(args)
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        match self.peek().cloned() {
            Some(Token::Number(value)) => {
                self.pos += 1;
                Ok(Expr::Number { value })
            }
            Some(Token::Str(value)) => {
                self.pos += 1;
                Ok(Expr::Str { value })
            }
            Some(Token::Bool(value)) => {
                self.pos += 1;
                Ok(Expr::Bool { value })
            }
            Some(Token::Null) => {
                self.pos += 1;
                Ok(Expr::Null)
            }
            Some(Token::New) => {
                self.pos += 1;
                let constructor = self.ident()?;
                self.expect(&Token::LParen)?;
                let args = self.arguments()?;
                Ok(Expr::New { constructor, args })
            }
            Some(Token::Ident(name)) => {
                self.pos += 1;
                Ok(Expr::Ident { name })
            }
            Some(Token::LParen) => {
                self.pos += 1;
                let expr = self.ternary()?;
                self.expect(&Token::RParen)?;
                Ok(expr)
            }
            Some(Token::LBracket) => {
                self.pos += 1;
                let mut items = Vec::new();
                if !self.eat(&Token::RBracket) {
                    loop {
                        items.push(self.ternary()?);
                        if self.eat(&Token::Comma) {
                            continue;
                        }
                        self.expect(&Token::RBracket)?;
                        break;
                    }
                }
                Ok(Expr::Array { items })
            }
            Some(Token::LBrace) => {
                self.pos += 1;
                let mut entries = Vec::new();
                if !self.eat(&Token::RBrace) {
                    loop {
                        let key = match self.advance() {
                            Some(Token::Ident(name)) => name.clone(),
                            Some(Token::Str(s)) => s.clone(),
                            other => {
                                return Err(self.error(format!(
                                    "expected object key, found {}",
                                    other
                                        .map(|t| t.describe())
                                        .unwrap_or_else(|| "end of input".into())
                                )))
                            }
                        };
                        self.expect(&Token::Colon)?;
                        let value = self.ternary()?;
                        entries.push((key, value));
                        if self.eat(&Token::Comma) {
                            continue;
                        }
                        self.expect(&Token::RBrace)?;
                        break;
                    }
                }
                Ok(Expr::Object { entries })
            }
            other => Err(self.error(format!(
                "expected expression, found {}",
                other.map(|t| t.describe()).unwrap_or_else(|| "end of input".into())
            ))),
        }
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary { op, left: Box::new(left), right: Box::new(right) }
}

/// Walk every bare identifier that forms the base of a value reference.
/// Member properties, method names and constructor names are not reported.
pub fn for_each_base_identifier(expr: &Expr, visit: &mut dyn FnMut(&str)) {
    match expr {
        Expr::Ident { name } => visit(name),
        Expr::Member { object, .. } => for_each_base_identifier(object, visit),
        Expr::Index { object, index } => {
            for_each_base_identifier(object, visit);
            for_each_base_identifier(index, visit);
        }
        Expr::Unary { operand, .. } => for_each_base_identifier(operand, visit),
        Expr::Binary { left, right, .. } => {
            for_each_base_identifier(left, visit);
            for_each_base_identifier(right, visit);
        }
        Expr::Ternary { cond, then_branch, else_branch } => {
            for_each_base_identifier(cond, visit);
            for_each_base_identifier(then_branch, visit);
            for_each_base_identifier(else_branch, visit);
        }
        Expr::Call { object, args, .. } => {
            for_each_base_identifier(object, visit);
            for arg in args {
                for_each_base_identifier(arg, visit);
            }
        }
        Expr::New { args, .. } => {
            for arg in args {
                for_each_base_identifier(arg, visit);
            }
        }
        Expr::Array { items } => {
            for item in items {
                for_each_base_identifier(item, visit);
            }
        }
        Expr::Object { entries } => {
            for (_, value) in entries {
                for_each_base_identifier(value, visit);
            }
        }
        Expr::Null | Expr::Bool { .. } | Expr::Number { .. } | Expr::Str { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_and_ternary() {
        let expr = parse_expression("a + b * 2 > 10 ? 'big' : 'small'").expect("parse");
        let Expr::Ternary { cond, .. } = expr else { panic!("expected ternary") };
        let Expr::Binary { op: BinaryOp::Gt, left, .. } = *cond else { panic!("expected >") };
        let Expr::Binary { op: BinaryOp::Add, right, .. } = *left else { panic!("expected +") };
        assert!(matches!(*right, Expr::Binary { op: BinaryOp::Mul, .. }));
    }

    #[test]
    fn member_chains_and_calls() {
        let expr = parse_expression("input.user.name.toUpperCase()").expect("parse");
        let Expr::Call { object, method, args } = expr else { panic!("expected call") };
        assert_eq!(method, "toUpperCase");
        assert!(args.is_empty());
        assert!(matches!(*object, Expr::Member { .. }));
    }

    #[test]
    fn new_with_args() {
        let expr = parse_expression("new Number('42')").expect("parse");
        let Expr::New { constructor, args } = expr else { panic!("expected new") };
        assert_eq!(constructor, "Number");
        assert_eq!(args.len(), 1);
    }

    #[test]
    fn index_and_array_literals() {
        let expr = parse_expression("items[0] == [1, 2][1]").expect("parse");
        assert!(matches!(expr, Expr::Binary { op: BinaryOp::Eq, .. }));
    }

    #[test]
    fn trailing_tokens_rejected() {
        assert!(parse_expression("a b").is_err());
        assert!(parse_expression("a;").is_err());
    }

    #[test]
    fn scripts_parse_statements() {
        let script = parse_script("let x = 1; result.count = x + 2; x").expect("parse");
        assert_eq!(script.len(), 3);
        assert!(matches!(&script[0], Stmt::Let { name, .. } if name == "x"));
        assert!(matches!(&script[1], Stmt::Assign { target, .. } if target == &vec!["result".to_string(), "count".to_string()]));
        assert!(matches!(&script[2], Stmt::Expr { .. }));
    }

    #[test]
    fn base_identifier_walk() {
        let expr = parse_expression("input.score + bonus > limit ? ok.flag : new Date(seed)")
            .expect("parse");
        let mut seen = Vec::new();
        for_each_base_identifier(&expr, &mut |name| seen.push(name.to_string()));
        assert_eq!(seen, vec!["input", "bonus", "limit", "ok", "seed"]);
    }
}
