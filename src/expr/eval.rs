//! Interpreter for the expression language over `serde_json::Value`
//!
//! Evaluation never executes host-language code: constructor calls are
//! limited to the value constructors and method calls to a fixed set of
//! string/array helpers. Unknown identifiers resolve through the caller's
//! [`Scope`], which is how data-model fields and run inputs become visible.

use serde_json::{json, Map, Value};

use super::parse::{BinaryOp, Expr, Stmt, UnaryOp};
use super::ExprError;

/// Variable resolution hook supplied by the caller
pub trait Scope {
    fn get_var(&self, name: &str) -> Option<Value>;
}

impl Scope for Map<String, Value> {
    fn get_var(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

impl Scope for std::collections::HashMap<String, Value> {
    fn get_var(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

/// JS-style truthiness: `null`, `false`, `0`, `NaN` and `""` are falsy
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Render a value the way string interpolation does
pub fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => match n.as_f64() {
            // Whole floats print without the trailing `.0`
            Some(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}

/// Evaluate a parsed expression against a scope
pub fn evaluate(expr: &Expr, scope: &dyn Scope) -> Result<Value, ExprError> {
    match expr {
        Expr::Null => Ok(Value::Null),
        Expr::Bool { value } => Ok(Value::Bool(*value)),
        Expr::Number { value } => Ok(json!(value)),
        Expr::Str { value } => Ok(Value::String(value.clone())),
        Expr::Ident { name } => scope
            .get_var(name)
            .ok_or_else(|| ExprError::Eval { message: format!("unknown variable `{name}`") }),
        Expr::Member { object, property } => {
            let object = evaluate(object, scope)?;
            Ok(member(&object, property))
        }
        Expr::Index { object, index } => {
            let object = evaluate(object, scope)?;
            let index = evaluate(index, scope)?;
            Ok(match (&object, &index) {
                (Value::Array(items), Value::Number(n)) => n
                    .as_u64()
                    .and_then(|i| items.get(i as usize))
                    .cloned()
                    .unwrap_or(Value::Null),
                (Value::Object(map), Value::String(key)) => {
                    map.get(key).cloned().unwrap_or(Value::Null)
                }
                _ => Value::Null,
            })
        }
        Expr::Unary { op, operand } => {
            let value = evaluate(operand, scope)?;
            Ok(match op {
                UnaryOp::Not => Value::Bool(!is_truthy(&value)),
                UnaryOp::Neg => json!(-as_number(&value)),
            })
        }
        Expr::Binary { op, left, right } => binary(*op, left, right, scope),
        Expr::Ternary { cond, then_branch, else_branch } => {
            let cond = evaluate(cond, scope)?;
            if is_truthy(&cond) {
                evaluate(then_branch, scope)
            } else {
                evaluate(else_branch, scope)
            }
        }
        Expr::Call { object, method, args } => {
            let receiver = evaluate(object, scope)?;
            let args = args
                .iter()
                .map(|a| evaluate(a, scope))
                .collect::<Result<Vec<_>, _>>()?;
            call_method(&receiver, method, &args)
        }
        Expr::New { constructor, args } => {
            let args = args
                .iter()
                .map(|a| evaluate(a, scope))
                .collect::<Result<Vec<_>, _>>()?;
            construct(constructor, &args)
        }
        Expr::Array { items } => {
            let values = items
                .iter()
                .map(|i| evaluate(i, scope))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Array(values))
        }
        Expr::Object { entries } => {
            let mut map = Map::with_capacity(entries.len());
            for (key, value) in entries {
                map.insert(key.clone(), evaluate(value, scope)?);
            }
            Ok(Value::Object(map))
        }
    }
}

/// Run a script: statements execute in order against a mutable local frame
/// layered over the read-only outer scope. Returns the locals written plus
/// the value of the final expression statement, if any.
pub fn run_script(
    statements: &[Stmt],
    scope: &dyn Scope,
) -> Result<(Map<String, Value>, Option<Value>), ExprError> {
    struct Layered<'a> {
        locals: &'a Map<String, Value>,
        outer: &'a dyn Scope,
    }
    impl Scope for Layered<'_> {
        fn get_var(&self, name: &str) -> Option<Value> {
            self.locals.get(name).cloned().or_else(|| self.outer.get_var(name))
        }
    }

    let mut locals = Map::new();
    let mut last = None;
    for statement in statements {
        let layered = Layered { locals: &locals, outer: scope };
        match statement {
            Stmt::Let { name, init } => {
                let value = evaluate(init, &layered)?;
                locals.insert(name.clone(), value);
                last = None;
            }
            Stmt::Assign { target, expr } => {
                let value = evaluate(expr, &layered)?;
                assign_path(&mut locals, target, value);
                last = None;
            }
            Stmt::Expr { expr } => {
                last = Some(evaluate(expr, &layered)?);
            }
        }
    }
    Ok((locals, last))
}

fn assign_path(locals: &mut Map<String, Value>, path: &[String], value: Value) {
    let Some((head, rest)) = path.split_first() else { return };
    if rest.is_empty() {
        locals.insert(head.clone(), value);
        return;
    }
    let entry = locals
        .entry(head.clone())
        .or_insert_with(|| Value::Object(Map::new()));
    let mut current = entry;
    for (i, segment) in rest.iter().enumerate() {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let map = current.as_object_mut().expect("object ensured above");
        if i == rest.len() - 1 {
            map.insert(segment.clone(), value);
            return;
        }
        current = map
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

fn member(object: &Value, property: &str) -> Value {
    match object {
        Value::Object(map) => map.get(property).cloned().unwrap_or(Value::Null),
        Value::Array(items) => match property {
            "length" => json!(items.len()),
            _ => property
                .parse::<usize>()
                .ok()
                .and_then(|i| items.get(i))
                .cloned()
                .unwrap_or(Value::Null),
        },
        Value::String(s) => match property {
            "length" => json!(s.chars().count()),
            _ => Value::Null,
        },
        _ => Value::Null,
    }
}

fn binary(op: BinaryOp, left: &Expr, right: &Expr, scope: &dyn Scope) -> Result<Value, ExprError> {
    // Short-circuit forms first
    match op {
        BinaryOp::And => {
            let l = evaluate(left, scope)?;
            return if is_truthy(&l) { evaluate(right, scope) } else { Ok(l) };
        }
        BinaryOp::Or => {
            let l = evaluate(left, scope)?;
            return if is_truthy(&l) { Ok(l) } else { evaluate(right, scope) };
        }
        _ => {}
    }

    let l = evaluate(left, scope)?;
    let r = evaluate(right, scope)?;
    Ok(match op {
        BinaryOp::Eq => Value::Bool(loose_eq(&l, &r)),
        BinaryOp::NotEq => Value::Bool(!loose_eq(&l, &r)),
        BinaryOp::Lt => Value::Bool(as_number(&l) < as_number(&r)),
        BinaryOp::Gt => Value::Bool(as_number(&l) > as_number(&r)),
        BinaryOp::LtEq => Value::Bool(as_number(&l) <= as_number(&r)),
        BinaryOp::GtEq => Value::Bool(as_number(&l) >= as_number(&r)),
        BinaryOp::Add => {
            if l.is_string() || r.is_string() {
                Value::String(format!("{}{}", stringify(&l), stringify(&r)))
            } else {
                json!(as_number(&l) + as_number(&r))
            }
        }
        BinaryOp::Sub => json!(as_number(&l) - as_number(&r)),
        BinaryOp::Mul => json!(as_number(&l) * as_number(&r)),
        BinaryOp::Div => {
            let divisor = as_number(&r);
            if divisor == 0.0 {
                Value::Null
            } else {
                json!(as_number(&l) / divisor)
            }
        }
        BinaryOp::Mod => {
            let divisor = as_number(&r);
            if divisor == 0.0 {
                Value::Null
            } else {
                json!(as_number(&l) % divisor)
            }
        }
        BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
    })
}

fn loose_eq(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => {
            a.as_f64().unwrap_or(f64::NAN) == b.as_f64().unwrap_or(f64::NAN)
        }
        (Value::Number(_), Value::String(s)) | (Value::String(s), Value::Number(_)) => {
            s.parse::<f64>().map(|n| {
                let other = if l.is_number() { l } else { r };
                other.as_f64() == Some(n)
            }).unwrap_or(false)
        }
        _ => l == r,
    }
}

fn as_number(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::Bool(true) => 1.0,
        Value::Bool(false) | Value::Null => 0.0,
        Value::String(s) => s.trim().parse().unwrap_or(f64::NAN),
        _ => f64::NAN,
    }
}

fn call_method(receiver: &Value, method: &str, args: &[Value]) -> Result<Value, ExprError> {
    let arg0 = args.first();
    let result = match (receiver, method) {
        (Value::String(s), "includes") => {
            json!(arg0.map(|a| s.contains(&stringify(a))).unwrap_or(false))
        }
        (Value::String(s), "startsWith") => {
            json!(arg0.map(|a| s.starts_with(&stringify(a))).unwrap_or(false))
        }
        (Value::String(s), "endsWith") => {
            json!(arg0.map(|a| s.ends_with(&stringify(a))).unwrap_or(false))
        }
        (Value::String(s), "toUpperCase") => json!(s.to_uppercase()),
        (Value::String(s), "toLowerCase") => json!(s.to_lowercase()),
        (Value::String(s), "trim") => json!(s.trim()),
        (Value::String(s), "split") => {
            let sep = arg0.map(stringify).unwrap_or_default();
            if sep.is_empty() {
                json!([s])
            } else {
                json!(s.split(&sep).collect::<Vec<_>>())
            }
        }
        (Value::String(s), "indexOf") => {
            let needle = arg0.map(stringify).unwrap_or_default();
            json!(s.find(&needle).map(|i| i as i64).unwrap_or(-1))
        }
        (Value::Array(items), "includes") => {
            json!(arg0.map(|a| items.contains(a)).unwrap_or(false))
        }
        (Value::Array(items), "join") => {
            let sep = arg0.map(stringify).unwrap_or_else(|| ",".to_string());
            json!(items.iter().map(stringify).collect::<Vec<_>>().join(&sep))
        }
        (Value::Array(items), "indexOf") => {
            json!(arg0
                .and_then(|a| items.iter().position(|i| i == a))
                .map(|i| i as i64)
                .unwrap_or(-1))
        }
        (value, "toString") => json!(stringify(value)),
        _ => {
            return Err(ExprError::Eval {
                message: format!("unsupported method `.{method}()` on this value"),
            })
        }
    };
    Ok(result)
}

/// Allow-listed value constructors. The safety validator rejects anything
/// outside this set before evaluation.
fn construct(constructor: &str, args: &[Value]) -> Result<Value, ExprError> {
    let arg0 = args.first();
    Ok(match constructor {
        "String" => Value::String(arg0.map(stringify).unwrap_or_default()),
        "Number" => json!(arg0.map(as_number).unwrap_or(0.0)),
        "Boolean" => Value::Bool(arg0.map(is_truthy).unwrap_or(false)),
        "Array" => Value::Array(args.to_vec()),
        "Object" => arg0.cloned().unwrap_or_else(|| Value::Object(Map::new())),
        "Date" => {
            let millis = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
            json!(millis)
        }
        other => {
            return Err(ExprError::Eval {
                message: format!("constructor `{other}` is not allowed"),
            })
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::parse::parse_expression;

    fn scope(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn eval(code: &str, scope: &Map<String, Value>) -> Value {
        evaluate(&parse_expression(code).expect("parse"), scope).expect("eval")
    }

    #[test]
    fn arithmetic_and_comparison() {
        let s = scope(&[("x", json!(4))]);
        assert_eq!(eval("x * 2 + 1", &s), json!(9.0));
        assert_eq!(eval("x > 3 && x < 10", &s), json!(true));
        assert_eq!(eval("x == 4 ? 'yes' : 'no'", &s), json!("yes"));
    }

    #[test]
    fn string_concat_and_methods() {
        let s = scope(&[("name", json!("World"))]);
        assert_eq!(eval("'Hello ' + name", &s), json!("Hello World"));
        assert_eq!(eval("name.toUpperCase()", &s), json!("WORLD"));
        assert_eq!(eval("name.includes('orl')", &s), json!(true));
        assert_eq!(eval("name.length", &s), json!(5));
    }

    #[test]
    fn member_and_index_access() {
        let s = scope(&[("user", json!({"tags": ["a", "b"], "info": {"age": 30}}))]);
        assert_eq!(eval("user.tags[1]", &s), json!("b"));
        assert_eq!(eval("user.info.age", &s), json!(30));
        assert_eq!(eval("user.tags.length", &s), json!(2));
        assert_eq!(eval("user.missing", &s), Value::Null);
    }

    #[test]
    fn short_circuit_skips_unknown() {
        let s = scope(&[("flag", json!(false))]);
        // `flag && missing` never evaluates `missing`
        assert_eq!(eval("flag && missing", &s), json!(false));
        assert!(evaluate(&parse_expression("missing").unwrap(), &s).is_err());
    }

    #[test]
    fn constructors() {
        let s = scope(&[]);
        assert_eq!(eval("new String(42)", &s), json!("42"));
        assert_eq!(eval("new Number('3.5')", &s), json!(3.5));
        assert_eq!(eval("new Boolean('x')", &s), json!(true));
        assert_eq!(eval("new Array(1, 2)", &s), json!([1.0, 2.0]));
        let err = evaluate(&parse_expression("new RegExp('x')").unwrap(), &s).unwrap_err();
        assert!(err.to_string().contains("not allowed"));
    }

    #[test]
    fn division_by_zero_is_null() {
        let s = scope(&[]);
        assert_eq!(eval("1 / 0", &s), Value::Null);
        assert_eq!(eval("5 % 0", &s), Value::Null);
    }

    #[test]
    fn scripts_mutate_locals() {
        let s = scope(&[("base", json!(10))]);
        let script = crate::expr::parse::parse_script(
            "let doubled = base * 2; result.total = doubled + 1; doubled",
        )
        .expect("parse");
        let (locals, last) = run_script(&script, &s).expect("run");
        assert_eq!(locals["doubled"], json!(20.0));
        assert_eq!(locals["result"]["total"], json!(21.0));
        assert_eq!(last, Some(json!(20.0)));
    }

    #[test]
    fn truthiness_rules() {
        assert!(!is_truthy(&Value::Null));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(is_truthy(&json!([])));
        assert!(is_truthy(&json!("x")));
    }
}
