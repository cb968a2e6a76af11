//! Boolean expressions for CONDITION steps.
//!
//! Grammar: `path OP literal` with OP one of `==`, `!=`, `>`, `>=`, `<`,
//! `<=`, `contains`; or a bare `path` / `!path` tested for truthiness.
//! Paths are dotted lookups into the step scope. Literals are quoted
//! strings, numbers, `true`, `false`, or `null`.

use serde_json::Value;

use maestro_core::template::lookup_path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Truthy { path: String, negate: bool },
    Compare { path: String, op: Op, literal: Value },
}

fn is_path_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '[' | ']')
}

fn parse_literal(raw: &str) -> Result<Value, String> {
    let raw = raw.trim();
    if raw.len() >= 2
        && ((raw.starts_with('"') && raw.ends_with('"'))
            || (raw.starts_with('\'') && raw.ends_with('\'')))
    {
        return Ok(Value::String(raw[1..raw.len() - 1].to_string()));
    }
    match raw {
        "true" => return Ok(Value::Bool(true)),
        "false" => return Ok(Value::Bool(false)),
        "null" => return Ok(Value::Null),
        _ => {}
    }
    if let Ok(n) = raw.parse::<i64>() {
        return Ok(Value::from(n));
    }
    match raw.parse::<f64>() {
        Ok(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .ok_or_else(|| format!("invalid number '{}'", raw)),
        Err(_) => Err(format!("invalid literal '{}'", raw)),
    }
}

impl Expr {
    pub fn parse(input: &str) -> Result<Self, String> {
        let input = input.trim();
        let (negate, body) = match input.strip_prefix('!') {
            Some(rest) => (true, rest.trim_start()),
            None => (false, input),
        };

        let path_len = body.find(|c: char| !is_path_char(c)).unwrap_or(body.len());
        let path = &body[..path_len];
        if path.is_empty() {
            return Err(format!("expected a path in '{}'", input));
        }
        let rest = body[path_len..].trim_start();
        if rest.is_empty() {
            return Ok(Expr::Truthy {
                path: path.to_string(),
                negate,
            });
        }
        if negate {
            return Err("'!' only applies to a bare path".to_string());
        }

        // Two-character operators first so `>=` never parses as `>`.
        const OPS: [(&str, Op); 7] = [
            (">=", Op::Gte),
            ("<=", Op::Lte),
            ("==", Op::Eq),
            ("!=", Op::Ne),
            (">", Op::Gt),
            ("<", Op::Lt),
            ("contains", Op::Contains),
        ];
        for (token, op) in OPS {
            if let Some(literal) = rest.strip_prefix(token) {
                if op == Op::Contains && !literal.starts_with(char::is_whitespace) {
                    continue;
                }
                if literal.trim().is_empty() {
                    return Err(format!("missing literal after '{}'", token));
                }
                return Ok(Expr::Compare {
                    path: path.to_string(),
                    op,
                    literal: parse_literal(literal)?,
                });
            }
        }
        Err(format!("unknown operator in '{}'", input))
    }

    /// Evaluate against a scope. Missing paths read as `null`.
    pub fn evaluate(&self, scope: &Value) -> Result<bool, String> {
        match self {
            Expr::Truthy { path, negate } => {
                let value = lookup_path(scope, path).unwrap_or(&Value::Null);
                Ok(truthy(value) != *negate)
            }
            Expr::Compare { path, op, literal } => {
                let value = lookup_path(scope, path).unwrap_or(&Value::Null);
                compare(value, *op, literal).map_err(|e| format!("{}: {}", path, e))
            }
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(value: &Value, op: Op, literal: &Value) -> Result<bool, String> {
    use std::cmp::Ordering;

    let ordering = || -> Result<Ordering, String> {
        match (value, literal) {
            (Value::Number(a), Value::Number(b)) => {
                let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
                a.partial_cmp(&b).ok_or_else(|| "numbers are not comparable".to_string())
            }
            (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
            _ => Err(format!("cannot order {} against {}", value, literal)),
        }
    };

    match op {
        Op::Eq => Ok(loosely_equal(value, literal)),
        Op::Ne => Ok(!loosely_equal(value, literal)),
        Op::Gt => Ok(ordering()? == Ordering::Greater),
        Op::Gte => Ok(ordering()? != Ordering::Less),
        Op::Lt => Ok(ordering()? == Ordering::Less),
        Op::Lte => Ok(ordering()? != Ordering::Greater),
        Op::Contains => match (value, literal) {
            (Value::String(s), Value::String(needle)) => Ok(s.contains(needle.as_str())),
            (Value::Array(items), _) => Ok(items.iter().any(|item| loosely_equal(item, literal))),
            (Value::Object(map), Value::String(key)) => Ok(map.contains_key(key)),
            _ => Err(format!("'contains' is not defined for {}", value)),
        },
    }
}
