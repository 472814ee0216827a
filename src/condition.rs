use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use crate::error::FlowError;
use crate::state::VariableSource;
use crate::template::value_to_text;

/// Operators in the order they are searched for; two-character forms first.
const OPERATORS: [(&str, CompareOp); 6] = [
    ("==", CompareOp::Eq),
    ("!=", CompareOp::Ne),
    (">=", CompareOp::Ge),
    ("<=", CompareOp::Le),
    (">", CompareOp::Gt),
    ("<", CompareOp::Lt),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Ge,
    Le,
    Gt,
    Lt,
}

impl CompareOp {
    fn holds(self, ordering: Option<Ordering>) -> bool {
        match (self, ordering) {
            (CompareOp::Ne, None) => true,
            (_, None) => false,
            (CompareOp::Eq, Some(o)) => o == Ordering::Equal,
            (CompareOp::Ne, Some(o)) => o != Ordering::Equal,
            (CompareOp::Ge, Some(o)) => o != Ordering::Less,
            (CompareOp::Le, Some(o)) => o != Ordering::Greater,
            (CompareOp::Gt, Some(o)) => o == Ordering::Greater,
            (CompareOp::Lt, Some(o)) => o == Ordering::Less,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Text(String),
    Int(i64),
    Float(f64),
    Variable(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Or(Box<Condition>, Box<Condition>),
    And(Box<Condition>, Box<Condition>),
    Compare {
        left: Operand,
        op: CompareOp,
        right: Operand,
    },
}

/// Resolved operand: numbers compare numerically, everything else as text.
enum Scalar {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Scalar {
    fn from_value(value: &Value) -> Self {
        match value {
            Value::Number(n) => match n.as_i64() {
                Some(i) => Scalar::Int(i),
                None => Scalar::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            other => Scalar::Text(value_to_text(other)),
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Int(i) => Some(*i as f64),
            Scalar::Float(f) => Some(*f),
            Scalar::Text(_) => None,
        }
    }

    fn text(&self) -> String {
        match self {
            Scalar::Int(i) => i.to_string(),
            Scalar::Float(f) if f.fract() == 0.0 && f.is_finite() && f.abs() < 1e15 => {
                format!("{}", *f as i64)
            }
            Scalar::Float(f) => f.to_string(),
            Scalar::Text(s) => s.clone(),
        }
    }

    fn compare(&self, other: &Scalar) -> Option<Ordering> {
        match (self, other) {
            (Scalar::Int(a), Scalar::Int(b)) => Some(a.cmp(b)),
            (Scalar::Text(_), _) | (_, Scalar::Text(_)) => Some(self.text().cmp(&other.text())),
            (a, b) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        }
    }
}

/// Byte offsets of every occurrence of `pat` outside single or double quotes.
fn find_unquoted(s: &str, pat: &str) -> Vec<usize> {
    let mut hits = Vec::new();
    let mut quote: Option<char> = None;
    let mut iter = s.char_indices();
    while let Some((i, c)) = iter.next() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '\'' || c == '"' => quote = Some(c),
            None if s[i..].starts_with(pat) => {
                hits.push(i);
                for _ in 1..pat.chars().count() {
                    iter.next();
                }
            }
            None => {}
        }
    }
    hits
}

fn split_unquoted<'a>(s: &'a str, sep: &str) -> Vec<&'a str> {
    let mut parts = Vec::new();
    let mut last = 0;
    for at in find_unquoted(s, sep) {
        parts.push(&s[last..at]);
        last = at + sep.len();
    }
    parts.push(&s[last..]);
    parts
}

fn is_variable_name(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

fn parse_operand(raw: &str, expr: &str) -> Result<Operand, FlowError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(FlowError::Condition(format!("missing operand in `{expr}`")));
    }
    for q in ['\'', '"'] {
        if raw.starts_with(q) {
            return match raw[1..].strip_suffix(q) {
                Some(inner) if !inner.contains(q) => Ok(Operand::Text(inner.to_string())),
                _ => Err(FlowError::Condition(format!(
                    "unterminated string `{raw}` in `{expr}`"
                ))),
            };
        }
    }
    if let Ok(i) = raw.parse::<i64>() {
        return Ok(Operand::Int(i));
    }
    if let Ok(f) = raw.parse::<f64>() {
        if f.is_finite() {
            return Ok(Operand::Float(f));
        }
    }
    if is_variable_name(raw) {
        Ok(Operand::Variable(raw.to_string()))
    } else {
        Err(FlowError::Condition(format!(
            "`{raw}` is not a literal or variable name in `{expr}`"
        )))
    }
}

fn parse_comparison(s: &str, expr: &str) -> Result<Condition, FlowError> {
    for (symbol, op) in OPERATORS {
        if let Some(&at) = find_unquoted(s, symbol).first() {
            let left = parse_operand(&s[..at], expr)?;
            let right = parse_operand(&s[at + symbol.len()..], expr)?;
            return Ok(Condition::Compare { left, op, right });
        }
    }
    Err(FlowError::Condition(format!(
        "no comparison operator in `{}` of `{expr}`",
        s.trim()
    )))
}

fn parse_and(s: &str, expr: &str) -> Result<Condition, FlowError> {
    let mut parts = split_unquoted(s, "&&").into_iter();
    let first = parts.next().unwrap_or_default();
    let mut acc = parse_comparison(first, expr)?;
    for part in parts {
        acc = Condition::And(Box::new(acc), Box::new(parse_comparison(part, expr)?));
    }
    Ok(acc)
}

impl Condition {
    /// Parse an expression; `&&` binds tighter than `||`, both left-associative.
    pub fn parse(expr: &str) -> Result<Self, FlowError> {
        if expr.trim().is_empty() {
            return Err(FlowError::Condition("empty condition".into()));
        }
        let mut parts = split_unquoted(expr, "||").into_iter();
        let first = parts.next().unwrap_or_default();
        let mut acc = parse_and(first, expr)?;
        for part in parts {
            acc = Condition::Or(Box::new(acc), Box::new(parse_and(part, expr)?));
        }
        Ok(acc)
    }

    /// Evaluate with short-circuiting; unevaluated operands are never looked up.
    pub fn evaluate(&self, vars: &impl VariableSource) -> Result<bool, FlowError> {
        match self {
            Condition::Or(a, b) => Ok(a.evaluate(vars)? || b.evaluate(vars)?),
            Condition::And(a, b) => Ok(a.evaluate(vars)? && b.evaluate(vars)?),
            Condition::Compare { left, op, right } => {
                let l = resolve(left, vars)?;
                let r = resolve(right, vars)?;
                Ok(op.holds(l.compare(&r)))
            }
        }
    }
}

fn resolve(operand: &Operand, vars: &impl VariableSource) -> Result<Scalar, FlowError> {
    match operand {
        Operand::Text(s) => Ok(Scalar::Text(s.clone())),
        Operand::Int(i) => Ok(Scalar::Int(*i)),
        Operand::Float(f) => Ok(Scalar::Float(*f)),
        Operand::Variable(name) => vars
            .lookup(name)
            .map(|v| Scalar::from_value(&v))
            .ok_or_else(|| FlowError::Condition(format!("unknown variable `{name}`"))),
    }
}

impl FromStr for Condition {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Condition::parse(s)
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Text(s) => write!(f, "'{s}'"),
            Operand::Int(i) => write!(f, "{i}"),
            Operand::Float(x) => write!(f, "{x}"),
            Operand::Variable(v) => f.write_str(v),
        }
    }
}

/// Parse and evaluate in one go.
pub fn evaluate(expr: &str, vars: &impl VariableSource) -> Result<bool, FlowError> {
    Condition::parse(expr)?.evaluate(vars)
}
