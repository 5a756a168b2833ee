//! Compiled expression tree and its evaluator.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{OnceLock, RwLock};

use serde_json::Value;

use crate::document::Document;
use crate::value::{self, Parameters};

const LIKE_CACHE_MAX: usize = 256;

static LIKE_CACHE: OnceLock<RwLock<HashMap<String, regex::Regex>>> = OnceLock::new();

/// Binary comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    /// Operator spelling in N1QL.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }

    fn holds(self, ord: Ordering) -> bool {
        match self {
            Self::Eq => ord == Ordering::Equal,
            Self::Ne => ord != Ordering::Equal,
            Self::Lt => ord == Ordering::Less,
            Self::Le => ord != Ordering::Greater,
            Self::Gt => ord == Ordering::Greater,
            Self::Ge => ord != Ordering::Less,
        }
    }
}

/// A compiled query expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Constant value.
    Literal(Value),
    /// The MISSING constant.
    Missing,
    /// Array constructor.
    Array(Vec<Expr>),
    /// Property path into the document body; an empty path is the whole body.
    Property(Vec<String>),
    /// The document's id.
    DocumentId,
    /// The document's sequence.
    Sequence,
    /// Named query parameter.
    Parameter(String),
    /// Binary comparison.
    Compare(CompareOp, Box<Expr>, Box<Expr>),
    /// `IS` / `IS NOT`: identity comparison that treats null and MISSING as values.
    Is {
        negated: bool,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// `LIKE` / `NOT LIKE` with `%` and `_` wildcards.
    Like {
        negated: bool,
        lhs: Box<Expr>,
        pattern: Box<Expr>,
    },
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
}

/// Inputs available while evaluating an expression against one document.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    pub document: &'a Document,
    pub parameters: &'a Parameters,
}

impl Expr {
    /// Evaluates the expression. `None` is MISSING.
    #[must_use]
    pub fn eval(&self, ctx: &EvalContext<'_>) -> Option<Value> {
        match self {
            Self::Literal(v) => Some(v.clone()),
            Self::Missing => None,
            Self::Array(items) => Some(Value::Array(
                items
                    .iter()
                    .map(|item| item.eval(ctx).unwrap_or(Value::Null))
                    .collect(),
            )),
            Self::Property(path) => value::lookup_path(&ctx.document.body, path).cloned(),
            Self::DocumentId => Some(Value::String(ctx.document.id.clone())),
            Self::Sequence => Some(Value::from(ctx.document.sequence)),
            Self::Parameter(name) => ctx.parameters.get(name).cloned(),
            Self::Compare(op, lhs, rhs) => {
                let l = lhs.eval(ctx)?;
                let r = rhs.eval(ctx)?;
                let result = match op {
                    CompareOp::Eq | CompareOp::Ne => {
                        if l.is_null() || r.is_null() {
                            return None;
                        }
                        let equal = value::loosely_equal(&l, &r);
                        if *op == CompareOp::Eq {
                            equal
                        } else {
                            !equal
                        }
                    }
                    _ => op.holds(value::compare(&l, &r)?),
                };
                Some(Value::Bool(result))
            }
            Self::Is { negated, lhs, rhs } => {
                let l = lhs.eval(ctx);
                let r = rhs.eval(ctx);
                let same = match (&l, &r) {
                    (Some(a), Some(b)) => value::loosely_equal(a, b),
                    (None, None) => true,
                    _ => false,
                };
                Some(Value::Bool(same != *negated))
            }
            Self::Like {
                negated,
                lhs,
                pattern,
            } => {
                let subject = lhs.eval(ctx)?;
                let pattern = pattern.eval(ctx)?;
                let (Value::String(subject), Value::String(pattern)) = (subject, pattern) else {
                    return None;
                };
                let matched = like_regex(&pattern)?.is_match(&subject);
                Some(Value::Bool(matched != *negated))
            }
            Self::And(terms) => {
                for term in terms {
                    if !value::is_truthy(term.eval(ctx).as_ref()) {
                        return Some(Value::Bool(false));
                    }
                }
                Some(Value::Bool(true))
            }
            Self::Or(terms) => Some(Value::Bool(
                terms
                    .iter()
                    .any(|term| value::is_truthy(term.eval(ctx).as_ref())),
            )),
            Self::Not(inner) => {
                let v = inner.eval(ctx)?;
                match v {
                    Value::Bool(b) => Some(Value::Bool(!b)),
                    _ => None,
                }
            }
        }
    }

    /// Collects the names of parameters referenced by this expression.
    pub fn collect_parameters(&self, out: &mut BTreeSet<String>) {
        match self {
            Self::Parameter(name) => {
                out.insert(name.clone());
            }
            Self::Array(items) | Self::And(items) | Self::Or(items) => {
                items.iter().for_each(|e| e.collect_parameters(out));
            }
            Self::Compare(_, lhs, rhs)
            | Self::Is { lhs, rhs, .. }
            | Self::Like {
                lhs, pattern: rhs, ..
            } => {
                lhs.collect_parameters(out);
                rhs.collect_parameters(out);
            }
            Self::Not(inner) => inner.collect_parameters(out),
            Self::Literal(_)
            | Self::Missing
            | Self::Property(_)
            | Self::DocumentId
            | Self::Sequence => {}
        }
    }

    /// Property paths constrained by equality in this (conjunctive) filter.
    #[must_use]
    pub fn equality_paths(&self) -> Vec<&[String]> {
        match self {
            Self::Compare(CompareOp::Eq, lhs, rhs) => match (lhs.as_ref(), rhs.as_ref()) {
                (Self::Property(path), other) | (other, Self::Property(path))
                    if !path.is_empty() && !matches!(other, Self::Property(_)) =>
                {
                    vec![path.as_slice()]
                }
                _ => Vec::new(),
            },
            Self::And(terms) => terms.iter().flat_map(Self::equality_paths).collect(),
            _ => Vec::new(),
        }
    }
}

fn like_regex(pattern: &str) -> Option<regex::Regex> {
    let cache = LIKE_CACHE.get_or_init(|| RwLock::new(HashMap::new()));

    if let Ok(guard) = cache.read() {
        if let Some(re) = guard.get(pattern) {
            return Some(re.clone());
        }
    }

    let mut source = String::with_capacity(pattern.len() + 8);
    source.push_str("(?s)^");
    for ch in pattern.chars() {
        match ch {
            '%' => source.push_str(".*"),
            '_' => source.push('.'),
            other => source.push_str(&regex::escape(other.encode_utf8(&mut [0u8; 4]))),
        }
    }
    source.push('$');
    let compiled = regex::Regex::new(&source).ok()?;

    if let Ok(mut guard) = cache.write() {
        if guard.len() >= LIKE_CACHE_MAX {
            guard.clear();
        }
        guard
            .entry(pattern.to_string())
            .or_insert_with(|| compiled.clone());
    }
    Some(compiled)
}

fn write_list(f: &mut fmt::Formatter<'_>, items: &[Expr], sep: &str) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(sep)?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(Value::String(s)) => write!(f, "'{}'", s.replace('\'', "''")),
            Self::Literal(v) => write!(f, "{v}"),
            Self::Missing => f.write_str("MISSING"),
            Self::Array(items) => {
                f.write_str("[")?;
                write_list(f, items, ", ")?;
                f.write_str("]")
            }
            Self::Property(path) if path.is_empty() => f.write_str("*"),
            Self::Property(path) => f.write_str(&path.join(".")),
            Self::DocumentId => f.write_str("meta().id"),
            Self::Sequence => f.write_str("meta().sequence"),
            Self::Parameter(name) => write!(f, "${name}"),
            Self::Compare(op, lhs, rhs) => write!(f, "({lhs} {} {rhs})", op.symbol()),
            Self::Is { negated, lhs, rhs } => {
                let op = if *negated { "IS NOT" } else { "IS" };
                write!(f, "({lhs} {op} {rhs})")
            }
            Self::Like {
                negated,
                lhs,
                pattern,
            } => {
                let op = if *negated { "NOT LIKE" } else { "LIKE" };
                write!(f, "({lhs} {op} {pattern})")
            }
            Self::And(terms) => {
                f.write_str("(")?;
                write_list(f, terms, " AND ")?;
                f.write_str(")")
            }
            Self::Or(terms) => {
                f.write_str("(")?;
                write_list(f, terms, " OR ")?;
                f.write_str(")")
            }
            Self::Not(inner) => write!(f, "(NOT {inner})"),
        }
    }
}
