//! Front end for the JSON query schema.
//!
//! A query is a JSON object with the optional keys `WHAT`, `FROM`, `WHERE`,
//! `ORDER_BY`, `LIMIT`, `OFFSET` and `DISTINCT`. A top-level array is shorthand
//! for a query with only a `WHERE` clause. Expressions are arrays whose first
//! element names the operator, e.g. `["=", [".", "type"], "task"]`.

use serde_json::{Map, Value};

use crate::document::DEFAULT_COLLECTION;
use crate::error::CompileError;

use super::expr::{CompareOp, Expr};
use super::plan::{Column, OrderTerm, QueryPlan};

const KNOWN_KEYS: [&str; 7] = ["WHAT", "FROM", "WHERE", "ORDER_BY", "LIMIT", "OFFSET", "DISTINCT"];

/// Compiles JSON query text into a plan.
pub fn compile(text: &str) -> Result<QueryPlan, CompileError> {
    let root: Value = serde_json::from_str(text).map_err(|e| {
        CompileError::at(
            byte_offset(text, e.line(), e.column()),
            format!("invalid JSON: {e}"),
        )
    })?;

    match root {
        Value::Array(_) => {
            let filter = compile_expr(&root)?;
            Ok(default_plan(DEFAULT_COLLECTION.to_string(), Some(filter)))
        }
        Value::Object(map) => compile_object(&map),
        _ => Err(CompileError::unknown("query must be a JSON object or array")),
    }
}

fn default_plan(collection: String, filter: Option<Expr>) -> QueryPlan {
    QueryPlan {
        columns: vec![Column::new(Expr::DocumentId, None, 0, &collection)],
        collection,
        filter,
        order_by: Vec::new(),
        limit: None,
        offset: None,
        distinct: false,
    }
}

fn compile_object(map: &Map<String, Value>) -> Result<QueryPlan, CompileError> {
    if let Some(key) = map.keys().find(|k| !KNOWN_KEYS.contains(&k.as_str())) {
        return Err(CompileError::unknown(format!("unknown query property '{key}'")));
    }

    let collection = match map.get("FROM") {
        None => DEFAULT_COLLECTION.to_string(),
        Some(from) => compile_from(from)?,
    };

    let filter = map.get("WHERE").map(compile_expr).transpose()?;
    let mut plan = default_plan(collection, filter);

    if let Some(what) = map.get("WHAT") {
        let items = what
            .as_array()
            .ok_or_else(|| CompileError::unknown("WHAT must be an array"))?;
        if items.is_empty() {
            return Err(CompileError::unknown("WHAT must not be empty"));
        }
        plan.columns = items
            .iter()
            .enumerate()
            .map(|(i, item)| compile_column(item, i, &plan.collection))
            .collect::<Result<_, _>>()?;
    }

    if let Some(order) = map.get("ORDER_BY") {
        let terms = order
            .as_array()
            .ok_or_else(|| CompileError::unknown("ORDER_BY must be an array"))?;
        plan.order_by = terms.iter().map(compile_order_term).collect::<Result<_, _>>()?;
    }

    plan.limit = map.get("LIMIT").map(compile_expr).transpose()?;
    plan.offset = map.get("OFFSET").map(compile_expr).transpose()?;
    plan.distinct = match map.get("DISTINCT") {
        None => false,
        Some(Value::Bool(b)) => *b,
        Some(_) => return Err(CompileError::unknown("DISTINCT must be a boolean")),
    };

    Ok(plan)
}

fn compile_from(from: &Value) -> Result<String, CompileError> {
    let sources = from
        .as_array()
        .ok_or_else(|| CompileError::unknown("FROM must be an array"))?;
    let [source] = sources.as_slice() else {
        return Err(CompileError::unknown("FROM must name exactly one collection"));
    };
    let source = source
        .as_object()
        .ok_or_else(|| CompileError::unknown("FROM entries must be objects"))?;
    if source.contains_key("ON") || source.contains_key("JOIN") {
        return Err(CompileError::unknown("joins are not supported"));
    }
    match source.get("COLLECTION") {
        Some(Value::String(name)) if !name.trim().is_empty() => Ok(name.trim().to_string()),
        None => Ok(DEFAULT_COLLECTION.to_string()),
        Some(_) => Err(CompileError::unknown("FROM COLLECTION must be a non-empty string")),
    }
}

fn compile_column(item: &Value, position: usize, collection: &str) -> Result<Column, CompileError> {
    if let Some([op, expr, alias]) = item.as_array().map(Vec::as_slice) {
        if op.as_str() == Some("AS") {
            let alias = alias
                .as_str()
                .ok_or_else(|| CompileError::unknown("AS alias must be a string"))?;
            return Ok(Column::new(
                compile_expr(expr)?,
                Some(alias.to_string()),
                position,
                collection,
            ));
        }
    }
    Ok(Column::new(compile_expr(item)?, None, position, collection))
}

fn compile_order_term(term: &Value) -> Result<OrderTerm, CompileError> {
    if let Some([op, expr]) = term.as_array().map(Vec::as_slice) {
        match op.as_str() {
            Some("DESC") => {
                return Ok(OrderTerm {
                    expr: compile_expr(expr)?,
                    descending: true,
                })
            }
            Some("ASC") => {
                return Ok(OrderTerm {
                    expr: compile_expr(expr)?,
                    descending: false,
                })
            }
            _ => {}
        }
    }
    Ok(OrderTerm {
        expr: compile_expr(term)?,
        descending: false,
    })
}

/// Compiles one JSON-schema expression.
pub fn compile_expr(value: &Value) -> Result<Expr, CompileError> {
    let Value::Array(items) = value else {
        return Ok(Expr::Literal(value.clone()));
    };
    let Some((head, args)) = items.split_first() else {
        return Err(CompileError::unknown("empty expression array"));
    };
    let Some(op) = head.as_str() else {
        return Err(CompileError::unknown(format!(
            "expression operator must be a string, got {head}"
        )));
    };

    if let Some(rest) = op.strip_prefix('.') {
        return compile_property(rest, args);
    }
    if let Some(rest) = op.strip_prefix('$') {
        return compile_parameter(rest, args);
    }

    let op_upper = op.to_ascii_uppercase();
    match op_upper.as_str() {
        "=" | "==" => binary(CompareOp::Eq, op, args),
        "!=" | "<>" => binary(CompareOp::Ne, op, args),
        "<" => binary(CompareOp::Lt, op, args),
        "<=" => binary(CompareOp::Le, op, args),
        ">" => binary(CompareOp::Gt, op, args),
        ">=" => binary(CompareOp::Ge, op, args),
        "IS" | "IS NOT" => {
            let (lhs, rhs) = two_args(op, args)?;
            Ok(Expr::Is {
                negated: op_upper == "IS NOT",
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            })
        }
        "LIKE" | "NOT LIKE" => {
            let (lhs, pattern) = two_args(op, args)?;
            Ok(Expr::Like {
                negated: op_upper == "NOT LIKE",
                lhs: Box::new(lhs),
                pattern: Box::new(pattern),
            })
        }
        "AND" | "OR" => {
            if args.len() < 2 {
                return Err(CompileError::unknown(format!("{op} needs at least 2 operands")));
            }
            let terms = args.iter().map(compile_expr).collect::<Result<Vec<_>, _>>()?;
            Ok(if op_upper == "AND" {
                Expr::And(terms)
            } else {
                Expr::Or(terms)
            })
        }
        "NOT" => {
            let [inner] = args else {
                return Err(CompileError::unknown("NOT takes exactly 1 operand"));
            };
            Ok(Expr::Not(Box::new(compile_expr(inner)?)))
        }
        "MISSING" if args.is_empty() => Ok(Expr::Missing),
        "[]" => Ok(Expr::Array(
            args.iter().map(compile_expr).collect::<Result<_, _>>()?,
        )),
        _ => Err(CompileError::unknown(format!("unknown operator '{op}'"))),
    }
}

fn binary(op: CompareOp, name: &str, args: &[Value]) -> Result<Expr, CompileError> {
    let (lhs, rhs) = two_args(name, args)?;
    Ok(Expr::Compare(op, Box::new(lhs), Box::new(rhs)))
}

fn two_args(name: &str, args: &[Value]) -> Result<(Expr, Expr), CompileError> {
    let [lhs, rhs] = args else {
        return Err(CompileError::unknown(format!(
            "{name} takes exactly 2 operands, got {}",
            args.len()
        )));
    };
    Ok((compile_expr(lhs)?, compile_expr(rhs)?))
}

fn compile_property(inline: &str, args: &[Value]) -> Result<Expr, CompileError> {
    let mut path: Vec<String> = Vec::new();
    if !inline.is_empty() {
        path.extend(inline.split('.').map(str::to_string));
        if !args.is_empty() {
            return Err(CompileError::unknown(format!(
                "property '.{inline}' takes no operands"
            )));
        }
    }
    for arg in args {
        match arg {
            Value::String(s) => path.push(s.clone()),
            Value::Number(n) if n.is_u64() => path.push(n.to_string()),
            other => {
                return Err(CompileError::unknown(format!(
                    "property path components must be strings, got {other}"
                )))
            }
        }
    }
    if path.iter().any(String::is_empty) {
        return Err(CompileError::unknown("empty property path component"));
    }
    Ok(match path.as_slice() {
        [only] if only == "_id" => Expr::DocumentId,
        [only] if only == "_sequence" => Expr::Sequence,
        _ => Expr::Property(path),
    })
}

fn compile_parameter(inline: &str, args: &[Value]) -> Result<Expr, CompileError> {
    let name = match (inline.is_empty(), args) {
        (false, []) => inline.to_string(),
        (true, [Value::String(name)]) => name.clone(),
        _ => return Err(CompileError::unknown("malformed parameter reference")),
    };
    if name.is_empty() {
        return Err(CompileError::unknown("parameter name cannot be empty"));
    }
    Ok(Expr::Parameter(name))
}

fn byte_offset(text: &str, line: usize, column: usize) -> usize {
    if line == 0 {
        return 0;
    }
    let line_start: usize = text
        .split_inclusive('\n')
        .take(line - 1)
        .map(str::len)
        .sum();
    (line_start + column.saturating_sub(1)).min(text.len())
}
