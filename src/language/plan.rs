//! Executable query plans produced by the language front ends.

use std::collections::BTreeSet;
use std::fmt::Write as _;

use super::expr::Expr;

/// A named result column.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    /// Name used by `value_for` and row objects.
    pub name: String,
    pub expr: Expr,
}

impl Column {
    /// Creates a column, deriving its name from the expression unless an alias is given.
    ///
    /// `position` is the zero-based column index; `collection` names whole-document columns.
    #[must_use]
    pub fn new(expr: Expr, alias: Option<String>, position: usize, collection: &str) -> Self {
        let name = alias.unwrap_or_else(|| match &expr {
            Expr::Property(path) => path
                .last()
                .cloned()
                .unwrap_or_else(|| collection.to_string()),
            Expr::DocumentId => "_id".to_string(),
            Expr::Sequence => "_sequence".to_string(),
            _ => format!("${}", position + 1),
        });
        Self { name, expr }
    }
}

/// One ORDER BY term.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderTerm {
    pub expr: Expr,
    pub descending: bool,
}

/// A compiled, executable query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    /// Collection scanned by the query.
    pub collection: String,
    /// Result columns, in order.
    pub columns: Vec<Column>,
    /// Row filter.
    pub filter: Option<Expr>,
    /// Sort terms; rows default to document-id order.
    pub order_by: Vec<OrderTerm>,
    /// LIMIT and OFFSET clauses, resolved at execution time.
    pub limit: Option<Expr>,
    pub offset: Option<Expr>,
    /// Drop duplicate rows.
    pub distinct: bool,
}

impl QueryPlan {
    /// Column names, in order.
    #[must_use]
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Names of every parameter the plan references.
    #[must_use]
    pub fn parameter_names(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for column in &self.columns {
            column.expr.collect_parameters(&mut out);
        }
        for expr in self
            .filter
            .iter()
            .chain(self.order_by.iter().map(|t| &t.expr))
            .chain(self.limit.iter())
            .chain(self.offset.iter())
        {
            expr.collect_parameters(&mut out);
        }
        out
    }

    /// Renders the plan as N1QL-like text.
    #[must_use]
    pub fn to_n1ql(&self) -> String {
        let mut out = String::from("SELECT ");
        if self.distinct {
            out.push_str("DISTINCT ");
        }
        for (i, column) in self.columns.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            let _ = write!(out, "{} AS `{}`", column.expr, column.name);
        }
        let _ = write!(out, " FROM `{}`", self.collection);
        if let Some(filter) = &self.filter {
            let _ = write!(out, " WHERE {filter}");
        }
        if !self.order_by.is_empty() {
            out.push_str(" ORDER BY ");
            for (i, term) in self.order_by.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                let dir = if term.descending { "DESC" } else { "ASC" };
                let _ = write!(out, "{} {dir}", term.expr);
            }
        }
        if let Some(limit) = &self.limit {
            let _ = write!(out, " LIMIT {limit}");
        }
        if let Some(offset) = &self.offset {
            let _ = write!(out, " OFFSET {offset}");
        }
        out
    }
}
