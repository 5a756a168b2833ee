//! Query-language front end.
//!
//! Text in either supported language is compiled into a `QueryPlan`. The
//! compiler is an injected service: embedders may replace `DefaultCompiler`
//! with their own `QueryCompiler`.

/// Expression tree and evaluator.
pub mod expr;
/// JSON query schema front end.
pub mod json;
/// N1QL subset front end.
pub mod n1ql;
/// Executable plans.
pub mod plan;

use serde::{Deserialize, Serialize};

use crate::error::CompileError;

pub use expr::{CompareOp, EvalContext, Expr};
pub use plan::{Column, OrderTerm, QueryPlan};

/// Supported query languages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryLanguage {
    /// The JSON query schema.
    Json,
    /// N1QL (SQL for JSON).
    N1ql,
}

impl std::fmt::Display for QueryLanguage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json => f.write_str("json"),
            Self::N1ql => f.write_str("n1ql"),
        }
    }
}

/// Compiles query text into an executable plan.
pub trait QueryCompiler: Send + Sync {
    /// Compiles `text` written in `language`.
    fn compile(&self, language: QueryLanguage, text: &str) -> Result<QueryPlan, CompileError>;

    /// Compiles a single expression given in JSON-schema form.
    ///
    /// Used to validate index key expressions.
    fn compile_expression(&self, expr: &serde_json::Value) -> Result<Expr, CompileError> {
        json::compile_expr(expr)
    }
}

/// The built-in compiler for JSON and N1QL.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCompiler;

impl QueryCompiler for DefaultCompiler {
    fn compile(&self, language: QueryLanguage, text: &str) -> Result<QueryPlan, CompileError> {
        match language {
            QueryLanguage::Json => json::compile(text),
            QueryLanguage::N1ql => n1ql::compile(text),
        }
    }
}
