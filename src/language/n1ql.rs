//! Front end for a N1QL subset.
//!
//! ```text
//! SELECT [DISTINCT] (* | expr [AS name], ...)
//!   [FROM collection [AS alias]]
//!   [WHERE expr]
//!   [ORDER BY expr [ASC|DESC], ...]
//!   [LIMIT expr] [OFFSET expr]
//! ```
//!
//! Expressions support property paths, `meta().id`, `meta().sequence`,
//! `$parameters`, literals, array literals, comparisons, `IS [NOT]`,
//! `[NOT] LIKE`, `AND`, `OR` and `NOT`.

use serde_json::{Number, Value};

use crate::document::DEFAULT_COLLECTION;
use crate::error::CompileError;

use super::expr::{CompareOp, Expr};
use super::plan::{Column, OrderTerm, QueryPlan};

const KEYWORDS: [&str; 22] = [
    "SELECT", "DISTINCT", "FROM", "WHERE", "ORDER", "BY", "ASC", "DESC", "LIMIT", "OFFSET", "AND",
    "OR", "NOT", "IS", "LIKE", "AS", "TRUE", "FALSE", "NULL", "MISSING", "META", "VALUED",
];

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Keyword(&'static str),
    Str(String),
    Num(Number),
    Param(String),
    Sym(&'static str),
    Eof,
}

#[derive(Debug, Clone)]
struct Spanned {
    token: Token,
    offset: usize,
}

fn keyword(word: &str) -> Option<&'static str> {
    KEYWORDS
        .iter()
        .copied()
        .find(|k| k.eq_ignore_ascii_case(word))
}

fn tokenize(text: &str) -> Result<Vec<Spanned>, CompileError> {
    let bytes = text.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        let start = i;
        let token = match c {
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                let word = &text[start..i];
                keyword(word).map_or_else(|| Token::Ident(word.to_string()), Token::Keyword)
            }
            b'`' => {
                let end = text[start + 1..]
                    .find('`')
                    .ok_or_else(|| CompileError::at(start, "unterminated quoted identifier"))?;
                i = start + 1 + end + 1;
                Token::Ident(text[start + 1..start + 1 + end].to_string())
            }
            b'\'' | b'"' => {
                let (s, next) = scan_string(text, start, c)?;
                i = next;
                Token::Str(s)
            }
            b'0'..=b'9' => {
                while i < bytes.len()
                    && (bytes[i].is_ascii_digit()
                        || bytes[i] == b'.'
                        || bytes[i] == b'e'
                        || bytes[i] == b'E'
                        || ((bytes[i] == b'-' || bytes[i] == b'+')
                            && matches!(bytes[i - 1], b'e' | b'E')))
                {
                    i += 1;
                }
                let literal = &text[start..i];
                let number: Number = serde_json::from_str(literal)
                    .map_err(|_| CompileError::at(start, format!("invalid number '{literal}'")))?;
                Token::Num(number)
            }
            b'$' => {
                i += 1;
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                if i == start + 1 {
                    return Err(CompileError::at(start, "expected parameter name after '$'"));
                }
                Token::Param(text[start + 1..i].to_string())
            }
            _ => {
                let two = text.get(start..start + 2).unwrap_or("");
                let sym = match two {
                    "==" => Some("=="),
                    "!=" => Some("!="),
                    "<>" => Some("<>"),
                    "<=" => Some("<="),
                    ">=" => Some(">="),
                    _ => None,
                };
                if let Some(sym) = sym {
                    i += 2;
                    Token::Sym(sym)
                } else {
                    i += 1;
                    match c {
                        b'(' => Token::Sym("("),
                        b')' => Token::Sym(")"),
                        b'[' => Token::Sym("["),
                        b']' => Token::Sym("]"),
                        b',' => Token::Sym(","),
                        b'.' => Token::Sym("."),
                        b'*' => Token::Sym("*"),
                        b'=' => Token::Sym("="),
                        b'<' => Token::Sym("<"),
                        b'>' => Token::Sym(">"),
                        b'-' => Token::Sym("-"),
                        b';' => Token::Sym(";"),
                        _ => {
                            let ch = text[start..].chars().next().unwrap_or('?');
                            return Err(CompileError::at(start, format!("unexpected character '{ch}'")));
                        }
                    }
                }
            }
        };
        out.push(Spanned { token, offset: start });
    }

    out.push(Spanned {
        token: Token::Eof,
        offset: text.len(),
    });
    Ok(out)
}

fn scan_string(text: &str, start: usize, quote: u8) -> Result<(String, usize), CompileError> {
    let bytes = text.as_bytes();
    let mut out = String::new();
    let mut i = start + 1;
    let mut run_start = i;
    while i < bytes.len() {
        if bytes[i] == quote {
            out.push_str(&text[run_start..i]);
            // A doubled quote is an escaped quote.
            if bytes.get(i + 1) == Some(&quote) {
                out.push(quote as char);
                i += 2;
                run_start = i;
                continue;
            }
            return Ok((out, i + 1));
        }
        i += 1;
    }
    Err(CompileError::at(start, "unterminated string literal"))
}

/// Deepest nesting of parentheses, arrays and NOT accepted in one expression.
const MAX_DEPTH: usize = 128;

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    alias: Option<String>,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].token
    }

    fn offset(&self) -> usize {
        self.tokens[self.pos.min(self.tokens.len() - 1)].offset
    }

    fn bump(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if *self.peek() == Token::Keyword(keyword(kw).unwrap_or("")) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_sym(&mut self, sym: &str) -> bool {
        if matches!(self.peek(), Token::Sym(s) if *s == sym) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn descend(&mut self, offset: usize) -> Result<(), CompileError> {
        if self.depth >= MAX_DEPTH {
            return Err(CompileError::at(offset, "expression nested too deeply"));
        }
        self.depth += 1;
        Ok(())
    }

    fn error(&self, message: impl Into<String>) -> CompileError {
        CompileError::at(self.offset(), message)
    }

    fn expect_keyword(&mut self, kw: &str) -> Result<(), CompileError> {
        if self.eat_keyword(kw) {
            Ok(())
        } else {
            Err(self.error(format!("expected {kw}, found {}", describe(self.peek()))))
        }
    }

    fn expect_sym(&mut self, sym: &str) -> Result<(), CompileError> {
        if self.eat_sym(sym) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{sym}', found {}", describe(self.peek()))))
        }
    }

    fn expect_ident(&mut self) -> Result<String, CompileError> {
        if let Token::Ident(name) = self.peek() {
            let name = name.clone();
            self.pos += 1;
            return Ok(name);
        }
        Err(self.error(format!("expected identifier, found {}", describe(self.peek()))))
    }

    fn parse_select(&mut self) -> Result<QueryPlan, CompileError> {
        self.expect_keyword("SELECT")?;
        let distinct = self.eat_keyword("DISTINCT");

        // Result expressions may mention the FROM alias, which is only known
        // after FROM is parsed; remember where they start and parse them later.
        let select_start = self.pos;
        self.skip_select_list()?;
        let select_end = self.pos;

        let mut collection = DEFAULT_COLLECTION.to_string();
        if self.eat_keyword("FROM") {
            let mut name = self.expect_ident()?;
            // scope.collection: only the collection name matters here.
            while self.eat_sym(".") {
                name = self.expect_ident()?;
            }
            if name != "_" {
                collection = name.clone();
            }
            self.alias = Some(name);
            if self.eat_keyword("AS") {
                self.alias = Some(self.expect_ident()?);
            } else if let Token::Ident(alias) = self.peek().clone() {
                self.pos += 1;
                self.alias = Some(alias);
            }
        }
        let after_from = self.pos;

        self.pos = select_start;
        let columns = self.parse_select_list(&collection)?;
        if self.pos != select_end {
            return Err(self.error(format!("unexpected {} in SELECT list", describe(self.peek()))));
        }
        self.pos = after_from;

        let filter = if self.eat_keyword("WHERE") {
            Some(self.parse_expr()?)
        } else {
            None
        };

        let mut order_by = Vec::new();
        if self.eat_keyword("ORDER") {
            self.expect_keyword("BY")?;
            loop {
                let expr = self.parse_expr()?;
                let descending = if self.eat_keyword("DESC") {
                    true
                } else {
                    self.eat_keyword("ASC");
                    false
                };
                order_by.push(OrderTerm { expr, descending });
                if !self.eat_sym(",") {
                    break;
                }
            }
        }

        let mut limit = None;
        let mut offset = None;
        if self.eat_keyword("LIMIT") {
            limit = Some(self.parse_expr()?);
        }
        if self.eat_keyword("OFFSET") {
            offset = Some(self.parse_expr()?);
        }

        self.eat_sym(";");
        if *self.peek() != Token::Eof {
            return Err(self.error(format!("unexpected {}", describe(self.peek()))));
        }

        Ok(QueryPlan {
            collection,
            columns,
            filter,
            order_by,
            limit,
            offset,
            distinct,
        })
    }

    fn skip_select_list(&mut self) -> Result<(), CompileError> {
        let mut depth = 0usize;
        loop {
            match self.peek() {
                Token::Eof => return Ok(()),
                Token::Keyword(k) if depth == 0 && matches!(*k, "FROM" | "WHERE" | "ORDER" | "LIMIT" | "OFFSET") => {
                    return Ok(())
                }
                Token::Sym("(" | "[") => depth += 1,
                Token::Sym(")" | "]") => {
                    depth = depth
                        .checked_sub(1)
                        .ok_or_else(|| self.error("unbalanced parenthesis"))?;
                }
                _ => {}
            }
            self.pos += 1;
        }
    }

    fn parse_select_list(&mut self, collection: &str) -> Result<Vec<Column>, CompileError> {
        if self.eat_sym("*") {
            let name = match &self.alias {
                Some(alias) if alias != "_" => alias.clone(),
                _ => collection.to_string(),
            };
            return Ok(vec![Column::new(Expr::Property(Vec::new()), Some(name), 0, collection)]);
        }
        let mut columns = Vec::new();
        loop {
            let expr = self.parse_expr()?;
            let alias = if self.eat_keyword("AS") {
                Some(self.expect_ident()?)
            } else {
                None
            };
            columns.push(Column::new(expr, alias, columns.len(), collection));
            if !self.eat_sym(",") {
                break;
            }
        }
        if columns.is_empty() {
            return Err(self.error("SELECT list is empty"));
        }
        Ok(columns)
    }

    fn parse_expr(&mut self) -> Result<Expr, CompileError> {
        let mut terms = vec![self.parse_and()?];
        while self.eat_keyword("OR") {
            terms.push(self.parse_and()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            Expr::Or(terms)
        })
    }

    fn parse_and(&mut self) -> Result<Expr, CompileError> {
        let mut terms = vec![self.parse_not()?];
        while self.eat_keyword("AND") {
            terms.push(self.parse_not()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            Expr::And(terms)
        })
    }

    fn parse_not(&mut self) -> Result<Expr, CompileError> {
        let offset = self.offset();
        if self.eat_keyword("NOT") {
            self.descend(offset)?;
            let inner = self.parse_not()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, CompileError> {
        let lhs = self.parse_primary()?;

        let op = match self.peek() {
            Token::Sym("=" | "==") => Some(CompareOp::Eq),
            Token::Sym("!=" | "<>") => Some(CompareOp::Ne),
            Token::Sym("<") => Some(CompareOp::Lt),
            Token::Sym("<=") => Some(CompareOp::Le),
            Token::Sym(">") => Some(CompareOp::Gt),
            Token::Sym(">=") => Some(CompareOp::Ge),
            _ => None,
        };
        if let Some(op) = op {
            self.pos += 1;
            let rhs = self.parse_primary()?;
            return Ok(Expr::Compare(op, Box::new(lhs), Box::new(rhs)));
        }

        if self.eat_keyword("IS") {
            let negated = self.eat_keyword("NOT");
            if self.eat_keyword("VALUED") {
                // IS VALUED: present and not null.
                let valued = Expr::And(vec![
                    Expr::Is {
                        negated: true,
                        lhs: Box::new(lhs.clone()),
                        rhs: Box::new(Expr::Literal(Value::Null)),
                    },
                    Expr::Is {
                        negated: true,
                        lhs: Box::new(lhs),
                        rhs: Box::new(Expr::Missing),
                    },
                ]);
                return Ok(if negated {
                    Expr::Not(Box::new(valued))
                } else {
                    valued
                });
            }
            let rhs = self.parse_primary()?;
            return Ok(Expr::Is {
                negated,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            });
        }

        let negated_like = self.peek() == &Token::Keyword("NOT")
            && matches!(self.tokens.get(self.pos + 1), Some(Spanned { token: Token::Keyword("LIKE"), .. }));
        if negated_like {
            self.pos += 1;
        }
        if self.eat_keyword("LIKE") {
            let pattern = self.parse_primary()?;
            return Ok(Expr::Like {
                negated: negated_like,
                lhs: Box::new(lhs),
                pattern: Box::new(pattern),
            });
        }

        Ok(lhs)
    }

    fn parse_primary(&mut self) -> Result<Expr, CompileError> {
        let offset = self.offset();
        match self.bump() {
            Token::Num(n) => Ok(Expr::Literal(Value::Number(n))),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::Param(name) => Ok(Expr::Parameter(name)),
            Token::Keyword("TRUE") => Ok(Expr::Literal(Value::Bool(true))),
            Token::Keyword("FALSE") => Ok(Expr::Literal(Value::Bool(false))),
            Token::Keyword("NULL") => Ok(Expr::Literal(Value::Null)),
            Token::Keyword("MISSING") => Ok(Expr::Missing),
            Token::Keyword("META") => self.parse_meta(),
            Token::Sym("-") => match self.bump() {
                Token::Num(n) => {
                    let negated = n
                        .as_i64()
                        .and_then(i64::checked_neg)
                        .map(Number::from)
                        .or_else(|| n.as_f64().and_then(|f| Number::from_f64(-f)))
                        .ok_or_else(|| CompileError::at(offset, "number out of range"))?;
                    Ok(Expr::Literal(Value::Number(negated)))
                }
                _ => Err(CompileError::at(offset, "expected number after '-'")),
            },
            Token::Sym("(") => {
                self.descend(offset)?;
                let inner = self.parse_expr()?;
                self.expect_sym(")")?;
                self.depth -= 1;
                Ok(inner)
            }
            Token::Sym("[") => {
                self.descend(offset)?;
                let mut items = Vec::new();
                if !self.eat_sym("]") {
                    loop {
                        items.push(self.parse_expr()?);
                        if !self.eat_sym(",") {
                            break;
                        }
                    }
                    self.expect_sym("]")?;
                }
                self.depth -= 1;
                Ok(Expr::Array(items))
            }
            Token::Ident(first) => self.parse_path(first),
            other => Err(CompileError::at(
                offset,
                format!("expected expression, found {}", describe(&other)),
            )),
        }
    }

    fn parse_meta(&mut self) -> Result<Expr, CompileError> {
        self.expect_sym("(")?;
        if let Token::Ident(_) = self.peek() {
            self.pos += 1;
        }
        self.expect_sym(")")?;
        self.expect_sym(".")?;
        let offset = self.offset();
        let field = self.expect_ident()?;
        match field.to_ascii_lowercase().as_str() {
            "id" => Ok(Expr::DocumentId),
            "sequence" => Ok(Expr::Sequence),
            _ => Err(CompileError::at(offset, format!("unknown meta property '{field}'"))),
        }
    }

    fn parse_path(&mut self, first: String) -> Result<Expr, CompileError> {
        let mut path = vec![first];
        loop {
            if self.eat_sym(".") {
                path.push(self.expect_ident()?);
            } else if matches!(self.peek(), Token::Sym("["))
                && matches!(self.tokens.get(self.pos + 1), Some(Spanned { token: Token::Num(_), .. }))
            {
                self.pos += 1;
                let offset = self.offset();
                let Token::Num(n) = self.bump() else {
                    return Err(CompileError::at(offset, "expected array index"));
                };
                let index = n
                    .as_u64()
                    .ok_or_else(|| CompileError::at(offset, "array index must be a non-negative integer"))?;
                path.push(index.to_string());
                self.expect_sym("]")?;
            } else {
                break;
            }
        }
        if path.len() > 1 && self.alias.as_deref() == Some(path[0].as_str()) {
            path.remove(0);
        } else if path.len() == 1 && self.alias.as_deref() == Some(path[0].as_str()) {
            path.clear();
        }
        Ok(Expr::Property(path))
    }
}

fn describe(token: &Token) -> String {
    match token {
        Token::Ident(s) => format!("identifier '{s}'"),
        Token::Keyword(k) => format!("keyword {k}"),
        Token::Str(s) => format!("string '{s}'"),
        Token::Num(n) => format!("number {n}"),
        Token::Param(p) => format!("parameter ${p}"),
        Token::Sym(s) => format!("'{s}'"),
        Token::Eof => "end of query".to_string(),
    }
}

/// Compiles N1QL query text into a plan.
pub fn compile(text: &str) -> Result<QueryPlan, CompileError> {
    let tokens = tokenize(text)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        alias: None,
        depth: 0,
    };
    parser.parse_select()
}
