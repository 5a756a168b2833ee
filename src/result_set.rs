//! Result sets: single-pass cursors over one execution's rows.

use std::sync::Arc;

use serde_json::{Map, Value};

/// The immutable rows produced by one execution.
///
/// Shared between the result sets handed to callers and the snapshots held
/// for live-query listeners; never mutated after construction.
#[derive(Debug, PartialEq)]
pub(crate) struct ResultRows {
    columns: Arc<[String]>,
    rows: Vec<Vec<Option<Value>>>,
}

impl ResultRows {
    pub(crate) fn new(columns: Arc<[String]>, rows: Vec<Vec<Option<Value>>>) -> Self {
        debug_assert!(rows.iter().all(|r| r.len() == columns.len()));
        Self { columns, rows }
    }

    pub(crate) fn len(&self) -> usize {
        self.rows.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cursor {
    BeforeFirst,
    At(usize),
    Exhausted,
}

/// An iterator over the results of a query.
///
/// Exposes one row at a time, as values indexed by position or by column
/// name. [`ResultSet::advance`] must be called before examining the first row.
/// Reading before the first row or after the end yields `None` (MISSING).
#[derive(Debug)]
pub struct ResultSet {
    rows: Arc<ResultRows>,
    cursor: Cursor,
}

impl ResultSet {
    pub(crate) fn from_rows(rows: Arc<ResultRows>) -> Self {
        Self {
            rows,
            cursor: Cursor::BeforeFirst,
        }
    }

    pub(crate) fn into_rows(self) -> Arc<ResultRows> {
        self.rows
    }

    /// Moves to the next row. Returns false, and stays exhausted, at the end.
    pub fn advance(&mut self) -> bool {
        let next = match self.cursor {
            Cursor::BeforeFirst => 0,
            Cursor::At(i) => i + 1,
            Cursor::Exhausted => return false,
        };
        if next < self.rows.rows.len() {
            self.cursor = Cursor::At(next);
            true
        } else {
            self.cursor = Cursor::Exhausted;
            false
        }
    }

    /// Value of a column of the current row, by zero-based position.
    #[must_use]
    pub fn value_at(&self, index: usize) -> Option<&Value> {
        self.current_row()?.get(index)?.as_ref()
    }

    /// Value of a column of the current row, by column name.
    #[must_use]
    pub fn value_for(&self, name: &str) -> Option<&Value> {
        let index = self.rows.columns.iter().position(|c| c == name)?;
        self.value_at(index)
    }

    /// Number of columns in each row.
    #[must_use]
    pub fn column_count(&self) -> usize {
        self.rows.columns.len()
    }

    /// Column names, in order.
    #[must_use]
    pub fn column_names(&self) -> &[String] {
        &self.rows.columns
    }

    /// Name of the column at `index`.
    #[must_use]
    pub fn column_name(&self, index: usize) -> Option<&str> {
        self.rows.columns.get(index).map(String::as_str)
    }

    /// The current row as a JSON object keyed by column name.
    ///
    /// MISSING columns are omitted.
    #[must_use]
    pub fn row_as_json(&self) -> Option<Value> {
        let row = self.current_row()?;
        let mut out = Map::new();
        for (name, value) in self.rows.columns.iter().zip(row) {
            if let Some(value) = value {
                out.insert(name.clone(), value.clone());
            }
        }
        Some(Value::Object(out))
    }

    pub(crate) fn current_row(&self) -> Option<&[Option<Value>]> {
        match self.cursor {
            Cursor::At(i) => self.rows.rows.get(i).map(Vec::as_slice),
            Cursor::BeforeFirst | Cursor::Exhausted => None,
        }
    }

    pub(crate) fn shares_rows_with(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.rows, &other.rows)
    }
}
