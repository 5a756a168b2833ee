//! Result-set equivalence.

use crate::result_set::ResultSet;

/// True if both result sets have the same columns and structurally equal rows
/// in the same order.
///
/// Consumes both sets. An empty set is equivalent to another empty set with
/// the same columns.
pub(crate) fn equivalent(mut a: ResultSet, mut b: ResultSet) -> bool {
    if a.column_names() != b.column_names() {
        return false;
    }
    if a.shares_rows_with(&b) {
        return true;
    }
    loop {
        match (a.advance(), b.advance()) {
            (false, false) => return true,
            (true, true) => {
                if a.current_row() != b.current_row() {
                    return false;
                }
            }
            _ => return false,
        }
    }
}
