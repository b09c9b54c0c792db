//! Result-set equivalence: row-multiset (or ordered-sequence) comparison
//! tolerating floating-point noise and column aliasing.
//!
//! Tolerance policy, applied uniformly: two floats are equal when
//! `|a - b| <= 1e-12` or `|a - b| <= 1e-9 * max(|a|, |b|)`. Column names
//! are never compared (aliasing is allowed); arity is.

use serde::{Deserialize, Serialize};

use crate::exec::{ResultSet, Row, Value};

pub const ABS_EPSILON: f64 = 1e-12;
pub const REL_EPSILON: f64 = 1e-9;

/// Whether row order is significant for the comparison.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompareMode {
    /// Top-level ORDER BY: sequences must match position by position.
    Ordered,
    /// No total order: rows compare as multisets.
    Unordered,
}

/// Outcome of one comparison, with the first divergence located for
/// Tier-2 diagnostics.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EquivalenceReport {
    #[serde(rename = "match")]
    pub matched: bool,
    pub reason: Option<String>,
    /// `(row_index, column_index)` of the first differing cell, when the
    /// shapes agreed enough to localize one.
    pub first_divergence: Option<(usize, usize)>,
}

impl EquivalenceReport {
    fn matched() -> Self {
        Self {
            matched: true,
            reason: None,
            first_divergence: None,
        }
    }

    fn mismatch(reason: String, at: Option<(usize, usize)>) -> Self {
        Self {
            matched: false,
            reason: Some(reason),
            first_divergence: at,
        }
    }
}

/// Compare two result sets under the chosen mode.
pub fn compare_result_sets(
    left: &ResultSet,
    right: &ResultSet,
    mode: CompareMode,
) -> EquivalenceReport {
    let left_width = left.columns.len().max(row_width(&left.rows));
    let right_width = right.columns.len().max(row_width(&right.rows));
    if left_width != right_width {
        return EquivalenceReport::mismatch(
            format!("column count mismatch: {left_width} vs {right_width}"),
            None,
        );
    }
    if left.rows.len() != right.rows.len() {
        return EquivalenceReport::mismatch(
            format!(
                "row count mismatch: {} vs {}",
                left.rows.len(),
                right.rows.len()
            ),
            None,
        );
    }

    match mode {
        CompareMode::Ordered => compare_sequences(&left.rows, &right.rows),
        CompareMode::Unordered => {
            let mut a = left.rows.clone();
            let mut b = right.rows.clone();
            a.sort_by_cached_key(row_sort_key);
            b.sort_by_cached_key(row_sort_key);
            compare_sequences(&a, &b)
        }
    }
}

fn row_width(rows: &[Row]) -> usize {
    rows.first().map_or(0, Vec::len)
}

fn compare_sequences(left: &[Row], right: &[Row]) -> EquivalenceReport {
    for (row_index, (a, b)) in left.iter().zip(right).enumerate() {
        for (column_index, (x, y)) in a.iter().zip(b).enumerate() {
            if !values_equal(x, y) {
                return EquivalenceReport::mismatch(
                    format!(
                        "first divergence at row {row_index}, column {column_index}: {x} vs {y}"
                    ),
                    Some((row_index, column_index)),
                );
            }
        }
    }
    EquivalenceReport::matched()
}

/// Cell equality with the documented float tolerance. Ints and floats
/// cross-compare numerically; NULL equals only NULL.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Text(x), Value::Text(y)) => x == y,
        (Value::Float(x), Value::Float(y)) => floats_equal(*x, *y),
        (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => {
            floats_equal(*x as f64, *y)
        }
        _ => false,
    }
}

fn floats_equal(a: f64, b: f64) -> bool {
    if a == b {
        return true;
    }
    if a.is_nan() && b.is_nan() {
        return true;
    }
    let diff = (a - b).abs();
    diff <= ABS_EPSILON || diff <= REL_EPSILON * a.abs().max(b.abs())
}

/// Sort key for unordered comparison: the canonical text of each cell,
/// which already folds float noise below the tolerance.
fn row_sort_key(row: &Row) -> Vec<String> {
    row.iter().map(Value::canonical).collect()
}
