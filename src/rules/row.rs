//! Indicator table rows and their lenient numeric view.
//!
//! Rows arrive from heterogeneous upstream tables: numbers may be stored as
//! strings with a trailing `%` or thousands separators, booleans appear next
//! to floats, and columns differ per table. Coercion never fails — an
//! unparseable value becomes `NaN`, which makes every numeric predicate
//! false.

use std::collections::HashMap;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde_json::Value;

/// One row of an indicator table, keyed by column name.
#[derive(Debug)]
pub struct IndicatorRow {
    /// Trading symbol (uppercase)
    pub symbol: String,
    /// Normalized timeframe label ("" when the table has no timeframe column)
    pub timeframe: String,
    /// Row timestamp, floored to its minute bucket
    pub ts: DateTime<Utc>,
    /// Source row id; tiebreaker for deterministic ordering
    pub rowid: i64,
    /// Raw column values
    pub fields: IndexMap<String, Value>,
    // Numeric view computed on first access and reused across all rules
    // evaluated against this row.
    numeric: OnceLock<HashMap<String, f64>>,
}

impl Clone for IndicatorRow {
    fn clone(&self) -> Self {
        Self {
            symbol: self.symbol.clone(),
            timeframe: self.timeframe.clone(),
            ts: self.ts,
            rowid: self.rowid,
            fields: self.fields.clone(),
            numeric: OnceLock::new(),
        }
    }
}

/// Parse numeric text leniently: optional trailing `%`, `,` separators.
///
/// Returns `None` for empty, non-numeric, or non-finite text (`inf`/`nan`
/// spellings are upstream garbage, not numbers).
pub fn parse_numeric_text(raw: &str) -> Option<f64> {
    let mut text = raw.trim();
    if text.is_empty() {
        return None;
    }
    if let Some(stripped) = text.strip_suffix('%') {
        text = stripped.trim_end();
    }
    let cleaned: String = text.chars().filter(|c| *c != ',').collect();
    if !cleaned.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn coerce_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => parse_numeric_text(s),
        _ => None,
    }
}

impl IndicatorRow {
    /// Create a row from raw column values.
    pub fn new(
        symbol: impl Into<String>,
        timeframe: impl Into<String>,
        ts: DateTime<Utc>,
        rowid: i64,
        fields: IndexMap<String, Value>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe: timeframe.into(),
            ts,
            rowid,
            fields,
            numeric: OnceLock::new(),
        }
    }

    /// String view of a field; missing and null map to "".
    pub fn text(&self, field: &str) -> String {
        match self.fields.get(field) {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        }
    }

    /// Whether the row carries the column at all.
    pub fn has_field(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    /// Numeric view of a field; missing or unparseable map to `NaN`.
    ///
    /// The full row is coerced once and cached, so evaluating many rules
    /// against the same row does not re-parse each cell.
    pub fn numeric(&self, field: &str) -> f64 {
        let cache = self.numeric.get_or_init(|| {
            self.fields
                .iter()
                .filter_map(|(key, value)| coerce_value(value).map(|v| (key.clone(), v)))
                .collect()
        });
        cache.get(field).copied().unwrap_or(f64::NAN)
    }
}
