//! Statement results
//!
//! `QueryResult` is the immutable snapshot of a completed statement: the
//! rows it produced, the column metadata, and the affected-row count.
//! Equality is value-based. The connection capability hands back the plain
//! `RawQueryOutput` struct; the wrappers in this crate turn it into a
//! `QueryResult` before the caller sees it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Column metadata: name plus the driver-reported type name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub type_name: String,
}

impl Column {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

/// A single database value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Text(String),
    Bytes(Vec<u8>),
    Uuid(uuid::Uuid),
    DateTime(chrono::DateTime<chrono::Utc>),
    Json(JsonValue),
}

impl SqlValue {
    /// Check if the value is null
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Convert to JSON value
    pub fn to_json(&self) -> JsonValue {
        match self {
            SqlValue::Null => JsonValue::Null,
            SqlValue::Bool(b) => JsonValue::Bool(*b),
            SqlValue::Int32(i) => JsonValue::Number(serde_json::Number::from(*i)),
            SqlValue::Int64(i) => JsonValue::Number(serde_json::Number::from(*i)),
            SqlValue::Float64(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            SqlValue::Text(s) => JsonValue::String(s.clone()),
            SqlValue::Bytes(b) => JsonValue::Array(
                b.iter()
                    .map(|&x| JsonValue::Number(serde_json::Number::from(x)))
                    .collect(),
            ),
            SqlValue::Uuid(u) => JsonValue::String(u.to_string()),
            SqlValue::DateTime(dt) => JsonValue::String(dt.to_rfc3339()),
            SqlValue::Json(v) => v.clone(),
        }
    }
}

/// Raw statement outcome as reported by the connection capability.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawQueryOutput {
    pub columns: Vec<Column>,
    pub rows: Vec<Vec<SqlValue>>,
    pub rows_affected: u64,
}

/// A single result row with access by index or by column name.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[Column]>,
    values: Vec<SqlValue>,
}

impl Row {
    /// Get a value by column index
    pub fn get(&self, index: usize) -> Option<&SqlValue> {
        self.values.get(index)
    }

    /// Get a value by column name
    pub fn get_named(&self, name: &str) -> Option<&SqlValue> {
        let index = self.columns.iter().position(|c| c.name == name)?;
        self.values.get(index)
    }

    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Immutable snapshot of a completed statement's outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    columns: Arc<[Column]>,
    rows: Vec<Row>,
    rows_affected: u64,
}

impl QueryResult {
    pub(crate) fn from_raw(raw: RawQueryOutput) -> Self {
        let columns: Arc<[Column]> = raw.columns.into();
        let rows = raw
            .rows
            .into_iter()
            .map(|values| Row {
                columns: Arc::clone(&columns),
                values,
            })
            .collect();
        Self {
            columns,
            rows,
            rows_affected: raw.rows_affected,
        }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn rows_affected(&self) -> u64 {
        self.rows_affected
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Index of a column by name, if present
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }
}

impl<'a> IntoIterator for &'a QueryResult {
    type Item = &'a Row;
    type IntoIter = std::slice::Iter<'a, Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RawQueryOutput {
        RawQueryOutput {
            columns: vec![Column::new("id", "int8"), Column::new("name", "text")],
            rows: vec![
                vec![SqlValue::Int64(1), SqlValue::Text("ada".to_string())],
                vec![SqlValue::Int64(2), SqlValue::Text("grace".to_string())],
            ],
            rows_affected: 2,
        }
    }

    #[test]
    fn test_row_access_by_index_and_name() {
        let result = QueryResult::from_raw(sample());
        assert_eq!(result.len(), 2);
        assert_eq!(result.rows()[0].get(0), Some(&SqlValue::Int64(1)));
        assert_eq!(
            result.rows()[1].get_named("name"),
            Some(&SqlValue::Text("grace".to_string()))
        );
        assert_eq!(result.rows()[0].get_named("missing"), None);
        assert_eq!(result.column_index("name"), Some(1));
    }

    #[test]
    fn test_result_iteration() {
        let result = QueryResult::from_raw(sample());
        let ids: Vec<_> = (&result)
            .into_iter()
            .filter_map(|row| row.get_named("id").cloned())
            .collect();
        assert_eq!(ids, vec![SqlValue::Int64(1), SqlValue::Int64(2)]);
    }

    #[test]
    fn test_value_equality() {
        let a = QueryResult::from_raw(sample());
        let b = QueryResult::from_raw(sample());
        assert_eq!(a, b);

        let mut raw = sample();
        raw.rows_affected = 3;
        assert_ne!(a, QueryResult::from_raw(raw));
    }

    #[test]
    fn test_sql_value_to_json() {
        assert_eq!(SqlValue::Null.to_json(), JsonValue::Null);
        assert!(SqlValue::Null.is_null());
        assert_eq!(
            SqlValue::Text("x".to_string()).to_json(),
            JsonValue::String("x".to_string())
        );
        assert_eq!(
            SqlValue::Int32(7).to_json(),
            JsonValue::Number(serde_json::Number::from(7))
        );
    }
}
