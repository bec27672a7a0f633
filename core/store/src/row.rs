//! Untyped records and their SQLite value mapping.

use rusqlite::types::{Value as SqlValue, ValueRef};
use serde_json::{Number, Value};

use crate::schema::{ColumnSchema, ColumnType, ID_COLUMN};

/// A record as a JSON object keyed by column name.
pub type Row = serde_json::Map<String, Value>;

/// The `id` of a row, if present and a string.
pub fn row_id(row: &Row) -> Option<&str> {
    row.get(ID_COLUMN).and_then(Value::as_str)
}

/// Whether `value` has the type `column` stores. Null only fits optional
/// columns.
pub(crate) fn accepts(column: &ColumnSchema, value: &Value) -> bool {
    match (column.kind, value) {
        (_, Value::Null) => column.optional,
        (ColumnType::String, Value::String(_))
        | (ColumnType::Number, Value::Number(_))
        | (ColumnType::Boolean, Value::Bool(_)) => true,
        _ => false,
    }
}

/// Convert a JSON value to what gets stored for `column`.
///
/// Missing values get the column default (`""`, `0`, `false`), or null for
/// optional columns. Writers check values with [`accepts`] first.
pub(crate) fn to_sql(column: &ColumnSchema, value: Option<&Value>) -> SqlValue {
    let converted = match (column.kind, value) {
        (ColumnType::String, Some(Value::String(s))) => Some(SqlValue::Text(s.clone())),
        (ColumnType::Number, Some(Value::Number(n))) => number_to_sql(n),
        (ColumnType::Boolean, Some(Value::Bool(b))) => Some(SqlValue::Integer(i64::from(*b))),
        _ => None,
    };

    converted.unwrap_or_else(|| default_for(column))
}

fn number_to_sql(n: &Number) -> Option<SqlValue> {
    if let Some(i) = n.as_i64() {
        Some(SqlValue::Integer(i))
    } else {
        n.as_f64().map(SqlValue::Real)
    }
}

fn default_for(column: &ColumnSchema) -> SqlValue {
    if column.optional {
        return SqlValue::Null;
    }
    match column.kind {
        ColumnType::String => SqlValue::Text(String::new()),
        ColumnType::Number | ColumnType::Boolean => SqlValue::Integer(0),
    }
}

/// Convert a stored value back to JSON.
pub(crate) fn from_sql(kind: ColumnType, value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null | ValueRef::Blob(_) => Value::Null,
        ValueRef::Integer(i) => match kind {
            ColumnType::Boolean => Value::Bool(i != 0),
            ColumnType::String => Value::String(i.to_string()),
            ColumnType::Number => Value::from(i),
        },
        ValueRef::Real(f) => match kind {
            ColumnType::Boolean => Value::Bool(f != 0.0),
            ColumnType::String => Value::String(f.to_string()),
            ColumnType::Number => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        },
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
    }
}
