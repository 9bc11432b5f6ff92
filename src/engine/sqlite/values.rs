use rusqlite::types::Value;

use crate::error::DbQueueError;
use crate::types::{CellValue, TypedValue};

/// Convert a typed request value into an `SQLite` value.
///
/// `SQLite` has no native date/time storage class, so those kinds bind as canonical text.
#[must_use]
pub fn to_sqlite_value(value: &TypedValue) -> Value {
    match value {
        TypedValue::Integer(i) => Value::Integer(*i),
        TypedValue::Float(f) => Value::Real(*f),
        TypedValue::Boolean(b) => Value::Integer(i64::from(*b)),
        TypedValue::String(s) | TypedValue::Text(s) => Value::Text(s.clone()),
        TypedValue::Date(_)
        | TypedValue::Time(_)
        | TypedValue::DateTime(_)
        | TypedValue::Timestamp(_) => Value::Text(value.to_text()),
    }
}

/// Extract a cell from an `SQLite` row.
///
/// # Errors
///
/// Returns `DbQueueError` if the value cannot be read.
pub fn sqlite_extract_value(row: &rusqlite::Row, idx: usize) -> Result<CellValue, DbQueueError> {
    let value: Value = row.get(idx)?;
    Ok(match value {
        Value::Null => CellValue::Null,
        Value::Integer(i) => CellValue::Int(i),
        Value::Real(f) => CellValue::Float(f),
        Value::Text(s) => CellValue::Text(s),
        Value::Blob(b) => CellValue::Blob(b),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn binds_kinds() {
        assert_eq!(to_sqlite_value(&TypedValue::Boolean(true)), Value::Integer(1));
        assert_eq!(to_sqlite_value(&TypedValue::Float(1.5)), Value::Real(1.5));
        let date = NaiveDate::from_ymd_opt(2024, 2, 29).expect("date");
        assert_eq!(
            to_sqlite_value(&TypedValue::Date(date)),
            Value::Text("2024-02-29".to_string())
        );
    }
}
