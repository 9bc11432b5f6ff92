//! Typed request parameters and named-to-positional placeholder conversion.
//!
//! Callers send SQL templates with `:name` placeholders and a JSON object grouping values by
//! type:
//! ```rust
//! use dbqueue::prelude::*;
//!
//! let params = parse_typed_parameters(r#"{"INTEGER":{"userId":123}}"#)?;
//! let converted = convert_named_to_positional(
//!     "SELECT * FROM users WHERE id = :userId",
//!     &params,
//!     EngineType::Postgresql,
//! )?;
//! assert_eq!(converted.sql, "SELECT * FROM users WHERE id = $1");
//! assert_eq!(converted.param_count, 1);
//! # Ok::<(), DbQueueError>(())
//! ```

mod scanner;

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use serde_json::{Map, Value as JsonValue};

use crate::error::DbQueueError;
use crate::types::{EngineType, ParamKind, TypedParameter, TypedValue};

use scanner::{
    State, is_block_comment_end, is_block_comment_start, is_line_comment_start, matches_tag,
    scan_param_name, try_start_dollar_quote,
};

/// Longest accepted parameter name.
pub const MAX_PARAM_NAME_LEN: usize = 63;

const DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
];

/// Parse the typed-parameter JSON of a request.
///
/// An empty string or `{}` yields no parameters.
///
/// # Errors
/// Returns [`DbQueueError::ParameterError`] for malformed JSON, unknown type sections,
/// values that do not match their section, malformed date/time text, or a name declared twice.
pub fn parse_typed_parameters(json: &str) -> Result<Vec<TypedParameter>, DbQueueError> {
    let trimmed = json.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let root: JsonValue = serde_json::from_str(trimmed)
        .map_err(|e| DbQueueError::ParameterError(format!("invalid parameter JSON: {e}")))?;
    let sections = root.as_object().ok_or_else(|| {
        DbQueueError::ParameterError("parameter JSON must be an object".to_string())
    })?;

    let mut params = Vec::new();
    let mut seen: HashMap<String, ParamKind> = HashMap::new();
    for (section, values) in sections {
        let kind = ParamKind::from_section_name(section).ok_or_else(|| {
            DbQueueError::ParameterError(format!("unknown parameter type section '{section}'"))
        })?;
        let values: &Map<String, JsonValue> = values.as_object().ok_or_else(|| {
            DbQueueError::ParameterError(format!("section '{section}' must be an object"))
        })?;
        for (name, raw) in values {
            if let Some(previous) = seen.insert(name.clone(), kind) {
                return Err(DbQueueError::ParameterError(format!(
                    "parameter '{name}' declared as both {} and {section}",
                    previous.section_name()
                )));
            }
            params.push(TypedParameter::new(name.clone(), parse_value(kind, name, raw)?));
        }
    }
    Ok(params)
}

fn parse_value(kind: ParamKind, name: &str, raw: &JsonValue) -> Result<TypedValue, DbQueueError> {
    let mismatch = || {
        DbQueueError::ParameterError(format!(
            "parameter '{name}' is not a valid {} value",
            kind.section_name()
        ))
    };
    let text = || raw.as_str().ok_or_else(mismatch);

    match kind {
        ParamKind::Integer => raw.as_i64().map(TypedValue::Integer).ok_or_else(mismatch),
        ParamKind::Float => raw.as_f64().map(TypedValue::Float).ok_or_else(mismatch),
        ParamKind::Boolean => raw.as_bool().map(TypedValue::Boolean).ok_or_else(mismatch),
        ParamKind::String => Ok(TypedValue::String(text()?.to_string())),
        ParamKind::Text => Ok(TypedValue::Text(text()?.to_string())),
        ParamKind::Date => NaiveDate::parse_from_str(text()?, "%Y-%m-%d")
            .map(TypedValue::Date)
            .map_err(|_| mismatch()),
        ParamKind::Time => parse_time(text()?).map(TypedValue::Time).ok_or_else(mismatch),
        ParamKind::DateTime => parse_datetime(text()?)
            .map(TypedValue::DateTime)
            .ok_or_else(mismatch),
        ParamKind::Timestamp => {
            let s = text()?;
            parse_datetime(s)
                .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.naive_utc()))
                .map(TypedValue::Timestamp)
                .ok_or_else(mismatch)
        }
    }
}

fn parse_time(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S%.f"))
        .ok()
}

fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
}

/// A template rewritten for one engine's positional placeholders.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvertedQuery {
    pub sql: String,
    /// Parameters in placeholder order; a name used twice appears twice.
    pub ordered_params: Vec<TypedParameter>,
    pub param_count: usize,
}

impl ConvertedQuery {
    #[must_use]
    pub fn values(&self) -> Vec<TypedValue> {
        self.ordered_params.iter().map(|p| p.value.clone()).collect()
    }
}

/// Replace `:name` placeholders with `$n` (PostgreSQL) or `?` (everything else).
///
/// Quoted strings, quoted identifiers, comments, dollar-quoted bodies and `::` casts are
/// left untouched.
///
/// # Errors
/// Returns [`DbQueueError::ParameterError`] when a placeholder has no matching parameter or
/// its name is longer than [`MAX_PARAM_NAME_LEN`].
pub fn convert_named_to_positional(
    template: &str,
    params: &[TypedParameter],
    engine: EngineType,
) -> Result<ConvertedQuery, DbQueueError> {
    let by_name: HashMap<&str, &TypedParameter> =
        params.iter().map(|p| (p.name.as_str(), p)).collect();

    let bytes = template.as_bytes();
    let mut out = String::with_capacity(template.len() + 8);
    let mut ordered = Vec::new();
    let mut state = State::Normal;
    let mut copied_to = 0;
    let mut idx = 0;

    while idx < bytes.len() {
        let b = bytes[idx];
        match state {
            State::Normal => match b {
                b'\'' => state = State::SingleQuoted,
                b'"' => state = State::DoubleQuoted,
                b'`' => state = State::Backticked,
                _ if is_line_comment_start(bytes, idx) => state = State::LineComment,
                _ if is_block_comment_start(bytes, idx) => {
                    state = State::BlockComment(1);
                    idx += 1;
                }
                b'$' => {
                    if let Some((tag, close)) = try_start_dollar_quote(bytes, idx) {
                        state = State::DollarQuoted(tag);
                        idx = close;
                    }
                }
                b':' if bytes.get(idx + 1) == Some(&b':') => idx += 1,
                b':' => {
                    if let Some(end) = scan_param_name(bytes, idx) {
                        let name = &template[idx + 1..end];
                        if name.len() > MAX_PARAM_NAME_LEN {
                            return Err(DbQueueError::ParameterError(format!(
                                "parameter name '{name}' exceeds {MAX_PARAM_NAME_LEN} characters"
                            )));
                        }
                        let param = by_name.get(name).ok_or_else(|| {
                            DbQueueError::ParameterError(format!(
                                "no value supplied for parameter ':{name}'"
                            ))
                        })?;
                        out.push_str(&template[copied_to..idx]);
                        ordered.push((*param).clone());
                        if engine.numbered_placeholders() {
                            out.push('$');
                            out.push_str(&ordered.len().to_string());
                        } else {
                            out.push('?');
                        }
                        copied_to = end;
                        idx = end;
                        continue;
                    }
                }
                _ => {}
            },
            State::SingleQuoted => {
                if b == b'\'' {
                    if bytes.get(idx + 1) == Some(&b'\'') {
                        idx += 1;
                    } else {
                        state = State::Normal;
                    }
                }
            }
            State::DoubleQuoted => {
                if b == b'"' {
                    if bytes.get(idx + 1) == Some(&b'"') {
                        idx += 1;
                    } else {
                        state = State::Normal;
                    }
                }
            }
            State::Backticked => {
                if b == b'`' {
                    state = State::Normal;
                }
            }
            State::LineComment => {
                if b == b'\n' {
                    state = State::Normal;
                }
            }
            State::BlockComment(depth) => {
                if is_block_comment_start(bytes, idx) {
                    state = State::BlockComment(depth + 1);
                    idx += 1;
                } else if is_block_comment_end(bytes, idx) {
                    state = if depth == 1 {
                        State::Normal
                    } else {
                        State::BlockComment(depth - 1)
                    };
                    idx += 1;
                }
            }
            State::DollarQuoted(ref tag) => {
                if b == b'$' && matches_tag(bytes, idx, tag) {
                    idx += tag.len() + 1;
                    state = State::Normal;
                }
            }
        }
        idx += 1;
    }

    out.push_str(&template[copied_to..]);
    let param_count = ordered.len();
    Ok(ConvertedQuery {
        sql: out,
        ordered_params: ordered,
        param_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(name: &str, v: i64) -> TypedParameter {
        TypedParameter::new(name, TypedValue::Integer(v))
    }

    #[test]
    fn parses_all_sections() {
        let json = r#"{
            "INTEGER": {"id": 7},
            "STRING": {"name": "alice"},
            "BOOLEAN": {"active": true},
            "FLOAT": {"score": 3, "ratio": 0.5},
            "TEXT": {"bio": "long"},
            "DATE": {"born": "2001-02-03"},
            "TIME": {"at": "04:05:06.5"},
            "DATETIME": {"seen": "2024-01-02T03:04:05"},
            "TIMESTAMP": {"created": "2024-01-02T03:04:05Z"}
        }"#;
        let params = parse_typed_parameters(json).expect("parse");
        assert_eq!(params.len(), 10);
        let get = |n: &str| params.iter().find(|p| p.name == n).map(|p| p.value.clone());
        assert_eq!(get("id"), Some(TypedValue::Integer(7)));
        assert_eq!(get("score"), Some(TypedValue::Float(3.0)));
        assert_eq!(get("active"), Some(TypedValue::Boolean(true)));
        assert!(matches!(get("born"), Some(TypedValue::Date(_))));
        assert!(matches!(get("at"), Some(TypedValue::Time(_))));
        assert!(matches!(get("created"), Some(TypedValue::Timestamp(_))));
    }

    #[test]
    fn empty_inputs_yield_nothing() {
        assert!(parse_typed_parameters("").expect("empty").is_empty());
        assert!(parse_typed_parameters("{}").expect("braces").is_empty());
    }

    #[test]
    fn rejects_mismatched_and_malformed_values() {
        for json in [
            r#"{"INTEGER":{"id":"7"}}"#,
            r#"{"BOOLEAN":{"b":1}}"#,
            r#"{"DATE":{"d":"2024-13-40"}}"#,
            r#"{"TIME":{"t":"25:00"}}"#,
            r#"{"DATETIME":{"t":"yesterday"}}"#,
            r#"{"TIMESTAMP":{"t":12}}"#,
            r#"{"UUID":{"u":"x"}}"#,
            r#"{"INTEGER":{"a":1},"STRING":{"a":"b"}}"#,
            r#"[1,2]"#,
            "{not json",
        ] {
            let err = parse_typed_parameters(json).expect_err(json);
            assert!(matches!(err, DbQueueError::ParameterError(_)), "{json}: {err}");
        }
    }

    #[test]
    fn converts_for_postgres_in_occurrence_order() {
        let params = vec![int("b", 2), int("a", 1)];
        let converted = convert_named_to_positional(
            "select * from t where a = :a and b = :b or a2 = :a",
            &params,
            EngineType::Postgresql,
        )
        .expect("convert");
        assert_eq!(converted.sql, "select * from t where a = $1 and b = $2 or a2 = $3");
        assert_eq!(converted.param_count, 3);
        let names: Vec<_> = converted.ordered_params.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "a"]);
    }

    #[test]
    fn converts_for_question_mark_engines() {
        let params = vec![int("userId", 123)];
        for engine in [EngineType::Sqlite, EngineType::Mysql, EngineType::Db2] {
            let converted =
                convert_named_to_positional("SELECT :userId", &params, engine).expect("convert");
            assert_eq!(converted.sql, "SELECT ?");
            assert_eq!(converted.values(), vec![TypedValue::Integer(123)]);
        }
    }

    #[test]
    fn skips_literals_comments_and_casts() {
        let params = vec![int("id", 1)];
        let sql = "select ':id', \"x:id\", `y:id`, now()::date -- :id\n/* :id /* :id */ */ from t where id = :id and body = $q$ :id $q$";
        let converted =
            convert_named_to_positional(sql, &params, EngineType::Postgresql).expect("convert");
        assert_eq!(
            converted.sql,
            "select ':id', \"x:id\", `y:id`, now()::date -- :id\n/* :id /* :id */ */ from t where id = $1 and body = $q$ :id $q$"
        );
        assert_eq!(converted.param_count, 1);
    }

    #[test]
    fn keeps_multibyte_text_intact() {
        let params = vec![int("id", 1)];
        let converted =
            convert_named_to_positional("select 'héllo', 'ü' where x = :id", &params, EngineType::Sqlite)
                .expect("convert");
        assert_eq!(converted.sql, "select 'héllo', 'ü' where x = ?");
    }

    #[test]
    fn missing_and_oversized_names_fail() {
        let err = convert_named_to_positional("select :nope", &[], EngineType::Sqlite)
            .expect_err("missing");
        assert!(matches!(err, DbQueueError::ParameterError(_)));

        let long = "x".repeat(MAX_PARAM_NAME_LEN + 1);
        let params = vec![int(&long, 1)];
        let err = convert_named_to_positional(&format!("select :{long}"), &params, EngineType::Sqlite)
            .expect_err("too long");
        assert!(matches!(err, DbQueueError::ParameterError(_)));
    }

    #[test]
    fn template_without_placeholders_is_unchanged() {
        let converted =
            convert_named_to_positional("SELECT 42 AS test_value", &[], EngineType::Sqlite)
                .expect("convert");
        assert_eq!(converted.sql, "SELECT 42 AS test_value");
        assert_eq!(converted.param_count, 0);
    }
}
