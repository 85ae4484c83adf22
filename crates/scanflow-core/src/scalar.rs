use crate::error::EngineError;
use chrono::NaiveDate;
use std::cmp::Ordering;

/// The declared type of a column, used to cast raw string field values
/// before they're compared (sort keys, join keys, top-K thresholds).
/// Mirrors the handful of Python builtins (`int`, `float`, `str`, a date
/// parser) the original used as `col_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColType {
    Int,
    Float,
    Str,
    Bool,
    Date,
}

/// A single cast, typed field value.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Date(NaiveDate),
    Null,
}

impl ColType {
    pub fn cast(&self, raw: &str) -> Result<ScalarValue, EngineError> {
        match self {
            ColType::Int => raw
                .parse::<i64>()
                .map(ScalarValue::Int)
                .map_err(|e| EngineError::schema("cast", format!("'{raw}' is not an int: {e}"))),
            ColType::Float => raw
                .parse::<f64>()
                .map(ScalarValue::Float)
                .map_err(|e| EngineError::schema("cast", format!("'{raw}' is not a float: {e}"))),
            ColType::Bool => match raw.to_ascii_lowercase().as_str() {
                "true" | "1" | "t" => Ok(ScalarValue::Bool(true)),
                "false" | "0" | "f" | "" => Ok(ScalarValue::Bool(false)),
                other => Err(EngineError::schema("cast", format!("'{other}' is not a bool"))),
            },
            ColType::Date => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .map(ScalarValue::Date)
                .map_err(|e| EngineError::schema("cast", format!("'{raw}' is not a date: {e}"))),
            ColType::Str => Ok(ScalarValue::Str(raw.to_string())),
        }
    }
}

impl ScalarValue {
    /// Ordering between two scalars of the *same* variant. Comparing
    /// across variants is a schema bug upstream (a sort/join expression
    /// pointed at mismatched columns), so it returns `None` rather than
    /// guessing.
    pub fn partial_cmp_typed(&self, other: &ScalarValue) -> Option<Ordering> {
        match (self, other) {
            (ScalarValue::Int(a), ScalarValue::Int(b)) => a.partial_cmp(b),
            (ScalarValue::Float(a), ScalarValue::Float(b)) => a.partial_cmp(b),
            (ScalarValue::Str(a), ScalarValue::Str(b)) => a.partial_cmp(b),
            (ScalarValue::Bool(a), ScalarValue::Bool(b)) => a.partial_cmp(b),
            (ScalarValue::Date(a), ScalarValue::Date(b)) => a.partial_cmp(b),
            (ScalarValue::Null, ScalarValue::Null) => Some(Ordering::Equal),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ScalarValue::Int(v) => Some(*v),
            ScalarValue::Float(v) => Some(*v as i64),
            ScalarValue::Bool(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn to_sql_literal(&self) -> String {
        match self {
            ScalarValue::Int(v) => v.to_string(),
            ScalarValue::Float(v) => v.to_string(),
            ScalarValue::Bool(v) => v.to_string(),
            ScalarValue::Date(v) => format!("'{v}'"),
            ScalarValue::Str(v) => format!("'{}'", v.replace('\'', "''")),
            ScalarValue::Null => "NULL".to_string(),
        }
    }
}
