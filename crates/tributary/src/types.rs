//! Value types for tributary
//!
//! A deliberately small value model covering what bulk inserts into a
//! columnar store need: scalars, strings, binary, timestamps and arrays.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A single row of values, in column order
pub type Row = Vec<Value>;

/// Column value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// NULL
    Null,
    /// Boolean value
    Bool(bool),
    /// Signed 64-bit integer
    Int64(i64),
    /// Unsigned 64-bit integer
    UInt64(u64),
    /// 64-bit floating point
    Float64(f64),
    /// Text string
    String(String),
    /// Binary data
    Bytes(Vec<u8>),
    /// Timestamp in UTC
    DateTime(DateTime<Utc>),
    /// Array of values
    Array(Vec<Value>),
}

impl Value {
    /// Check if value is NULL
    #[inline]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Try to convert to i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int64(v) => Some(*v),
            Self::UInt64(v) => i64::try_from(*v).ok(),
            Self::Bool(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    /// Try to get as string slice
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Encode the value for JSON row formats.
    ///
    /// Timestamps are rendered as `YYYY-MM-DD hh:mm:ss.fff` text, non-finite
    /// floats as `nan`/`inf`/`-inf` strings. Binary data must be valid UTF-8
    /// because JSON strings cannot carry arbitrary bytes.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        let json = match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(v) => serde_json::Value::Bool(*v),
            Self::Int64(v) => serde_json::Value::from(*v),
            Self::UInt64(v) => serde_json::Value::from(*v),
            Self::Float64(v) => match serde_json::Number::from_f64(*v) {
                Some(n) => serde_json::Value::Number(n),
                None => serde_json::Value::String(non_finite(*v).to_string()),
            },
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Bytes(b) => match std::str::from_utf8(b) {
                Ok(s) => serde_json::Value::String(s.to_string()),
                Err(e) => {
                    return Err(Error::Query {
                        message: "binary value is not valid UTF-8".to_string(),
                        sql: None,
                        source: Some(Box::new(e)),
                    })
                }
            },
            Self::DateTime(ts) => serde_json::Value::String(format_timestamp(ts)),
            Self::Array(values) => serde_json::Value::Array(
                values.iter().map(Value::to_json).collect::<Result<_>>()?,
            ),
        };
        Ok(json)
    }

    /// Decode a value from a JSON result cell.
    ///
    /// Integers keep their sign class, objects are kept as their JSON text.
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(v) => Self::Bool(v),
            serde_json::Value::Number(n) => {
                if let Some(v) = n.as_i64() {
                    Self::Int64(v)
                } else if let Some(v) = n.as_u64() {
                    Self::UInt64(v)
                } else {
                    Self::Float64(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(values) => {
                Self::Array(values.into_iter().map(Value::from_json).collect())
            }
            object @ serde_json::Value::Object(_) => Self::String(object.to_string()),
        }
    }
}

pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

pub(crate) fn non_finite(v: f64) -> &'static str {
    if v.is_nan() {
        "nan"
    } else if v > 0.0 {
        "inf"
    } else {
        "-inf"
    }
}

/// Conversion from an application entity into a row.
///
/// Column order must match the column list handed to the repository.
pub trait IntoRow {
    /// Produce the row values for this entity
    fn into_row(self) -> Row;
}

impl IntoRow for Row {
    fn into_row(self) -> Row {
        self
    }
}

/// Conversion from a result row into an application entity.
///
/// Closures `Fn(&Row) -> Result<T>` are mappers too.
pub trait EntityMapper<T> {
    /// Build the entity; cells arrive in select-list order
    fn map_entity(&self, row: &Row) -> Result<T>;
}

impl<T, F> EntityMapper<T> for F
where
    F: Fn(&Row) -> Result<T>,
{
    fn map_entity(&self, row: &Row) -> Result<T> {
        self(row)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int64(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::UInt64(u64::from(v))
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Self::UInt64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Self::DateTime(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Self::Null,
        }
    }
}
