//! Record model: what sources emit, what sinks persist, and what the error log keeps.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::fmt;

/// A record as read from a source, before any typing
#[derive(Debug, Clone, PartialEq)]
pub enum RawRecord {
    /// Positional text fields, e.g. one row of a delimited file
    Fields(Vec<String>),
    /// Positional JSON values
    Array(Vec<JsonValue>),
    /// Named JSON fields, e.g. one object of an API response
    Object(Map<String, JsonValue>),
}

impl RawRecord {
    /// Wrap a JSON value; only objects and arrays are records.
    pub fn from_json(value: JsonValue) -> Option<Self> {
        match value {
            JsonValue::Object(map) => Some(Self::Object(map)),
            JsonValue::Array(items) => Some(Self::Array(items)),
            _ => None,
        }
    }

    /// Number of fields carried by the record
    pub fn width(&self) -> usize {
        match self {
            Self::Fields(fields) => fields.len(),
            Self::Array(items) => items.len(),
            Self::Object(map) => map.len(),
        }
    }
}

impl fmt::Display for RawRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fields(fields) => write!(f, "{}", fields.join(",")),
            Self::Array(items) => {
                let text = serde_json::to_string(items).map_err(|_| fmt::Error)?;
                f.write_str(&text)
            }
            Self::Object(map) => {
                let text = serde_json::to_string(map).map_err(|_| fmt::Error)?;
                f.write_str(&text)
            }
        }
    }
}

/// A raw record tagged with where it came from
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    /// 1-based position of the record within the run
    pub ordinal: u64,
    /// Human readable location, e.g. `orders.csv:12` or `orders/0@41`
    pub origin: String,
    pub raw: RawRecord,
}

impl SourceRecord {
    pub fn new(ordinal: u64, origin: impl Into<String>, raw: RawRecord) -> Self {
        Self {
            ordinal,
            origin: origin.into(),
            raw,
        }
    }
}

/// A typed scalar destined for one column of a destination row
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Bool(bool),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric view used by range checks
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(v) => f.write_str(v),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Date(v) => write!(f, "{}", v.format("%Y-%m-%d")),
            Value::Timestamp(v) => write!(f, "{}", v.format("%Y-%m-%d %H:%M:%S%.f")),
        }
    }
}

/// A typed tuple matching the destination schema
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Ordinal of the source record this row was mapped from
    pub ordinal: u64,
    pub values: Vec<Value>,
}

/// Pipeline stage that produced an error entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Source,
    Map,
    Load,
    Validate,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Source => "source",
            Stage::Map => "map",
            Stage::Load => "load",
            Stage::Validate => "validate",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of the error log: a free-text message and when it was recorded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub at: DateTime<Utc>,
    pub stage: Stage,
    pub message: String,
}

impl ErrorEntry {
    /// Create an entry stamped with the current time
    pub fn new(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            stage,
            message: message.into(),
        }
    }
}
