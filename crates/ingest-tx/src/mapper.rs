//! Raw record to typed row conversion.
//!
//! Mapping is positional for field lists and JSON arrays and by name for JSON
//! objects. A record that cannot be mapped is written to the error log and
//! dropped; the rest of its batch carries on.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use ingest_core::{
    DataType, FieldConfig, MapStats, Message, Operator, RawRecord, RecordRx, Row, RowTx,
    SharedErrorLog, SourceRecord, Stage, TableSchema, Transform, Value,
};
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%d";
const TIMESTAMP_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MapError {
    #[error("expected {expected} fields, found {actual}")]
    FieldCount { expected: usize, actual: usize },

    #[error("field `{field}`: cannot parse {value:?} as {expected}")]
    Parse {
        field: String,
        value: String,
        expected: DataType,
    },

    #[error("field `{field}` is required but empty")]
    Null { field: String },

    #[error("field `{field}`: value {value} is outside {}", describe_range(.min, .max))]
    OutOfRange {
        field: String,
        value: f64,
        min: Option<f64>,
        max: Option<f64>,
    },
}

fn describe_range(min: &Option<f64>, max: &Option<f64>) -> String {
    let lo = min.map_or("-inf".to_string(), |v| v.to_string());
    let hi = max.map_or("+inf".to_string(), |v| v.to_string());
    format!("[{lo}, {hi}]")
}

fn parse_error(field: &FieldConfig, value: impl Into<String>) -> MapError {
    MapError::Parse {
        field: field.name.clone(),
        value: value.into(),
        expected: field.data_type,
    }
}

fn parse_bool(text: &str) -> Option<bool> {
    match text.to_ascii_lowercase().as_str() {
        "true" | "t" | "yes" | "y" | "1" => Some(true),
        "false" | "f" | "no" | "n" | "0" => Some(false),
        _ => None,
    }
}

fn parse_timestamp(field: &FieldConfig, text: &str) -> Option<NaiveDateTime> {
    if let Some(format) = &field.format {
        return NaiveDateTime::parse_from_str(text, format).ok();
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.naive_utc());
    }
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
}

/// Convert one text cell. Surrounding whitespace is ignored and an empty cell is null.
fn parse_text(field: &FieldConfig, raw: &str) -> Result<Value, MapError> {
    let text = raw.trim();
    if text.is_empty() {
        return Ok(Value::Null);
    }
    let value = match field.data_type {
        DataType::Int64 => Value::Int(text.parse().map_err(|_| parse_error(field, text))?),
        DataType::Float64 => {
            let v: f64 = text.parse().map_err(|_| parse_error(field, text))?;
            if !v.is_finite() {
                return Err(parse_error(field, text));
            }
            Value::Float(v)
        }
        DataType::String => Value::Text(text.to_string()),
        DataType::Boolean => Value::Bool(parse_bool(text).ok_or_else(|| parse_error(field, text))?),
        DataType::Date => {
            let format = field.format.as_deref().unwrap_or(DEFAULT_DATE_FORMAT);
            Value::Date(
                NaiveDate::parse_from_str(text, format).map_err(|_| parse_error(field, text))?,
            )
        }
        DataType::Timestamp => {
            Value::Timestamp(parse_timestamp(field, text).ok_or_else(|| parse_error(field, text))?)
        }
    };
    Ok(value)
}

/// Convert one JSON cell. Strings go through the text rules.
fn parse_json(field: &FieldConfig, raw: &JsonValue) -> Result<Value, MapError> {
    match (raw, field.data_type) {
        (JsonValue::Null, _) => Ok(Value::Null),
        (JsonValue::String(s), _) => parse_text(field, s),
        (JsonValue::Number(n), DataType::Int64) => n
            .as_i64()
            .map(Value::Int)
            .ok_or_else(|| parse_error(field, n.to_string())),
        (JsonValue::Number(n), DataType::Float64) => n
            .as_f64()
            .map(Value::Float)
            .ok_or_else(|| parse_error(field, n.to_string())),
        (JsonValue::Number(n), DataType::String) => Ok(Value::Text(n.to_string())),
        (JsonValue::Number(n), DataType::Boolean) => match n.as_i64() {
            Some(1) => Ok(Value::Bool(true)),
            Some(0) => Ok(Value::Bool(false)),
            _ => Err(parse_error(field, n.to_string())),
        },
        (JsonValue::Bool(b), DataType::Boolean) => Ok(Value::Bool(*b)),
        (JsonValue::Bool(b), DataType::String) => Ok(Value::Text(b.to_string())),
        (other, _) => Err(parse_error(field, other.to_string())),
    }
}

/// Apply nullability and range constraints to an already typed value
fn constrain(field: &FieldConfig, value: Value) -> Result<Value, MapError> {
    if value.is_null() {
        return if field.nullable {
            Ok(value)
        } else {
            Err(MapError::Null {
                field: field.name.clone(),
            })
        };
    }
    if let Some(v) = value.as_f64() {
        let below = field.min.is_some_and(|min| v < min);
        let above = field.max.is_some_and(|max| v > max);
        if below || above {
            return Err(MapError::OutOfRange {
                field: field.name.clone(),
                value: v,
                min: field.min,
                max: field.max,
            });
        }
    }
    Ok(value)
}

/// Map one record onto `schema`
pub fn map_record(schema: &TableSchema, record: &SourceRecord) -> Result<Row, MapError> {
    let expected = schema.fields.len();
    let values = match &record.raw {
        RawRecord::Fields(cells) => {
            if cells.len() != expected {
                return Err(MapError::FieldCount {
                    expected,
                    actual: cells.len(),
                });
            }
            schema
                .fields
                .iter()
                .zip(cells)
                .map(|(field, cell)| constrain(field, parse_text(field, cell)?))
                .collect::<Result<Vec<_>, _>>()?
        }
        RawRecord::Array(cells) => {
            if cells.len() != expected {
                return Err(MapError::FieldCount {
                    expected,
                    actual: cells.len(),
                });
            }
            schema
                .fields
                .iter()
                .zip(cells)
                .map(|(field, cell)| constrain(field, parse_json(field, cell)?))
                .collect::<Result<Vec<_>, _>>()?
        }
        RawRecord::Object(map) => schema
            .fields
            .iter()
            .map(|field| {
                let value = match map.get(&field.name) {
                    Some(cell) => parse_json(field, cell)?,
                    None => Value::Null,
                };
                constrain(field, value)
            })
            .collect::<Result<Vec<_>, _>>()?,
    };
    Ok(Row {
        ordinal: record.ordinal,
        values,
    })
}

/// Transform operator wrapping [`map_record`] with per-record error isolation
pub struct RecordMapper {
    id: String,
    schema: TableSchema,
    errors: SharedErrorLog,
}

impl RecordMapper {
    pub fn new(id: impl Into<String>, schema: TableSchema, errors: SharedErrorLog) -> Self {
        Self {
            id: id.into(),
            schema,
            errors,
        }
    }

    /// Map a batch, logging every rejected record
    fn map_batch(&self, records: &[SourceRecord], stats: &mut MapStats) -> anyhow::Result<Vec<Row>> {
        let mut rows = Vec::with_capacity(records.len());
        for record in records {
            match map_record(&self.schema, record) {
                Ok(row) => rows.push(row),
                Err(err) => {
                    stats.rejected += 1;
                    debug!(mapper = %self.id, origin = %record.origin, error = %err, "record rejected");
                    self.errors
                        .record(Stage::Map, format!("{}: {} [{}]", record.origin, err, record.raw))?;
                }
            }
        }
        stats.mapped += rows.len() as u64;
        Ok(rows)
    }
}

impl Operator for RecordMapper {
    fn name(&self) -> &str {
        &self.id
    }
}

#[async_trait]
impl Transform for RecordMapper {
    async fn run(
        &mut self,
        mut rx: RecordRx,
        tx: RowTx,
        _cancel: CancellationToken,
    ) -> anyhow::Result<MapStats> {
        info!(mapper = %self.id, fields = self.schema.len(), "mapper started");
        let mut stats = MapStats::default();
        while let Some(msg) = rx.recv().await {
            match msg {
                Message::Batch(records) => {
                    let rows = self.map_batch(&records, &mut stats)?;
                    if !rows.is_empty() && tx.send(Message::Batch(rows)).await.is_err() {
                        warn!(mapper = %self.id, "sink channel closed");
                        break;
                    }
                }
                Message::Eos => {
                    let _ = tx.send(Message::Eos).await;
                    break;
                }
            }
        }
        info!(
            mapper = %self.id,
            mapped = stats.mapped,
            rejected = stats.rejected,
            "mapper finished"
        );
        Ok(stats)
    }
}
