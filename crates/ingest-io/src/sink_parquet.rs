use anyhow::Result;
use arrow_array::{
    ArrayRef, BooleanArray, Date32Array, Float64Array, Int64Array, RecordBatch, StringArray,
    TimestampMicrosecondArray,
};
use arrow_schema::{DataType as ArrowType, Field, Schema, SchemaRef, TimeUnit};
use async_trait::async_trait;
use chrono::Datelike;
use ingest_core::{DataType, Message, Operator, Row, RowRx, Sink, TableSchema, Value};
use parquet::arrow::arrow_writer::ArrowWriter;
use parquet::file::properties::WriterProperties;
use std::{fs, path::PathBuf, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Days between 0001-01-01 (CE day 1) and 1970-01-01
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

static NULL: Value = Value::Null;

pub struct ParquetDirSink {
    id: String,
    dir: PathBuf,
    schema: TableSchema,
    arrow_schema: SchemaRef,
}

impl ParquetDirSink {
    pub fn new(id: String, dir: PathBuf, schema: TableSchema) -> Self {
        let arrow_schema = arrow_schema(&schema);
        Self {
            id,
            dir,
            schema,
            arrow_schema,
        }
    }

    pub fn file_path(&self) -> PathBuf {
        self.dir.join(format!("{}.parquet", self.id))
    }
}

fn arrow_type(data_type: DataType) -> ArrowType {
    match data_type {
        DataType::Int64 => ArrowType::Int64,
        DataType::Float64 => ArrowType::Float64,
        DataType::String => ArrowType::Utf8,
        DataType::Boolean => ArrowType::Boolean,
        DataType::Date => ArrowType::Date32,
        DataType::Timestamp => ArrowType::Timestamp(TimeUnit::Microsecond, None),
    }
}

pub fn arrow_schema(schema: &TableSchema) -> SchemaRef {
    let fields: Vec<Field> = schema
        .fields
        .iter()
        .map(|f| Field::new(&f.name, arrow_type(f.data_type), f.nullable))
        .collect();
    Arc::new(Schema::new(fields))
}

/// Column-wise conversion of typed rows into an Arrow batch
fn to_record_batch(schema: &TableSchema, arrow: &SchemaRef, rows: &[Row]) -> Result<RecordBatch> {
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.fields.len());
    for (idx, field) in schema.fields.iter().enumerate() {
        let cells = rows
            .iter()
            .map(move |r| r.values.get(idx).unwrap_or(&NULL));
        let array: ArrayRef = match field.data_type {
            DataType::Int64 => Arc::new(
                cells
                    .map(|v| match v {
                        Value::Int(i) => Some(*i),
                        _ => None,
                    })
                    .collect::<Int64Array>(),
            ),
            DataType::Float64 => Arc::new(
                cells
                    .map(|v| match v {
                        Value::Float(f) => Some(*f),
                        Value::Int(i) => Some(*i as f64),
                        _ => None,
                    })
                    .collect::<Float64Array>(),
            ),
            DataType::String => Arc::new(
                cells
                    .map(|v| match v {
                        Value::Text(s) => Some(s.as_str()),
                        _ => None,
                    })
                    .collect::<StringArray>(),
            ),
            DataType::Boolean => Arc::new(
                cells
                    .map(|v| match v {
                        Value::Bool(b) => Some(*b),
                        _ => None,
                    })
                    .collect::<BooleanArray>(),
            ),
            DataType::Date => Arc::new(
                cells
                    .map(|v| match v {
                        Value::Date(d) => Some(d.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE),
                        _ => None,
                    })
                    .collect::<Date32Array>(),
            ),
            DataType::Timestamp => Arc::new(
                cells
                    .map(|v| match v {
                        Value::Timestamp(t) => Some(t.and_utc().timestamp_micros()),
                        _ => None,
                    })
                    .collect::<TimestampMicrosecondArray>(),
            ),
        };
        columns.push(array);
    }
    Ok(RecordBatch::try_new(arrow.clone(), columns)?)
}

impl Operator for ParquetDirSink {
    fn name(&self) -> &str {
        &self.id
    }
}

#[async_trait]
impl Sink for ParquetDirSink {
    async fn run(&mut self, mut rx: RowRx, _cancel: CancellationToken) -> Result<u64> {
        fs::create_dir_all(&self.dir)?;
        let file = fs::File::create(self.file_path())?;
        let props = WriterProperties::builder().build();
        let mut writer = ArrowWriter::try_new(file, self.arrow_schema.clone(), Some(props))?;
        let mut written: u64 = 0;
        while let Some(msg) = rx.recv().await {
            match msg {
                Message::Batch(rows) => {
                    info!("Writing batch with {} rows", rows.len());
                    let batch = to_record_batch(&self.schema, &self.arrow_schema, &rows)?;
                    writer.write(&batch)?;
                    written += rows.len() as u64;
                }
                Message::Eos => break,
            }
        }
        writer.close()?;
        info!(sink = %self.id, rows = written, "parquet file closed");
        Ok(written)
    }
}
