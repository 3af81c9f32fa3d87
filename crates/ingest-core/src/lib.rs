//! # Ingest Core - shared model for the ingestion driver
//!
//! This crate provides the foundational types, traits, and configuration structures
//! for moving records from an external source into a relational destination table.
//! Every load runs the same three-stage loop: a [`Source`] reads raw records, a
//! [`Transform`] maps them onto the destination schema, and a [`Sink`] writes the
//! typed rows. Operators talk over bounded channels of [`Message`]s.
//!
//! ## Key Components
//!
//! - **Message System**: batches of records or rows followed by an end-of-stream marker
//! - **Operator Traits**: Source, Transform, and Sink abstractions shared by every connector
//! - **Record Model**: raw records, typed values and rows, error entries
//! - **Configuration**: YAML-based pipeline specification
//! - **Error Logging**: the [`ErrorLog`] side channel that records rejected records
//!
//! ## Example Usage
//!
//! ```rust
//! use ingest_core::{Message, SourceRecord};
//! use tokio::sync::mpsc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let (tx, rx) = mpsc::channel::<Message<SourceRecord>>(8);
//! let cancel = CancellationToken::new();
//!
//! // Pipeline operators implement the Source, Transform, and Sink traits
//! # drop((tx, rx, cancel));
//! # Ok(())
//! # }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod error_log;
pub mod record;
pub mod spec;

pub use error_log::{ErrorLog, MemoryErrorLog, SharedErrorLog, TracingErrorLog};
pub use record::{ErrorEntry, RawRecord, Row, SourceRecord, Stage, Value};
pub use spec::{
    ConfigError, DataType, DelimitedSourceSpec, ErrorLogSpec, FieldConfig, HttpSourceSpec,
    JsonFileSourceSpec, JsonFormat, KafkaSourceSpec, LoadMode, PipelineSpec, RangeCheck,
    SinkSpec, SourceSpec, SqliteSinkSpec, TableSchema, ValidationSpec,
};

/// Sender side of the channel between a source and the mapper
pub type RecordTx = mpsc::Sender<Message<SourceRecord>>;

/// Receiver side of the channel between a source and the mapper
pub type RecordRx = mpsc::Receiver<Message<SourceRecord>>;

/// Sender side of the channel between the mapper and a sink
pub type RowTx = mpsc::Sender<Message<Row>>;

/// Receiver side of the channel between the mapper and a sink
pub type RowRx = mpsc::Receiver<Message<Row>>;

/// Messages passed between pipeline operators
#[derive(Debug, Clone, PartialEq)]
pub enum Message<T> {
    /// A batch of records (source side) or typed rows (sink side)
    Batch(Vec<T>),

    /// End-of-stream marker
    ///
    /// Signals that no more data will be sent through this channel,
    /// allowing downstream operators to flush and finish.
    Eos,
}

/// Counters reported by the record mapper at end of stream
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapStats {
    /// Records converted into destination rows
    pub mapped: u64,
    /// Records that failed mapping and went to the error log
    pub rejected: u64,
}

/// Base trait for all pipeline operators
pub trait Operator: Send + Sync {
    /// Returns the unique name/identifier of this operator
    ///
    /// Used for logging and error messages.
    fn name(&self) -> &str;
}

/// Trait for data source operators
///
/// Sources are the entry points of a load, responsible for reading raw records
/// from an external system.
///
/// ## Examples
/// - Delimited text file reader
/// - JSON file reader
/// - HTTP API poller
/// - Kafka consumer
#[async_trait]
pub trait Source: Operator {
    /// Run the source operator
    ///
    /// Emits batches of records followed by [`Message::Eos`]. An unreachable or
    /// malformed source aborts the run with an error.
    ///
    /// # Returns
    /// The number of records read from the source
    async fn run(&mut self, tx: RecordTx, cancel: CancellationToken) -> Result<u64>;
}

/// Trait for record transformation operators
///
/// Transforms sit between source and sink and convert raw records into typed
/// rows matching the destination schema.
#[async_trait]
pub trait Transform: Operator {
    /// Run the transform operator until the upstream channel reaches end of stream
    async fn run(&mut self, rx: RecordRx, tx: RowTx, cancel: CancellationToken)
        -> Result<MapStats>;
}

/// Trait for destination writers
///
/// ## Examples
/// - SQLite table writer (bulk or row-by-row)
/// - Parquet file writer
/// - Console output for debugging
#[async_trait]
pub trait Sink: Operator {
    /// Run the sink operator
    ///
    /// # Returns
    /// The number of rows written to the destination
    async fn run(&mut self, rx: RowRx, cancel: CancellationToken) -> Result<u64>;
}

/// A destination row whose numeric column fell outside a range check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    /// Row identifier inside the destination table
    pub row_id: i64,
    /// Column that was checked
    pub column: String,
    /// Offending value
    pub value: f64,
}

/// Read-only access to a loaded destination table, used for post-load checks
pub trait TableProbe {
    /// Name of the table being probed
    fn table(&self) -> &str;

    /// Current number of rows in the table (0 if the table does not exist)
    fn count_rows(&self) -> Result<u64>;

    /// Rows whose `check.column` value lies below `check.min` or above `check.max`
    fn find_out_of_range(&self, check: &RangeCheck) -> Result<Vec<Violation>>;
}
