//! # Ingest I/O - source readers and destination writers
//!
//! Concrete implementations of the operator traits from `ingest-core`.
//!
//! ## Features
//!
//! ### Sources
//! - **Delimited files**: configurable field/row terminators and header-skip offset
//! - **JSON files**: one array per file or JSON lines
//! - **HTTP**: REST endpoints returning a JSON array, fetched once or polled
//! - **Kafka** (feature `kafka`): JSON payloads consumed one message at a time
//!
//! ### Destinations
//! - **SQLite**: bulk (transaction per chunk) or row-by-row with per-row commit
//! - **Parquet**: one columnar file per sink
//! - **Stdout**: debugging output
//!
//! ### Error logs
//! - SQLite side table, JSON-lines file, or `tracing` events
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use ingest_core::DelimitedSourceSpec;
//! use ingest_io::source_delimited::DelimitedSource;
//!
//! # fn example() -> anyhow::Result<()> {
//! let _source = DelimitedSource::try_new(DelimitedSourceSpec {
//!     id: "orders".to_string(),
//!     path: "exports/orders-*.csv".to_string(),
//!     field_terminator: "|".to_string(),
//!     row_terminator: "\n".to_string(),
//!     quote: "\"".to_string(),
//!     skip_rows: 1,
//!     batch_rows: 1024,
//! })?;
//! # Ok(())
//! # }
//! ```

use anyhow::{Context, Result};
use glob::glob;
use ingest_core::{SharedErrorLog, Sink, SinkSpec, Source, SourceSpec, TableProbe, TableSchema};
use std::path::PathBuf;

mod emit;

/// Error log stores
pub mod error_log;

/// Parquet file sink implementation
pub mod sink_parquet;

/// SQLite table sink implementation
pub mod sink_sqlite;

/// Standard output sink for debugging
pub mod sink_stdout;

/// Delimited flat file source implementation
pub mod source_delimited;

/// HTTP API source implementation
pub mod source_http;

/// JSON file source implementation
pub mod source_json;

/// Apache Kafka source implementation
#[cfg(feature = "kafka")]
pub mod source_kafka;

/// SQLite helpers and the table probe used by post-load checks
pub mod sqlite;

pub use error_log::open_error_log;

/// Resolve a path or glob pattern into a sorted, non-empty list of files
pub fn expand_paths(pattern: &str) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in glob(pattern).context("glob")? {
        paths.push(entry?);
    }
    if paths.is_empty() {
        anyhow::bail!("no files matched: {}", pattern);
    }
    paths.sort();
    Ok(paths)
}

/// Instantiate the source described by `spec`
pub fn build_source(spec: &SourceSpec, errors: SharedErrorLog) -> Result<Box<dyn Source>> {
    Ok(match spec {
        SourceSpec::Delimited(s) => Box::new(source_delimited::DelimitedSource::try_new(s.clone())?),
        SourceSpec::JsonFile(s) => Box::new(source_json::JsonFileSource::new(s.clone())),
        SourceSpec::Http(s) => Box::new(source_http::HttpSource::try_new(s.clone())?),
        #[cfg(feature = "kafka")]
        SourceSpec::Kafka(s) => Box::new(source_kafka::KafkaSource::new(s.clone(), errors)),
        #[cfg(not(feature = "kafka"))]
        SourceSpec::Kafka(s) => {
            let _ = errors;
            anyhow::bail!("source {} needs kafka support; rebuild with the `kafka` feature", s.id)
        }
    })
}

/// Instantiate the destination writer described by `spec`
pub fn build_sink(
    spec: &SinkSpec,
    schema: &TableSchema,
    errors: SharedErrorLog,
) -> Result<Box<dyn Sink>> {
    Ok(match spec {
        SinkSpec::Sqlite(s) => Box::new(sink_sqlite::SqliteSink::new(
            s.clone(),
            schema.clone(),
            errors,
        )),
        SinkSpec::ParquetDir { id, path } => Box::new(sink_parquet::ParquetDirSink::new(
            id.clone(),
            PathBuf::from(path),
            schema.clone(),
        )),
        SinkSpec::Stdout { id } => Box::new(sink_stdout::StdoutSink::new(id.clone())),
    })
}

/// Read-side handle on the destination, for destinations that can be queried
pub fn open_probe(spec: &SinkSpec) -> Result<Option<Box<dyn TableProbe>>> {
    Ok(match spec {
        SinkSpec::Sqlite(s) => Some(Box::new(sqlite::SqliteTable::open(&s.path, s.table.clone())?)),
        SinkSpec::ParquetDir { .. } | SinkSpec::Stdout { .. } => None,
    })
}
