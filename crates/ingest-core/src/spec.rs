//! Pipeline specification loaded from YAML.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

const ENV_REF: &str = r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}";

/// Errors raised while loading or checking a pipeline specification
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("parse pipeline yaml: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("environment variable {0} is referenced but not set")]
    MissingEnv(String),

    #[error("invalid pipeline spec: {0}")]
    Invalid(String),
}

/// Complete load specification
///
/// One source feeds the record mapper, which feeds one destination.
///
/// # Example YAML Configuration
///
/// ```yaml
/// name: orders
/// source:
///   type: file_delimited
///   id: orders-csv
///   path: data/orders.csv
///   skip_rows: 1
/// schema:
///   fields:
///     - { name: order_id, data_type: int64 }
///     - { name: customer_id, data_type: int64 }
///     - { name: order_date, data_type: date }
///     - { name: amount, data_type: float64, min: 0 }
///     - { name: status, data_type: string, nullable: true }
/// sink:
///   type: sqlite
///   id: orders-db
///   path: shop.db
///   table: orders
///   mode: bulk
/// error_log:
///   type: sqlite
///   path: shop.db
/// validation:
///   checks:
///     - { column: amount, min: 0 }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSpec {
    /// Human-readable name of the load
    pub name: String,

    /// Where records come from
    pub source: SourceSpec,

    /// Destination schema every record is mapped onto
    pub schema: TableSchema,

    /// Where typed rows are written
    pub sink: SinkSpec,

    /// Where rejected records and check failures are recorded
    #[serde(default)]
    pub error_log: ErrorLogSpec,

    /// Post-load checks
    #[serde(default)]
    pub validation: ValidationSpec,
}

impl PipelineSpec {
    /// Parse a specification, then expand `${VAR}` references in its string values
    ///
    /// Expansion runs on parsed scalars, so a value may contain any YAML
    /// syntax and references inside comments are never looked up.
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let mut document: serde_yaml::Value = serde_yaml::from_str(text)?;
        expand_strings(&mut document)?;
        Ok(serde_yaml::from_value(document)?)
    }

    /// Read, parse and validate a specification file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let spec = Self::from_yaml(&text)?;
        spec.validate()?;
        Ok(spec)
    }

    /// Check cross-field consistency that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.schema.validate()?;

        match &self.source {
            SourceSpec::Delimited(spec) => {
                single_byte("field_terminator", &spec.field_terminator)?;
                single_byte("quote", &spec.quote)?;
                if spec.row_terminator != "\r\n" {
                    single_byte("row_terminator", &spec.row_terminator)?;
                }
                non_zero("batch_rows", spec.batch_rows)?;
            }
            SourceSpec::JsonFile(spec) => non_zero("batch_rows", spec.batch_rows)?,
            SourceSpec::Http(spec) => {
                if spec.max_polls == Some(0) {
                    return Err(invalid("max_polls must be at least 1"));
                }
                if let Some(pointer) = &spec.records_pointer {
                    if !pointer.is_empty() && !pointer.starts_with('/') {
                        return Err(invalid(format!(
                            "records_pointer `{pointer}` must be empty or start with `/`"
                        )));
                    }
                }
            }
            SourceSpec::Kafka(_) => {}
        }

        if let SinkSpec::Sqlite(spec) = &self.sink {
            if spec.table.trim().is_empty() {
                return Err(invalid("sqlite sink table name is empty"));
            }
            non_zero("commit_rows", spec.commit_rows)?;
        }

        for check in &self.validation.checks {
            let field = self.schema.field(&check.column).ok_or_else(|| {
                invalid(format!("range check names unknown column `{}`", check.column))
            })?;
            if !field.data_type.is_numeric() {
                return Err(invalid(format!(
                    "range check on `{}` needs a numeric column, found {}",
                    check.column, field.data_type
                )));
            }
            check_bounds(&check.column, check.min, check.max)?;
            if check.min.is_none() && check.max.is_none() {
                return Err(invalid(format!(
                    "range check on `{}` sets neither min nor max",
                    check.column
                )));
            }
        }
        Ok(())
    }
}

fn expand_strings(value: &mut serde_yaml::Value) -> Result<(), ConfigError> {
    use serde_yaml::Value as Yaml;
    match value {
        Yaml::String(text) if text.contains("${") => *text = expand_env(text)?,
        Yaml::Sequence(items) => {
            for item in items {
                expand_strings(item)?;
            }
        }
        Yaml::Mapping(map) => {
            for item in map.values_mut() {
                expand_strings(item)?;
            }
        }
        Yaml::Tagged(tagged) => expand_strings(&mut tagged.value)?,
        _ => {}
    }
    Ok(())
}

/// Replace `${VAR}` with the value of the environment variable `VAR`
pub fn expand_env(text: &str) -> Result<String, ConfigError> {
    let pattern = Regex::new(ENV_REF).map_err(|e| invalid(e.to_string()))?;
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in pattern.captures_iter(text) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let name = name.as_str();
        let value = std::env::var(name).map_err(|_| ConfigError::MissingEnv(name.to_string()))?;
        out.push_str(&text[last..whole.start()]);
        out.push_str(&value);
        last = whole.end();
    }
    out.push_str(&text[last..]);
    Ok(out)
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

fn single_byte(name: &str, value: &str) -> Result<(), ConfigError> {
    if value.len() == 1 {
        Ok(())
    } else {
        Err(invalid(format!(
            "{name} must be a single byte, found {value:?}"
        )))
    }
}

fn non_zero(name: &str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        Err(invalid(format!("{name} must be greater than zero")))
    } else {
        Ok(())
    }
}

fn check_bounds(column: &str, min: Option<f64>, max: Option<f64>) -> Result<(), ConfigError> {
    if let (Some(lo), Some(hi)) = (min, max) {
        if lo > hi {
            return Err(invalid(format!(
                "`{column}` has min {lo} greater than max {hi}"
            )));
        }
    }
    Ok(())
}

/// Ordered list of destination columns
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    #[serde(default)]
    pub fields: Vec<FieldConfig>,
}

impl TableSchema {
    pub fn new(fields: Vec<FieldConfig>) -> Self {
        Self { fields }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field(&self, name: &str) -> Option<&FieldConfig> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fields.is_empty() {
            return Err(invalid("schema has no fields"));
        }
        let mut seen = HashSet::new();
        for field in &self.fields {
            if field.name.trim().is_empty() {
                return Err(invalid("schema field with an empty name"));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(invalid(format!("duplicate schema field `{}`", field.name)));
            }
            if (field.min.is_some() || field.max.is_some()) && !field.data_type.is_numeric() {
                return Err(invalid(format!(
                    "`{}` is {} and cannot carry min/max",
                    field.name, field.data_type
                )));
            }
            check_bounds(&field.name, field.min, field.max)?;
        }
        Ok(())
    }
}

/// One destination column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldConfig {
    pub name: String,
    pub data_type: DataType,
    #[serde(default)]
    pub nullable: bool,
    /// Smallest accepted value for numeric columns
    #[serde(default)]
    pub min: Option<f64>,
    /// Largest accepted value for numeric columns
    #[serde(default)]
    pub max: Option<f64>,
    /// chrono format string for `date` and `timestamp` columns
    #[serde(default)]
    pub format: Option<String>,
}

impl FieldConfig {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: false,
            min: None,
            max: None,
            format: None,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn with_min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    pub fn with_max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }
}

/// Scalar column types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Int64,
    Float64,
    String,
    Boolean,
    Date,
    Timestamp,
}

impl DataType {
    pub fn is_numeric(&self) -> bool {
        matches!(self, DataType::Int64 | DataType::Float64)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DataType::Int64 => "int64",
            DataType::Float64 => "float64",
            DataType::String => "string",
            DataType::Boolean => "boolean",
            DataType::Date => "date",
            DataType::Timestamp => "timestamp",
        })
    }
}

fn default_batch_rows() -> usize {
    1024
}

fn default_field_terminator() -> String {
    ",".to_string()
}

fn default_row_terminator() -> String {
    "\n".to_string()
}

fn default_quote() -> String {
    "\"".to_string()
}

/// Configuration for delimited flat files
///
/// Mirrors the knobs of a bulk-load command: field and row terminators plus a
/// header-skip offset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelimitedSourceSpec {
    /// Unique identifier for this source operator
    pub id: String,

    /// File path or glob pattern
    ///
    /// Examples: "orders.csv", "exports/*.tsv"
    pub path: String,

    /// Single-byte field separator
    #[serde(default = "default_field_terminator")]
    pub field_terminator: String,

    /// Row separator: "\n", "\r\n" or any other single byte
    #[serde(default = "default_row_terminator")]
    pub row_terminator: String,

    /// Single-byte quote character
    #[serde(default = "default_quote")]
    pub quote: String,

    /// Number of leading rows skipped in every file (header rows)
    #[serde(default)]
    pub skip_rows: usize,

    /// Records sent downstream per message
    #[serde(default = "default_batch_rows")]
    pub batch_rows: usize,
}

/// Layout of a JSON input file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JsonFormat {
    /// The whole file is one JSON array
    #[default]
    Array,
    /// One JSON document per line
    Lines,
}

/// Configuration for JSON files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonFileSourceSpec {
    pub id: String,
    pub path: String,
    #[serde(default)]
    pub format: JsonFormat,
    #[serde(default = "default_batch_rows")]
    pub batch_rows: usize,
}

fn default_timeout_secs() -> u64 {
    30
}

/// Configuration for REST endpoints returning a JSON array of objects
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSourceSpec {
    pub id: String,

    pub url: String,

    /// Extra request headers
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Sent as `Authorization: Bearer <token>`; use `${VAR}` to keep it out of the file
    #[serde(default)]
    pub bearer_token: Option<String>,

    /// JSON pointer to the record array inside the response body
    ///
    /// Example: "/data/items". Empty or absent means the body itself.
    #[serde(default)]
    pub records_pointer: Option<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Seconds between fetches when polling
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,

    /// Number of fetches; defaults to one, or unbounded when an interval is set
    #[serde(default)]
    pub max_polls: Option<u32>,
}

/// Configuration for Kafka topics carrying JSON payloads
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaSourceSpec {
    pub id: String,

    /// Comma-separated list of Kafka broker addresses
    ///
    /// Example: "localhost:9092" or "broker1:9092,broker2:9092"
    pub brokers: String,

    /// Kafka consumer group ID
    pub group_id: String,

    /// Name of the Kafka topic to consume from
    pub topic: String,

    /// Stop after this many messages
    #[serde(default)]
    pub max_messages: Option<u64>,

    /// Stop when no message arrives within this many milliseconds
    #[serde(default)]
    pub idle_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SourceSpec {
    #[serde(rename = "file_delimited")]
    Delimited(DelimitedSourceSpec),
    #[serde(rename = "file_json")]
    JsonFile(JsonFileSourceSpec),
    #[serde(rename = "http")]
    Http(HttpSourceSpec),
    #[serde(rename = "kafka")]
    Kafka(KafkaSourceSpec),
}

impl SourceSpec {
    pub fn id(&self) -> &str {
        match self {
            SourceSpec::Delimited(s) => &s.id,
            SourceSpec::JsonFile(s) => &s.id,
            SourceSpec::Http(s) => &s.id,
            SourceSpec::Kafka(s) => &s.id,
        }
    }
}

/// How rows reach the destination table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadMode {
    /// Many rows per transaction
    #[default]
    Bulk,
    /// One autocommitted insert per row
    Row,
}

fn default_commit_rows() -> usize {
    10_000
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteSinkSpec {
    pub id: String,
    /// Database file; created if missing
    pub path: String,
    pub table: String,
    #[serde(default)]
    pub mode: LoadMode,
    /// Rows per transaction in bulk mode
    #[serde(default = "default_commit_rows")]
    pub commit_rows: usize,
    /// Issue `CREATE TABLE IF NOT EXISTS` from the schema before loading
    #[serde(default = "default_true")]
    pub create_table: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SinkSpec {
    #[serde(rename = "sqlite")]
    Sqlite(SqliteSinkSpec),
    #[serde(rename = "parquet_dir")]
    ParquetDir { id: String, path: String },
    #[serde(rename = "stdout")]
    Stdout { id: String },
}

impl SinkSpec {
    pub fn id(&self) -> &str {
        match self {
            SinkSpec::Sqlite(s) => &s.id,
            SinkSpec::ParquetDir { id, .. } => id,
            SinkSpec::Stdout { id } => id,
        }
    }
}

fn default_error_table() -> String {
    "load_errors".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ErrorLogSpec {
    /// Emit entries through `tracing` only
    #[default]
    #[serde(rename = "log")]
    Log,
    /// Side table in a SQLite database
    #[serde(rename = "sqlite")]
    Sqlite {
        path: String,
        #[serde(default = "default_error_table")]
        table: String,
    },
    /// One JSON object per line
    #[serde(rename = "jsonl")]
    Jsonl { path: String },
}

/// Post-load checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationSpec {
    /// Compare source and destination row counts
    #[serde(default = "default_true")]
    pub row_count: bool,
    #[serde(default)]
    pub checks: Vec<RangeCheck>,
}

impl Default for ValidationSpec {
    fn default() -> Self {
        Self {
            row_count: true,
            checks: Vec::new(),
        }
    }
}

/// Predicate check run against the loaded table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeCheck {
    pub column: String,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORDERS: &str = r#"
name: orders
source:
  type: file_delimited
  id: orders-csv
  path: data/orders.csv
  field_terminator: "|"
  skip_rows: 1
schema:
  fields:
    - { name: order_id, data_type: int64 }
    - { name: customer_id, data_type: int64 }
    - { name: order_date, data_type: date }
    - { name: amount, data_type: float64, min: 0 }
    - { name: status, data_type: string, nullable: true }
sink:
  type: sqlite
  id: orders-db
  path: shop.db
  table: orders
  mode: row
error_log:
  type: sqlite
  path: shop.db
validation:
  checks:
    - { column: amount, min: 0 }
"#;

    #[test]
    fn parses_full_pipeline() {
        let spec = PipelineSpec::from_yaml(ORDERS).unwrap();
        spec.validate().unwrap();

        assert_eq!(spec.name, "orders");
        let SourceSpec::Delimited(source) = &spec.source else {
            panic!("expected delimited source");
        };
        assert_eq!(source.field_terminator, "|");
        assert_eq!(source.row_terminator, "\n");
        assert_eq!(source.skip_rows, 1);
        assert_eq!(source.batch_rows, 1024);

        assert_eq!(spec.schema.len(), 5);
        assert_eq!(spec.schema.fields[2].data_type, DataType::Date);
        assert_eq!(spec.schema.fields[3].min, Some(0.0));
        assert!(spec.schema.fields[4].nullable);

        let SinkSpec::Sqlite(sink) = &spec.sink else {
            panic!("expected sqlite sink");
        };
        assert_eq!(sink.mode, LoadMode::Row);
        assert_eq!(sink.commit_rows, 10_000);
        assert!(sink.create_table);

        match &spec.error_log {
            ErrorLogSpec::Sqlite { table, .. } => assert_eq!(table, "load_errors"),
            other => panic!("unexpected error log {other:?}"),
        }
        assert!(spec.validation.row_count);
        assert_eq!(spec.validation.checks.len(), 1);
    }

    #[test]
    fn error_log_and_validation_have_defaults() {
        let yaml = r#"
name: api
source: { type: http, id: api, url: "http://localhost/orders" }
schema:
  fields:
    - { name: id, data_type: int64 }
sink: { type: stdout, id: out }
"#;
        let spec = PipelineSpec::from_yaml(yaml).unwrap();
        spec.validate().unwrap();
        assert!(matches!(spec.error_log, ErrorLogSpec::Log));
        assert!(spec.validation.row_count);
        let SourceSpec::Http(http) = &spec.source else {
            panic!("expected http source");
        };
        assert_eq!(http.timeout_secs, 30);
        assert_eq!(http.max_polls, None);
    }

    #[test]
    fn rejects_duplicate_fields() {
        let schema = TableSchema::new(vec![
            FieldConfig::new("id", DataType::Int64),
            FieldConfig::new("id", DataType::String),
        ]);
        let err = schema.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate schema field `id`"));
    }

    #[test]
    fn rejects_range_check_on_text_column() {
        let mut spec = PipelineSpec::from_yaml(ORDERS).unwrap();
        spec.validation.checks = vec![RangeCheck {
            column: "status".into(),
            min: Some(0.0),
            max: None,
        }];
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("needs a numeric column"));

        spec.validation.checks[0].column = "missing".into();
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("unknown column `missing`"));
    }

    #[test]
    fn rejects_multi_byte_terminators() {
        let yaml = ORDERS.replace(r#"field_terminator: "|""#, r#"field_terminator: "||""#);
        let spec = PipelineSpec::from_yaml(&yaml).unwrap();
        assert!(matches!(spec.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn expands_environment_references() {
        std::env::set_var("INGEST_SPEC_TEST_TOKEN", "s3cret");
        let text = expand_env("token: ${INGEST_SPEC_TEST_TOKEN}, keep $HOME").unwrap();
        assert_eq!(text, "token: s3cret, keep $HOME");

        let err = expand_env("${INGEST_SPEC_TEST_UNSET_VARIABLE}").unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnv(name) if name == "INGEST_SPEC_TEST_UNSET_VARIABLE"));
    }

    fn api_spec(token_line: &str) -> String {
        format!(
            r#"
name: api
# rotate ${{INGEST_SPEC_TEST_NEVER_SET}} before release
source: {{ type: http, id: api, url: "http://localhost/orders", {token_line} }}
schema:
  fields:
    - {{ name: id, data_type: int64 }}
sink: {{ type: stdout, id: out }}
"#
        )
    }

    fn bearer(spec: &PipelineSpec) -> Option<&str> {
        match &spec.source {
            SourceSpec::Http(http) => http.bearer_token.as_deref(),
            other => panic!("expected http source, got {other:?}"),
        }
    }

    #[test]
    fn secrets_keep_yaml_comment_markers() {
        std::env::set_var("INGEST_SPEC_TEST_HASH_TOKEN", "abc #def");
        let spec =
            PipelineSpec::from_yaml(&api_spec("bearer_token: \"${INGEST_SPEC_TEST_HASH_TOKEN}\""))
                .unwrap();
        assert_eq!(bearer(&spec), Some("abc #def"));
    }

    #[test]
    fn secrets_keep_yaml_mapping_syntax() {
        std::env::set_var("INGEST_SPEC_TEST_COLON_TOKEN", "user: pass, {x}");
        let spec =
            PipelineSpec::from_yaml(&api_spec("bearer_token: \"${INGEST_SPEC_TEST_COLON_TOKEN}\""))
                .unwrap();
        assert_eq!(bearer(&spec), Some("user: pass, {x}"));
    }

    #[test]
    fn references_in_comments_are_not_looked_up() {
        let spec = PipelineSpec::from_yaml(&api_spec("timeout_secs: 5")).unwrap();
        assert_eq!(bearer(&spec), None);
    }

    #[test]
    fn references_expand_inside_nested_values() {
        std::env::set_var("INGEST_SPEC_TEST_HEADER", "tenant-7");
        let spec = PipelineSpec::from_yaml(&api_spec(
            "headers: { X-Tenant: \"id=${INGEST_SPEC_TEST_HEADER}\" }",
        ))
        .unwrap();
        let SourceSpec::Http(http) = &spec.source else {
            panic!("expected http source");
        };
        assert_eq!(http.headers["X-Tenant"], "id=tenant-7");
    }
}
