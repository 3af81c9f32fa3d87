use anyhow::{Context, Result};
use async_trait::async_trait;
use ingest_core::{JsonFileSourceSpec, JsonFormat, Operator, RawRecord, RecordTx, Source};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::emit::RecordEmitter;
use crate::expand_paths;

/// Reads records from JSON array files or JSON-lines files
pub struct JsonFileSource {
    pub id: String,
    pub spec: JsonFileSourceSpec,
}

impl JsonFileSource {
    pub fn new(spec: JsonFileSourceSpec) -> Self {
        Self {
            id: spec.id.clone(),
            spec,
        }
    }
}

/// Split one file into `(origin, record)` pairs.
fn parse_file(file_name: &str, text: &str, format: JsonFormat) -> Result<Vec<(String, RawRecord)>> {
    let items: Vec<(String, Value)> = match format {
        JsonFormat::Array => {
            let values: Vec<Value> = serde_json::from_str(text)
                .with_context(|| format!("{} is not a JSON array", file_name))?;
            values
                .into_iter()
                .enumerate()
                .map(|(i, v)| (format!("{}[{}]", file_name, i), v))
                .collect()
        }
        JsonFormat::Lines => {
            let mut values = Vec::new();
            for (i, line) in text.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let origin = format!("{}:{}", file_name, i + 1);
                let value = serde_json::from_str(line)
                    .with_context(|| format!("parse {}", origin))?;
                values.push((origin, value));
            }
            values
        }
    };

    items
        .into_iter()
        .map(|(origin, value)| match RawRecord::from_json(value) {
            Some(raw) => Ok((origin, raw)),
            None => anyhow::bail!("{}: expected a JSON object or array", origin),
        })
        .collect()
}

impl Operator for JsonFileSource {
    fn name(&self) -> &str {
        &self.id
    }
}

#[async_trait]
impl Source for JsonFileSource {
    async fn run(&mut self, tx: RecordTx, cancel: CancellationToken) -> Result<u64> {
        let paths = expand_paths(&self.spec.path)?;
        let mut emitter = RecordEmitter::new(tx, self.spec.batch_rows);

        'files: for path in &paths {
            let file_name = path.display().to_string();
            info!(source = %self.id, file = %file_name, "reading json file");
            let text = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("open {}", file_name))?;

            for (origin, raw) in parse_file(&file_name, &text, self.spec.format)? {
                if cancel.is_cancelled() || !emitter.push(origin, raw).await {
                    break 'files;
                }
            }
        }

        let read = emitter.finish().await;
        info!(source = %self.id, records = read, "json source finished");
        Ok(read)
    }
}
