use async_trait::async_trait;
use ingest_core::{Message, Operator, Row, RowRx, Sink};
use std::io::Write;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Prints rows as tab-separated lines; useful for dry runs
pub struct StdoutSink {
    id: String,
}

impl StdoutSink {
    pub fn new(id: String) -> Self {
        Self { id }
    }
}

fn format_row(row: &Row) -> String {
    row.values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("\t")
}

impl Operator for StdoutSink {
    fn name(&self) -> &str {
        &self.id
    }
}

#[async_trait]
impl Sink for StdoutSink {
    async fn run(&mut self, mut rx: RowRx, _cancel: CancellationToken) -> anyhow::Result<u64> {
        let mut written: u64 = 0;
        while let Some(msg) = rx.recv().await {
            match msg {
                Message::Batch(rows) => {
                    let mut out = std::io::stdout().lock();
                    for row in &rows {
                        writeln!(out, "{}", format_row(row))?;
                    }
                    written += rows.len() as u64;
                }
                Message::Eos => break,
            }
        }
        info!(sink = %self.id, rows = written, "stdout sink finished");
        Ok(written)
    }
}
