//! Wires source -> mapper -> sink over bounded channels, then validates the load.

use anyhow::{Context, Result};
use ingest_core::{MapStats, PipelineSpec, Stage, Transform};
use ingest_io::{build_sink, build_source, open_error_log, open_probe};
use ingest_tx::{LoadCounts, RecordMapper, ValidationReport, Validator};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Everything a finished load reports
#[derive(Debug, Clone, Serialize)]
pub struct LoadOutcome {
    pub pipeline: String,
    pub source_rows: u64,
    pub map: MapStats,
    pub written_rows: u64,
    pub validation: ValidationReport,
}

pub async fn run_pipeline(
    spec: &PipelineSpec,
    channel_capacity: usize,
    cancel: CancellationToken,
) -> Result<LoadOutcome> {
    spec.validate()?;
    let errors = open_error_log(&spec.error_log)?;

    let table_rows_before = match open_probe(&spec.sink)? {
        Some(probe) => Some(probe.count_rows()?),
        None => None,
    };

    let mut source = build_source(&spec.source, errors.clone())?;
    let mut mapper = RecordMapper::new("mapper", spec.schema.clone(), errors.clone());
    let mut sink = build_sink(&spec.sink, &spec.schema, errors.clone())?;

    info!(
        pipeline = %spec.name,
        source = %spec.source.id(),
        sink = %spec.sink.id(),
        "starting load"
    );

    let capacity = channel_capacity.max(1);
    let (tx1, rx1) = mpsc::channel(capacity);
    let (tx2, rx2) = mpsc::channel(capacity);

    // Spawn tasks
    let c1 = cancel.child_token();
    let src_handle = tokio::spawn(async move { source.run(tx1, c1).await });
    let c2 = cancel.child_token();
    let map_handle = tokio::spawn(async move { mapper.run(rx1, tx2, c2).await });
    let c3 = cancel.child_token();
    let sink_handle = tokio::spawn(async move { sink.run(rx2, c3).await });

    // Join; a failed stage closes its channels and lets the others drain
    let source_result = src_handle.await.context("source task panicked")?;
    let map_result = map_handle.await.context("mapper task panicked")?;
    let sink_result = sink_handle.await.context("sink task panicked")?;

    let source_rows = match source_result {
        Ok(n) => n,
        Err(e) => {
            error!(pipeline = %spec.name, error = %e, "source failed");
            errors.record(Stage::Source, format!("{}: {:#}", spec.source.id(), e))?;
            return Err(e.context(format!("source {} failed", spec.source.id())));
        }
    };
    let map = map_result.context("record mapping failed")?;
    let written_rows = sink_result.with_context(|| format!("sink {} failed", spec.sink.id()))?;

    let probe = open_probe(&spec.sink)?;
    let validation = Validator::new(spec.validation.clone(), errors.clone()).validate(
        LoadCounts {
            source_rows,
            rejected_rows: map.rejected,
            written_rows,
            table_rows_before,
        },
        probe.as_deref(),
    )?;

    info!(
        pipeline = %spec.name,
        read = source_rows,
        written = written_rows,
        rejected = map.rejected,
        "load finished"
    );

    Ok(LoadOutcome {
        pipeline: spec.name.clone(),
        source_rows,
        map,
        written_rows,
        validation,
    })
}
