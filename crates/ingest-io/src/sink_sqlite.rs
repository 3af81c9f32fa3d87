use anyhow::{Context, Result};
use async_trait::async_trait;
use ingest_core::{
    LoadMode, Message, Operator, Row, RowRx, SharedErrorLog, Sink, SqliteSinkSpec, Stage,
    TableSchema,
};
use rusqlite::{params_from_iter, Connection};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::sqlite::{self, SqlValue};

/// Writes rows into a SQLite table, either in bulk transactions or one
/// autocommitted insert per row.
///
/// There is no upsert or deduplication: loading the same input twice
/// inserts every row twice.
pub struct SqliteSink {
    id: String,
    spec: SqliteSinkSpec,
    schema: TableSchema,
    insert: String,
    errors: SharedErrorLog,
}

impl SqliteSink {
    pub fn new(spec: SqliteSinkSpec, schema: TableSchema, errors: SharedErrorLog) -> Self {
        let insert = sqlite::insert_sql(&spec.table, &schema);
        Self {
            id: spec.id.clone(),
            spec,
            schema,
            insert,
            errors,
        }
    }

    fn prepare_table(&self, conn: &Connection) -> Result<()> {
        if self.spec.create_table {
            let ddl = sqlite::create_table_sql(&self.spec.table, &self.schema);
            debug!(sink = %self.id, "{}", ddl);
            conn.execute(&ddl, [])
                .with_context(|| format!("create table {}", self.spec.table))?;
        } else if !sqlite::table_exists(conn, &self.spec.table)? {
            anyhow::bail!(
                "table {} does not exist and create_table is off",
                self.spec.table
            );
        }
        Ok(())
    }

    /// Insert `rows` inside one transaction; any failure rolls the whole chunk back.
    fn write_bulk(&self, conn: &mut Connection, rows: &[Row]) -> Result<u64> {
        let tx = conn.transaction()?;
        let failure = {
            let mut stmt = tx.prepare_cached(&self.insert)?;
            rows.iter().find_map(|row| {
                stmt.execute(params_from_iter(row.values.iter().map(SqlValue)))
                    .err()
                    .map(|e| (row.ordinal, e))
            })
        };
        if let Some((ordinal, e)) = failure {
            // release the write lock before logging; the error table may share this file
            tx.rollback()?;
            let message = format!(
                "insert of record {} into {} failed: {}; transaction rolled back ({} rows)",
                ordinal,
                self.spec.table,
                e,
                rows.len()
            );
            self.errors.record(Stage::Load, message.clone())?;
            anyhow::bail!(message);
        }
        tx.commit()
            .with_context(|| format!("commit into {}", self.spec.table))?;
        Ok(rows.len() as u64)
    }

    /// Insert rows one by one; a refused row is logged and skipped.
    fn write_rows(&self, conn: &Connection, rows: &[Row]) -> Result<u64> {
        let mut stmt = conn.prepare_cached(&self.insert)?;
        let mut written = 0;
        for row in rows {
            match stmt.execute(params_from_iter(row.values.iter().map(SqlValue))) {
                Ok(_) => written += 1,
                Err(e) => {
                    warn!(sink = %self.id, record = row.ordinal, error = %e, "insert failed");
                    self.errors.record(
                        Stage::Load,
                        format!(
                            "insert of record {} into {} failed: {}",
                            row.ordinal, self.spec.table, e
                        ),
                    )?;
                }
            }
        }
        Ok(written)
    }
}

impl Operator for SqliteSink {
    fn name(&self) -> &str {
        &self.id
    }
}

#[async_trait]
impl Sink for SqliteSink {
    async fn run(&mut self, mut rx: RowRx, _cancel: CancellationToken) -> Result<u64> {
        let mut conn = sqlite::open(&self.spec.path)?;
        self.prepare_table(&conn)?;
        info!(
            sink = %self.id,
            table = %self.spec.table,
            mode = ?self.spec.mode,
            "loading into sqlite"
        );

        let mut written: u64 = 0;
        let mut pending: Vec<Row> = Vec::new();
        let mut finished = false;

        while let Some(msg) = rx.recv().await {
            match msg {
                Message::Batch(rows) => match self.spec.mode {
                    LoadMode::Row => written += self.write_rows(&conn, &rows)?,
                    LoadMode::Bulk => {
                        pending.extend(rows);
                        while pending.len() >= self.spec.commit_rows {
                            let chunk: Vec<Row> = pending.drain(..self.spec.commit_rows).collect();
                            written += self.write_bulk(&mut conn, &chunk)?;
                            debug!(sink = %self.id, written, "committed chunk");
                        }
                    }
                },
                Message::Eos => {
                    finished = true;
                    break;
                }
            }
        }

        if !pending.is_empty() {
            if finished {
                written += self.write_bulk(&mut conn, &pending)?;
            } else {
                warn!(
                    sink = %self.id,
                    dropped = pending.len(),
                    "upstream ended without end-of-stream, uncommitted rows discarded"
                );
            }
        }

        info!(sink = %self.id, rows = written, "sqlite sink finished");
        Ok(written)
    }
}
