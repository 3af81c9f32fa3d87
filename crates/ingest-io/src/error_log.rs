//! Durable error log stores.

use anyhow::{Context, Result};
use ingest_core::{ErrorEntry, ErrorLog, ErrorLogSpec, SharedErrorLog, TracingErrorLog};
use rusqlite::{params, Connection};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::sqlite::{self, quote_ident};

/// Build the error log described by the pipeline spec
pub fn open_error_log(spec: &ErrorLogSpec) -> Result<SharedErrorLog> {
    Ok(match spec {
        ErrorLogSpec::Log => Arc::new(TracingErrorLog),
        ErrorLogSpec::Sqlite { path, table } => Arc::new(SqliteErrorLog::open(path, table)?),
        ErrorLogSpec::Jsonl { path } => Arc::new(JsonlErrorLog::open(path)?),
    })
}

/// Side table with one row per entry: `logged_at`, `stage`, `message`
pub struct SqliteErrorLog {
    conn: Mutex<Connection>,
    insert: String,
}

impl SqliteErrorLog {
    pub fn open(path: impl AsRef<Path>, table: &str) -> Result<Self> {
        let conn = sqlite::open(path)?;
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (logged_at TEXT NOT NULL, stage TEXT NOT NULL, message TEXT NOT NULL)",
                quote_ident(table)
            ),
            [],
        )
        .with_context(|| format!("create error table {}", table))?;
        Ok(Self {
            conn: Mutex::new(conn),
            insert: format!(
                "INSERT INTO {} (logged_at, stage, message) VALUES (?1, ?2, ?3)",
                quote_ident(table)
            ),
        })
    }
}

impl ErrorLog for SqliteErrorLog {
    fn append(&self, entry: ErrorEntry) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow::anyhow!("error log connection lock poisoned"))?;
        conn.execute(
            &self.insert,
            params![entry.at.to_rfc3339(), entry.stage.as_str(), entry.message],
        )
        .context("append to error table")?;
        Ok(())
    }
}

/// Appends one JSON object per entry to a file
pub struct JsonlErrorLog {
    file: Mutex<File>,
}

impl JsonlErrorLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open error log {}", path.display()))?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl ErrorLog for JsonlErrorLog {
    fn append(&self, entry: ErrorEntry) -> Result<()> {
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');
        let mut file = self
            .file
            .lock()
            .map_err(|_| anyhow::anyhow!("error log file lock poisoned"))?;
        file.write_all(&line)?;
        Ok(())
    }
}
