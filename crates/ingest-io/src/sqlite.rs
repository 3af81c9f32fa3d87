//! SQLite plumbing shared by the table writer, the table probe and the error side table.

use anyhow::{Context, Result};
use ingest_core::{DataType, RangeCheck, TableProbe, TableSchema, Value, Violation};
use rusqlite::types::{ToSqlOutput, Value as SqlOwned, ValueRef};
use rusqlite::{Connection, OptionalExtension, ToSql};
use std::path::Path;
use std::time::Duration;

/// How long a writer waits for another connection's lock before failing
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) fn open(path: impl AsRef<Path>) -> Result<Connection> {
    let path = path.as_ref();
    let conn =
        Connection::open(path).with_context(|| format!("open sqlite database {}", path.display()))?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

/// Double-quote an identifier, escaping embedded quotes
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn sql_type(data_type: DataType) -> &'static str {
    match data_type {
        DataType::Int64 | DataType::Boolean => "INTEGER",
        DataType::Float64 => "REAL",
        DataType::String | DataType::Date | DataType::Timestamp => "TEXT",
    }
}

pub(crate) fn create_table_sql(table: &str, schema: &TableSchema) -> String {
    let columns: Vec<String> = schema
        .fields
        .iter()
        .map(|f| {
            let null = if f.nullable { "" } else { " NOT NULL" };
            format!("{} {}{}", quote_ident(&f.name), sql_type(f.data_type), null)
        })
        .collect();
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_ident(table),
        columns.join(", ")
    )
}

pub(crate) fn insert_sql(table: &str, schema: &TableSchema) -> String {
    let columns: Vec<String> = schema.fields.iter().map(|f| quote_ident(&f.name)).collect();
    let params: Vec<String> = (1..=schema.fields.len()).map(|i| format!("?{i}")).collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(table),
        columns.join(", "),
        params.join(", ")
    )
}

pub(crate) fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Binds a [`Value`] as a statement parameter
pub(crate) struct SqlValue<'a>(pub &'a Value);

impl ToSql for SqlValue<'_> {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self.0 {
            Value::Null => ToSqlOutput::Owned(SqlOwned::Null),
            Value::Int(v) => ToSqlOutput::Owned(SqlOwned::Integer(*v)),
            Value::Float(v) => ToSqlOutput::Owned(SqlOwned::Real(*v)),
            Value::Bool(v) => ToSqlOutput::Owned(SqlOwned::Integer(i64::from(*v))),
            Value::Text(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
            Value::Date(_) | Value::Timestamp(_) => {
                ToSqlOutput::Owned(SqlOwned::Text(self.0.to_string()))
            }
        })
    }
}

/// Read-side handle on a loaded table
pub struct SqliteTable {
    conn: Connection,
    table: String,
}

impl SqliteTable {
    pub fn open(path: impl AsRef<Path>, table: impl Into<String>) -> Result<Self> {
        Ok(Self {
            conn: open(path)?,
            table: table.into(),
        })
    }
}

impl TableProbe for SqliteTable {
    fn table(&self) -> &str {
        &self.table
    }

    fn count_rows(&self) -> Result<u64> {
        if !table_exists(&self.conn, &self.table)? {
            return Ok(0);
        }
        let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(&self.table));
        let count: i64 = self
            .conn
            .query_row(&sql, [], |row| row.get(0))
            .with_context(|| format!("count rows in {}", self.table))?;
        Ok(count.max(0) as u64)
    }

    fn find_out_of_range(&self, check: &RangeCheck) -> Result<Vec<Violation>> {
        if !table_exists(&self.conn, &self.table)? {
            return Ok(Vec::new());
        }
        let column = quote_ident(&check.column);
        let mut predicates = Vec::new();
        let mut bounds = Vec::new();
        if let Some(min) = check.min {
            bounds.push(min);
            predicates.push(format!("{} < ?{}", column, bounds.len()));
        }
        if let Some(max) = check.max {
            bounds.push(max);
            predicates.push(format!("{} > ?{}", column, bounds.len()));
        }
        if predicates.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT rowid, {} FROM {} WHERE {} ORDER BY rowid",
            column,
            quote_ident(&self.table),
            predicates.join(" OR ")
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .with_context(|| format!("prepare range check on {}.{}", self.table, check.column))?;
        let rows = stmt.query_map(rusqlite::params_from_iter(bounds.iter()), |row| {
            Ok(Violation {
                row_id: row.get(0)?,
                column: check.column.clone(),
                value: row.get(1)?,
            })
        })?;
        let mut violations = Vec::new();
        for row in rows {
            violations.push(row?);
        }
        Ok(violations)
    }
}
