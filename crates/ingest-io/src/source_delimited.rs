use anyhow::{Context, Result};
use async_trait::async_trait;
use ingest_core::{DelimitedSourceSpec, Operator, RawRecord, RecordTx, Source};
use std::fs::File;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::emit::RecordEmitter;
use crate::expand_paths;

/// Reads delimited flat files (CSV, TSV, pipe-separated exports, ...)
pub struct DelimitedSource {
    pub id: String,
    pub spec: DelimitedSourceSpec,
    builder: csv::ReaderBuilder,
    /// Rows end in `\n`, with or without a preceding `\r`
    newline_rows: bool,
}

impl DelimitedSource {
    pub fn try_new(spec: DelimitedSourceSpec) -> Result<Self> {
        let builder = reader_builder(&spec)?;
        Ok(Self {
            id: spec.id.clone(),
            newline_rows: matches!(spec.row_terminator.as_str(), "\n" | "\r\n"),
            spec,
            builder,
        })
    }
}

fn one_byte(name: &str, value: &str) -> Result<u8> {
    match value.as_bytes() {
        [b] => Ok(*b),
        _ => anyhow::bail!("{name} must be a single byte, found {value:?}"),
    }
}

fn reader_builder(spec: &DelimitedSourceSpec) -> Result<csv::ReaderBuilder> {
    // `\r` is trimmed per record so line numbers count `\n` the same way for both
    let terminator = match spec.row_terminator.as_str() {
        "\n" | "\r\n" => csv::Terminator::Any(b'\n'),
        other => csv::Terminator::Any(one_byte("row_terminator", other)?),
    };
    let mut builder = csv::ReaderBuilder::new();
    builder
        .has_headers(false)
        // width is enforced by the mapper so one short row cannot stop the file
        .flexible(true)
        .delimiter(one_byte("field_terminator", &spec.field_terminator)?)
        .quote(one_byte("quote", &spec.quote)?)
        .terminator(terminator);
    Ok(builder)
}

/// Owned fields of one row; `None` for a blank `\r\n` line.
fn record_fields(record: &csv::StringRecord, newline_rows: bool) -> Option<Vec<String>> {
    let mut fields: Vec<String> = record.iter().map(str::to_owned).collect();
    if newline_rows {
        if let Some(last) = fields.last_mut() {
            if last.ends_with('\r') {
                last.pop();
                if fields.len() == 1 && fields[0].is_empty() {
                    return None;
                }
            }
        }
    }
    Some(fields)
}

impl Operator for DelimitedSource {
    fn name(&self) -> &str {
        &self.id
    }
}

#[async_trait]
impl Source for DelimitedSource {
    async fn run(&mut self, tx: RecordTx, cancel: CancellationToken) -> Result<u64> {
        let paths = expand_paths(&self.spec.path)?;
        let mut emitter = RecordEmitter::new(tx, self.spec.batch_rows);

        'files: for path in &paths {
            let file_name = path.display().to_string();
            info!(source = %self.id, file = %file_name, "reading delimited file");

            let file = File::open(path).with_context(|| format!("open {}", file_name))?;
            let mut reader = self.builder.from_reader(file);

            let mut index = 0;
            for result in reader.records() {
                if cancel.is_cancelled() {
                    break 'files;
                }
                let record = result.with_context(|| format!("read {}", file_name))?;
                let Some(fields) = record_fields(&record, self.newline_rows) else {
                    continue;
                };
                index += 1;
                if index <= self.spec.skip_rows {
                    continue;
                }
                let line = record.position().map_or(index as u64, |p| p.line());
                if !emitter
                    .push(format!("{}:{}", file_name, line), RawRecord::Fields(fields))
                    .await
                {
                    break 'files;
                }
            }
        }

        let read = emitter.finish().await;
        info!(source = %self.id, records = read, "delimited source finished");
        Ok(read)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::drain_records;
    use ingest_core::Message;
    use std::io::Write;
    use tokio::sync::mpsc;

    fn spec(path: String) -> DelimitedSourceSpec {
        DelimitedSourceSpec {
            id: "orders".into(),
            path,
            field_terminator: ",".into(),
            row_terminator: "\n".into(),
            quote: "\"".into(),
            skip_rows: 0,
            batch_rows: 1024,
        }
    }

    fn write_file(dir: &tempfile::TempDir, name: &str, body: &str) -> String {
        let path = dir.path().join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        path.display().to_string()
    }

    #[tokio::test]
    async fn skips_header_and_honours_field_terminator() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "orders.psv",
            "order_id|customer_id|amount\r\n1|10|\"a|b\"\r\n2|11|3.5\r\n",
        );
        let mut spec = spec(path.clone());
        spec.field_terminator = "|".into();
        spec.skip_rows = 1;

        let (tx, rx) = mpsc::channel(4);
        let mut source = DelimitedSource::try_new(spec).unwrap();
        let read = source.run(tx, CancellationToken::new()).await.unwrap();
        let records = drain_records(rx).await;

        assert_eq!(read, 2);
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[0].raw,
            RawRecord::Fields(vec!["1".into(), "10".into(), "a|b".into()])
        );
        assert_eq!(records[0].ordinal, 1);
        assert_eq!(records[1].ordinal, 2);
        assert_eq!(records[1].origin, format!("{}:3", path));
    }

    #[tokio::test]
    async fn crlf_and_lf_rows_report_the_same_lines() {
        let dir = tempfile::tempdir().unwrap();
        let mut seen = Vec::new();
        for (name, body, terminator) in [
            ("lf.csv", "id,name\n1,a\n\n2,b\n3,c\n", "\n"),
            ("crlf.csv", "id,name\r\n1,a\r\n\r\n2,b\r\n3,c\r\n", "\r\n"),
        ] {
            let path = write_file(&dir, name, body);
            let mut spec = spec(path.clone());
            spec.row_terminator = terminator.into();
            spec.skip_rows = 1;

            let (tx, rx) = mpsc::channel(4);
            let mut source = DelimitedSource::try_new(spec).unwrap();
            assert_eq!(source.run(tx, CancellationToken::new()).await.unwrap(), 3);
            let records = drain_records(rx).await;

            let lines: Vec<String> = records
                .iter()
                .map(|r| r.origin.trim_start_matches(&path).to_string())
                .collect();
            assert_eq!(lines, vec![":2", ":4", ":5"], "{name}");
            assert_eq!(
                records[2].raw,
                RawRecord::Fields(vec!["3".into(), "c".into()]),
                "{name}"
            );
            seen.push(records);
        }
        assert_eq!(seen[0][0].raw, seen[1][0].raw);
    }

    #[tokio::test]
    async fn custom_row_terminator_and_short_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "rows.txt", "1,a;2;3,c,extra;");
        let mut spec = spec(path);
        spec.row_terminator = ";".into();

        let (tx, rx) = mpsc::channel(4);
        let mut source = DelimitedSource::try_new(spec).unwrap();
        source.run(tx, CancellationToken::new()).await.unwrap();
        let widths: Vec<usize> = drain_records(rx)
            .await
            .iter()
            .map(|r| r.raw.width())
            .collect();

        assert_eq!(widths, vec![2, 1, 3]);
    }

    #[tokio::test]
    async fn batches_by_batch_rows_across_files() {
        let dir = tempfile::tempdir().unwrap();
        write_file(&dir, "a.csv", "1\n2\n3\n");
        write_file(&dir, "b.csv", "4\n5\n");
        let mut spec = spec(format!("{}/*.csv", dir.path().display()));
        spec.batch_rows = 2;

        let (tx, mut rx) = mpsc::channel(8);
        let mut source = DelimitedSource::try_new(spec).unwrap();
        let read = source.run(tx, CancellationToken::new()).await.unwrap();
        assert_eq!(read, 5);

        let mut sizes = Vec::new();
        while let Some(msg) = rx.recv().await {
            match msg {
                Message::Batch(batch) => sizes.push(batch.len()),
                Message::Eos => break,
            }
        }
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let spec = spec(format!("{}/nothing-*.csv", dir.path().display()));
        let (tx, _rx) = mpsc::channel(1);
        let mut source = DelimitedSource::try_new(spec).unwrap();
        let err = source.run(tx, CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("no files matched"));
    }

    #[test]
    fn rejects_multi_byte_delimiter() {
        let mut spec = spec("x.csv".into());
        spec.field_terminator = "::".into();
        assert!(DelimitedSource::try_new(spec).is_err());
    }
}
