use ingest_core::{Message, RawRecord, RecordTx, SourceRecord};
use tracing::warn;

/// Buffers records into batches on a source channel and numbers them.
pub(crate) struct RecordEmitter {
    tx: RecordTx,
    batch_rows: usize,
    pending: Vec<SourceRecord>,
    emitted: u64,
}

impl RecordEmitter {
    pub(crate) fn new(tx: RecordTx, batch_rows: usize) -> Self {
        Self {
            tx,
            batch_rows: batch_rows.max(1),
            pending: Vec::new(),
            emitted: 0,
        }
    }

    /// Queue one record; returns `false` once the downstream receiver is gone.
    pub(crate) async fn push(&mut self, origin: String, raw: RawRecord) -> bool {
        let ordinal = self.emitted + self.pending.len() as u64 + 1;
        self.pending.push(SourceRecord::new(ordinal, origin, raw));
        if self.pending.len() >= self.batch_rows {
            self.flush().await
        } else {
            true
        }
    }

    pub(crate) async fn flush(&mut self) -> bool {
        if self.pending.is_empty() {
            return true;
        }
        let batch = std::mem::take(&mut self.pending);
        let len = batch.len() as u64;
        if self.tx.send(Message::Batch(batch)).await.is_err() {
            warn!("downstream channel closed, dropping {} records", len);
            return false;
        }
        self.emitted += len;
        true
    }

    /// Flush the tail, send end-of-stream and return the number of records delivered.
    pub(crate) async fn finish(mut self) -> u64 {
        if self.flush().await {
            let _ = self.tx.send(Message::Eos).await; // best-effort
        }
        self.emitted
    }
}
