use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::BorrowedMessage;
use rdkafka::ClientConfig;
use rdkafka::Message as KafkaMessage;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use ingest_core::{
    KafkaSourceSpec, Operator, RawRecord, RecordTx, SharedErrorLog, Source, Stage,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::emit::RecordEmitter;

/// Consumes JSON payloads from a Kafka topic, one message at a time.
///
/// Offsets are auto-committed by the client; there is no checkpointing.
pub struct KafkaSource {
    pub id: String,
    pub spec: KafkaSourceSpec,
    errors: SharedErrorLog,
}

impl KafkaSource {
    pub fn new(spec: KafkaSourceSpec, errors: SharedErrorLog) -> Self {
        Self {
            id: spec.id.clone(),
            spec,
            errors,
        }
    }

    fn consumer(&self) -> Result<StreamConsumer> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.spec.brokers)
            .set("group.id", &self.spec.group_id)
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("enable.auto.commit", "true")
            .create()
            .with_context(|| format!("connect to kafka at {}", self.spec.brokers))?;
        consumer
            .subscribe(&[&self.spec.topic])
            .with_context(|| format!("subscribe to {}", self.spec.topic))?;
        Ok(consumer)
    }

    /// Forward parsed deliveries downstream until a stop condition.
    ///
    /// Unparsable payloads go to the error log and still count as read, so
    /// the post-load row count exposes them.
    async fn consume<S>(
        &self,
        deliveries: S,
        tx: RecordTx,
        cancel: CancellationToken,
    ) -> Result<u64>
    where
        S: Stream<Item = Delivery> + Send,
    {
        futures::pin_mut!(deliveries);
        let idle = self.spec.idle_timeout_ms.map(Duration::from_millis);
        let mut emitter = RecordEmitter::new(tx, 1);
        let mut received: u64 = 0;
        let mut skipped: u64 = 0;

        loop {
            if self.spec.max_messages.is_some_and(|max| received >= max) {
                info!(source = %self.id, received, "message limit reached");
                break;
            }

            let polled = async {
                match idle {
                    Some(limit) => tokio::time::timeout(limit, deliveries.next()).await.ok(),
                    None => Some(deliveries.next().await),
                }
            };
            let (origin, parsed) = match tokio::select! {
                _ = cancel.cancelled() => break,
                next = polled => next,
            } {
                None => {
                    info!(source = %self.id, "idle timeout, no more messages");
                    break;
                }
                Some(None) => break,
                Some(Some(delivery)) => delivery,
            };
            received += 1;

            match parsed {
                Ok(raw) => {
                    if !emitter.push(origin, raw).await {
                        break;
                    }
                }
                Err(reason) => {
                    skipped += 1;
                    self.errors
                        .record(Stage::Source, format!("{}: {}", origin, reason))?;
                }
            }
        }

        let delivered = emitter.finish().await;
        info!(source = %self.id, records = delivered, skipped, "kafka source finished");
        Ok(delivered + skipped)
    }
}

/// A consumed message reduced to owned data: its origin and parsed payload
type Delivery = (String, std::result::Result<RawRecord, String>);

fn origin(m: &BorrowedMessage<'_>) -> String {
    format!("{}/{}@{}", m.topic(), m.partition(), m.offset())
}

/// Parse a payload into a record; the error string is meant for the error log.
fn parse_payload(payload: Option<&[u8]>) -> std::result::Result<RawRecord, String> {
    let Some(bytes) = payload else {
        return Err("empty payload".to_string());
    };
    let value: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|e| format!("invalid JSON payload: {e}"))?;
    RawRecord::from_json(value).ok_or_else(|| "payload is not a JSON object or array".to_string())
}

impl Operator for KafkaSource {
    fn name(&self) -> &str {
        &self.id
    }
}

#[async_trait]
impl Source for KafkaSource {
    async fn run(&mut self, tx: RecordTx, cancel: CancellationToken) -> Result<u64> {
        let consumer = self.consumer()?;
        info!(source = %self.id, topic = %self.spec.topic, "consuming");

        // borrowed messages are not Send, so only owned data leaves the stream
        let id = self.id.clone();
        let deliveries = consumer.stream().filter_map(move |message| {
            futures::future::ready(match message {
                Ok(m) => Some((origin(&m), parse_payload(m.payload()))),
                Err(e) => {
                    warn!(source = %id, error = %e, "kafka error on consuming message from broker");
                    None
                }
            })
        });
        self.consume(deliveries, tx, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::drain_records;
    use ingest_core::MemoryErrorLog;
    use std::sync::Arc;

    fn source(errors: Arc<MemoryErrorLog>) -> KafkaSource {
        let spec = KafkaSourceSpec {
            id: "orders".into(),
            brokers: "localhost:9092".into(),
            group_id: "ingest".into(),
            topic: "orders".into(),
            max_messages: None,
            idle_timeout_ms: None,
        };
        KafkaSource::new(spec, errors)
    }

    fn deliveries(payloads: &[&'static [u8]]) -> Vec<Delivery> {
        payloads
            .iter()
            .enumerate()
            .map(|(offset, payload)| {
                (format!("orders/0@{offset}"), parse_payload(Some(*payload)))
            })
            .collect()
    }

    #[test]
    fn payload_must_be_json_record() {
        assert!(matches!(
            parse_payload(Some(br#"{"id": 5, "amount": 1.5}"#)),
            Ok(RawRecord::Object(_))
        ));
        assert_eq!(parse_payload(None).unwrap_err(), "empty payload");
        assert!(parse_payload(Some(b"not json"))
            .unwrap_err()
            .starts_with("invalid JSON payload"));
        assert_eq!(
            parse_payload(Some(b"17")).unwrap_err(),
            "payload is not a JSON object or array"
        );
    }

    #[tokio::test]
    async fn unparsable_payloads_are_logged_and_counted() {
        let errors = Arc::new(MemoryErrorLog::new());
        let source = source(errors.clone());
        let stream = futures::stream::iter(deliveries(&[
            br#"{"id": 1}"#,
            b"not json",
            br#"{"id": 3}"#,
        ]));

        let (tx, rx) = tokio::sync::mpsc::channel(8);
        let read = source
            .consume(stream, tx, CancellationToken::new())
            .await
            .unwrap();
        let records = drain_records(rx).await;

        assert_eq!(read, 3);
        let origins: Vec<&str> = records.iter().map(|r| r.origin.as_str()).collect();
        assert_eq!(origins, vec!["orders/0@0", "orders/0@2"]);
        let entries = errors.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].stage, Stage::Source);
        assert!(entries[0].message.starts_with("orders/0@1: invalid JSON payload"));
    }

    #[tokio::test]
    async fn stops_at_max_messages() {
        let errors = Arc::new(MemoryErrorLog::new());
        let mut source = source(errors.clone());
        source.spec.max_messages = Some(2);
        let stream = futures::stream::iter(deliveries(&[
            br#"{"id": 1}"#,
            b"[]",
            br#"{"id": 3}"#,
        ]))
        .chain(futures::stream::pending());

        let (tx, rx) = tokio::sync::mpsc::channel(8);
        let read = source
            .consume(stream, tx, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(read, 2);
        assert_eq!(drain_records(rx).await.len(), 2);
        assert!(errors.is_empty());
    }

    #[tokio::test]
    async fn idle_timeout_ends_the_stream() {
        let errors = Arc::new(MemoryErrorLog::new());
        let mut source = source(errors);
        source.spec.idle_timeout_ms = Some(50);
        let stream = futures::stream::iter(deliveries(&[br#"{"id": 1}"#]))
            .chain(futures::stream::pending());

        let (tx, rx) = tokio::sync::mpsc::channel(8);
        let read = source
            .consume(stream, tx, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(read, 1);
        assert_eq!(drain_records(rx).await.len(), 1);
    }
}
