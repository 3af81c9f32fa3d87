use anyhow::{Context, Result};
use async_trait::async_trait;
use ingest_core::{HttpSourceSpec, Operator, RawRecord, RecordTx, Source};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::emit::RecordEmitter;

/// Fetches a JSON array of records from a REST endpoint, once or on an interval
pub struct HttpSource {
    pub id: String,
    pub spec: HttpSourceSpec,
    client: Client,
}

impl HttpSource {
    pub fn try_new(spec: HttpSourceSpec) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(spec.timeout_secs))
            .build()
            .context("build http client")?;
        Ok(Self {
            id: spec.id.clone(),
            spec,
            client,
        })
    }

    /// Number of fetches this source performs; `None` means until cancelled
    fn poll_limit(&self) -> Option<u32> {
        match (self.spec.max_polls, self.spec.poll_interval_secs) {
            (Some(n), _) => Some(n),
            (None, Some(_)) => None,
            (None, None) => Some(1),
        }
    }

    async fn fetch(&self) -> Result<Vec<Value>> {
        info!("Fetching records from {}", self.spec.url);

        let mut request = self.client.get(&self.spec.url);
        for (name, value) in &self.spec.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(token) = &self.spec.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("request {}", self.spec.url))?;
        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "API request to {} failed with status: {}",
                self.spec.url,
                response.status()
            ));
        }

        let body: Value = response
            .json()
            .await
            .with_context(|| format!("decode JSON from {}", self.spec.url))?;
        extract_records(body, self.spec.records_pointer.as_deref())
    }
}

/// Pull the record array out of a response body.
pub fn extract_records(body: Value, pointer: Option<&str>) -> Result<Vec<Value>> {
    let target = match pointer {
        None | Some("") => body,
        Some(pointer) => body
            .pointer(pointer)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("response has nothing at {}", pointer))?,
    };
    match target {
        Value::Array(items) => Ok(items),
        other => anyhow::bail!(
            "expected a JSON array of records, found {}",
            json_kind(&other)
        ),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

impl Operator for HttpSource {
    fn name(&self) -> &str {
        &self.id
    }
}

#[async_trait]
impl Source for HttpSource {
    async fn run(&mut self, tx: RecordTx, cancel: CancellationToken) -> Result<u64> {
        let limit = self.poll_limit();
        let interval = Duration::from_secs(self.spec.poll_interval_secs.unwrap_or(0));
        // one batch per response keeps a poll's records together
        let mut emitter = RecordEmitter::new(tx, usize::MAX);
        let mut poll: u32 = 0;

        'polls: while limit.map_or(true, |n| poll < n) {
            if poll > 0 {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            if cancel.is_cancelled() {
                break;
            }

            let items = tokio::select! {
                _ = cancel.cancelled() => break,
                items = self.fetch() => items?,
            };
            info!(source = %self.id, poll, records = items.len(), "fetched page");

            for (index, item) in items.into_iter().enumerate() {
                let origin = format!("{}#{}[{}]", self.spec.url, poll, index);
                let Some(raw) = RawRecord::from_json(item) else {
                    anyhow::bail!("{}: expected a JSON object or array", origin);
                };
                if !emitter.push(origin, raw).await {
                    break 'polls;
                }
            }
            if !emitter.flush().await {
                warn!(source = %self.id, "downstream closed, stopping poll loop");
                break;
            }
            poll += 1;
        }

        let read = emitter.finish().await;
        info!(source = %self.id, records = read, polls = poll, "http source finished");
        Ok(read)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec() -> HttpSourceSpec {
        HttpSourceSpec {
            id: "api".into(),
            url: "http://localhost:9/orders".into(),
            headers: Default::default(),
            bearer_token: None,
            records_pointer: None,
            timeout_secs: 1,
            poll_interval_secs: None,
            max_polls: None,
        }
    }

    #[test]
    fn body_array_is_used_directly() {
        let items = extract_records(json!([{"id": 1}, {"id": 2}]), None).unwrap();
        assert_eq!(items.len(), 2);
        let items = extract_records(json!([]), Some("")).unwrap();
        assert!(items.is_empty());
    }

    #[test]
    fn pointer_selects_nested_array() {
        let body = json!({"data": {"items": [{"id": 1}], "next": null}});
        let items = extract_records(body, Some("/data/items")).unwrap();
        assert_eq!(items, vec![json!({"id": 1})]);
    }

    #[test]
    fn non_array_bodies_are_rejected() {
        let err = extract_records(json!({"id": 1}), None).unwrap_err();
        assert!(err.to_string().contains("found an object"));
        let err = extract_records(json!({"data": 1}), Some("/items")).unwrap_err();
        assert!(err.to_string().contains("nothing at /items"));
    }

    #[test]
    fn poll_limit_defaults() {
        let source = HttpSource::try_new(spec()).unwrap();
        assert_eq!(source.poll_limit(), Some(1));

        let mut polling = spec();
        polling.poll_interval_secs = Some(30);
        assert_eq!(HttpSource::try_new(polling.clone()).unwrap().poll_limit(), None);

        polling.max_polls = Some(3);
        assert_eq!(HttpSource::try_new(polling).unwrap().poll_limit(), Some(3));
    }

    /// Answer `responses` connections with `body` and hand back the requests seen
    async fn serve(
        responses: usize,
        body: &'static str,
    ) -> (String, tokio::task::JoinHandle<Vec<String>>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/orders", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let mut requests = Vec::new();
            for _ in 0..responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = socket.read(&mut buf).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    request.extend_from_slice(&buf[..n]);
                }
                requests.push(String::from_utf8_lossy(&request).to_lowercase());
                let reply = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\
                     Content-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                socket.write_all(reply.as_bytes()).await.unwrap();
                socket.shutdown().await.unwrap();
            }
            requests
        });
        (url, server)
    }

    #[tokio::test]
    async fn polls_emit_every_record_in_order() {
        let (url, server) = serve(2, r#"{"data": [{"id": 1}, {"id": 2}]}"#).await;
        let mut spec = spec();
        spec.url = url.clone();
        spec.bearer_token = Some("s3cret".into());
        spec.headers.insert("X-Client".into(), "ingest".into());
        spec.records_pointer = Some("/data".into());
        spec.poll_interval_secs = Some(0);
        spec.max_polls = Some(2);

        let (tx, rx) = tokio::sync::mpsc::channel(8);
        let mut source = HttpSource::try_new(spec).unwrap();
        let read = source.run(tx, CancellationToken::new()).await.unwrap();
        let records = crate::test_support::drain_records(rx).await;

        assert_eq!(read, 4);
        let ordinals: Vec<u64> = records.iter().map(|r| r.ordinal).collect();
        assert_eq!(ordinals, vec![1, 2, 3, 4]);
        let origins: Vec<String> = records.iter().map(|r| r.origin.clone()).collect();
        assert_eq!(
            origins,
            ["#0[0]", "#0[1]", "#1[0]", "#1[1]"]
                .iter()
                .map(|suffix| format!("{url}{suffix}"))
                .collect::<Vec<_>>()
        );

        let requests = server.await.unwrap();
        assert_eq!(requests.len(), 2);
        for request in &requests {
            assert!(request.starts_with("get /orders "));
            assert!(request.contains("authorization: bearer s3cret"));
            assert!(request.contains("x-client: ingest"));
        }
    }

    #[tokio::test]
    async fn cancel_interrupts_a_pending_request() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut spec = spec();
        spec.url = format!("http://{}/orders", listener.local_addr().unwrap());
        spec.timeout_secs = 30;
        // accept and never answer
        let _server = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let (tx, rx) = tokio::sync::mpsc::channel(1);
        let mut source = HttpSource::try_new(spec).unwrap();
        let read = tokio::time::timeout(Duration::from_secs(5), source.run(tx, cancel))
            .await
            .expect("run should stop once cancelled")
            .unwrap();

        assert_eq!(read, 0);
        assert!(crate::test_support::drain_records(rx).await.is_empty());
    }

    #[tokio::test]
    async fn unreachable_endpoint_aborts() {
        let mut source = HttpSource::try_new(spec()).unwrap();
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        let err = source.run(tx, CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("request http://localhost:9/orders"));
    }
}
