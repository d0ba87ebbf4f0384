//! InfluxDB 2.x sink: token-authenticated writes with an asynchronous
//! error-reporting side channel
//!
//! Write failures are pushed into an unbounded error channel instead of
//! being logged inline, so reporting never blocks the batching path. A
//! dedicated listener task drains and logs them until the channel closes or
//! the sink's own stop signal fires, whichever comes first.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Url;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::line_protocol;
use super::pipeline::{BatchWriter, Pipeline};
use super::{FieldValue, MetricPoint, MetricSink};
use crate::error::SinkError;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Asynchronous client for an InfluxDB 2.x server
#[derive(Debug)]
pub struct InfluxV2Sink {
    pipeline: Pipeline,
    stop_tx: watch::Sender<bool>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl InfluxV2Sink {
    /// Connect to the backend, spawn the delivery worker and the error
    /// listener.
    pub async fn connect(
        addr: &str,
        org: &str,
        bucket: &str,
        token: &str,
    ) -> Result<Self, SinkError> {
        let base = Url::parse(addr)
            .map_err(|e| SinkError::Construction(format!("invalid address {addr}: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| SinkError::Construction(e.to_string()))?;

        let ping_url = base
            .join("ping")
            .map_err(|e| SinkError::Construction(format!("invalid address: {e}")))?;
        let response = client
            .get(ping_url)
            .send()
            .await
            .map_err(|e| SinkError::Construction(format!("backend unreachable: {e}")))?;
        if !response.status().is_success() {
            return Err(SinkError::Construction(format!(
                "backend ping returned {}",
                response.status()
            )));
        }

        let mut write_url = base
            .join("api/v2/write")
            .map_err(|e| SinkError::Construction(format!("invalid address: {e}")))?;
        write_url
            .query_pairs_mut()
            .append_pair("org", org)
            .append_pair("bucket", bucket);

        debug!(%addr, org, bucket, "connected to InfluxDB 2.x backend");

        let (error_tx, error_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let listener = tokio::spawn(log_errors(error_rx, stop_rx));

        let writer = Arc::new(V2Writer {
            client,
            write_url,
            token: token.to_string(),
            error_tx,
        });

        Ok(Self {
            pipeline: Pipeline::start(writer),
            stop_tx,
            listener: Mutex::new(Some(listener)),
        })
    }
}

#[async_trait]
impl MetricSink for InfluxV2Sink {
    async fn metric(
        &self,
        name: &str,
        timestamp: DateTime<Utc>,
        tags: BTreeMap<String, String>,
        fields: BTreeMap<String, FieldValue>,
    ) {
        self.pipeline
            .enqueue(MetricPoint {
                name: name.to_string(),
                timestamp,
                tags,
                fields,
            })
            .await;
    }

    async fn flush(&self) -> Result<(), SinkError> {
        self.pipeline.flush().await;
        Ok(())
    }

    async fn exit(&self) -> Result<(), SinkError> {
        // Flush joins the delivery worker, which releases the backend
        // client; only then is the error listener told to stop.
        self.flush().await?;

        let _ = self.stop_tx.send(true);
        if let Some(listener) = self.listener.lock().await.take() {
            if let Err(e) = listener.await {
                error!("error listener failed: {e}");
            }
        }
        Ok(())
    }
}

struct V2Writer {
    client: reqwest::Client,
    write_url: Url,
    token: String,
    error_tx: mpsc::UnboundedSender<SinkError>,
}

#[async_trait]
impl BatchWriter for V2Writer {
    async fn write(&self, batch: Vec<MetricPoint>) -> Result<(), SinkError> {
        let body = line_protocol::encode_batch(&batch);
        let response = self
            .client
            .post(self.write_url.clone())
            .header("Authorization", format!("Token {}", self.token))
            .body(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SinkError::Write(format!(
                "backend returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    fn report(&self, err: SinkError) {
        // Unbounded send never blocks the consumer worker.
        if let Err(returned) = self.error_tx.send(err) {
            error!("{}", returned.0);
        }
    }
}

/// Drains backend-reported errors and logs them until the channel closes or
/// the stop signal fires.
async fn log_errors(
    mut error_rx: mpsc::UnboundedReceiver<SinkError>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            err = error_rx.recv() => match err {
                Some(err) => warn!("failed to send data points to backend: {err}"),
                None => {
                    info!("error channel closed, listener exited");
                    return;
                }
            },

            _ = stop_rx.changed() => {
                info!("error listener stopped");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    use super::*;

    async fn mock_backend() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ping"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        server
    }

    fn point(seq: i64) -> (BTreeMap<String, String>, BTreeMap<String, FieldValue>) {
        (
            BTreeMap::from([("host".to_string(), "192.0.2.1".to_string())]),
            BTreeMap::from([("seq".to_string(), FieldValue::Integer(seq))]),
        )
    }

    #[tokio::test]
    async fn writes_carry_token_org_and_bucket() {
        let server = mock_backend().await;

        Mock::given(method("POST"))
            .and(path("/api/v2/write"))
            .and(query_param("org", "net"))
            .and(query_param("bucket", "latency"))
            .and(header("Authorization", "Token secret-token"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let sink = InfluxV2Sink::connect(&server.uri(), "net", "latency", "secret-token")
            .await
            .unwrap();

        let (tags, fields) = point(0);
        sink.metric("ICMP", Utc::now(), tags, fields).await;
        sink.exit().await.unwrap();
    }

    #[tokio::test]
    async fn connect_fails_when_backend_is_unreachable() {
        let err = InfluxV2Sink::connect("http://127.0.0.1:9", "net", "latency", "token")
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::Construction(_)));
    }

    #[tokio::test]
    async fn rejected_writes_do_not_stall_the_pipeline() {
        let server = mock_backend().await;

        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        Mock::given(method("POST"))
            .and(path("/api/v2/write"))
            .respond_with(move |_request: &Request| {
                // First batch is rejected, the rest are accepted.
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    ResponseTemplate::new(401)
                } else {
                    ResponseTemplate::new(204)
                }
            })
            .mount(&server)
            .await;

        let sink = InfluxV2Sink::connect(&server.uri(), "net", "latency", "bad-token")
            .await
            .unwrap();

        for seq in 0..20 {
            let (tags, fields) = point(seq);
            sink.metric("ICMP", Utc::now(), tags, fields).await;
        }

        // Exit must complete promptly even though a write failed: the
        // listener drains the reported error and stops.
        tokio::time::timeout(Duration::from_secs(5), sink.exit())
            .await
            .expect("exit should not hang")
            .unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
