//! InfluxDB 1.x sink: HTTP line protocol with basic credentials

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Url;
use tracing::debug;

use super::line_protocol;
use super::pipeline::{BatchWriter, Pipeline};
use super::{FieldValue, MetricPoint, MetricSink};
use crate::error::SinkError;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Asynchronous client for an InfluxDB 1.x server
#[derive(Debug)]
pub struct InfluxV1Sink {
    pipeline: Pipeline,
}

impl InfluxV1Sink {
    /// Connect to the backend and spawn the delivery worker.
    ///
    /// Verifies reachability via the server's `/ping` endpoint; a backend
    /// that cannot be reached at startup is a fatal construction error.
    pub async fn connect(
        addr: &str,
        database: &str,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<Self, SinkError> {
        let base = Url::parse(addr)
            .map_err(|e| SinkError::Construction(format!("invalid address {addr}: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| SinkError::Construction(e.to_string()))?;

        let ping_url = join(&base, "ping")?;
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

        let mut write_url = join(&base, "write")?;
        write_url.query_pairs_mut().append_pair("db", database);
        if let Some(username) = username {
            write_url.query_pairs_mut().append_pair("u", username);
        }
        if let Some(password) = password {
            write_url.query_pairs_mut().append_pair("p", password);
        }

        debug!(%addr, database, "connected to InfluxDB 1.x backend");

        let writer = Arc::new(V1Writer { client, write_url });
        Ok(Self {
            pipeline: Pipeline::start(writer),
        })
    }
}

#[async_trait]
impl MetricSink for InfluxV1Sink {
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
        self.flush().await
    }
}

struct V1Writer {
    client: reqwest::Client,
    write_url: Url,
}

#[async_trait]
impl BatchWriter for V1Writer {
    async fn write(&self, batch: Vec<MetricPoint>) -> Result<(), SinkError> {
        let body = line_protocol::encode_batch(&batch);
        let response = self
            .client
            .post(self.write_url.clone())
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
}

fn join(base: &Url, path: &str) -> Result<Url, SinkError> {
    base.join(path)
        .map_err(|e| SinkError::Construction(format!("invalid address: {e}")))
}
