//! Metric sinks relaying data points to a time-series backend
//!
//! Both backend bindings present the same contract to the rest of the
//! system: an asynchronous [`MetricSink::metric`] enqueue, a blocking
//! [`MetricSink::flush`] and a terminal [`MetricSink::exit`]. Delivery is
//! best-effort and at-most-once: a batch that fails to write is logged and
//! dropped, never retried.

pub mod influx_v1;
pub mod influx_v2;
pub mod line_protocol;
pub mod pipeline;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::SinkError;

/// A single scalar measurement value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    Integer(i64),
    Float(f64),
}

/// One named, timestamped, tagged measurement destined for the backend
///
/// Immutable once constructed; ownership passes to the sink's delivery
/// queue until written.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricPoint {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
}

/// Contract shared by every metric backend binding
#[async_trait]
pub trait MetricSink: Send + Sync {
    /// Enqueue one data point for asynchronous delivery.
    ///
    /// Blocks only while the delivery queue is at capacity (backpressure);
    /// once this returns the point is never silently lost before a write is
    /// attempted.
    async fn metric(
        &self,
        name: &str,
        timestamp: DateTime<Utc>,
        tags: BTreeMap<String, String>,
        fields: BTreeMap<String, FieldValue>,
    );

    /// Write out everything enqueued so far, including a partial batch, and
    /// wait for the delivery worker to exit.
    ///
    /// Callers must stop producing points before flushing.
    async fn flush(&self) -> Result<(), SinkError>;

    /// Flush, then release the backend connection and any side channels.
    async fn exit(&self) -> Result<(), SinkError>;
}
