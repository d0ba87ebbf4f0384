//! Monitor: binds one target to one metric sink
//!
//! A monitor owns the start/stop of one probe session at a time and
//! translates every round-trip event into a data point. It does not restart
//! itself; that is the supervision loop's job.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sysinfo::System;
use tracing::{debug, instrument, warn};

use crate::error::MonitorError;
use crate::probe::{EchoReply, ProbeOptions, ProbeSession, Prober, ReplyHandler};
use crate::sink::{FieldValue, MetricSink};

/// Measurement name shared by reply and sent points
const MEASUREMENT: &str = "ICMP";

/// Immutable identity of a thing to probe
#[derive(Debug, Clone)]
pub struct Target {
    /// Address handed to the probe primitive
    pub host: String,

    /// Logical "from" label, defaults to the local hostname
    pub from: String,

    /// Logical "to" label, defaults to the host address
    pub to: String,
}

impl Target {
    pub fn new(host: impl Into<String>, from: Option<String>, to: Option<String>) -> Self {
        let host = host.into();
        let from = from
            .filter(|from| !from.is_empty())
            .or_else(local_hostname)
            .unwrap_or_else(|| {
                warn!("could not determine local hostname, using \"localhost\"");
                "localhost".to_string()
            });
        let to = to.filter(|to| !to.is_empty()).unwrap_or_else(|| host.clone());

        Self { host, from, to }
    }
}

fn local_hostname() -> Option<String> {
    System::host_name()
}

/// Runtime binding of one [`Target`] to one probe interval and one sink
pub struct Monitor {
    target: Target,
    interval: Duration,
    timeout: Option<Duration>,
    sink: Arc<dyn MetricSink>,
    prober: Arc<dyn Prober>,

    /// Currently active probe session, read by the stop path. At most one
    /// session is active at any time.
    active: tokio::sync::Mutex<Option<Arc<dyn ProbeSession>>>,

    /// Latched by `stop`; a session that starts afterwards ends immediately
    /// instead of running unattended.
    stopped: AtomicBool,
}

impl Monitor {
    pub fn new(
        target: Target,
        interval: Duration,
        timeout: Option<Duration>,
        sink: Arc<dyn MetricSink>,
        prober: Arc<dyn Prober>,
    ) -> Self {
        let interval = if interval.is_zero() {
            Duration::from_secs(1)
        } else {
            interval
        };

        Self {
            target,
            interval,
            timeout,
            sink,
            prober,
            active: tokio::sync::Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    /// Stable identifier for logging and diagnostics
    pub fn name(&self) -> String {
        format!("{}-{}", self.target.from, self.target.to)
    }

    /// Run one probe session against the bound target.
    ///
    /// Blocks until the session ends naturally (deadline) or is stopped
    /// externally. While the session is active, a fixed ticker emits one
    /// `sent: 1` counter point per interval so that loss rates can be
    /// computed downstream from sent vs. received points.
    #[instrument(skip(self), fields(monitor = %self.name()))]
    pub async fn start(&self) -> Result<(), MonitorError> {
        // Reply timestamps are reconstructed as t0 + seq * interval because
        // the probe primitive does not expose per-packet send times. The
        // approximation skews under packet loss or jitter; accepted
        // limitation.
        let session_start = Utc::now();
        let handler = self.reply_handler(session_start);

        let options = ProbeOptions {
            interval: self.interval,
            timeout: self.timeout,
            payload_size: ProbeOptions::default().payload_size,
        };
        let session = self
            .prober
            .session(&self.target.host, options, handler)
            .await?;

        *self.active.lock().await = Some(session.clone());
        if self.stopped.load(Ordering::SeqCst) {
            // stop() raced with session creation; end it before it runs.
            session.stop();
        }

        debug!("starting probe session");

        let run = session.run();
        tokio::pin!(run);
        let mut ticker = tokio::time::interval(self.interval);

        let result = loop {
            tokio::select! {
                result = &mut run => break result,

                _ = ticker.tick() => {
                    self.sink
                        .metric(
                            MEASUREMENT,
                            Utc::now(),
                            self.tags(),
                            BTreeMap::from([("sent".to_string(), FieldValue::Integer(1))]),
                        )
                        .await;
                }
            }
        };

        *self.active.lock().await = None;
        debug!("probe session ended");
        result
    }

    /// Signal the active probe session to terminate promptly.
    ///
    /// No-op when no session is active, idempotent, and safe to call
    /// concurrently with an in-flight `start`.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(session) = self.active.lock().await.take() {
            session.stop();
        }
    }

    fn tags(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("from".to_string(), self.target.from.clone()),
            ("to".to_string(), self.target.to.clone()),
            ("host".to_string(), self.target.host.clone()),
        ])
    }

    fn reply_handler(&self, session_start: DateTime<Utc>) -> ReplyHandler {
        let sink = self.sink.clone();
        let tags = self.tags();
        let interval = self.interval;

        Arc::new(move |reply: EchoReply| {
            let sink = sink.clone();
            let tags = tags.clone();

            Box::pin(async move {
                let offset = interval.checked_mul(reply.seq as u32).unwrap_or_default();
                let timestamp =
                    session_start + chrono::Duration::from_std(offset).unwrap_or_default();

                let fields = BTreeMap::from([
                    (
                        "rtt".to_string(),
                        FieldValue::Integer(reply.rtt.as_nanos() as i64),
                    ),
                    ("ttl".to_string(), FieldValue::Integer(reply.ttl as i64)),
                ]);

                sink.metric(MEASUREMENT, timestamp, tags, fields).await;
            })
        })
    }
}
