//! Probe primitive: ICMP echo sessions against a single host
//!
//! A session sends one echo request per interval tick and hands every reply
//! to an async callback. It runs until its deadline elapses, an unrecoverable
//! socket error occurs, or [`ProbeSession::stop`] is called. The [`Prober`]
//! factory is the seam that lets tests substitute the packet exchange.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use surge_ping::{Client, Config as IcmpConfig, ICMP, IcmpPacket, PingIdentifier, PingSequence};
use tokio::net::lookup_host;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::error::MonitorError;

/// One reply observation from a probe session
#[derive(Debug, Clone, Copy)]
pub struct EchoReply {
    pub seq: u16,
    pub rtt: Duration,
    pub ttl: u8,
    pub bytes: usize,
}

/// Async callback invoked for every received reply.
///
/// The session awaits the returned future, so backpressure from the metric
/// sink propagates all the way into the probe loop.
pub type ReplyHandler = Arc<dyn Fn(EchoReply) -> BoxFuture<'static, ()> + Send + Sync>;

/// Knobs for one probe session
#[derive(Debug, Clone)]
pub struct ProbeOptions {
    /// Pause between echo requests
    pub interval: Duration,

    /// Whole-session deadline; `None` runs until stopped. Bounding sessions
    /// keeps the primitive's in-flight packet bookkeeping from growing
    /// without limit.
    pub timeout: Option<Duration>,

    /// Echo payload size in bytes
    pub payload_size: usize,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: None,
            payload_size: 56,
        }
    }
}

/// A single running reachability test against one host
#[async_trait]
pub trait ProbeSession: Send + Sync {
    /// Drive the session to completion (deadline, stop, or error).
    async fn run(&self) -> Result<(), MonitorError>;

    /// Ask the session to end promptly. Idempotent, safe to call while
    /// `run` is in flight.
    fn stop(&self);
}

/// Factory for probe sessions
#[async_trait]
pub trait Prober: Send + Sync {
    async fn session(
        &self,
        host: &str,
        options: ProbeOptions,
        handler: ReplyHandler,
    ) -> Result<Arc<dyn ProbeSession>, MonitorError>;
}

/// ICMP echo implementation of [`Prober`]
pub struct IcmpProber;

#[async_trait]
impl Prober for IcmpProber {
    async fn session(
        &self,
        host: &str,
        options: ProbeOptions,
        handler: ReplyHandler,
    ) -> Result<Arc<dyn ProbeSession>, MonitorError> {
        let addr = resolve(host).await?;

        let config = match addr {
            IpAddr::V4(_) => IcmpConfig::default(),
            IpAddr::V6(_) => IcmpConfig::builder().kind(ICMP::V6).build(),
        };
        // Raw ICMP sockets need elevated privileges; surfacing that here
        // keeps the run loop free of setup failures.
        let client = Client::new(&config).map_err(|e| {
            MonitorError::ProbeCreation(format!("icmp socket for {host}: {e}"))
        })?;

        let (stop_tx, _) = watch::channel(false);
        Ok(Arc::new(IcmpSession {
            host: host.to_string(),
            addr,
            options,
            handler,
            client,
            stop_tx,
        }))
    }
}

struct IcmpSession {
    host: String,
    addr: IpAddr,
    options: ProbeOptions,
    handler: ReplyHandler,
    client: Client,
    stop_tx: watch::Sender<bool>,
}

#[async_trait]
impl ProbeSession for IcmpSession {
    async fn run(&self) -> Result<(), MonitorError> {
        let mut stop_rx = self.stop_tx.subscribe();
        if *stop_rx.borrow() {
            return Ok(());
        }

        let mut pinger = self
            .client
            .pinger(self.addr, PingIdentifier(rand::random()))
            .await;
        // A reply that takes longer than the interval counts as lost.
        pinger.timeout(self.options.interval);

        let payload = vec![0u8; self.options.payload_size];
        let deadline = self
            .options
            .timeout
            .map(|timeout| tokio::time::Instant::now() + timeout);
        let mut ticker = tokio::time::interval(self.options.interval);
        let mut seq: u16 = 0;

        debug!(host = %self.host, addr = %self.addr, "probe session started");

        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    debug!(host = %self.host, "probe session stopped");
                    break;
                }

                _ = session_deadline(deadline) => {
                    debug!(host = %self.host, "probe session deadline reached");
                    break;
                }

                _ = ticker.tick() => {
                    match pinger.ping(PingSequence(seq), &payload).await {
                        Ok((packet, rtt)) => {
                            let (ttl, bytes) = match &packet {
                                IcmpPacket::V4(p) => (p.get_ttl().unwrap_or(0), p.get_size()),
                                IcmpPacket::V6(p) => (p.get_max_hop_limit(), p.get_size()),
                            };
                            let reply = EchoReply { seq, rtt, ttl, bytes };
                            trace!(host = %self.host, seq, ?rtt, ttl, "received echo reply");
                            (self.handler)(reply).await;
                        }
                        Err(surge_ping::SurgeError::Timeout { .. }) => {
                            trace!(host = %self.host, seq, "echo request timed out");
                        }
                        Err(e) => {
                            return Err(MonitorError::ProbeRuntime(format!(
                                "ping {} failed: {e}",
                                self.host
                            )));
                        }
                    }
                    seq = seq.wrapping_add(1);
                }
            }
        }

        Ok(())
    }

    fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

async fn session_deadline(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn resolve(host: &str) -> Result<IpAddr, MonitorError> {
    if let Ok(addr) = host.parse::<IpAddr>() {
        return Ok(addr);
    }

    lookup_host((host, 0))
        .await
        .map_err(|e| MonitorError::ProbeCreation(format!("failed to resolve {host}: {e}")))?
        .next()
        .map(|sock_addr| sock_addr.ip())
        .ok_or_else(|| MonitorError::ProbeCreation(format!("no address found for {host}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_accepts_literal_addresses() {
        let addr = resolve("127.0.0.1").await.unwrap();
        assert_eq!(addr, "127.0.0.1".parse::<IpAddr>().unwrap());

        let addr = resolve("::1").await.unwrap();
        assert!(addr.is_ipv6());
    }

    #[tokio::test]
    async fn resolve_rejects_unknown_hosts() {
        let err = resolve("host.invalid.").await.unwrap_err();
        assert!(matches!(err, MonitorError::ProbeCreation(_)));
    }

    #[test]
    fn default_options_match_probe_defaults() {
        let options = ProbeOptions::default();
        assert_eq!(options.interval, Duration::from_secs(1));
        assert_eq!(options.payload_size, 56);
        assert!(options.timeout.is_none());
    }
}
