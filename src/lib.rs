//! Network latency monitoring
//!
//! Probes a set of remote hosts via ICMP and relays round-trip measurements
//! to an InfluxDB backend. The supervision loop keeps one restartable probe
//! task per target alive under a single cancellation signal; the sinks
//! decouple measurement production from backend writes through a bounded,
//! batching delivery pipeline.

pub mod config;
pub mod error;
pub mod monitor;
pub mod probe;
pub mod sink;
pub mod supervisor;
