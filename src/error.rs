//! Error types for probing and metric delivery

use std::fmt;

/// Errors raised while driving a probe session for one monitor
#[derive(Debug)]
pub enum MonitorError {
    /// The probe primitive could not be constructed (resolution failure,
    /// missing raw-socket privilege, ...)
    ProbeCreation(String),

    /// A running probe session aborted abnormally
    ProbeRuntime(String),
}

impl fmt::Display for MonitorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorError::ProbeCreation(msg) => {
                write!(f, "failed to create probe session: {}", msg)
            }
            MonitorError::ProbeRuntime(msg) => write!(f, "probe session failed: {}", msg),
        }
    }
}

impl std::error::Error for MonitorError {}

/// Errors raised by a metric sink
#[derive(Debug)]
pub enum SinkError {
    /// The backend is unreachable or misconfigured at startup. Fatal, no
    /// monitors run without a sink.
    Construction(String),

    /// A single batch failed to deliver. Logged and dropped, never fatal.
    Write(String),
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkError::Construction(msg) => {
                write!(f, "failed to set up metric backend: {}", msg)
            }
            SinkError::Write(msg) => write!(f, "failed to write batch: {}", msg),
        }
    }
}

impl std::error::Error for SinkError {}

impl From<reqwest::Error> for SinkError {
    fn from(err: reqwest::Error) -> Self {
        SinkError::Write(err.to_string())
    }
}
