//! Error types for route-discovery operations.

use thiserror::Error;

/// Main error type for route-discovery operations.
#[derive(Error, Debug)]
pub enum TraceError {
    // Resolution errors
    #[error("Failed to resolve destination host {host}: {reason}")]
    HostResolution { host: String, reason: String },

    // Capture channel errors
    #[error("Failed to open capture channel: {0}")]
    ChannelOpen(#[source] std::io::Error),

    #[error("Read timeout exceeded")]
    ReadTimeout,

    #[error("Probe send failed: {0}")]
    SendFailed(#[source] std::io::Error),

    #[error("Packet did not match probe")]
    PacketMismatch,

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    // OS process errors
    #[error("Failed to spawn {command}: {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read traceroute output: {0}")]
    ProbeIo(#[source] std::io::Error),

    #[error("Traceroute reported an error: {0}")]
    NonBenignStderr(String),

    #[error("Traceroute output ended before the completion terminator")]
    TruncatedOutput,

    #[error("Unparseable traceroute output line: {0:?}")]
    UnparseableLine(String),

    // Configuration errors
    #[error("Invalid hop budget: {0}")]
    InvalidMaxHops(u8),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TraceError {
    /// Returns true if this error is retryable on the capture path.
    ///
    /// Retryable errors indicate that we should keep reading packets rather
    /// than giving up: a raw capture channel sees packets that have nothing
    /// to do with our probes.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ReadTimeout | Self::PacketMismatch | Self::MalformedPacket(_)
        )
    }
}

impl From<std::io::Error> for TraceError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => TraceError::ReadTimeout,
            std::io::ErrorKind::WouldBlock => TraceError::ReadTimeout,
            _ => TraceError::ProbeIo(err),
        }
    }
}

/// Result type alias for route-discovery operations.
pub type TraceResult<T> = Result<T, TraceError>;
