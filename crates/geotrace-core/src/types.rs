//! Core types for route-discovery operations.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Outcome of a probe run.
///
/// Probe loops report how they ended through this enum instead of using
/// errors for control flow; only genuine failures surface as [`TraceError`].
///
/// [`TraceError`]: crate::TraceError
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The destination answered; the route is complete.
    Completed,
    /// The hop budget was exhausted without reaching the destination.
    MaxHopsExceeded,
    /// The cancellation monitor fired between probe iterations.
    Cancelled,
}

/// Operating system identity used to select the traceroute command and
/// its output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostOs {
    Windows,
    Linux,
    MacOs,
}

impl HostOs {
    /// Returns the identity of the running host.
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            HostOs::Windows
        } else if cfg!(target_os = "macos") {
            HostOs::MacOs
        } else {
            HostOs::Linux
        }
    }
}

/// Engine-level configuration, fixed at construction time.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Operating system identity for the OS-process probe.
    pub host_os: HostOs,
    /// Prefer the OS-process probe even when embedded probing is possible.
    pub prefer_os_probe: bool,
    /// Hop budget applied when a trace spec does not set one.
    pub default_max_hops: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host_os: HostOs::current(),
            prefer_os_probe: false,
            default_max_hops: 30,
        }
    }
}

/// Per-call options for a single trace.
#[derive(Debug, Clone)]
pub struct TraceSpec {
    /// Destination hostname or IP address (normalized by the engine).
    pub destination: String,
    /// Maximum number of hops to probe.
    pub max_hops: u8,
    /// Overall wall-clock budget; `None` disables the watchdog.
    pub timeout: Option<Duration>,
    /// Whether to reverse-resolve hop hostnames.
    pub resolve_hostname: bool,
    /// Force the OS-process probe strategy.
    pub use_os_probe: bool,
    /// Probe over IPv4. The embedded prober is IPv4-only, so `false`
    /// always selects the OS-process strategy.
    pub ipv4: bool,
}

impl TraceSpec {
    /// Creates a spec for the given destination with default options.
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            max_hops: 30,
            timeout: None,
            resolve_hostname: true,
            use_os_probe: false,
            ipv4: true,
        }
    }

    /// Validates the spec.
    pub fn validate(&self) -> Result<(), crate::TraceError> {
        if self.max_hops == 0 {
            return Err(crate::TraceError::InvalidMaxHops(self.max_hops));
        }
        Ok(())
    }
}

/// Normalizes a user-entered destination: strips URL scheme prefixes and
/// any path suffix, and trims surrounding whitespace.
pub fn normalize_destination(raw: &str) -> String {
    let mut host = raw.trim();
    for scheme in ["https://", "http://", "ftps://", "ftp://"] {
        if let Some(rest) = host.strip_prefix(scheme) {
            host = rest;
            break;
        }
    }
    if let Some(slash) = host.find('/') {
        host = &host[..slash];
    }
    host.trim().to_string()
}

/// Shared cancellation flag, settable by the caller or by the engine's
/// watchdog and polled cooperatively between probe iterations.
///
/// The watchdog marks the monitor as timed out before cancelling so the
/// engine can distinguish a timeout from a caller-driven cancel.
#[derive(Debug, Clone, Default)]
pub struct CancellationMonitor {
    token: CancellationToken,
    timed_out: Arc<AtomicBool>,
}

impl CancellationMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cooperative cancellation.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Marks the monitor as cancelled by the watchdog.
    pub fn mark_timed_out(&self) {
        self.timed_out.store(true, Ordering::SeqCst);
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }

    /// Completes when the monitor is cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }
}
