//! Probe send/receive channel abstraction for geotrace.
//!
//! A [`ProbeChannel`] is a raw capability bound to one network interface:
//! send an ICMP echo with a given TTL, receive the next matching reply
//! within the channel's capture timeout, or report that no packet arrived.
//! The capture timeout is fixed when the channel is opened; changing it
//! requires [`ProbeChannel::reopen`].

pub mod packet;
pub mod reply;

#[cfg(unix)]
pub mod raw_socket;

pub use packet::create_echo_request;
pub use reply::{classify_reply, ProbeReply};

#[cfg(unix)]
pub use raw_socket::RawIcmpChannel;

use async_trait::async_trait;
use geotrace_core::TraceError;
use std::time::Duration;

/// Raw send/receive capability consumed by the embedded prober.
///
/// Implementations own their capture handle exclusively and must release
/// it in [`close`](Self::close) and on drop. `Sync` is required so a
/// probe holding the boxed channel can be driven from a spawned task.
#[async_trait]
pub trait ProbeChannel: Send + Sync {
    /// The capture timeout this channel was opened with.
    fn capture_timeout(&self) -> Duration;

    /// Recreates the underlying capture session with a new timeout. The
    /// session's timeout is immutable post-open, so this is the only way
    /// to change it.
    async fn reopen(&mut self, capture_timeout: Duration) -> Result<(), TraceError>;

    /// Sends an ICMP echo request with the given TTL and sequence number.
    async fn send_echo(&mut self, ttl: u8, seq: u16) -> Result<(), TraceError>;

    /// Receives the next reply matching this channel's probes.
    ///
    /// Returns `Ok(None)` when no matching packet arrived within the
    /// capture timeout. Unrelated traffic is skipped, not surfaced.
    async fn recv_reply(&mut self) -> Result<Option<ProbeReply>, TraceError>;

    /// Closes the channel, releasing the capture handle.
    async fn close(&mut self) -> Result<(), TraceError>;
}
