//! Embedded TTL-increment ICMP prober.
//!
//! Discovers one hop per TTL over a [`ProbeChannel`], retrying lost
//! captures with a quadratic backoff capped by a hop-depth threshold
//! table. The capture session's timeout is immutable once opened, so
//! every backoff step recreates it through [`ProbeChannel::reopen`].

use async_trait::async_trait;
use geotrace_channel::{ProbeChannel, ProbeReply};
use geotrace_core::{
    CancellationMonitor, DnsResolver, HopSink, ProbeOutcome, ProbeStrategy, TraceError,
};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Capture timeout used for the first try at each hop.
const INITIAL_CAPTURE_TIMEOUT: Duration = Duration::from_millis(1);

/// Backoff ceiling for a hop: nearby routers answer fast, distant ones
/// get a longer leash.
fn backoff_threshold(ttl: u8) -> Duration {
    if ttl <= 2 {
        Duration::from_millis(100)
    } else if ttl <= 5 {
        Duration::from_millis(500)
    } else {
        Duration::from_millis(1000)
    }
}

/// Embedded raw-ICMP probe strategy. IPv4 only.
pub struct RawProbe {
    channel: Box<dyn ProbeChannel>,
    max_hops: u8,
    resolve_hostname: bool,
    dns: Option<Arc<dyn DnsResolver>>,
}

impl RawProbe {
    pub fn new(
        channel: Box<dyn ProbeChannel>,
        max_hops: u8,
        resolve_hostname: bool,
        dns: Option<Arc<dyn DnsResolver>>,
    ) -> Self {
        Self {
            channel,
            max_hops,
            resolve_hostname,
            dns,
        }
    }

    async fn send(&mut self, ttl: u8) -> Result<Instant, TraceError> {
        self.channel.send_echo(ttl, ttl as u16).await?;
        Ok(Instant::now())
    }

    /// Reopens the capture session when the wanted timeout differs from
    /// the one it was opened with.
    async fn ensure_timeout(&mut self, timeout: Duration) -> Result<(), TraceError> {
        if self.channel.capture_timeout() != timeout {
            self.channel.reopen(timeout).await?;
        }
        Ok(())
    }

    /// Optionally reverse-resolves a hop address, timing the lookup.
    async fn lookup_hostname(&self, ip: IpAddr) -> (Option<String>, Option<u32>) {
        if !self.resolve_hostname {
            return (None, None);
        }
        let Some(dns) = self.dns.as_ref() else {
            return (None, None);
        };
        let started = Instant::now();
        let hostname = dns.reverse_lookup(ip).await;
        let elapsed_ms = started.elapsed().as_millis() as u32;
        (hostname, Some(elapsed_ms))
    }

    async fn probe_loop(
        &mut self,
        sink: &dyn HopSink,
        monitor: &CancellationMonitor,
    ) -> Result<ProbeOutcome, TraceError> {
        let mut ttl: u8 = 1;
        let mut retry_count: u32 = 1;
        let mut previous_response_ip: Option<IpAddr> = None;
        let mut hops_emitted: u32 = 0;

        self.ensure_timeout(INITIAL_CAPTURE_TIMEOUT).await?;
        let mut sent_at = self.send(ttl).await?;

        loop {
            if monitor.is_cancelled() {
                return Ok(ProbeOutcome::Cancelled);
            }

            match self.channel.recv_reply().await? {
                None => {
                    // Capture timed out; back off quadratically until the
                    // hop's threshold, then write the hop off as lost.
                    retry_count += 1;
                    let next = Duration::from_millis((retry_count * retry_count) as u64);
                    if next > backoff_threshold(ttl) {
                        debug!(ttl = ttl, "Giving up on hop, synthesizing unknown");
                        if hops_emitted > 0 {
                            sink.add_unknown_point().await;
                            hops_emitted += 1;
                        }
                        if ttl >= self.max_hops {
                            return Ok(ProbeOutcome::MaxHopsExceeded);
                        }
                        ttl += 1;
                        retry_count = 1;
                        self.ensure_timeout(INITIAL_CAPTURE_TIMEOUT).await?;
                    } else {
                        trace!(ttl = ttl, timeout_ms = next.as_millis() as u64, "Backing off");
                        self.ensure_timeout(next).await?;
                    }
                    sent_at = self.send(ttl).await?;
                }
                Some(ProbeReply::TimeExceeded { from }) => {
                    if previous_response_ip == Some(from) {
                        // Duplicate retransmission of the last hop's
                        // expiry; resend without advancing.
                        trace!(ttl = ttl, from = %from, "Ignoring duplicate expiry");
                        sent_at = self.send(ttl).await?;
                        continue;
                    }

                    let latency_ms = sent_at.elapsed().as_millis() as u32;
                    let (hostname, dns_ms) = self.lookup_hostname(from).await;
                    sink.add_point(from, hostname, latency_ms, dns_ms).await;
                    hops_emitted += 1;
                    previous_response_ip = Some(from);

                    retry_count = 1;
                    // One probe past the budget is allowed so a router at
                    // exactly max_hops still gets its successor checked;
                    // the TTL field is 8 bits, so hop 255 is the deepest
                    // probe possible either way.
                    if ttl > self.max_hops || ttl == u8::MAX {
                        return Ok(ProbeOutcome::MaxHopsExceeded);
                    }
                    ttl += 1;
                    self.ensure_timeout(INITIAL_CAPTURE_TIMEOUT).await?;
                    sent_at = self.send(ttl).await?;
                }
                Some(ProbeReply::EchoReply { from }) => {
                    let latency_ms = sent_at.elapsed().as_millis() as u32;
                    let (hostname, dns_ms) = self.lookup_hostname(from).await;
                    sink.add_point(from, hostname, latency_ms, dns_ms).await;
                    debug!(ttl = ttl, from = %from, "Destination reached");
                    return Ok(ProbeOutcome::Completed);
                }
            }
        }
    }
}

#[async_trait]
impl ProbeStrategy for RawProbe {
    async fn run(
        &mut self,
        sink: &dyn HopSink,
        monitor: &CancellationMonitor,
    ) -> Result<ProbeOutcome, TraceError> {
        let outcome = self.probe_loop(sink, monitor).await;
        // The capture handle is released on every exit path.
        let _ = self.channel.close().await;
        outcome
    }
}
