//! Traits at the seams of the route-discovery engine.

use crate::error::TraceError;
use crate::hop::{GeoPoint, Hop};
use crate::types::{CancellationMonitor, ProbeOutcome};
use async_trait::async_trait;
use std::net::IpAddr;

/// Core trait for probe strategy implementations (OS process, embedded
/// raw ICMP).
///
/// A strategy discovers hops and records them through the supplied
/// [`HopSink`]; it never reports lost individual probes as failures.
#[async_trait]
pub trait ProbeStrategy: Send {
    /// Runs the probe loop to completion, checking `monitor` between
    /// iterations. All owned capture/process handles must be released on
    /// every exit path.
    async fn run(
        &mut self,
        sink: &dyn HopSink,
        monitor: &CancellationMonitor,
    ) -> Result<ProbeOutcome, TraceError>;
}

/// Engine-side sink that probe strategies record hops into.
#[async_trait]
pub trait HopSink: Send + Sync {
    /// Enriches and appends a discovered hop, returning the constructed
    /// value (probes use it to detect unknown successors and duplicates).
    async fn add_point(
        &self,
        ip: IpAddr,
        hostname: Option<String>,
        latency_ms: u32,
        dns_lookup_ms: Option<u32>,
    ) -> Hop;

    /// Appends a synthetic placeholder for a lost probe, cloned from the
    /// previous hop's geo and identity (or from the local source when the
    /// route is still empty).
    async fn add_unknown_point(&self) -> Hop;
}

/// Geographic enrichment service, supplied externally.
pub trait GeoEnricher: Send + Sync {
    /// Resolves an address to a location; returns a point with the
    /// `unknown` flag set on failure.
    fn resolve(&self, ip: IpAddr) -> GeoPoint;

    /// Location of the local host's public address, used for private and
    /// loopback hop addresses.
    fn local_public(&self) -> GeoPoint;
}

/// Forward and reverse DNS, supplied externally.
#[async_trait]
pub trait DnsResolver: Send + Sync {
    /// Resolves a hostname, preferring the requested address family.
    async fn resolve(&self, host: &str, want_v4: bool) -> Result<IpAddr, TraceError>;

    /// Reverse-resolves an address; `None` when no name is known.
    async fn reverse_lookup(&self, ip: IpAddr) -> Option<String>;
}

/// Best-effort destination history, supplied externally.
pub trait HistoryStore: Send + Sync {
    fn record(&self, destination: &str);
}
