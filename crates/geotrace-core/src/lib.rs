//! Core types, traits, and error handling for geotrace.
//!
//! This crate provides the fundamental abstractions used throughout the
//! route-discovery implementation:
//!
//! - [`ProbeStrategy`] and [`HopSink`] traits connecting probes to the engine
//! - [`Hop`] and [`RouteReport`] data model with CSV/text/JSON serialization
//! - [`TraceError`] for error handling
//! - [`CancellationMonitor`] for cooperative early termination

pub mod error;
pub mod hop;
pub mod report;
pub mod traits;
pub mod types;

pub use error::{TraceError, TraceResult};
pub use hop::{haversine_km, GeoPoint, Hop};
pub use report::RouteReport;
pub use traits::{DnsResolver, GeoEnricher, HistoryStore, HopSink, ProbeStrategy};
pub use types::{
    normalize_destination, CancellationMonitor, EngineConfig, HostOs, ProbeOutcome, TraceSpec,
};
