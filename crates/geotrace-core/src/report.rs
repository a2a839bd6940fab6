//! Route serialization: CSV, tab-separated text, and JSON.

use crate::hop::Hop;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Exported column set, in output order.
const COLUMNS: [&str; 10] = [
    "number",
    "country",
    "town",
    "lat",
    "lon",
    "ip",
    "hostname",
    "latency",
    "dnsLookup",
    "distanceToPrevious",
];

/// Sentinel rendered when a hostname lookup was disabled or failed.
const UNRESOLVED: &str = "unresolved";

/// Sentinel rendered when no reverse lookup ran for a hop.
const UNDEFINED: &str = "undefined";

/// Immutable snapshot of a finished (or in-progress) route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteReport {
    /// Unique identifier of the trace job that produced this report.
    pub job_id: String,
    /// Normalized destination the trace was run against.
    pub destination: String,
    /// The destination's resolved address, when resolution succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_ip: Option<IpAddr>,
    /// Wall-clock duration of the trace in milliseconds.
    pub elapsed_ms: u64,
    /// Sum of hop-to-hop great-circle distances.
    pub total_distance_km: f64,
    pub hops: Vec<Hop>,
}

impl RouteReport {
    /// Renders the route as CSV: header row, then one row per hop,
    /// fields joined by `", "`, each row newline-terminated.
    pub fn to_csv(&self) -> String {
        self.render(", ")
    }

    /// Renders the route as tab-separated text with the same column set
    /// as [`to_csv`](Self::to_csv).
    pub fn to_text(&self) -> String {
        self.render("\t")
    }

    /// Serializes the report to JSON with indentation.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Serializes the report to compact JSON.
    pub fn to_json_compact(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    fn render(&self, separator: &str) -> String {
        let mut out = String::new();
        out.push_str(&COLUMNS.join(separator));
        out.push('\n');
        for hop in &self.hops {
            out.push_str(&hop_fields(hop).join(separator));
            out.push('\n');
        }
        out
    }
}

fn hop_fields(hop: &Hop) -> Vec<String> {
    vec![
        hop.number.to_string(),
        hop.geo.country.clone().unwrap_or_else(|| "unknown".into()),
        hop.geo.town.clone().unwrap_or_else(|| "unknown".into()),
        hop.geo.latitude.unwrap_or(0.0).to_string(),
        hop.geo.longitude.unwrap_or(0.0).to_string(),
        hop.ip.to_string(),
        hop.hostname.clone().unwrap_or_else(|| UNRESOLVED.into()),
        hop.latency_ms.to_string(),
        hop.dns_lookup_ms
            .map(|ms| ms.to_string())
            .unwrap_or_else(|| UNDEFINED.into()),
        format!("{:.1}", hop.distance_to_previous_km),
    ]
}
