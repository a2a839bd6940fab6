//! Hop data model and great-circle math.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Mean Earth radius in kilometers.
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Approximate geographic location of a hop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub town: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country_iso: Option<String>,
    /// Set when the lookup failed and no location is known.
    #[serde(default)]
    pub unknown: bool,
}

impl GeoPoint {
    /// A location that could not be resolved.
    pub fn unresolved() -> Self {
        Self {
            unknown: true,
            ..Self::default()
        }
    }

    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => Some((lat, lon)),
            _ => None,
        }
    }
}

/// A single hop on the discovered route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hop {
    /// 1-based position on the route; contiguous and unique.
    pub number: u32,
    /// The address that responded (for a synthetic unknown hop, the
    /// previous hop's address carried forward).
    pub ip: IpAddr,
    /// Reverse-DNS name; `None` when lookup was disabled or failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Round-trip latency in whole milliseconds; 0 means "<1ms".
    pub latency_ms: u32,
    /// Time spent on the reverse lookup; `None` when no lookup ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_lookup_ms: Option<u32>,
    /// Great-circle distance from the previous hop; 0 for the first hop.
    pub distance_to_previous_km: f64,
    pub geo: GeoPoint,
    /// Placeholder synthesized for a lost probe.
    #[serde(default)]
    pub synthetic_unknown: bool,
}

impl Hop {
    /// Great-circle distance to another hop, or 0 when either location
    /// is unknown.
    pub fn distance_from(&self, other: &Hop) -> f64 {
        match (self.geo.coordinates(), other.geo.coordinates()) {
            (Some((lat1, lon1)), Some((lat2, lon2))) => {
                haversine_km(lat1, lon1, lat2, lon2)
            }
            _ => 0.0,
        }
    }
}

/// Great-circle distance between two coordinates in kilometers.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();
    EARTH_RADIUS_KM * c
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn hop_at(number: u32, lat: f64, lon: f64) -> Hop {
        Hop {
            number,
            ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, number as u8)),
            hostname: None,
            latency_ms: 1,
            dns_lookup_ms: None,
            distance_to_previous_km: 0.0,
            geo: GeoPoint {
                latitude: Some(lat),
                longitude: Some(lon),
                ..GeoPoint::default()
            },
            synthetic_unknown: false,
        }
    }

    #[test]
    fn test_haversine_known_distance() {
        // Paris -> Berlin is roughly 878 km.
        let d = haversine_km(48.8566, 2.3522, 52.5200, 13.4050);
        assert!((d - 878.0).abs() < 10.0, "got {}", d);
    }

    #[test]
    fn test_haversine_zero_distance() {
        assert_eq!(haversine_km(48.0, 2.0, 48.0, 2.0), 0.0);
    }

    #[test]
    fn test_distance_from_unknown_location_is_zero() {
        let a = hop_at(1, 48.0, 2.0);
        let mut b = hop_at(2, 52.0, 13.0);
        b.geo = GeoPoint::unresolved();
        assert_eq!(b.distance_from(&a), 0.0);
    }

    #[test]
    fn test_distance_from_known_locations() {
        let a = hop_at(1, 48.8566, 2.3522);
        let b = hop_at(2, 52.5200, 13.4050);
        assert!(b.distance_from(&a) > 800.0);
    }
}
