//! # Geographic Position and Range
//!
//! Device/gateway placement and the haversine distance that decides
//! radio visibility. Range is device-centric: a gateway is in range of a
//! device when the great-circle distance between them does not exceed the
//! device's configured antenna range.

use serde::{Deserialize, Serialize};

/// Mean Earth radius in meters
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// A 2D position with altitude, in WGS84 degrees / meters.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    /// Altitude above sea level in meters
    pub altitude: i32,
}

impl Location {
    pub fn new(latitude: f64, longitude: f64, altitude: i32) -> Self {
        Location {
            latitude,
            longitude,
            altitude,
        }
    }
}

/// Great-circle distance between two positions in meters.
///
/// Altitude is ignored: at radio-planning scales the horizontal component
/// dominates, and the original range model is 2D.
pub fn distance_meters(a: &Location, b: &Location) -> f64 {
    let lat_a = a.latitude.to_radians();
    let lat_b = b.latitude.to_radians();
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat_a.cos() * lat_b.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

/// True when `other` lies within `range_m` meters of `center`.
pub fn in_range(center: &Location, other: &Location, range_m: f64) -> bool {
    distance_meters(center, other) <= range_m
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_distance_at_same_point() {
        let p = Location::new(48.8566, 2.3522, 35);
        assert!(distance_meters(&p, &p) < 1e-6);
    }

    #[test]
    fn one_degree_latitude_is_about_111_km() {
        let a = Location::new(48.0, 2.0, 0);
        let b = Location::new(49.0, 2.0, 0);
        let d = distance_meters(&a, &b);
        assert!((d - 111_195.0).abs() < 500.0, "got {d}");
    }

    #[test]
    fn in_range_is_inclusive_at_the_boundary() {
        let a = Location::new(48.0, 2.0, 0);
        let b = Location::new(48.0, 2.001, 0);
        let d = distance_meters(&a, &b);
        assert!(in_range(&a, &b, d + 1.0));
        assert!(!in_range(&a, &b, d - 1.0));
    }
}
