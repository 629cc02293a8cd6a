//! Great-circle distance on a spherical Earth

use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, RiskEngineError};

/// Mean Earth radius in kilometers
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Geographic point in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Reject non-finite or out-of-range coordinates
    pub fn validate(&self) -> Result<()> {
        if !self.lat.is_finite() || !self.lon.is_finite() {
            return Err(RiskEngineError::Validation(
                "coordinates must be finite".to_string(),
            ));
        }
        if self.lat.abs() > 90.0 || self.lon.abs() > 180.0 {
            return Err(RiskEngineError::Validation(format!(
                "coordinates out of range: ({}, {})",
                self.lat, self.lon
            )));
        }
        Ok(())
    }
}

/// Haversine distance between two points, in kilometers
pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * h.sqrt().asin() * EARTH_RADIUS_KM
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_degree_of_longitude_at_equator() {
        let d = haversine_km(GeoPoint::new(0.0, 0.0), GeoPoint::new(0.0, 1.0));
        // One degree of longitude at the equator is about 111.19 km
        assert!((d - 111.19).abs() / 111.19 < 0.005, "got {}", d);
    }

    #[test]
    fn test_identical_points() {
        let p = GeoPoint::new(40.7, -74.0);
        assert_eq!(haversine_km(p, p), 0.0);
    }

    #[test]
    fn test_new_york_to_sydney() {
        let nyc = GeoPoint::new(40.7, -74.0);
        let syd = GeoPoint::new(-33.8, 151.2);
        let d = haversine_km(nyc, syd);
        assert!(d > 15_000.0 && d < 17_000.0, "got {}", d);
    }

    #[test]
    fn test_validate_rejects_bad_coordinates() {
        assert!(GeoPoint::new(f64::NAN, 0.0).validate().is_err());
        assert!(GeoPoint::new(91.0, 0.0).validate().is_err());
        assert!(GeoPoint::new(0.0, -181.0).validate().is_err());
        assert!(GeoPoint::new(-33.8, 151.2).validate().is_ok());
    }
}
