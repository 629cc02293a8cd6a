//! Anomaly detectors
//!
//! Independent, pure scoring functions. Each detector inspects one dimension
//! of a transaction against the customer's behavioral profile and reports
//! whether it triggered; the evaluation engine pairs triggered detectors with
//! the active model's factor weights.

use crate::core::errors::{Result, RiskEngineError};
use crate::core::geo::{haversine_km, GeoPoint};
use crate::core::types::{CustomerProfile, DeviceInfo};

/// Outcome of a single detector run
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorOutcome {
    pub triggered: bool,
    pub detail: Option<String>,
}

impl DetectorOutcome {
    pub fn clear() -> Self {
        Self {
            triggered: false,
            detail: None,
        }
    }

    pub fn clear_with(detail: impl Into<String>) -> Self {
        Self {
            triggered: false,
            detail: Some(detail.into()),
        }
    }

    pub fn triggered(detail: impl Into<String>) -> Self {
        Self {
            triggered: true,
            detail: Some(detail.into()),
        }
    }
}

/// Which amount band fired, if any
///
/// Bands are mutually exclusive per evaluation; only the highest band that
/// fires contributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmountBand {
    Normal,
    Medium,
    High,
}

/// Z-score banding of the transaction amount against the customer's history.
///
/// Returns the band together with the computed z-score for diagnostics.
/// `epsilon` keeps the denominator finite for customers with no variance
/// history.
pub fn amount_band(
    amount: f64,
    profile: &CustomerProfile,
    high_threshold: f64,
    medium_threshold: f64,
    epsilon: f64,
) -> (AmountBand, f64) {
    let mean = profile.behavioral.avg_amount;
    let std = profile.behavioral.std_amount;
    let z = (amount - mean) / std.max(epsilon);

    let band = if z >= high_threshold {
        AmountBand::High
    } else if z >= medium_threshold {
        AmountBand::Medium
    } else {
        AmountBand::Normal
    };
    (band, z)
}

/// Distance check against the customer's usual transaction locations.
///
/// Not triggered when the customer has no location baseline. Malformed
/// coordinates are an error for the caller to absorb.
pub fn location_anomaly(
    point: GeoPoint,
    profile: &CustomerProfile,
    distance_threshold_km: f64,
) -> Result<DetectorOutcome> {
    point.validate()?;

    if profile.behavioral.usual_locations.is_empty() {
        return Ok(DetectorOutcome::clear_with("no location baseline"));
    }

    let mut min_distance = f64::INFINITY;
    for usual in &profile.behavioral.usual_locations {
        if usual.point.validate().is_err() {
            // Skip corrupt baseline entries rather than failing the check
            continue;
        }
        min_distance = min_distance.min(haversine_km(point, usual.point));
    }

    if !min_distance.is_finite() {
        return Ok(DetectorOutcome::clear_with("no location baseline"));
    }

    if min_distance > distance_threshold_km {
        Ok(DetectorOutcome::triggered(format!(
            "{:.1} km from nearest usual location (threshold {:.0} km)",
            min_distance, distance_threshold_km
        )))
    } else {
        Ok(DetectorOutcome::clear_with(format!(
            "{:.1} km from nearest usual location",
            min_distance
        )))
    }
}

/// Device verification against the customer's known devices.
///
/// Any one failing sub-condition suffices: unknown device id, unknown
/// kind/os/browser combination, or an IP outside every known address list.
pub fn device_verification(device: &DeviceInfo, profile: &CustomerProfile) -> DetectorOutcome {
    let devices = &profile.behavioral.devices;

    let id_known = devices.iter().any(|d| d.device_id == device.device_id);
    if !id_known {
        return DetectorOutcome::triggered(format!("unknown device id {}", device.device_id));
    }

    let combo_known = devices
        .iter()
        .any(|d| d.kind == device.kind && d.os == device.os && d.browser == device.browser);
    if !combo_known {
        return DetectorOutcome::triggered(format!(
            "unknown device fingerprint {}/{}/{}",
            device.kind, device.os, device.browser
        ));
    }

    let ip_known = devices
        .iter()
        .any(|d| d.ip_addresses.iter().any(|ip| ip == &device.ip));
    if !ip_known {
        return DetectorOutcome::triggered(format!("ip {} outside known ranges", device.ip));
    }

    DetectorOutcome::clear()
}

/// Velocity check over a pre-queried transaction count.
///
/// The engine counts the customer's persisted transactions in the trailing
/// window ending at the current transaction; the detector itself is a pure
/// function of that count.
pub fn velocity_anomaly(recent_count: u64, threshold: u64) -> DetectorOutcome {
    if threshold > 0 && recent_count >= threshold {
        DetectorOutcome::triggered(format!(
            "{} transactions in window (threshold {})",
            recent_count, threshold
        ))
    } else {
        DetectorOutcome::clear_with(format!("{} transactions in window", recent_count))
    }
}

/// Merchant category membership against the customer's common categories
pub fn merchant_category_anomaly(category: &str, profile: &CustomerProfile) -> DetectorOutcome {
    if profile
        .behavioral
        .common_merchant_categories
        .iter()
        .any(|c| c == category)
    {
        DetectorOutcome::clear()
    } else {
        DetectorOutcome::triggered(format!("unusual merchant category {}", category))
    }
}

/// Guard used by the engine when a detector input fails validation
pub fn detector_failure(err: &RiskEngineError) -> DetectorOutcome {
    DetectorOutcome::clear_with(format!("detector failed: {}", err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{BehavioralProfile, KnownDevice, RiskProfile, UsualLocation};
    use test_case::test_case;

    fn profile_with_history() -> CustomerProfile {
        CustomerProfile {
            customer_id: "cust-1".to_string(),
            behavioral: BehavioralProfile {
                avg_amount: 100.0,
                std_amount: 20.0,
                avg_transactions_per_day: 2.0,
                devices: vec![KnownDevice {
                    device_id: "D1".to_string(),
                    kind: "mobile".to_string(),
                    os: "iOS".to_string(),
                    browser: "Safari".to_string(),
                    ip_addresses: vec!["10.0.0.1".to_string()],
                }],
                usual_locations: vec![UsualLocation {
                    city: "New York".to_string(),
                    state: "NY".to_string(),
                    country: "US".to_string(),
                    point: GeoPoint::new(40.7, -74.0),
                    frequency: 0.8,
                }],
                common_merchant_categories: vec!["grocery".to_string(), "restaurant".to_string()],
            },
            risk: RiskProfile::default(),
        }
    }

    #[test_case(100.0 => AmountBand::Normal ; "at the mean")]
    #[test_case(139.9 => AmountBand::Normal ; "just below medium")]
    #[test_case(140.0 => AmountBand::Medium ; "exactly medium")]
    #[test_case(159.9 => AmountBand::Medium ; "below high")]
    #[test_case(170.0 => AmountBand::High ; "z of 3.5 is high only")]
    fn test_amount_bands(amount: f64) -> AmountBand {
        // mean 100, std 20: medium at z >= 2 (140), high at z >= 3 (160)
        let (band, _) = amount_band(amount, &profile_with_history(), 3.0, 2.0, 1e-6);
        band
    }

    #[test]
    fn test_amount_zero_variance_history() {
        let mut profile = profile_with_history();
        profile.behavioral.std_amount = 0.0;
        let (band, z) = amount_band(150.0, &profile, 3.0, 2.0, 1e-6);
        assert_eq!(band, AmountBand::High);
        assert!(z.is_finite());
    }

    #[test]
    fn test_location_within_threshold() {
        let outcome =
            location_anomaly(GeoPoint::new(40.75, -73.95), &profile_with_history(), 100.0)
                .unwrap();
        assert!(!outcome.triggered);
    }

    #[test]
    fn test_location_far_away_triggers() {
        let sydney = GeoPoint::new(-33.8, 151.2);
        let outcome = location_anomaly(sydney, &profile_with_history(), 100.0).unwrap();
        assert!(outcome.triggered);
        assert!(outcome.detail.unwrap().contains("km"));
    }

    #[test]
    fn test_location_no_baseline_fails_open() {
        let mut profile = profile_with_history();
        profile.behavioral.usual_locations.clear();
        let outcome = location_anomaly(GeoPoint::new(-33.8, 151.2), &profile, 100.0).unwrap();
        assert!(!outcome.triggered);
        assert_eq!(outcome.detail.as_deref(), Some("no location baseline"));
    }

    #[test]
    fn test_location_malformed_geometry_is_an_error() {
        let result = location_anomaly(GeoPoint::new(f64::NAN, 0.0), &profile_with_history(), 100.0);
        assert!(result.is_err());
    }

    #[test]
    fn test_device_known() {
        let device = DeviceInfo {
            device_id: "D1".to_string(),
            kind: "mobile".to_string(),
            os: "iOS".to_string(),
            browser: "Safari".to_string(),
            ip: "10.0.0.1".to_string(),
        };
        assert!(!device_verification(&device, &profile_with_history()).triggered);
    }

    #[test]
    fn test_device_unknown_id() {
        let device = DeviceInfo {
            device_id: "D2".to_string(),
            kind: "mobile".to_string(),
            os: "iOS".to_string(),
            browser: "Safari".to_string(),
            ip: "10.0.0.1".to_string(),
        };
        let outcome = device_verification(&device, &profile_with_history());
        assert!(outcome.triggered);
        assert!(outcome.detail.unwrap().contains("unknown device id"));
    }

    #[test]
    fn test_device_unknown_ip() {
        let device = DeviceInfo {
            device_id: "D1".to_string(),
            kind: "mobile".to_string(),
            os: "iOS".to_string(),
            browser: "Safari".to_string(),
            ip: "203.0.113.50".to_string(),
        };
        let outcome = device_verification(&device, &profile_with_history());
        assert!(outcome.triggered);
        assert!(outcome.detail.unwrap().contains("outside known ranges"));
    }

    #[test_case(4, 5 => false ; "below threshold")]
    #[test_case(5, 5 => true ; "meets threshold")]
    #[test_case(9, 5 => true ; "above threshold")]
    fn test_velocity(count: u64, threshold: u64) -> bool {
        velocity_anomaly(count, threshold).triggered
    }

    #[test]
    fn test_merchant_category() {
        let profile = profile_with_history();
        assert!(!merchant_category_anomaly("grocery", &profile).triggered);
        assert!(merchant_category_anomaly("casino", &profile).triggered);
    }
}
