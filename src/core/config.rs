//! Engine configuration
//!
//! Every tuned constant in the engine lives here, with defaults matching the
//! shipped default risk model. Supports JSON file round-trips for deployment
//! overrides.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, RiskEngineError};

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    pub detectors: DetectorConfig,
    pub scoring: ScoringConfig,
    pub similarity: SimilarityConfig,
    pub broadcaster: BroadcasterConfig,
    pub model_store: ModelStoreConfig,
}

/// Default thresholds for the anomaly detectors
///
/// The active model's risk factor parameters take precedence; these values
/// apply when a factor carries no parameter of its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Z-score at or above which the high amount band fires
    pub amount_high_threshold: f64,
    /// Z-score at or above which the medium amount band fires
    pub amount_medium_threshold: f64,
    /// Distance in kilometers beyond which a location is anomalous
    pub location_distance_km: f64,
    /// Trailing window for the velocity check, in minutes
    pub velocity_window_minutes: i64,
    /// Transaction count at or above which velocity fires
    pub velocity_threshold: u64,
    /// Guard against zero variance in the z-score denominator
    pub zero_std_epsilon: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            amount_high_threshold: 3.0,
            amount_medium_threshold: 2.0,
            location_distance_km: 100.0,
            velocity_window_minutes: 60,
            velocity_threshold: 5,
            zero_std_epsilon: 1e-6,
        }
    }
}

/// Composite score assembly
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Fraction of the customer's cached risk score folded into the composite
    pub base_risk_weight: f64,
    /// Points added to the customer's cached risk score per triggered flag
    pub profile_risk_increment_per_flag: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            base_risk_weight: 0.3,
            profile_risk_increment_per_flag: 2.5,
        }
    }
}

/// Similarity search and blending
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarityConfig {
    pub enabled: bool,
    /// Maximum matches fetched from the vector index
    pub limit: usize,
    /// Candidate pool size for the nearest-neighbor query
    pub num_candidates: usize,
    /// Matches surfaced to the caller after re-ranking
    pub display_limit: usize,
    /// Fraction of the similarity/rule-based disagreement applied as a boost
    pub blend_weight: f64,
    /// Hard cap, in score points, on the similarity boost
    pub blend_cap: f64,
    /// Budget for the embed + search round trip
    pub timeout_ms: u64,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            limit: 15,
            num_candidates: 200,
            display_limit: 5,
            blend_weight: 0.5,
            blend_cap: 25.0,
            timeout_ms: 2000,
        }
    }
}

/// Change feed consumption and fan-out
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcasterConfig {
    /// Per-subscriber queue bound; oldest events are dropped on overflow
    pub fanout_capacity: usize,
    /// Heartbeat period so subscribers can tell idle from disconnected
    pub heartbeat_secs: u64,
    /// Initial reconnect delay after a feed failure, in milliseconds
    pub reconnect_base_ms: u64,
    /// Reconnect delay ceiling, in milliseconds
    pub reconnect_max_ms: u64,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            fanout_capacity: 256,
            heartbeat_secs: 30,
            reconnect_base_ms: 500,
            reconnect_max_ms: 30_000,
        }
    }
}

/// Model store behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelStoreConfig {
    /// Attempts before an activation race surfaces as a conflict
    pub activation_retry_budget: u32,
}

impl Default for ModelStoreConfig {
    fn default() -> Self {
        Self {
            activation_retry_budget: 5,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration consistency
    pub fn validate(&self) -> Result<()> {
        if self.detectors.amount_medium_threshold > self.detectors.amount_high_threshold {
            return Err(RiskEngineError::Validation(
                "amount medium threshold must not exceed the high threshold".to_string(),
            ));
        }
        if self.detectors.location_distance_km <= 0.0 {
            return Err(RiskEngineError::Validation(
                "location distance threshold must be positive".to_string(),
            ));
        }
        if self.detectors.velocity_window_minutes <= 0 {
            return Err(RiskEngineError::Validation(
                "velocity window must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.scoring.base_risk_weight) {
            return Err(RiskEngineError::Validation(
                "base risk weight must be between 0.0 and 1.0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.similarity.blend_weight) {
            return Err(RiskEngineError::Validation(
                "similarity blend weight must be between 0.0 and 1.0".to_string(),
            ));
        }
        if self.similarity.limit == 0 || self.similarity.display_limit == 0 {
            return Err(RiskEngineError::Validation(
                "similarity limits must be greater than zero".to_string(),
            ));
        }
        if self.broadcaster.fanout_capacity == 0 {
            return Err(RiskEngineError::Validation(
                "fan-out capacity must be greater than zero".to_string(),
            ));
        }
        if self.model_store.activation_retry_budget == 0 {
            return Err(RiskEngineError::Validation(
                "activation retry budget must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_inverted_amount_bands_rejected() {
        let mut config = EngineConfig::default();
        config.detectors.amount_medium_threshold = 4.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serialization_round_trip() {
        let config = EngineConfig::default();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert!(back.validate().is_ok());
        assert_eq!(back.similarity.limit, 15);
        assert_eq!(back.broadcaster.heartbeat_secs, 30);
    }

    #[test]
    fn test_config_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");

        let config = EngineConfig::default();
        config.save_to_file(&path).unwrap();

        let loaded = EngineConfig::from_file(&path).unwrap();
        assert_eq!(loaded.detectors.velocity_threshold, 5);
    }
}
