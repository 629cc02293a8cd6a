//! Versioned risk scoring models
//!
//! A risk model is an immutable-once-published configuration document:
//! factor weights, flag/block thresholds and per-factor parameters. Versions
//! of the same model id are fully self-contained documents; at most one
//! version is active at any instant.

pub mod broadcaster;
pub mod store;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, RiskEngineError};
use crate::core::types::flags;

pub use broadcaster::{BroadcasterHealth, ModelBroadcaster, ModelEvent};
pub use store::{ActivationOutcome, ModelStore, Timeframe};

/// Lifecycle status of a model version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    Draft,
    Active,
    Inactive,
    Archived,
}

/// Score thresholds for level classification
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// At or above this score a transaction is flagged (medium)
    pub flag: f64,
    /// At or above this score a transaction is blocked (high)
    pub block: f64,
}

/// A single risk factor definition
///
/// The typed core carries identity and the active switch; detector-specific
/// numbers live in the open `params` map so new parameter keys deploy without
/// code changes. Well-known keys: `threshold`, `distance_threshold`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskFactor {
    pub id: String,
    pub description: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub params: BTreeMap<String, f64>,
}

fn default_true() -> bool {
    true
}

impl RiskFactor {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            active: true,
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: f64) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }
}

/// Tracked accuracy of a model version, filled in from feedback
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelPerformance {
    pub false_positive_rate: Option<f64>,
    pub false_negative_rate: Option<f64>,
    pub avg_processing_time_ms: Option<f64>,
}

/// A risk model version as persisted in the model collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskModelDocument {
    pub model_id: String,
    pub version: u32,
    pub status: ModelStatus,
    pub description: String,
    pub weights: BTreeMap<String, f64>,
    pub thresholds: Thresholds,
    pub risk_factors: Vec<RiskFactor>,
    #[serde(default)]
    pub performance: ModelPerformance,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RiskModelDocument {
    /// Weight for a factor id, zero when the model does not score it
    pub fn weight(&self, factor_id: &str) -> f64 {
        self.weights.get(factor_id).copied().unwrap_or(0.0)
    }

    pub fn factor(&self, factor_id: &str) -> Option<&RiskFactor> {
        self.risk_factors.iter().find(|f| f.id == factor_id)
    }

    /// A factor without a definition entry is governed by the weight map alone
    pub fn factor_active(&self, factor_id: &str) -> bool {
        self.factor(factor_id).map(|f| f.active).unwrap_or(true)
    }

    /// Factor parameter with a fallback default
    pub fn factor_param(&self, factor_id: &str, key: &str, default: f64) -> f64 {
        self.factor(factor_id)
            .and_then(|f| f.params.get(key).copied())
            .unwrap_or(default)
    }

    /// Reject inconsistent model documents at the boundary
    pub fn validate(&self) -> Result<()> {
        if self.model_id.is_empty() {
            return Err(RiskEngineError::Validation(
                "model_id must not be empty".to_string(),
            ));
        }
        if self.version == 0 {
            return Err(RiskEngineError::Validation(
                "version must be a positive integer".to_string(),
            ));
        }
        if self.thresholds.flag > self.thresholds.block {
            return Err(RiskEngineError::Validation(format!(
                "flag threshold {} must not exceed block threshold {}",
                self.thresholds.flag, self.thresholds.block
            )));
        }
        for (factor, weight) in &self.weights {
            if !weight.is_finite() || *weight < 0.0 {
                return Err(RiskEngineError::Validation(format!(
                    "weight for {} must be a non-negative number",
                    factor
                )));
            }
        }
        for factor in &self.risk_factors {
            if factor.id.is_empty() {
                return Err(RiskEngineError::Validation(
                    "risk factor id must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// The default scoring model shipped with the engine
    pub fn default_model() -> Self {
        let now = Utc::now();
        let mut weights = BTreeMap::new();
        weights.insert(flags::AMOUNT_ANOMALY_HIGH.to_string(), 30.0);
        weights.insert(flags::AMOUNT_ANOMALY_MEDIUM.to_string(), 15.0);
        weights.insert(flags::LOCATION_ANOMALY.to_string(), 25.0);
        weights.insert(flags::MERCHANT_CATEGORY_ANOMALY.to_string(), 10.0);
        weights.insert(flags::UNKNOWN_DEVICE.to_string(), 35.0);
        weights.insert(flags::VELOCITY_ANOMALY.to_string(), 20.0);

        Self {
            model_id: "default-risk-model".to_string(),
            version: 1,
            status: ModelStatus::Draft,
            description: "Default risk scoring model".to_string(),
            weights,
            thresholds: Thresholds {
                flag: 60.0,
                block: 85.0,
            },
            risk_factors: vec![
                RiskFactor::new(
                    flags::AMOUNT_ANOMALY_HIGH,
                    "Transaction amount significantly higher than customer average",
                )
                .with_param("threshold", 3.0),
                RiskFactor::new(
                    flags::AMOUNT_ANOMALY_MEDIUM,
                    "Transaction amount moderately higher than customer average",
                )
                .with_param("threshold", 2.0),
                RiskFactor::new(flags::LOCATION_ANOMALY, "Transaction from unusual location")
                    .with_param("distance_threshold", 100.0),
                RiskFactor::new(
                    flags::MERCHANT_CATEGORY_ANOMALY,
                    "Transaction in unusual merchant category",
                ),
                RiskFactor::new(flags::UNKNOWN_DEVICE, "Transaction from unknown device"),
                RiskFactor::new(
                    flags::VELOCITY_ANOMALY,
                    "Multiple transactions in short timeframe",
                )
                .with_param("threshold", 5.0),
            ],
            performance: ModelPerformance::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Input for creating version 1 of a new model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskModelSpec {
    pub model_id: String,
    pub description: String,
    pub weights: BTreeMap<String, f64>,
    pub thresholds: Thresholds,
    pub risk_factors: Vec<RiskFactor>,
}

/// Partial update applied by `ModelStore::update`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskModelPatch {
    pub description: Option<String>,
    pub weights: Option<BTreeMap<String, f64>>,
    pub thresholds: Option<Thresholds>,
    pub risk_factors: Option<Vec<RiskFactor>>,
    pub status: Option<ModelStatus>,
}

/// True outcome of a transaction, supplied through feedback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackOutcome {
    Unknown,
    Legitimate,
    Fraud,
}

/// Append-only record of one model evaluation, for performance tracking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub record_id: String,
    pub model_id: String,
    pub model_version: u32,
    pub transaction_id: String,
    pub customer_id: String,
    pub risk_score: f64,
    pub risk_factors: Vec<String>,
    pub processing_time_ms: f64,
    pub timestamp: DateTime<Utc>,
    pub outcome: FeedbackOutcome,
    pub feedback_at: Option<DateTime<Utc>>,
}

/// Aggregated performance over a timeframe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub model_id: String,
    pub version: u32,
    pub timeframe: store::Timeframe,
    pub total_evaluations: usize,
    pub avg_risk_score: Option<f64>,
    /// Share of evaluations each factor triggered on, in percent
    pub risk_factor_distribution: BTreeMap<String, f64>,
    pub false_positive_rate: Option<f64>,
    pub false_negative_rate: Option<f64>,
    pub avg_processing_time_ms: Option<f64>,
}
