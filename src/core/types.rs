//! Core domain types
//!
//! Transactions, customer behavioral profiles and risk assessments as they
//! cross the store boundary and the public evaluation API.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::core::geo::GeoPoint;

/// Stable risk factor identifiers shared between detectors and model weights
pub mod flags {
    pub const AMOUNT_ANOMALY_HIGH: &str = "amount_anomaly_high";
    pub const AMOUNT_ANOMALY_MEDIUM: &str = "amount_anomaly_medium";
    pub const LOCATION_ANOMALY: &str = "location_anomaly";
    pub const UNKNOWN_DEVICE: &str = "unknown_device";
    pub const VELOCITY_ANOMALY: &str = "velocity_anomaly";
    pub const MERCHANT_CATEGORY_ANOMALY: &str = "merchant_category_anomaly";

    /// Detector order used for diagnostics and flag output
    pub const ALL: [&str; 6] = [
        AMOUNT_ANOMALY_HIGH,
        AMOUNT_ANOMALY_MEDIUM,
        LOCATION_ANOMALY,
        UNKNOWN_DEVICE,
        VELOCITY_ANOMALY,
        MERCHANT_CATEGORY_ANOMALY,
    ];
}

/// Transaction kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Purchase,
    Withdrawal,
    Transfer,
    Deposit,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Purchase => "purchase",
            Self::Withdrawal => "withdrawal",
            Self::Transfer => "transfer",
            Self::Deposit => "deposit",
        }
    }
}

/// Settlement status of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Completed,
    Pending,
    Failed,
    Refunded,
}

/// Merchant descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Merchant {
    pub id: String,
    pub name: String,
    pub category: String,
}

/// Where the transaction took place
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionLocation {
    pub city: String,
    pub state: String,
    pub country: String,
    pub point: GeoPoint,
}

/// Device descriptor attached to a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub kind: String,
    pub os: String,
    pub browser: String,
    pub ip: String,
}

/// An incoming financial transaction, immutable once evaluated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub transaction_id: String,
    pub customer_id: String,
    pub timestamp: DateTime<Utc>,
    pub amount: Decimal,
    pub currency: String,
    pub merchant: Merchant,
    pub location: TransactionLocation,
    pub device: DeviceInfo,
    pub kind: TransactionKind,
    pub payment_method: String,
    pub status: TransactionStatus,
}

impl Transaction {
    /// Amount as a float for scoring math
    pub fn amount_f64(&self) -> f64 {
        self.amount.to_f64().unwrap_or(0.0)
    }

    /// Reject transactions the engine cannot score at all
    pub fn validate(&self) -> crate::core::errors::Result<()> {
        use crate::core::errors::RiskEngineError;
        if self.transaction_id.is_empty() {
            return Err(RiskEngineError::Validation(
                "transaction_id must not be empty".to_string(),
            ));
        }
        if self.customer_id.is_empty() {
            return Err(RiskEngineError::Validation(
                "customer_id must not be empty".to_string(),
            ));
        }
        if self.amount.is_sign_negative() {
            return Err(RiskEngineError::Validation(format!(
                "amount must not be negative: {}",
                self.amount
            )));
        }
        Ok(())
    }
}

/// A device the customer has been seen on before
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownDevice {
    pub device_id: String,
    pub kind: String,
    pub os: String,
    pub browser: String,
    #[serde(default)]
    pub ip_addresses: Vec<String>,
}

/// A location the customer usually transacts from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsualLocation {
    pub city: String,
    pub state: String,
    pub country: String,
    pub point: GeoPoint,
    /// Share of historical transactions seen at this location
    pub frequency: f64,
}

/// Aggregated behavioral history for a customer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehavioralProfile {
    pub avg_amount: f64,
    pub std_amount: f64,
    pub avg_transactions_per_day: f64,
    #[serde(default)]
    pub devices: Vec<KnownDevice>,
    #[serde(default)]
    pub usual_locations: Vec<UsualLocation>,
    #[serde(default)]
    pub common_merchant_categories: Vec<String>,
}

/// Cached risk state for a customer, mutated only after high-risk evaluations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskProfile {
    /// Overall risk score on the 0-100 scale
    pub overall_score: f64,
    pub last_assessment: Option<DateTime<Utc>>,
    #[serde(default)]
    pub risk_factors: Vec<String>,
    pub last_reported_fraud: Option<DateTime<Utc>>,
}

impl Default for RiskProfile {
    fn default() -> Self {
        Self {
            overall_score: 0.0,
            last_assessment: None,
            risk_factors: Vec::new(),
            last_reported_fraud: None,
        }
    }
}

/// Customer document as persisted in the customer collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerProfile {
    pub customer_id: String,
    pub behavioral: BehavioralProfile,
    #[serde(default)]
    pub risk: RiskProfile,
}

impl CustomerProfile {
    /// Zero-history profile for callers that opt in to scoring unknown customers
    pub fn synthetic(customer_id: impl Into<String>) -> Self {
        Self {
            customer_id: customer_id.into(),
            behavioral: BehavioralProfile {
                avg_amount: 0.0,
                std_amount: 0.0,
                avg_transactions_per_day: 0.0,
                devices: Vec::new(),
                usual_locations: Vec::new(),
                common_merchant_categories: Vec::new(),
            },
            risk: RiskProfile::default(),
        }
    }
}

/// Risk level derived from the active model's thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// Classify a 0-100 score against flag/block thresholds
    pub fn classify(score: f64, flag: f64, block: f64) -> Self {
        if score >= block {
            Self::High
        } else if score >= flag {
            Self::Medium
        } else {
            Self::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Per-factor entry in the diagnostic breakdown
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorContribution {
    pub factor: String,
    pub triggered: bool,
    /// Points contributed to the composite score, zero when not triggered
    pub contribution: f64,
    pub detail: Option<String>,
}

/// Score breakdown for explainability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub customer_base_risk: f64,
    pub factors: Vec<FactorContribution>,
}

impl ScoreBreakdown {
    /// Contribution of a single factor, if it was evaluated
    pub fn contribution(&self, factor: &str) -> Option<f64> {
        self.factors
            .iter()
            .find(|f| f.factor == factor)
            .map(|f| f.contribution)
    }
}

/// A historical transaction returned by vector similarity search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarTransaction {
    pub transaction_id: String,
    pub timestamp: DateTime<Utc>,
    pub amount: f64,
    pub merchant_category: String,
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub flags: Vec<String>,
    /// Raw vector similarity, 0-1, higher is closer
    pub similarity: f64,
}

/// Similarity contribution attached to an assessment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilaritySignal {
    /// Aggregated similarity risk, 0-1
    pub score: f64,
    /// Top matches re-ranked for caller display
    pub matches: Vec<SimilarTransaction>,
}

impl SimilaritySignal {
    /// Empty signal used when similarity search is unavailable or found nothing
    pub fn empty() -> Self {
        Self {
            score: 0.0,
            matches: Vec::new(),
        }
    }
}

/// Result of evaluating a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    /// Composite risk score, 0-100
    pub score: f64,
    pub level: RiskLevel,
    /// Triggered flag identifiers in detector order
    pub flags: Vec<String>,
    pub breakdown: ScoreBreakdown,
    pub similarity: Option<SimilaritySignal>,
    /// Model version the transaction was evaluated with
    pub model_id: String,
    pub model_version: u32,
}

/// Transaction as persisted, with its assessment attached
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTransaction {
    pub transaction: Transaction,
    pub assessment: RiskAssessment,
    /// Embedding of the canonical text description, when one was computed
    pub embedding: Option<Vec<f32>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn sample_transaction() -> Transaction {
        Transaction {
            transaction_id: "tx-1".to_string(),
            customer_id: "cust-1".to_string(),
            timestamp: Utc::now(),
            amount: Decimal::new(22517, 2),
            currency: "USD".to_string(),
            merchant: Merchant {
                id: "m-1".to_string(),
                name: "Acme Foods".to_string(),
                category: "grocery".to_string(),
            },
            location: TransactionLocation {
                city: "New York".to_string(),
                state: "NY".to_string(),
                country: "US".to_string(),
                point: GeoPoint::new(40.7, -74.0),
            },
            device: DeviceInfo {
                device_id: "d-1".to_string(),
                kind: "mobile".to_string(),
                os: "iOS".to_string(),
                browser: "Safari".to_string(),
                ip: "10.0.0.1".to_string(),
            },
            kind: TransactionKind::Purchase,
            payment_method: "credit_card".to_string(),
            status: TransactionStatus::Completed,
        }
    }

    #[test]
    fn test_transaction_validate() {
        let tx = sample_transaction();
        assert!(tx.validate().is_ok());
        assert!((tx.amount_f64() - 225.17).abs() < 1e-9);

        let mut bad = sample_transaction();
        bad.customer_id.clear();
        assert!(bad.validate().is_err());

        let mut negative = sample_transaction();
        negative.amount = Decimal::new(-100, 0);
        assert!(negative.validate().is_err());
    }

    #[test]
    fn test_risk_level_classify() {
        assert_eq!(RiskLevel::classify(10.0, 60.0, 85.0), RiskLevel::Low);
        assert_eq!(RiskLevel::classify(60.0, 60.0, 85.0), RiskLevel::Medium);
        assert_eq!(RiskLevel::classify(85.0, 60.0, 85.0), RiskLevel::High);
        assert_eq!(RiskLevel::classify(100.0, 60.0, 85.0), RiskLevel::High);
    }

    #[test]
    fn test_synthetic_profile_has_no_history() {
        let profile = CustomerProfile::synthetic("cust-9");
        assert_eq!(profile.customer_id, "cust-9");
        assert_eq!(profile.behavioral.avg_amount, 0.0);
        assert!(profile.behavioral.devices.is_empty());
        assert_eq!(profile.risk.overall_score, 0.0);
    }

    #[test]
    fn test_breakdown_lookup() {
        let breakdown = ScoreBreakdown {
            customer_base_risk: 5.0,
            factors: vec![FactorContribution {
                factor: flags::UNKNOWN_DEVICE.to_string(),
                triggered: true,
                contribution: 35.0,
                detail: None,
            }],
        };
        assert_eq!(breakdown.contribution(flags::UNKNOWN_DEVICE), Some(35.0));
        assert_eq!(breakdown.contribution(flags::LOCATION_ANOMALY), None);
    }

    #[test]
    fn test_serde_round_trip() {
        let tx = sample_transaction();
        let json = serde_json::to_string(&tx).unwrap();
        let back: Transaction = serde_json::from_str(&json).unwrap();
        assert_eq!(tx, back);
    }
}
