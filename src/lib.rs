// src/lib.rs
//! Transaction risk evaluation engine
//!
//! Scores incoming financial transactions for fraud risk and manages the
//! versioned scoring models behind the scores. Rule-based anomaly detectors,
//! a similarity search over historical transactions and an atomically
//! swapped active-model cache feed a single composite assessment.

pub mod core;
pub mod detectors;
pub mod engine;
pub mod model;
pub mod similarity;
pub mod store;

pub use crate::core::config::EngineConfig;
pub use crate::core::errors::{Result, RiskEngineError};
pub use crate::core::types::{
    CustomerProfile, RiskAssessment, RiskLevel, SimilaritySignal, StoredTransaction, Transaction,
};
pub use crate::engine::{EvaluateOptions, EvaluationEngine};
pub use crate::model::{
    ActivationOutcome, BroadcasterHealth, ModelBroadcaster, ModelEvent, ModelStore, Timeframe,
};
pub use crate::similarity::SimilarityAggregator;
pub use crate::store::{HashEmbedding, MemoryStore};
