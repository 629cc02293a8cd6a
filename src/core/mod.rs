//! Core domain types, configuration and errors

pub mod config;
pub mod errors;
pub mod geo;
pub mod types;

pub use config::EngineConfig;
pub use errors::{Result, RiskEngineError};
pub use geo::{haversine_km, GeoPoint};
pub use types::{
    CustomerProfile, RiskAssessment, RiskLevel, SimilarTransaction, SimilaritySignal,
    StoredTransaction, Transaction,
};
