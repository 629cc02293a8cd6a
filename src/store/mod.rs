//! Document store and embedding provider abstractions
//!
//! The engine consumes persistence and embeddings through these narrow
//! traits. Backends map them onto a document database; `memory` ships an
//! in-process backend for tests and local runs.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::core::errors::Result;
use crate::core::types::{CustomerProfile, SimilarTransaction, StoredTransaction};
use crate::model::{FeedbackOutcome, ModelStatus, PerformanceRecord, RiskModelDocument};

pub use memory::{HashEmbedding, MemoryStore};

/// Customer collection access
#[async_trait]
pub trait CustomerStore: Send + Sync {
    async fn find_customer(&self, customer_id: &str) -> Result<Option<CustomerProfile>>;

    async fn insert_customer(&self, profile: &CustomerProfile) -> Result<()>;

    /// Apply a risk-profile update produced by a high-risk evaluation.
    ///
    /// Callers serialize invocations per customer; the store only has to
    /// apply the update, not referee concurrent writers.
    async fn apply_risk_update(&self, customer_id: &str, update: &ProfileRiskUpdate)
        -> Result<()>;
}

/// Risk-profile delta applied after a high-risk evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileRiskUpdate {
    /// Flags merged into the customer's accumulated risk factor set
    pub flags: Vec<String>,
    /// Added to the cached overall risk score, result capped at 100
    pub score_increment: f64,
    pub assessed_at: DateTime<Utc>,
}

/// Transaction collection access, including vector similarity search
#[async_trait]
pub trait TransactionStore: Send + Sync {
    async fn insert_transaction(&self, stored: &StoredTransaction) -> Result<()>;

    async fn find_transaction(&self, transaction_id: &str) -> Result<Option<StoredTransaction>>;

    /// Count a customer's transactions in the half-open window `[from, to)`
    async fn count_customer_transactions(
        &self,
        customer_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<u64>;

    /// Whether a vector search index is available on this connection.
    ///
    /// Probed once per connection; the aggregator degrades to rule-based
    /// scoring when this returns false.
    fn supports_vector_search(&self) -> bool;

    /// Nearest historical transactions by vector distance, best first
    async fn vector_search(
        &self,
        query: &[f32],
        num_candidates: usize,
        limit: usize,
    ) -> Result<Vec<SimilarTransaction>>;
}

/// Change feed operation type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Insert,
    Update,
    Replace,
    Delete,
}

/// Identity of a model version document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelKey {
    pub model_id: String,
    pub version: u32,
}

/// One change feed event from the model collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelChange {
    pub operation: ChangeOperation,
    /// Full document for insert/update/replace
    pub document: Option<RiskModelDocument>,
    /// Document key for deletes
    pub document_key: Option<ModelKey>,
    pub at: DateTime<Utc>,
}

/// Result of a conditional feedback write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackWrite {
    Applied,
    AlreadySet,
    RecordMissing,
}

/// Model collection and performance record access
#[async_trait]
pub trait ModelRepository: Send + Sync {
    async fn insert_model(&self, doc: &RiskModelDocument) -> Result<()>;

    async fn find_version(&self, model_id: &str, version: u32)
        -> Result<Option<RiskModelDocument>>;

    /// All versions of one model id, any status, ascending by version
    async fn find_versions(&self, model_id: &str) -> Result<Vec<RiskModelDocument>>;

    /// Versions of one model id with the given status
    async fn find_with_status(
        &self,
        model_id: &str,
        status: ModelStatus,
    ) -> Result<Vec<RiskModelDocument>>;

    /// Models across all ids, optionally filtered by status, most recently
    /// updated first
    async fn list_models(
        &self,
        status: Option<ModelStatus>,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<RiskModelDocument>>;

    /// Replace the full document matched by (model_id, version).
    /// Returns false when no such version exists.
    async fn replace_version(&self, doc: &RiskModelDocument) -> Result<bool>;

    /// Compare-and-swap a version's status. Returns true only when the
    /// observed status matched `expected` and the transition was applied.
    async fn set_status_if(
        &self,
        model_id: &str,
        version: u32,
        expected: ModelStatus,
        new: ModelStatus,
        updated_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Subscribe to the model collection change feed
    async fn watch_models(&self) -> Result<broadcast::Receiver<ModelChange>>;

    async fn insert_performance_record(&self, record: &PerformanceRecord) -> Result<()>;

    async fn find_performance_records(
        &self,
        model_id: &str,
        version: u32,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<PerformanceRecord>>;

    /// Set a record's outcome exactly once
    async fn set_feedback_if_unset(
        &self,
        model_id: &str,
        transaction_id: &str,
        outcome: FeedbackOutcome,
        at: DateTime<Utc>,
    ) -> Result<FeedbackWrite>;
}

/// External embedding provider
///
/// Treated as an opaque, potentially slow, potentially failing call. Its
/// failure must never abort rule-based evaluation.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}
