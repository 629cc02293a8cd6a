//! In-memory store backend
//!
//! Deterministic backend used by tests and local runs: brute-force cosine
//! vector search over stored embeddings, a broadcast-based change feed and a
//! hash-derived embedding provider.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use tracing::debug;

use crate::core::errors::{Result, RiskEngineError};
use crate::core::types::{CustomerProfile, SimilarTransaction, StoredTransaction};
use crate::model::{FeedbackOutcome, ModelStatus, PerformanceRecord, RiskModelDocument};
use crate::store::{
    ChangeOperation, CustomerStore, EmbeddingProvider, FeedbackWrite, ModelChange, ModelKey,
    ModelRepository, ProfileRiskUpdate, TransactionStore,
};

const CHANGE_FEED_CAPACITY: usize = 256;

/// In-memory document store
pub struct MemoryStore {
    customers: RwLock<HashMap<String, CustomerProfile>>,
    transactions: RwLock<Vec<StoredTransaction>>,
    models: RwLock<Vec<RiskModelDocument>>,
    performance: RwLock<Vec<PerformanceRecord>>,
    changes: broadcast::Sender<ModelChange>,
    vector_search_enabled: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            customers: RwLock::new(HashMap::new()),
            transactions: RwLock::new(Vec::new()),
            models: RwLock::new(Vec::new()),
            performance: RwLock::new(Vec::new()),
            changes,
            vector_search_enabled: true,
        }
    }

    /// A store whose connection has no vector search index
    pub fn without_vector_search() -> Self {
        Self {
            vector_search_enabled: false,
            ..Self::new()
        }
    }

    fn publish(&self, operation: ChangeOperation, document: &RiskModelDocument) {
        let change = ModelChange {
            operation,
            document: Some(document.clone()),
            document_key: Some(ModelKey {
                model_id: document.model_id.clone(),
                version: document.version,
            }),
            at: Utc::now(),
        };
        // No subscribers is fine; the feed is best-effort
        let _ = self.changes.send(change);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CustomerStore for MemoryStore {
    async fn find_customer(&self, customer_id: &str) -> Result<Option<CustomerProfile>> {
        Ok(self.customers.read().get(customer_id).cloned())
    }

    async fn insert_customer(&self, profile: &CustomerProfile) -> Result<()> {
        self.customers
            .write()
            .insert(profile.customer_id.clone(), profile.clone());
        Ok(())
    }

    async fn apply_risk_update(
        &self,
        customer_id: &str,
        update: &ProfileRiskUpdate,
    ) -> Result<()> {
        let mut customers = self.customers.write();
        let profile = customers.get_mut(customer_id).ok_or_else(|| {
            RiskEngineError::NotFound(format!("customer {} not found", customer_id))
        })?;

        profile.risk.overall_score =
            (profile.risk.overall_score + update.score_increment).min(100.0);
        profile.risk.last_assessment = Some(update.assessed_at);
        for flag in &update.flags {
            if !profile.risk.risk_factors.contains(flag) {
                profile.risk.risk_factors.push(flag.clone());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TransactionStore for MemoryStore {
    async fn insert_transaction(&self, stored: &StoredTransaction) -> Result<()> {
        self.transactions.write().push(stored.clone());
        Ok(())
    }

    async fn find_transaction(&self, transaction_id: &str) -> Result<Option<StoredTransaction>> {
        Ok(self
            .transactions
            .read()
            .iter()
            .find(|t| t.transaction.transaction_id == transaction_id)
            .cloned())
    }

    async fn count_customer_transactions(
        &self,
        customer_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<u64> {
        let count = self
            .transactions
            .read()
            .iter()
            .filter(|t| {
                t.transaction.customer_id == customer_id
                    && t.transaction.timestamp >= from
                    && t.transaction.timestamp < to
            })
            .count();
        Ok(count as u64)
    }

    fn supports_vector_search(&self) -> bool {
        self.vector_search_enabled
    }

    async fn vector_search(
        &self,
        query: &[f32],
        num_candidates: usize,
        limit: usize,
    ) -> Result<Vec<SimilarTransaction>> {
        if !self.vector_search_enabled {
            return Err(RiskEngineError::Upstream(
                "vector search index unavailable".to_string(),
            ));
        }

        let transactions = self.transactions.read();
        let matches: Vec<SimilarTransaction> = transactions
            .iter()
            .filter_map(|t| {
                let embedding = t.embedding.as_ref()?;
                let similarity = cosine_score(query, embedding);
                Some(SimilarTransaction {
                    transaction_id: t.transaction.transaction_id.clone(),
                    timestamp: t.transaction.timestamp,
                    amount: t.transaction.amount_f64(),
                    merchant_category: t.transaction.merchant.category.clone(),
                    risk_score: t.assessment.score,
                    risk_level: t.assessment.level,
                    flags: t.assessment.flags.clone(),
                    similarity,
                })
            })
            .sorted_by(|a, b| b.similarity.total_cmp(&a.similarity))
            .take(num_candidates.max(limit))
            .collect();

        debug!(
            candidates = matches.len(),
            limit, "in-memory vector search completed"
        );
        Ok(matches.into_iter().take(limit).collect())
    }
}

#[async_trait]
impl ModelRepository for MemoryStore {
    async fn insert_model(&self, doc: &RiskModelDocument) -> Result<()> {
        {
            let mut models = self.models.write();
            if models
                .iter()
                .any(|m| m.model_id == doc.model_id && m.version == doc.version)
            {
                return Err(RiskEngineError::Conflict(format!(
                    "model {} version {} already exists",
                    doc.model_id, doc.version
                )));
            }
            models.push(doc.clone());
        }
        self.publish(ChangeOperation::Insert, doc);
        Ok(())
    }

    async fn find_version(
        &self,
        model_id: &str,
        version: u32,
    ) -> Result<Option<RiskModelDocument>> {
        Ok(self
            .models
            .read()
            .iter()
            .find(|m| m.model_id == model_id && m.version == version)
            .cloned())
    }

    async fn find_versions(&self, model_id: &str) -> Result<Vec<RiskModelDocument>> {
        Ok(self
            .models
            .read()
            .iter()
            .filter(|m| m.model_id == model_id)
            .cloned()
            .sorted_by_key(|m| m.version)
            .collect())
    }

    async fn find_with_status(
        &self,
        model_id: &str,
        status: ModelStatus,
    ) -> Result<Vec<RiskModelDocument>> {
        Ok(self
            .models
            .read()
            .iter()
            .filter(|m| m.model_id == model_id && m.status == status)
            .cloned()
            .sorted_by_key(|m| m.version)
            .collect())
    }

    async fn list_models(
        &self,
        status: Option<ModelStatus>,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<RiskModelDocument>> {
        Ok(self
            .models
            .read()
            .iter()
            .filter(|m| status.map(|s| m.status == s).unwrap_or(true))
            .cloned()
            .sorted_by(|a, b| b.updated_at.cmp(&a.updated_at))
            .skip(skip)
            .take(limit)
            .collect())
    }

    async fn replace_version(&self, doc: &RiskModelDocument) -> Result<bool> {
        let replaced = {
            let mut models = self.models.write();
            match models
                .iter_mut()
                .find(|m| m.model_id == doc.model_id && m.version == doc.version)
            {
                Some(slot) => {
                    *slot = doc.clone();
                    true
                }
                None => false,
            }
        };
        if replaced {
            self.publish(ChangeOperation::Replace, doc);
        }
        Ok(replaced)
    }

    async fn set_status_if(
        &self,
        model_id: &str,
        version: u32,
        expected: ModelStatus,
        new: ModelStatus,
        updated_at: DateTime<Utc>,
    ) -> Result<bool> {
        let updated = {
            let mut models = self.models.write();
            match models
                .iter_mut()
                .find(|m| m.model_id == model_id && m.version == version && m.status == expected)
            {
                Some(doc) => {
                    doc.status = new;
                    doc.updated_at = updated_at;
                    Some(doc.clone())
                }
                None => None,
            }
        };
        match updated {
            Some(doc) => {
                self.publish(ChangeOperation::Update, &doc);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn watch_models(&self) -> Result<broadcast::Receiver<ModelChange>> {
        Ok(self.changes.subscribe())
    }

    async fn insert_performance_record(&self, record: &PerformanceRecord) -> Result<()> {
        self.performance.write().push(record.clone());
        Ok(())
    }

    async fn find_performance_records(
        &self,
        model_id: &str,
        version: u32,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<PerformanceRecord>> {
        Ok(self
            .performance
            .read()
            .iter()
            .filter(|r| {
                r.model_id == model_id
                    && r.model_version == version
                    && since.map(|s| r.timestamp >= s).unwrap_or(true)
            })
            .cloned()
            .collect())
    }

    async fn set_feedback_if_unset(
        &self,
        model_id: &str,
        transaction_id: &str,
        outcome: FeedbackOutcome,
        at: DateTime<Utc>,
    ) -> Result<FeedbackWrite> {
        let mut records = self.performance.write();
        let record = records
            .iter_mut()
            .find(|r| r.model_id == model_id && r.transaction_id == transaction_id);
        match record {
            None => Ok(FeedbackWrite::RecordMissing),
            Some(r) if r.outcome != FeedbackOutcome::Unknown => Ok(FeedbackWrite::AlreadySet),
            Some(r) => {
                r.outcome = outcome;
                r.feedback_at = Some(at);
                Ok(FeedbackWrite::Applied)
            }
        }
    }
}

/// Cosine similarity mapped onto the 0-1 vector search score convention
fn cosine_score(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    let cosine = dot / (norm_a.sqrt() * norm_b.sqrt());
    ((1.0 + cosine) / 2.0).clamp(0.0, 1.0)
}

/// Deterministic embedding provider derived from a SHA-256 digest chain
///
/// Stands in for the external embedding service in tests and local runs:
/// identical text always produces the identical unit-length vector.
pub struct HashEmbedding {
    dim: usize,
}

impl HashEmbedding {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

impl Default for HashEmbedding {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let seed = Sha256::digest(text.as_bytes());
        let mut values = Vec::with_capacity(self.dim);
        let mut counter: u32 = 0;

        while values.len() < self.dim {
            let mut hasher = Sha256::new();
            hasher.update(seed);
            hasher.update(counter.to_le_bytes());
            let block = hasher.finalize();

            for chunk in block.chunks_exact(4) {
                if values.len() == self.dim {
                    break;
                }
                let raw = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                // Map to [-1, 1]
                values.push((f64::from(raw) / f64::from(u32::MAX) * 2.0 - 1.0) as f32);
            }
            counter += 1;
        }

        let norm: f32 = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut values {
                *v /= norm;
            }
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_customer_round_trip() {
        let store = MemoryStore::new();
        let profile = CustomerProfile::synthetic("cust-1");
        store.insert_customer(&profile).await.unwrap();

        let found = store.find_customer("cust-1").await.unwrap();
        assert_eq!(found, Some(profile));
        assert!(store.find_customer("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_risk_update_caps_score_and_merges_flags() {
        let store = MemoryStore::new();
        let mut profile = CustomerProfile::synthetic("cust-1");
        profile.risk.overall_score = 95.0;
        profile.risk.risk_factors = vec!["unknown_device".to_string()];
        store.insert_customer(&profile).await.unwrap();

        let update = ProfileRiskUpdate {
            flags: vec!["unknown_device".to_string(), "velocity_anomaly".to_string()],
            score_increment: 10.0,
            assessed_at: Utc::now(),
        };
        store.apply_risk_update("cust-1", &update).await.unwrap();

        let updated = store.find_customer("cust-1").await.unwrap().unwrap();
        assert_eq!(updated.risk.overall_score, 100.0);
        assert_eq!(
            updated.risk.risk_factors,
            vec!["unknown_device".to_string(), "velocity_anomaly".to_string()]
        );
        assert!(updated.risk.last_assessment.is_some());
    }

    #[tokio::test]
    async fn test_model_insert_publishes_change() {
        let store = MemoryStore::new();
        let mut rx = store.watch_models().await.unwrap();

        let model = RiskModelDocument::default_model();
        store.insert_model(&model).await.unwrap();

        let change = rx.recv().await.unwrap();
        assert_eq!(change.operation, ChangeOperation::Insert);
        assert_eq!(
            change.document.unwrap().model_id,
            "default-risk-model".to_string()
        );
    }

    #[tokio::test]
    async fn test_duplicate_version_rejected() {
        let store = MemoryStore::new();
        let model = RiskModelDocument::default_model();
        store.insert_model(&model).await.unwrap();
        assert!(matches!(
            store.insert_model(&model).await,
            Err(RiskEngineError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_set_status_if_is_conditional() {
        let store = MemoryStore::new();
        let model = RiskModelDocument::default_model();
        store.insert_model(&model).await.unwrap();

        // Wrong expected status: no-op
        let moved = store
            .set_status_if(
                &model.model_id,
                1,
                ModelStatus::Active,
                ModelStatus::Inactive,
                Utc::now(),
            )
            .await
            .unwrap();
        assert!(!moved);

        let moved = store
            .set_status_if(
                &model.model_id,
                1,
                ModelStatus::Draft,
                ModelStatus::Active,
                Utc::now(),
            )
            .await
            .unwrap();
        assert!(moved);

        let doc = store.find_version(&model.model_id, 1).await.unwrap().unwrap();
        assert_eq!(doc.status, ModelStatus::Active);
    }

    #[tokio::test]
    async fn test_hash_embedding_is_deterministic_and_normalized() {
        let provider = HashEmbedding::default();
        let a = provider.embed("purchase of 100 USD").await.unwrap();
        let b = provider.embed("purchase of 100 USD").await.unwrap();
        let c = provider.embed("withdrawal of 900 EUR").await.unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);

        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_cosine_score_bounds() {
        let a = vec![1.0f32, 0.0];
        let b = vec![1.0f32, 0.0];
        let opposite = vec![-1.0f32, 0.0];

        assert!((cosine_score(&a, &b) - 1.0).abs() < 1e-9);
        assert!(cosine_score(&a, &opposite).abs() < 1e-9);
        assert_eq!(cosine_score(&a, &[1.0]), 0.0);
    }
}
