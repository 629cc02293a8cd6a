//! Shared test harness: in-memory store, activated default model, engine.
#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use risk_engine::core::config::{BroadcasterConfig, EngineConfig};
use risk_engine::core::geo::GeoPoint;
use risk_engine::core::types::{
    BehavioralProfile, CustomerProfile, DeviceInfo, KnownDevice, Merchant, RiskAssessment,
    RiskLevel, RiskProfile, ScoreBreakdown, StoredTransaction, Transaction, TransactionKind,
    TransactionLocation, TransactionStatus, UsualLocation,
};
use risk_engine::model::{RiskModelDocument, RiskModelSpec};
use risk_engine::store::CustomerStore;
use risk_engine::{EvaluationEngine, HashEmbedding, MemoryStore, ModelBroadcaster, ModelStore};

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub model_store: Arc<ModelStore>,
    pub broadcaster: Arc<ModelBroadcaster>,
    pub engine: Arc<EvaluationEngine>,
    pub config: EngineConfig,
}

/// Default model spec under the id used by `RiskModelDocument::default_model`
pub fn default_spec() -> RiskModelSpec {
    let base = RiskModelDocument::default_model();
    RiskModelSpec {
        model_id: base.model_id,
        description: base.description,
        weights: base.weights,
        thresholds: base.thresholds,
        risk_factors: base.risk_factors,
    }
}

/// Customer with a firm behavioral baseline: avg $50 / std $10, device D1,
/// usual location New York, groceries only.
pub fn baseline_customer(customer_id: &str) -> CustomerProfile {
    CustomerProfile {
        customer_id: customer_id.to_string(),
        behavioral: BehavioralProfile {
            avg_amount: 50.0,
            std_amount: 10.0,
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
                frequency: 0.9,
            }],
            common_merchant_categories: vec!["grocery".to_string()],
        },
        risk: RiskProfile::default(),
    }
}

pub struct TransactionBuilder {
    tx: Transaction,
}

impl TransactionBuilder {
    pub fn new(transaction_id: &str, customer_id: &str) -> Self {
        Self {
            tx: Transaction {
                transaction_id: transaction_id.to_string(),
                customer_id: customer_id.to_string(),
                timestamp: Utc::now(),
                amount: Decimal::new(5000, 2),
                currency: "USD".to_string(),
                merchant: Merchant {
                    id: "m-1".to_string(),
                    name: "Corner Grocery".to_string(),
                    category: "grocery".to_string(),
                },
                location: TransactionLocation {
                    city: "New York".to_string(),
                    state: "NY".to_string(),
                    country: "US".to_string(),
                    point: GeoPoint::new(40.7, -74.0),
                },
                device: DeviceInfo {
                    device_id: "D1".to_string(),
                    kind: "mobile".to_string(),
                    os: "iOS".to_string(),
                    browser: "Safari".to_string(),
                    ip: "10.0.0.1".to_string(),
                },
                kind: TransactionKind::Purchase,
                payment_method: "credit_card".to_string(),
                status: TransactionStatus::Completed,
            },
        }
    }

    pub fn amount(mut self, units: i64) -> Self {
        self.tx.amount = Decimal::new(units * 100, 2);
        self
    }

    pub fn device(mut self, device_id: &str) -> Self {
        self.tx.device.device_id = device_id.to_string();
        self
    }

    pub fn location(mut self, lat: f64, lon: f64) -> Self {
        self.tx.location.point = GeoPoint::new(lat, lon);
        self
    }

    pub fn category(mut self, category: &str) -> Self {
        self.tx.merchant.category = category.to_string();
        self
    }

    pub fn timestamp(mut self, at: DateTime<Utc>) -> Self {
        self.tx.timestamp = at;
        self
    }

    pub fn build(self) -> Transaction {
        self.tx
    }
}

/// A persisted historical transaction with a fixed assessment, embedded from
/// its canonical text so vector search finds it.
pub async fn stored_transaction(
    transaction: Transaction,
    score: f64,
    level: RiskLevel,
    flags: Vec<String>,
) -> StoredTransaction {
    use risk_engine::store::EmbeddingProvider;
    use risk_engine::SimilarityAggregator;

    let embedding = HashEmbedding::default()
        .embed(&SimilarityAggregator::canonical_text(&transaction, &[]))
        .await
        .unwrap();
    let model = RiskModelDocument::default_model();
    StoredTransaction {
        assessment: RiskAssessment {
            score,
            level,
            flags,
            breakdown: ScoreBreakdown {
                customer_base_risk: 0.0,
                factors: Vec::new(),
            },
            similarity: None,
            model_id: model.model_id,
            model_version: model.version,
        },
        transaction,
        embedding: Some(embedding),
    }
}

/// Harness with an activated default model and a seeded baseline customer
pub async fn harness() -> Harness {
    harness_with(MemoryStore::new(), true).await
}

pub async fn harness_without_vector_search() -> Harness {
    harness_with(MemoryStore::without_vector_search(), true).await
}

pub async fn harness_without_model() -> Harness {
    harness_with(MemoryStore::new(), false).await
}

async fn harness_with(store: MemoryStore, activate_model: bool) -> Harness {
    let store = Arc::new(store);
    let mut config = EngineConfig::default();
    config.broadcaster = BroadcasterConfig {
        fanout_capacity: 64,
        heartbeat_secs: 1,
        reconnect_base_ms: 10,
        reconnect_max_ms: 100,
    };

    let model_store = Arc::new(ModelStore::new(store.clone(), config.model_store.clone()));
    if activate_model {
        model_store.create(default_spec()).await.unwrap();
        model_store
            .activate("default-risk-model", None)
            .await
            .unwrap();
    }

    let broadcaster = ModelBroadcaster::new(store.clone(), config.broadcaster.clone());
    broadcaster.start().await.unwrap();

    store
        .insert_customer(&baseline_customer("cust-1"))
        .await
        .unwrap();

    let engine = Arc::new(EvaluationEngine::new(
        store.clone(),
        store.clone(),
        Arc::new(HashEmbedding::default()),
        model_store.clone(),
        broadcaster.clone(),
        config.clone(),
    ));

    Harness {
        store,
        model_store,
        broadcaster,
        engine,
        config,
    }
}
