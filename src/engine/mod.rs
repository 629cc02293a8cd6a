//! Evaluation engine
//!
//! Orchestrates the anomaly detectors, the active risk model and the
//! similarity aggregator into a final risk assessment. Evaluations run
//! concurrently; the only serialized step is the per-customer profile
//! update after a high-risk result.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Duration as ChronoDuration;
use parking_lot::Mutex;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use crate::core::config::EngineConfig;
use crate::core::errors::{Result, RiskEngineError};
use crate::core::types::{
    flags, CustomerProfile, FactorContribution, RiskAssessment, RiskLevel, ScoreBreakdown,
    SimilaritySignal, StoredTransaction, Transaction,
};
use crate::detectors::{self, AmountBand, DetectorOutcome};
use crate::model::store::usage_record;
use crate::model::{ModelBroadcaster, ModelStore, RiskModelDocument};
use crate::similarity::SimilarityAggregator;
use crate::store::{CustomerStore, EmbeddingProvider, ProfileRiskUpdate, TransactionStore};

/// Per-call evaluation options
#[derive(Debug, Clone)]
pub struct EvaluateOptions {
    /// Score unknown customers against a synthetic zero-history profile
    /// instead of failing with NotFound. Explicit opt-in.
    pub allow_unknown_customer: bool,
    /// Update the customer's cached risk profile after a high-risk result
    pub apply_profile_update: bool,
    /// Append a performance record for the active model version
    pub record_usage: bool,
    /// Persist the transaction with its assessment attached
    pub persist_transaction: bool,
    /// Run the similarity aggregator when the store supports it
    pub with_similarity: bool,
}

impl Default for EvaluateOptions {
    fn default() -> Self {
        Self {
            allow_unknown_customer: false,
            apply_profile_update: true,
            record_usage: true,
            persist_transaction: false,
            with_similarity: true,
        }
    }
}

/// The engine's primary entry point
pub struct EvaluationEngine {
    customers: Arc<dyn CustomerStore>,
    transactions: Arc<dyn TransactionStore>,
    model_store: Arc<ModelStore>,
    broadcaster: Arc<ModelBroadcaster>,
    similarity: SimilarityAggregator,
    config: EngineConfig,
    /// Per-customer write locks serializing profile updates
    customer_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl EvaluationEngine {
    pub fn new(
        customers: Arc<dyn CustomerStore>,
        transactions: Arc<dyn TransactionStore>,
        embeddings: Arc<dyn EmbeddingProvider>,
        model_store: Arc<ModelStore>,
        broadcaster: Arc<ModelBroadcaster>,
        config: EngineConfig,
    ) -> Self {
        let similarity = SimilarityAggregator::new(
            embeddings,
            transactions.clone(),
            config.similarity.clone(),
        );
        Self {
            customers,
            transactions,
            model_store,
            broadcaster,
            similarity,
            config,
            customer_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Score a transaction against the active risk model.
    ///
    /// Individual detector failures are absorbed into the diagnostics; a
    /// missing active model is fatal to the evaluation.
    pub async fn evaluate(
        &self,
        transaction: &Transaction,
        opts: &EvaluateOptions,
    ) -> Result<RiskAssessment> {
        transaction.validate()?;
        let started = Instant::now();

        let profile = match self.customers.find_customer(&transaction.customer_id).await? {
            Some(profile) => profile,
            None if opts.allow_unknown_customer => {
                debug!(
                    customer_id = %transaction.customer_id,
                    "unknown customer, evaluating against synthetic profile"
                );
                CustomerProfile::synthetic(transaction.customer_id.clone())
            }
            None => {
                return Err(RiskEngineError::NotFound(format!(
                    "customer {} not found",
                    transaction.customer_id
                )))
            }
        };

        let model = self.broadcaster.active_model().ok_or_else(|| {
            RiskEngineError::ModelUnavailable("no active model in cache".to_string())
        })?;

        let (triggered, factors) = self.run_detectors(transaction, &profile, &model).await;

        let base_component = profile.risk.overall_score * self.config.scoring.base_risk_weight;
        let rule_score: f64 = base_component + factors.iter().map(|f| f.contribution).sum::<f64>();
        let mut score = rule_score.clamp(0.0, 100.0);

        // Similarity runs after the rule-based flags so its canonical text
        // can mention them; it is the one network-bound step and runs under
        // a timeout
        let similarity = if opts.with_similarity
            && self.config.similarity.enabled
            && self.transactions.supports_vector_search()
        {
            let budget = Duration::from_millis(self.config.similarity.timeout_ms);
            match timeout(budget, self.similarity.assess(transaction, &triggered)).await {
                Ok(signal) => Some(signal),
                Err(_) => {
                    warn!(
                        timeout_ms = self.config.similarity.timeout_ms,
                        "similarity assessment timed out, continuing on rule-based score"
                    );
                    Some(SimilaritySignal::empty())
                }
            }
        } else {
            None
        };

        if let Some(signal) = &similarity {
            score = blend(
                score,
                signal.score,
                self.config.similarity.blend_weight,
                self.config.similarity.blend_cap,
            );
        }

        let level = RiskLevel::classify(score, model.thresholds.flag, model.thresholds.block);

        let assessment = RiskAssessment {
            score,
            level,
            flags: triggered,
            breakdown: ScoreBreakdown {
                customer_base_risk: base_component,
                factors,
            },
            similarity,
            model_id: model.model_id.clone(),
            model_version: model.version,
        };

        let processing_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.apply_side_effects(transaction, &assessment, &model, processing_ms, opts)
            .await?;

        info!(
            transaction_id = %transaction.transaction_id,
            score = assessment.score,
            level = assessment.level.as_str(),
            flags = assessment.flags.len(),
            "transaction evaluated"
        );
        Ok(assessment)
    }

    /// Run every enabled detector, absorbing individual failures
    async fn run_detectors(
        &self,
        transaction: &Transaction,
        profile: &CustomerProfile,
        model: &RiskModelDocument,
    ) -> (Vec<String>, Vec<FactorContribution>) {
        let cfg = &self.config.detectors;
        let mut triggered = Vec::new();
        let mut factors = Vec::new();

        let mut record =
            |id: &str, outcome: DetectorOutcome, triggered: &mut Vec<String>, weight: f64| {
                let contribution = if outcome.triggered { weight } else { 0.0 };
                if outcome.triggered {
                    triggered.push(id.to_string());
                }
                factors.push(FactorContribution {
                    factor: id.to_string(),
                    triggered: outcome.triggered,
                    contribution,
                    detail: outcome.detail,
                });
            };

        // Amount bands are mutually exclusive; the highest firing band wins
        let high_active = model.factor_active(flags::AMOUNT_ANOMALY_HIGH);
        let medium_active = model.factor_active(flags::AMOUNT_ANOMALY_MEDIUM);
        let high_threshold = model.factor_param(
            flags::AMOUNT_ANOMALY_HIGH,
            "threshold",
            cfg.amount_high_threshold,
        );
        let medium_threshold = model.factor_param(
            flags::AMOUNT_ANOMALY_MEDIUM,
            "threshold",
            cfg.amount_medium_threshold,
        );
        let (band, z) = detectors::amount_band(
            transaction.amount_f64(),
            profile,
            high_threshold,
            medium_threshold,
            cfg.zero_std_epsilon,
        );
        let z_detail = format!("z-score {:.2}", z);
        match band {
            AmountBand::High if high_active => record(
                flags::AMOUNT_ANOMALY_HIGH,
                DetectorOutcome::triggered(z_detail.clone()),
                &mut triggered,
                model.weight(flags::AMOUNT_ANOMALY_HIGH),
            ),
            AmountBand::Medium if medium_active => record(
                flags::AMOUNT_ANOMALY_MEDIUM,
                DetectorOutcome::triggered(z_detail.clone()),
                &mut triggered,
                model.weight(flags::AMOUNT_ANOMALY_MEDIUM),
            ),
            _ => record(
                flags::AMOUNT_ANOMALY_HIGH,
                DetectorOutcome::clear_with(z_detail.clone()),
                &mut triggered,
                0.0,
            ),
        }

        if model.factor_active(flags::LOCATION_ANOMALY) {
            let threshold = model.factor_param(
                flags::LOCATION_ANOMALY,
                "distance_threshold",
                cfg.location_distance_km,
            );
            let outcome =
                match detectors::location_anomaly(transaction.location.point, profile, threshold) {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!(
                            transaction_id = %transaction.transaction_id,
                            error = %e,
                            "location detector failed, contributing zero"
                        );
                        detectors::detector_failure(&e)
                    }
                };
            record(
                flags::LOCATION_ANOMALY,
                outcome,
                &mut triggered,
                model.weight(flags::LOCATION_ANOMALY),
            );
        }

        if model.factor_active(flags::UNKNOWN_DEVICE) {
            let outcome = detectors::device_verification(&transaction.device, profile);
            record(
                flags::UNKNOWN_DEVICE,
                outcome,
                &mut triggered,
                model.weight(flags::UNKNOWN_DEVICE),
            );
        }

        if model.factor_active(flags::VELOCITY_ANOMALY) {
            let threshold = model.factor_param(
                flags::VELOCITY_ANOMALY,
                "threshold",
                cfg.velocity_threshold as f64,
            ) as u64;
            let window_start =
                transaction.timestamp - ChronoDuration::minutes(cfg.velocity_window_minutes);
            let outcome = match self
                .transactions
                .count_customer_transactions(
                    &transaction.customer_id,
                    window_start,
                    transaction.timestamp,
                )
                .await
            {
                Ok(count) => detectors::velocity_anomaly(count, threshold),
                Err(e) => {
                    warn!(
                        transaction_id = %transaction.transaction_id,
                        error = %e,
                        "velocity detector failed, contributing zero"
                    );
                    detectors::detector_failure(&e)
                }
            };
            record(
                flags::VELOCITY_ANOMALY,
                outcome,
                &mut triggered,
                model.weight(flags::VELOCITY_ANOMALY),
            );
        }

        if model.factor_active(flags::MERCHANT_CATEGORY_ANOMALY) {
            let outcome =
                detectors::merchant_category_anomaly(&transaction.merchant.category, profile);
            record(
                flags::MERCHANT_CATEGORY_ANOMALY,
                outcome,
                &mut triggered,
                model.weight(flags::MERCHANT_CATEGORY_ANOMALY),
            );
        }

        (triggered, factors)
    }

    async fn apply_side_effects(
        &self,
        transaction: &Transaction,
        assessment: &RiskAssessment,
        model: &RiskModelDocument,
        processing_ms: f64,
        opts: &EvaluateOptions,
    ) -> Result<()> {
        if assessment.level == RiskLevel::High && opts.apply_profile_update {
            let lock = self.customer_lock(&transaction.customer_id);
            let _guard = lock.lock().await;

            let update = ProfileRiskUpdate {
                flags: assessment.flags.clone(),
                score_increment: assessment.flags.len() as f64
                    * self.config.scoring.profile_risk_increment_per_flag,
                assessed_at: transaction.timestamp,
            };
            match self
                .customers
                .apply_risk_update(&transaction.customer_id, &update)
                .await
            {
                Ok(()) => debug!(
                    customer_id = %transaction.customer_id,
                    "customer risk profile updated after high-risk evaluation"
                ),
                // A synthetic profile has no stored document to update
                Err(RiskEngineError::NotFound(_)) if opts.allow_unknown_customer => {}
                Err(e) => return Err(e),
            }
        }

        if opts.record_usage {
            let record = usage_record(
                model,
                &transaction.transaction_id,
                &transaction.customer_id,
                assessment.score,
                assessment.flags.clone(),
                processing_ms,
            );
            if let Err(e) = self.model_store.record_usage(record).await {
                warn!(error = %e, "failed to append performance record");
            }
        }

        if opts.persist_transaction {
            let stored = StoredTransaction {
                transaction: transaction.clone(),
                assessment: assessment.clone(),
                embedding: None,
            };
            self.transactions.insert_transaction(&stored).await?;
        }

        Ok(())
    }

    fn customer_lock(&self, customer_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.customer_locks.lock();
        locks
            .entry(customer_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

/// Fold the similarity sub-score into the rule-based composite.
///
/// The boost only ever raises the score, scaled by the blend weight and
/// capped so one noisy match cannot dominate the rules.
fn blend(rule_score: f64, similarity_score: f64, weight: f64, cap: f64) -> f64 {
    let similarity_scaled = similarity_score * 100.0;
    if similarity_scaled <= rule_score {
        return rule_score;
    }
    let boost = ((similarity_scaled - rule_score) * weight).min(cap);
    (rule_score + boost).clamp(0.0, 100.0)
}
