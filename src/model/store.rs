//! Model store and versioning protocol
//!
//! Lifecycle per model id: draft -> active -> inactive, with archive and
//! restore off to the side. Exactly one version may be active at a time per
//! model id; activation deactivates every sibling as one consistent
//! transition, retried until the store is observed consistent.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::config::ModelStoreConfig;
use crate::core::errors::{Result, RiskEngineError};
use crate::model::{
    FeedbackOutcome, ModelPerformance, ModelStatus, PerformanceRecord, PerformanceReport,
    RiskModelDocument, RiskModelPatch, RiskModelSpec,
};
use crate::store::{FeedbackWrite, ModelRepository};

/// Aggregation window for performance reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Timeframe {
    Day,
    Week,
    Month,
    All,
}

impl Timeframe {
    /// Start of the window relative to `now`, None for the full history
    pub fn since(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Day => Some(now - chrono::Duration::hours(24)),
            Self::Week => Some(now - chrono::Duration::days(7)),
            Self::Month => Some(now - chrono::Duration::days(30)),
            Self::All => None,
        }
    }
}

/// Result of an activation request
#[derive(Debug, Clone, PartialEq)]
pub enum ActivationOutcome {
    /// The transition was applied; this is the now-active document
    Activated(RiskModelDocument),
    /// The target was already active; nothing changed
    AlreadyActive(RiskModelDocument),
}

/// Side-by-side performance comparison of two models
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelComparison {
    pub timeframe: Timeframe,
    pub left: PerformanceReport,
    pub right: PerformanceReport,
    /// left minus right, for metrics present on both sides
    pub differences: BTreeMap<String, f64>,
}

/// Manages versioned risk models against the document store
pub struct ModelStore {
    repo: Arc<dyn ModelRepository>,
    config: ModelStoreConfig,
}

impl ModelStore {
    pub fn new(repo: Arc<dyn ModelRepository>, config: ModelStoreConfig) -> Self {
        Self { repo, config }
    }

    pub fn repository(&self) -> Arc<dyn ModelRepository> {
        self.repo.clone()
    }

    /// Create version 1 of a new model, in draft
    pub async fn create(&self, spec: RiskModelSpec) -> Result<RiskModelDocument> {
        let existing = self.repo.find_versions(&spec.model_id).await?;
        if !existing.is_empty() {
            return Err(RiskEngineError::Conflict(format!(
                "model {} already exists",
                spec.model_id
            )));
        }

        let now = Utc::now();
        let doc = RiskModelDocument {
            model_id: spec.model_id,
            version: 1,
            status: ModelStatus::Draft,
            description: spec.description,
            weights: spec.weights,
            thresholds: spec.thresholds,
            risk_factors: spec.risk_factors,
            performance: ModelPerformance::default(),
            created_at: now,
            updated_at: now,
        };
        doc.validate()?;
        self.repo.insert_model(&doc).await?;

        info!(model_id = %doc.model_id, "created risk model");
        Ok(doc)
    }

    /// Update the latest non-archived version of a model.
    ///
    /// An active target is never mutated in place: the patch is merged over
    /// the active document into a new draft version, preserving the audit
    /// trail of anything that was ever live. Non-active targets are updated
    /// in place.
    pub async fn update(&self, model_id: &str, patch: RiskModelPatch) -> Result<RiskModelDocument> {
        if patch.status == Some(ModelStatus::Active) {
            return Err(RiskEngineError::Validation(
                "use activate to make a model version active".to_string(),
            ));
        }

        let versions = self.repo.find_versions(model_id).await?;
        let target = versions
            .iter()
            .filter(|m| m.status != ModelStatus::Archived)
            .max_by_key(|m| m.version)
            .cloned()
            .ok_or_else(|| {
                RiskEngineError::NotFound(format!("risk model {} not found", model_id))
            })?;
        let max_version = versions.iter().map(|m| m.version).max().unwrap_or(0);

        let now = Utc::now();
        if target.status == ModelStatus::Active {
            let mut next = target.clone();
            next.version = max_version + 1;
            next.status = ModelStatus::Draft;
            next.updated_at = now;
            next.performance = ModelPerformance::default();
            apply_patch(&mut next, patch);
            next.validate()?;
            self.repo.insert_model(&next).await?;

            info!(
                model_id,
                version = next.version,
                "active model updated into new draft version"
            );
            Ok(next)
        } else {
            let mut updated = target.clone();
            updated.updated_at = now;
            apply_patch(&mut updated, patch);
            updated.validate()?;
            if !self.repo.replace_version(&updated).await? {
                return Err(RiskEngineError::Storage(format!(
                    "version {} of model {} disappeared during update",
                    updated.version, model_id
                )));
            }
            debug!(model_id, version = updated.version, "model updated in place");
            Ok(updated)
        }
    }

    /// Activate a version, deactivating all siblings of the same model id.
    ///
    /// Without an explicit version the latest non-archived version is
    /// selected. Reports a no-op when the target is already active. The
    /// deactivate-and-activate transition is driven by a compare-and-swap
    /// loop verified after each pass, bounded by the configured retry budget.
    pub async fn activate(
        &self,
        model_id: &str,
        version: Option<u32>,
    ) -> Result<ActivationOutcome> {
        let target = self.resolve_version(model_id, version).await?;

        if target.status == ModelStatus::Archived {
            return Err(RiskEngineError::Validation(format!(
                "cannot activate archived version {} of model {}",
                target.version, model_id
            )));
        }
        if target.status == ModelStatus::Active {
            return Ok(ActivationOutcome::AlreadyActive(target));
        }

        for attempt in 1..=self.config.activation_retry_budget {
            let now = Utc::now();

            // Deactivate every active sibling
            let active = self
                .repo
                .find_with_status(model_id, ModelStatus::Active)
                .await?;
            for sibling in active.iter().filter(|m| m.version != target.version) {
                self.repo
                    .set_status_if(
                        model_id,
                        sibling.version,
                        ModelStatus::Active,
                        ModelStatus::Inactive,
                        now,
                    )
                    .await?;
            }

            // Promote the target from whatever status it currently holds
            let current = self
                .repo
                .find_version(model_id, target.version)
                .await?
                .ok_or_else(|| {
                    RiskEngineError::NotFound(format!(
                        "version {} of model {} not found",
                        target.version, model_id
                    ))
                })?;
            if current.status != ModelStatus::Active {
                self.repo
                    .set_status_if(
                        model_id,
                        target.version,
                        current.status,
                        ModelStatus::Active,
                        now,
                    )
                    .await?;
            }

            // Verify exactly one active version, and that it is ours
            let active = self
                .repo
                .find_with_status(model_id, ModelStatus::Active)
                .await?;
            if active.len() == 1 && active[0].version == target.version {
                info!(model_id, version = target.version, "risk model activated");
                return Ok(ActivationOutcome::Activated(active[0].clone()));
            }

            warn!(
                model_id,
                version = target.version,
                attempt,
                observed_active = active.len(),
                "activation raced with a concurrent transition, retrying"
            );
            // Jittered backoff keeps competing activators from lockstepping
            let jitter = rand::thread_rng().gen_range(0..10u64);
            tokio::time::sleep(Duration::from_millis(10 * u64::from(attempt) + jitter)).await;
        }

        Err(RiskEngineError::Conflict(format!(
            "activation of model {} version {} lost the race after {} attempts",
            model_id, target.version, self.config.activation_retry_budget
        )))
    }

    /// Archive a version.
    ///
    /// Archiving the active version leaves the model id with zero active
    /// versions; no sibling is promoted in its place.
    pub async fn archive(&self, model_id: &str, version: Option<u32>) -> Result<RiskModelDocument> {
        let target = self.resolve_version(model_id, version).await?;
        if target.status == ModelStatus::Archived {
            return Err(RiskEngineError::Conflict(format!(
                "version {} of model {} is already archived",
                target.version, model_id
            )));
        }

        let now = Utc::now();
        let was_active = target.status == ModelStatus::Active;
        if !self
            .repo
            .set_status_if(
                model_id,
                target.version,
                target.status,
                ModelStatus::Archived,
                now,
            )
            .await?
        {
            return Err(RiskEngineError::Conflict(format!(
                "version {} of model {} changed status during archive",
                target.version, model_id
            )));
        }

        if was_active {
            warn!(
                model_id,
                version = target.version,
                "archived the active version, model now has no active version"
            );
        } else {
            info!(model_id, version = target.version, "model version archived");
        }

        self.repo
            .find_version(model_id, target.version)
            .await?
            .ok_or_else(|| {
                RiskEngineError::Storage("archived version disappeared".to_string())
            })
    }

    /// Restore the most recently archived version back to inactive
    pub async fn restore(&self, model_id: &str) -> Result<RiskModelDocument> {
        let archived = self
            .repo
            .find_with_status(model_id, ModelStatus::Archived)
            .await?;
        let target = archived
            .into_iter()
            .max_by_key(|m| m.updated_at)
            .ok_or_else(|| {
                RiskEngineError::NotFound(format!(
                    "no archived version of model {} found",
                    model_id
                ))
            })?;

        let now = Utc::now();
        if !self
            .repo
            .set_status_if(
                model_id,
                target.version,
                ModelStatus::Archived,
                ModelStatus::Inactive,
                now,
            )
            .await?
        {
            return Err(RiskEngineError::Conflict(format!(
                "version {} of model {} changed status during restore",
                target.version, model_id
            )));
        }

        info!(model_id, version = target.version, "model version restored");
        self.repo
            .find_version(model_id, target.version)
            .await?
            .ok_or_else(|| {
                RiskEngineError::Storage("restored version disappeared".to_string())
            })
    }

    /// Highest non-archived version; version ordering is authoritative
    pub async fn latest(&self, model_id: &str) -> Result<RiskModelDocument> {
        self.repo
            .find_versions(model_id)
            .await?
            .into_iter()
            .filter(|m| m.status != ModelStatus::Archived)
            .max_by_key(|m| m.version)
            .ok_or_else(|| RiskEngineError::NotFound(format!("risk model {} not found", model_id)))
    }

    /// List models across all ids, most recently updated first
    pub async fn list(
        &self,
        status: Option<ModelStatus>,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<RiskModelDocument>> {
        self.repo.list_models(status, skip, limit).await
    }

    /// Append an evaluation usage record for performance tracking
    pub async fn record_usage(&self, record: PerformanceRecord) -> Result<()> {
        self.repo.insert_performance_record(&record).await
    }

    /// Record the true outcome of a transaction, exactly once.
    ///
    /// A second feedback call for the same transaction is a conflict; the
    /// first outcome is never overwritten.
    pub async fn record_feedback(
        &self,
        model_id: &str,
        transaction_id: &str,
        outcome: FeedbackOutcome,
    ) -> Result<()> {
        if outcome == FeedbackOutcome::Unknown {
            return Err(RiskEngineError::Validation(
                "feedback outcome must be legitimate or fraud".to_string(),
            ));
        }

        match self
            .repo
            .set_feedback_if_unset(model_id, transaction_id, outcome, Utc::now())
            .await?
        {
            FeedbackWrite::Applied => {
                info!(model_id, transaction_id, ?outcome, "feedback recorded");
                Ok(())
            }
            FeedbackWrite::AlreadySet => Err(RiskEngineError::Conflict(format!(
                "feedback for transaction {} already recorded",
                transaction_id
            ))),
            FeedbackWrite::RecordMissing => Err(RiskEngineError::NotFound(format!(
                "no evaluation record for transaction {} under model {}",
                transaction_id, model_id
            ))),
        }
    }

    /// Aggregate performance records for a model version over a timeframe
    pub async fn performance(
        &self,
        model_id: &str,
        version: Option<u32>,
        timeframe: Timeframe,
    ) -> Result<PerformanceReport> {
        let model = self.resolve_version(model_id, version).await?;
        let since = timeframe.since(Utc::now());
        let records = self
            .repo
            .find_performance_records(model_id, model.version, since)
            .await?;

        if records.is_empty() {
            return Ok(PerformanceReport {
                model_id: model_id.to_string(),
                version: model.version,
                timeframe,
                total_evaluations: 0,
                avg_risk_score: None,
                risk_factor_distribution: BTreeMap::new(),
                false_positive_rate: None,
                false_negative_rate: None,
                avg_processing_time_ms: None,
            });
        }

        let total = records.len();
        let avg_risk_score = records.iter().map(|r| r.risk_score).sum::<f64>() / total as f64;
        let avg_processing_time_ms =
            records.iter().map(|r| r.processing_time_ms).sum::<f64>() / total as f64;

        let mut factor_counts: BTreeMap<String, usize> = BTreeMap::new();
        for record in &records {
            for factor in &record.risk_factors {
                *factor_counts.entry(factor.clone()).or_insert(0) += 1;
            }
        }
        let risk_factor_distribution = factor_counts
            .into_iter()
            .map(|(factor, count)| (factor, count as f64 / total as f64 * 100.0))
            .collect();

        // False positive/negative rates only make sense over records whose
        // true outcome is known
        let with_outcome: Vec<&PerformanceRecord> = records
            .iter()
            .filter(|r| r.outcome != FeedbackOutcome::Unknown)
            .collect();
        let (false_positive_rate, false_negative_rate) = if with_outcome.is_empty() {
            (None, None)
        } else {
            let flag = model.thresholds.flag;
            let fp = with_outcome
                .iter()
                .filter(|r| r.risk_score >= flag && r.outcome == FeedbackOutcome::Legitimate)
                .count();
            let fng = with_outcome
                .iter()
                .filter(|r| r.risk_score < flag && r.outcome == FeedbackOutcome::Fraud)
                .count();
            let denom = with_outcome.len() as f64;
            (
                Some(fp as f64 / denom * 100.0),
                Some(fng as f64 / denom * 100.0),
            )
        };

        Ok(PerformanceReport {
            model_id: model_id.to_string(),
            version: model.version,
            timeframe,
            total_evaluations: total,
            avg_risk_score: Some(avg_risk_score),
            risk_factor_distribution,
            false_positive_rate,
            false_negative_rate,
            avg_processing_time_ms: Some(avg_processing_time_ms),
        })
    }

    /// Compare performance metrics between two models
    pub async fn compare(
        &self,
        model_id: &str,
        other_model_id: &str,
        timeframe: Timeframe,
    ) -> Result<ModelComparison> {
        let (left, right) = futures::try_join!(
            self.performance(model_id, None, timeframe),
            self.performance(other_model_id, None, timeframe),
        )?;

        let mut differences = BTreeMap::new();
        for (name, a, b) in [
            ("avg_risk_score", left.avg_risk_score, right.avg_risk_score),
            (
                "false_positive_rate",
                left.false_positive_rate,
                right.false_positive_rate,
            ),
            (
                "false_negative_rate",
                left.false_negative_rate,
                right.false_negative_rate,
            ),
        ] {
            if let (Some(a), Some(b)) = (a, b) {
                differences.insert(name.to_string(), a - b);
            }
        }

        Ok(ModelComparison {
            timeframe,
            left,
            right,
            differences,
        })
    }

    /// Target version for operations that accept an optional version
    async fn resolve_version(
        &self,
        model_id: &str,
        version: Option<u32>,
    ) -> Result<RiskModelDocument> {
        match version {
            Some(v) => self.repo.find_version(model_id, v).await?.ok_or_else(|| {
                RiskEngineError::NotFound(format!(
                    "version {} of model {} not found",
                    v, model_id
                ))
            }),
            None => self.latest(model_id).await,
        }
    }
}

/// Build the usage record appended after each evaluation
pub fn usage_record(
    model: &RiskModelDocument,
    transaction_id: &str,
    customer_id: &str,
    risk_score: f64,
    risk_factors: Vec<String>,
    processing_time_ms: f64,
) -> PerformanceRecord {
    PerformanceRecord {
        record_id: Uuid::new_v4().to_string(),
        model_id: model.model_id.clone(),
        model_version: model.version,
        transaction_id: transaction_id.to_string(),
        customer_id: customer_id.to_string(),
        risk_score,
        risk_factors,
        processing_time_ms,
        timestamp: Utc::now(),
        outcome: FeedbackOutcome::Unknown,
        feedback_at: None,
    }
}

fn apply_patch(doc: &mut RiskModelDocument, patch: RiskModelPatch) {
    if let Some(description) = patch.description {
        doc.description = description;
    }
    if let Some(weights) = patch.weights {
        doc.weights = weights;
    }
    if let Some(thresholds) = patch.thresholds {
        doc.thresholds = thresholds;
    }
    if let Some(risk_factors) = patch.risk_factors {
        doc.risk_factors = risk_factors;
    }
    if let Some(status) = patch.status {
        doc.status = status;
    }
}
