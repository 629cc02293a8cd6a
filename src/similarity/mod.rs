//! Similarity-based historical risk aggregation
//!
//! Renders the transaction as canonical text, embeds it, fetches the nearest
//! historical transactions from the vector index and folds the ranked match
//! list into a single 0-1 risk contribution. Failures on this path degrade to
//! an empty signal; rule-based evaluation proceeds without it.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::core::config::SimilarityConfig;
use crate::core::types::{RiskLevel, SimilarTransaction, SimilaritySignal, Transaction};
use crate::store::{EmbeddingProvider, TransactionStore};

/// Weighted view of one match used during aggregation
#[derive(Debug, Clone, Copy)]
struct ScoreEntry {
    /// Position- and amount-adjusted similarity
    similarity: f64,
    /// Match's persisted risk score, normalized to 0-1
    risk_score: f64,
    /// Number of risk flags on the match
    flags: usize,
}

/// Aggregates vector search results into a similarity risk score
pub struct SimilarityAggregator {
    embeddings: Arc<dyn EmbeddingProvider>,
    transactions: Arc<dyn TransactionStore>,
    config: SimilarityConfig,
}

impl SimilarityAggregator {
    pub fn new(
        embeddings: Arc<dyn EmbeddingProvider>,
        transactions: Arc<dyn TransactionStore>,
        config: SimilarityConfig,
    ) -> Self {
        Self {
            embeddings,
            transactions,
            config,
        }
    }

    /// Canonical text description fed to the embedding provider.
    ///
    /// The template is fixed; stored transaction embeddings must be produced
    /// from the same rendering for distances to be meaningful.
    pub fn canonical_text(transaction: &Transaction, triggered_flags: &[String]) -> String {
        let flags = if triggered_flags.is_empty() {
            "none".to_string()
        } else {
            triggered_flags.join(", ")
        };
        format!(
            "Transaction {} of {} {} using {} to {} merchant with flags: {}",
            transaction.kind.as_str(),
            transaction.amount,
            transaction.currency,
            transaction.payment_method,
            transaction.merchant.category,
            flags
        )
    }

    /// Assess the transaction against similar historical transactions.
    ///
    /// Soft-fails to an empty signal when the vector index is missing or the
    /// embedding provider is down.
    pub async fn assess(
        &self,
        transaction: &Transaction,
        triggered_flags: &[String],
    ) -> SimilaritySignal {
        if !self.transactions.supports_vector_search() {
            debug!("vector search unavailable, skipping similarity assessment");
            return SimilaritySignal::empty();
        }

        let text = Self::canonical_text(transaction, triggered_flags);
        let embedding = match self.embeddings.embed(&text).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "embedding provider failed, proceeding without similarity");
                return SimilaritySignal::empty();
            }
        };

        let matches = match self
            .transactions
            .vector_search(&embedding, self.config.num_candidates, self.config.limit)
            .await
        {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "vector search failed, proceeding without similarity");
                return SimilaritySignal::empty();
            }
        };

        if matches.is_empty() {
            return SimilaritySignal::empty();
        }

        let score = Self::aggregate(transaction.amount_f64(), &matches);
        let display = Self::rerank(
            matches,
            !triggered_flags.is_empty(),
            self.config.display_limit,
        );

        let shown = display.len();
        debug!(
            score,
            shown,
            "similarity assessment completed"
        );
        SimilaritySignal {
            score,
            matches: display,
        }
    }

    /// Fold a ranked match list into a single 0-1 similarity risk score.
    ///
    /// Matches are partitioned into risk buckets. A non-empty high-risk
    /// bucket dominates the result; a list of only known-good matches
    /// suppresses the score super-linearly; mixed lists fall back to a
    /// balanced weighted average.
    pub fn aggregate(current_amount: f64, matches: &[SimilarTransaction]) -> f64 {
        if matches.is_empty() {
            return 0.0;
        }

        let mut high: Vec<ScoreEntry> = Vec::new();
        let mut medium: Vec<ScoreEntry> = Vec::new();
        let mut low: Vec<ScoreEntry> = Vec::new();

        for (idx, m) in matches.iter().enumerate() {
            // The first five results keep full weight, then decay to 0.5
            let position_weight = if idx < 5 {
                1.0
            } else {
                (1.0 - (idx as f64 - 5.0) * 0.05).max(0.5)
            };
            let weighted_similarity = m.similarity * position_weight;

            let amount_closeness = if m.amount > 0.0 && current_amount > 0.0 {
                let ratio =
                    current_amount.min(m.amount) / current_amount.max(m.amount);
                if ratio > 0.95 {
                    1.0
                } else if ratio > 0.8 {
                    0.8
                } else if ratio > 0.5 {
                    0.6
                } else {
                    0.4
                }
            } else {
                1.0
            };

            let entry = ScoreEntry {
                similarity: weighted_similarity * 0.7 + amount_closeness * 0.3,
                risk_score: m.risk_score / 100.0,
                flags: m.flags.len(),
            };

            match m.risk_level {
                RiskLevel::High => high.push(entry),
                RiskLevel::Medium => medium.push(entry),
                RiskLevel::Low => low.push(entry),
            }
        }

        let score = if !high.is_empty() {
            // Focus on the high-risk matches; more flags weigh heavier, and
            // multiple high-risk matches earn a bounded bonus
            let mut weighted_sum = 0.0;
            let mut total_weight = 0.0;
            for entry in &high {
                let weight = entry.similarity * (1.0 + entry.flags as f64 * 0.1);
                weighted_sum += entry.risk_score * weight;
                total_weight += weight;
            }
            let high_risk_factor = (weighted_sum / total_weight.max(1.0)).min(1.0);
            let bonus = (high.len() as f64 * 0.05).min(0.2);
            (high_risk_factor + bonus).min(1.0)
        } else if !low.is_empty() && medium.is_empty() {
            // Similar only to known-good transactions: suppress risk
            // super-linearly as similarity grows
            let avg_similarity =
                low.iter().map(|e| e.similarity).sum::<f64>() / low.len() as f64;
            (1.0 - avg_similarity.powf(1.5)).max(0.05)
        } else {
            // Mixed or medium-dominant: balanced weighted average
            let mut weighted_sum = 0.0;
            let mut total_weight = 0.0;
            for entry in medium.iter().chain(low.iter()) {
                let weight = entry.similarity * (1.0 + 0.2 * entry.flags as f64);
                weighted_sum += entry.risk_score * weight;
                total_weight += weight;
            }
            if total_weight > 0.0 {
                weighted_sum / total_weight
            } else {
                0.5
            }
        };

        score.clamp(0.0, 1.0)
    }

    /// Re-rank matches for caller display.
    ///
    /// When the rule-based evaluation already flagged the transaction, risky
    /// matches come first; otherwise known-good matches lead. Relative order
    /// within a bucket (similarity order) is preserved.
    pub fn rerank(
        matches: Vec<SimilarTransaction>,
        prioritize_risky: bool,
        limit: usize,
    ) -> Vec<SimilarTransaction> {
        let mut high = Vec::new();
        let mut medium = Vec::new();
        let mut low = Vec::new();
        for m in matches {
            match m.risk_level {
                RiskLevel::High => high.push(m),
                RiskLevel::Medium => medium.push(m),
                RiskLevel::Low => low.push(m),
            }
        }

        let ordered: Vec<SimilarTransaction> = if prioritize_risky {
            high.into_iter().chain(medium).chain(low).collect()
        } else {
            low.into_iter().chain(medium).chain(high).collect()
        };
        ordered.into_iter().take(limit).collect()
    }
}
