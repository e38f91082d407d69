//! Individual curation factors and their combination.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use ragpipe_shared::{CurationStrategy, DocumentCandidate};

/// Age, in days, at which the temporal score has decayed to 1/e.
const TEMPORAL_DECAY_DAYS: f64 = 30.0;

/// Temporal score for candidates without any timestamp.
pub const UNDATED_TEMPORAL_SCORE: f64 = 0.5;

/// Upper bound of the diversity weight; the remainder goes to recency.
pub const MAX_DIVERSITY_WEIGHT: f64 = 0.3;

/// The four per-candidate factors, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FactorScores {
    pub relevance: f64,
    pub quality: f64,
    pub diversity: f64,
    pub temporal: f64,
}

impl FactorScores {
    /// Combine factors according to `strategy`.
    ///
    /// Hybrid: `0.4·relevance + 0.3·quality + w·diversity + (0.3 − w)·temporal`.
    pub fn combine(&self, strategy: CurationStrategy, diversity_weight: f64) -> f64 {
        match strategy {
            CurationStrategy::RelevanceOnly => self.relevance,
            CurationStrategy::QualityOnly => self.quality,
            CurationStrategy::DiversityOnly => self.diversity,
            CurationStrategy::TemporalOnly => self.temporal,
            CurationStrategy::Hybrid => {
                let w = diversity_weight.clamp(0.0, MAX_DIVERSITY_WEIGHT);
                0.4 * self.relevance
                    + 0.3 * self.quality
                    + w * self.diversity
                    + (MAX_DIVERSITY_WEIGHT - w) * self.temporal
            }
        }
    }
}

/// Jaccard index of two tag sets. Two empty sets score 0.
pub fn jaccard(a: &[String], b: &[String]) -> f64 {
    let a: HashSet<&str> = a.iter().map(String::as_str).collect();
    let b: HashSet<&str> = b.iter().map(String::as_str).collect();
    let union = a.union(&b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(&b).count() as f64 / union as f64
}

/// Pairwise similarity: `0.3·(same source) + 0.7·Jaccard(topics)`.
pub fn similarity(a: &DocumentCandidate, b: &DocumentCandidate) -> f64 {
    let same_source = if a.source == b.source { 1.0 } else { 0.0 };
    0.3 * same_source + 0.7 * jaccard(&a.topics, &b.topics)
}

/// `1 − mean similarity` against already-accepted candidates; 1.0 when
/// nothing has been accepted yet.
pub fn diversity(candidate: &DocumentCandidate, accepted: &[&DocumentCandidate]) -> f64 {
    if accepted.is_empty() {
        return 1.0;
    }
    let total: f64 = accepted.iter().map(|prev| similarity(candidate, prev)).sum();
    (1.0 - total / accepted.len() as f64).clamp(0.0, 1.0)
}

/// `exp(-age_days / 30)`; undated candidates get [`UNDATED_TEMPORAL_SCORE`].
/// Timestamps in the future count as age zero.
pub fn temporal(timestamp: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f64 {
    match timestamp {
        None => UNDATED_TEMPORAL_SCORE,
        Some(ts) => {
            let age_days = ((now - ts).num_seconds().max(0) as f64) / 86_400.0;
            (-age_days / TEMPORAL_DECAY_DAYS).exp()
        }
    }
}
