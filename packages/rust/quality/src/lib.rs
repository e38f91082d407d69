//! Heuristic text-quality assessment.
//!
//! Five dimensions, averaged into one overall score:
//! - readability: peaks at 15–20 words per sentence, degrades linearly outside
//! - completeness: length plus presence of references, examples and a summary
//! - coherence: paragraph structure plus discourse connectives
//! - accuracy / factuality: supplied by an optional fact-check collaborator,
//!   neutral (0.5) when it is absent or fails

mod text;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use ragpipe_shared::{CallContext, QualityAssessment, QualityLabel, RagError, Result};

pub use text::TextStats;

/// Score used for accuracy/factuality when no external signal is available.
pub const NEUTRAL_SCORE: f64 = 0.5;

/// Readability band (words per sentence) that scores a perfect 1.0.
const READABILITY_BAND: (f64, f64) = (15.0, 20.0);

/// Word count at which the length component of completeness saturates.
const COMPLETE_LENGTH_WORDS: f64 = 150.0;

/// Connective count at which the connective component of coherence saturates.
const COHERENT_CONNECTIVES: f64 = 3.0;

// ---------------------------------------------------------------------------
// Fact-check collaborator
// ---------------------------------------------------------------------------

/// Accuracy and factuality reported by a fact-check collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FactScores {
    pub accuracy: f64,
    pub factuality: f64,
}

impl FactScores {
    pub const NEUTRAL: FactScores = FactScores {
        accuracy: NEUTRAL_SCORE,
        factuality: NEUTRAL_SCORE,
    };

    fn clamped(self) -> Self {
        Self {
            accuracy: clamp_score(self.accuracy),
            factuality: clamp_score(self.factuality),
        }
    }
}

/// External service that scores the factual reliability of a text.
#[async_trait]
pub trait FactChecker: Send + Sync {
    /// Score `text`. Implementations should honour `call.timeout` and stop
    /// work once `call.cancel` fires.
    async fn check(&self, text: &str, call: &CallContext) -> Result<FactScores>;
}

// ---------------------------------------------------------------------------
// Assessor
// ---------------------------------------------------------------------------

/// Stateless quality scorer.
#[derive(Debug, Clone, Copy, Default)]
pub struct QualityAssessor;

impl QualityAssessor {
    pub fn new() -> Self {
        Self
    }

    /// Heuristic-only assessment; accuracy and factuality are neutral.
    pub fn assess(&self, text: &str) -> QualityAssessment {
        build_assessment(&TextStats::from_text(text), FactScores::NEUTRAL)
    }

    /// Assessment with accuracy/factuality from `checker`.
    ///
    /// The call is bounded by `call.timeout` and abandoned on cancellation;
    /// any failure falls back to neutral scores instead of propagating.
    pub async fn assess_verified(
        &self,
        text: &str,
        checker: &dyn FactChecker,
        call: &CallContext,
    ) -> QualityAssessment {
        let stats = TextStats::from_text(text);
        let facts = match fact_check(text, checker, call).await {
            Ok(scores) => scores.clamped(),
            Err(e) => {
                warn!(error = %e, "fact check failed, using neutral scores");
                FactScores::NEUTRAL
            }
        };
        build_assessment(&stats, facts)
    }
}

async fn fact_check(
    text: &str,
    checker: &dyn FactChecker,
    call: &CallContext,
) -> Result<FactScores> {
    tokio::select! {
        _ = call.cancel.cancelled() => Err(RagError::Cancelled),
        outcome = tokio::time::timeout(call.timeout, checker.check(text, call)) => {
            outcome.map_err(|_| RagError::CollaboratorTimeout {
                collaborator: "fact_check".into(),
                timeout_ms: call.timeout.as_millis() as u64,
            })?
        }
    }
}

fn build_assessment(stats: &TextStats, facts: FactScores) -> QualityAssessment {
    let readability = readability_score(stats);
    let completeness = completeness_score(stats);
    let coherence = coherence_score(stats);

    let overall =
        (readability + completeness + coherence + facts.accuracy + facts.factuality) / 5.0;

    let issues = collect_issues(stats, readability, completeness, coherence);
    debug!(
        words = stats.words,
        readability, completeness, coherence, overall, "quality assessed"
    );

    QualityAssessment {
        readability,
        completeness,
        coherence,
        accuracy: facts.accuracy,
        factuality: facts.factuality,
        overall,
        label: QualityLabel::from_score(overall),
        issues,
    }
}

// ---------------------------------------------------------------------------
// Dimensions
// ---------------------------------------------------------------------------

fn readability_score(stats: &TextStats) -> f64 {
    let avg = stats.avg_words_per_sentence();
    if avg <= 0.0 {
        return 0.0;
    }
    let (low, high) = READABILITY_BAND;
    let score = if avg < low {
        1.0 - (low - avg) / low
    } else if avg > high {
        1.0 - (avg - high) / high
    } else {
        1.0
    };
    clamp_score(score)
}

fn completeness_score(stats: &TextStats) -> f64 {
    let length = (stats.words as f64 / COMPLETE_LENGTH_WORDS).min(1.0) * 0.7;
    let flags = [stats.has_references, stats.has_examples, stats.has_summary]
        .iter()
        .filter(|f| **f)
        .count() as f64
        * 0.1;
    clamp_score(length + flags)
}

fn coherence_score(stats: &TextStats) -> f64 {
    let structure = match stats.paragraphs {
        0 => 0.0,
        1 => 0.5,
        2..=6 => 1.0,
        _ => 0.8,
    };
    let flow = (stats.connectives as f64 / COHERENT_CONNECTIVES).min(1.0);
    clamp_score(0.6 * structure + 0.4 * flow)
}

fn collect_issues(
    stats: &TextStats,
    readability: f64,
    completeness: f64,
    coherence: f64,
) -> Vec<String> {
    let mut issues = Vec::new();
    let avg = stats.avg_words_per_sentence();

    if stats.words == 0 {
        issues.push("empty content".to_string());
        return issues;
    }
    if readability < 0.7 {
        if avg < READABILITY_BAND.0 {
            issues.push(format!("sentences are short ({avg:.1} words on average)"));
        } else {
            issues.push(format!("sentences are long ({avg:.1} words on average)"));
        }
    }
    if completeness < 0.5 {
        issues.push("content is brief".to_string());
    }
    if !stats.has_references {
        issues.push("no supporting references".to_string());
    }
    if coherence < 0.5 {
        issues.push("weak structure or flow".to_string());
    }
    issues
}

fn clamp_score(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
