//! Curation / ranking engine.
//!
//! Takes permission-filtered candidates in retrieval order and produces a
//! ranked, annotated, truncated list:
//!
//! 1. drop candidates whose quality is below the threshold
//! 2. score relevance, quality, diversity and recency per survivor
//! 3. combine the factors per [`CurationStrategy`]
//! 4. sort descending; ties keep retrieval order
//! 5. optionally apply preference boosts and re-sort
//! 6. attach a reason and recommendations
//! 7. truncate to `max_results`
//!
//! Diversity is computed against survivors accepted *earlier* in retrieval
//! order, so the first survivor always scores 1.0.

pub mod personalize;
pub mod scoring;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use ragpipe_quality::QualityAssessor;
use ragpipe_shared::{
    CurationConfig, CurationResult, CurationStrategy, DocumentCandidate, QualityAssessment,
    UserContext,
};

pub use scoring::FactorScores;

const LOW_QUALITY: f64 = 0.5;
const HIGH_DIVERSITY: f64 = 0.7;
const STALE: f64 = 0.3;

/// Knobs for one curation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurationOptions {
    pub strategy: CurationStrategy,
    pub quality_threshold: f64,
    pub diversity_weight: f64,
    pub personalize: bool,
    pub max_results: usize,
}

impl CurationOptions {
    pub fn from_config(config: &CurationConfig, max_results: usize) -> Self {
        Self {
            strategy: config.strategy,
            quality_threshold: config.quality_threshold,
            diversity_weight: config.diversity_weight,
            personalize: config.personalize,
            max_results,
        }
    }
}

/// A curated candidate together with its scores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CuratedCandidate {
    pub result: CurationResult,
    pub candidate: DocumentCandidate,
}

struct Entry {
    index: usize,
    candidate: DocumentCandidate,
    assessment: QualityAssessment,
    factors: FactorScores,
    overall: f64,
    boost: f64,
}

/// Rank `candidates` for `user`.
///
/// `assessments` holds precomputed quality assessments keyed by candidate
/// id; candidates without one are assessed heuristically in-line.
pub fn curate(
    query: &str,
    candidates: Vec<DocumentCandidate>,
    user: &UserContext,
    options: &CurationOptions,
    assessments: &BTreeMap<String, QualityAssessment>,
    now: DateTime<Utc>,
) -> Vec<CuratedCandidate> {
    let assessor = QualityAssessor::new();
    let offered = candidates.len();

    // Step 1: quality gate, keeping retrieval order.
    let survivors: Vec<(usize, DocumentCandidate, QualityAssessment)> = candidates
        .into_iter()
        .enumerate()
        .filter_map(|(index, candidate)| {
            let assessment = assessments
                .get(&candidate.id)
                .cloned()
                .unwrap_or_else(|| assessor.assess(&candidate.content));
            (assessment.overall >= options.quality_threshold)
                .then_some((index, candidate, assessment))
        })
        .collect();

    // Steps 2–3: factors and combination.
    let mut entries: Vec<Entry> = Vec::with_capacity(survivors.len());
    for (position, (index, candidate, assessment)) in survivors.iter().enumerate() {
        let accepted: Vec<&DocumentCandidate> =
            survivors[..position].iter().map(|(_, c, _)| c).collect();
        let factors = FactorScores {
            relevance: candidate.score.clamp(0.0, 1.0),
            quality: assessment.overall,
            diversity: scoring::diversity(candidate, &accepted),
            temporal: scoring::temporal(candidate.timestamp(), now),
        };
        entries.push(Entry {
            index: *index,
            candidate: candidate.clone(),
            assessment: assessment.clone(),
            factors,
            overall: factors.combine(options.strategy, options.diversity_weight),
            boost: 1.0,
        });
    }

    // Step 4.
    sort_entries(&mut entries);

    // Step 5.
    if options.personalize {
        if let Some(prefs) = &user.preferences {
            for entry in &mut entries {
                entry.boost = personalize::boost(&entry.candidate, prefs);
                entry.overall *= entry.boost;
            }
            sort_entries(&mut entries);
        }
    }

    // Steps 6–7.
    entries.truncate(options.max_results);

    debug!(
        query_len = query.len(),
        offered,
        kept = entries.len(),
        strategy = ?options.strategy,
        "curation complete"
    );

    entries
        .into_iter()
        .map(|e| CuratedCandidate {
            result: CurationResult {
                candidate_id: e.candidate.id.clone(),
                relevance_score: e.factors.relevance,
                quality_score: e.factors.quality,
                diversity_score: e.factors.diversity,
                temporal_score: e.factors.temporal,
                overall_score: e.overall,
                quality_label: e.assessment.label,
                reason: reason(options.strategy, &e.factors, e.boost),
                recommendations: recommendations(&e.factors),
            },
            candidate: e.candidate,
        })
        .collect()
}

fn sort_entries(entries: &mut [Entry]) {
    entries.sort_by(|a, b| {
        b.overall
            .total_cmp(&a.overall)
            .then_with(|| a.index.cmp(&b.index))
    });
}

fn reason(strategy: CurationStrategy, f: &FactorScores, boost: f64) -> String {
    let mut text = match strategy {
        CurationStrategy::RelevanceOnly => format!("ranked by relevance ({:.2})", f.relevance),
        CurationStrategy::QualityOnly => format!("ranked by quality ({:.2})", f.quality),
        CurationStrategy::DiversityOnly => format!("ranked by diversity ({:.2})", f.diversity),
        CurationStrategy::TemporalOnly => format!("ranked by recency ({:.2})", f.temporal),
        CurationStrategy::Hybrid => {
            let (name, value) = [
                ("relevance", f.relevance),
                ("quality", f.quality),
                ("diversity", f.diversity),
                ("recency", f.temporal),
            ]
            .into_iter()
            .fold(("relevance", f64::MIN), |best, next| {
                if next.1 > best.1 { next } else { best }
            });
            format!("balanced ranking led by {name} ({value:.2})")
        }
    };
    if boost > 1.0 {
        text.push_str("; matches requester preferences");
    }
    text
}

fn recommendations(f: &FactorScores) -> Vec<String> {
    let mut out = Vec::new();
    if f.quality < LOW_QUALITY {
        out.push("cross-reference sources".to_string());
    }
    if f.diversity > HIGH_DIVERSITY {
        out.push("unique perspective".to_string());
    }
    if f.temporal < STALE {
        out.push("check for updates".to_string());
    }
    out
}
