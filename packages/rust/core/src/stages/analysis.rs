//! Pure query understanding: keyword extraction and naive expansion.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use ragpipe_shared::{Result, StageId};

use crate::stage::{Stage, StageContext, StageOutcome, StageOutput};

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "can", "do", "does", "for", "from", "has",
    "have", "how", "i", "in", "is", "it", "of", "on", "or", "that", "the", "this", "to", "was",
    "what", "when", "where", "which", "who", "why", "will", "with", "you", "your",
];

const MAX_EXPANSIONS: usize = 3;

static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\p{L}\p{N}][\p{L}\p{N}_-]*").expect("token regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    What,
    How,
    Why,
    Who,
    When,
    Where,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryAnalysis {
    pub keywords: Vec<String>,
    pub question_type: QuestionType,
    pub complexity: Complexity,
}

/// Lower-cased tokens minus stop words, first occurrence order.
pub fn analyze(query: &str) -> QueryAnalysis {
    let lower = query.to_lowercase();
    let tokens: Vec<&str> = TOKEN_RE.find_iter(&lower).map(|m| m.as_str()).collect();

    let question_type = tokens
        .iter()
        .find_map(|t| match *t {
            "what" => Some(QuestionType::What),
            "how" => Some(QuestionType::How),
            "why" => Some(QuestionType::Why),
            "who" => Some(QuestionType::Who),
            "when" => Some(QuestionType::When),
            "where" => Some(QuestionType::Where),
            _ => None,
        })
        .unwrap_or(QuestionType::Other);

    let mut keywords: Vec<String> = Vec::new();
    for token in tokens {
        if !STOP_WORDS.contains(&token) && !keywords.iter().any(|k| k == token) {
            keywords.push(token.to_string());
        }
    }

    let complexity = match keywords.len() {
        0..=3 => Complexity::Simple,
        4..=7 => Complexity::Moderate,
        _ => Complexity::Complex,
    };

    QueryAnalysis {
        keywords,
        question_type,
        complexity,
    }
}

/// Up to three alternative queries: the bare keywords, then singular/plural
/// variants. The original query is never repeated.
pub fn expand(query: &str, analysis: &QueryAnalysis) -> Vec<String> {
    if analysis.keywords.is_empty() {
        return Vec::new();
    }
    let original = query.trim().to_lowercase();
    let toggled: Vec<String> = analysis.keywords.iter().map(|k| toggle_plural(k)).collect();

    let mut last_only = analysis.keywords.clone();
    if let (Some(last), Some(variant)) = (last_only.last_mut(), toggled.last()) {
        *last = variant.clone();
    }

    let mut out: Vec<String> = Vec::new();
    for candidate in [
        analysis.keywords.join(" "),
        toggled.join(" "),
        last_only.join(" "),
    ] {
        if candidate != original && !out.contains(&candidate) {
            out.push(candidate);
        }
    }
    out.truncate(MAX_EXPANSIONS);
    out
}

fn toggle_plural(word: &str) -> String {
    if word.chars().count() > 3 && word.ends_with('s') && !word.ends_with("ss") {
        word[..word.len() - 1].to_string()
    } else {
        format!("{word}s")
    }
}

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

pub struct QueryAnalysisStage;

#[async_trait]
impl Stage for QueryAnalysisStage {
    fn id(&self) -> StageId {
        StageId::QUERY_ANALYSIS
    }

    async fn execute(&self, ctx: &StageContext<'_>) -> Result<StageOutcome> {
        let analysis = analyze(&ctx.request.query);
        let keywords = analysis.keywords.len() as f64;
        Ok(StageOutcome::new(StageOutput::Analysis(analysis)).with_metric("keywords", keywords))
    }
}

/// Derives its own keywords so it can run alongside query analysis.
pub struct QueryExpansionStage;

#[async_trait]
impl Stage for QueryExpansionStage {
    fn id(&self) -> StageId {
        StageId::QUERY_EXPANSION
    }

    async fn execute(&self, ctx: &StageContext<'_>) -> Result<StageOutcome> {
        let query = &ctx.request.query;
        let analysis = match ctx.outputs.analysis() {
            Some(a) => a.clone(),
            None => analyze(query),
        };
        let alternatives = expand(query, &analysis);
        let count = alternatives.len() as f64;
        Ok(StageOutcome::new(StageOutput::Expansion(alternatives)).with_metric("alternatives", count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_keywords_and_type() {
        let a = analyze("What is machine learning?");
        assert_eq!(a.keywords, vec!["machine", "learning"]);
        assert_eq!(a.question_type, QuestionType::What);
        assert_eq!(a.complexity, Complexity::Simple);
    }

    #[test]
    fn dedupes_and_grades_complexity() {
        let a = analyze(
            "Compare gradient boosting, random forests and gradient descent for tabular data tasks",
        );
        assert_eq!(a.question_type, QuestionType::Other);
        assert_eq!(a.keywords.iter().filter(|k| *k == "gradient").count(), 1);
        assert_eq!(a.complexity, Complexity::Complex);
    }

    #[test]
    fn expansion_variants() {
        let a = analyze("How do neural networks learn?");
        let alts = expand("How do neural networks learn?", &a);
        assert_eq!(
            alts,
            vec![
                "neural networks learn".to_string(),
                "neurals network learns".to_string(),
                "neural networks learns".to_string(),
            ]
        );
    }

    #[test]
    fn expansion_never_repeats_query() {
        let a = analyze("rust");
        assert_eq!(expand("rust", &a), vec!["rusts".to_string()]);
        assert!(expand("the", &analyze("the")).is_empty());
    }

    #[test]
    fn plural_toggle() {
        assert_eq!(toggle_plural("models"), "model");
        assert_eq!(toggle_plural("class"), "classs");
        assert_eq!(toggle_plural("gas"), "gass");
        assert_eq!(toggle_plural("tree"), "trees");
    }
}
