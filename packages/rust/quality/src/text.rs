//! Surface statistics over plain text used by the quality heuristics.

use std::sync::LazyLock;

use regex::Regex;

/// Words that signal an explicit link between ideas.
const CONNECTIVES: &[&str] = &[
    "however",
    "therefore",
    "furthermore",
    "moreover",
    "because",
    "consequently",
    "additionally",
    "thus",
    "hence",
    "in addition",
    "as a result",
    "on the other hand",
    "for instance",
    "first",
    "finally",
];

const REFERENCE_MARKERS: &[&str] = &["http://", "https://", "[1]", "see also", "according to", "reference", "source:"];
const EXAMPLE_MARKERS: &[&str] = &["for example", "for instance", "e.g.", "such as", "example", "```"];
const SUMMARY_MARKERS: &[&str] = &["in summary", "in conclusion", "to summarize", "overall", "tl;dr", "in short"];

static WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\p{L}\p{N}][\p{L}\p{N}'_-]*").expect("word regex"));

static SENTENCE_END_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.!?]+(\s+|$)").expect("sentence regex"));

static PARAGRAPH_BREAK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\s*\n").expect("paragraph regex"));

/// Counts and presence flags for one text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TextStats {
    pub words: usize,
    pub sentences: usize,
    pub paragraphs: usize,
    pub connectives: usize,
    pub has_references: bool,
    pub has_examples: bool,
    pub has_summary: bool,
}

impl TextStats {
    pub fn from_text(text: &str) -> Self {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Self::default();
        }

        let words = WORD_RE.find_iter(trimmed).count();
        let sentences = SENTENCE_END_RE
            .split(trimmed)
            .filter(|s| WORD_RE.is_match(s))
            .count();
        let paragraphs = PARAGRAPH_BREAK_RE
            .split(trimmed)
            .filter(|p| !p.trim().is_empty())
            .count();

        let lower = trimmed.to_lowercase();
        let connectives = CONNECTIVES
            .iter()
            .map(|c| count_phrase(&lower, c))
            .sum();

        Self {
            words,
            sentences,
            paragraphs,
            connectives,
            has_references: contains_any(&lower, REFERENCE_MARKERS),
            has_examples: contains_any(&lower, EXAMPLE_MARKERS),
            has_summary: contains_any(&lower, SUMMARY_MARKERS),
        }
    }

    pub fn avg_words_per_sentence(&self) -> f64 {
        if self.sentences == 0 {
            0.0
        } else {
            self.words as f64 / self.sentences as f64
        }
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Whole-word occurrences of `phrase` in already lower-cased text.
fn count_phrase(lower: &str, phrase: &str) -> usize {
    lower
        .match_indices(phrase)
        .filter(|(idx, _)| {
            let before = lower[..*idx].chars().next_back();
            let after = lower[idx + phrase.len()..].chars().next();
            !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
        })
        .count()
}
