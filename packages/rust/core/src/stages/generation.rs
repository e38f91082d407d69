//! Context assembly, answer generation and answer clean-up.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;

use ragpipe_gateways::GenerationGateway;
use ragpipe_shared::{DocumentCandidate, RagError, Result, StageId};

use crate::stage::{Stage, StageContext, StageOutcome, StageOutput};

/// Per-chunk content cap in the generation context, in characters.
pub const MAX_CHUNK_CHARS: usize = 2_000;

static BLANK_RUN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n[ \t]*\n(?:[ \t]*\n)+").expect("blank-run regex"));

static ANSWER_LABEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^answer\s*:\s*").expect("answer-label regex"));

/// Numbered context block: `[n] (source) content`, one chunk per paragraph.
pub fn assemble_context(sources: &[DocumentCandidate]) -> String {
    sources
        .iter()
        .enumerate()
        .map(|(i, c)| {
            format!(
                "[{}] ({}) {}",
                i + 1,
                c.source,
                truncate_chars(c.content.trim(), MAX_CHUNK_CHARS)
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Trim, collapse runs of blank lines, drop a leading `Answer:` label.
pub fn post_process(answer: &str) -> String {
    let trimmed = answer.trim();
    let unlabelled = ANSWER_LABEL_RE.replace(trimmed, "");
    BLANK_RUN_RE
        .replace_all(&unlabelled, "\n\n")
        .trim()
        .to_string()
}

pub struct GenerationStage {
    gateway: Arc<GenerationGateway>,
}

impl GenerationStage {
    pub fn new(gateway: Arc<GenerationGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl Stage for GenerationStage {
    fn id(&self) -> StageId {
        StageId::GENERATION
    }

    async fn execute(&self, ctx: &StageContext<'_>) -> Result<StageOutcome> {
        let request = ctx.request;
        let sources = ctx.outputs.selected_sources(request.max_chunks);
        let context = assemble_context(&sources);

        let answer = self
            .gateway
            .generate(
                &request.query,
                &context,
                request.temperature,
                &request.user_context,
                &ctx.call,
            )
            .await?;

        Ok(StageOutcome::new(StageOutput::Answer(answer))
            .with_metric("context_chunks", sources.len() as f64)
            .with_metric("context_chars", context.chars().count() as f64))
    }
}

pub struct PostProcessingStage;

#[async_trait]
impl Stage for PostProcessingStage {
    fn id(&self) -> StageId {
        StageId::POST_PROCESSING
    }

    async fn execute(&self, ctx: &StageContext<'_>) -> Result<StageOutcome> {
        let raw = ctx.outputs.generated().ok_or_else(|| RagError::StageFailure {
            stage: StageId::POST_PROCESSING,
            message: "no generated answer to process".into(),
        })?;
        Ok(StageOutcome::new(StageOutput::Answer(post_process(raw))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_is_numbered_and_truncated() {
        let long = "x".repeat(MAX_CHUNK_CHARS + 50);
        let sources = vec![
            DocumentCandidate {
                id: "a".into(),
                source: "wiki".into(),
                content: " Rust is fast. ".into(),
                ..Default::default()
            },
            DocumentCandidate {
                id: "b".into(),
                source: "blog".into(),
                content: long,
                ..Default::default()
            },
        ];
        let ctx = assemble_context(&sources);
        assert!(ctx.starts_with("[1] (wiki) Rust is fast.\n\n[2] (blog) "));
        assert_eq!(ctx.len(), "[1] (wiki) Rust is fast.\n\n[2] (blog) ".len() + MAX_CHUNK_CHARS);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("hi", 5), "hi");
    }

    #[test]
    fn post_processing_cleans_answer() {
        assert_eq!(
            post_process("  Answer: Rust is fast.\n\n\n\nIt is safe.\n \n\nDone.  "),
            "Rust is fast.\n\nIt is safe.\n\nDone."
        );
        assert_eq!(post_process("answer:yes"), "yes");
        assert_eq!(post_process("The answer: 42"), "The answer: 42");
    }
}
