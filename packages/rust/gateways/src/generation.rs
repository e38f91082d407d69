//! Generation gateway: the only caller of the text-generation collaborator.
//!
//! Owns the call's deadline and typed failure surfacing. No retries: a
//! generation call is expensive and non-idempotent.

use std::sync::Arc;

use tracing::{debug, instrument};

use ragpipe_shared::{AppConfig, CallContext, RagError, Result, UserContext};

use crate::breaker::CircuitBreaker;
use crate::retry::bounded;
use crate::traits::TextGenerator;

const COLLABORATOR: &str = "generation";

pub struct GenerationGateway {
    generator: Arc<dyn TextGenerator>,
    breaker: CircuitBreaker,
}

impl GenerationGateway {
    pub fn new(generator: Arc<dyn TextGenerator>, breaker: CircuitBreaker) -> Self {
        Self { generator, breaker }
    }

    pub fn from_config(generator: Arc<dyn TextGenerator>, config: &AppConfig) -> Self {
        Self::new(
            generator,
            CircuitBreaker::from_config(COLLABORATOR, &config.circuit_breaker),
        )
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Generate an answer for `query` from an already-assembled `context`.
    ///
    /// An empty completion is reported as unavailability.
    #[instrument(skip_all, fields(user = %user.id, context_len = context.len()))]
    pub async fn generate(
        &self,
        query: &str,
        context: &str,
        temperature: f32,
        user: &UserContext,
        call: &CallContext,
    ) -> Result<String> {
        let permit = self.breaker.try_acquire()?;

        let outcome = bounded(
            COLLABORATOR,
            call,
            self.generator.generate(query, context, temperature, call),
        )
        .await
        .and_then(|text| {
            if text.trim().is_empty() {
                Err(RagError::unavailable(COLLABORATOR, "empty completion"))
            } else {
                Ok(text)
            }
        });

        permit.record(&outcome);
        if let Ok(text) = &outcome {
            debug!(answer_len = text.len(), "generation complete");
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use ragpipe_shared::CancellationToken;

    use super::*;

    struct Echo;

    #[async_trait]
    impl TextGenerator for Echo {
        async fn generate(
            &self,
            query: &str,
            context: &str,
            temperature: f32,
            _call: &CallContext,
        ) -> Result<String> {
            Ok(format!("{query}|{context}|{temperature}"))
        }
    }

    struct Blank;

    #[async_trait]
    impl TextGenerator for Blank {
        async fn generate(&self, _: &str, _: &str, _: f32, _: &CallContext) -> Result<String> {
            Ok("   ".into())
        }
    }

    struct Stuck;

    #[async_trait]
    impl TextGenerator for Stuck {
        async fn generate(&self, _: &str, _: &str, _: f32, _: &CallContext) -> Result<String> {
            std::future::pending().await
        }
    }

    fn gateway(generator: Arc<dyn TextGenerator>) -> GenerationGateway {
        GenerationGateway::new(
            generator,
            CircuitBreaker::new("generation", 3, Duration::from_secs(60)),
        )
    }

    fn call(ms: u64) -> CallContext {
        CallContext::new(Duration::from_millis(ms), CancellationToken::new())
    }

    #[tokio::test]
    async fn passes_inputs_through() {
        let text = gateway(Arc::new(Echo))
            .generate("q", "ctx", 0.5, &UserContext::new("u"), &call(500))
            .await
            .unwrap();
        assert_eq!(text, "q|ctx|0.5");
    }

    #[tokio::test]
    async fn blank_completion_is_unavailable() {
        let err = gateway(Arc::new(Blank))
            .generate("q", "ctx", 0.5, &UserContext::new("u"), &call(500))
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::CollaboratorUnavailable { .. }));
    }

    #[tokio::test]
    async fn deadline_is_enforced() {
        let err = gateway(Arc::new(Stuck))
            .generate("q", "ctx", 0.5, &UserContext::new("u"), &call(20))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }
}
