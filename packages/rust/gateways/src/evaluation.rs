//! Best-effort evaluation gateway.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{instrument, warn};

use ragpipe_shared::{AppConfig, CallContext};

use crate::breaker::CircuitBreaker;
use crate::retry::bounded;
use crate::traits::Evaluator;

const COLLABORATOR: &str = "evaluation";

pub struct EvaluationGateway {
    evaluator: Arc<dyn Evaluator>,
    breaker: CircuitBreaker,
}

impl EvaluationGateway {
    pub fn new(evaluator: Arc<dyn Evaluator>, breaker: CircuitBreaker) -> Self {
        Self { evaluator, breaker }
    }

    pub fn from_config(evaluator: Arc<dyn Evaluator>, config: &AppConfig) -> Self {
        Self::new(
            evaluator,
            CircuitBreaker::from_config(COLLABORATOR, &config.circuit_breaker),
        )
    }

    /// Evaluation metrics, or `None` when the collaborator failed, timed out
    /// or its circuit is open.
    #[instrument(skip_all, fields(chunks = chunks.len()))]
    pub async fn evaluate(
        &self,
        query: &str,
        chunks: &[String],
        answer: &str,
        call: &CallContext,
    ) -> Option<BTreeMap<String, f64>> {
        let permit = match self.breaker.try_acquire() {
            Ok(permit) => permit,
            Err(e) => {
                warn!(error = %e, "evaluation skipped");
                return None;
            }
        };
        let outcome = bounded(
            COLLABORATOR,
            call,
            self.evaluator.evaluate(query, chunks, answer, call),
        )
        .await;
        permit.record(&outcome);
        match outcome {
            Ok(metrics) => Some(metrics),
            Err(e) => {
                warn!(error = %e, "evaluation failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use ragpipe_shared::{CancellationToken, RagError, Result};

    use super::*;

    struct Fixed;

    #[async_trait]
    impl Evaluator for Fixed {
        async fn evaluate(
            &self,
            _query: &str,
            chunks: &[String],
            _answer: &str,
            _call: &CallContext,
        ) -> Result<BTreeMap<String, f64>> {
            Ok(BTreeMap::from([("chunks".to_string(), chunks.len() as f64)]))
        }
    }

    struct Down;

    #[async_trait]
    impl Evaluator for Down {
        async fn evaluate(
            &self,
            _: &str,
            _: &[String],
            _: &str,
            _: &CallContext,
        ) -> Result<BTreeMap<String, f64>> {
            Err(RagError::unavailable("evaluation", "down"))
        }
    }

    struct Slow;

    #[async_trait]
    impl Evaluator for Slow {
        async fn evaluate(
            &self,
            _: &str,
            _: &[String],
            _: &str,
            _: &CallContext,
        ) -> Result<BTreeMap<String, f64>> {
            tokio::time::sleep(Duration::from_secs(3_600)).await;
            Ok(BTreeMap::new())
        }
    }

    fn call() -> CallContext {
        CallContext::new(Duration::from_millis(200), CancellationToken::new())
    }

    #[tokio::test]
    async fn returns_metrics() {
        let gw = EvaluationGateway::new(
            Arc::new(Fixed),
            CircuitBreaker::new("evaluation", 1, Duration::from_secs(60)),
        );
        let metrics = gw
            .evaluate("q", &["a".into(), "b".into()], "answer", &call())
            .await;
        assert_eq!(metrics.and_then(|m| m.get("chunks").copied()), Some(2.0));
    }

    #[tokio::test]
    async fn failures_are_swallowed_and_trip_the_breaker() {
        let gw = EvaluationGateway::new(
            Arc::new(Down),
            CircuitBreaker::new("evaluation", 1, Duration::from_secs(60)),
        );
        assert!(gw.evaluate("q", &[], "a", &call()).await.is_none());
        assert!(gw.evaluate("q", &[], "a", &call()).await.is_none());
        assert_eq!(gw.breaker.state(), crate::breaker::CircuitState::Open);
    }

    #[tokio::test]
    async fn abandoned_half_open_call_frees_the_slot() {
        let gw = EvaluationGateway::new(
            Arc::new(Slow),
            CircuitBreaker::new("evaluation", 1, Duration::ZERO),
        );
        gw.breaker.record_failure();

        let dropped =
            tokio::time::timeout(Duration::from_millis(20), gw.evaluate("q", &[], "a", &call()))
                .await;
        assert!(dropped.is_err());
        assert_eq!(gw.breaker.state(), crate::breaker::CircuitState::HalfOpen);
        assert!(gw.breaker.try_acquire().is_ok(), "slot was given back");
    }
}
