//! Retrieval gateway: the only caller of the vector-search collaborator.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument};

use ragpipe_shared::{
    AppConfig, CallContext, DocumentCandidate, Result, RetrievalConfig, RetryConfig, UserContext,
};

use crate::breaker::CircuitBreaker;
use crate::retry::with_retry;
use crate::traits::SearchBackend;

const COLLABORATOR: &str = "search";

/// Result of a successful search call. Unavailability is an `Err`, never
/// an empty list.
#[derive(Debug, Clone, PartialEq)]
pub enum RetrievalOutcome {
    Found(Vec<DocumentCandidate>),
    Empty,
}

impl RetrievalOutcome {
    pub fn from_candidates(candidates: Vec<DocumentCandidate>) -> Self {
        if candidates.is_empty() {
            Self::Empty
        } else {
            Self::Found(candidates)
        }
    }

    pub fn into_candidates(self) -> Vec<DocumentCandidate> {
        match self {
            Self::Found(c) => c,
            Self::Empty => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Found(c) => c.len(),
            Self::Empty => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

pub struct RetrievalGateway {
    backend: Arc<dyn SearchBackend>,
    sizing: RetrievalConfig,
    attempt_timeout: Duration,
    breaker: CircuitBreaker,
}

impl RetrievalGateway {
    pub fn new(
        backend: Arc<dyn SearchBackend>,
        sizing: RetrievalConfig,
        attempt_timeout: Duration,
        breaker: CircuitBreaker,
    ) -> Self {
        Self {
            backend,
            sizing,
            attempt_timeout,
            breaker,
        }
    }

    pub fn from_config(backend: Arc<dyn SearchBackend>, config: &AppConfig) -> Self {
        Self::new(
            backend,
            config.retrieval.clone(),
            config.collaborators.call_timeout(),
            CircuitBreaker::from_config(COLLABORATOR, &config.circuit_breaker),
        )
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Fetch an oversampled candidate pool for `limit` final results.
    ///
    /// `call.timeout` bounds the whole call, retries included. Each attempt
    /// gets the smaller of the per-call timeout and what is left of it.
    #[instrument(skip_all, fields(limit = limit, top_k = tracing::field::Empty))]
    pub async fn retrieve(
        &self,
        query: &str,
        limit: usize,
        user: &UserContext,
        policy: &RetryConfig,
        call: &CallContext,
    ) -> Result<RetrievalOutcome> {
        let top_k = self.sizing.top_k(limit);
        tracing::Span::current().record("top_k", top_k);

        let candidates = with_retry(
            COLLABORATOR,
            policy,
            &self.breaker,
            call,
            self.attempt_timeout,
            |attempt| async move { self.backend.search(query, top_k, user, &attempt).await },
        )
        .await?;

        debug!(returned = candidates.len(), "search complete");
        Ok(RetrievalOutcome::from_candidates(candidates))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use ragpipe_shared::{CancellationToken, RagError};

    use super::*;

    #[derive(Default)]
    struct Recording {
        top_ks: Mutex<Vec<usize>>,
        failures_left: AtomicUsize,
        results: usize,
    }

    #[async_trait]
    impl SearchBackend for Recording {
        async fn search(
            &self,
            _query: &str,
            top_k: usize,
            _user: &UserContext,
            _call: &CallContext,
        ) -> Result<Vec<DocumentCandidate>> {
            self.top_ks.lock().unwrap().push(top_k);
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(RagError::unavailable("search", "flaky"));
            }
            Ok((0..self.results.min(top_k))
                .map(|i| DocumentCandidate {
                    id: format!("doc-{i}"),
                    ..Default::default()
                })
                .collect())
        }
    }

    struct Hanging;

    #[async_trait]
    impl SearchBackend for Hanging {
        async fn search(
            &self,
            _query: &str,
            _top_k: usize,
            _user: &UserContext,
            _call: &CallContext,
        ) -> Result<Vec<DocumentCandidate>> {
            std::future::pending().await
        }
    }

    fn gateway(backend: Arc<dyn SearchBackend>, threshold: u32) -> RetrievalGateway {
        RetrievalGateway::new(
            backend,
            RetrievalConfig::default(),
            Duration::from_millis(50),
            CircuitBreaker::new("search", threshold, Duration::from_secs(60)),
        )
    }

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        }
    }

    fn call() -> CallContext {
        CallContext::new(Duration::from_secs(1), CancellationToken::new())
    }

    #[tokio::test]
    async fn oversamples_the_limit() {
        let backend = Arc::new(Recording {
            results: 100,
            ..Default::default()
        });
        let gw = gateway(backend.clone(), 5);
        let out = gw
            .retrieve("q", 4, &UserContext::new("u"), &fast_retry(0), &call())
            .await
            .unwrap();
        assert_eq!(*backend.top_ks.lock().unwrap(), vec![10]);
        assert_eq!(out.len(), 10);
    }

    #[tokio::test]
    async fn empty_corpus_is_not_an_error() {
        let gw = gateway(Arc::new(Recording::default()), 5);
        let out = gw
            .retrieve("q", 4, &UserContext::new("u"), &fast_retry(0), &call())
            .await
            .unwrap();
        assert_eq!(out, RetrievalOutcome::Empty);
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let backend = Arc::new(Recording {
            results: 3,
            failures_left: AtomicUsize::new(2),
            ..Default::default()
        });
        let gw = gateway(backend.clone(), 5);
        let out = gw
            .retrieve("q", 1, &UserContext::new("u"), &fast_retry(2), &call())
            .await
            .unwrap();
        // limit 1 × 2.5 rounds up to 3
        assert_eq!(out.len(), 3);
        assert_eq!(backend.top_ks.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn hanging_backend_surfaces_timeout() {
        let gw = gateway(Arc::new(Hanging), 5);
        let err = gw
            .retrieve("q", 1, &UserContext::new("u"), &fast_retry(1), &call())
            .await
            .unwrap_err();
        assert!(err.is_timeout(), "got {err}");
    }

    #[tokio::test]
    async fn open_circuit_fails_fast() {
        let backend = Arc::new(Recording {
            failures_left: AtomicUsize::new(100),
            ..Default::default()
        });
        let gw = gateway(backend.clone(), 2);
        let user = UserContext::new("u");

        let _ = gw.retrieve("q", 1, &user, &fast_retry(1), &call()).await;
        let calls_before = backend.top_ks.lock().unwrap().len();
        assert_eq!(calls_before, 2);

        let err = gw
            .retrieve("q", 1, &user, &fast_retry(1), &call())
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::CircuitOpen { .. }));
        assert_eq!(backend.top_ks.lock().unwrap().len(), calls_before);
    }

    #[tokio::test]
    async fn recovers_after_caller_abandons_a_half_open_call() {
        let gw = RetrievalGateway::new(
            Arc::new(Hanging),
            RetrievalConfig::default(),
            Duration::from_secs(5),
            CircuitBreaker::new("search", 1, Duration::ZERO),
        );
        gw.breaker().record_failure();
        let user = UserContext::new("u");

        let dropped = tokio::time::timeout(
            Duration::from_millis(20),
            gw.retrieve("q", 1, &user, &fast_retry(1), &call()),
        )
        .await;
        assert!(dropped.is_err());
        assert_eq!(gw.breaker().state(), crate::breaker::CircuitState::HalfOpen);

        // The next call is admitted as a fresh probe and runs to its own deadline.
        let short = CallContext::new(Duration::from_millis(30), CancellationToken::new());
        let err = gw
            .retrieve("q", 1, &user, &fast_retry(0), &short)
            .await
            .unwrap_err();
        assert!(err.is_timeout(), "got {err}");
    }

    #[tokio::test]
    async fn retries_stay_within_the_call_deadline() {
        let gw = gateway(Arc::new(Hanging), 10);
        let short = CallContext::new(Duration::from_millis(80), CancellationToken::new());
        let started = tokio::time::Instant::now();
        let err = gw
            .retrieve("q", 1, &UserContext::new("u"), &fast_retry(5), &short)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_millis(250));
    }
}
