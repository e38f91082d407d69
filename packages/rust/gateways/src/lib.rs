//! Boundaries to the external collaborators.
//!
//! - [`RetrievalGateway`]: oversampling, bounded retry, circuit breaker
//! - [`GenerationGateway`]: deadline and typed failures only
//! - [`EvaluationGateway`]: best-effort, never fails a pipeline
//!
//! Collaborators are reached through the traits in [`traits`]; JSON-over-HTTP
//! implementations live in [`http`].

pub mod breaker;
pub mod evaluation;
pub mod generation;
pub mod http;
pub mod retrieval;
pub mod retry;
pub mod traits;

pub use breaker::{CircuitBreaker, CircuitState, Permit};
pub use evaluation::EvaluationGateway;
pub use generation::GenerationGateway;
pub use http::{HttpEvaluator, HttpFactChecker, HttpGenerator, HttpSearchBackend};
pub use retrieval::{RetrievalGateway, RetrievalOutcome};
pub use traits::{Evaluator, SearchBackend, TextGenerator};
