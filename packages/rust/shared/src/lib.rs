//! Shared types, error model, and configuration for ragpipe.
//!
//! This crate is the foundation depended on by all other ragpipe crates.
//! It provides:
//! - [`RagError`] — the unified error type
//! - Domain types ([`PipelineRequest`], [`DocumentCandidate`], [`UserContext`], ...)
//! - Configuration ([`AppConfig`] and its sections, config loading)
//! - [`CancellationToken`] threaded through every collaborator call

pub mod cancel;
pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use cancel::{CallContext, CancellationToken};
pub use config::{
    AppConfig, CacheConfig, CircuitBreakerConfig, CollaboratorsConfig, CurationConfig,
    CurationStrategy, PipelineDefaults, RetrievalConfig, RetryConfig, config_dir,
    config_file_path, default_timeouts, init_config, load_config, load_config_from,
};
pub use error::{RagError, Result};
pub use types::{
    CurationResult, DocumentCandidate, ExpertiseLevel, MAX_CHUNKS_LIMIT, Mode, Optimization,
    PermissionMetadata, PipelineRequest, PipelineResponse, QualityAssessment, QualityLabel,
    RequestId, ResponseMetrics, StageId, StageStatus, StageTrace, UserContext, UserPreferences,
};
