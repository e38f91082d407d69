//! Error types for ragpipe.
//!
//! Library crates use [`RagError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! Permission denial is deliberately absent: a rejected candidate is simply
//! never surfaced.

use std::path::PathBuf;

use crate::types::{PipelineResponse, StageId};

/// Top-level error type for all ragpipe operations.
#[derive(Debug, thiserror::Error)]
pub enum RagError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Malformed request, rejected before any stage runs.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Transport-level error talking to a collaborator.
    #[error("network error: {0}")]
    Network(String),

    /// Payload (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A stage exceeded its configured timeout.
    #[error("stage '{stage}' timed out after {timeout_ms}ms")]
    StageTimeout { stage: StageId, timeout_ms: u64 },

    /// A stage returned an error.
    #[error("stage '{stage}' failed: {message}")]
    StageFailure { stage: StageId, message: String },

    /// A single collaborator call exceeded its deadline.
    #[error("{collaborator} timed out after {timeout_ms}ms")]
    CollaboratorTimeout {
        collaborator: String,
        timeout_ms: u64,
    },

    /// A collaborator could not serve the request (after retries).
    #[error("{collaborator} unavailable: {message}")]
    CollaboratorUnavailable {
        collaborator: String,
        message: String,
    },

    /// The collaborator's circuit breaker is open; the call was not attempted.
    #[error("{collaborator} circuit open")]
    CircuitOpen { collaborator: String },

    /// The caller or the orchestrator cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// A fatal stage aborted the pipeline. `partial` carries the trace.
    #[error("pipeline aborted at stage '{stage}': {cause}")]
    PipelineAborted {
        stage: StageId,
        cause: Box<RagError>,
        partial: Box<PipelineResponse>,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, RagError>;

impl RagError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create an unavailability error for the named collaborator.
    pub fn unavailable(collaborator: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::CollaboratorUnavailable {
            collaborator: collaborator.into(),
            message: msg.into(),
        }
    }

    /// Whether this error represents a deadline being hit (stage or collaborator).
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::StageTimeout { .. } | Self::CollaboratorTimeout { .. }
        )
    }

    /// Whether retrying the same call could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::CollaboratorTimeout { .. } | Self::CollaboratorUnavailable { .. }
        )
    }

    /// The partial response attached to an aborted pipeline, if any.
    pub fn partial_response(&self) -> Option<&PipelineResponse> {
        match self {
            Self::PipelineAborted { partial, .. } => Some(partial),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = RagError::config("missing search_url");
        assert_eq!(err.to_string(), "config error: missing search_url");

        let err = RagError::StageTimeout {
            stage: StageId::RETRIEVAL,
            timeout_ms: 5000,
        };
        assert_eq!(err.to_string(), "stage 'retrieval' timed out after 5000ms");
    }

    #[test]
    fn timeout_classification() {
        let err = RagError::CollaboratorTimeout {
            collaborator: "search".into(),
            timeout_ms: 10,
        };
        assert!(err.is_timeout());
        assert!(err.is_retryable());

        let err = RagError::CircuitOpen {
            collaborator: "search".into(),
        };
        assert!(!err.is_timeout());
        assert!(!err.is_retryable());
        assert!(!RagError::validation("bad").is_retryable());
    }
}
