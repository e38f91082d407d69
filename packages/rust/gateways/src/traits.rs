//! Narrow interfaces to the external collaborators.
//!
//! Every call receives a [`CallContext`]: implementations must give up once
//! `call.timeout` elapses or `call.cancel` fires. The gateways enforce both
//! from the outside as well, so a misbehaving implementation cannot stall a
//! pipeline.

use std::collections::BTreeMap;

use async_trait::async_trait;

use ragpipe_shared::{CallContext, DocumentCandidate, Result, UserContext};

/// Vector-search collaborator.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn search(
        &self,
        query: &str,
        top_k: usize,
        user: &UserContext,
        call: &CallContext,
    ) -> Result<Vec<DocumentCandidate>>;
}

/// Text-generation collaborator.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(
        &self,
        query: &str,
        context: &str,
        temperature: f32,
        call: &CallContext,
    ) -> Result<String>;
}

/// Answer-evaluation collaborator. Best-effort: failures never fail a pipeline.
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(
        &self,
        query: &str,
        chunks: &[String],
        answer: &str,
        call: &CallContext,
    ) -> Result<BTreeMap<String, f64>>;
}
