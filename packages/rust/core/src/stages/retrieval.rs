//! Retrieval and augmentation: the only stages that surface candidates, and
//! so the places where every candidate passes the permission evaluator.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use ragpipe_access::filter_accessible;
use ragpipe_gateways::RetrievalGateway;
use ragpipe_shared::{RagError, Result, StageId};

use crate::stage::{Stage, StageContext, StageOutcome, StageOutput};

/// Secondary queries issued by augmentation.
const MAX_AUGMENT_QUERIES: usize = 2;

pub struct RetrievalStage {
    gateway: Arc<RetrievalGateway>,
}

impl RetrievalStage {
    pub fn new(gateway: Arc<RetrievalGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl Stage for RetrievalStage {
    fn id(&self) -> StageId {
        StageId::RETRIEVAL
    }

    async fn execute(&self, ctx: &StageContext<'_>) -> Result<StageOutcome> {
        let request = ctx.request;
        let outcome = self
            .gateway
            .retrieve(
                &request.query,
                request.max_chunks,
                &request.user_context,
                &ctx.plan.retry,
                &ctx.call,
            )
            .await?;

        let retrieved = outcome.len();
        let (visible, denied) = filter_accessible(outcome.into_candidates(), &request.user_context);
        debug!(retrieved, denied, "retrieval filtered");

        Ok(StageOutcome::new(StageOutput::Candidates(visible))
            .with_metric("retrieved", retrieved as f64)
            .with_metric("denied", denied as f64))
    }
}

/// Secondary retrievals for alternative phrasings, de-duplicated against the
/// primary pool.
pub struct AugmentationStage {
    gateway: Arc<RetrievalGateway>,
}

impl AugmentationStage {
    pub fn new(gateway: Arc<RetrievalGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl Stage for AugmentationStage {
    fn id(&self) -> StageId {
        StageId::AUGMENTATION
    }

    async fn execute(&self, ctx: &StageContext<'_>) -> Result<StageOutcome> {
        let request = ctx.request;
        let queries: Vec<String> = match ctx.outputs.expansion() {
            Some(alternatives) if !alternatives.is_empty() => {
                alternatives.iter().take(MAX_AUGMENT_QUERIES).cloned().collect()
            }
            _ => ctx
                .outputs
                .analysis()
                .filter(|a| !a.keywords.is_empty())
                .map(|a| vec![a.keywords.join(" ")])
                .unwrap_or_default(),
        };
        if queries.is_empty() {
            return Ok(StageOutcome::new(StageOutput::Candidates(Vec::new())));
        }

        let mut seen: HashSet<String> = ctx
            .outputs
            .candidates(&StageId::RETRIEVAL)
            .iter()
            .map(|c| c.id.clone())
            .collect();
        let mut added = Vec::new();
        let mut failures = Vec::new();

        for query in &queries {
            let outcome = match self
                .gateway
                .retrieve(
                    query,
                    request.max_chunks,
                    &request.user_context,
                    &ctx.plan.retry,
                    &ctx.call,
                )
                .await
            {
                Ok(outcome) => outcome,
                Err(RagError::Cancelled) => return Err(RagError::Cancelled),
                Err(e) => {
                    warn!(%query, error = %e, "augmentation query failed");
                    failures.push(e);
                    continue;
                }
            };
            let (visible, _) = filter_accessible(outcome.into_candidates(), &request.user_context);
            added.extend(visible.into_iter().filter(|c| seen.insert(c.id.clone())));
        }

        if failures.len() == queries.len() {
            if let Some(e) = failures.pop() {
                return Err(e);
            }
        }

        let count = added.len() as f64;
        Ok(StageOutcome::new(StageOutput::Candidates(added))
            .with_metric("queries", queries.len() as f64)
            .with_metric("added", count))
    }
}
