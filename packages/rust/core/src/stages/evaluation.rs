use std::sync::Arc;

use async_trait::async_trait;

use ragpipe_gateways::EvaluationGateway;
use ragpipe_shared::{RagError, Result, StageId};

use crate::stage::{Stage, StageContext, StageOutcome, StageOutput};

/// Best-effort answer evaluation. Without a configured evaluator the stage
/// succeeds with no metrics.
pub struct EvaluationStage {
    gateway: Option<Arc<EvaluationGateway>>,
}

impl EvaluationStage {
    pub fn new(gateway: Option<Arc<EvaluationGateway>>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl Stage for EvaluationStage {
    fn id(&self) -> StageId {
        StageId::EVALUATION
    }

    fn cacheable(&self) -> bool {
        false
    }

    async fn execute(&self, ctx: &StageContext<'_>) -> Result<StageOutcome> {
        let Some(gateway) = &self.gateway else {
            return Ok(StageOutcome::new(StageOutput::Evaluation(Default::default()))
                .with_metric("skipped", 1.0));
        };

        let answer = ctx.outputs.final_answer().unwrap_or_default();
        let chunks: Vec<String> = ctx
            .outputs
            .selected_sources(ctx.request.max_chunks)
            .into_iter()
            .map(|c| c.content)
            .collect();

        let metrics = gateway
            .evaluate(&ctx.request.query, &chunks, answer, &ctx.call)
            .await
            .ok_or_else(|| RagError::unavailable("evaluation", "no metrics returned"))?;
        Ok(StageOutcome::new(StageOutput::Evaluation(metrics)))
    }
}
