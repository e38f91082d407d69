use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;

use ragpipe_quality::{FactChecker, QualityAssessor};
use ragpipe_shared::{CallContext, Result, StageId};

use crate::stage::{Stage, StageContext, StageOutcome, StageOutput};

/// Assesses every candidate visible to it. With a fact checker configured,
/// candidates are checked concurrently, each call bounded by `call_timeout`.
pub struct QualityAssessmentStage {
    assessor: QualityAssessor,
    fact_checker: Option<Arc<dyn FactChecker>>,
    call_timeout: Duration,
}

impl QualityAssessmentStage {
    pub fn new(fact_checker: Option<Arc<dyn FactChecker>>, call_timeout: Duration) -> Self {
        Self {
            assessor: QualityAssessor::new(),
            fact_checker,
            call_timeout,
        }
    }
}

#[async_trait]
impl Stage for QualityAssessmentStage {
    fn id(&self) -> StageId {
        StageId::QUALITY_ASSESSMENT
    }

    async fn execute(&self, ctx: &StageContext<'_>) -> Result<StageOutcome> {
        let pool = ctx.outputs.pool();

        let assessed: Vec<(String, _)> = match &self.fact_checker {
            Some(checker) => {
                let call = CallContext::new(
                    ctx.call.timeout.min(self.call_timeout),
                    ctx.call.cancel.child(),
                );
                join_all(pool.iter().map(|c| {
                    let call = call.clone();
                    async move {
                        let a = self
                            .assessor
                            .assess_verified(&c.content, checker.as_ref(), &call)
                            .await;
                        (c.id.clone(), a)
                    }
                }))
                .await
            }
            None => pool
                .iter()
                .map(|c| (c.id.clone(), self.assessor.assess(&c.content)))
                .collect(),
        };

        let assessments: BTreeMap<_, _> = assessed.into_iter().collect();
        let mean = if assessments.is_empty() {
            0.0
        } else {
            assessments.values().map(|a| a.overall).sum::<f64>() / assessments.len() as f64
        };

        Ok(StageOutcome::new(StageOutput::Assessments(assessments))
            .with_metric("assessed", pool.len() as f64)
            .with_metric("mean_overall", mean))
    }
}
