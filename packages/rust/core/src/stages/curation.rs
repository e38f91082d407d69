use async_trait::async_trait;
use chrono::Utc;

use ragpipe_curation::{CurationOptions, curate};
use ragpipe_shared::{CurationConfig, Result, StageId};

use crate::stage::{Stage, StageContext, StageOutcome, StageOutput};

/// Ranks retrieval ∪ augmentation candidates, using stage assessments when
/// present and heuristic ones otherwise.
pub struct CurationStage {
    config: CurationConfig,
}

impl CurationStage {
    pub fn new(config: CurationConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Stage for CurationStage {
    fn id(&self) -> StageId {
        StageId::CURATION
    }

    async fn execute(&self, ctx: &StageContext<'_>) -> Result<StageOutcome> {
        let request = ctx.request;
        let pool = ctx.outputs.pool();
        let offered = pool.len();
        let options = CurationOptions::from_config(&self.config, request.max_chunks);
        let empty = Default::default();
        let assessments = ctx.outputs.assessments().unwrap_or(&empty);

        let curated = curate(
            &request.query,
            pool,
            &request.user_context,
            &options,
            assessments,
            Utc::now(),
        );

        let kept = curated.len() as f64;
        Ok(StageOutcome::new(StageOutput::Curated(curated))
            .with_metric("offered", offered as f64)
            .with_metric("kept", kept))
    }
}
