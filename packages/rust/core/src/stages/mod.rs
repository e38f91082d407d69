//! Built-in stage implementations.

pub mod analysis;
pub mod curation;
pub mod evaluation;
pub mod generation;
pub mod quality;
pub mod retrieval;

use std::sync::Arc;

use ragpipe_gateways::{EvaluationGateway, GenerationGateway, RetrievalGateway};
use ragpipe_quality::FactChecker;
use ragpipe_shared::AppConfig;

use crate::stage::StageRegistry;

pub use analysis::{QueryAnalysisStage, QueryExpansionStage};
pub use curation::CurationStage;
pub use evaluation::EvaluationStage;
pub use generation::{GenerationStage, PostProcessingStage};
pub use quality::QualityAssessmentStage;
pub use retrieval::{AugmentationStage, RetrievalStage};

/// Gateways and optional collaborators the built-in stages call.
#[derive(Clone)]
pub struct Collaborators {
    pub retrieval: Arc<RetrievalGateway>,
    pub generation: Arc<GenerationGateway>,
    pub evaluation: Option<Arc<EvaluationGateway>>,
    pub fact_checker: Option<Arc<dyn FactChecker>>,
}

impl StageRegistry {
    /// Registry with every built-in stage.
    pub fn with_builtin(collaborators: Collaborators, config: &AppConfig) -> Self {
        let mut registry = Self::new();
        registry
            .register(Arc::new(QueryAnalysisStage))
            .register(Arc::new(QueryExpansionStage))
            .register(Arc::new(RetrievalStage::new(collaborators.retrieval.clone())))
            .register(Arc::new(AugmentationStage::new(collaborators.retrieval)))
            .register(Arc::new(QualityAssessmentStage::new(
                collaborators.fact_checker,
                config.collaborators.call_timeout(),
            )))
            .register(Arc::new(CurationStage::new(config.curation.clone())))
            .register(Arc::new(GenerationStage::new(collaborators.generation)))
            .register(Arc::new(PostProcessingStage))
            .register(Arc::new(EvaluationStage::new(collaborators.evaluation)));
        registry
    }
}
