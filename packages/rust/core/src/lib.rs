//! Pipeline orchestration for ragpipe.
//!
//! This crate ties the permission evaluator, quality assessor, curation
//! engine and collaborator gateways together into per-request pipelines:
//! - [`plan`]: mode templates and optimization strategies
//! - [`stage`] / [`stages`]: the stage interface, registry and built-ins
//! - [`orchestrator`]: step execution, timeouts, caching and response assembly

pub mod cache;
pub mod history;
pub mod orchestrator;
pub mod plan;
pub mod progress;
pub mod stage;
pub mod stages;

pub use cache::{InMemoryStageCache, StageCache, cache_key};
pub use history::{PerformanceHistory, StageStats};
pub use orchestrator::Orchestrator;
pub use plan::{PipelineConfig, Step};
pub use progress::{ProgressReporter, SilentProgress};
pub use stage::{
    Stage, StageContext, StageOutcome, StageOutput, StageOutputs, StageRegistry, StageResult,
};
pub use stages::Collaborators;
