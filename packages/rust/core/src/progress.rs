//! Progress callbacks for long-running pipeline executions.

use ragpipe_shared::{PipelineResponse, StageId, StageTrace};

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when a stage is launched (or looked up in the cache).
    fn stage_started(&self, stage: &StageId);
    /// Called once the stage reached a terminal status.
    fn stage_finished(&self, trace: &StageTrace);
    /// Called when the pipeline completes with an answer.
    fn done(&self, response: &PipelineResponse);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn stage_started(&self, _stage: &StageId) {}
    fn stage_finished(&self, _trace: &StageTrace) {}
    fn done(&self, _response: &PipelineResponse) {}
}
