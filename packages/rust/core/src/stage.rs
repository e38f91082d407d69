//! The stage abstraction: one interface, a registry keyed by [`StageId`],
//! typed outputs and the per-stage result record.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use ragpipe_curation::CuratedCandidate;
use ragpipe_shared::{
    CallContext, DocumentCandidate, PipelineRequest, QualityAssessment, RagError, Result, StageId,
    StageStatus, StageTrace,
};

use crate::plan::PipelineConfig;
use crate::stages::analysis::QueryAnalysis;

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

/// Payload produced by a successful stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum StageOutput {
    Analysis(QueryAnalysis),
    Expansion(Vec<String>),
    Candidates(Vec<DocumentCandidate>),
    Assessments(BTreeMap<String, QualityAssessment>),
    Curated(Vec<CuratedCandidate>),
    Answer(String),
    Evaluation(BTreeMap<String, f64>),
}

/// What a stage hands back: its output plus any stage-specific metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub output: StageOutput,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
}

impl StageOutcome {
    pub fn new(output: StageOutput) -> Self {
        Self {
            output,
            metrics: BTreeMap::new(),
        }
    }

    pub fn with_metric(mut self, name: &str, value: f64) -> Self {
        self.metrics.insert(name.to_string(), value);
        self
    }
}

/// Outputs of the stages that have completed so far, keyed by stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StageOutputs(BTreeMap<StageId, StageOutput>);

impl StageOutputs {
    pub fn insert(&mut self, stage: StageId, output: StageOutput) {
        self.0.insert(stage, output);
    }

    pub fn get(&self, stage: &StageId) -> Option<&StageOutput> {
        self.0.get(stage)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn analysis(&self) -> Option<&QueryAnalysis> {
        match self.get(&StageId::QUERY_ANALYSIS) {
            Some(StageOutput::Analysis(a)) => Some(a),
            _ => None,
        }
    }

    pub fn expansion(&self) -> Option<&[String]> {
        match self.get(&StageId::QUERY_EXPANSION) {
            Some(StageOutput::Expansion(q)) => Some(q),
            _ => None,
        }
    }

    pub fn candidates(&self, stage: &StageId) -> &[DocumentCandidate] {
        match self.get(stage) {
            Some(StageOutput::Candidates(c)) => c,
            _ => &[],
        }
    }

    /// Retrieval candidates followed by augmentation candidates.
    pub fn pool(&self) -> Vec<DocumentCandidate> {
        let mut pool = self.candidates(&StageId::RETRIEVAL).to_vec();
        pool.extend_from_slice(self.candidates(&StageId::AUGMENTATION));
        pool
    }

    pub fn assessments(&self) -> Option<&BTreeMap<String, QualityAssessment>> {
        match self.get(&StageId::QUALITY_ASSESSMENT) {
            Some(StageOutput::Assessments(a)) => Some(a),
            _ => None,
        }
    }

    pub fn curated(&self) -> Option<&[CuratedCandidate]> {
        match self.get(&StageId::CURATION) {
            Some(StageOutput::Curated(c)) => Some(c),
            _ => None,
        }
    }

    fn answer_of(&self, stage: &StageId) -> Option<&str> {
        match self.get(stage) {
            Some(StageOutput::Answer(a)) => Some(a),
            _ => None,
        }
    }

    pub fn generated(&self) -> Option<&str> {
        self.answer_of(&StageId::GENERATION)
    }

    /// Post-processed answer when available, else the raw generation.
    pub fn final_answer(&self) -> Option<&str> {
        self.answer_of(&StageId::POST_PROCESSING)
            .or_else(|| self.generated())
    }

    pub fn evaluation(&self) -> Option<&BTreeMap<String, f64>> {
        match self.get(&StageId::EVALUATION) {
            Some(StageOutput::Evaluation(m)) => Some(m),
            _ => None,
        }
    }

    /// Candidates that feed generation and the response: the curated list if
    /// curation succeeded, else the first `max_chunks` retrieved candidates.
    pub fn selected_sources(&self, max_chunks: usize) -> Vec<DocumentCandidate> {
        match self.curated() {
            Some(curated) => curated.iter().map(|c| c.candidate.clone()).collect(),
            None => self
                .candidates(&StageId::RETRIEVAL)
                .iter()
                .take(max_chunks)
                .cloned()
                .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// StageResult
// ---------------------------------------------------------------------------

/// Record of one stage execution.
///
/// Created `pending`; each transition is checked against the lifecycle, so
/// a terminal result can never change status again.
#[derive(Debug, Clone, PartialEq)]
pub struct StageResult {
    pub stage: StageId,
    status: StageStatus,
    pub output: Option<StageOutput>,
    pub metrics: BTreeMap<String, f64>,
    pub duration: Duration,
    pub errors: Vec<String>,
}

impl StageResult {
    pub fn pending(stage: StageId) -> Self {
        Self {
            stage,
            status: StageStatus::Pending,
            output: None,
            metrics: BTreeMap::new(),
            duration: Duration::ZERO,
            errors: Vec::new(),
        }
    }

    pub fn status(&self) -> StageStatus {
        self.status
    }

    fn transition(&mut self, next: StageStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(RagError::StageFailure {
                stage: self.stage.clone(),
                message: format!("illegal transition {} → {next}", self.status),
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn start(&mut self) -> Result<()> {
        self.transition(StageStatus::Running)
    }

    pub fn cached(&mut self, outcome: StageOutcome) -> Result<()> {
        self.transition(StageStatus::SkippedCached)?;
        self.output = Some(outcome.output);
        self.metrics = outcome.metrics;
        Ok(())
    }

    pub fn succeed(&mut self, outcome: StageOutcome, duration: Duration) -> Result<()> {
        self.transition(StageStatus::Success)?;
        self.output = Some(outcome.output);
        self.metrics = outcome.metrics;
        self.duration = duration;
        Ok(())
    }

    pub fn time_out(&mut self, message: String, duration: Duration) -> Result<()> {
        self.transition(StageStatus::Timeout)?;
        self.errors.push(message);
        self.duration = duration;
        Ok(())
    }

    pub fn fail(&mut self, message: String, duration: Duration) -> Result<()> {
        self.transition(StageStatus::Failed)?;
        self.errors.push(message);
        self.duration = duration;
        Ok(())
    }

    /// Error to surface when this result aborts the pipeline.
    pub fn abort_cause(&self, timeout: Duration) -> RagError {
        match self.status {
            StageStatus::Timeout => RagError::StageTimeout {
                stage: self.stage.clone(),
                timeout_ms: timeout.as_millis() as u64,
            },
            _ => RagError::StageFailure {
                stage: self.stage.clone(),
                message: self.errors.join("; "),
            },
        }
    }

    pub fn to_trace(&self) -> StageTrace {
        StageTrace {
            stage: self.stage.clone(),
            status: self.status,
            duration_ms: self.duration.as_millis() as u64,
            errors: self.errors.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Stage trait + registry
// ---------------------------------------------------------------------------

/// Everything a stage may read.
pub struct StageContext<'a> {
    pub request: &'a PipelineRequest,
    pub plan: &'a PipelineConfig,
    /// Outputs of stages completed before this stage's step began.
    pub outputs: &'a StageOutputs,
    /// Stage deadline and cancellation, to pass on to gateway calls.
    pub call: CallContext,
}

/// One named pipeline unit.
#[async_trait]
pub trait Stage: Send + Sync {
    fn id(&self) -> StageId;

    /// Whether a successful result may be served from the stage cache.
    fn cacheable(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: &StageContext<'_>) -> Result<StageOutcome>;
}

/// Stage implementations keyed by id.
#[derive(Default, Clone)]
pub struct StageRegistry {
    stages: HashMap<StageId, Arc<dyn Stage>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `stage` under its own id, replacing any previous entry.
    pub fn register(&mut self, stage: Arc<dyn Stage>) -> &mut Self {
        self.stages.insert(stage.id(), stage);
        self
    }

    pub fn get(&self, id: &StageId) -> Option<&Arc<dyn Stage>> {
        self.stages.get(id)
    }

    pub fn contains(&self, id: &StageId) -> bool {
        self.stages.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome() -> StageOutcome {
        StageOutcome::new(StageOutput::Answer("a".into())).with_metric("n", 1.0)
    }

    #[test]
    fn lifecycle_success() {
        let mut r = StageResult::pending(StageId::GENERATION);
        r.start().unwrap();
        r.succeed(outcome(), Duration::from_millis(5)).unwrap();
        assert_eq!(r.status(), StageStatus::Success);
        assert_eq!(r.to_trace().metrics.get("n"), Some(&1.0));
    }

    #[test]
    fn terminal_states_never_re_transition() {
        let mut r = StageResult::pending(StageId::RETRIEVAL);
        r.start().unwrap();
        r.time_out("slow".into(), Duration::from_millis(5)).unwrap();
        assert!(r.fail("again".into(), Duration::ZERO).is_err());
        assert!(r.start().is_err());
        assert_eq!(r.status(), StageStatus::Timeout);
        assert_eq!(r.errors, vec!["slow".to_string()]);
    }

    #[test]
    fn cached_skips_running() {
        let mut r = StageResult::pending(StageId::RETRIEVAL);
        r.cached(outcome()).unwrap();
        assert_eq!(r.status(), StageStatus::SkippedCached);
        assert!(r.succeed(outcome(), Duration::ZERO).is_err());
    }

    #[test]
    fn cannot_finish_without_running() {
        let mut r = StageResult::pending(StageId::RETRIEVAL);
        assert!(r.succeed(outcome(), Duration::ZERO).is_err());
    }

    #[test]
    fn abort_cause_reflects_status() {
        let mut r = StageResult::pending(StageId::RETRIEVAL);
        r.start().unwrap();
        r.time_out("slow".into(), Duration::ZERO).unwrap();
        assert!(matches!(
            r.abort_cause(Duration::from_millis(50)),
            RagError::StageTimeout { timeout_ms: 50, .. }
        ));
    }

    #[test]
    fn selected_sources_prefers_curation() {
        let doc = |id: &str| DocumentCandidate {
            id: id.into(),
            ..Default::default()
        };
        let mut outputs = StageOutputs::default();
        outputs.insert(
            StageId::RETRIEVAL,
            StageOutput::Candidates(vec![doc("a"), doc("b"), doc("c")]),
        );
        let ids = |v: Vec<DocumentCandidate>| v.into_iter().map(|d| d.id).collect::<Vec<_>>();
        assert_eq!(ids(outputs.selected_sources(2)), vec!["a", "b"]);

        outputs.insert(StageId::CURATION, StageOutput::Curated(vec![]));
        assert!(outputs.selected_sources(2).is_empty());
    }
}
