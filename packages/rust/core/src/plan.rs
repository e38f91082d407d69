//! Pipeline templates and optimization strategies.
//!
//! A [`PipelineConfig`] is resolved once per request from `(mode,
//! optimization)` plus the application config, and never mutated while the
//! pipeline runs.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

use ragpipe_shared::{
    AppConfig, CacheConfig, Mode, Optimization, PipelineRequest, RetryConfig, StageId,
};

/// Stages the *latency* strategy may drop.
const OPTIONAL_STAGES: [StageId; 3] = [
    StageId::QUERY_EXPANSION,
    StageId::AUGMENTATION,
    StageId::EVALUATION,
];

const LATENCY_TIMEOUT_FACTOR: f64 = 0.7;
const QUALITY_TIMEOUT_FACTOR: f64 = 1.5;
const COST_TTL_FACTOR: u32 = 2;
const COST_MAX_RETRIES: u32 = 1;

/// One unit of scheduling: a lone stage or a group run concurrently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Single(StageId),
    Group(Vec<StageId>),
}

impl Step {
    pub fn stages(&self) -> &[StageId] {
        match self {
            Step::Single(id) => std::slice::from_ref(id),
            Step::Group(ids) => ids,
        }
    }
}

/// Resolved execution plan for one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineConfig {
    pub mode: Mode,
    pub optimization: Optimization,
    /// Declared (logical) stage order.
    pub stages: Vec<StageId>,
    /// Groups of stages launched together; members are contiguous in `stages`.
    pub parallel_groups: Vec<Vec<StageId>>,
    pub timeouts_ms: BTreeMap<StageId, u64>,
    pub retry: RetryConfig,
    pub cache: CacheConfig,
}

impl PipelineConfig {
    /// Template for `mode` with `optimization` applied.
    pub fn resolve(mode: Mode, optimization: Optimization, config: &AppConfig) -> Self {
        let (stages, parallel_groups) = template(mode);
        let timeouts_ms = stages
            .iter()
            .map(|s| (s.clone(), config.stage_timeout(s).as_millis() as u64))
            .collect();

        let mut plan = Self {
            mode,
            optimization,
            stages,
            parallel_groups,
            timeouts_ms,
            retry: config.retry.clone(),
            cache: config.cache.clone(),
        };
        plan.optimize(config);
        plan
    }

    /// Plan for a concrete request: the resolved template minus evaluation
    /// when the request did not ask for it.
    pub fn for_request(request: &PipelineRequest, config: &AppConfig) -> Self {
        let mut plan = Self::resolve(request.mode, request.optimization, config);
        if !request.enable_evaluation {
            plan.without_stage(&StageId::EVALUATION);
        }
        plan
    }

    fn optimize(&mut self, config: &AppConfig) {
        match self.optimization {
            Optimization::Latency => {
                for stage in OPTIONAL_STAGES {
                    self.without_stage(&stage);
                }
                self.scale_timeouts(LATENCY_TIMEOUT_FACTOR);
            }
            Optimization::Quality => {
                if !self.contains(&StageId::AUGMENTATION) {
                    self.insert_after(&StageId::RETRIEVAL, StageId::AUGMENTATION, config);
                }
                self.scale_timeouts(QUALITY_TIMEOUT_FACTOR);
            }
            Optimization::Cost => {
                self.cache.ttl_secs = self.cache.ttl_secs.saturating_mul(COST_TTL_FACTOR as u64);
                self.retry.max_retries = self.retry.max_retries.min(COST_MAX_RETRIES);
            }
            Optimization::Balanced => {}
        }
    }

    /// Remove `stage` everywhere; groups left with fewer than two members dissolve.
    pub fn without_stage(&mut self, stage: &StageId) {
        self.stages.retain(|s| s != stage);
        self.timeouts_ms.remove(stage);
        for group in &mut self.parallel_groups {
            group.retain(|s| s != stage);
        }
        self.parallel_groups.retain(|g| g.len() >= 2);
    }

    fn insert_after(&mut self, anchor: &StageId, stage: StageId, config: &AppConfig) {
        let at = self
            .stages
            .iter()
            .position(|s| s == anchor)
            .map_or(self.stages.len(), |i| i + 1);
        self.timeouts_ms
            .insert(stage.clone(), config.stage_timeout(&stage).as_millis() as u64);
        self.stages.insert(at, stage);
    }

    fn scale_timeouts(&mut self, factor: f64) {
        for ms in self.timeouts_ms.values_mut() {
            *ms = ((*ms as f64) * factor).round().max(1.0) as u64;
        }
    }

    pub fn contains(&self, stage: &StageId) -> bool {
        self.stages.contains(stage)
    }

    pub fn timeout(&self, stage: &StageId) -> Duration {
        Duration::from_millis(
            self.timeouts_ms
                .get(stage)
                .copied()
                .unwrap_or(ragpipe_shared::config::FALLBACK_STAGE_TIMEOUT_MS),
        )
    }

    /// Stages in declared order, grouped into scheduling steps.
    pub fn steps(&self) -> Vec<Step> {
        let mut steps = Vec::new();
        let mut i = 0;
        while i < self.stages.len() {
            let stage = &self.stages[i];
            match self.parallel_groups.iter().find(|g| g.contains(stage)) {
                Some(group) => {
                    // Members in declared order, skipping ones already emitted.
                    let members: Vec<StageId> = self.stages[i..]
                        .iter()
                        .filter(|s| group.contains(s))
                        .cloned()
                        .collect();
                    i += members.len();
                    steps.push(Step::Group(members));
                }
                None => {
                    steps.push(Step::Single(stage.clone()));
                    i += 1;
                }
            }
        }
        steps
    }
}

fn template(mode: Mode) -> (Vec<StageId>, Vec<Vec<StageId>>) {
    use StageId as S;
    match mode {
        Mode::Standard => (
            vec![S::QUERY_ANALYSIS, S::RETRIEVAL, S::GENERATION, S::POST_PROCESSING],
            vec![],
        ),
        Mode::Curated => (
            vec![
                S::QUERY_ANALYSIS,
                S::RETRIEVAL,
                S::QUALITY_ASSESSMENT,
                S::CURATION,
                S::GENERATION,
                S::POST_PROCESSING,
                S::EVALUATION,
            ],
            vec![],
        ),
        Mode::Hybrid => (
            vec![
                S::QUERY_ANALYSIS,
                S::QUERY_EXPANSION,
                S::RETRIEVAL,
                S::AUGMENTATION,
                S::CURATION,
                S::GENERATION,
                S::POST_PROCESSING,
                S::EVALUATION,
            ],
            vec![vec![S::QUERY_ANALYSIS, S::QUERY_EXPANSION]],
        ),
        Mode::Experimental => (
            vec![
                S::QUERY_ANALYSIS,
                S::QUERY_EXPANSION,
                S::RETRIEVAL,
                S::AUGMENTATION,
                S::QUALITY_ASSESSMENT,
                S::CURATION,
                S::GENERATION,
                S::POST_PROCESSING,
                S::EVALUATION,
            ],
            vec![
                vec![S::QUERY_ANALYSIS, S::QUERY_EXPANSION],
                vec![S::AUGMENTATION, S::QUALITY_ASSESSMENT],
            ],
        ),
    }
}

#[cfg(test)]
mod tests {
    use ragpipe_shared::UserContext;

    use super::*;

    fn resolve(mode: Mode, opt: Optimization) -> PipelineConfig {
        PipelineConfig::resolve(mode, opt, &AppConfig::default())
    }

    fn names(plan: &PipelineConfig) -> Vec<&str> {
        plan.stages.iter().map(StageId::as_str).collect()
    }

    #[test]
    fn standard_template_has_no_curation_or_evaluation() {
        for opt in [
            Optimization::Balanced,
            Optimization::Latency,
            Optimization::Cost,
        ] {
            let plan = resolve(Mode::Standard, opt);
            assert_eq!(
                names(&plan),
                vec!["query_analysis", "retrieval", "generation", "post_processing"]
            );
        }
    }

    #[test]
    fn latency_on_curated_drops_evaluation_and_shrinks_timeouts() {
        let base = resolve(Mode::Curated, Optimization::Balanced);
        let fast = resolve(Mode::Curated, Optimization::Latency);

        assert!(base.contains(&StageId::EVALUATION));
        assert!(!fast.contains(&StageId::EVALUATION));
        for stage in &fast.stages {
            let before = base.timeouts_ms[stage] as f64;
            let after = fast.timeouts_ms[stage] as f64;
            assert!((after / before - 0.7).abs() < 0.01, "{stage}: {before} → {after}");
        }
    }

    #[test]
    fn latency_dissolves_groups() {
        let plan = resolve(Mode::Experimental, Optimization::Latency);
        assert_eq!(
            names(&plan),
            vec![
                "query_analysis",
                "retrieval",
                "quality_assessment",
                "curation",
                "generation",
                "post_processing"
            ]
        );
        assert!(plan.parallel_groups.is_empty());
    }

    #[test]
    fn quality_inserts_augmentation_after_retrieval() {
        let plan = resolve(Mode::Curated, Optimization::Quality);
        let pos = |s: &StageId| plan.stages.iter().position(|x| x == s);
        assert_eq!(
            pos(&StageId::AUGMENTATION),
            pos(&StageId::RETRIEVAL).map(|i| i + 1)
        );
        assert_eq!(plan.timeouts_ms[&StageId::AUGMENTATION], 6_000);
        assert_eq!(plan.timeouts_ms[&StageId::GENERATION], 45_000);

        // Hybrid already has it: no duplicate.
        let hybrid = resolve(Mode::Hybrid, Optimization::Quality);
        assert_eq!(
            hybrid
                .stages
                .iter()
                .filter(|s| **s == StageId::AUGMENTATION)
                .count(),
            1
        );
    }

    #[test]
    fn cost_doubles_ttl_and_caps_retries() {
        let mut config = AppConfig::default();
        config.retry.max_retries = 4;
        let plan = PipelineConfig::resolve(Mode::Standard, Optimization::Cost, &config);
        assert_eq!(plan.cache.ttl_secs, config.cache.ttl_secs * 2);
        assert_eq!(plan.retry.max_retries, 1);
        assert_eq!(plan.timeouts_ms, resolve(Mode::Standard, Optimization::Balanced).timeouts_ms);
    }

    #[test]
    fn steps_follow_groups() {
        let plan = resolve(Mode::Experimental, Optimization::Balanced);
        let steps = plan.steps();
        assert_eq!(
            steps[0],
            Step::Group(vec![StageId::QUERY_ANALYSIS, StageId::QUERY_EXPANSION])
        );
        assert_eq!(steps[1], Step::Single(StageId::RETRIEVAL));
        assert_eq!(
            steps[2],
            Step::Group(vec![StageId::AUGMENTATION, StageId::QUALITY_ASSESSMENT])
        );
        let flattened: Vec<StageId> = steps.iter().flat_map(|s| s.stages().to_vec()).collect();
        assert_eq!(flattened, plan.stages);
    }

    #[test]
    fn evaluation_follows_request_flag() {
        let config = AppConfig::default();
        let mut request = PipelineRequest::new("q", UserContext::new("u"));
        request.mode = Mode::Curated;
        assert!(!PipelineConfig::for_request(&request, &config).contains(&StageId::EVALUATION));
        request.enable_evaluation = true;
        assert!(PipelineConfig::for_request(&request, &config).contains(&StageId::EVALUATION));
    }
}
