//! Pipeline orchestrator: resolves a plan per request, runs its steps in
//! declared order and assembles the response.
//!
//! Group members run concurrently, each under its own timeout and its own
//! child cancellation token, and join at the group boundary. Their results
//! are recorded in declared order regardless of completion order.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use tracing::{Instrument, debug, debug_span, info, instrument, warn};

use ragpipe_access::filter_accessible;
use ragpipe_shared::{
    AppConfig, CallContext, CancellationToken, PipelineRequest, PipelineResponse, RagError,
    RequestId, ResponseMetrics, Result, StageId, StageStatus, StageTrace,
};

use crate::cache::{InMemoryStageCache, StageCache, cache_key};
use crate::history::PerformanceHistory;
use crate::plan::{PipelineConfig, Step};
use crate::progress::{ProgressReporter, SilentProgress};
use crate::stage::{StageContext, StageOutputs, StageRegistry, StageResult};

pub struct Orchestrator {
    config: AppConfig,
    registry: StageRegistry,
    cache: Arc<dyn StageCache>,
    history: Arc<PerformanceHistory>,
}

impl Orchestrator {
    /// Orchestrator with an in-memory cache sized from `config.cache`.
    pub fn new(config: AppConfig, registry: StageRegistry) -> Self {
        let cache = Arc::new(InMemoryStageCache::new(config.cache.max_entries));
        Self {
            config,
            registry,
            cache,
            history: Arc::new(PerformanceHistory::new()),
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn StageCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_history(mut self, history: Arc<PerformanceHistory>) -> Self {
        self.history = history;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn history(&self) -> &PerformanceHistory {
        &self.history
    }

    pub fn cache(&self) -> &dyn StageCache {
        self.cache.as_ref()
    }

    /// The plan `request` would run under.
    pub fn plan(&self, request: &PipelineRequest) -> PipelineConfig {
        PipelineConfig::for_request(request, &self.config)
    }

    /// Run `request` to completion without progress reporting.
    pub async fn execute(&self, request: PipelineRequest) -> Result<PipelineResponse> {
        self.execute_with(request, &SilentProgress, &CancellationToken::new())
            .await
    }

    /// Run `request`, reporting progress and honouring `cancel`.
    ///
    /// A failed or timed-out retrieval or generation stage aborts the run
    /// with [`RagError::PipelineAborted`], which carries the partial trace.
    #[instrument(skip_all, fields(
        request_id = tracing::field::Empty,
        mode = %request.mode,
        optimization = %request.optimization,
    ))]
    pub async fn execute_with(
        &self,
        request: PipelineRequest,
        progress: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<PipelineResponse> {
        request.validate()?;

        let started = Instant::now();
        let request_id = RequestId::new();
        tracing::Span::current().record("request_id", tracing::field::display(&request_id));

        let plan = self.plan(&request);
        info!(
            %request_id,
            stages = plan.stages.len(),
            max_chunks = request.max_chunks,
            "starting pipeline"
        );

        let mut outputs = StageOutputs::default();
        let mut trace: Vec<StageTrace> = Vec::with_capacity(plan.stages.len());

        for step in plan.steps() {
            if cancel.is_cancelled() {
                return Err(RagError::Cancelled);
            }

            let results = match &step {
                Step::Single(id) => {
                    vec![self.run_stage(id, &request, &plan, &outputs, progress, cancel).await?]
                }
                Step::Group(ids) => join_all(ids.iter().map(|id| {
                    self.run_stage(id, &request, &plan, &outputs, progress, cancel)
                }))
                .await
                .into_iter()
                .collect::<Result<Vec<_>>>()?,
            };

            if cancel.is_cancelled() {
                return Err(RagError::Cancelled);
            }

            for result in &results {
                let entry = result.to_trace();
                self.history.record(&entry);
                progress.stage_finished(&entry);
                trace.push(entry);
            }

            if let Some(fatal) = results
                .iter()
                .find(|r| r.stage.is_fatal() && !r.status().is_ok())
            {
                let cause = fatal.abort_cause(plan.timeout(&fatal.stage));
                warn!(%request_id, stage = %fatal.stage, error = %cause, "pipeline aborted");
                let partial = PipelineResponse {
                    request_id,
                    query: request.query.clone(),
                    answer: None,
                    mode: request.mode,
                    sources: Vec::new(),
                    curation: Vec::new(),
                    metrics: summarize(&trace, 0),
                    pipeline_trace: trace,
                    evaluation: None,
                    processing_time_ms: started.elapsed().as_millis() as u64,
                    timestamp: Utc::now(),
                };
                return Err(RagError::PipelineAborted {
                    stage: fatal.stage.clone(),
                    cause: Box::new(cause),
                    partial: Box::new(partial),
                });
            }

            for result in results {
                if !result.status().is_ok() {
                    warn!(
                        stage = %result.stage,
                        status = %result.status(),
                        errors = ?result.errors,
                        "stage degraded, continuing"
                    );
                    continue;
                }
                if let Some(output) = result.output {
                    outputs.insert(result.stage, output);
                }
            }
        }

        let response = assemble(request_id, &request, &outputs, trace, started);
        info!(
            request_id = %response.request_id,
            elapsed_ms = response.processing_time_ms,
            sources = response.metrics.sources_returned,
            failures = response.metrics.failure_count,
            cache_hits = response.metrics.cache_hits,
            "pipeline complete"
        );
        progress.done(&response);
        Ok(response)
    }

    /// Run one stage to a terminal [`StageResult`]. Stage errors are recorded
    /// in the result; `Err` is reserved for lifecycle violations.
    async fn run_stage(
        &self,
        id: &StageId,
        request: &PipelineRequest,
        plan: &PipelineConfig,
        outputs: &StageOutputs,
        progress: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<StageResult> {
        progress.stage_started(id);
        let mut result = StageResult::pending(id.clone());

        let Some(stage) = self.registry.get(id) else {
            result.start()?;
            result.fail(format!("no stage registered as '{id}'"), Duration::ZERO)?;
            return Ok(result);
        };

        let key = (plan.cache.enabled && stage.cacheable())
            .then(|| cache_key(id, request, outputs));
        if let Some(hit) = key.as_deref().and_then(|k| self.cache.get(k)) {
            debug!(stage = %id, "cache hit");
            result.cached(hit)?;
            return Ok(result);
        }

        let timeout = plan.timeout(id);
        let token = cancel.child();
        let ctx = StageContext {
            request,
            plan,
            outputs,
            call: CallContext::new(timeout, token.clone()),
        };

        result.start()?;
        let began = Instant::now();
        let outcome = tokio::time::timeout(timeout, stage.execute(&ctx))
            .instrument(debug_span!("stage", stage = %id))
            .await;
        let elapsed = began.elapsed();

        match outcome {
            Ok(Ok(outcome)) => {
                debug!(stage = %id, elapsed_ms = elapsed.as_millis() as u64, "stage succeeded");
                if let Some(key) = key {
                    self.cache.put(key, outcome.clone(), plan.cache.ttl());
                }
                result.succeed(outcome, elapsed)?;
            }
            Ok(Err(e)) if e.is_timeout() => {
                debug!(stage = %id, error = %e, "stage timed out");
                result.time_out(e.to_string(), elapsed)?;
            }
            Ok(Err(e)) => {
                debug!(stage = %id, error = %e, "stage failed");
                result.fail(e.to_string(), elapsed)?;
            }
            Err(_) => {
                // Abandon any collaborator call still in flight.
                token.cancel();
                debug!(stage = %id, timeout_ms = timeout.as_millis() as u64, "stage deadline exceeded");
                result.time_out(
                    format!("stage exceeded its {}ms timeout", timeout.as_millis()),
                    elapsed,
                )?;
            }
        }
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Response assembly
// ---------------------------------------------------------------------------

fn assemble(
    request_id: RequestId,
    request: &PipelineRequest,
    outputs: &StageOutputs,
    trace: Vec<StageTrace>,
    started: Instant,
) -> PipelineResponse {
    let selected = outputs.selected_sources(request.max_chunks);
    // Last line of defence: nothing leaves without passing the evaluator.
    let (sources, leaked) = filter_accessible(selected, &request.user_context);
    if leaked > 0 {
        warn!(leaked, "inaccessible sources dropped at assembly");
    }

    let curation = outputs
        .curated()
        .map(|curated| {
            curated
                .iter()
                .filter(|c| sources.iter().any(|s| s.id == c.candidate.id))
                .map(|c| c.result.clone())
                .collect()
        })
        .unwrap_or_default();

    let evaluation = outputs.evaluation().filter(|m| !m.is_empty()).cloned();
    let metrics = summarize(&trace, sources.len());

    PipelineResponse {
        request_id,
        query: request.query.clone(),
        answer: outputs.final_answer().map(str::to_owned),
        mode: request.mode,
        sources,
        curation,
        pipeline_trace: trace,
        metrics,
        evaluation,
        processing_time_ms: started.elapsed().as_millis() as u64,
        timestamp: Utc::now(),
    }
}

fn summarize(trace: &[StageTrace], sources_returned: usize) -> ResponseMetrics {
    ResponseMetrics {
        stage_count: trace.len(),
        failure_count: trace
            .iter()
            .filter(|t| matches!(t.status, StageStatus::Timeout | StageStatus::Failed))
            .count(),
        total_latency_ms: trace.iter().map(|t| t.duration_ms).sum(),
        cache_hits: trace
            .iter()
            .filter(|t| t.status == StageStatus::SkippedCached)
            .count(),
        sources_returned,
    }
}
