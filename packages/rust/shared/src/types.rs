//! Core domain types for the ragpipe pipeline.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RagError;

/// Upper bound on `max_chunks` accepted by [`PipelineRequest::validate`].
pub const MAX_CHUNKS_LIMIT: usize = 50;

/// Upper bound on query length (characters).
pub const MAX_QUERY_CHARS: usize = 4_000;

// ---------------------------------------------------------------------------
// RequestId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for request identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl RequestId {
    /// Generate a new time-sortable request identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Mode / Optimization
// ---------------------------------------------------------------------------

/// Pipeline template selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Standard,
    Curated,
    Hybrid,
    Experimental,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Curated => "curated",
            Self::Hybrid => "hybrid",
            Self::Experimental => "experimental",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = RagError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" => Ok(Self::Standard),
            "curated" => Ok(Self::Curated),
            "hybrid" => Ok(Self::Hybrid),
            "experimental" => Ok(Self::Experimental),
            other => Err(RagError::validation(format!(
                "unknown mode '{other}': expected standard, curated, hybrid or experimental"
            ))),
        }
    }
}

/// Optimization strategy applied on top of a mode template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Optimization {
    Latency,
    Quality,
    Cost,
    #[default]
    Balanced,
}

impl Optimization {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Latency => "latency",
            Self::Quality => "quality",
            Self::Cost => "cost",
            Self::Balanced => "balanced",
        }
    }
}

impl fmt::Display for Optimization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Optimization {
    type Err = RagError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "latency" => Ok(Self::Latency),
            "quality" => Ok(Self::Quality),
            "cost" => Ok(Self::Cost),
            "balanced" => Ok(Self::Balanced),
            other => Err(RagError::validation(format!(
                "unknown optimization '{other}': expected latency, quality, cost or balanced"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// StageId
// ---------------------------------------------------------------------------

/// Name of a pipeline stage.
///
/// An open newtype rather than an enum: new stages register under their own
/// id without touching the orchestrator. The well-known ids are constants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageId(Cow<'static, str>);

impl StageId {
    pub const QUERY_ANALYSIS: StageId = StageId(Cow::Borrowed("query_analysis"));
    pub const QUERY_EXPANSION: StageId = StageId(Cow::Borrowed("query_expansion"));
    pub const RETRIEVAL: StageId = StageId(Cow::Borrowed("retrieval"));
    pub const AUGMENTATION: StageId = StageId(Cow::Borrowed("augmentation"));
    pub const QUALITY_ASSESSMENT: StageId = StageId(Cow::Borrowed("quality_assessment"));
    pub const CURATION: StageId = StageId(Cow::Borrowed("curation"));
    pub const GENERATION: StageId = StageId(Cow::Borrowed("generation"));
    pub const POST_PROCESSING: StageId = StageId(Cow::Borrowed("post_processing"));
    pub const EVALUATION: StageId = StageId(Cow::Borrowed("evaluation"));

    /// Create a stage id from an owned or static name.
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Stages whose failure aborts the whole pipeline.
    pub fn is_fatal(&self) -> bool {
        *self == Self::RETRIEVAL || *self == Self::GENERATION
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Requester
// ---------------------------------------------------------------------------

/// Ordered expertise bands used by personalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpertiseLevel {
    Beginner,
    Intermediate,
    Advanced,
    Expert,
}

impl ExpertiseLevel {
    pub fn band(&self) -> i32 {
        match self {
            Self::Beginner => 0,
            Self::Intermediate => 1,
            Self::Advanced => 2,
            Self::Expert => 3,
        }
    }
}

/// Requester preferences consulted when personalization is enabled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserPreferences {
    /// Preferred content types (e.g. `tutorial`, `reference`).
    #[serde(default)]
    pub content_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expertise_level: Option<ExpertiseLevel>,
}

/// Identity and access attributes of the requester.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserContext {
    pub id: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clearance_level: Option<String>,
    #[serde(default)]
    pub project_access: Vec<String>,
    /// Free-form ABAC attributes.
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferences: Option<UserPreferences>,
}

impl UserContext {
    /// Create a context with only an id; every grant beyond rule 1 is empty.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// DocumentCandidate
// ---------------------------------------------------------------------------

/// Access-control metadata attached to every candidate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PermissionMetadata {
    /// Requester ids granted explicitly.
    #[serde(default)]
    pub access_control_list: Vec<String>,
    #[serde(default)]
    pub required_roles: Vec<String>,
    /// Defaults to `internal` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
    /// Requester ids denied regardless of any grant.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub revoked_users: Vec<String>,
}

/// A retrieved document fragment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentCandidate {
    pub id: String,
    pub content: String,
    pub source: String,
    /// Relevance score reported by the retrieval collaborator.
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub permissions: PermissionMetadata,
    /// Topic tags used for pairwise similarity.
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expertise_level: Option<ExpertiseLevel>,
}

impl DocumentCandidate {
    /// Most recent known timestamp (update preferred over creation).
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.updated_at.or(self.created_at)
    }
}

// ---------------------------------------------------------------------------
// PipelineRequest
// ---------------------------------------------------------------------------

/// One inbound `execute-pipeline` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRequest {
    pub query: String,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub optimization: Optimization,
    pub user_context: UserContext,
    #[serde(default = "default_max_chunks")]
    pub max_chunks: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub enable_evaluation: bool,
}

fn default_max_chunks() -> usize {
    5
}
fn default_temperature() -> f32 {
    0.7
}

impl PipelineRequest {
    /// A request with default mode, optimization and limits.
    pub fn new(query: impl Into<String>, user_context: UserContext) -> Self {
        Self {
            query: query.into(),
            mode: Mode::default(),
            optimization: Optimization::default(),
            user_context,
            max_chunks: default_max_chunks(),
            temperature: default_temperature(),
            enable_evaluation: false,
        }
    }

    /// Reject malformed requests before any stage runs.
    pub fn validate(&self) -> crate::Result<()> {
        let query = self.query.trim();
        if query.is_empty() {
            return Err(RagError::validation("query must not be empty"));
        }
        if query.chars().count() > MAX_QUERY_CHARS {
            return Err(RagError::validation(format!(
                "query exceeds {MAX_QUERY_CHARS} characters"
            )));
        }
        if !(1..=MAX_CHUNKS_LIMIT).contains(&self.max_chunks) {
            return Err(RagError::validation(format!(
                "max_chunks must be within 1..={MAX_CHUNKS_LIMIT}, got {}",
                self.max_chunks
            )));
        }
        if !self.temperature.is_finite() || !(0.0..=1.0).contains(&self.temperature) {
            return Err(RagError::validation(format!(
                "temperature must be within 0..=1, got {}",
                self.temperature
            )));
        }
        if self.user_context.id.trim().is_empty() {
            return Err(RagError::validation("user_context.id must not be empty"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Quality / curation outputs
// ---------------------------------------------------------------------------

/// Coarse quality band derived from the overall score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityLabel {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl QualityLabel {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.85 {
            Self::Excellent
        } else if score >= 0.70 {
            Self::Good
        } else if score >= 0.50 {
            Self::Fair
        } else {
            Self::Poor
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Poor => "poor",
        }
    }
}

/// Text-quality scores for one piece of content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityAssessment {
    pub readability: f64,
    pub completeness: f64,
    pub coherence: f64,
    pub accuracy: f64,
    pub factuality: f64,
    pub overall: f64,
    pub label: QualityLabel,
    #[serde(default)]
    pub issues: Vec<String>,
}

/// One ranked entry produced by the curation engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurationResult {
    pub candidate_id: String,
    pub relevance_score: f64,
    pub quality_score: f64,
    pub diversity_score: f64,
    pub temporal_score: f64,
    pub overall_score: f64,
    pub quality_label: QualityLabel,
    pub reason: String,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// Lifecycle state of one stage execution.
///
/// `pending → running → {success, timeout, failed, skipped_cached}`; the four
/// right-hand states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Success,
    Timeout,
    Failed,
    SkippedCached,
}

impl StageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Timeout | Self::Failed | Self::SkippedCached
        )
    }

    /// Whether a stage in this state produced usable output.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Success | Self::SkippedCached)
    }

    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(&self, next: StageStatus) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Running | Self::SkippedCached),
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Timeout => "timeout",
            Self::Failed => "failed",
            Self::SkippedCached => "skipped_cached",
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Externally visible summary of one stage in the trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTrace {
    pub stage: StageId,
    pub status: StageStatus,
    pub duration_ms: u64,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics: BTreeMap<String, f64>,
}

/// Aggregate metrics computed once at the end of a pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseMetrics {
    pub stage_count: usize,
    pub failure_count: usize,
    pub total_latency_ms: u64,
    pub cache_hits: usize,
    pub sources_returned: usize,
}

/// Result of one `execute-pipeline` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResponse {
    pub request_id: RequestId,
    pub query: String,
    /// `None` when the pipeline aborted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    pub mode: Mode,
    pub sources: Vec<DocumentCandidate>,
    /// Curation scores for `sources` when a curation stage ran.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub curation: Vec<CurationResult>,
    pub pipeline_trace: Vec<StageTrace>,
    pub metrics: ResponseMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<BTreeMap<String, f64>>,
    pub processing_time_ms: u64,
    pub timestamp: DateTime<Utc>,
}
