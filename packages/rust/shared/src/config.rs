//! Application configuration for ragpipe.
//!
//! User config lives at `~/.ragpipe/ragpipe.toml`.
//! CLI flags override config file values, which override defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{RagError, Result};
use crate::types::{Mode, Optimization, StageId};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "ragpipe.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".ragpipe";

/// Allowed range for the retrieval oversampling factor.
const OVERSAMPLE_RANGE: (f64, f64) = (2.0, 3.0);

// ---------------------------------------------------------------------------
// Config structs (matching ragpipe.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub pipeline: PipelineDefaults,

    /// Per-stage timeouts in milliseconds, keyed by stage id.
    #[serde(default = "default_timeouts")]
    pub timeouts: BTreeMap<String, u64>,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub curation: CurationConfig,

    #[serde(default)]
    pub retrieval: RetrievalConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub collaborators: CollaboratorsConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineDefaults::default(),
            timeouts: default_timeouts(),
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
            curation: CurationConfig::default(),
            retrieval: RetrievalConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            collaborators: CollaboratorsConfig::default(),
        }
    }
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefaults {
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub optimization: Optimization,
    #[serde(default = "default_max_chunks")]
    pub max_chunks: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for PipelineDefaults {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            optimization: Optimization::default(),
            max_chunks: default_max_chunks(),
            temperature: default_temperature(),
        }
    }
}

fn default_max_chunks() -> usize {
    5
}
fn default_temperature() -> f32 {
    0.7
}

/// Built-in stage timeouts (ms).
pub fn default_timeouts() -> BTreeMap<String, u64> {
    [
        (StageId::QUERY_ANALYSIS, 1_000),
        (StageId::QUERY_EXPANSION, 1_000),
        (StageId::RETRIEVAL, 5_000),
        (StageId::AUGMENTATION, 4_000),
        (StageId::QUALITY_ASSESSMENT, 3_000),
        (StageId::CURATION, 2_000),
        (StageId::GENERATION, 30_000),
        (StageId::POST_PROCESSING, 1_000),
        (StageId::EVALUATION, 10_000),
    ]
    .into_iter()
    .map(|(id, ms)| (id.to_string(), ms))
    .collect()
}

/// Timeout applied to stages without an entry in `[timeouts]`.
pub const FALLBACK_STAGE_TIMEOUT_MS: u64 = 5_000;

/// `[retry]` section — bounded exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

impl RetryConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Backoff before retry number `retry` (1-based), doubling and capped.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = 2u64.saturating_pow(retry.saturating_sub(1));
        let ms = self.initial_backoff_ms.saturating_mul(factor);
        Duration::from_millis(ms.min(self.max_backoff_ms))
    }
}

fn default_max_retries() -> u32 {
    2
}
fn default_initial_backoff() -> u64 {
    100
}
fn default_max_backoff() -> u64 {
    2_000
}

/// `[cache]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: default_ttl(),
            max_entries: default_max_entries(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

fn default_true() -> bool {
    true
}
fn default_ttl() -> u64 {
    300
}
fn default_max_entries() -> usize {
    1_000
}

/// Score combination used by the curation engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CurationStrategy {
    RelevanceOnly,
    QualityOnly,
    DiversityOnly,
    TemporalOnly,
    #[default]
    Hybrid,
}

/// `[curation]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurationConfig {
    #[serde(default)]
    pub strategy: CurationStrategy,
    /// Candidates whose quality falls below this are discarded.
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f64,
    /// Weight of diversity in the hybrid blend, within 0.0..=0.3.
    #[serde(default = "default_diversity_weight")]
    pub diversity_weight: f64,
    #[serde(default = "default_true")]
    pub personalize: bool,
}

impl Default for CurationConfig {
    fn default() -> Self {
        Self {
            strategy: CurationStrategy::default(),
            quality_threshold: default_quality_threshold(),
            diversity_weight: default_diversity_weight(),
            personalize: true,
        }
    }
}

fn default_quality_threshold() -> f64 {
    0.3
}
fn default_diversity_weight() -> f64 {
    0.15
}

/// `[retrieval]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Multiplier applied to `max_chunks` when querying the search collaborator.
    #[serde(default = "default_oversample")]
    pub oversample_factor: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            oversample_factor: default_oversample(),
        }
    }
}

impl RetrievalConfig {
    /// Number of candidates to request for a caller limit. A non-finite
    /// factor falls back to the default.
    pub fn top_k(&self, limit: usize) -> usize {
        let factor = if self.oversample_factor.is_finite() {
            self.oversample_factor
        } else {
            default_oversample()
        };
        let factor = factor.clamp(OVERSAMPLE_RANGE.0, OVERSAMPLE_RANGE.1);
        ((limit as f64) * factor).ceil() as usize
    }
}

fn default_oversample() -> f64 {
    2.5
}

/// `[circuit_breaker]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_cooldown() -> u64 {
    30
}

/// `[collaborators]` section — endpoints of the external services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaboratorsConfig {
    #[serde(default = "default_search_url")]
    pub search_url: Url,
    #[serde(default = "default_generation_url")]
    pub generation_url: Url,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation_url: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fact_check_url: Option<Url>,
    /// Deadline for a single collaborator call.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u64,
    /// Name of the env var holding the bearer token (never store the token itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

impl Default for CollaboratorsConfig {
    fn default() -> Self {
        Self {
            search_url: default_search_url(),
            generation_url: default_generation_url(),
            evaluation_url: None,
            fact_check_url: None,
            call_timeout_ms: default_call_timeout(),
            api_key_env: default_api_key_env(),
        }
    }
}

impl CollaboratorsConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Bearer token from the configured env var, if set and non-empty.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|v| !v.is_empty())
    }
}

fn default_search_url() -> Url {
    Url::parse("http://127.0.0.1:8081/search").unwrap_or_else(|_| unreachable!())
}
fn default_generation_url() -> Url {
    Url::parse("http://127.0.0.1:8082/generate").unwrap_or_else(|_| unreachable!())
}
fn default_call_timeout() -> u64 {
    4_000
}
fn default_api_key_env() -> String {
    "RAGPIPE_API_KEY".into()
}

impl AppConfig {
    /// Configured timeout for `stage`, falling back to the built-in table.
    pub fn stage_timeout(&self, stage: &StageId) -> Duration {
        let ms = self
            .timeouts
            .get(stage.as_str())
            .copied()
            .or_else(|| default_timeouts().get(stage.as_str()).copied())
            .unwrap_or(FALLBACK_STAGE_TIMEOUT_MS);
        Duration::from_millis(ms)
    }

    /// Reject values the pipeline cannot honour.
    pub fn validate(&self) -> Result<()> {
        let c = &self.curation;
        if !(0.0..=1.0).contains(&c.quality_threshold) {
            return Err(RagError::config(format!(
                "curation.quality_threshold must be within 0..=1, got {}",
                c.quality_threshold
            )));
        }
        if !(0.0..=0.3).contains(&c.diversity_weight) {
            return Err(RagError::config(format!(
                "curation.diversity_weight must be within 0..=0.3, got {}",
                c.diversity_weight
            )));
        }
        if !self.retrieval.oversample_factor.is_finite() {
            return Err(RagError::config(format!(
                "retrieval.oversample_factor must be a finite number, got {}",
                self.retrieval.oversample_factor
            )));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(RagError::config(
                "retry.initial_backoff_ms must not exceed retry.max_backoff_ms",
            ));
        }
        if self.cache.max_entries == 0 && self.cache.enabled {
            return Err(RagError::config("cache.max_entries must be positive"));
        }
        if let Some((stage, _)) = self.timeouts.iter().find(|(_, ms)| **ms == 0) {
            return Err(RagError::config(format!("timeout for '{stage}' must be positive")));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.ragpipe/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| RagError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.ragpipe/ragpipe.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| RagError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content)
        .map_err(|e| RagError::config(format!("failed to parse {}: {e}", path.display())))?;
    config.validate()?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| RagError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content = toml::to_string_pretty(&config).map_err(|e| RagError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| RagError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("quality_threshold"));
        assert!(toml_str.contains("RAGPIPE_API_KEY"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.retry.max_retries, 2);
        assert_eq!(parsed.cache.ttl_secs, 300);
        assert_eq!(parsed.timeouts.get("generation"), Some(&30_000));
    }

    #[test]
    fn partial_config_fills_defaults() {
        let toml_str = r#"
[pipeline]
mode = "curated"

[timeouts]
retrieval = 800

[curation]
strategy = "quality_only"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.pipeline.mode, Mode::Curated);
        assert_eq!(config.curation.strategy, CurationStrategy::QualityOnly);
        assert_eq!(config.stage_timeout(&StageId::RETRIEVAL), Duration::from_millis(800));
        // Missing entries fall back to the built-in table.
        assert_eq!(
            config.stage_timeout(&StageId::GENERATION),
            Duration::from_millis(30_000)
        );
        assert_eq!(
            config.stage_timeout(&StageId::new("custom")),
            Duration::from_millis(FALLBACK_STAGE_TIMEOUT_MS)
        );
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let retry = RetryConfig {
            max_retries: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 350,
        };
        assert_eq!(retry.backoff_for(1), Duration::from_millis(100));
        assert_eq!(retry.backoff_for(2), Duration::from_millis(200));
        assert_eq!(retry.backoff_for(3), Duration::from_millis(350));
        assert_eq!(retry.backoff_for(40), Duration::from_millis(350));
    }

    #[test]
    fn oversampling_is_clamped() {
        let mut retrieval = RetrievalConfig::default();
        assert_eq!(retrieval.top_k(4), 10);
        retrieval.oversample_factor = 10.0;
        assert_eq!(retrieval.top_k(4), 12);
        retrieval.oversample_factor = 1.0;
        assert_eq!(retrieval.top_k(4), 8);
        retrieval.oversample_factor = f64::NAN;
        assert_eq!(retrieval.top_k(4), 10);
    }

    #[test]
    fn non_finite_oversample_factor_rejected() {
        for factor in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let mut config = AppConfig::default();
            config.retrieval.oversample_factor = factor;
            let err = config.validate().unwrap_err();
            assert!(err.to_string().contains("oversample_factor"), "{factor}");
        }
    }

    #[test]
    fn invalid_diversity_weight_rejected() {
        let mut config = AppConfig::default();
        config.curation.diversity_weight = 0.5;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("diversity_weight"));
    }

    #[test]
    fn api_key_lookup() {
        let mut collaborators = CollaboratorsConfig::default();
        // Use a unique env var name to avoid interfering with other tests
        collaborators.api_key_env = "RAGPIPE_TEST_NONEXISTENT_KEY_12345".into();
        assert!(collaborators.api_key().is_none());
    }
}
