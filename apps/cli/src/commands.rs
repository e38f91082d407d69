//! CLI command definitions, routing, and tracing setup.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use ragpipe_core::{Collaborators, Orchestrator, PipelineConfig, ProgressReporter, StageRegistry, Step};
use ragpipe_gateways::{
    EvaluationGateway, GenerationGateway, HttpEvaluator, HttpFactChecker, HttpGenerator,
    HttpSearchBackend, RetrievalGateway,
};
use ragpipe_quality::{FactChecker, QualityAssessor};
use ragpipe_shared::{
    AppConfig, CancellationToken, DocumentCandidate, Mode, Optimization, PipelineRequest,
    PipelineResponse, RagError, StageId, StageStatus, StageTrace, UserContext, init_config,
    load_config, load_config_from,
};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// ragpipe: permission-aware retrieval-augmented answering.
#[derive(Parser)]
#[command(
    name = "ragpipe",
    version,
    about = "Answer questions through a permission-aware RAG pipeline.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file to use instead of ~/.ragpipe/ragpipe.toml.
    #[arg(long, global = true, env = "RAGPIPE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run a query through the pipeline.
    Ask {
        /// The question to answer.
        query: String,

        #[command(flatten)]
        shape: PlanArgs,

        /// Number of sources handed to generation.
        #[arg(long)]
        max_chunks: Option<usize>,

        /// Sampling temperature (0..=1).
        #[arg(long)]
        temperature: Option<f32>,

        #[command(flatten)]
        user: UserArgs,

        /// Print the full response as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show the resolved plan for a mode and optimization.
    Plan {
        #[command(flatten)]
        shape: PlanArgs,

        /// Print the plan as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Score the text quality of a file.
    Assess {
        /// File to assess.
        file: PathBuf,

        #[arg(long)]
        json: bool,
    },

    /// Check whether a user may see a candidate.
    Access {
        /// Candidate JSON (a document with `permissions`).
        candidate: PathBuf,

        /// User context JSON.
        user: PathBuf,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Mode and optimization selection shared by `ask` and `plan`.
#[derive(Args)]
pub(crate) struct PlanArgs {
    /// standard, curated, hybrid or experimental (defaults to config).
    #[arg(short, long)]
    mode: Option<Mode>,

    /// latency, quality, cost or balanced (defaults to config).
    #[arg(short, long)]
    optimization: Option<Optimization>,

    /// Keep the evaluation stage.
    #[arg(long)]
    evaluate: bool,
}

/// Requester identity, from flags or a JSON file.
#[derive(Args)]
pub(crate) struct UserArgs {
    /// Requester id.
    #[arg(long, env = "RAGPIPE_USER", default_value = "anonymous")]
    user: String,

    /// Requester roles (comma-separated).
    #[arg(long, value_delimiter = ',')]
    roles: Vec<String>,

    #[arg(long)]
    department: Option<String>,

    /// Clearance: public, internal, confidential, secret or top_secret.
    #[arg(long)]
    clearance: Option<String>,

    /// Accessible project ids (comma-separated).
    #[arg(long, value_delimiter = ',')]
    projects: Vec<String>,

    /// ABAC attribute as key=value (repeatable).
    #[arg(long = "attr", value_parser = parse_attribute)]
    attributes: Vec<(String, serde_json::Value)>,

    /// Read the whole user context from a JSON file instead.
    #[arg(long, conflicts_with_all = ["roles", "department", "clearance", "projects", "attributes"])]
    user_file: Option<PathBuf>,
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

/// `key=value`; the value is parsed as JSON when possible, else kept as a string.
fn parse_attribute(raw: &str) -> std::result::Result<(String, serde_json::Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty attribute key in '{raw}'"));
    }
    let value = serde_json::from_str(value.trim())
        .unwrap_or_else(|_| serde_json::Value::String(value.trim().to_string()));
    Ok((key.to_string(), value))
}

impl UserArgs {
    fn into_context(self) -> Result<UserContext> {
        if let Some(path) = &self.user_file {
            return read_json(path);
        }
        Ok(UserContext {
            id: self.user,
            roles: self.roles,
            department: self.department,
            clearance_level: self.clearance,
            project_access: self.projects,
            attributes: self.attributes.into_iter().collect(),
            preferences: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "ragpipe=warn",
        1 => "ragpipe=info",
        2 => "ragpipe=debug",
        _ => "ragpipe=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config;
    match cli.command {
        Command::Ask {
            query,
            shape,
            max_chunks,
            temperature,
            user,
            json,
        } => {
            let config = resolve_config(config_path.as_deref())?;
            let mut request = PipelineRequest::new(query, user.into_context()?);
            request.mode = shape.mode.unwrap_or(config.pipeline.mode);
            request.optimization = shape.optimization.unwrap_or(config.pipeline.optimization);
            request.max_chunks = max_chunks.unwrap_or(config.pipeline.max_chunks);
            request.temperature = temperature.unwrap_or(config.pipeline.temperature);
            request.enable_evaluation = shape.evaluate;
            cmd_ask(config, request, json).await
        }
        Command::Plan { shape, json } => {
            let config = resolve_config(config_path.as_deref())?;
            cmd_plan(&config, &shape, json)
        }
        Command::Assess { file, json } => cmd_assess(&file, json),
        Command::Access { candidate, user } => cmd_access(&candidate, &user),
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(config_path.as_deref()),
        },
    }
}

fn resolve_config(path: Option<&Path>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    Ok(config)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("cannot read {}", path.display()))?;
    serde_json::from_str(&raw).wrap_err_with(|| format!("invalid JSON in {}", path.display()))
}

// ---------------------------------------------------------------------------
// ask
// ---------------------------------------------------------------------------

/// Wire the HTTP collaborators named in `[collaborators]` into an orchestrator.
fn build_orchestrator(config: AppConfig) -> Result<Orchestrator> {
    let c = &config.collaborators;
    let key = c.api_key();

    let search = Arc::new(HttpSearchBackend::new(c.search_url.clone(), key.clone())?);
    let generator = Arc::new(HttpGenerator::new(c.generation_url.clone(), key.clone())?);

    let evaluation = match &c.evaluation_url {
        Some(url) => {
            let evaluator = Arc::new(HttpEvaluator::new(url.clone(), key.clone())?);
            Some(Arc::new(EvaluationGateway::from_config(evaluator, &config)))
        }
        None => None,
    };
    let fact_checker: Option<Arc<dyn FactChecker>> = match &c.fact_check_url {
        Some(url) => Some(Arc::new(HttpFactChecker::new(url.clone(), key.clone())?)),
        None => None,
    };

    let collaborators = Collaborators {
        retrieval: Arc::new(RetrievalGateway::from_config(search, &config)),
        generation: Arc::new(GenerationGateway::from_config(generator, &config)),
        evaluation,
        fact_checker,
    };
    let registry = StageRegistry::with_builtin(collaborators, &config);
    Ok(Orchestrator::new(config, registry))
}

async fn cmd_ask(config: AppConfig, request: PipelineRequest, json: bool) -> Result<()> {
    info!(
        mode = %request.mode,
        optimization = %request.optimization,
        user = %request.user_context.id,
        "running query"
    );
    let orchestrator = build_orchestrator(config)?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let reporter = CliProgress::new(!json)?;
    let outcome = orchestrator.execute_with(request, &reporter, &cancel).await;
    reporter.finish();

    match outcome {
        Ok(response) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                print_response(&response);
            }
            Ok(())
        }
        Err(RagError::PipelineAborted {
            stage,
            cause,
            partial,
        }) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&partial)?);
            } else {
                println!();
                println!("  Pipeline aborted at '{stage}'.");
                print_trace(&partial.pipeline_trace);
            }
            Err(eyre!("pipeline aborted at stage '{stage}': {cause}"))
        }
        Err(e) => Err(e.into()),
    }
}

fn print_response(response: &PipelineResponse) {
    println!();
    println!("{}", response.answer.as_deref().unwrap_or("(no answer)"));
    println!();

    if !response.sources.is_empty() {
        println!("  Sources:");
        for (i, source) in response.sources.iter().enumerate() {
            let curated = response
                .curation
                .iter()
                .find(|c| c.candidate_id == source.id)
                .map(|c| format!("  curated {:.2} ({})", c.overall_score, c.quality_label.as_str()))
                .unwrap_or_default();
            println!(
                "  [{}] {} ({}) score {:.2}{curated}",
                i + 1,
                source.id,
                source.source,
                source.score
            );
        }
        println!();
    }

    print_trace(&response.pipeline_trace);

    if let Some(evaluation) = &response.evaluation {
        println!("  Evaluation:");
        for (metric, value) in evaluation {
            println!("    {metric:<20} {value:.3}");
        }
        println!();
    }

    let m = &response.metrics;
    println!("  Request:  {}", response.request_id);
    println!(
        "  Stages:   {} ({} failed, {} cached)",
        m.stage_count, m.failure_count, m.cache_hits
    );
    println!("  Time:     {}ms", response.processing_time_ms);
    println!();
}

fn print_trace(trace: &[StageTrace]) {
    println!("  Trace:");
    for entry in trace {
        println!(
            "    {:<20} {:<15} {:>6}ms",
            entry.stage.as_str(),
            entry.status.as_str(),
            entry.duration_ms
        );
        for error in &entry.errors {
            println!("      {error}");
        }
    }
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
    running: Mutex<Vec<StageId>>,
}

impl CliProgress {
    fn new(visible: bool) -> Result<Self> {
        let spinner = if visible {
            ProgressBar::new_spinner()
        } else {
            ProgressBar::hidden()
        };
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")?
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Ok(Self {
            spinner,
            running: Mutex::new(Vec::new()),
        })
    }

    fn refresh(&self, running: &[StageId]) {
        let names: Vec<&str> = running.iter().map(StageId::as_str).collect();
        self.spinner.set_message(names.join(", "));
    }

    fn finish(&self) {
        if !self.spinner.is_finished() {
            self.spinner.finish_and_clear();
        }
    }
}

impl ProgressReporter for CliProgress {
    fn stage_started(&self, stage: &StageId) {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        running.push(stage.clone());
        self.refresh(&running);
    }

    fn stage_finished(&self, trace: &StageTrace) {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        running.retain(|s| *s != trace.stage);
        self.refresh(&running);
        if matches!(trace.status, StageStatus::Timeout | StageStatus::Failed) {
            self.spinner
                .println(format!("  ! {} {}", trace.stage, trace.status));
        }
    }

    fn done(&self, _response: &PipelineResponse) {
        self.finish();
    }
}

// ---------------------------------------------------------------------------
// plan / assess / access
// ---------------------------------------------------------------------------

fn cmd_plan(config: &AppConfig, shape: &PlanArgs, json: bool) -> Result<()> {
    let mode = shape.mode.unwrap_or(config.pipeline.mode);
    let optimization = shape.optimization.unwrap_or(config.pipeline.optimization);
    let mut plan = PipelineConfig::resolve(mode, optimization, config);
    if !shape.evaluate {
        plan.without_stage(&StageId::EVALUATION);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    println!();
    println!("  Plan: {mode} / {optimization}");
    for step in plan.steps() {
        match &step {
            Step::Single(id) => println!("    {:<20} {:>6}ms", id.as_str(), plan.timeout(id).as_millis()),
            Step::Group(ids) => {
                println!("    parallel:");
                for id in ids {
                    println!("      {:<18} {:>6}ms", id.as_str(), plan.timeout(id).as_millis());
                }
            }
        }
    }
    println!(
        "  Retries: {}  Cache: {} (ttl {}s)",
        plan.retry.max_retries,
        if plan.cache.enabled { "on" } else { "off" },
        plan.cache.ttl_secs
    );
    println!();
    Ok(())
}

fn cmd_assess(file: &Path, json: bool) -> Result<()> {
    let text = std::fs::read_to_string(file)
        .wrap_err_with(|| format!("cannot read {}", file.display()))?;
    let assessment = QualityAssessor::new().assess(&text);

    if json {
        println!("{}", serde_json::to_string_pretty(&assessment)?);
        return Ok(());
    }

    println!();
    println!("  {}  ({})", file.display(), assessment.label.as_str());
    let scores = BTreeMap::from([
        ("readability", assessment.readability),
        ("completeness", assessment.completeness),
        ("coherence", assessment.coherence),
        ("accuracy", assessment.accuracy),
        ("factuality", assessment.factuality),
    ]);
    for (name, score) in scores {
        println!("    {name:<14} {score:.2}");
    }
    println!("    {:<14} {:.2}", "overall", assessment.overall);
    for issue in &assessment.issues {
        println!("    - {issue}");
    }
    println!();
    Ok(())
}

fn cmd_access(candidate: &Path, user: &Path) -> Result<()> {
    let candidate: DocumentCandidate = read_json(candidate)?;
    let user: UserContext = read_json(user)?;
    let decision = ragpipe_access::evaluate(&candidate.permissions, &user);
    if !decision.is_granted() {
        return Err(eyre!("{}: {decision}", candidate.id));
    }
    println!("{}: {decision}", candidate.id);
    Ok(())
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(path: Option<&Path>) -> Result<()> {
    let config = resolve_config(path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn attributes_parse_as_json_or_string() {
        assert_eq!(
            parse_attribute("level=3").unwrap(),
            ("level".to_string(), serde_json::json!(3))
        );
        assert_eq!(
            parse_attribute("region = emea").unwrap(),
            ("region".to_string(), serde_json::json!("emea"))
        );
        assert!(parse_attribute("novalue").is_err());
        assert!(parse_attribute("=x").is_err());
    }

    #[test]
    fn ask_flags_build_user_context() {
        let cli = Cli::try_parse_from([
            "ragpipe",
            "ask",
            "What is RAG?",
            "--mode",
            "curated",
            "--user",
            "alice",
            "--roles",
            "analyst,admin",
            "--clearance",
            "internal",
            "--attr",
            "region=emea",
        ])
        .unwrap();
        let Command::Ask { shape, user, .. } = cli.command else {
            panic!("expected ask");
        };
        assert_eq!(shape.mode, Some(Mode::Curated));
        let ctx = user.into_context().unwrap();
        assert_eq!(ctx.id, "alice");
        assert_eq!(ctx.roles, vec!["analyst", "admin"]);
        assert_eq!(ctx.clearance_level.as_deref(), Some("internal"));
        assert_eq!(ctx.attributes["region"], serde_json::json!("emea"));
    }
}
