use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use remedy::confidence::LowConfidenceAction;
use remedy::config::{ExecutorConfig, Granularity, VerifyStrategy, VerifyType};
use remedy::executor::Executor;
use remedy::model::{Plan, load_analysis};
use remedy::planner;
use remedy::provider::FixProvider;
use remedy::provider::openai::OpenAiProvider;
use remedy::state::{RunState, STATE_FILE_NAME};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "remedy")]
#[command(version, about = "Automated remediation of migration-analyzer violations")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Root of the repository being remediated.
    #[arg(long, global = true)]
    pub input_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build a phased remediation plan from analyzer output
    Plan {
        /// Analyzer output YAML (flat or ruleset shape)
        #[arg(long)]
        input: PathBuf,
        /// Where to write the plan
        #[arg(long, default_value = "remediation-plan.yaml")]
        output: PathBuf,
        /// Skip the provider and group violations deterministically
        #[arg(long)]
        no_provider: bool,
        /// Provider model override
        #[arg(long)]
        model: Option<String>,
    },
    /// Execute a plan against the repository
    Execute {
        #[arg(long)]
        plan: PathBuf,
        /// Run a single phase by id
        #[arg(long)]
        phase: Option<String>,
        /// Skip incidents already completed in the state file
        #[arg(long)]
        resume: bool,
        /// No file writes, no commits, no pushes
        #[arg(long)]
        dry_run: bool,
        /// Accept a plan whose hash differs from the stored state
        #[arg(long)]
        force: bool,
        /// Stop before any phase whose estimate would exceed this budget (USD)
        #[arg(long)]
        max_cost: Option<f64>,
        #[arg(long)]
        parallelism: Option<usize>,
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long, value_enum)]
        commit_strategy: Option<Granularity>,
        /// Open pull requests for accepted fixes
        #[arg(long)]
        pr: bool,
        #[arg(long, value_enum)]
        pr_strategy: Option<Granularity>,
        /// Comment on fixes below this confidence (0 disables)
        #[arg(long)]
        comment_threshold: Option<f64>,
        /// Verification boundary; omit to disable verification
        #[arg(long, value_enum)]
        verify: Option<VerifyStrategy>,
        /// Run tests instead of the build during verification
        #[arg(long)]
        verify_tests: bool,
        /// Verification command override
        #[arg(long)]
        verify_cmd: Option<String>,
        /// Verification timeout in seconds
        #[arg(long)]
        verify_timeout: Option<u64>,
        /// Abort the run on the first verification failure
        #[arg(long)]
        fail_fast: bool,
        /// Do not retry incidents recorded as failed when resuming
        #[arg(long)]
        no_retry_failed: bool,
        /// Uniform confidence threshold override
        #[arg(long)]
        min_confidence: Option<f64>,
        #[arg(long, value_enum)]
        low_confidence_action: Option<LowConfidenceAction>,
        /// Provider model override
        #[arg(long)]
        model: Option<String>,
    },
    /// Show the state file's execution summary
    Status {
        #[arg(long)]
        state: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "remedy=debug" } else { "remedy=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .init();

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            tracing::error!("{err:#}");
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let input_dir = match cli.input_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match cli.command {
        Commands::Plan {
            input,
            output,
            no_provider,
            model,
        } => cmd_plan(&input, &output, no_provider, model.as_deref()).await,
        Commands::Status { state } => cmd_status(&input_dir, state),
        Commands::Execute {
            plan,
            phase,
            resume,
            dry_run,
            force,
            max_cost,
            parallelism,
            batch_size,
            commit_strategy,
            pr,
            pr_strategy,
            comment_threshold,
            verify,
            verify_tests,
            verify_cmd,
            verify_timeout,
            fail_fast,
            no_retry_failed,
            min_confidence,
            low_confidence_action,
            model,
        } => {
            let mut config = ExecutorConfig::new(input_dir, plan.clone())
                .with_phase_filter(phase)
                .with_resume(resume)
                .with_dry_run(dry_run)
                .with_max_cost(max_cost);
            config.force = force;
            config.retry_failed = !no_retry_failed;
            if let Some(parallelism) = parallelism {
                config.batch.parallelism = parallelism;
            }
            if let Some(batch_size) = batch_size {
                config.batch.max_batch_size = batch_size;
            }
            if let Some(strategy) = commit_strategy {
                config.commit.strategy = strategy;
            }
            config.pr.enabled = pr;
            if let Some(strategy) = pr_strategy {
                config.pr.strategy = strategy;
            }
            if let Some(threshold) = comment_threshold {
                config.pr.comment_threshold = threshold;
            }
            config.verify.strategy = verify;
            if verify_tests {
                config.verify.verify_type = VerifyType::Test;
            }
            config.verify.command = verify_cmd;
            config.verify.timeout = verify_timeout.map(Duration::from_secs);
            config.verify.fail_fast = fail_fast;
            config.gate.min_confidence = min_confidence;
            if let Some(action) = low_confidence_action {
                config.gate.low_confidence_action = action;
            }
            config.github_token = std::env::var("GITHUB_TOKEN").ok();

            cmd_execute(config, &plan, model.as_deref()).await
        }
    }
}

async fn cmd_plan(
    input: &PathBuf,
    output: &PathBuf,
    no_provider: bool,
    model: Option<&str>,
) -> Result<i32> {
    let violations = load_analysis(input)?;
    tracing::info!(count = violations.len(), "loaded violations");

    let provider = if no_provider {
        None
    } else {
        Some(build_provider(model)?)
    };
    let plan = planner::build_plan(provider.as_deref(), violations).await?;
    plan.save(output)?;

    println!(
        "Wrote plan with {} phase(s) to {} (hash {})",
        plan.phases.len(),
        output.display(),
        &plan.metadata.plan_hash[..12.min(plan.metadata.plan_hash.len())]
    );
    for phase in plan.ordered_phases() {
        println!(
            "  {} {}: {} violation(s), {} incident(s), est. ${:.2}",
            phase.order,
            phase.name,
            phase.violations.len(),
            phase.incident_count(),
            phase.estimated_cost
        );
    }
    Ok(0)
}

async fn cmd_execute(config: ExecutorConfig, plan_path: &PathBuf, model: Option<&str>) -> Result<i32> {
    let plan = Plan::load(plan_path)?;
    let provider = build_provider(model)?;
    let executor = Executor::new(config, provider);

    // Wind down cleanly on ctrl-c: in-flight batches fail, state is saved.
    let cancel = executor.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; cancelling after in-flight batches");
            cancel.store(true, Ordering::SeqCst);
        }
    });

    match executor.execute(&plan).await {
        Ok(result) => {
            let s = &result.summary;
            println!(
                "Fixes: {} applied, {} failed, {} skipped, {} duplicate(s)",
                s.successful_fixes, s.failed_fixes, s.skipped_fixes, s.duplicate_fixes
            );
            println!("Cost: ${:.4}  Tokens: {}", s.total_cost, s.total_tokens);
            for commit in &result.commits {
                println!("Commit {} ({} file(s))", &commit.sha[..12.min(commit.sha.len())], commit.file_count);
            }
            for pr in &result.pull_requests {
                println!("PR #{} {} [{}]", pr.number, pr.url, pr.branch);
            }
            Ok(0)
        }
        Err(err) => {
            tracing::error!("{err}");
            Ok(err.exit_code())
        }
    }
}

fn cmd_status(input_dir: &PathBuf, state_path: Option<PathBuf>) -> Result<i32> {
    let path = state_path.unwrap_or_else(|| input_dir.join(STATE_FILE_NAME));
    if !path.exists() {
        println!("No state file at {}", path.display());
        return Ok(0);
    }
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read state file {}", path.display()))?;
    let state: RunState = serde_yaml::from_str(&raw)
        .with_context(|| format!("Failed to parse state file {}", path.display()))?;

    let s = &state.execution_summary;
    println!("Plan: {} ({})", state.plan_path, state.plan_hash);
    println!("Started: {}  Updated: {}", state.started_at, state.updated_at);
    println!(
        "Phases: {}/{} completed",
        s.completed_phases, s.total_phases
    );
    println!(
        "Fixes: {} applied, {} failed, {} skipped, {} duplicate(s)",
        s.successful_fixes, s.failed_fixes, s.skipped_fixes, s.duplicate_fixes
    );
    println!("Cost: ${:.4}  Tokens: {}", s.total_cost, s.total_tokens);
    for (phase, status) in &state.phases {
        println!("  {phase}: {status:?}");
    }
    if let Some(failure) = &state.last_failure {
        println!("Last failure: {failure}");
    }
    Ok(0)
}

fn build_provider(model: Option<&str>) -> Result<Arc<dyn FixProvider>> {
    let api_key = std::env::var("OPENAI_API_KEY")
        .context("OPENAI_API_KEY is not set; the provider needs an API key")?;
    let mut provider = OpenAiProvider::new(api_key).map_err(anyhow::Error::new)?;
    if let Some(model) = model {
        provider = provider.with_model(model);
    }
    if let Ok(base) = std::env::var("OPENAI_BASE_URL") {
        provider = provider.with_base_url(&base);
    }
    Ok(Arc::new(provider))
}
