//! Runtime configuration for the remediation engine.
//!
//! One `ExecutorConfig` bridges the CLI flags with the runtime needs of the
//! executor. Sub-configs keep each subsystem's knobs together; builders
//! follow the `with_*` convention.

use crate::confidence::GateConfig;
use std::path::PathBuf;
use std::time::Duration;

/// Commit / PR granularity. The two trackers choose theirs independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Granularity {
    /// Commit immediately after each accepted fix.
    PerIncident,
    /// Buffer fixes for the active violation; flush when it changes.
    #[default]
    PerViolation,
    /// Buffer for the duration of a phase; flush at the phase boundary.
    PerPhase,
    /// Buffer for the whole run; flush once in finalize.
    AtEnd,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::PerIncident => "per-incident",
            Granularity::PerViolation => "per-violation",
            Granularity::PerPhase => "per-phase",
            Granularity::AtEnd => "at-end",
        }
    }
}

/// When the verifier runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum VerifyStrategy {
    PerFix,
    PerViolation,
    PerPhase,
    AtEnd,
}

/// What the verifier runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum VerifyType {
    #[default]
    Build,
    Test,
}

impl VerifyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerifyType::Build => "build",
            VerifyType::Test => "test",
        }
    }
}

/// How incidents are grouped into provider batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum BatchMode {
    /// Group by resolved file path first, so file contents ship at most once
    /// per batch.
    #[default]
    FileGroup,
    /// Chunk in list order.
    Sequential,
}

pub const DEFAULT_MAX_BATCH_SIZE: usize = 10;
pub const DEFAULT_PARALLELISM: usize = 4;

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub mode: BatchMode,
    pub max_batch_size: usize,
    /// Optional token ceiling per batch; a batch closes early rather than
    /// exceed it.
    pub max_tokens_per_batch: Option<u64>,
    pub parallelism: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            mode: BatchMode::default(),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_tokens_per_batch: None,
            parallelism: DEFAULT_PARALLELISM,
        }
    }
}

/// Name used in commit messages, status contexts, and the state/review file
/// family.
pub const DEFAULT_TOOL_NAME: &str = "kantra-ai";

#[derive(Debug, Clone)]
pub struct CommitConfig {
    pub strategy: Granularity,
    pub tool_name: String,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            strategy: Granularity::default(),
            tool_name: DEFAULT_TOOL_NAME.to_string(),
        }
    }
}

pub const DEFAULT_BRANCH_PREFIX: &str = "remedy";

#[derive(Debug, Clone)]
pub struct PrConfig {
    pub enabled: bool,
    pub strategy: Granularity,
    pub branch_prefix: String,
    /// Explicit base branch; falls back to the remote default, then local
    /// `origin/HEAD`, then `main`.
    pub base_branch: Option<String>,
    /// Post an inline review comment on fixes below this confidence.
    /// Zero disables commenting.
    pub comment_threshold: f64,
}

impl Default for PrConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            strategy: Granularity::default(),
            branch_prefix: DEFAULT_BRANCH_PREFIX.to_string(),
            base_branch: None,
            comment_threshold: 0.0,
        }
    }
}

pub const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Default)]
pub struct VerifyConfig {
    /// `None` disables verification entirely.
    pub strategy: Option<VerifyStrategy>,
    pub verify_type: VerifyType,
    /// User-supplied command; overrides project detection.
    pub command: Option<String>,
    pub timeout: Option<Duration>,
    pub fail_fast: bool,
}

impl VerifyConfig {
    pub fn timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_VERIFY_TIMEOUT)
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Root of the repository being remediated.
    pub input_dir: PathBuf,
    pub plan_path: PathBuf,
    /// State file path; defaults to `<input_dir>/.kantra-ai-state.yaml`.
    pub state_path: Option<PathBuf>,
    pub phase_filter: Option<String>,
    pub resume: bool,
    pub dry_run: bool,
    /// Accept a plan whose hash differs from the stored state.
    pub force: bool,
    pub max_cost: Option<f64>,
    /// Retry incidents recorded as failed when resuming.
    pub retry_failed: bool,
    pub batch: BatchConfig,
    pub gate: GateConfig,
    pub commit: CommitConfig,
    pub pr: PrConfig,
    pub verify: VerifyConfig,
    /// Token for the code-host API (PRs, statuses, comments).
    pub github_token: Option<String>,
}

impl ExecutorConfig {
    pub fn new(input_dir: PathBuf, plan_path: PathBuf) -> Self {
        Self {
            input_dir,
            plan_path,
            state_path: None,
            phase_filter: None,
            resume: false,
            dry_run: false,
            force: false,
            max_cost: None,
            retry_failed: true,
            batch: BatchConfig::default(),
            gate: GateConfig::default(),
            commit: CommitConfig::default(),
            pr: PrConfig::default(),
            verify: VerifyConfig::default(),
            github_token: None,
        }
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_path
            .clone()
            .unwrap_or_else(|| self.input_dir.join(crate::state::STATE_FILE_NAME))
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    pub fn with_phase_filter(mut self, phase: Option<String>) -> Self {
        self.phase_filter = phase;
        self
    }

    pub fn with_max_cost(mut self, max_cost: Option<f64>) -> Self {
        self.max_cost = max_cost;
        self
    }
}
