//! Typed error hierarchy for the remediation engine.
//!
//! Three top-level enums cover the three subsystems:
//! - `RunError` — run-level failures that map to CLI exit codes
//! - `PathError` — path resolution and git-argument validation failures
//! - `ProviderError` — LLM provider transport failures

use thiserror::Error;

/// Fatal run-level failures. Everything else is recorded per-incident in the
/// run state and never aborts the phase loop.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("no phases to execute")]
    NoPhases,

    #[error(
        "plan hash mismatch: state file records {stored}, plan is {current} (pass --force to override)"
    )]
    PlanHashMismatch { stored: String, current: String },

    #[error(
        "cost budget exceeded before phase {phase}: {accumulated:.2} USD spent, phase estimated at {estimated:.2} USD, budget {budget:.2} USD"
    )]
    CostBudgetExceeded {
        phase: String,
        accumulated: f64,
        estimated: f64,
        budget: f64,
    },

    #[error("verification failed ({scope}): {detail}")]
    VerificationFailed { scope: String, detail: String },

    #[error("run cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RunError {
    /// CLI exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunError::NoPhases => 2,
            RunError::CostBudgetExceeded { .. } => 3,
            RunError::VerificationFailed { .. } => 4,
            RunError::PlanHashMismatch { .. } | RunError::Cancelled | RunError::Other(_) => 1,
        }
    }
}

/// Path resolution and git-argument validation failures. These are security
/// errors: the offending incident is failed without touching the provider.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("path {path} resolves outside the input directory")]
    OutsideInputRoot { path: String },

    #[error(
        "absolute path {path} points at a local filesystem root; the input directory is likely misconfigured"
    )]
    LocalFilesystemRoot { path: String },

    #[error("invalid git argument {arg:?}: {reason}")]
    InvalidGitArgument { arg: String, reason: String },
}

/// LLM provider transport failures.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("provider request timed out")]
    Timeout,

    #[error("provider transport error: {0}")]
    Transport(String),

    #[error("provider response malformed: {0}")]
    Malformed(String),
}

impl ProviderError {
    /// Transient failures are retried with backoff; everything else is
    /// mapped to per-incident failures without aborting the phase.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Status { status, .. } => matches!(status, 502 | 503 | 504),
            ProviderError::Timeout => true,
            _ => false,
        }
    }
}
