//! The orchestrator: drives phases in plan order, owns the run state, and
//! coordinates the commit, PR, and verification tracks.
//!
//! Ordering within a phase is `batch-fix → verify → commit`: verification
//! runs before the commit flush at its boundary so a failure can still
//! revert the uncommitted tree. A single incident's failure never aborts the
//! phase; only verification failures under `fail_fast`, the cost budget, and
//! cancellation abort the run.

use crate::batch::{BatchEngine, FixOutcome, FixResult};
use crate::config::{ExecutorConfig, VerifyStrategy};
use crate::confidence::ConfidenceGate;
use crate::errors::RunError;
use crate::git::GitCli;
use crate::github::CodeHostClient;
use crate::model::{Phase, Plan, Violation};
use crate::paths::PathResolver;
use crate::provider::FixProvider;
use crate::review::ReviewLog;
use crate::state::{ExecutionSummary, RunState, StateStore};
use crate::tracker::{AcceptedFix, CommitRecord, CommitTracker, CreatedPr, PrTracker};
use crate::verify::{Verifier, VerifyOutcome};
use anyhow::Result;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Aggregate result of a completed run.
#[derive(Debug)]
pub struct RunResult {
    pub summary: ExecutionSummary,
    pub commits: Vec<CommitRecord>,
    pub pull_requests: Vec<CreatedPr>,
}

pub struct Executor {
    config: ExecutorConfig,
    provider: Arc<dyn FixProvider>,
    cancel: Arc<AtomicBool>,
}

impl Executor {
    pub fn new(config: ExecutorConfig, provider: Arc<dyn FixProvider>) -> Self {
        Self {
            config,
            provider,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag observed between batches and phases; set it (e.g. from a signal
    /// handler) to wind the run down cleanly.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub async fn execute(&self, plan: &Plan) -> Result<RunResult, RunError> {
        let plan_hash = plan.compute_hash();
        let phases = select_phases(plan, self.config.phase_filter.as_deref());
        if phases.is_empty() {
            return Err(RunError::NoPhases);
        }

        let mut store = self.open_state(plan, &plan_hash)?;
        let skip = self.resume_skip_set(store.state());

        let resolver = Arc::new(PathResolver::new(&self.config.input_dir).map_err(RunError::Other)?);
        let review = Arc::new(ReviewLog::new(resolver.input_dir()));
        let engine = BatchEngine::new(
            Arc::clone(&self.provider),
            Arc::clone(&resolver),
            ConfidenceGate::new(self.config.gate.clone()),
            review,
            self.config.batch.clone(),
            self.config.dry_run,
            Arc::clone(&self.cancel),
        );

        let git = GitCli::new(&self.config.input_dir);
        let client = self.build_client(&git).await;
        let mut commits = CommitTracker::new(
            &self.config.commit,
            &self.config.input_dir,
            self.config.dry_run,
        );
        let mut prs = self.config.pr.enabled.then(|| {
            PrTracker::new(
                &self.config.pr,
                &self.config.commit.tool_name,
                &self.config.input_dir,
                client.clone(),
                self.config.dry_run,
            )
        });
        let verifier = Verifier::new(
            self.config.verify.clone(),
            &self.config.input_dir,
            &self.config.commit.tool_name,
            client,
        );

        for phase in &phases {
            self.check_cancelled()?;
            if self.config.resume
                && store.state().phases.get(&phase.id) == Some(&crate::state::PhaseStatus::Completed)
            {
                tracing::info!(phase = %phase.id, "phase already completed; skipping");
                continue;
            }
            self.check_budget(phase, &mut store)?;

            tracing::info!(phase = %phase.id, name = %phase.name, "phase starting");
            store.update(|s| s.mark_phase_running(&phase.id))?;

            for violation in &phase.violations {
                self.check_cancelled()?;
                self.run_violation(
                    violation,
                    &engine,
                    &skip,
                    &mut store,
                    &git,
                    &mut commits,
                    prs.as_mut(),
                    &verifier,
                )
                .await?;

                if verifier.runs_at(VerifyStrategy::PerViolation) {
                    self.verify_boundary(
                        &format!("violation {}", violation.id),
                        &verifier,
                        &git,
                        &mut store,
                        &mut commits,
                        prs.as_mut(),
                    )
                    .await?;
                }
            }

            if verifier.runs_at(VerifyStrategy::PerPhase) {
                if let Err(err) = self
                    .verify_boundary(
                        &format!("phase {}", phase.id),
                        &verifier,
                        &git,
                        &mut store,
                        &mut commits,
                        prs.as_mut(),
                    )
                    .await
                {
                    store.update(|s| s.mark_phase_failed(&phase.id))?;
                    return Err(err);
                }
            }

            commits.on_phase_end(&phase.id).await?;
            if let Some(prs) = prs.as_mut() {
                prs.on_phase_end(&phase.id).await?;
            }
            store.update(|s| s.mark_phase_completed(&phase.id))?;
            tracing::info!(phase = %phase.id, "phase completed");
        }

        // At-end verification runs before the final commit so a failure never
        // publishes a bad tree.
        if verifier.runs_at(VerifyStrategy::AtEnd) {
            self.verify_boundary("run", &verifier, &git, &mut store, &mut commits, prs.as_mut())
                .await?;
        }
        commits.finalize().await?;
        if let Some(prs) = prs.as_mut() {
            prs.finalize().await?;
        }

        let summary = store.state().execution_summary.clone();
        tracing::info!(
            successful = summary.successful_fixes,
            failed = summary.failed_fixes,
            skipped = summary.skipped_fixes,
            duplicates = summary.duplicate_fixes,
            cost = summary.total_cost,
            tokens = summary.total_tokens,
            "run finished"
        );
        Ok(RunResult {
            summary,
            commits: commits.commits().to_vec(),
            pull_requests: prs.map(|p| p.created().to_vec()).unwrap_or_default(),
        })
    }

    /// Process one violation's results: state transitions, acceptance, and
    /// the per-fix verification track.
    #[allow(clippy::too_many_arguments)]
    async fn run_violation(
        &self,
        violation: &Violation,
        engine: &BatchEngine,
        skip: &HashSet<String>,
        store: &mut StateStore,
        git: &GitCli,
        commits: &mut CommitTracker,
        mut prs: Option<&mut PrTracker>,
        verifier: &Verifier,
    ) -> Result<(), RunError> {
        let report = engine.fix_violation(violation, skip).await;

        if report.duplicates > 0 {
            store.update(|s| {
                for _ in 0..report.duplicates {
                    s.record_duplicate_fix();
                }
            })?;
        }

        for result in report.results {
            // Provider cost is spent whatever the disposition.
            if result.cost > 0.0 || result.tokens > 0 {
                store.update(|s| {
                    s.bump_cost(result.cost);
                    s.bump_tokens(result.tokens);
                })?;
            }

            match &result.outcome {
                FixOutcome::Failed { error } => {
                    tracing::warn!(
                        key = %result.key,
                        error = %error,
                        "incident failed"
                    );
                    store.update(|s| s.record_incident_failure(&result.key, error))?;
                }
                FixOutcome::SkippedLowConfidence { reason }
                | FixOutcome::DeferredToReview { reason } => {
                    tracing::info!(key = %result.key, reason = %reason, "fix skipped");
                    store.update(|s| s.record_skipped_fix())?;
                }
                FixOutcome::Applied | FixOutcome::AppliedWithWarning { .. } => {
                    if verifier.runs_at(VerifyStrategy::PerFix) && !self.config.dry_run {
                        let head = git.head_sha().await.ok();
                        let outcome = verifier.verify(head.as_deref()).await?;
                        if let VerifyOutcome::Failed { output } = outcome {
                            tracing::warn!(key = %result.key, "verification failed; reverting fix");
                            git.reset_hard().await?;
                            store.update(|s| s.record_skipped_fix())?;
                            if verifier.fail_fast() {
                                return Err(RunError::VerificationFailed {
                                    scope: format!("fix {}", result.key),
                                    detail: truncate(&output, 2000),
                                });
                            }
                            continue;
                        }
                    }

                    store.update(|s| s.record_incident_fix(&result.key))?;
                    let fix = self.accepted_fix(violation, &result);
                    commits.record_fix(fix.clone()).await?;
                    if let Some(prs) = prs.as_deref_mut() {
                        prs.record_fix(fix).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Verification at a violation/phase/run boundary. On failure the
    /// uncommitted tree is reverted and still-buffered fixes are counted as
    /// skipped; `fail_fast` aborts instead.
    async fn verify_boundary(
        &self,
        scope: &str,
        verifier: &Verifier,
        git: &GitCli,
        store: &mut StateStore,
        commits: &mut CommitTracker,
        prs: Option<&mut PrTracker>,
    ) -> Result<(), RunError> {
        if self.config.dry_run {
            return Ok(());
        }
        let head = git.head_sha().await.ok();
        let outcome = verifier.verify(head.as_deref()).await?;
        let VerifyOutcome::Failed { output } = outcome else {
            return Ok(());
        };

        tracing::warn!(scope = %scope, "verification failed; reverting uncommitted changes");
        git.reset_hard().await?;
        let discarded = commits.discard_buffer();
        if let Some(prs) = prs {
            prs.discard_buffer();
        }
        store.update(|s| {
            for _ in 0..discarded.max(1) {
                s.record_skipped_fix();
            }
        })?;

        if verifier.fail_fast() {
            return Err(RunError::VerificationFailed {
                scope: scope.to_string(),
                detail: truncate(&output, 2000),
            });
        }
        Ok(())
    }

    fn open_state(&self, plan: &Plan, plan_hash: &str) -> Result<StateStore, RunError> {
        let state_path = self.config.state_path();
        let total_phases = plan.phases.len() as u32;
        let mut store = StateStore::open(&state_path, || {
            RunState::new(&self.config.plan_path, plan_hash, total_phases)
        })
        .map_err(RunError::Other)?;

        if store.state().plan_hash != plan_hash {
            if !self.config.force {
                return Err(RunError::PlanHashMismatch {
                    stored: store.state().plan_hash.clone(),
                    current: plan_hash.to_string(),
                });
            }
            tracing::warn!("plan hash changed; --force accepted the new plan");
            let plan_path = self.config.plan_path.display().to_string();
            let plan_hash = plan_hash.to_string();
            store.update(move |s| {
                s.plan_hash = plan_hash;
                s.plan_path = plan_path;
            })?;
        }
        Ok(store)
    }

    /// Keys to drop without provider calls: completed incidents when
    /// resuming, plus failed ones unless retry is enabled.
    fn resume_skip_set(&self, state: &RunState) -> HashSet<String> {
        let mut skip = HashSet::new();
        if !self.config.resume {
            return skip;
        }
        skip.extend(state.completed_incidents.iter().cloned());
        if !self.config.retry_failed {
            skip.extend(state.failed_incidents.keys().cloned());
        }
        skip
    }

    fn check_cancelled(&self) -> Result<(), RunError> {
        if self.cancel.load(Ordering::SeqCst) {
            tracing::info!("cancellation observed; state is saved");
            return Err(RunError::Cancelled);
        }
        Ok(())
    }

    /// Skip the phase and exit when its estimate would blow the budget.
    fn check_budget(&self, phase: &Phase, store: &mut StateStore) -> Result<(), RunError> {
        let Some(budget) = self.config.max_cost else {
            return Ok(());
        };
        let accumulated = store.state().execution_summary.total_cost;
        if accumulated + phase.estimated_cost > budget {
            store
                .update(|s| s.mark_phase_pending(&phase.id))
                .map_err(RunError::Other)?;
            return Err(RunError::CostBudgetExceeded {
                phase: phase.id.clone(),
                accumulated,
                estimated: phase.estimated_cost,
                budget,
            });
        }
        Ok(())
    }

    async fn build_client(&self, git: &GitCli) -> Option<CodeHostClient> {
        let token = self.config.github_token.as_ref()?;
        let url = match git.remote_url().await {
            Ok(url) => url,
            Err(err) => {
                tracing::debug!(error = %err, "no origin remote; code-host API disabled");
                return None;
            }
        };
        match CodeHostClient::from_remote_url(&url, token) {
            Ok(client) => Some(client),
            Err(err) => {
                tracing::warn!(error = %err, "could not build code-host client");
                None
            }
        }
    }

    fn accepted_fix(&self, violation: &Violation, result: &FixResult) -> AcceptedFix {
        AcceptedFix {
            key: result.key.clone(),
            violation_id: violation.id.clone(),
            description: violation.description.clone(),
            path: result.path.clone(),
            line: result.line,
            confidence: result.confidence,
            cost: result.cost,
            tokens: result.tokens,
            effort: violation.effort,
            provider: self.provider.name().to_string(),
        }
    }
}

/// Non-deferred phases in execution order, narrowed to `phase_filter` when
/// set.
fn select_phases<'a>(plan: &'a Plan, phase_filter: Option<&str>) -> Vec<&'a Phase> {
    plan.ordered_phases()
        .into_iter()
        .filter(|p| phase_filter.is_none_or(|id| p.id == id))
        .collect()
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        text.to_string()
    } else {
        let mut end = max;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &text[..end])
    }
}
