//! End-to-end executor scenarios driven through the library API with a
//! scripted in-process provider over a tempdir git repository.

use async_trait::async_trait;
use remedy::config::{ExecutorConfig, Granularity, VerifyStrategy};
use remedy::confidence::LowConfidenceAction;
use remedy::errors::{ProviderError, RunError};
use remedy::executor::Executor;
use remedy::git::GitCli;
use remedy::model::{
    Category, Complexity, EffortRange, Incident, IncidentKey, Phase, Plan, Risk, Violation,
};
use remedy::provider::{
    BatchRequest, BatchResponse, FixProvider, FixRequest, FixResponse, IncidentFix, PlanRequest,
    PlanResponse,
};
use remedy::review::ReviewLog;
use remedy::state::{PhaseStatus, RunState, STATE_FILE_NAME};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

/// Scripted provider: fixes every incident with a fixed confidence and
/// records what it was asked.
struct ScriptedProvider {
    confidence: f64,
    calls: AtomicUsize,
    incidents_seen: AtomicUsize,
    seen_uris: std::sync::Mutex<Vec<String>>,
}

impl ScriptedProvider {
    fn new(confidence: f64) -> Self {
        Self {
            confidence,
            calls: AtomicUsize::new(0),
            incidents_seen: AtomicUsize::new(0),
            seen_uris: std::sync::Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl FixProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn fix_violation(&self, _request: FixRequest) -> Result<FixResponse, ProviderError> {
        unimplemented!("the engine always batches")
    }

    async fn fix_batch(&self, request: BatchRequest) -> Result<BatchResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.incidents_seen
            .fetch_add(request.incidents.len(), Ordering::SeqCst);
        {
            let mut seen = self.seen_uris.lock().unwrap();
            seen.extend(request.incidents.iter().map(|i| i.uri.clone()));
        }
        let fixes = request
            .incidents
            .iter()
            .map(|i| IncidentFix {
                incident_uri: i.uri.clone(),
                success: true,
                fixed_content: Some(format!("// remediated\nclass Fixed_{} {{}}\n", i.line)),
                error: None,
                confidence: self.confidence,
                explanation: "rewrote the file".to_string(),
            })
            .collect();
        Ok(BatchResponse {
            fixes,
            cost: 0.10,
            tokens: 200,
        })
    }

    async fn estimate_cost(&self, _request: &BatchRequest) -> Result<f64, ProviderError> {
        Ok(0.10)
    }

    async fn generate_plan(&self, _request: PlanRequest) -> Result<PlanResponse, ProviderError> {
        Ok(PlanResponse { phases: Vec::new() })
    }
}

async fn setup_repo(dir: &Path) -> GitCli {
    let git = GitCli::new(dir);
    git.init().await.unwrap();
    git.set_config("user.name", "test").await.unwrap();
    git.set_config("user.email", "test@test.com").await.unwrap();
    std::fs::write(dir.join("test.java"), "class Original {}\n").unwrap();
    git.add(&["test.java"]).await.unwrap();
    git.commit("seed").await.unwrap();
    git
}

fn incident(dir: &Path, file: &str, line: u32) -> Incident {
    Incident {
        uri: format!("file://{}/{file}", dir.display()),
        line_number: line,
        message: "needs migration".to_string(),
        code_snip: String::new(),
    }
}

fn violation(id: &str, effort: u8, incidents: Vec<Incident>) -> Violation {
    Violation {
        id: id.to_string(),
        description: "migrate the API call".to_string(),
        category: Category::Mandatory,
        effort,
        complexity: None,
        incidents,
    }
}

fn single_phase_plan(violations: Vec<Violation>) -> Plan {
    Plan::new(
        "scripted",
        vec![Phase {
            id: "p1".to_string(),
            name: "Phase one".to_string(),
            order: 1,
            risk: Risk::Low,
            category: Some(Category::Mandatory),
            effort_range: EffortRange { min: 0, max: 10 },
            estimated_cost: 0.0,
            deferred: false,
            violations,
        }],
    )
}

fn config_for(dir: &TempDir, plan_path: &Path) -> ExecutorConfig {
    ExecutorConfig::new(dir.path().to_path_buf(), plan_path.to_path_buf())
}

fn load_state(dir: &TempDir) -> RunState {
    let raw = std::fs::read_to_string(dir.path().join(STATE_FILE_NAME)).unwrap();
    serde_yaml::from_str(&raw).unwrap()
}

// ── scenario 1: happy path ───────────────────────────────────────────

#[tokio::test]
async fn happy_path_two_incidents_one_file_one_commit() {
    let dir = TempDir::new().unwrap();
    let git = setup_repo(dir.path()).await;
    let head_before = git.head_sha().await.unwrap();

    let plan = single_phase_plan(vec![violation(
        "v1",
        3,
        vec![incident(dir.path(), "test.java", 10), incident(dir.path(), "test.java", 20)],
    )]);
    let mut config = config_for(&dir, Path::new("plan.yaml"));
    config.commit.strategy = Granularity::PerViolation;

    let provider = Arc::new(ScriptedProvider::new(0.9));
    let executor = Executor::new(config, provider.clone());
    let result = executor.execute(&plan).await.unwrap();

    assert_eq!(result.summary.successful_fixes, 2);
    assert_eq!(result.summary.duplicate_fixes, 0);
    assert_eq!(result.commits.len(), 1);
    assert_eq!(result.commits[0].file_count, 1);
    assert_ne!(git.head_sha().await.unwrap(), head_before);

    let state = load_state(&dir);
    assert_eq!(state.phases.get("p1"), Some(&PhaseStatus::Completed));
    let content = std::fs::read_to_string(dir.path().join("test.java")).unwrap();
    assert!(content.contains("remediated"));
}

// ── scenario 2: deduplication ────────────────────────────────────────

#[tokio::test]
async fn duplicate_incidents_collapse_onto_one_provider_call() {
    let dir = TempDir::new().unwrap();
    setup_repo(dir.path()).await;

    let plan = single_phase_plan(vec![violation(
        "v1",
        3,
        vec![
            incident(dir.path(), "test.java", 10),
            incident(dir.path(), "test.java", 10),
            incident(dir.path(), "test.java", 10),
            incident(dir.path(), "test.java", 20),
        ],
    )]);
    let config = config_for(&dir, Path::new("plan.yaml"));
    let provider = Arc::new(ScriptedProvider::new(0.9));
    let executor = Executor::new(config, provider.clone());
    let result = executor.execute(&plan).await.unwrap();

    assert_eq!(provider.incidents_seen.load(Ordering::SeqCst), 2);
    assert_eq!(result.summary.successful_fixes, 2);
    assert_eq!(result.summary.duplicate_fixes, 2);
}

// ── scenario 3: defer to review ──────────────────────────────────────

#[tokio::test]
async fn low_confidence_defers_to_review_without_touching_files() {
    let dir = TempDir::new().unwrap();
    setup_repo(dir.path()).await;

    let mut v = violation("v1", 5, vec![incident(dir.path(), "test.java", 10)]);
    v.complexity = Some(Complexity::Medium); // threshold 0.80

    let plan = single_phase_plan(vec![v]);
    let mut config = config_for(&dir, Path::new("plan.yaml"));
    config.gate.low_confidence_action = LowConfidenceAction::DeferReview;

    let provider = Arc::new(ScriptedProvider::new(0.65));
    let executor = Executor::new(config, provider);
    let result = executor.execute(&plan).await.unwrap();

    assert_eq!(result.summary.skipped_fixes, 1);
    assert_eq!(result.summary.successful_fixes, 0);
    assert!(result.commits.is_empty());
    assert_eq!(
        std::fs::read_to_string(dir.path().join("test.java")).unwrap(),
        "class Original {}\n"
    );

    let review = ReviewLog::new(dir.path());
    let items = review.read_items().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].violation_id, "v1");
    assert_eq!(items[0].line_number, 10);
    assert_eq!(items[0].confidence, 0.65);
}

// ── scenario 4: resume after crash ───────────────────────────────────

#[tokio::test]
async fn resume_skips_completed_incidents_and_retries_failed() {
    let dir = TempDir::new().unwrap();
    setup_repo(dir.path()).await;

    let plan = single_phase_plan(vec![violation(
        "v1",
        3,
        vec![incident(dir.path(), "test.java", 10), incident(dir.path(), "test.java", 20)],
    )]);

    // Pre-seed: incident at line 10 completed, line 20 failed.
    let mut state = RunState::new(Path::new("plan.yaml"), &plan.compute_hash(), 1);
    state.record_incident_fix(&IncidentKey::new("v1", "test.java", 10));
    state.record_incident_failure(&IncidentKey::new("v1", "test.java", 20), "crash");
    std::fs::write(
        dir.path().join(STATE_FILE_NAME),
        serde_yaml::to_string(&state).unwrap(),
    )
    .unwrap();

    let config = config_for(&dir, Path::new("plan.yaml")).with_resume(true);
    let provider = Arc::new(ScriptedProvider::new(0.9));
    let executor = Executor::new(config, provider.clone());
    executor.execute(&plan).await.unwrap();

    assert_eq!(provider.incidents_seen.load(Ordering::SeqCst), 1);
    let seen = provider.seen_uris.lock().unwrap();
    assert!(seen[0].ends_with("test.java:20") || seen[0].ends_with("test.java"));

    let state = load_state(&dir);
    assert!(state.is_completed(&IncidentKey::new("v1", "test.java", 20)));
    assert!(state.failed_incidents.is_empty());
}

#[tokio::test]
async fn resume_of_completed_plan_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    setup_repo(dir.path()).await;

    let plan = single_phase_plan(vec![violation(
        "v1",
        3,
        vec![incident(dir.path(), "test.java", 10)],
    )]);

    let mut state = RunState::new(Path::new("plan.yaml"), &plan.compute_hash(), 1);
    state.record_incident_fix(&IncidentKey::new("v1", "test.java", 10));
    state.mark_phase_completed("p1");
    let counters_before = state.execution_summary.clone();
    std::fs::write(
        dir.path().join(STATE_FILE_NAME),
        serde_yaml::to_string(&state).unwrap(),
    )
    .unwrap();

    let config = config_for(&dir, Path::new("plan.yaml")).with_resume(true);
    let provider = Arc::new(ScriptedProvider::new(0.9));
    let executor = Executor::new(config, provider.clone());
    executor.execute(&plan).await.unwrap();

    assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    let after = load_state(&dir);
    assert_eq!(after.execution_summary.successful_fixes, counters_before.successful_fixes);
    assert_eq!(after.execution_summary.completed_phases, counters_before.completed_phases);
}

// ── scenario 5: verification rollback ────────────────────────────────

#[tokio::test]
async fn failed_verification_reverts_the_working_tree_and_continues() {
    let dir = TempDir::new().unwrap();
    setup_repo(dir.path()).await;

    let plan = single_phase_plan(vec![violation(
        "v1",
        3,
        vec![incident(dir.path(), "test.java", 10), incident(dir.path(), "test.java", 20)],
    )]);
    let mut config = config_for(&dir, Path::new("plan.yaml"));
    config.commit.strategy = Granularity::PerIncident;
    config.verify.strategy = Some(VerifyStrategy::PerFix);
    config.verify.command = Some("false".to_string());
    config.verify.fail_fast = false;

    let provider = Arc::new(ScriptedProvider::new(0.9));
    let executor = Executor::new(config, provider);
    let result = executor.execute(&plan).await.unwrap();

    // Tree restored to HEAD, nothing committed, both fixes skipped.
    assert_eq!(
        std::fs::read_to_string(dir.path().join("test.java")).unwrap(),
        "class Original {}\n"
    );
    assert!(result.commits.is_empty());
    assert_eq!(result.summary.skipped_fixes, 2);
    assert_eq!(result.summary.successful_fixes, 0);

    let state = load_state(&dir);
    assert_eq!(state.phases.get("p1"), Some(&PhaseStatus::Completed));
}

#[tokio::test]
async fn failed_verification_with_fail_fast_aborts_with_exit_code_4() {
    let dir = TempDir::new().unwrap();
    setup_repo(dir.path()).await;

    let plan = single_phase_plan(vec![violation(
        "v1",
        3,
        vec![incident(dir.path(), "test.java", 10)],
    )]);
    let mut config = config_for(&dir, Path::new("plan.yaml"));
    config.verify.strategy = Some(VerifyStrategy::PerFix);
    config.verify.command = Some("false".to_string());
    config.verify.fail_fast = true;

    let executor = Executor::new(config, Arc::new(ScriptedProvider::new(0.9)));
    let err = executor.execute(&plan).await.unwrap_err();
    assert!(matches!(err, RunError::VerificationFailed { .. }));
    assert_eq!(err.exit_code(), 4);
}

// ── scenario 6: path traversal rejection ─────────────────────────────

#[tokio::test]
async fn traversal_uri_is_rejected_without_a_provider_call() {
    let dir = TempDir::new().unwrap();
    setup_repo(dir.path()).await;

    let plan = single_phase_plan(vec![violation(
        "v1",
        3,
        vec![Incident {
            uri: "file:///src/../../etc/passwd".to_string(),
            line_number: 1,
            message: String::new(),
            code_snip: String::new(),
        }],
    )]);
    let config = config_for(&dir, Path::new("plan.yaml"));
    let provider = Arc::new(ScriptedProvider::new(0.9));
    let executor = Executor::new(config, provider.clone());
    let result = executor.execute(&plan).await.unwrap();

    assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    assert_eq!(result.summary.failed_fixes, 1);

    let state = load_state(&dir);
    let failure = state.failed_incidents.values().next().unwrap();
    assert!(
        failure.reason.contains("filesystem root") || failure.reason.contains("input directory"),
        "expected a security reason, got: {}",
        failure.reason
    );
}

// ── boundary behaviors ───────────────────────────────────────────────

#[tokio::test]
async fn empty_plan_fails_with_no_phases() {
    let dir = TempDir::new().unwrap();
    setup_repo(dir.path()).await;

    let plan = Plan::new("scripted", Vec::new());
    let config = config_for(&dir, Path::new("plan.yaml"));
    let executor = Executor::new(config, Arc::new(ScriptedProvider::new(0.9)));

    let err = executor.execute(&plan).await.unwrap_err();
    assert!(matches!(err, RunError::NoPhases));
    assert_eq!(err.exit_code(), 2);
}

#[tokio::test]
async fn cost_budget_skips_phase_and_exits_with_code_3() {
    let dir = TempDir::new().unwrap();
    setup_repo(dir.path()).await;

    let mut plan = single_phase_plan(vec![violation(
        "v1",
        3,
        vec![incident(dir.path(), "test.java", 10)],
    )]);
    plan.phases[0].estimated_cost = 5.0;

    let config = config_for(&dir, Path::new("plan.yaml")).with_max_cost(Some(1.0));
    let provider = Arc::new(ScriptedProvider::new(0.9));
    let executor = Executor::new(config, provider.clone());

    let err = executor.execute(&plan).await.unwrap_err();
    assert!(matches!(err, RunError::CostBudgetExceeded { .. }));
    assert_eq!(err.exit_code(), 3);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 0);

    let state = load_state(&dir);
    assert_eq!(state.phases.get("p1"), Some(&PhaseStatus::Pending));
}

#[tokio::test]
async fn dry_run_writes_nothing_and_records_placeholder_prs() {
    let dir = TempDir::new().unwrap();
    let git = setup_repo(dir.path()).await;
    let head_before = git.head_sha().await.unwrap();

    let plan = single_phase_plan(vec![violation(
        "v1",
        3,
        vec![incident(dir.path(), "test.java", 10)],
    )]);
    let mut config = config_for(&dir, Path::new("plan.yaml")).with_dry_run(true);
    config.pr.enabled = true;

    let executor = Executor::new(config, Arc::new(ScriptedProvider::new(0.9)));
    let result = executor.execute(&plan).await.unwrap();

    assert_eq!(result.summary.successful_fixes, 1);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("test.java")).unwrap(),
        "class Original {}\n"
    );
    assert_eq!(git.head_sha().await.unwrap(), head_before);
    assert!(result.commits.is_empty());
    assert_eq!(result.pull_requests.len(), 1);
    assert_eq!(result.pull_requests[0].number, 0);
    assert_eq!(result.pull_requests[0].url, "<DRY RUN>");
}

#[tokio::test]
async fn plan_hash_mismatch_is_fatal_without_force() {
    let dir = TempDir::new().unwrap();
    setup_repo(dir.path()).await;

    let plan = single_phase_plan(vec![violation(
        "v1",
        3,
        vec![incident(dir.path(), "test.java", 10)],
    )]);

    let state = RunState::new(Path::new("plan.yaml"), "some-other-hash", 1);
    std::fs::write(
        dir.path().join(STATE_FILE_NAME),
        serde_yaml::to_string(&state).unwrap(),
    )
    .unwrap();

    let config = config_for(&dir, Path::new("plan.yaml"));
    let executor = Executor::new(config, Arc::new(ScriptedProvider::new(0.9)));
    let err = executor.execute(&plan).await.unwrap_err();
    assert!(matches!(err, RunError::PlanHashMismatch { .. }));

    // With --force the run proceeds and rewrites the stored hash.
    let mut config = config_for(&dir, Path::new("plan.yaml"));
    config.force = true;
    let executor = Executor::new(config, Arc::new(ScriptedProvider::new(0.9)));
    executor.execute(&plan).await.unwrap();
    assert_eq!(load_state(&dir).plan_hash, plan.compute_hash());
}

#[tokio::test]
async fn phase_filter_runs_only_the_named_phase() {
    let dir = TempDir::new().unwrap();
    setup_repo(dir.path()).await;
    std::fs::write(dir.path().join("other.java"), "class Other {}\n").unwrap();

    let mut plan = single_phase_plan(vec![violation(
        "v1",
        3,
        vec![incident(dir.path(), "test.java", 10)],
    )]);
    plan.phases.push(Phase {
        id: "p2".to_string(),
        name: "Phase two".to_string(),
        order: 2,
        risk: Risk::Low,
        category: None,
        effort_range: EffortRange { min: 0, max: 10 },
        estimated_cost: 0.0,
        deferred: false,
        violations: vec![violation("v2", 3, vec![incident(dir.path(), "other.java", 5)])],
    });
    let plan = Plan::new("scripted", plan.phases);

    let config = config_for(&dir, Path::new("plan.yaml")).with_phase_filter(Some("p2".to_string()));
    let provider = Arc::new(ScriptedProvider::new(0.9));
    let executor = Executor::new(config, provider.clone());
    executor.execute(&plan).await.unwrap();

    assert_eq!(provider.incidents_seen.load(Ordering::SeqCst), 1);
    let state = load_state(&dir);
    assert_eq!(state.phases.get("p2"), Some(&PhaseStatus::Completed));
    assert!(!state.phases.contains_key("p1"));
}
