//! Batch fix engine: turns a violation's incidents into provider batches,
//! runs them on a bounded worker pool, and applies accepted fixes.
//!
//! Guarantees:
//! - one `FixResult` per unique incident key; the provider is called at most
//!   once per key per run
//! - a file read error fails every incident in its batch, never the phase
//! - cancellation is observed between batches; in-flight provider calls run
//!   to completion

use crate::confidence::{ConfidenceGate, GateAction};
use crate::config::{BatchConfig, BatchMode};
use crate::model::{Complexity, IncidentKey, Violation};
use crate::paths::PathResolver;
use crate::provider::{
    BatchRequest, FixProvider, IncidentContext, IncidentFix, estimate_batch_tokens,
};
use crate::review::{ReviewItem, ReviewLog};
use crate::state::atomic_write;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Semaphore, mpsc};

/// Disposition of a single incident after the engine is done with it.
#[derive(Debug, Clone, PartialEq)]
pub enum FixOutcome {
    Applied,
    AppliedWithWarning { reason: String },
    SkippedLowConfidence { reason: String },
    DeferredToReview { reason: String },
    Failed { error: String },
}

/// Per-incident outcome handed to the executor.
#[derive(Debug, Clone)]
pub struct FixResult {
    pub key: IncidentKey,
    pub path: PathBuf,
    pub line: u32,
    pub cost: f64,
    pub tokens: u64,
    pub confidence: f64,
    pub explanation: String,
    pub outcome: FixOutcome,
}

impl FixResult {
    pub fn success(&self) -> bool {
        matches!(
            self.outcome,
            FixOutcome::Applied | FixOutcome::AppliedWithWarning { .. }
        )
    }

    fn failed(key: IncidentKey, path: PathBuf, line: u32, error: String) -> Self {
        Self {
            key,
            path,
            line,
            cost: 0.0,
            tokens: 0,
            confidence: 0.0,
            explanation: String::new(),
            outcome: FixOutcome::Failed { error },
        }
    }
}

/// Everything `fix_violation` produced for one violation.
#[derive(Debug, Default)]
pub struct ViolationReport {
    pub results: Vec<FixResult>,
    /// Incidents collapsed onto an already-seen key in this run.
    pub duplicates: u64,
}

struct BatchJob {
    violation: Arc<Violation>,
    incidents: Vec<ResolvedIncident>,
}

#[derive(Debug, Clone)]
struct ResolvedIncident {
    key: IncidentKey,
    uri: String,
    path: PathBuf,
    line: u32,
    message: String,
    code_snip: String,
}

pub struct BatchEngine {
    provider: Arc<dyn FixProvider>,
    resolver: Arc<PathResolver>,
    gate: ConfidenceGate,
    review: Arc<ReviewLog>,
    config: BatchConfig,
    dry_run: bool,
    cancel: Arc<AtomicBool>,
    seen: Mutex<HashSet<IncidentKey>>,
}

impl BatchEngine {
    pub fn new(
        provider: Arc<dyn FixProvider>,
        resolver: Arc<PathResolver>,
        gate: ConfidenceGate,
        review: Arc<ReviewLog>,
        config: BatchConfig,
        dry_run: bool,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            provider,
            resolver,
            gate,
            review,
            config,
            dry_run,
            cancel,
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// Fix every unique incident of one violation. Keys in `skip` (already
    /// completed in a previous run, or excluded from retry) are dropped
    /// silently; keys already seen in this run count as duplicates.
    pub async fn fix_violation(
        &self,
        violation: &Violation,
        skip: &HashSet<String>,
    ) -> ViolationReport {
        let mut report = ViolationReport::default();
        let mut unique: Vec<ResolvedIncident> = Vec::new();

        for incident in &violation.incidents {
            let path = match self.resolver.resolve(&incident.uri) {
                Ok(path) => path,
                Err(err) => {
                    // Security rejection: the incident fails without a
                    // provider call.
                    let key = IncidentKey::new(
                        violation.id.clone(),
                        incident.uri.clone(),
                        incident.line_number,
                    );
                    report.results.push(FixResult::failed(
                        key,
                        PathBuf::new(),
                        incident.line_number,
                        err.to_string(),
                    ));
                    continue;
                }
            };

            let key = IncidentKey::new(
                violation.id.clone(),
                path.to_string_lossy().into_owned(),
                incident.line_number,
            );
            if skip.contains(&key.to_string()) {
                continue;
            }
            {
                let mut seen = self
                    .seen
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                if !seen.insert(key.clone()) {
                    report.duplicates += 1;
                    continue;
                }
            }
            unique.push(ResolvedIncident {
                key,
                uri: incident.uri.clone(),
                path,
                line: incident.line_number,
                message: incident.message.clone(),
                code_snip: incident.code_snip.clone(),
            });
        }

        if unique.is_empty() {
            return report;
        }

        let batches = self.split_batches(unique);
        let violation = Arc::new(violation.clone());

        let worker_count = self.config.parallelism.max(1).min(batches.len());
        let semaphore = Arc::new(Semaphore::new(worker_count));
        let (result_tx, mut result_rx) = mpsc::channel::<Vec<FixResult>>(batches.len());

        let mut handles = Vec::with_capacity(batches.len());
        for incidents in batches {
            let job = BatchJob {
                violation: Arc::clone(&violation),
                incidents,
            };
            let semaphore = Arc::clone(&semaphore);
            let tx = result_tx.clone();
            let worker = BatchWorker {
                provider: Arc::clone(&self.provider),
                resolver: Arc::clone(&self.resolver),
                gate: self.gate.clone(),
                review: Arc::clone(&self.review),
                dry_run: self.dry_run,
                cancel: Arc::clone(&self.cancel),
            };
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await;
                let results = worker.run(job).await;
                let _ = tx.send(results).await;
            }));
        }
        drop(result_tx);

        while let Some(mut results) = result_rx.recv().await {
            report.results.append(&mut results);
        }
        for handle in handles {
            let _ = handle.await;
        }

        // Batches complete in arbitrary order; normalize for deterministic
        // state writes and commit messages.
        report
            .results
            .sort_by(|a, b| a.key.cmp(&b.key));
        report
    }

    /// Group incidents into batches honoring the mode, the size cap, and the
    /// optional token ceiling.
    fn split_batches(&self, incidents: Vec<ResolvedIncident>) -> Vec<Vec<ResolvedIncident>> {
        let groups: Vec<Vec<ResolvedIncident>> = match self.config.mode {
            BatchMode::FileGroup => {
                let mut by_file: BTreeMap<PathBuf, Vec<ResolvedIncident>> = BTreeMap::new();
                for incident in incidents {
                    by_file.entry(incident.path.clone()).or_default().push(incident);
                }
                by_file.into_values().collect()
            }
            BatchMode::Sequential => vec![incidents],
        };

        let mut batches = Vec::new();
        for group in groups {
            let mut current: Vec<ResolvedIncident> = Vec::new();
            let mut current_files: HashSet<PathBuf> = HashSet::new();
            let mut current_chars = 0usize;

            for incident in group {
                let added_chars = if current_files.contains(&incident.path) {
                    0
                } else {
                    file_size_estimate(&self.resolver.full_path(&incident.path))
                };

                let would_exceed_tokens = self.config.max_tokens_per_batch.is_some_and(|cap| {
                    estimate_batch_tokens(current_chars + added_chars, current.len() + 1) > cap
                });
                if !current.is_empty()
                    && (current.len() >= self.config.max_batch_size || would_exceed_tokens)
                {
                    batches.push(std::mem::take(&mut current));
                    current_files.clear();
                    current_chars = 0;
                }

                if current_files.insert(incident.path.clone()) {
                    current_chars += file_size_estimate(&self.resolver.full_path(&incident.path));
                }
                current.push(incident);
            }
            if !current.is_empty() {
                batches.push(current);
            }
        }
        batches
    }
}

fn file_size_estimate(path: &std::path::Path) -> usize {
    std::fs::metadata(path).map(|m| m.len() as usize).unwrap_or(0)
}

/// Owned clone of the engine's shared handles, movable into a spawned task.
struct BatchWorker {
    provider: Arc<dyn FixProvider>,
    resolver: Arc<PathResolver>,
    gate: ConfidenceGate,
    review: Arc<ReviewLog>,
    dry_run: bool,
    cancel: Arc<AtomicBool>,
}

impl BatchWorker {
    async fn run(&self, job: BatchJob) -> Vec<FixResult> {
        // Cancellation is observed between batches, never mid-RPC.
        if self.cancel.load(Ordering::SeqCst) {
            return fail_batch(&job.incidents, "run cancelled");
        }

        // Load every file once per batch.
        let mut contents: HashMap<PathBuf, String> = HashMap::new();
        for incident in &job.incidents {
            if contents.contains_key(&incident.path) {
                continue;
            }
            let full = self.resolver.full_path(&incident.path);
            match std::fs::read_to_string(&full) {
                Ok(text) => {
                    contents.insert(incident.path.clone(), text);
                }
                Err(err) => {
                    // One read error fails the whole batch.
                    return fail_batch(
                        &job.incidents,
                        &format!("failed to read {}: {err}", incident.path.display()),
                    );
                }
            }
        }

        let language = job
            .incidents
            .first()
            .map(|i| detect_language(&i.path))
            .unwrap_or("unknown");

        let request = BatchRequest {
            violation: (*job.violation).clone(),
            incidents: job
                .incidents
                .iter()
                .map(|i| IncidentContext {
                    uri: i.uri.clone(),
                    path: i.path.to_string_lossy().into_owned(),
                    line: i.line,
                    message: i.message.clone(),
                    code_snip: i.code_snip.clone(),
                })
                .collect(),
            file_contents: job
                .incidents
                .iter()
                .filter_map(|i| {
                    contents
                        .get(&i.path)
                        .map(|c| (i.path.to_string_lossy().into_owned(), c.clone()))
                })
                .collect(),
            language: language.to_string(),
        };

        let response = match self.provider.fix_batch(request).await {
            Ok(response) => response,
            Err(err) => return fail_batch(&job.incidents, &err.to_string()),
        };

        // Cost and tokens are distributed uniformly across the batch.
        let share = job.incidents.len().max(1) as u64;
        let cost_share = response.cost / share as f64;
        let token_share = response.tokens / share;

        let fixes_by_uri: HashMap<&str, &IncidentFix> = response
            .fixes
            .iter()
            .map(|f| (f.incident_uri.as_str(), f))
            .collect();

        let mut results = Vec::with_capacity(job.incidents.len());
        for incident in &job.incidents {
            let mut result = match fixes_by_uri.get(incident.uri.as_str()) {
                Some(fix) => self.accept(&job.violation, incident, fix),
                None => FixResult::failed(
                    incident.key.clone(),
                    incident.path.clone(),
                    incident.line,
                    "provider returned no fix for this incident".to_string(),
                ),
            };
            result.cost = cost_share;
            result.tokens = token_share;
            results.push(result);
        }
        results
    }

    /// Gate a returned fix and carry out its disposition.
    fn accept(
        &self,
        violation: &Violation,
        incident: &ResolvedIncident,
        fix: &IncidentFix,
    ) -> FixResult {
        let base = |outcome: FixOutcome| FixResult {
            key: incident.key.clone(),
            path: incident.path.clone(),
            line: incident.line,
            cost: 0.0,
            tokens: 0,
            confidence: fix.confidence,
            explanation: fix.explanation.clone(),
            outcome,
        };

        if !fix.success {
            let error = fix
                .error
                .clone()
                .unwrap_or_else(|| "provider reported failure".to_string());
            return base(FixOutcome::Failed { error });
        }

        let decision = self
            .gate
            .evaluate(fix.confidence, violation.complexity, violation.effort);

        match decision.action {
            GateAction::Apply | GateAction::WarnApply => {
                let Some(content) = fix.fixed_content.as_deref() else {
                    return base(FixOutcome::Failed {
                        error: "provider marked success but returned no content".to_string(),
                    });
                };
                if !self.dry_run {
                    let full = self.resolver.full_path(&incident.path);
                    if let Err(err) = atomic_write(&full, content.as_bytes()) {
                        return base(FixOutcome::Failed {
                            error: format!("failed to write fix: {err}"),
                        });
                    }
                }
                if decision.action == GateAction::WarnApply {
                    tracing::warn!(
                        violation = %violation.id,
                        path = %incident.path.display(),
                        line = incident.line,
                        reason = %decision.reason,
                        "applying low-confidence fix"
                    );
                    base(FixOutcome::AppliedWithWarning {
                        reason: decision.reason,
                    })
                } else {
                    base(FixOutcome::Applied)
                }
            }
            GateAction::Skip => base(FixOutcome::SkippedLowConfidence {
                reason: decision.reason,
            }),
            GateAction::DeferReview => {
                if !self.dry_run {
                    let item = ReviewItem {
                        violation_id: violation.id.clone(),
                        file_path: incident.path.to_string_lossy().into_owned(),
                        line_number: incident.line,
                        description: violation.description.clone(),
                        confidence: fix.confidence,
                        reason: decision.reason.clone(),
                        category: violation.category,
                        effort: violation.effort,
                        complexity: effective_complexity(violation),
                    };
                    if let Err(err) = self.review.append(item) {
                        return base(FixOutcome::Failed {
                            error: format!("failed to append review item: {err}"),
                        });
                    }
                }
                base(FixOutcome::DeferredToReview {
                    reason: decision.reason,
                })
            }
        }
    }
}

fn effective_complexity(violation: &Violation) -> Option<Complexity> {
    violation
        .complexity
        .or(Some(Complexity::from_effort(violation.effort)))
}

fn fail_batch(incidents: &[ResolvedIncident], error: &str) -> Vec<FixResult> {
    incidents
        .iter()
        .map(|i| FixResult::failed(i.key.clone(), i.path.clone(), i.line, error.to_string()))
        .collect()
}

/// Language from the file extension; anything unrecognized is "unknown".
fn detect_language(path: &std::path::Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("java") => "java",
        Some("py") => "python",
        Some("go") => "go",
        Some("js") => "javascript",
        Some("ts") => "typescript",
        Some("rb") => "ruby",
        Some("xml") => "xml",
        Some("yaml") | Some("yml") => "yaml",
        _ => "unknown",
    }
}
