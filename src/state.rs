//! Durable run state: the resume point for a killed or cancelled run.
//!
//! One YAML file holds everything the executor needs to pick up where it
//! stopped: which incidents are done, which failed and why, per-phase status,
//! and the aggregate counters. Every mutating method stamps `updatedAt` and
//! the store writes the file back atomically after each transition.

use crate::model::IncidentKey;
use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Default state file name, kept alongside the repository being remediated.
pub const STATE_FILE_NAME: &str = ".kantra-ai-state.yaml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub total_phases: u32,
    pub completed_phases: u32,
    pub successful_fixes: u64,
    pub failed_fixes: u64,
    pub skipped_fixes: u64,
    pub duplicate_fixes: u64,
    pub total_cost: f64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    pub reason: String,
    pub attempts: u32,
    pub last_attempt: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    pub plan_path: String,
    pub plan_hash: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub execution_summary: ExecutionSummary,
    #[serde(default)]
    pub completed_incidents: BTreeSet<String>,
    #[serde(default)]
    pub failed_incidents: BTreeMap<String, FailureRecord>,
    #[serde(default)]
    pub phases: BTreeMap<String, PhaseStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<String>,
}

impl RunState {
    pub fn new(plan_path: &Path, plan_hash: &str, total_phases: u32) -> Self {
        let now = Utc::now();
        Self {
            plan_path: plan_path.display().to_string(),
            plan_hash: plan_hash.to_string(),
            started_at: now,
            updated_at: now,
            execution_summary: ExecutionSummary {
                total_phases,
                ..ExecutionSummary::default()
            },
            completed_incidents: BTreeSet::new(),
            failed_incidents: BTreeMap::new(),
            phases: BTreeMap::new(),
            last_failure: None,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn is_completed(&self, key: &IncidentKey) -> bool {
        self.completed_incidents.contains(&key.to_string())
    }

    pub fn is_failed(&self, key: &IncidentKey) -> bool {
        self.failed_incidents.contains_key(&key.to_string())
    }

    /// Record a successful fix. The key moves out of `failedIncidents` if a
    /// previous attempt failed; the two sets stay disjoint.
    pub fn record_incident_fix(&mut self, key: &IncidentKey) {
        let key = key.to_string();
        self.failed_incidents.remove(&key);
        if self.completed_incidents.insert(key) {
            self.execution_summary.successful_fixes += 1;
        }
        self.touch();
    }

    pub fn record_incident_failure(&mut self, key: &IncidentKey, reason: &str) {
        let key_str = key.to_string();
        if self.completed_incidents.contains(&key_str) {
            // Already completed in this or an earlier run; a later failure for
            // the same key must not violate disjointness.
            return;
        }
        let entry = self
            .failed_incidents
            .entry(key_str.clone())
            .or_insert_with(|| FailureRecord {
                reason: reason.to_string(),
                attempts: 0,
                last_attempt: Utc::now(),
            });
        entry.reason = reason.to_string();
        entry.attempts += 1;
        entry.last_attempt = Utc::now();
        self.execution_summary.failed_fixes += 1;
        self.last_failure = Some(key_str);
        self.touch();
    }

    pub fn record_skipped_fix(&mut self) {
        self.execution_summary.skipped_fixes += 1;
        self.touch();
    }

    pub fn record_duplicate_fix(&mut self) {
        self.execution_summary.duplicate_fixes += 1;
        self.touch();
    }

    pub fn mark_phase_running(&mut self, phase_id: &str) {
        self.phases
            .insert(phase_id.to_string(), PhaseStatus::Running);
        self.touch();
    }

    pub fn mark_phase_completed(&mut self, phase_id: &str) {
        let previous = self
            .phases
            .insert(phase_id.to_string(), PhaseStatus::Completed);
        if previous != Some(PhaseStatus::Completed) {
            self.execution_summary.completed_phases += 1;
        }
        self.touch();
    }

    pub fn mark_phase_failed(&mut self, phase_id: &str) {
        self.phases.insert(phase_id.to_string(), PhaseStatus::Failed);
        self.touch();
    }

    pub fn mark_phase_pending(&mut self, phase_id: &str) {
        self.phases
            .entry(phase_id.to_string())
            .or_insert(PhaseStatus::Pending);
        self.touch();
    }

    pub fn bump_cost(&mut self, cost: f64) {
        self.execution_summary.total_cost += cost;
        self.touch();
    }

    pub fn bump_tokens(&mut self, tokens: u64) {
        self.execution_summary.total_tokens += tokens;
        self.touch();
    }

    fn validate(&self) -> Result<()> {
        if self.updated_at < self.started_at {
            bail!("state file is corrupt: updatedAt precedes startedAt");
        }
        for key in self.failed_incidents.keys() {
            if self.completed_incidents.contains(key) {
                bail!("state file is corrupt: incident {key} is both completed and failed");
            }
        }
        Ok(())
    }
}

/// Owns the state file: exclusive advisory lock, atomic write-back after
/// every transition.
pub struct StateStore {
    path: PathBuf,
    state: RunState,
    // Held for the lifetime of the run. The lock lives on a sidecar file so
    // the atomic rename of the state file never replaces the locked inode.
    _lock: File,
}

impl StateStore {
    /// Load the existing state file, or initialize a fresh one. Acquires the
    /// advisory lock; a second process on the same state path fails here.
    pub fn open(path: &Path, fallback: impl FnOnce() -> RunState) -> Result<Self> {
        let lock = acquire_lock(path)?;
        let state = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read state file {}", path.display()))?;
            let state: RunState = serde_yaml::from_str(&raw)
                .with_context(|| format!("Failed to parse state file {}", path.display()))?;
            state.validate()?;
            state
        } else {
            fallback()
        };
        Ok(Self {
            path: path.to_path_buf(),
            state,
            _lock: lock,
        })
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Apply a transition and persist the result. Callers never observe a
    /// partially written file.
    pub fn update<R>(&mut self, transition: impl FnOnce(&mut RunState) -> R) -> Result<R> {
        let result = transition(&mut self.state);
        self.save()?;
        Ok(result)
    }

    /// Replace the whole state (plan-hash force override).
    pub fn replace(&mut self, state: RunState) -> Result<()> {
        self.state = state;
        self.save()
    }

    fn save(&self) -> Result<()> {
        let raw = serde_yaml::to_string(&self.state).context("Failed to serialize run state")?;
        atomic_write(&self.path, raw.as_bytes())
    }
}

fn acquire_lock(state_path: &Path) -> Result<File> {
    let lock_path = lock_path_for(state_path);
    let lock = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
        .with_context(|| format!("Failed to open lock file {}", lock_path.display()))?;
    lock.try_lock_exclusive().with_context(|| {
        format!(
            "Another run holds the state lock at {}",
            lock_path.display()
        )
    })?;
    Ok(lock)
}

fn lock_path_for(state_path: &Path) -> PathBuf {
    let mut name = state_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state".to_string());
    name.push_str(".lock");
    state_path.with_file_name(name)
}

/// Write-to-temp, fsync, rename. The parent directory is fsynced afterwards
/// so the rename itself is durable.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension(match path.extension() {
        Some(ext) => format!("{}.tmp", ext.to_string_lossy()),
        None => "tmp".to_string(),
    });

    {
        let mut file = File::create(&tmp)
            .with_context(|| format!("Failed to create temp file {}", tmp.display()))?;
        use std::io::Write;
        file.write_all(bytes)
            .with_context(|| format!("Failed to write temp file {}", tmp.display()))?;
        file.sync_all()
            .with_context(|| format!("Failed to sync temp file {}", tmp.display()))?;
    }

    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to rename {} into place", tmp.display()))?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            if let Ok(dir) = File::open(parent) {
                // Best effort: some filesystems refuse fsync on directories.
                let _ = dir.sync_all();
            }
        }
    }
    Ok(())
}
