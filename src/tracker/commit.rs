//! Commit tracker: stages accepted fixes and commits them under the
//! configured granularity.
//!
//! Invariants:
//! - a file is staged at most once per commit
//! - a commit is never created with zero staged files
//! - every successful commit is recorded for PR creation and status targets

use crate::config::{CommitConfig, Granularity};
use crate::git::GitCli;
use crate::tracker::{AcceptedFix, sort_fixes};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::path::Path;

/// What a flush is committing: the labels feed the commit message.
#[derive(Debug, Clone)]
pub enum CommitScope {
    Violation(String),
    Phase(String),
    Run,
}

#[derive(Debug, Clone)]
pub struct CommitRecord {
    pub sha: String,
    pub scope: String,
    pub file_count: usize,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

pub struct CommitTracker {
    strategy: Granularity,
    git: GitCli,
    tool: String,
    dry_run: bool,
    buffer: Vec<AcceptedFix>,
    commits: Vec<CommitRecord>,
}

impl CommitTracker {
    pub fn new(config: &CommitConfig, repo_dir: &Path, dry_run: bool) -> Self {
        Self {
            strategy: config.strategy,
            git: GitCli::new(repo_dir),
            tool: config.tool_name.clone(),
            dry_run,
            buffer: Vec::new(),
            commits: Vec::new(),
        }
    }

    pub fn commits(&self) -> &[CommitRecord] {
        &self.commits
    }

    pub fn has_buffered(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Accept a fix under the active strategy. Per-incident commits
    /// immediately; per-violation flushes when the violation changes.
    pub async fn record_fix(&mut self, fix: AcceptedFix) -> Result<()> {
        match self.strategy {
            Granularity::PerIncident => {
                let scope = CommitScope::Violation(fix.violation_id.clone());
                self.buffer.push(fix);
                self.flush(scope).await
            }
            Granularity::PerViolation => {
                if let Some(active) = self.buffer.last().map(|f| f.violation_id.clone()) {
                    if active != fix.violation_id {
                        self.flush(CommitScope::Violation(active)).await?;
                    }
                }
                self.buffer.push(fix);
                Ok(())
            }
            Granularity::PerPhase | Granularity::AtEnd => {
                self.buffer.push(fix);
                Ok(())
            }
        }
    }

    /// Phase boundary: per-phase flushes everything buffered in the phase;
    /// per-violation flushes the trailing violation.
    pub async fn on_phase_end(&mut self, phase_id: &str) -> Result<()> {
        match self.strategy {
            Granularity::PerPhase => self.flush(CommitScope::Phase(phase_id.to_string())).await,
            Granularity::PerViolation => self.flush_trailing_violation().await,
            _ => Ok(()),
        }
    }

    /// End of run: commit whatever is still buffered.
    pub async fn finalize(&mut self) -> Result<()> {
        match self.strategy {
            Granularity::PerViolation => self.flush_trailing_violation().await,
            _ => self.flush(CommitScope::Run).await,
        }
    }

    /// Drop buffered fixes without committing (verification rollback).
    /// Returns how many fixes were discarded.
    pub fn discard_buffer(&mut self) -> usize {
        let discarded = self.buffer.len();
        self.buffer.clear();
        discarded
    }

    async fn flush_trailing_violation(&mut self) -> Result<()> {
        if let Some(active) = self.buffer.last().map(|f| f.violation_id.clone()) {
            self.flush(CommitScope::Violation(active)).await?;
        }
        Ok(())
    }

    async fn flush(&mut self, scope: CommitScope) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let mut fixes = std::mem::take(&mut self.buffer);
        sort_fixes(&mut fixes);

        // Stage each file at most once.
        let staged: BTreeSet<String> = fixes
            .iter()
            .map(|f| f.path.to_string_lossy().into_owned())
            .collect();
        let paths: Vec<&str> = staged.iter().map(|s| s.as_str()).collect();
        let message = self.build_message(&fixes, &scope);

        if self.dry_run {
            tracing::info!(
                files = staged.len(),
                scope = %scope_label(&scope),
                "dry-run: would commit"
            );
            return Ok(());
        }

        self.git.add(&paths).await?;
        let sha = self.git.commit(&message).await?;
        tracing::info!(sha = %sha, files = staged.len(), "created commit");
        self.commits.push(CommitRecord {
            sha,
            scope: scope_label(&scope),
            file_count: staged.len(),
            message,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    fn build_message(&self, fixes: &[AcceptedFix], scope: &CommitScope) -> String {
        if fixes.len() == 1 {
            let fix = &fixes[0];
            let basename = fix
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| fix.path.display().to_string());
            return format!(
                "fix({}): {} in {}\n\n\
                 Violation: {}\n\
                 Description: {}\n\
                 File: {}\n\
                 Line: {}\n\
                 Provider: {}\n\
                 Cost: ${:.4}\n\
                 Tokens: {}\n",
                self.tool,
                fix.violation_id,
                basename,
                fix.violation_id,
                fix.description,
                fix.path.display(),
                fix.line,
                fix.provider,
                fix.cost,
                fix.tokens,
            );
        }

        let files: BTreeSet<&Path> = fixes.iter().map(|f| f.path.as_path()).collect();
        let title = match scope {
            CommitScope::Violation(id) => {
                format!("fix({}): {} ({} files)", self.tool, id, files.len())
            }
            CommitScope::Phase(id) => {
                format!("fix({}): phase {} ({} fixes)", self.tool, id, fixes.len())
            }
            CommitScope::Run => format!("fix({}): apply {} fixes", self.tool, fixes.len()),
        };

        let mut message = title;
        message.push_str("\n\n");
        for fix in fixes {
            message.push_str(&format!(
                "- {}:{} {} (confidence {:.2})\n",
                fix.path.display(),
                fix.line,
                fix.violation_id,
                fix.confidence
            ));
        }
        let cost: f64 = fixes.iter().map(|f| f.cost).sum();
        let tokens: u64 = fixes.iter().map(|f| f.tokens).sum();
        message.push_str(&format!("\nCost: ${cost:.4}\nTokens: {tokens}\n"));
        message
    }
}

fn scope_label(scope: &CommitScope) -> String {
    match scope {
        CommitScope::Violation(id) => id.clone(),
        CommitScope::Phase(id) => format!("phase-{id}"),
        CommitScope::Run => "run".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::test_support::accepted;

    async fn setup_repo() -> (tempfile::TempDir, GitCli) {
        let dir = tempfile::tempdir().unwrap();
        let git = GitCli::new(dir.path());
        git.init().await.unwrap();
        git.set_config("user.name", "test").await.unwrap();
        git.set_config("user.email", "t@t.com").await.unwrap();
        std::fs::write(dir.path().join("seed.txt"), "seed").unwrap();
        git.add(&["seed.txt"]).await.unwrap();
        git.commit("seed").await.unwrap();
        (dir, git)
    }

    fn tracker(dir: &Path, strategy: Granularity) -> CommitTracker {
        let config = CommitConfig {
            strategy,
            tool_name: "kantra-ai".to_string(),
        };
        CommitTracker::new(&config, dir, false)
    }

    fn touch(dir: &Path, name: &str) {
        std::fs::write(dir.join(name), format!("patched {name}")).unwrap();
    }

    #[tokio::test]
    async fn test_per_incident_commits_immediately() {
        let (dir, _git) = setup_repo().await;
        let mut tracker = tracker(dir.path(), Granularity::PerIncident);

        touch(dir.path(), "A.java");
        tracker
            .record_fix(accepted("v1", "A.java", 10, 0.9))
            .await
            .unwrap();

        assert_eq!(tracker.commits().len(), 1);
        let record = &tracker.commits()[0];
        assert_eq!(record.file_count, 1);
        assert!(record.message.starts_with("fix(kantra-ai): v1 in A.java"));
        assert!(record.message.contains("Line: 10"));
        assert!(record.message.contains("Provider: scripted"));
    }

    #[tokio::test]
    async fn test_per_violation_flushes_on_violation_change() {
        let (dir, _git) = setup_repo().await;
        let mut tracker = tracker(dir.path(), Granularity::PerViolation);

        touch(dir.path(), "A.java");
        touch(dir.path(), "B.java");
        tracker.record_fix(accepted("v1", "A.java", 10, 0.9)).await.unwrap();
        tracker.record_fix(accepted("v1", "A.java", 20, 0.9)).await.unwrap();
        assert_eq!(tracker.commits().len(), 0);

        tracker.record_fix(accepted("v2", "B.java", 5, 0.9)).await.unwrap();
        assert_eq!(tracker.commits().len(), 1);
        // Two fixes in one file: staged once, single commit.
        assert_eq!(tracker.commits()[0].file_count, 1);
        assert!(tracker.commits()[0].message.contains("v1"));

        tracker.finalize().await.unwrap();
        assert_eq!(tracker.commits().len(), 2);
        assert!(tracker.commits()[1].message.contains("v2 in B.java"));
    }

    #[tokio::test]
    async fn test_per_phase_commits_at_boundary() {
        let (dir, _git) = setup_repo().await;
        let mut tracker = tracker(dir.path(), Granularity::PerPhase);

        touch(dir.path(), "A.java");
        touch(dir.path(), "B.java");
        tracker.record_fix(accepted("v1", "A.java", 10, 0.9)).await.unwrap();
        tracker.record_fix(accepted("v2", "B.java", 5, 0.9)).await.unwrap();
        assert_eq!(tracker.commits().len(), 0);

        tracker.on_phase_end("p1").await.unwrap();
        assert_eq!(tracker.commits().len(), 1);
        let record = &tracker.commits()[0];
        assert_eq!(record.file_count, 2);
        assert!(record.message.contains("phase p1"));
    }

    #[tokio::test]
    async fn test_at_end_single_commit_in_finalize() {
        let (dir, _git) = setup_repo().await;
        let mut tracker = tracker(dir.path(), Granularity::AtEnd);

        touch(dir.path(), "A.java");
        touch(dir.path(), "B.java");
        tracker.record_fix(accepted("v1", "A.java", 10, 0.9)).await.unwrap();
        tracker.record_fix(accepted("v2", "B.java", 5, 0.9)).await.unwrap();
        tracker.on_phase_end("p1").await.unwrap();
        assert_eq!(tracker.commits().len(), 0);

        tracker.finalize().await.unwrap();
        assert_eq!(tracker.commits().len(), 1);
        assert!(tracker.commits()[0].message.contains("apply 2 fixes"));
    }

    #[tokio::test]
    async fn test_empty_buffer_never_commits() {
        let (dir, _git) = setup_repo().await;
        let mut tracker = tracker(dir.path(), Granularity::AtEnd);
        tracker.finalize().await.unwrap();
        assert!(tracker.commits().is_empty());
    }

    #[tokio::test]
    async fn test_discard_buffer_drops_fixes() {
        let (dir, _git) = setup_repo().await;
        let mut tracker = tracker(dir.path(), Granularity::PerViolation);
        touch(dir.path(), "A.java");
        tracker.record_fix(accepted("v1", "A.java", 10, 0.9)).await.unwrap();

        assert_eq!(tracker.discard_buffer(), 1);
        tracker.finalize().await.unwrap();
        assert!(tracker.commits().is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_records_nothing_and_touches_no_git() {
        let (dir, git) = setup_repo().await;
        let head_before = git.head_sha().await.unwrap();

        let config = CommitConfig {
            strategy: Granularity::PerIncident,
            tool_name: "kantra-ai".to_string(),
        };
        let mut tracker = CommitTracker::new(&config, dir.path(), true);
        touch(dir.path(), "A.java");
        tracker.record_fix(accepted("v1", "A.java", 10, 0.9)).await.unwrap();

        assert!(tracker.commits().is_empty());
        assert_eq!(git.head_sha().await.unwrap(), head_before);
    }
}
