//! PR tracker: branches, pushes, and opens pull requests for accepted fixes
//! under the configured granularity, mirroring the commit tracker's state
//! machine.

use crate::config::{Granularity, PrConfig};
use crate::git::GitCli;
use crate::github::{
    CodeHostClient, CreatePullRequest, ReviewComment, translate_push_error,
};
use crate::tracker::{AcceptedFix, sort_fixes};
use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::BTreeSet;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct CreatedPr {
    /// Zero for dry-run placeholders and API-less runs.
    pub number: u64,
    pub url: String,
    pub branch: String,
}

pub struct PrTracker {
    strategy: Granularity,
    git: GitCli,
    client: Option<CodeHostClient>,
    branch_prefix: String,
    base_branch: Option<String>,
    comment_threshold: f64,
    tool: String,
    dry_run: bool,
    buffer: Vec<AcceptedFix>,
    created: Vec<CreatedPr>,
    index: usize,
    original_branch: Option<String>,
}

impl PrTracker {
    pub fn new(
        config: &PrConfig,
        tool: &str,
        repo_dir: &Path,
        client: Option<CodeHostClient>,
        dry_run: bool,
    ) -> Self {
        Self {
            strategy: config.strategy,
            git: GitCli::new(repo_dir),
            client,
            branch_prefix: config.branch_prefix.clone(),
            base_branch: config.base_branch.clone(),
            comment_threshold: config.comment_threshold,
            tool: tool.to_string(),
            dry_run,
            buffer: Vec::new(),
            created: Vec::new(),
            index: 0,
            original_branch: None,
        }
    }

    pub fn created(&self) -> &[CreatedPr] {
        &self.created
    }

    pub async fn record_fix(&mut self, fix: AcceptedFix) -> Result<()> {
        match self.strategy {
            Granularity::PerIncident => {
                let scope = fix.violation_id.clone();
                self.buffer.push(fix);
                self.flush(&scope).await
            }
            Granularity::PerViolation => {
                if let Some(active) = self.buffer.last().map(|f| f.violation_id.clone()) {
                    if active != fix.violation_id {
                        self.flush(&active).await?;
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

    pub async fn on_phase_end(&mut self, phase_id: &str) -> Result<()> {
        match self.strategy {
            Granularity::PerPhase => self.flush(phase_id).await,
            Granularity::PerViolation => self.flush_trailing_violation().await,
            _ => Ok(()),
        }
    }

    pub async fn finalize(&mut self) -> Result<()> {
        match self.strategy {
            Granularity::PerViolation => self.flush_trailing_violation().await,
            _ => self.flush("final").await,
        }
    }

    /// Drop buffered fixes without opening a PR (verification rollback).
    pub fn discard_buffer(&mut self) -> usize {
        let discarded = self.buffer.len();
        self.buffer.clear();
        discarded
    }

    async fn flush_trailing_violation(&mut self) -> Result<()> {
        if let Some(active) = self.buffer.last().map(|f| f.violation_id.clone()) {
            self.flush(&active).await?;
        }
        Ok(())
    }

    async fn flush(&mut self, scope: &str) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let mut fixes = std::mem::take(&mut self.buffer);
        sort_fixes(&mut fixes);

        let branch = self.branch_name(scope);
        let title = format!("Automated remediation: {scope} ({} fixes)", fixes.len());
        let body = build_body(&self.tool, &fixes);

        if self.dry_run {
            tracing::info!(branch = %branch, fixes = fixes.len(), "dry-run: would open PR");
            self.created.push(CreatedPr {
                number: 0,
                url: "<DRY RUN>".to_string(),
                branch,
            });
            self.index += 1;
            return Ok(());
        }

        if self.original_branch.is_none() {
            self.original_branch = Some(self.git.current_branch().await?);
        }

        self.git.create_branch(&branch).await?;
        if let Err(err) = self.git.push_upstream(&branch).await {
            let restored = self.restore_original_branch().await;
            let message = translate_push_error(&err.to_string()).unwrap_or_else(|| err.to_string());
            restored?;
            anyhow::bail!("{message}");
        }

        let created = match &self.client {
            Some(client) => {
                let base = self.resolve_base_branch(client).await;
                let pr = client
                    .create_pull_request(&CreatePullRequest {
                        title,
                        body,
                        head: branch.clone(),
                        base,
                    })
                    .await
                    .context("Failed to open pull request")?;
                self.post_low_confidence_comments(client, pr.number, &fixes)
                    .await;
                CreatedPr {
                    number: pr.number,
                    url: pr.html_url,
                    branch: branch.clone(),
                }
            }
            None => {
                tracing::warn!(branch = %branch, "no code-host client; branch pushed without a PR");
                CreatedPr {
                    number: 0,
                    url: String::new(),
                    branch: branch.clone(),
                }
            }
        };

        tracing::info!(branch = %branch, url = %created.url, "pull request ready");
        self.created.push(created);
        self.index += 1;
        self.restore_original_branch().await
    }

    /// Explicit config wins, then the remote default via the API, then the
    /// local `origin/HEAD`, then `main`.
    async fn resolve_base_branch(&self, client: &CodeHostClient) -> String {
        if let Some(base) = &self.base_branch {
            return base.clone();
        }
        if let Ok(base) = client.default_branch().await {
            return base;
        }
        if let Some(base) = self.git.origin_head_branch().await {
            return base;
        }
        "main".to_string()
    }

    /// Comment failures are logged and tolerated; a PR without annotations is
    /// still a PR.
    async fn post_low_confidence_comments(
        &self,
        client: &CodeHostClient,
        pr_number: u64,
        fixes: &[AcceptedFix],
    ) {
        if self.comment_threshold <= 0.0 {
            return;
        }
        let commit_id = match self.git.head_sha().await {
            Ok(sha) => sha,
            Err(err) => {
                tracing::warn!(error = %err, "cannot resolve head sha for review comments");
                return;
            }
        };
        for fix in fixes.iter().filter(|f| f.confidence < self.comment_threshold) {
            let comment = ReviewComment {
                body: format!(
                    "Low-confidence fix ({:.2}) for `{}`: please review carefully.",
                    fix.confidence, fix.violation_id
                ),
                commit_id: commit_id.clone(),
                path: fix.path.to_string_lossy().into_owned(),
                line: fix.line,
                side: "RIGHT".to_string(),
            };
            if let Err(err) = client.create_review_comment(pr_number, &comment).await {
                tracing::warn!(
                    path = %comment.path,
                    line = comment.line,
                    error = %err,
                    "failed to post review comment"
                );
            }
        }
    }

    async fn restore_original_branch(&self) -> Result<()> {
        if let Some(original) = &self.original_branch {
            self.git.checkout(original).await?;
        }
        Ok(())
    }

    fn branch_name(&self, scope: &str) -> String {
        let slug = slugify(scope);
        let timestamp = Utc::now().timestamp();
        if self.index == 0 {
            format!("{}-{slug}-{timestamp}", self.branch_prefix)
        } else {
            format!("{}-{slug}-{timestamp}-{}", self.branch_prefix, self.index)
        }
    }
}

/// Reduce arbitrary scope labels to branch-safe slugs.
fn slugify(scope: &str) -> String {
    let slug: String = scope
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    slug.trim_matches('-').to_string()
}

/// Minutes of manual work a fix of the given effort is assumed to save.
fn effort_saved_minutes(effort: u8) -> u64 {
    match effort {
        0..=3 => 15,
        4..=5 => 30,
        _ => 60,
    }
}

fn format_minutes(total: u64) -> String {
    let hours = total / 60;
    let minutes = total % 60;
    match (hours, minutes) {
        (0, m) => format!("{m}m"),
        (h, 0) => format!("{h}h"),
        (h, m) => format!("{h}h {m}m"),
    }
}

fn confidence_icon(confidence: f64) -> &'static str {
    if confidence >= 0.9 {
        "✅"
    } else if confidence >= 0.7 {
        "🟡"
    } else {
        "⚠️"
    }
}

fn build_body(tool: &str, fixes: &[AcceptedFix]) -> String {
    let files: BTreeSet<&Path> = fixes.iter().map(|f| f.path.as_path()).collect();
    let saved: u64 = fixes.iter().map(|f| effort_saved_minutes(f.effort)).sum();
    let cost: f64 = fixes.iter().map(|f| f.cost).sum();
    let tokens: u64 = fixes.iter().map(|f| f.tokens).sum();

    let mut body = format!(
        "## Automated remediation by {tool}\n\n\
         - **Fixes:** {} across {} file(s)\n\
         - **Estimated effort saved:** {}\n\
         - **Cost:** ${cost:.4}\n\
         - **Tokens:** {tokens}\n\n\
         | File | Line | Violation | Confidence |\n\
         |---|---|---|---|\n",
        fixes.len(),
        files.len(),
        format_minutes(saved),
    );
    for fix in fixes {
        body.push_str(&format!(
            "| `{}` | {} | {} | {} {:.2} |\n",
            fix.path.display(),
            fix.line,
            fix.violation_id,
            confidence_icon(fix.confidence),
            fix.confidence
        ));
    }
    body.push_str(
        "\n### Review checklist\n\
         - [ ] The project builds and tests pass\n\
         - [ ] Behavior matches the migration target\n\
         - [ ] Low-confidence fixes were inspected line by line\n",
    );
    body
}
