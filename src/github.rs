//! Minimal code-host REST client: pull requests, default branch, commit
//! statuses, and inline review comments.
//!
//! Works against the GitHub REST shape; non-github.com hosts are addressed
//! through their `/api/v3` prefix. Common failure statuses are translated to
//! actionable messages before they reach the operator.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const API_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT: &str = concat!("remedy/", env!("CARGO_PKG_VERSION"));

/// `owner/repo` plus the host it lives on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoSlug {
    pub host: String,
    pub owner: String,
    pub repo: String,
}

/// Parse a git remote URL in either of the two common forms:
/// `https://host/owner/repo[.git]` or `git@host:owner/repo[.git]`.
pub fn parse_remote_url(url: &str) -> Option<RepoSlug> {
    let (host, path) = if let Some(rest) = url.strip_prefix("https://") {
        let (host, path) = rest.split_once('/')?;
        (host, path)
    } else if let Some(rest) = url.strip_prefix("git@") {
        let (host, path) = rest.split_once(':')?;
        (host, path)
    } else {
        return None;
    };

    let path = path.strip_suffix(".git").unwrap_or(path);
    let mut segments = path.split('/');
    let owner = segments.next()?;
    let repo = segments.next()?;
    if owner.is_empty() || repo.is_empty() || segments.next().is_some() {
        return None;
    }
    Some(RepoSlug {
        host: host.to_string(),
        owner: owner.to_string(),
        repo: repo.to_string(),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatePullRequest {
    pub title: String,
    pub body: String,
    pub head: String,
    pub base: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub html_url: String,
}

/// Commit status state as the API spells it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusState {
    Pending,
    Success,
    Failure,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommitStatus {
    pub state: StatusState,
    pub context: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_url: Option<String>,
}

/// Inline review comment anchored to a diff position.
#[derive(Debug, Clone, Serialize)]
pub struct ReviewComment {
    pub body: String,
    pub commit_id: String,
    pub path: String,
    pub line: u32,
    pub side: String,
}

#[derive(Clone)]
pub struct CodeHostClient {
    client: reqwest::Client,
    api_base: String,
    slug: RepoSlug,
    token: String,
}

impl CodeHostClient {
    /// Build a client from the repository's `origin` URL and an API token.
    pub fn from_remote_url(url: &str, token: impl Into<String>) -> Result<Self> {
        let slug = parse_remote_url(url)
            .with_context(|| format!("Unrecognized remote URL {url:?}; use HTTPS or git@ form"))?;
        let api_base = if slug.host == "github.com" {
            "https://api.github.com".to_string()
        } else {
            format!("https://{}/api/v3", slug.host)
        };
        let client = reqwest::Client::builder()
            .timeout(API_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            api_base,
            slug,
            token: token.into(),
        })
    }

    fn repo_url(&self, suffix: &str) -> String {
        format!(
            "{}/repos/{}/{}{}",
            self.api_base, self.slug.owner, self.slug.repo, suffix
        )
    }

    pub async fn create_pull_request(&self, request: &CreatePullRequest) -> Result<PullRequest> {
        let resp = self
            .client
            .post(self.repo_url("/pulls"))
            .header("Authorization", format!("Bearer {}", self.token))
            .header("User-Agent", USER_AGENT)
            .json(request)
            .send()
            .await
            .context("Failed to send pull request creation")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("{}", translate_pr_error(status.as_u16(), &body));
        }
        resp.json::<PullRequest>()
            .await
            .context("Failed to parse pull request response")
    }

    /// Default branch of the repository, straight from the API.
    pub async fn default_branch(&self) -> Result<String> {
        #[derive(Deserialize)]
        struct Repo {
            default_branch: String,
        }
        let repo: Repo = self
            .client
            .get(self.repo_url(""))
            .header("Authorization", format!("Bearer {}", self.token))
            .header("User-Agent", USER_AGENT)
            .send()
            .await
            .context("Failed to query repository")?
            .error_for_status()
            .context("Repository query returned error status")?
            .json()
            .await
            .context("Failed to parse repository response")?;
        Ok(repo.default_branch)
    }

    pub async fn create_commit_status(&self, sha: &str, status: &CommitStatus) -> Result<()> {
        self.client
            .post(self.repo_url(&format!("/statuses/{sha}")))
            .header("Authorization", format!("Bearer {}", self.token))
            .header("User-Agent", USER_AGENT)
            .json(status)
            .send()
            .await
            .context("Failed to send commit status")?
            .error_for_status()
            .context("Commit status API returned error status")?;
        Ok(())
    }

    pub async fn create_review_comment(&self, pr_number: u64, comment: &ReviewComment) -> Result<()> {
        self.client
            .post(self.repo_url(&format!("/pulls/{pr_number}/comments")))
            .header("Authorization", format!("Bearer {}", self.token))
            .header("User-Agent", USER_AGENT)
            .json(comment)
            .send()
            .await
            .context("Failed to send review comment")?
            .error_for_status()
            .context("Review comment API returned error status")?;
        Ok(())
    }
}

/// Map common pull-request API failures to actionable messages.
pub fn translate_pr_error(status: u16, body: &str) -> String {
    match status {
        403 => "no write access to the repository; check the token scope".to_string(),
        422 if body.contains("No commits") => {
            "base and head are identical; nothing to open a pull request for".to_string()
        }
        422 if body.contains("already exists") => {
            "a pull request is already open for this head branch".to_string()
        }
        _ => format!("pull request creation failed with HTTP {status}: {body}"),
    }
}

/// Map git push transport failures to actionable messages.
pub fn translate_push_error(stderr: &str) -> Option<String> {
    if stderr.contains("Permission denied (publickey)") || stderr.contains("Could not read from remote") {
        return Some(
            "push rejected: SSH authentication failed; use an HTTPS remote or install the deploy key"
                .to_string(),
        );
    }
    None
}
