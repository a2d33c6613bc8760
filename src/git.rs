//! Thin wrapper over git porcelain.
//!
//! Every branch name and file path passes `paths::validate_git_argument`
//! inside this module, so no call site can hand git an unvalidated argument.
//! Commands run in the repository directory; failures surface the captured
//! stderr.

use crate::paths::validate_git_argument;
use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};
use tokio::process::Command;

pub struct GitCli {
    repo_dir: PathBuf,
}

impl GitCli {
    pub fn new(repo_dir: &Path) -> Self {
        Self {
            repo_dir: repo_dir.to_path_buf(),
        }
    }

    pub fn repo_dir(&self) -> &Path {
        &self.repo_dir
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_dir)
            .output()
            .await
            .with_context(|| format!("Failed to run git {}", args.join(" ")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git {} failed: {}", args.join(" "), stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub async fn is_repository(&self) -> bool {
        self.run(&["rev-parse", "--is-inside-work-tree"])
            .await
            .map(|out| out == "true")
            .unwrap_or(false)
    }

    pub async fn init(&self) -> Result<()> {
        self.run(&["init"]).await.map(|_| ())
    }

    pub async fn set_config(&self, key: &str, value: &str) -> Result<()> {
        self.run(&["config", key, value]).await.map(|_| ())
    }

    pub async fn head_sha(&self) -> Result<String> {
        self.run(&["rev-parse", "HEAD"]).await
    }

    pub async fn current_branch(&self) -> Result<String> {
        self.run(&["rev-parse", "--abbrev-ref", "HEAD"]).await
    }

    pub async fn status_porcelain(&self) -> Result<String> {
        self.run(&["status", "--porcelain"]).await
    }

    pub async fn has_uncommitted_changes(&self) -> Result<bool> {
        Ok(!self.status_porcelain().await?.is_empty())
    }

    /// Stage the given repo-relative paths.
    pub async fn add(&self, paths: &[&str]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        for path in paths {
            validate_git_argument(path)?;
        }
        let mut args = vec!["add", "--"];
        args.extend_from_slice(paths);
        self.run(&args).await.map(|_| ())
    }

    /// Create a commit from the index; returns the new commit sha.
    pub async fn commit(&self, message: &str) -> Result<String> {
        self.run(&["commit", "-m", message]).await?;
        self.head_sha().await
    }

    /// Discard every uncommitted change in the working tree and index.
    pub async fn reset_hard(&self) -> Result<()> {
        self.run(&["reset", "--hard", "HEAD"]).await.map(|_| ())
    }

    pub async fn checkout(&self, branch: &str) -> Result<()> {
        validate_git_argument(branch)?;
        self.run(&["checkout", branch]).await.map(|_| ())
    }

    pub async fn create_branch(&self, branch: &str) -> Result<()> {
        validate_git_argument(branch)?;
        self.run(&["checkout", "-b", branch]).await.map(|_| ())
    }

    pub async fn push_upstream(&self, branch: &str) -> Result<()> {
        validate_git_argument(branch)?;
        self.run(&["push", "-u", "origin", branch]).await.map(|_| ())
    }

    pub async fn remote_url(&self) -> Result<String> {
        self.run(&["remote", "get-url", "origin"]).await
    }

    /// Local notion of the remote default branch (`origin/HEAD`), if set.
    pub async fn origin_head_branch(&self) -> Option<String> {
        let full = self
            .run(&["rev-parse", "--abbrev-ref", "origin/HEAD"])
            .await
            .ok()?;
        full.strip_prefix("origin/").map(|b| b.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_repo() -> (GitCli, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let git = GitCli::new(dir.path());
        git.init().await.unwrap();
        git.set_config("user.name", "test").await.unwrap();
        git.set_config("user.email", "test@test.com").await.unwrap();
        (git, dir)
    }

    async fn commit_file(git: &GitCli, dir: &Path, name: &str, content: &str) -> String {
        std::fs::write(dir.join(name), content).unwrap();
        git.add(&[name]).await.unwrap();
        git.commit(&format!("add {name}")).await.unwrap()
    }

    #[tokio::test]
    async fn test_is_repository() {
        let (git, dir) = setup_repo().await;
        assert!(git.is_repository().await);
        let outside = GitCli::new(&dir.path().join("nowhere"));
        assert!(!outside.is_repository().await);
    }

    #[tokio::test]
    async fn test_add_commit_and_head_sha() {
        let (git, dir) = setup_repo().await;
        let sha = commit_file(&git, dir.path(), "a.txt", "hello").await;
        assert_eq!(sha.len(), 40);
        assert_eq!(git.head_sha().await.unwrap(), sha);
    }

    #[tokio::test]
    async fn test_status_reflects_dirty_tree() {
        let (git, dir) = setup_repo().await;
        commit_file(&git, dir.path(), "a.txt", "one").await;
        assert!(!git.has_uncommitted_changes().await.unwrap());

        std::fs::write(dir.path().join("a.txt"), "two").unwrap();
        assert!(git.has_uncommitted_changes().await.unwrap());
    }

    #[tokio::test]
    async fn test_reset_hard_discards_changes() {
        let (git, dir) = setup_repo().await;
        commit_file(&git, dir.path(), "a.txt", "one").await;
        std::fs::write(dir.path().join("a.txt"), "two").unwrap();

        git.reset_hard().await.unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "one");
    }

    #[tokio::test]
    async fn test_branch_create_and_checkout() {
        let (git, dir) = setup_repo().await;
        commit_file(&git, dir.path(), "a.txt", "one").await;
        let original = git.current_branch().await.unwrap();

        git.create_branch("remedy/test-branch-1").await.unwrap();
        assert_eq!(git.current_branch().await.unwrap(), "remedy/test-branch-1");

        git.checkout(&original).await.unwrap();
        assert_eq!(git.current_branch().await.unwrap(), original);
    }

    #[tokio::test]
    async fn test_add_rejects_hostile_path() {
        let (git, _dir) = setup_repo().await;
        assert!(git.add(&["-rf"]).await.is_err());
        assert!(git.add(&["../escape.txt"]).await.is_err());
    }

    #[tokio::test]
    async fn test_checkout_rejects_hostile_branch() {
        let (git, _dir) = setup_repo().await;
        assert!(git.create_branch("--force").await.is_err());
        assert!(git.create_branch("a..b").await.is_err());
    }
}
