//! Build/test verification with rollback support.
//!
//! Detects the project flavor, runs the build or test command with a
//! timeout, and optionally mirrors the result as a commit status on the
//! code host. Rollback policy (reset vs. abort) is decided by the executor;
//! this module only reports outcomes.

use crate::config::{VerifyConfig, VerifyStrategy, VerifyType};
use crate::github::{CodeHostClient, CommitStatus, StatusState};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tokio::time::timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectKind {
    Go,
    Maven,
    Gradle,
    Npm,
    Unknown,
}

/// Build-file detection, in precedence order.
pub fn detect_project(dir: &Path) -> ProjectKind {
    if dir.join("go.mod").exists() {
        ProjectKind::Go
    } else if dir.join("pom.xml").exists() {
        ProjectKind::Maven
    } else if dir.join("build.gradle").exists() || dir.join("build.gradle.kts").exists() {
        ProjectKind::Gradle
    } else if dir.join("package.json").exists() {
        ProjectKind::Npm
    } else {
        ProjectKind::Unknown
    }
}

/// Default command for a project flavor, or `None` when there is nothing
/// sensible to run.
pub fn default_command(kind: ProjectKind, verify_type: VerifyType) -> Option<&'static str> {
    match (kind, verify_type) {
        (ProjectKind::Go, VerifyType::Build) => Some("go build ./..."),
        (ProjectKind::Go, VerifyType::Test) => Some("go test ./..."),
        (ProjectKind::Maven, VerifyType::Build) => Some("mvn compile"),
        (ProjectKind::Maven, VerifyType::Test) => Some("mvn test"),
        (ProjectKind::Gradle, VerifyType::Build) => Some("gradle build -x test"),
        (ProjectKind::Gradle, VerifyType::Test) => Some("gradle test"),
        (ProjectKind::Npm, VerifyType::Build) => Some("npm run build"),
        (ProjectKind::Npm, VerifyType::Test) => Some("npm test"),
        (ProjectKind::Unknown, _) => None,
    }
}

#[derive(Debug)]
pub enum VerifyOutcome {
    Passed,
    Failed { output: String },
    /// Unknown project and no override configured; nothing was run.
    NoCommand,
}

impl VerifyOutcome {
    pub fn passed(&self) -> bool {
        !matches!(self, VerifyOutcome::Failed { .. })
    }
}

pub struct Verifier {
    config: VerifyConfig,
    repo_dir: PathBuf,
    tool: String,
    client: Option<CodeHostClient>,
}

impl Verifier {
    pub fn new(
        config: VerifyConfig,
        repo_dir: &Path,
        tool: &str,
        client: Option<CodeHostClient>,
    ) -> Self {
        Self {
            config,
            repo_dir: repo_dir.to_path_buf(),
            tool: tool.to_string(),
            client,
        }
    }

    /// Whether verification is configured for this boundary.
    pub fn runs_at(&self, boundary: VerifyStrategy) -> bool {
        self.config.strategy == Some(boundary)
    }

    pub fn fail_fast(&self) -> bool {
        self.config.fail_fast
    }

    fn status_context(&self) -> String {
        format!("{}/verify-{}", self.tool, self.config.verify_type.as_str())
    }

    /// Run the verification command. `head_sha` is the commit the status
    /// check is posted against, when a code-host client is present.
    pub async fn verify(&self, head_sha: Option<&str>) -> Result<VerifyOutcome> {
        let command = match self.config.command.clone() {
            Some(command) => command,
            None => {
                let kind = detect_project(&self.repo_dir);
                match default_command(kind, self.config.verify_type) {
                    Some(command) => command.to_string(),
                    None => {
                        tracing::debug!("no verification command for this project; skipping");
                        return Ok(VerifyOutcome::NoCommand);
                    }
                }
            }
        };

        self.post_status(head_sha, StatusState::Pending, "verification running")
            .await;
        tracing::info!(command = %command, "running verification");

        let child = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .current_dir(&self.repo_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn verification command: {command}"));

        let child = match child {
            Ok(child) => child,
            Err(err) => {
                self.post_status(head_sha, StatusState::Error, "could not start verification")
                    .await;
                return Err(err);
            }
        };

        let output = match timeout(self.config.timeout(), child.wait_with_output()).await {
            Ok(result) => result.context("Failed to wait for verification command")?,
            Err(_) => {
                self.post_status(head_sha, StatusState::Failure, "verification timed out")
                    .await;
                return Ok(VerifyOutcome::Failed {
                    output: format!(
                        "verification timed out after {}s",
                        self.config.timeout().as_secs()
                    ),
                });
            }
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if output.status.success() {
            self.post_status(head_sha, StatusState::Success, "verification passed")
                .await;
            Ok(VerifyOutcome::Passed)
        } else {
            self.post_status(head_sha, StatusState::Failure, "verification failed")
                .await;
            Ok(VerifyOutcome::Failed { output: combined })
        }
    }

    async fn post_status(&self, sha: Option<&str>, state: StatusState, description: &str) {
        let (Some(client), Some(sha)) = (&self.client, sha) else {
            return;
        };
        let status = CommitStatus {
            state,
            context: self.status_context(),
            description: description.to_string(),
            target_url: None,
        };
        if let Err(err) = client.create_commit_status(sha, &status).await {
            tracing::warn!(error = %err, "failed to post commit status");
        }
    }
}
