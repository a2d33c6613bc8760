//! LLM provider interface.
//!
//! The engine talks to providers through `FixProvider`; the concrete HTTP
//! client lives in `openai`. Transport policy shared by all providers:
//! - 30 s request timeout
//! - three attempts on 502/503/504 with 1 s / 2 s / 3 s backoff
//! - response bodies bounded at 10 MiB

pub mod openai;

use crate::errors::ProviderError;
use crate::model::{Phase, Violation};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

/// Request timeout for provider HTTP calls.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on a provider response body.
pub const MAX_RESPONSE_BYTES: usize = 10 * 1024 * 1024;

const RETRY_ATTEMPTS: u32 = 3;

/// One incident inside a batch, with its resolved repository-relative path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentContext {
    pub uri: String,
    pub path: String,
    pub line: u32,
    pub message: String,
    pub code_snip: String,
}

/// Single-incident fix request.
#[derive(Debug, Clone)]
pub struct FixRequest {
    pub violation: Violation,
    pub incident: IncidentContext,
    pub file_content: String,
    pub language: String,
}

/// Batched fix request: one violation, several incidents, each file's
/// contents shipped once.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub violation: Violation,
    pub incidents: Vec<IncidentContext>,
    pub file_contents: BTreeMap<String, String>,
    pub language: String,
}

impl BatchRequest {
    /// Total characters of file content in this batch.
    pub fn content_chars(&self) -> usize {
        self.file_contents.values().map(|c| c.len()).sum()
    }
}

/// Per-incident outcome inside a provider response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentFix {
    pub incident_uri: String,
    pub success: bool,
    #[serde(default)]
    pub fixed_content: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub explanation: String,
}

#[derive(Debug, Clone)]
pub struct FixResponse {
    pub fix: IncidentFix,
    pub cost: f64,
    pub tokens: u64,
}

#[derive(Debug, Clone)]
pub struct BatchResponse {
    pub fixes: Vec<IncidentFix>,
    pub cost: f64,
    pub tokens: u64,
}

#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub violations: Vec<Violation>,
}

#[derive(Debug, Clone)]
pub struct PlanResponse {
    pub phases: Vec<Phase>,
}

/// The provider contract. Handles are shared across batch workers, so
/// implementations must tolerate concurrent calls.
#[async_trait]
pub trait FixProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn fix_violation(&self, request: FixRequest) -> Result<FixResponse, ProviderError>;

    async fn fix_batch(&self, request: BatchRequest) -> Result<BatchResponse, ProviderError>;

    /// Estimated USD cost of sending this batch, used for budget checks.
    async fn estimate_cost(&self, request: &BatchRequest) -> Result<f64, ProviderError>;

    /// Ask the provider to group violations into ordered phases.
    async fn generate_plan(&self, request: PlanRequest) -> Result<PlanResponse, ProviderError>;
}

/// Rough token estimate for a batch: a quarter token per content character,
/// 50 tokens of scaffolding per incident, 500 tokens of prompt overhead.
pub fn estimate_batch_tokens(content_chars: usize, incident_count: usize) -> u64 {
    (content_chars as u64 / 4) + 50 * incident_count as u64 + 500
}

/// Run a provider call with the shared retry policy: transient failures
/// (502/503/504, timeout) back off 1 s, 2 s, 3 s; anything else returns
/// immediately.
pub async fn retry_transient<T, F, Fut>(mut call: F) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < RETRY_ATTEMPTS => {
                tracing::warn!(attempt, error = %err, "transient provider error, retrying");
                tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
