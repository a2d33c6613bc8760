//! OpenAI-compatible chat-completions provider.
//!
//! Any endpoint speaking the `/chat/completions` shape works; the base URL is
//! configurable for proxies and self-hosted gateways. Responses are requested
//! as JSON and extracted defensively, since models occasionally wrap payloads
//! in prose.

use crate::errors::ProviderError;
use crate::model::{Phase, Violation};
use crate::provider::{
    BatchRequest, BatchResponse, FixProvider, FixRequest, FixResponse, IncidentFix, PlanRequest,
    PlanResponse, estimate_batch_tokens, retry_transient, MAX_RESPONSE_BYTES, REQUEST_TIMEOUT,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o";

// USD per 1K tokens.
const INPUT_COST_PER_1K: f64 = 0.0025;
const OUTPUT_COST_PER_1K: f64 = 0.01;

pub struct OpenAiProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiProvider {
    pub fn new(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
        })
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    async fn chat(&self, system: &str, user: &str) -> Result<ChatOutput, ProviderError> {
        retry_transient(|| async {
            let request = ChatCompletionRequest {
                model: self.model.clone(),
                messages: vec![
                    ChatMessage {
                        role: "system".to_string(),
                        content: system.to_string(),
                    },
                    ChatMessage {
                        role: "user".to_string(),
                        content: user.to_string(),
                    },
                ],
                temperature: 0.0,
            };

            let resp = self
                .client
                .post(format!("{}/chat/completions", self.base_url))
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&request)
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        ProviderError::Timeout
                    } else {
                        ProviderError::Transport(e.to_string())
                    }
                })?;

            let status = resp.status().as_u16();
            let body = read_bounded(resp).await?;
            if !(200..300).contains(&status) {
                return Err(ProviderError::Status { status, body });
            }

            let completion: ChatCompletionResponse = serde_json::from_str(&body)
                .map_err(|e| ProviderError::Malformed(format!("chat completion: {e}")))?;
            let content = completion
                .choices
                .into_iter()
                .next()
                .map(|c| c.message.content)
                .ok_or_else(|| ProviderError::Malformed("response carried no choices".into()))?;

            let usage = completion.usage.unwrap_or_default();
            let cost = usage.prompt_tokens as f64 / 1000.0 * INPUT_COST_PER_1K
                + usage.completion_tokens as f64 / 1000.0 * OUTPUT_COST_PER_1K;
            Ok(ChatOutput {
                content,
                tokens: usage.total_tokens,
                cost,
            })
        })
        .await
    }
}

struct ChatOutput {
    content: String,
    tokens: u64,
    cost: f64,
}

#[derive(Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f64,
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Deserialize, Default)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

/// Read a response body, refusing anything past the 10 MiB bound.
async fn read_bounded(mut resp: reqwest::Response) -> Result<String, ProviderError> {
    let mut buf: Vec<u8> = Vec::new();
    while let Some(chunk) = resp
        .chunk()
        .await
        .map_err(|e| ProviderError::Transport(e.to_string()))?
    {
        if buf.len() + chunk.len() > MAX_RESPONSE_BYTES {
            buf.extend_from_slice(&chunk[..MAX_RESPONSE_BYTES - buf.len()]);
            break;
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchPayload {
    fixes: Vec<IncidentFix>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlanPayload {
    phases: Vec<PlannedPhasePayload>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlannedPhasePayload {
    id: String,
    name: String,
    order: u32,
    risk: crate::model::Risk,
    #[serde(default)]
    category: Option<crate::model::Category>,
    effort_range: crate::model::EffortRange,
    #[serde(default)]
    estimated_cost: f64,
    #[serde(default)]
    deferred: bool,
    violation_ids: Vec<String>,
}

const FIX_SYSTEM_PROMPT: &str = "You are a migration engineer. You fix static-analysis \
violations by rewriting whole files. Reply with a single JSON object of the form \
{\"fixes\": [{\"incidentUri\": string, \"success\": bool, \"fixedContent\": string|null, \
\"error\": string|null, \"confidence\": number, \"explanation\": string}]} with exactly one \
entry per incident, in any order. fixedContent must be the complete new file content.";

const PLAN_SYSTEM_PROMPT: &str = "You are a migration planner. Group violations into ordered \
remediation phases. Reply with a single JSON object of the form {\"phases\": [{\"id\": string, \
\"name\": string, \"order\": number, \"risk\": \"low\"|\"medium\"|\"high\", \"category\": \
string|null, \"effortRange\": {\"min\": number, \"max\": number}, \"estimatedCost\": number, \
\"deferred\": bool, \"violationIds\": [string]}]}.";

fn build_batch_prompt(request: &BatchRequest) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!(
        "Violation {} ({}, effort {}): {}\nLanguage: {}\n\nIncidents:\n",
        request.violation.id,
        request.violation.category,
        request.violation.effort,
        request.violation.description,
        request.language,
    ));
    for incident in &request.incidents {
        prompt.push_str(&format!(
            "- uri: {}\n  file: {} line {}\n  message: {}\n",
            incident.uri, incident.path, incident.line, incident.message
        ));
        if !incident.code_snip.is_empty() {
            prompt.push_str(&format!("  snippet: {}\n", incident.code_snip));
        }
    }
    prompt.push_str("\nFile contents:\n");
    for (path, content) in &request.file_contents {
        prompt.push_str(&format!("--- {path} ---\n{content}\n"));
    }
    prompt
}

fn build_plan_prompt(request: &PlanRequest) -> String {
    let mut prompt = String::from("Violations to plan:\n");
    for v in &request.violations {
        prompt.push_str(&format!(
            "- {} ({}, effort {}, {} incidents): {}\n",
            v.id,
            v.category,
            v.effort,
            v.incidents.len(),
            v.description
        ));
    }
    prompt
}

/// Extract the outermost JSON object from text that may contain other
/// content, by brace counting.
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0;
    for (i, ch) in text[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

#[async_trait]
impl FixProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn fix_violation(&self, request: FixRequest) -> Result<FixResponse, ProviderError> {
        let mut file_contents = BTreeMap::new();
        file_contents.insert(request.incident.path.clone(), request.file_content);
        let batch = BatchRequest {
            violation: request.violation,
            incidents: vec![request.incident],
            file_contents,
            language: request.language,
        };
        let response = self.fix_batch(batch).await?;
        let fix = response
            .fixes
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Malformed("batch response carried no fixes".into()))?;
        Ok(FixResponse {
            fix,
            cost: response.cost,
            tokens: response.tokens,
        })
    }

    async fn fix_batch(&self, request: BatchRequest) -> Result<BatchResponse, ProviderError> {
        let prompt = build_batch_prompt(&request);
        let output = self.chat(FIX_SYSTEM_PROMPT, &prompt).await?;

        let json = extract_json_object(&output.content)
            .ok_or_else(|| ProviderError::Malformed("no JSON object in fix response".into()))?;
        let payload: BatchPayload = serde_json::from_str(json)
            .map_err(|e| ProviderError::Malformed(format!("fix payload: {e}")))?;

        Ok(BatchResponse {
            fixes: payload.fixes,
            cost: output.cost,
            tokens: output.tokens,
        })
    }

    async fn estimate_cost(&self, request: &BatchRequest) -> Result<f64, ProviderError> {
        let tokens = estimate_batch_tokens(request.content_chars(), request.incidents.len());
        // Symmetric estimate: assume the rewrite is roughly as large as the
        // prompt.
        Ok(tokens as f64 / 1000.0 * (INPUT_COST_PER_1K + OUTPUT_COST_PER_1K))
    }

    async fn generate_plan(&self, request: PlanRequest) -> Result<PlanResponse, ProviderError> {
        let prompt = build_plan_prompt(&request);
        let output = self.chat(PLAN_SYSTEM_PROMPT, &prompt).await?;

        let json = extract_json_object(&output.content)
            .ok_or_else(|| ProviderError::Malformed("no JSON object in plan response".into()))?;
        let payload: PlanPayload = serde_json::from_str(json)
            .map_err(|e| ProviderError::Malformed(format!("plan payload: {e}")))?;

        let by_id: BTreeMap<&str, &Violation> = request
            .violations
            .iter()
            .map(|v| (v.id.as_str(), v))
            .collect();

        let phases = payload
            .phases
            .into_iter()
            .map(|p| Phase {
                violations: p
                    .violation_ids
                    .iter()
                    .filter_map(|id| by_id.get(id.as_str()).map(|v| (*v).clone()))
                    .collect(),
                id: p.id,
                name: p.name,
                order: p.order,
                risk: p.risk,
                category: p.category,
                effort_range: p.effort_range,
                estimated_cost: p.estimated_cost,
                deferred: p.deferred,
            })
            .collect();

        Ok(PlanResponse { phases })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Category;
    use crate::provider::IncidentContext;

    fn sample_batch() -> BatchRequest {
        let violation = Violation {
            id: "v1".to_string(),
            description: "replace javax with jakarta".to_string(),
            category: Category::Mandatory,
            effort: 1,
            complexity: None,
            incidents: Vec::new(),
        };
        let mut file_contents = BTreeMap::new();
        file_contents.insert("src/A.java".to_string(), "import javax.ejb.*;\n".to_string());
        BatchRequest {
            violation,
            incidents: vec![IncidentContext {
                uri: "file:///workspace/src/A.java".to_string(),
                path: "src/A.java".to_string(),
                line: 1,
                message: "use jakarta".to_string(),
                code_snip: "import javax.ejb.*;".to_string(),
            }],
            file_contents,
            language: "java".to_string(),
        }
    }

    #[test]
    fn test_batch_prompt_carries_incident_and_content() {
        let prompt = build_batch_prompt(&sample_batch());
        assert!(prompt.contains("Violation v1"));
        assert!(prompt.contains("src/A.java line 1"));
        assert!(prompt.contains("import javax.ejb.*;"));
        assert!(prompt.contains("Language: java"));
    }

    #[test]
    fn test_extract_json_object_variants() {
        assert_eq!(extract_json_object(r#"{"a":1}"#), Some(r#"{"a":1}"#));
        assert_eq!(
            extract_json_object(r#"Sure! Here you go: {"a":{"b":2}} hope it helps"#),
            Some(r#"{"a":{"b":2}}"#)
        );
        assert_eq!(extract_json_object("no json"), None);
        assert_eq!(extract_json_object(r#"{"unclosed": 1"#), None);
    }

    #[test]
    fn test_batch_payload_parses() {
        let json = r#"{"fixes":[{"incidentUri":"file:///a","success":true,"fixedContent":"new","confidence":0.92,"explanation":"swapped import"}]}"#;
        let payload: BatchPayload = serde_json::from_str(json).unwrap();
        assert_eq!(payload.fixes.len(), 1);
        assert!(payload.fixes[0].success);
        assert_eq!(payload.fixes[0].confidence, 0.92);
    }

    #[test]
    fn test_plan_payload_maps_violations() {
        let json = r#"{"phases":[{"id":"p1","name":"Imports","order":1,"risk":"low",
            "effortRange":{"min":0,"max":3},"estimatedCost":0.4,"deferred":false,
            "violationIds":["v1","missing"]}]}"#;
        let payload: PlanPayload = serde_json::from_str(json).unwrap();
        assert_eq!(payload.phases[0].violation_ids.len(), 2);
        assert_eq!(payload.phases[0].effort_range.max, 3);
    }

    #[tokio::test]
    async fn test_estimate_cost_scales_with_content() {
        let provider = OpenAiProvider::new("sk-test").unwrap();
        let small = provider.estimate_cost(&sample_batch()).await.unwrap();
        let mut big = sample_batch();
        big.file_contents
            .insert("src/B.java".to_string(), "x".repeat(40_000));
        let large = provider.estimate_cost(&big).await.unwrap();
        assert!(large > small);
    }
}
