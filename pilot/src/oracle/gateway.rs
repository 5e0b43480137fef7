//! Model gateway: the only place that talks to the vision model.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use super::messages::ChatMessage;
use super::OracleError;

/// Per-request bound for model completions.
const MODEL_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

pub type SharedModelGateway = Arc<dyn ModelGateway>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    FindTarget,
    VerifyState,
    ClassifyState,
    Answer,
    WriteActionString,
    CourseCorrection,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FindTarget => "find_target",
            Self::VerifyState => "verify_state",
            Self::ClassifyState => "classify_state",
            Self::Answer => "answer",
            Self::WriteActionString => "write_action_string",
            Self::CourseCorrection => "course_correction",
        }
    }
}

/// Expected output shape, given to the model as an example.
#[derive(Debug, Clone)]
pub struct OutputSchema {
    pub name: String,
    pub example: Value,
}

#[derive(Debug, Clone)]
pub struct ModelCall {
    pub task: TaskKind,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub schema: OutputSchema,
}

#[async_trait]
pub trait ModelGateway: Send + Sync {
    /// One model round-trip returning the parsed JSON object.
    async fn complete(&self, call: &ModelCall) -> Result<Value, OracleError>;
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

/// OpenAI-compatible `/chat/completions` client.
#[derive(Clone)]
pub struct HttpModelGateway {
    client: reqwest::Client,
    base_url: String,
    api_key_env: String,
}

impl HttpModelGateway {
    pub fn new(base_url: impl Into<String>, api_key_env: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(MODEL_REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key_env: api_key_env.into(),
        }
    }

    fn api_key(&self) -> Result<String, OracleError> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| OracleError::MissingConfig(self.api_key_env.clone()))
    }
}

#[async_trait]
impl ModelGateway for HttpModelGateway {
    async fn complete(&self, call: &ModelCall) -> Result<Value, OracleError> {
        let api_key = self.api_key()?;
        let body = ChatCompletionRequest {
            model: &call.model,
            messages: &call.messages,
            max_tokens: call.max_tokens,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        let started = std::time::Instant::now();
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| OracleError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let detail = format!("HTTP {}: {}", status.as_u16(), truncate(&text, 500));
            return Err(if status.as_u16() == 429 || status.is_server_error() {
                OracleError::Network(detail)
            } else {
                OracleError::Unexpected(detail)
            });
        }

        let envelope: Value = response
            .json()
            .await
            .map_err(|e| OracleError::MalformedResponse(e.to_string()))?;
        let content = envelope
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                OracleError::MalformedResponse("response has no message content".to_string())
            })?;

        tracing::info!(
            task = call.task.as_str(),
            model = %call.model,
            schema = %call.schema.name,
            messages = call.messages.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Model call completed"
        );
        parse_json_content(content)
    }
}

/// Parse a JSON object from model text, tolerating a fenced code block.
pub fn parse_json_content(content: &str) -> Result<Value, OracleError> {
    let trimmed = content.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();
    let value: Value = serde_json::from_str(unfenced)
        .map_err(|e| OracleError::MalformedResponse(format!("{e}: {}", truncate(unfenced, 200))))?;
    if !value.is_object() {
        return Err(OracleError::MalformedResponse(
            "expected a JSON object".to_string(),
        ));
    }
    Ok(value)
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
