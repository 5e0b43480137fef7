//! State Oracle: vision-model judgments about the current screen.
//!
//! Every task builds exactly one request: the task preamble, candidate states
//! when the task has them, the captured screen (with OCR when enabled), and
//! the caller's request text. The model call is retried on transient failures
//! under the oracle's [`RetryPolicy`]; the screen is captured once per task.

pub mod gateway;
pub mod messages;
pub mod prompts;
pub mod retry;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared_types::action::is_single_word;
use shared_types::{Anchor, Action, ActionKind};

use crate::config::Config;
use crate::executor::{ScreenError, ScreenSource};
use crate::states::{ClassificationResult, State, StateCandidate, StateVariant};

pub use gateway::{HttpModelGateway, ModelCall, ModelGateway, OutputSchema, SharedModelGateway, TaskKind};
pub use messages::{ChatMessage, ImageDetail};
pub use retry::RetryPolicy;

#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("network error: {0}")]
    Network(String),
    #[error("malformed model response: {0}")]
    MalformedResponse(String),
    #[error("model response failed validation: {0}")]
    ResponseValidation(String),
    #[error("unexpected model error: {0}")]
    Unexpected(String),
    #[error("missing configuration: {0} is not set")]
    MissingConfig(String),
    #[error("unsupported request: {0}")]
    Unsupported(String),
    #[error(transparent)]
    Screen(#[from] ScreenError),
    #[error("cannot read reference screenshot {path}: {source}")]
    ReferenceImage {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl OracleError {
    /// Failures worth another model call.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_)
                | Self::MalformedResponse(_)
                | Self::ResponseValidation(_)
                | Self::MissingConfig(_)
        )
    }
}

/// `{id, description}` as reported by the model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateReport {
    pub id: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetWithAnchor {
    pub target: String,
    #[serde(default)]
    pub anchors: Vec<Anchor>,
}

impl TargetWithAnchor {
    /// Build a targeted action of `kind` from this result.
    pub fn into_action(self, kind: ActionKind) -> Action {
        let mut action = Action::targeted(kind, self.target);
        action.anchors = self.anchors;
        action
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Answer {
    pub answer: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionString {
    pub action_string: String,
}

struct Request<'a> {
    task: TaskKind,
    candidates: Option<&'a [StateCandidate]>,
    examples: Option<&'a [State]>,
    user_request: Option<&'a str>,
    example: Value,
    feedback: &'a str,
    schema_name: &'a str,
}

pub struct StateOracle {
    gateway: SharedModelGateway,
    model: String,
    max_tokens: u32,
    use_ocr: bool,
    detail: ImageDetail,
    retry: RetryPolicy,
    unmatched_as_expected: bool,
}

impl StateOracle {
    pub fn new(gateway: SharedModelGateway, model: impl Into<String>) -> Self {
        Self {
            gateway,
            model: model.into(),
            max_tokens: 2000,
            use_ocr: false,
            detail: ImageDetail::High,
            retry: RetryPolicy::default(),
            unmatched_as_expected: false,
        }
    }

    pub fn from_config(gateway: SharedModelGateway, config: &Config) -> Self {
        Self::new(gateway, config.oracle.model.clone())
            .with_max_tokens(config.oracle.max_tokens)
            .with_ocr(config.oracle.use_ocr)
            .with_unmatched_as_expected(config.unmatched_state_as_expected)
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_ocr(mut self, use_ocr: bool) -> Self {
        self.use_ocr = use_ocr;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_unmatched_as_expected(mut self, enabled: bool) -> Self {
        self.unmatched_as_expected = enabled;
        self
    }

    /// Locate a single-word target, with anchors when it is not unique.
    pub async fn find_target(
        &self,
        screen: &mut dyn ScreenSource,
        prompt: &str,
    ) -> Result<TargetWithAnchor, OracleError> {
        let found: TargetWithAnchor = self
            .request(
                screen,
                Request {
                    task: TaskKind::FindTarget,
                    candidates: None,
                    examples: None,
                    user_request: Some(prompt),
                    example: prompts::default_example(TaskKind::FindTarget),
                    feedback: prompts::default_feedback(TaskKind::FindTarget),
                    schema_name: "TargetWithAnchor",
                },
            )
            .await?;

        if !is_single_word(&found.target) {
            return Err(OracleError::Unsupported(format!(
                "multi-word target '{}'; only single-word targets can be resolved",
                found.target
            )));
        }
        if let Some(anchor) = found.anchors.iter().find(|a| !is_single_word(&a.value)) {
            return Err(OracleError::Unsupported(format!(
                "multi-word anchor '{}'",
                anchor.value
            )));
        }
        Ok(found)
    }

    /// Classify the screen against `states` (with their reference screenshots)
    /// and tag the result with the matching state's variant.
    pub async fn verify_state(
        &self,
        screen: &mut dyn ScreenSource,
        states: &[State],
    ) -> Result<ClassificationResult, OracleError> {
        let report: StateReport = self
            .request(
                screen,
                Request {
                    task: TaskKind::VerifyState,
                    candidates: None,
                    examples: Some(states),
                    user_request: None,
                    example: prompts::default_example(TaskKind::VerifyState),
                    feedback: prompts::default_feedback(TaskKind::VerifyState),
                    schema_name: "StateReport",
                },
            )
            .await?;

        let variant = match states.iter().find(|s| s.id == report.id) {
            Some(state) => state.variant.clone(),
            None if self.unmatched_as_expected => {
                tracing::warn!(state = %report.id, "Classifier returned an unknown state, treating as expected");
                StateVariant::Expected
            }
            None => {
                tracing::warn!(state = %report.id, "Classifier returned an unknown state, treating as unexpected");
                StateVariant::Unexpected
            }
        };
        tracing::info!(state = %report.id, variant = ?variant, "Screen state verified");
        Ok(ClassificationResult {
            state_id: report.id,
            description: report.description,
            variant,
        })
    }

    /// Classify the screen into one of `candidates`; returns `(id, description)`
    /// of the matching candidate.
    pub async fn classify_state(
        &self,
        screen: &mut dyn ScreenSource,
        candidates: &[StateCandidate],
    ) -> Result<(String, String), OracleError> {
        let report: StateReport = self
            .request(
                screen,
                Request {
                    task: TaskKind::ClassifyState,
                    candidates: Some(candidates),
                    examples: None,
                    user_request: None,
                    example: prompts::default_example(TaskKind::ClassifyState),
                    feedback: prompts::default_feedback(TaskKind::ClassifyState),
                    schema_name: "StateReport",
                },
            )
            .await?;

        match candidates.iter().find(|c| c.id == report.id) {
            Some(candidate) => Ok((candidate.id.clone(), candidate.description.clone())),
            None => {
                tracing::warn!(state = %report.id, "Classifier returned an id outside the candidates");
                Ok((report.id, report.description))
            }
        }
    }

    /// Classify into a caller-defined response shape.
    pub async fn classify_state_as<T>(
        &self,
        screen: &mut dyn ScreenSource,
        candidates: &[StateCandidate],
    ) -> Result<T, OracleError>
    where
        T: DeserializeOwned + Serialize + Default,
    {
        self.request(
            screen,
            Request {
                task: TaskKind::ClassifyState,
                candidates: Some(candidates),
                examples: None,
                user_request: None,
                example: custom_example::<T>(),
                feedback: "",
                schema_name: std::any::type_name::<T>(),
            },
        )
        .await
    }

    pub async fn answer(&self, screen: &mut dyn ScreenSource, question: &str) -> Result<String, OracleError> {
        let answer: Answer = self
            .request(
                screen,
                Request {
                    task: TaskKind::Answer,
                    candidates: None,
                    examples: None,
                    user_request: Some(question),
                    example: prompts::default_example(TaskKind::Answer),
                    feedback: prompts::default_feedback(TaskKind::Answer),
                    schema_name: "Answer",
                },
            )
            .await?;
        Ok(answer.answer)
    }

    /// Answer into a caller-defined response shape.
    pub async fn answer_as<T>(&self, screen: &mut dyn ScreenSource, question: &str) -> Result<T, OracleError>
    where
        T: DeserializeOwned + Serialize + Default,
    {
        self.request(
            screen,
            Request {
                task: TaskKind::Answer,
                candidates: None,
                examples: None,
                user_request: Some(question),
                example: custom_example::<T>(),
                feedback: "",
                schema_name: std::any::type_name::<T>(),
            },
        )
        .await
    }

    /// Textual action for `prompt`, parseable into an [`Action`].
    pub async fn write_action_string(
        &self,
        screen: &mut dyn ScreenSource,
        prompt: &str,
    ) -> Result<String, OracleError> {
        let written: ActionString = self
            .request(
                screen,
                Request {
                    task: TaskKind::WriteActionString,
                    candidates: None,
                    examples: None,
                    user_request: Some(prompt),
                    example: prompts::default_example(TaskKind::WriteActionString),
                    feedback: prompts::default_feedback(TaskKind::WriteActionString),
                    schema_name: "ActionString",
                },
            )
            .await?;
        Ok(written.action_string)
    }

    async fn request<T: DeserializeOwned>(
        &self,
        screen: &mut dyn ScreenSource,
        request: Request<'_>,
    ) -> Result<T, OracleError> {
        let snapshot = screen.capture(self.use_ocr).await?;

        let mut prompt = vec![ChatMessage::system(prompts::system_prompt(
            request.task,
            &request.example,
            request.feedback,
        ))];
        if let Some(candidates) = request.candidates {
            prompt.push(messages::state_list_message(candidates));
        }
        prompt.push(messages::screen_message(&snapshot, self.detail));
        if let Some(text) = request.user_request {
            prompt.push(ChatMessage::user(text));
        }
        for state in request.examples.unwrap_or_default() {
            let message = messages::state_example_message(state, self.detail)
                .await
                .map_err(|source| OracleError::ReferenceImage {
                    path: state.example_screenshots.join(", "),
                    source,
                })?;
            prompt.push(message);
        }

        let call = ModelCall {
            task: request.task,
            model: self.model.clone(),
            messages: prompt,
            max_tokens: self.max_tokens,
            schema: OutputSchema {
                name: request.schema_name.to_string(),
                example: request.example,
            },
        };
        call_typed(self.gateway.as_ref(), &call, self.retry).await
    }
}

/// One gateway call under `retry`, decoding the object into `T`. Decode
/// failures count as validation errors and are retried.
pub(crate) async fn call_typed<T: DeserializeOwned>(
    gateway: &dyn ModelGateway,
    call: &ModelCall,
    retry: RetryPolicy,
) -> Result<T, OracleError> {
    retry::with_retry(retry, call.task.as_str(), || async move {
        let value = gateway.complete(call).await?;
        serde_json::from_value::<T>(value)
            .map_err(|e| OracleError::ResponseValidation(e.to_string()))
    })
    .await
}

fn custom_example<T: Serialize + Default>() -> Value {
    serde_json::to_value(T::default()).unwrap_or(Value::Null)
}
