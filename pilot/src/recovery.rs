//! Course correction: a goal-directed conversation with the model that
//! proposes one corrective action per turn.
//!
//! The first turn seeds the conversation with the system preamble, the goal
//! and any custom instructions. Each turn then appends the latest feedback (if
//! set), the current screen, and finally the model's proposed action string,
//! so later turns see earlier proposals. The full history is kept; each
//! request resends the seed plus the most recent `history_window` messages.

use serde::{Deserialize, Deserializer, Serialize};
use shared_types::Action;

use crate::config::Config;
use crate::executor::ScreenSource;
use crate::oracle::messages::{self, ChatMessage, ImageDetail, Role};
use crate::oracle::{prompts, retry, ModelCall, OracleError, OutputSchema, RetryPolicy, SharedModelGateway, TaskKind};

const MAX_TRIES: u32 = 3;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorrectionResponse {
    pub action_string: String,
    #[serde(default)]
    pub action_comment: String,
    #[serde(default)]
    pub observation: String,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub interrupt_process: bool,
}

/// Accepts `true`, `"True"`, `"false"`, `null`.
fn lenient_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Text(String),
    }

    match Option::<Flag>::deserialize(deserializer)? {
        None => Ok(false),
        Some(Flag::Bool(b)) => Ok(b),
        Some(Flag::Text(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Ok(true),
            "false" | "no" | "0" | "" => Ok(false),
            other => Err(serde::de::Error::custom(format!("invalid interrupt flag '{other}'"))),
        },
    }
}

/// One proposal from the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrectiveTurn {
    /// Index of this turn's screen message in the controller history.
    pub screen_ref: usize,
    pub proposed_action: Action,
    pub comment: String,
    pub observation: String,
    /// The goal is unreachable; the run must stop.
    pub interrupt: bool,
}

pub struct CourseCorrector {
    gateway: SharedModelGateway,
    model: String,
    max_tokens: u32,
    use_ocr: bool,
    goal: String,
    custom_instructions: Option<String>,
    history: Vec<ChatMessage>,
    seed_len: usize,
    history_window: usize,
    latest_feedback: Option<String>,
    turns: Vec<CorrectiveTurn>,
}

impl CourseCorrector {
    pub fn new(gateway: SharedModelGateway, model: impl Into<String>, goal: impl Into<String>) -> Self {
        Self {
            gateway,
            model: model.into(),
            max_tokens: 2000,
            use_ocr: false,
            goal: goal.into(),
            custom_instructions: None,
            history: Vec::new(),
            seed_len: 0,
            history_window: 0,
            latest_feedback: None,
            turns: Vec::new(),
        }
    }

    pub fn from_config(gateway: SharedModelGateway, config: &Config, goal: impl Into<String>) -> Self {
        Self::new(gateway, config.oracle.recovery_model.clone(), goal)
            .with_max_tokens(config.oracle.max_tokens)
            .with_ocr(config.oracle.use_ocr)
            .with_history_window(config.recovery_history_window)
    }

    pub fn with_custom_instructions(mut self, instructions: Option<String>) -> Self {
        self.custom_instructions = instructions.filter(|s| !s.trim().is_empty());
        self
    }

    /// Messages resent after the seed; 0 resends everything.
    pub fn with_history_window(mut self, window: usize) -> Self {
        self.history_window = window;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_ocr(mut self, use_ocr: bool) -> Self {
        self.use_ocr = use_ocr;
        self
    }

    pub fn goal(&self) -> &str {
        &self.goal
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    pub fn turns(&self) -> &[CorrectiveTurn] {
        &self.turns
    }

    /// Feedback sent with every following turn until reset.
    pub fn add_feedback(&mut self, feedback: impl Into<String>) {
        self.latest_feedback = Some(feedback.into());
    }

    pub fn latest_feedback(&self) -> Option<&str> {
        self.latest_feedback.as_deref()
    }

    /// Clear pending feedback; the conversation history is kept.
    pub fn reset_feedback(&mut self) {
        self.latest_feedback = None;
    }

    /// Ask for the next corrective action. Always one turn. A failed turn
    /// leaves the history as it was before the call.
    pub async fn get_corrective_actions(
        &mut self,
        screen: &mut dyn ScreenSource,
    ) -> Result<Vec<CorrectiveTurn>, OracleError> {
        if self.history.is_empty() {
            self.seed();
        }
        let checkpoint = self.history.len();
        match self.next_turn(screen).await {
            Ok(turn) => Ok(vec![turn]),
            Err(e) => {
                self.history.truncate(checkpoint);
                Err(e)
            }
        }
    }

    async fn next_turn(&mut self, screen: &mut dyn ScreenSource) -> Result<CorrectiveTurn, OracleError> {
        if let Some(feedback) = &self.latest_feedback {
            self.history.push(ChatMessage::user(feedback.clone()));
        }

        let snapshot = screen.capture(self.use_ocr).await?;
        let screen_ref = self.history.len();
        self.history.push(messages::screen_message(&snapshot, ImageDetail::Low));

        let call = ModelCall {
            task: TaskKind::CourseCorrection,
            model: self.model.clone(),
            messages: self.request_messages(),
            max_tokens: self.max_tokens,
            schema: OutputSchema {
                name: "CorrectionResponse".to_string(),
                example: prompts::default_example(TaskKind::CourseCorrection),
            },
        };

        let gateway = self.gateway.as_ref();
        let call = &call;
        let (response, action) = retry::with_retry(
            RetryPolicy::MaxAttempts(MAX_TRIES),
            TaskKind::CourseCorrection.as_str(),
            || async move {
                let value = gateway.complete(call).await?;
                let response: CorrectionResponse = serde_json::from_value(value)
                    .map_err(|e| OracleError::ResponseValidation(e.to_string()))?;
                let action: Action = response.action_string.parse().map_err(|e| {
                    OracleError::ResponseValidation(format!(
                        "unparseable action '{}': {e}",
                        response.action_string
                    ))
                })?;
                Ok((response, action))
            },
        )
        .await?;

        self.history.push(ChatMessage::assistant(response.action_string.clone()));
        let turn = CorrectiveTurn {
            screen_ref,
            proposed_action: action,
            comment: response.action_comment,
            observation: response.observation,
            interrupt: response.interrupt_process,
        };
        tracing::info!(
            turn = self.turns.len() + 1,
            action = %turn.proposed_action,
            comment = %turn.comment,
            interrupt = turn.interrupt,
            "Course correction proposed"
        );
        self.turns.push(turn.clone());
        Ok(turn)
    }

    fn seed(&mut self) {
        let task = TaskKind::CourseCorrection;
        self.history.push(ChatMessage::system(prompts::system_prompt(
            task,
            &prompts::default_example(task),
            prompts::default_feedback(task),
        )));
        self.history.push(ChatMessage::user(self.goal.clone()));
        if let Some(instructions) = &self.custom_instructions {
            self.history.push(ChatMessage::new(
                Role::System,
                vec![messages::ContentPart::text(prompts::custom_instructions(instructions))],
            ));
        }
        self.seed_len = self.history.len();
    }

    fn request_messages(&self) -> Vec<ChatMessage> {
        let (seed, rest) = self.history.split_at(self.seed_len);
        let keep = match self.history_window {
            0 => rest.len(),
            window => window.max(2).min(rest.len()),
        };
        seed.iter()
            .chain(rest[rest.len() - keep..].iter())
            .cloned()
            .collect()
    }
}
