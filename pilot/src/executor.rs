//! Action dispatch over the session transport.
//!
//! Every request waits for an `ack` within the ack timeout and for a terminal
//! `completed`/`failed` within the action timeout, both measured from the
//! moment the request was sent. Requests are strictly sequential.

use std::time::Duration;

use async_trait::async_trait;
use shared_types::{
    Action, ActionValidationError, CommandOutput, DeviceCommand, DeviceEvent, DeviceRequest,
    RequestId,
};
use tokio::time::Instant;

use crate::config::{deadline_after, Config};
use crate::session::Session;
use crate::transport::TransportError;

/// How a failure may be handled by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Eligible for fallback, recovery, or escalation.
    Retryable,
    /// Abort the run.
    Fatal,
}

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("no acknowledgement for {action} within {timeout:?}")]
    AckTimeout { action: String, timeout: Duration },
    #[error("{action} did not complete within {timeout:?}")]
    ActionTimeout { action: String, timeout: Duration },
    #[error("device failed to perform {action}: {message}")]
    PerformFailed { action: String, message: String },
    #[error("invalid action at position {index}: {source}")]
    InvalidAction {
        index: usize,
        #[source]
        source: ActionValidationError,
    },
    #[error("transport failure during {action}: {source}")]
    Transport {
        action: String,
        #[source]
        source: TransportError,
    },
    #[error("all {attempted} actions failed; last error: {last}")]
    AllActionsFailed { attempted: usize, last: String },
}

impl ActionError {
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::AckTimeout { .. }
            | Self::ActionTimeout { .. }
            | Self::PerformFailed { .. }
            | Self::AllActionsFailed { .. } => Disposition::Retryable,
            Self::InvalidAction { .. } | Self::Transport { .. } => Disposition::Fatal,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ScreenError {
    #[error("screen capture failed: {0}")]
    Capture(#[from] ActionError),
    #[error("device returned no screenshot")]
    MissingImage,
}

/// A captured screen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Screen {
    /// Base64 PNG
    pub image_b64: String,
    pub ocr_text: Option<String>,
}

/// Where the oracle reads the current screen from.
#[async_trait]
pub trait ScreenSource: Send {
    async fn capture(&mut self, include_ocr: bool) -> Result<Screen, ScreenError>;
}

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub ack: Duration,
    pub action: Duration,
}

impl Timeouts {
    pub fn from_config(config: &Config) -> Self {
        Self {
            ack: config.ack_timeout,
            action: config.action_timeout,
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            ack: Duration::from_secs(10),
            action: Duration::from_secs(90),
        }
    }
}

pub struct ActionExecutor<'s> {
    session: &'s mut Session,
    timeouts: Timeouts,
}

impl<'s> ActionExecutor<'s> {
    pub fn new(session: &'s mut Session, timeouts: Timeouts) -> Self {
        Self { session, timeouts }
    }

    pub fn session(&self) -> &Session {
        self.session
    }

    /// Perform one action and mark it done on completion.
    pub async fn perform(&mut self, action: &mut Action) -> Result<Option<CommandOutput>, ActionError> {
        action
            .validate()
            .map_err(|source| ActionError::InvalidAction { index: 0, source })?;
        let output = self
            .dispatch(DeviceCommand::Perform {
                action: action.clone(),
            })
            .await?;
        action.done = true;
        Ok(output)
    }

    /// Perform a GetText action and return the text the device read.
    pub async fn read_text(&mut self, action: &mut Action) -> Result<String, ActionError> {
        let rendered = action.render();
        match self.perform(action).await? {
            Some(CommandOutput::Text { text }) => Ok(text),
            _ => Err(ActionError::PerformFailed {
                action: rendered,
                message: "completed without text output".to_string(),
            }),
        }
    }

    /// Try equivalent actions in order until one succeeds; returns its index.
    ///
    /// The whole list is validated before anything is sent. A fatal failure
    /// stops the chain immediately.
    pub async fn try_actions(&mut self, actions: &mut [Action]) -> Result<usize, ActionError> {
        for (index, action) in actions.iter().enumerate() {
            action
                .validate()
                .map_err(|source| ActionError::InvalidAction { index, source })?;
        }

        let mut last = String::from("no actions given");
        for (index, action) in actions.iter_mut().enumerate() {
            match self.perform(action).await {
                Ok(_) => return Ok(index),
                Err(e) if e.disposition() == Disposition::Fatal => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        attempt = index + 1,
                        action = %action.render(),
                        error = %e,
                        "Action failed, trying next alternative"
                    );
                    last = e.to_string();
                }
            }
        }
        Err(ActionError::AllActionsFailed {
            attempted: actions.len(),
            last,
        })
    }

    async fn dispatch(&mut self, command: DeviceCommand) -> Result<Option<CommandOutput>, ActionError> {
        let label = command.label();
        let request = DeviceRequest {
            request_id: RequestId::new(),
            correlation_id: Some(self.session.correlation_id().to_string()),
            command,
        };
        let transport = self.session.transport_mut();

        let sent_at = Instant::now();
        transport
            .send(&request)
            .await
            .map_err(|source| ActionError::Transport {
                action: label.clone(),
                source,
            })?;
        tracing::info!(request_id = %request.request_id, action = %label, "Dispatched");

        let ack_deadline = deadline_after(sent_at, self.timeouts.ack);
        let done_deadline = deadline_after(sent_at, self.timeouts.action);
        let mut acked = false;

        loop {
            let deadline = if acked {
                done_deadline
            } else {
                ack_deadline.min(done_deadline)
            };
            let event = match tokio::time::timeout_at(deadline, transport.next_event()).await {
                Ok(Ok(event)) => event,
                Ok(Err(source)) => {
                    return Err(ActionError::Transport {
                        action: label,
                        source,
                    })
                }
                Err(_) if acked => {
                    return Err(ActionError::ActionTimeout {
                        action: label,
                        timeout: self.timeouts.action,
                    })
                }
                Err(_) => {
                    return Err(ActionError::AckTimeout {
                        action: label,
                        timeout: self.timeouts.ack,
                    })
                }
            };

            if event.request_id() != &request.request_id {
                tracing::debug!(stale = %event.request_id(), "Ignoring event for another request");
                continue;
            }
            match event {
                DeviceEvent::Ack { .. } => {
                    acked = true;
                    tracing::debug!(request_id = %request.request_id, "Acknowledged");
                }
                DeviceEvent::Completed { output, .. } => {
                    tracing::info!(
                        request_id = %request.request_id,
                        elapsed_ms = sent_at.elapsed().as_millis() as u64,
                        "Completed"
                    );
                    return Ok(output);
                }
                DeviceEvent::Failed { message, .. } => {
                    return Err(ActionError::PerformFailed {
                        action: label,
                        message,
                    });
                }
            }
        }
    }
}

#[async_trait]
impl ScreenSource for ActionExecutor<'_> {
    async fn capture(&mut self, include_ocr: bool) -> Result<Screen, ScreenError> {
        match self.dispatch(DeviceCommand::GetScreen { include_ocr }).await? {
            Some(CommandOutput::Screen {
                image_b64,
                ocr_text,
            }) => Ok(Screen {
                image_b64,
                ocr_text,
            }),
            _ => Err(ScreenError::MissingImage),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{AgentBehavior, FakeAgent};

    fn timeouts() -> Timeouts {
        Timeouts {
            ack: Duration::from_secs(2),
            action: Duration::from_secs(10),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn try_actions_falls_through_to_working_alternative() {
        let (mut session, agent) = FakeAgent::session(vec![
            AgentBehavior::Fail("not found".into()),
            AgentBehavior::Complete,
        ]);
        let mut executor = ActionExecutor::new(&mut session, timeouts());
        let mut actions = vec![Action::left_click("Save"), Action::left_click("Speichern")];

        let index = executor.try_actions(&mut actions).await.unwrap();

        assert_eq!(index, 1);
        assert!(!actions[0].done);
        assert!(actions[1].done);
        assert_eq!(agent.sent().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_timeouts_do_not_overflow() {
        let (mut session, _agent) = FakeAgent::session(vec![AgentBehavior::Complete]);
        let mut executor = ActionExecutor::new(
            &mut session,
            Timeouts {
                ack: Duration::MAX,
                action: Duration::MAX,
            },
        );

        let mut action = Action::left_click("Save");
        executor.perform(&mut action).await.unwrap();

        assert!(action.done);
    }

    #[tokio::test(start_paused = true)]
    async fn try_actions_on_empty_list_fails_aggregate() {
        let (mut session, _agent) = FakeAgent::session(vec![]);
        let mut executor = ActionExecutor::new(&mut session, timeouts());

        let err = executor.try_actions(&mut []).await.unwrap_err();

        assert!(matches!(err, ActionError::AllActionsFailed { attempted: 0, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn try_actions_validates_before_sending_anything() {
        let (mut session, agent) = FakeAgent::session(vec![AgentBehavior::Complete]);
        let mut executor = ActionExecutor::new(&mut session, timeouts());
        let mut actions = vec![
            Action::left_click("OK"),
            Action::left_click("OK").below("two words"),
        ];

        let err = executor.try_actions(&mut actions).await.unwrap_err();

        assert!(matches!(err, ActionError::InvalidAction { index: 1, .. }));
        assert_eq!(err.disposition(), Disposition::Fatal);
        assert!(agent.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_agent_times_out_on_ack() {
        let (mut session, _agent) = FakeAgent::session(vec![AgentBehavior::Silent]);
        let mut executor = ActionExecutor::new(&mut session, timeouts());

        let err = executor
            .perform(&mut Action::left_click("OK"))
            .await
            .unwrap_err();

        assert!(matches!(err, ActionError::AckTimeout { .. }));
        assert_eq!(err.disposition(), Disposition::Retryable);
    }

    #[tokio::test(start_paused = true)]
    async fn ack_without_completion_times_out_on_action() {
        let (mut session, _agent) = FakeAgent::session(vec![AgentBehavior::AckOnly]);
        let mut executor = ActionExecutor::new(&mut session, timeouts());

        let started = Instant::now();
        let err = executor
            .perform(&mut Action::left_click("OK"))
            .await
            .unwrap_err();

        assert!(matches!(err, ActionError::ActionTimeout { .. }));
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_events_are_skipped() {
        let (mut session, agent) = FakeAgent::session(vec![AgentBehavior::Complete]);
        agent.inject_stale();
        let mut executor = ActionExecutor::new(&mut session, timeouts());

        executor.perform(&mut Action::send_keys("abc")).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn capture_returns_screen_payload() {
        let (mut session, agent) = FakeAgent::session(vec![]);
        agent.set_screen("iVBORw0", Some("Invoice 42"));
        let mut executor = ActionExecutor::new(&mut session, timeouts());

        let screen = executor.capture(true).await.unwrap();

        assert_eq!(screen.image_b64, "iVBORw0");
        assert_eq!(screen.ocr_text.as_deref(), Some("Invoice 42"));
        let sent = agent.sent();
        assert_eq!(sent[0].command, DeviceCommand::GetScreen { include_ocr: true });
        assert_eq!(sent[0].correlation_id.as_deref(), Some("run-test"));
    }
}
