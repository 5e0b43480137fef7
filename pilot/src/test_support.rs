//! In-process fakes for unit tests: a scripted device agent, model gateway,
//! screen, and operator queue.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use shared_types::{
    CommandOutput, DeviceCommand, DeviceEvent, DeviceRequest, Issue, IssueResolution, NewIssue,
    RemoteDevice, RequestId, ResolveIssue,
};

use crate::executor::{Screen, ScreenError, ScreenSource};
use crate::operator::{OperatorError, OperatorQueue};
use crate::oracle::{ModelCall, ModelGateway, OracleError, StateOracle};
use crate::session::Session;
use crate::transport::{ConnectionState, Transport, TransportError};

// ============================================================================
// Device agent
// ============================================================================

/// How the fake agent answers the next `Perform`.
#[derive(Debug, Clone)]
pub enum AgentBehavior {
    Complete,
    Fail(String),
    Silent,
    AckOnly,
}

struct AgentState {
    behaviors: VecDeque<AgentBehavior>,
    sent: Vec<DeviceRequest>,
    pending: VecDeque<DeviceEvent>,
    screen: (String, Option<String>),
    inject_stale: bool,
    connection: ConnectionState,
}

#[derive(Clone)]
pub struct FakeAgent {
    inner: Arc<Mutex<AgentState>>,
}

impl FakeAgent {
    /// An open session on `dev-1` whose transport is driven by `behaviors`.
    pub fn session(behaviors: Vec<AgentBehavior>) -> (Session, FakeAgent) {
        let agent = FakeAgent {
            inner: Arc::new(Mutex::new(AgentState {
                behaviors: behaviors.into(),
                sent: Vec::new(),
                pending: VecDeque::new(),
                screen: ("iVBORw0KGgo=".to_string(), None),
                inject_stale: false,
                connection: ConnectionState::Open,
            })),
        };
        let device = RemoteDevice {
            id: "dev-1".into(),
            name: "vm-test".into(),
            wss_token: "token".into(),
        };
        let transport = FakeTransport {
            inner: agent.inner.clone(),
        };
        let session = Session::attached(device, "test-group", "run-test", Box::new(transport));
        (session, agent)
    }

    pub fn sent(&self) -> Vec<DeviceRequest> {
        self.inner.lock().unwrap().sent.clone()
    }

    /// Precede the next reply with an ack for an unrelated request.
    pub fn inject_stale(&self) {
        self.inner.lock().unwrap().inject_stale = true;
    }

    pub fn set_screen(&self, image_b64: &str, ocr_text: Option<&str>) {
        self.inner.lock().unwrap().screen = (image_b64.to_string(), ocr_text.map(str::to_string));
    }

    pub fn connection(&self) -> ConnectionState {
        self.inner.lock().unwrap().connection
    }
}

struct FakeTransport {
    inner: Arc<Mutex<AgentState>>,
}

#[async_trait]
impl Transport for FakeTransport {
    fn state(&self) -> ConnectionState {
        self.inner.lock().unwrap().connection
    }

    async fn send(&mut self, request: &DeviceRequest) -> Result<(), TransportError> {
        let mut state = self.inner.lock().unwrap();
        if state.connection != ConnectionState::Open {
            return Err(TransportError::NotOpen);
        }
        state.sent.push(request.clone());
        if std::mem::take(&mut state.inject_stale) {
            state.pending.push_back(DeviceEvent::Ack {
                request_id: RequestId::new(),
            });
        }

        let request_id = request.request_id.clone();
        let ack = DeviceEvent::Ack {
            request_id: request_id.clone(),
        };
        match &request.command {
            DeviceCommand::GetScreen { include_ocr } => {
                let (image_b64, ocr) = state.screen.clone();
                let ocr_text = if *include_ocr { ocr } else { None };
                state.pending.push_back(ack);
                state.pending.push_back(DeviceEvent::Completed {
                    request_id,
                    output: Some(CommandOutput::Screen { image_b64, ocr_text }),
                });
            }
            DeviceCommand::Perform { .. } => {
                match state.behaviors.pop_front().unwrap_or(AgentBehavior::Complete) {
                    AgentBehavior::Complete => {
                        state.pending.push_back(ack);
                        state.pending.push_back(DeviceEvent::Completed {
                            request_id,
                            output: None,
                        });
                    }
                    AgentBehavior::Fail(message) => {
                        state.pending.push_back(ack);
                        state.pending.push_back(DeviceEvent::Failed { request_id, message });
                    }
                    AgentBehavior::Silent => {}
                    AgentBehavior::AckOnly => state.pending.push_back(ack),
                }
            }
        }
        Ok(())
    }

    async fn next_event(&mut self) -> Result<DeviceEvent, TransportError> {
        let next = self.inner.lock().unwrap().pending.pop_front();
        match next {
            Some(event) => Ok(event),
            None => futures::future::pending().await,
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.lock().unwrap().connection = ConnectionState::Closed;
        Ok(())
    }
}

// ============================================================================
// Model gateway and screen
// ============================================================================

/// Replays canned responses in order and records every call.
#[derive(Clone)]
pub struct ScriptedGateway {
    responses: Arc<Mutex<VecDeque<Result<Value, OracleError>>>>,
    calls: Arc<Mutex<Vec<ModelCall>>>,
}

impl ScriptedGateway {
    pub fn new(responses: Vec<Result<Value, OracleError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into())),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn calls(&self) -> Vec<ModelCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelGateway for ScriptedGateway {
    async fn complete(&self, call: &ModelCall) -> Result<Value, OracleError> {
        self.calls.lock().unwrap().push(call.clone());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(OracleError::Unexpected("no scripted response left".into())))
    }
}

pub fn oracle_with(gateway: ScriptedGateway) -> StateOracle {
    StateOracle::new(Arc::new(gateway), "test-model")
}

#[derive(Default)]
pub struct FakeScreen {
    ocr: Option<String>,
    captures_with_ocr: usize,
}

impl FakeScreen {
    pub fn with_ocr(text: &str) -> Self {
        Self {
            ocr: Some(text.to_string()),
            captures_with_ocr: 0,
        }
    }

    pub fn captures_with_ocr(&self) -> usize {
        self.captures_with_ocr
    }
}

#[async_trait]
impl ScreenSource for FakeScreen {
    async fn capture(&mut self, include_ocr: bool) -> Result<Screen, ScreenError> {
        if include_ocr {
            self.captures_with_ocr += 1;
        }
        Ok(Screen {
            image_b64: "iVBORw0KGgo=".to_string(),
            ocr_text: if include_ocr { self.ocr.clone() } else { None },
        })
    }
}

// ============================================================================
// Operator queue
// ============================================================================

#[derive(Default)]
struct QueueState {
    statuses: VecDeque<IssueResolution>,
    reject: bool,
    hang_status: bool,
    created: Vec<NewIssue>,
    status_calls: usize,
    resolutions: Vec<IssueResolution>,
}

#[derive(Clone, Default)]
pub struct FakeOperatorQueue {
    inner: Arc<Mutex<QueueState>>,
}

impl FakeOperatorQueue {
    /// Reports `statuses` in order, then `pending` forever.
    pub fn with_statuses(statuses: Vec<IssueResolution>) -> Self {
        let queue = Self::default();
        queue.inner.lock().unwrap().statuses = statuses.into();
        queue
    }

    /// Refuses to create issues.
    pub fn rejecting() -> Self {
        let queue = Self::default();
        queue.inner.lock().unwrap().reject = true;
        queue
    }

    /// Status polls never answer.
    pub fn hanging_status() -> Self {
        let queue = Self::default();
        queue.inner.lock().unwrap().hang_status = true;
        queue
    }

    pub fn created(&self) -> Vec<NewIssue> {
        self.inner.lock().unwrap().created.clone()
    }

    pub fn status_calls(&self) -> usize {
        self.inner.lock().unwrap().status_calls
    }

    pub fn resolutions(&self) -> Vec<IssueResolution> {
        self.inner.lock().unwrap().resolutions.clone()
    }
}

fn issue(resolution: IssueResolution) -> Issue {
    Issue {
        id: "issue-1".into(),
        title: "test issue".into(),
        description: String::new(),
        resolution_deadline: None,
        resolution: Some(resolution),
        resolved_by: None,
    }
}

#[async_trait]
impl OperatorQueue for FakeOperatorQueue {
    async fn create_issue(&self, new_issue: &NewIssue) -> Result<Option<Issue>, OperatorError> {
        let mut state = self.inner.lock().unwrap();
        if state.reject {
            return Ok(None);
        }
        state.created.push(new_issue.clone());
        Ok(Some(issue(IssueResolution::Pending)))
    }

    async fn issue_status(&self, _id: &str) -> Result<Option<Issue>, OperatorError> {
        let next = {
            let mut state = self.inner.lock().unwrap();
            state.status_calls += 1;
            (!state.hang_status)
                .then(|| state.statuses.pop_front().unwrap_or(IssueResolution::Pending))
        };
        match next {
            Some(resolution) => Ok(Some(issue(resolution))),
            None => std::future::pending().await,
        }
    }

    async fn resolve_issue(&self, _id: &str, body: &ResolveIssue) -> Result<Option<Issue>, OperatorError> {
        self.inner.lock().unwrap().resolutions.push(body.resolution);
        Ok(Some(issue(body.resolution)))
    }
}
