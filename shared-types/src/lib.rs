//! Shared types between the automation core and its peers
//!
//! These types are used by:
//! - the automation core (`pilot`)
//! - the device agent on the remote machine (wire protocol)
//! - the operator issue queue and device manager (REST envelopes)
//!
//! Serializable with serde for JSON over WebSocket/HTTP

pub mod action;

pub use action::{
    Action, ActionKind, ActionParseError, ActionValidationError, Anchor, AnchorRelation, Offset,
    Target,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Core Types
// ============================================================================

/// Unique identifier for a device request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A device leased from the device manager for one session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteDevice {
    pub id: String,
    pub name: String,
    /// Token for the agent manager's publisher endpoint
    #[serde(default)]
    pub wss_token: String,
}

// ============================================================================
// Device Wire Protocol
// ============================================================================

/// Command sent to the device agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum DeviceCommand {
    /// Perform a UI action
    Perform { action: Action },

    /// Capture the current screen, optionally with OCR text
    GetScreen {
        #[serde(default)]
        include_ocr: bool,
    },
}

impl DeviceCommand {
    pub fn label(&self) -> String {
        match self {
            Self::Perform { action } => action.render(),
            Self::GetScreen { .. } => "GetScreen".to_string(),
        }
    }
}

/// Envelope for every outbound message on the device channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceRequest {
    pub request_id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(flatten)]
    pub command: DeviceCommand,
}

/// Inbound event from the device agent
///
/// Every request gets an `ack` once accepted and then exactly one of
/// `completed` / `failed`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceEvent {
    Ack {
        request_id: RequestId,
    },
    Completed {
        request_id: RequestId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<CommandOutput>,
    },
    Failed {
        request_id: RequestId,
        message: String,
    },
}

impl DeviceEvent {
    pub fn request_id(&self) -> &RequestId {
        match self {
            Self::Ack { request_id }
            | Self::Completed { request_id, .. }
            | Self::Failed { request_id, .. } => request_id,
        }
    }
}

/// Payload carried by a `completed` event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandOutput {
    /// Text read from the screen (GetText)
    Text { text: String },

    /// Screenshot as base64 PNG
    Screen {
        image_b64: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ocr_text: Option<String>,
    },
}

// ============================================================================
// REST Envelopes
// ============================================================================

/// Common `{success, message, data}` envelope used by the device manager and
/// the operator queue. The queue names its list `resources`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default = "Vec::new", alias = "resources")]
    pub data: Vec<T>,
}

impl<T> ApiEnvelope<T> {
    /// First resource of a successful response.
    pub fn into_first(self) -> Option<T> {
        if !self.success {
            return None;
        }
        self.data.into_iter().next()
    }
}

// ============================================================================
// Operator Issues
// ============================================================================

/// Resolution state of an operator issue
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum IssueResolution {
    #[default]
    Pending,
    /// Operator did the work by hand
    Performed,
    /// Operator says the step cannot be done
    Raise,
    /// Deadline passed without an answer
    Timeout,
}

impl IssueResolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Performed => "performed",
            Self::Raise => "raise",
            Self::Timeout => "timeout",
        }
    }
}

/// Issue record as stored by the queue
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Issue {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub resolution_deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resolution: Option<IssueResolution>,
    #[serde(default)]
    pub resolved_by: Option<String>,
}

impl Issue {
    pub fn resolution(&self) -> IssueResolution {
        self.resolution.unwrap_or_default()
    }
}

/// Request body for creating an issue
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewIssue {
    pub title: String,
    pub description: String,
    /// ISO-8601 deadline after which the issue resolves as timeout
    pub resolution_deadline: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proc_inst_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
}

/// Request body for resolving an issue
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResolveIssue {
    pub resolution: IssueResolution,
    pub resolved_by: String,
}

// ============================================================================
// Runs
// ============================================================================

/// Input for one automation run
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RunPayload {
    #[serde(alias = "instance_id")]
    pub run_id: String,
    #[serde(default)]
    pub document_id: Option<String>,
    #[serde(default)]
    pub client_name: Option<String>,
    /// Business data the flow reads values from
    #[serde(default)]
    pub structured_data: serde_json::Value,
}

/// Result of one automation run, written to the result sink
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunOutcome {
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub result_data: serde_json::Value,
    pub finished_at: DateTime<Utc>,
}

impl RunOutcome {
    pub fn succeeded(result_data: serde_json::Value) -> Self {
        Self {
            success: true,
            message: "completed".to_string(),
            result_data,
            finished_at: Utc::now(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            result_data: serde_json::Value::Null,
            finished_at: Utc::now(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
