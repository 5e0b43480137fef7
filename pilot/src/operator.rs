//! Human escalation through the operator issue queue.
//!
//! An issue moves `pending -> performed | raise | timeout`. The waiting side
//! polls once per second until a terminal resolution or the deadline; on the
//! deadline it resolves the issue as `timeout` itself.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use shared_types::{ApiEnvelope, Issue, IssueResolution, NewIssue, ResolveIssue};
use tokio::time::Instant;

use crate::config::{deadline_after, Config, HTTP_REQUEST_TIMEOUT};

const REQUEST_ATTEMPTS: u32 = 3;
const POLL_INTERVAL: Duration = Duration::from_secs(1);
const RESOLVED_BY: &str = "pilot";

#[derive(Debug, thiserror::Error)]
pub enum OperatorError {
    #[error("operator queue request failed: {0}")]
    Request(String),
    #[error("operator queue returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid operator queue response: {0}")]
    Decode(String),
}

/// Issue queue API. `Ok(None)` is a soft failure (`success = false`).
#[async_trait]
pub trait OperatorQueue: Send + Sync {
    async fn create_issue(&self, issue: &NewIssue) -> Result<Option<Issue>, OperatorError>;
    async fn issue_status(&self, id: &str) -> Result<Option<Issue>, OperatorError>;
    async fn resolve_issue(&self, id: &str, body: &ResolveIssue) -> Result<Option<Issue>, OperatorError>;
}

#[derive(Clone)]
pub struct HttpOperatorQueue {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpOperatorQueue {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(HTTP_REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, format!("{}{path}", self.base_url));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send_once<B: Serialize + Sync>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Option<Issue>, OperatorError> {
        let mut builder = self.request(method, path);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| OperatorError::Request(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(OperatorError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        let envelope: ApiEnvelope<Issue> = response
            .json()
            .await
            .map_err(|e| OperatorError::Decode(e.to_string()))?;
        if !envelope.success {
            tracing::warn!(
                path,
                message = envelope.message.as_deref().unwrap_or(""),
                "Operator queue reported failure"
            );
        }
        Ok(envelope.into_first())
    }

    /// Up to three attempts with exponential backoff on transport or non-2xx.
    async fn send_with_retry<B: Serialize + Sync>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Option<Issue>, OperatorError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.send_once(method.clone(), path, body).await {
                Ok(issue) => return Ok(issue),
                Err(e) if attempt >= REQUEST_ATTEMPTS => return Err(e),
                Err(OperatorError::Decode(msg)) => return Err(OperatorError::Decode(msg)),
                Err(e) => {
                    let delay = Duration::from_secs(1u64 << (attempt - 1));
                    tracing::warn!(path, attempt, error = %e, "Operator queue request failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[async_trait]
impl OperatorQueue for HttpOperatorQueue {
    async fn create_issue(&self, issue: &NewIssue) -> Result<Option<Issue>, OperatorError> {
        self.send_with_retry(reqwest::Method::POST, "/issue", Some(issue))
            .await
    }

    async fn issue_status(&self, id: &str) -> Result<Option<Issue>, OperatorError> {
        self.send_once::<()>(reqwest::Method::GET, &format!("/issue/{id}"), None)
            .await
    }

    async fn resolve_issue(&self, id: &str, body: &ResolveIssue) -> Result<Option<Issue>, OperatorError> {
        self.send_with_retry(reqwest::Method::PUT, &format!("/issue/{id}/resolve"), Some(body))
            .await
    }
}

/// What to ask the operator.
#[derive(Debug, Clone)]
pub struct EscalationRequest {
    pub title: String,
    pub description: String,
    pub timeout: Duration,
    pub run_id: Option<String>,
    pub client: Option<String>,
    pub attachments: Vec<String>,
}

pub struct OperatorEscalation {
    queue: Arc<dyn OperatorQueue>,
    poll_interval: Duration,
}

impl OperatorEscalation {
    pub fn new(queue: Arc<dyn OperatorQueue>) -> Self {
        Self {
            queue,
            poll_interval: POLL_INTERVAL,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(Arc::new(HttpOperatorQueue::new(
            config.operator_queue_url.clone(),
            config.operator_queue_token.clone(),
        )))
    }

    /// File an issue and wait for a human. `true` only when the operator
    /// reports the work as performed before the deadline.
    pub async fn create_issue_and_wait(&self, request: EscalationRequest) -> bool {
        let deadline = deadline_after(Instant::now(), request.timeout);
        let resolution_deadline = chrono::Duration::from_std(request.timeout)
            .ok()
            .and_then(|timeout| Utc::now().checked_add_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let new_issue = NewIssue {
            title: request.title,
            description: request.description,
            resolution_deadline,
            proc_inst_id: request.run_id,
            client_name: request.client,
            attachments: request.attachments,
        };
        let issue = match self.queue.create_issue(&new_issue).await {
            Ok(Some(issue)) => issue,
            Ok(None) => {
                tracing::error!(title = %new_issue.title, "Operator queue did not create the issue");
                return false;
            }
            Err(e) => {
                tracing::error!(title = %new_issue.title, error = %e, "Failed to create operator issue");
                return false;
            }
        };
        tracing::info!(issue_id = %issue.id, deadline = %resolution_deadline, "Waiting for operator");

        while Instant::now() < deadline {
            match tokio::time::timeout_at(deadline, self.queue.issue_status(&issue.id)).await {
                Ok(Ok(Some(current))) => match current.resolution() {
                    IssueResolution::Performed => {
                        tracing::info!(issue_id = %issue.id, resolved_by = ?current.resolved_by, "Operator performed the step");
                        return true;
                    }
                    IssueResolution::Raise | IssueResolution::Timeout => {
                        tracing::info!(issue_id = %issue.id, resolution = current.resolution().as_str(), "Operator did not resolve the step");
                        return false;
                    }
                    IssueResolution::Pending => {}
                },
                Ok(Ok(None)) => tracing::warn!(issue_id = %issue.id, "Issue status unavailable"),
                Ok(Err(e)) => tracing::warn!(issue_id = %issue.id, error = %e, "Issue status poll failed"),
                Err(_) => {
                    tracing::warn!(issue_id = %issue.id, "Issue status poll still pending at the deadline");
                    break;
                }
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }

        tracing::warn!(issue_id = %issue.id, "Operator deadline passed, resolving as timeout");
        let body = ResolveIssue {
            resolution: IssueResolution::Timeout,
            resolved_by: RESOLVED_BY.to_string(),
        };
        if let Err(e) = self.queue.resolve_issue(&issue.id, &body).await {
            tracing::error!(issue_id = %issue.id, error = %e, "Failed to resolve issue as timeout");
        }
        false
    }
}
