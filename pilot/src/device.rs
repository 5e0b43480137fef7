//! Device allocation against the automation backend.

use async_trait::async_trait;
use serde::Serialize;
use shared_types::{ApiEnvelope, RemoteDevice};

use crate::config::HTTP_REQUEST_TIMEOUT;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("device manager request failed: {0}")]
    Request(String),
    #[error("device manager returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("device manager rejected request: {0}")]
    Rejected(String),
    #[error("no device available in group {0}")]
    NoneAvailable(String),
}

/// Leases remote devices for automation sessions.
#[async_trait]
pub trait DeviceManager: Send + Sync {
    async fn allocate(&self, group: &str) -> Result<RemoteDevice, DeviceError>;
    async fn deallocate(&self, group: &str, device_id: &str) -> Result<(), DeviceError>;
}

#[derive(Serialize)]
struct AllocateBody<'a> {
    organization_id: &'a str,
}

#[derive(Serialize)]
struct DeallocateBody<'a> {
    organization_id: &'a str,
    remote_device_id: &'a str,
}

/// `reqwest` client for `/remote_device/{allocate,deallocate}`.
#[derive(Clone)]
pub struct HttpDeviceManager {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpDeviceManager {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(HTTP_REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    async fn post<B: Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<ApiEnvelope<RemoteDevice>, DeviceError> {
        let mut request = self
            .client
            .post(format!("{}{path}", self.base_url))
            .json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| DeviceError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DeviceError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let envelope: ApiEnvelope<RemoteDevice> = response
            .json()
            .await
            .map_err(|e| DeviceError::Request(format!("invalid response body: {e}")))?;
        if !envelope.success {
            return Err(DeviceError::Rejected(
                envelope
                    .message
                    .unwrap_or_else(|| "unspecified error".to_string()),
            ));
        }
        Ok(envelope)
    }
}

#[async_trait]
impl DeviceManager for HttpDeviceManager {
    async fn allocate(&self, group: &str) -> Result<RemoteDevice, DeviceError> {
        let envelope = self
            .post(
                "/remote_device/allocate",
                &AllocateBody {
                    organization_id: group,
                },
            )
            .await?;
        let device = envelope
            .into_first()
            .ok_or_else(|| DeviceError::NoneAvailable(group.to_string()))?;
        tracing::info!(group, device_id = %device.id, device_name = %device.name, "Allocated remote device");
        Ok(device)
    }

    async fn deallocate(&self, group: &str, device_id: &str) -> Result<(), DeviceError> {
        self.post(
            "/remote_device/deallocate",
            &DeallocateBody {
                organization_id: group,
                remote_device_id: device_id,
            },
        )
        .await?;
        tracing::info!(group, device_id, "Deallocated remote device");
        Ok(())
    }
}
