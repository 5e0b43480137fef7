//! Session lifecycle: device lease plus transport, released on every exit path.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use shared_types::RemoteDevice;

use crate::config::Config;
use crate::context::{self, RunScope};
use crate::device::{DeviceError, DeviceManager, HttpDeviceManager};
use crate::transport::{publisher_url, ConnectionState, Connector, Transport, WsConnector};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("device allocation failed: {0}")]
    Allocation(#[source] DeviceError),
    #[error("connection to device {device} failed: {reason}")]
    ConnectionFailed { device: String, reason: String },
    #[error("session release failed: {0}")]
    Release(String),
}

/// One open device session. Owned by the run and lent to the executor.
pub struct Session {
    device: RemoteDevice,
    group: String,
    correlation_id: String,
    transport: Box<dyn Transport>,
    released: bool,
}

impl Session {
    /// Wrap an already connected transport.
    pub fn attached(
        device: RemoteDevice,
        group: impl Into<String>,
        correlation_id: impl Into<String>,
        transport: Box<dyn Transport>,
    ) -> Self {
        Self {
            device,
            group: group.into(),
            correlation_id: correlation_id.into(),
            transport,
            released: false,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device.id
    }

    pub fn device_name(&self) -> &str {
        &self.device.name
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn state(&self) -> ConnectionState {
        if self.released {
            ConnectionState::Closed
        } else {
            self.transport.state()
        }
    }

    pub(crate) fn transport_mut(&mut self) -> &mut dyn Transport {
        self.transport.as_mut()
    }
}

pub struct SessionController {
    devices: Arc<dyn DeviceManager>,
    connector: Arc<dyn Connector>,
    manager_url: String,
}

impl SessionController {
    pub fn new(
        devices: Arc<dyn DeviceManager>,
        connector: Arc<dyn Connector>,
        manager_url: impl Into<String>,
    ) -> Self {
        Self {
            devices,
            connector,
            manager_url: manager_url.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Arc::new(HttpDeviceManager::new(
                config.clerk_api_url.clone(),
                config.clerk_api_key.clone(),
            )),
            Arc::new(WsConnector),
            config.agent_manager_url.clone(),
        )
    }

    /// Allocate a device in `group` and connect to it. A failed handshake
    /// still releases the device.
    pub async fn open(&self, group: &str, correlation_id: &str) -> Result<Session, SessionError> {
        let device = self
            .devices
            .allocate(group)
            .await
            .map_err(SessionError::Allocation)?;

        let url = publisher_url(&self.manager_url, &device.name, &device.wss_token);
        tracing::info!(
            device_id = %device.id,
            device_name = %device.name,
            correlation_id,
            "Connecting to device agent"
        );

        let failure = match self.connector.connect(&url).await {
            Ok(transport) if transport.state() == ConnectionState::Open => {
                context::publish(RunScope {
                    correlation_id: correlation_id.to_string(),
                    device_id: device.id.clone(),
                    device_name: device.name.clone(),
                });
                tracing::info!(device_id = %device.id, "Session open");
                return Ok(Session::attached(device, group, correlation_id, transport));
            }
            Ok(transport) => format!("transport in state {:?} after handshake", transport.state()),
            Err(e) => e.to_string(),
        };

        tracing::error!(device_id = %device.id, reason = %failure, "Connection failed");
        if let Err(e) = self.devices.deallocate(group, &device.id).await {
            tracing::error!(device_id = %device.id, error = %e, "Failed to deallocate after connection failure");
        }
        Err(SessionError::ConnectionFailed {
            device: device.name,
            reason: failure,
        })
    }

    /// Close the transport if open and release the device. Safe to call twice.
    pub async fn close(&self, session: &mut Session) -> Result<(), SessionError> {
        if session.released {
            return Ok(());
        }
        session.released = true;

        if session.transport.state() != ConnectionState::Closed {
            if let Err(e) = session.transport.close().await {
                tracing::warn!(device_id = %session.device.id, error = %e, "Transport close failed");
            }
        }
        context::clear(&session.correlation_id);

        let result = self
            .devices
            .deallocate(&session.group, &session.device.id)
            .await
            .map_err(|e| SessionError::Release(e.to_string()));
        match &result {
            Ok(()) => tracing::info!(device_id = %session.device.id, "Session closed"),
            Err(e) => tracing::error!(device_id = %session.device.id, error = %e, "Session release failed"),
        }
        result
    }

    /// Run `body` inside an open session and release it afterwards, whether
    /// the body returns, fails, or panics.
    pub async fn with_session<T, E, F>(
        &self,
        group: &str,
        correlation_id: &str,
        body: F,
    ) -> Result<T, E>
    where
        E: From<SessionError>,
        F: for<'a> FnOnce(&'a mut Session) -> BoxFuture<'a, Result<T, E>>,
    {
        let mut session = self.open(group, correlation_id).await?;
        let outcome = AssertUnwindSafe(body(&mut session)).catch_unwind().await;
        let closed = self.close(&mut session).await;

        match outcome {
            Ok(Ok(value)) => {
                closed?;
                Ok(value)
            }
            Ok(Err(e)) => Err(e),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}
