//! Bidirectional channel to the device agent.
//!
//! [`Transport`] is the seam the session and executor talk to; [`WsConnector`]
//! and [`WsTransport`] implement it over a secure WebSocket to the agent
//! manager's publisher endpoint.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared_types::{DeviceEvent, DeviceRequest};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::config::{MAX_FRAME_SIZE, PING_TIMEOUT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("transport is not open")]
    NotOpen,
    #[error("send failed: {0}")]
    Send(String),
    #[error("receive failed: {0}")]
    Receive(String),
    #[error("connection closed by peer")]
    Closed,
    #[error("no traffic for {0:?}")]
    Idle(Duration),
}

#[async_trait]
pub trait Transport: Send {
    fn state(&self) -> ConnectionState;

    async fn send(&mut self, request: &DeviceRequest) -> Result<(), TransportError>;

    /// Next decodable event from the agent. Frames that are not device events
    /// are skipped.
    async fn next_event(&mut self) -> Result<DeviceEvent, TransportError>;

    /// Close the channel. Closing an already closed transport is a no-op.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Opens transports; the session controller owns one.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, TransportError>;
}

pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, TransportError> {
        let mut config = WebSocketConfig::default();
        config.max_frame_size = Some(MAX_FRAME_SIZE);
        config.max_message_size = Some(MAX_FRAME_SIZE);

        let (stream, response) =
            tokio_tungstenite::connect_async_with_config(url, Some(config), false)
                .await
                .map_err(|e| TransportError::Handshake(e.to_string()))?;
        tracing::debug!(status = %response.status(), "WebSocket handshake completed");

        Ok(Box::new(WsTransport {
            stream,
            state: ConnectionState::Open,
            idle_timeout: PING_TIMEOUT,
        }))
    }
}

pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    state: ConnectionState,
    idle_timeout: Duration,
}

#[async_trait]
impl Transport for WsTransport {
    fn state(&self) -> ConnectionState {
        self.state
    }

    async fn send(&mut self, request: &DeviceRequest) -> Result<(), TransportError> {
        if self.state != ConnectionState::Open {
            return Err(TransportError::NotOpen);
        }
        let text = serde_json::to_string(request).map_err(|e| TransportError::Send(e.to_string()))?;
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn next_event(&mut self) -> Result<DeviceEvent, TransportError> {
        loop {
            if self.state != ConnectionState::Open {
                return Err(TransportError::NotOpen);
            }
            let frame = match tokio::time::timeout(self.idle_timeout, self.stream.next()).await {
                Ok(frame) => frame,
                Err(_) => {
                    self.state = ConnectionState::Closed;
                    return Err(TransportError::Idle(self.idle_timeout));
                }
            };
            let payload = match frame {
                Some(Ok(Message::Text(text))) => text.into_bytes(),
                Some(Ok(Message::Binary(bytes))) => bytes,
                Some(Ok(Message::Close(_))) | None => {
                    self.state = ConnectionState::Closed;
                    return Err(TransportError::Closed);
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    self.state = ConnectionState::Closed;
                    return Err(TransportError::Receive(e.to_string()));
                }
            };
            match serde_json::from_slice::<DeviceEvent>(&payload) {
                Ok(event) => return Ok(event),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping undecodable frame from device agent");
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.state == ConnectionState::Closed {
            return Ok(());
        }
        self.state = ConnectionState::Closed;
        match self.stream.close(None).await {
            Ok(()) => Ok(()),
            Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed)
            | Err(tokio_tungstenite::tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(TransportError::Send(e.to_string())),
        }
    }
}

/// `<base>/<device_name>/publisher?token=<token>`
pub fn publisher_url(base: &str, device_name: &str, token: &str) -> String {
    format!(
        "{}/{device_name}/publisher?token={token}",
        base.trim_end_matches('/')
    )
}
