#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Router;
use pilot::device::{DeviceError, DeviceManager};
use pilot::transport::{ConnectionState, Connector, Transport, TransportError};
use shared_types::{CommandOutput, DeviceCommand, DeviceEvent, DeviceRequest, RemoteDevice};
use tokio::net::TcpListener;

pub struct TestServer {
    pub addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub async fn serve(app: Router) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind listener");
    let addr = listener.local_addr().expect("Failed to get addr");
    let handle = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .await
            .expect("Server failed");
    });
    TestServer { addr, handle }
}

pub fn device() -> RemoteDevice {
    RemoteDevice {
        id: "dev-7".into(),
        name: "vm-7".into(),
        wss_token: "t0k".into(),
    }
}

/// Device manager that counts leases.
#[derive(Default)]
pub struct CountingDevices {
    pub allocations: AtomicUsize,
    pub deallocations: AtomicUsize,
    pub refuse: bool,
}

impl CountingDevices {
    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::SeqCst)
    }

    pub fn deallocations(&self) -> usize {
        self.deallocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceManager for CountingDevices {
    async fn allocate(&self, group: &str) -> Result<RemoteDevice, DeviceError> {
        self.allocations.fetch_add(1, Ordering::SeqCst);
        if self.refuse {
            return Err(DeviceError::NoneAvailable(group.to_string()));
        }
        Ok(device())
    }

    async fn deallocate(&self, _group: &str, _device_id: &str) -> Result<(), DeviceError> {
        self.deallocations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Clone, Copy)]
pub enum ConnectMode {
    Refuse,
    StuckConnecting,
    Open,
}

/// Hands out in-memory transports and remembers the URL it was given.
pub struct LoopbackConnector {
    pub mode: ConnectMode,
    pub closed: Arc<AtomicBool>,
    pub sent: Arc<Mutex<Vec<DeviceRequest>>>,
    pub urls: Mutex<Vec<String>>,
}

impl LoopbackConnector {
    pub fn new(mode: ConnectMode) -> Self {
        Self {
            mode,
            closed: Arc::new(AtomicBool::new(false)),
            sent: Arc::new(Mutex::new(Vec::new())),
            urls: Mutex::new(Vec::new()),
        }
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<DeviceRequest> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, TransportError> {
        self.urls.lock().unwrap().push(url.to_string());
        let state = match self.mode {
            ConnectMode::Refuse => return Err(TransportError::Handshake("connection refused".into())),
            ConnectMode::StuckConnecting => ConnectionState::Connecting,
            ConnectMode::Open => ConnectionState::Open,
        };
        Ok(Box::new(LoopbackTransport {
            state,
            closed: self.closed.clone(),
            sent: self.sent.clone(),
            pending: VecDeque::new(),
        }))
    }
}

/// Acks and completes every request; screens come back as a tiny PNG stub.
struct LoopbackTransport {
    state: ConnectionState,
    closed: Arc<AtomicBool>,
    sent: Arc<Mutex<Vec<DeviceRequest>>>,
    pending: VecDeque<DeviceEvent>,
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn state(&self) -> ConnectionState {
        self.state
    }

    async fn send(&mut self, request: &DeviceRequest) -> Result<(), TransportError> {
        if self.state != ConnectionState::Open {
            return Err(TransportError::NotOpen);
        }
        self.sent.lock().unwrap().push(request.clone());
        let output = match request.command {
            DeviceCommand::GetScreen { .. } => Some(CommandOutput::Screen {
                image_b64: "iVBORw0KGgo=".into(),
                ocr_text: None,
            }),
            DeviceCommand::Perform { .. } => None,
        };
        self.pending.push_back(DeviceEvent::Ack {
            request_id: request.request_id.clone(),
        });
        self.pending.push_back(DeviceEvent::Completed {
            request_id: request.request_id.clone(),
            output,
        });
        Ok(())
    }

    async fn next_event(&mut self) -> Result<DeviceEvent, TransportError> {
        self.pending.pop_front().ok_or(TransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.state = ConnectionState::Closed;
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
