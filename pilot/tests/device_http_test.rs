//! Device allocation client against an in-process fake backend.

mod support;

use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use pilot::device::{DeviceError, DeviceManager, HttpDeviceManager};
use serde_json::{json, Value};
use support::serve;

#[derive(Default)]
struct Backend {
    empty_pool: bool,
    requests: Vec<(String, Value)>,
}

type Shared = Arc<Mutex<Backend>>;

async fn allocate(State(backend): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
    let mut backend = backend.lock().unwrap();
    backend.requests.push(("allocate".into(), body));
    if backend.empty_pool {
        return Json(json!({"success": true, "data": []}));
    }
    Json(json!({
        "success": true,
        "data": [{"id": "dev-3", "name": "vm-3", "wss_token": "abc"}]
    }))
}

async fn deallocate(State(backend): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
    backend.lock().unwrap().requests.push(("deallocate".into(), body));
    Json(json!({"success": true, "data": []}))
}

async fn start(backend: Backend) -> (support::TestServer, Shared) {
    let shared = Arc::new(Mutex::new(backend));
    let app = Router::new()
        .route("/remote_device/allocate", post(allocate))
        .route("/remote_device/deallocate", post(deallocate))
        .with_state(shared.clone());
    (serve(app).await, shared)
}

#[tokio::test]
async fn allocate_then_deallocate_in_group() {
    let (server, backend) = start(Backend::default()).await;
    let devices = HttpDeviceManager::new(format!("http://{}/", server.addr), Some("key".into()));

    let device = devices.allocate("accounting").await.unwrap();
    devices.deallocate("accounting", &device.id).await.unwrap();

    assert_eq!(device.name, "vm-3");
    assert_eq!(device.wss_token, "abc");
    let requests = backend.lock().unwrap().requests.clone();
    assert_eq!(requests[0].1, json!({"organization_id": "accounting"}));
    assert_eq!(
        requests[1].1,
        json!({"organization_id": "accounting", "remote_device_id": "dev-3"})
    );
}

#[tokio::test]
async fn empty_pool_is_none_available() {
    let (server, _backend) = start(Backend {
        empty_pool: true,
        ..Backend::default()
    })
    .await;
    let devices = HttpDeviceManager::new(format!("http://{}", server.addr), None);

    let err = devices.allocate("accounting").await.unwrap_err();

    assert!(matches!(err, DeviceError::NoneAvailable(ref group) if group == "accounting"));
}
