//! Tuya adapter against a local stand-in for the vendor cloud.
//!
//! Tests include:
//! - Signed headers verified server-side on every request
//! - Token grant, refresh inside the expiry buffer, refresh failure
//! - Poll diffing and command translation over HTTP

#![cfg(feature = "tuya")]

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method, Uri};
use axum::routing::{get, post};
use axum::{Json, Router};
use devhub_core::{DeviceCommand, DeviceStatus, DiscoveryFilters, DeviceType, Protocol};
use devhub_devices::adapters::tuya::{TuyaAdapter, sign, string_to_sign};
use devhub_devices::{AdapterConfig, AdapterError, AdapterEvent, DeviceAdapter};
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::timeout;

const CLIENT_ID: &str = "test-client";
const CLIENT_SECRET: &str = "test-secret";
const LAMP: &str = "bf11223344556677aa";
const PLUG: &str = "bf99887766554433bb";

struct Cloud {
    devices: Mutex<Vec<Value>>,
    commands: Mutex<Vec<(String, Value)>>,
    grants: AtomicUsize,
    refreshes: AtomicUsize,
    bad_signatures: AtomicUsize,
    expire_secs: AtomicI64,
    reject_refresh: AtomicBool,
    list_delay_ms: AtomicU64,
    listings_in_flight: AtomicUsize,
    max_listings_in_flight: AtomicUsize,
}

impl Cloud {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            devices: Mutex::new(vec![
                device(LAMP, "dj", true, 100, json!([{"code": "switch_led", "value": true}])),
                device(PLUG, "cz", false, 100, json!([{"code": "switch_1", "value": false}])),
            ]),
            commands: Mutex::new(Vec::new()),
            grants: AtomicUsize::new(0),
            refreshes: AtomicUsize::new(0),
            bad_signatures: AtomicUsize::new(0),
            expire_secs: AtomicI64::new(7200),
            reject_refresh: AtomicBool::new(false),
            list_delay_ms: AtomicU64::new(0),
            listings_in_flight: AtomicUsize::new(0),
            max_listings_in_flight: AtomicUsize::new(0),
        })
    }

    fn verify(&self, method: &Method, uri: &Uri, headers: &HeaderMap, body: &[u8]) {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()
        };
        let url = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
        let expected = sign(
            CLIENT_SECRET,
            &header("client_id"),
            &header("access_token"),
            &header("t"),
            &header("nonce"),
            &string_to_sign(method.as_str(), body, url),
        )
        .unwrap();
        if header("sign") != expected
            || header("sign_method") != "HMAC-SHA256"
            || header("client_id") != CLIENT_ID
        {
            self.bad_signatures.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn token(&self, access: &str) -> Json<Value> {
        Json(json!({
            "success": true,
            "t": 0,
            "result": {
                "access_token": access,
                "refresh_token": format!("rt-{access}"),
                "expire_time": self.expire_secs.load(Ordering::SeqCst),
                "uid": "ay-test-user",
            }
        }))
    }
}

fn device(id: &str, category: &str, online: bool, update_time: i64, status: Value) -> Value {
    json!({
        "id": id,
        "name": format!("Device {id}"),
        "category": category,
        "online": online,
        "update_time": update_time,
        "status": status,
    })
}

fn ok(result: Value) -> Json<Value> {
    Json(json!({ "success": true, "t": 0, "result": result }))
}

async fn grant(
    State(cloud): State<Arc<Cloud>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Json<Value> {
    cloud.verify(&method, &uri, &headers, b"");
    let n = cloud.grants.fetch_add(1, Ordering::SeqCst) + 1;
    cloud.token(&format!("at{n}"))
}

async fn refresh(
    State(cloud): State<Arc<Cloud>>,
    Path(_refresh_token): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Json<Value> {
    cloud.verify(&method, &uri, &headers, b"");
    cloud.refreshes.fetch_add(1, Ordering::SeqCst);
    if cloud.reject_refresh.load(Ordering::SeqCst) {
        return Json(json!({ "success": false, "code": 1010, "msg": "token invalid", "t": 0 }));
    }
    cloud.token("refreshed")
}

async fn list_devices(
    State(cloud): State<Arc<Cloud>>,
    Path(_uid): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Json<Value> {
    cloud.verify(&method, &uri, &headers, b"");
    let in_flight = cloud.listings_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    cloud.max_listings_in_flight.fetch_max(in_flight, Ordering::SeqCst);
    let delay = cloud.list_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    cloud.listings_in_flight.fetch_sub(1, Ordering::SeqCst);
    ok(Value::Array(cloud.devices.lock().clone()))
}

async fn get_device(
    State(cloud): State<Arc<Cloud>>,
    Path(id): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Json<Value> {
    cloud.verify(&method, &uri, &headers, b"");
    match cloud.devices.lock().iter().find(|d| d["id"] == id.as_str()) {
        Some(d) => ok(d.clone()),
        None => Json(json!({ "success": false, "code": 2001, "msg": "device not found", "t": 0 })),
    }
}

async fn send_commands(
    State(cloud): State<Arc<Cloud>>,
    Path(id): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Json<Value> {
    cloud.verify(&method, &uri, &headers, &body);
    let payload: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    if !cloud.devices.lock().iter().any(|d| d["id"] == id.as_str()) {
        return Json(json!({ "success": false, "code": 2001, "msg": "device not found", "t": 0 }));
    }
    cloud.commands.lock().push((id, payload));
    ok(json!(true))
}

async fn spawn_cloud(cloud: Arc<Cloud>) -> String {
    let app = Router::new()
        .route("/v1.0/token", get(grant))
        .route("/v1.0/token/:refresh_token", get(refresh))
        .route("/v1.0/users/:uid/devices", get(list_devices))
        .route("/v1.0/devices/:id", get(get_device))
        .route("/v1.0/devices/:id/commands", post(send_commands))
        .with_state(cloud);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn adapter_for(base_url: &str) -> TuyaAdapter {
    let config = AdapterConfig::new(Protocol::Tuya)
        .with_auth("client_id", CLIENT_ID)
        .with_auth("client_secret", CLIENT_SECRET)
        .with_option("base_url", base_url)
        .with_option("poll_interval_secs", 3600);
    TuyaAdapter::new(Arc::new(config)).unwrap()
}

#[tokio::test]
async fn test_initialize_grants_token_and_loads_snapshot() {
    let cloud = Cloud::new();
    let adapter = adapter_for(&spawn_cloud(cloud.clone()).await);

    adapter.initialize().await.unwrap();

    assert!(adapter.is_connected());
    assert_eq!(adapter.snapshot_len(), 2);
    assert_eq!(cloud.grants.load(Ordering::SeqCst), 1);
    assert_eq!(cloud.bad_signatures.load(Ordering::SeqCst), 0);
    assert_eq!(adapter.connection_status().connection_attempts, 1);
}

#[tokio::test]
async fn test_poll_emits_only_changed_devices() {
    let cloud = Cloud::new();
    let adapter = adapter_for(&spawn_cloud(cloud.clone()).await);
    adapter.initialize().await.unwrap();

    assert!(adapter.poll_now().await.unwrap().is_empty());

    cloud.devices.lock()[1] =
        device(PLUG, "cz", true, 100, json!([{"code": "switch_1", "value": false}]));
    let mut events = adapter.events();
    let changed = adapter.poll_now().await.unwrap();

    assert_eq!(changed.len(), 1);
    assert_eq!(changed[0].device_id, PLUG);
    assert_eq!(changed[0].status, DeviceStatus::Online);
    match timeout(Duration::from_secs(1), events.next()).await.unwrap() {
        Some(AdapterEvent::DeviceUpdate(update)) => assert_eq!(update, changed[0]),
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(adapter.snapshot_device(PLUG).unwrap().online);
}

#[tokio::test]
async fn test_turn_on_translates_to_switch_code() {
    let cloud = Cloud::new();
    let adapter = adapter_for(&spawn_cloud(cloud.clone()).await);
    adapter.initialize().await.unwrap();

    let result = adapter
        .send_command(LAMP, &DeviceCommand::new("turn_off"))
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(
        result.state_fragment().and_then(|s| s.get("switch_led")),
        Some(&json!(false))
    );
    let sent = cloud.commands.lock().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(
        sent[0].1,
        json!({ "commands": [{ "code": "switch_led", "value": false }] })
    );
    assert_eq!(adapter.stats().commands.successful_commands, 1);
    assert_eq!(cloud.bad_signatures.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_vendor_failure_is_rejected_command() {
    let cloud = Cloud::new();
    let adapter = adapter_for(&spawn_cloud(cloud.clone()).await);
    adapter.initialize().await.unwrap();

    let err = adapter
        .send_command("bf00000000000000zz", &DeviceCommand::new("turn_on"))
        .await
        .unwrap_err();

    assert!(matches!(err, AdapterError::CommandRejected(_)));
    assert!(err.to_string().contains("device not found"));
    assert_eq!(adapter.stats().commands.failed_commands, 1);
}

#[tokio::test]
async fn test_discovery_and_point_lookups() {
    let cloud = Cloud::new();
    let adapter = adapter_for(&spawn_cloud(cloud.clone()).await);
    adapter.initialize().await.unwrap();

    let all = adapter.discover_devices(None).await.unwrap();
    assert_eq!(all.len(), 2);
    let plug = all.iter().find(|d| d.device_id == PLUG).unwrap();
    assert_eq!(plug.device_type, DeviceType::Plug);
    assert_eq!(plug.confidence, 0.6);

    let online = DiscoveryFilters {
        online_only: true,
        ..Default::default()
    };
    assert_eq!(adapter.discover_devices(Some(&online)).await.unwrap().len(), 1);

    let info = adapter.get_device_info(LAMP).await.unwrap();
    assert_eq!(info.device_type, DeviceType::Light);
    assert_eq!(info.capabilities, vec!["on_off"]);
    assert!(adapter.test_device_connection(LAMP).await.unwrap());
    assert!(!adapter.test_device_connection(PLUG).await.unwrap());

    let status = adapter.get_device_status(LAMP).await.unwrap();
    assert_eq!(status.state.get("switch_led"), Some(&json!(true)));
}

#[tokio::test]
async fn test_token_inside_buffer_is_refreshed() {
    let cloud = Cloud::new();
    // Four minutes of lifetime is inside the five-minute buffer.
    cloud.expire_secs.store(240, Ordering::SeqCst);
    let adapter = adapter_for(&spawn_cloud(cloud.clone()).await);
    adapter.initialize().await.unwrap();

    adapter.get_device_status(LAMP).await.unwrap();

    assert_eq!(cloud.grants.load(Ordering::SeqCst), 1);
    assert!(cloud.refreshes.load(Ordering::SeqCst) >= 1);
    assert_eq!(cloud.bad_signatures.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_refresh_failure_disconnects_with_auth_error() {
    let cloud = Cloud::new();
    cloud.expire_secs.store(240, Ordering::SeqCst);
    let adapter = adapter_for(&spawn_cloud(cloud.clone()).await);
    adapter.initialize().await.unwrap();
    assert!(adapter.is_connected());

    cloud.reject_refresh.store(true, Ordering::SeqCst);
    let mut events = adapter.events();
    let err = adapter.poll_now().await.unwrap_err();

    assert!(matches!(err, AdapterError::Authentication(_)));
    assert!(!adapter.is_connected());
    match timeout(Duration::from_secs(1), events.next()).await.unwrap() {
        Some(AdapterEvent::Disconnected { error: Some(e) }) => {
            assert!(e.starts_with("Authentication failed"))
        }
        other => panic!("unexpected event: {other:?}"),
    }

    let diagnostics = adapter.get_diagnostics().await.unwrap();
    assert!(!diagnostics.healthy);
    assert!(diagnostics.details["last_poll_error"].is_string());
}

#[tokio::test]
async fn test_concurrent_polls_do_not_overlap() {
    let cloud = Cloud::new();
    let adapter = adapter_for(&spawn_cloud(cloud.clone()).await);
    adapter.initialize().await.unwrap();

    cloud.list_delay_ms.store(100, Ordering::SeqCst);
    let (a, b) = tokio::join!(adapter.poll_now(), adapter.poll_now());
    a.unwrap();
    b.unwrap();

    assert_eq!(cloud.max_listings_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_out_of_range_token_lifetime_is_auth_error() {
    let cloud = Cloud::new();
    cloud.expire_secs.store(i64::MAX, Ordering::SeqCst);
    let base_url = spawn_cloud(cloud.clone()).await;
    let mut config = AdapterConfig::new(Protocol::Tuya)
        .with_auth("client_id", CLIENT_ID)
        .with_auth("client_secret", CLIENT_SECRET)
        .with_option("base_url", base_url.as_str())
        .with_option("poll_interval_secs", 3600);
    config.retry_attempts = 1;
    let adapter = TuyaAdapter::new(Arc::new(config)).unwrap();

    let err = adapter.initialize().await.unwrap_err();

    match err {
        AdapterError::Authentication(msg) => assert!(msg.contains("malformed token response")),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!adapter.is_connected());
}
