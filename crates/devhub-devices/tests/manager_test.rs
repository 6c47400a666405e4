//! Adapter manager behaviour with scripted adapters.
//!
//! Tests include:
//! - Discovery populating and overwriting the routing map
//! - Health checks racing a timeout
//! - Device updates relayed unchanged onto the event bus
//! - Partial initialization and best-effort shutdown

use devhub_core::{
    DeviceCommand, DeviceStatus, DeviceStatusUpdate, DeviceType, HubEvent, Protocol, UpdateSource,
};
use devhub_devices::{
    AdapterConfig, AdapterError, AdapterManager, AdapterRegistry, DeviceAdapter, ManagerConfig,
    MockAdapter, MockDiagnostics, MockResponse,
};
use serde_json::{Map, json};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::time::timeout;

fn quiet_config() -> ManagerConfig {
    // Health checks are driven by hand in these tests.
    ManagerConfig {
        health_check_interval_secs: 0,
        health_check_timeout_secs: 10,
    }
}

fn manager_with(mocks: &[Arc<MockAdapter>]) -> Arc<AdapterManager> {
    let mut registry = AdapterRegistry::new();
    let mut configs = Vec::new();
    for mock in mocks {
        let protocol = mock.protocol();
        let mock = mock.clone();
        registry.register(protocol, move |_| Ok(mock.clone() as Arc<dyn DeviceAdapter>));
        configs.push(AdapterConfig::new(protocol));
    }
    Arc::new(AdapterManager::new(configs, quiet_config(), registry))
}

#[tokio::test]
async fn test_discovery_builds_routing_map() {
    let tuya = Arc::new(
        MockAdapter::new(Protocol::Tuya)
            .with_device("lamp0000000001", DeviceType::Light)
            .with_device("plug0000000001", DeviceType::Plug),
    );
    let manager = manager_with(&[tuya]);
    manager.initialize().await.unwrap();

    let found = manager.discover_devices(None, None).await.unwrap();
    assert_eq!(found.len(), 2);
    assert_eq!(manager.stats().routed_devices, 2);

    let lights = manager
        .discover_devices(Some(Protocol::Tuya), Some(DeviceType::Light))
        .await
        .unwrap();
    assert_eq!(lights.len(), 1);
    assert_eq!(lights[0].device_id, "lamp0000000001");
}

#[tokio::test]
async fn test_last_discovery_overwrites_route() {
    let tuya = Arc::new(MockAdapter::new(Protocol::Tuya).with_device("shared", DeviceType::Switch));
    let zigbee =
        Arc::new(MockAdapter::new(Protocol::Zigbee).with_device("shared", DeviceType::Switch));
    let manager = manager_with(&[tuya.clone(), zigbee.clone()]);
    manager.initialize().await.unwrap();

    manager.discover_devices(Some(Protocol::Tuya), None).await.unwrap();
    assert_eq!(manager.device_entry("shared").unwrap().protocol, Protocol::Tuya);

    manager.discover_devices(Some(Protocol::Zigbee), None).await.unwrap();
    assert_eq!(manager.device_entry("shared").unwrap().protocol, Protocol::Zigbee);

    manager
        .send_command("shared", &DeviceCommand::new("turn_on"))
        .await
        .unwrap();
    assert_eq!(tuya.calls.send_command.load(Ordering::SeqCst), 0);
    assert_eq!(zigbee.calls.send_command.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_routed_calls_update_stats_and_last_seen() {
    let tuya = Arc::new(MockAdapter::new(Protocol::Tuya).with_device("dev1", DeviceType::Light));
    let manager = manager_with(&[tuya.clone()]);
    manager.initialize().await.unwrap();
    manager.discover_devices(None, None).await.unwrap();
    let before = manager.device_entry("dev1").unwrap().last_seen;

    tuya.script("dev1", vec![MockResponse::ok(), MockResponse::fail("busy")]);
    let cmd = DeviceCommand::new("turn_on");
    assert!(manager.send_command("dev1", &cmd).await.is_ok());
    assert!(manager.send_command("dev1", &cmd).await.is_err());
    manager.get_device_status("dev1").await.unwrap();

    let stats = manager.stats();
    assert_eq!(stats.commands.total_commands, 2);
    assert_eq!(stats.commands.failed_commands, 1);
    assert_eq!(stats.status_queries.total_commands, 1);
    assert_eq!(stats.adapters[&Protocol::Tuya].commands.total_commands, 2);
    assert!(manager.device_entry("dev1").unwrap().last_seen >= before);
}

#[tokio::test]
async fn test_device_update_round_trip_is_identical() {
    let tuya = Arc::new(MockAdapter::new(Protocol::Tuya).with_device("dev1", DeviceType::Light));
    let manager = manager_with(&[tuya.clone()]);
    manager.initialize().await.unwrap();
    let mut rx = manager.event_bus().filter().device_events();

    let mut state = Map::new();
    state.insert("switch_led".into(), json!(true));
    state.insert("bright_value".into(), json!(420));
    let emitted = DeviceStatusUpdate::new("dev1", DeviceStatus::Online, state, UpdateSource::Poll);
    tuya.emit_update(emitted.clone());

    let (event, meta) = timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        HubEvent::DeviceUpdate { update } => assert_eq!(update, emitted),
        other => panic!("unexpected event: {other}"),
    }
    assert_eq!(meta.source, "adapter:tuya");
}

#[tokio::test(start_paused = true)]
async fn test_hanging_diagnostics_fail_health_check() {
    let tuya = Arc::new(MockAdapter::new(Protocol::Tuya));
    let manager = manager_with(&[tuya.clone()]);
    // The startup Connected notification may still be in flight.
    let mut rx = manager.event_bus().filter().custom(|e| {
        e.is_adapter_event() && !matches!(e, HubEvent::AdapterConnected { .. })
    });
    manager.initialize().await.unwrap();

    tuya.set_diagnostics(MockDiagnostics::Hang);
    let reports = manager.health_check_once().await;
    assert_eq!(reports.len(), 1);
    assert!(!reports[0].healthy);
    assert_eq!(
        reports[0].error.as_deref(),
        Some("Operation timeout after 10000ms")
    );
    assert!(!tuya.is_connected());

    let (failed, _) = rx.recv().await.unwrap();
    assert_eq!(failed.type_name(), "adapterHealthCheckFailed");
    let (disconnected, _) = rx.recv().await.unwrap();
    assert_eq!(disconnected.type_name(), "adapterDisconnected");

    tuya.set_diagnostics(MockDiagnostics::Healthy);
    let reports = manager.health_check_once().await;
    assert!(reports[0].healthy);
    let (recovered, _) = rx.recv().await.unwrap();
    assert_eq!(recovered.type_name(), "adapterRecovered");
    assert!(manager.stats().unhealthy_adapters.is_empty());
}

#[tokio::test]
async fn test_failed_health_check_on_disconnected_adapter_keeps_state() {
    let tuya = Arc::new(MockAdapter::new(Protocol::Tuya));
    let manager = manager_with(&[tuya.clone()]);
    manager.initialize().await.unwrap();
    tuya.mark_disconnected("link down");
    let errors_before = tuya.connection_status().error_count;

    tuya.set_diagnostics(MockDiagnostics::Fail("boom".into()));
    let reports = manager.health_check_once().await;

    assert!(!reports[0].healthy);
    assert_eq!(tuya.connection_status().error_count, errors_before);
    assert_eq!(manager.stats().unhealthy_adapters, vec![Protocol::Tuya]);
}

#[tokio::test]
async fn test_initialization_failure_skips_only_that_adapter() {
    let tuya = Arc::new(MockAdapter::new(Protocol::Tuya));
    let zigbee = Arc::new(MockAdapter::new(Protocol::Zigbee));
    zigbee.fail_initialize(Some("coordinator not found"));
    let manager = manager_with(&[tuya, zigbee]);
    let mut rx = manager
        .event_bus()
        .filter()
        .custom(|e| matches!(e, HubEvent::AdapterError { .. }));

    assert_eq!(manager.initialize().await.unwrap(), 1);
    assert!(manager.adapter(Protocol::Tuya).is_some());
    assert!(manager.adapter(Protocol::Zigbee).is_none());

    let (event, _) = timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.protocol(), Some(Protocol::Zigbee));
}

#[tokio::test]
async fn test_shutdown_disconnects_every_adapter() {
    let tuya = Arc::new(MockAdapter::new(Protocol::Tuya).with_device("dev1", DeviceType::Light));
    let zigbee = Arc::new(MockAdapter::new(Protocol::Zigbee));
    tuya.fail_disconnect(Some("socket already closed"));
    let manager = manager_with(&[tuya.clone(), zigbee.clone()]);
    manager.initialize().await.unwrap();
    manager.discover_devices(None, None).await.unwrap();

    let failures = manager.shutdown().await;

    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, Protocol::Tuya);
    assert_eq!(tuya.calls.disconnect.load(Ordering::SeqCst), 1);
    assert_eq!(zigbee.calls.disconnect.load(Ordering::SeqCst), 1);
    assert_eq!(manager.stats().routed_devices, 0);
    assert!(matches!(
        manager.get_device_status("dev1").await,
        Err(AdapterError::NotMapped(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_slow_command_times_out() {
    let mut config = AdapterConfig::new(Protocol::Tuya);
    config.connection_timeout_ms = 100;
    config.command_timeout_ms = 10_000;
    let tuya = Arc::new(
        MockAdapter::with_config(Arc::new(config.clone()))
            .with_device("dev1", DeviceType::Light),
    );
    let mut registry = AdapterRegistry::new();
    let handle = tuya.clone();
    registry.register(Protocol::Tuya, move |_| Ok(handle.clone() as Arc<dyn DeviceAdapter>));
    let manager = Arc::new(AdapterManager::new(vec![config], quiet_config(), registry));
    manager.initialize().await.unwrap();
    manager.discover_devices(None, None).await.unwrap();

    // The adapter's command timeout (10s) fires before the manager's 10.1s deadline.
    tuya.script("dev1", vec![MockResponse::ok_after(Duration::from_secs(60))]);
    let err = manager
        .send_command("dev1", &DeviceCommand::new("turn_on"))
        .await
        .unwrap_err();

    assert!(matches!(err, AdapterError::Timeout(_)));
    assert_eq!(manager.stats().commands.failed_commands, 1);
}
