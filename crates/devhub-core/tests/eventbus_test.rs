//! EventBus behaviour across subscribers.
//!
//! Tests include:
//! - Fan-out to multiple subscribers
//! - Publish order preserved per subscriber
//! - Custom filters and metadata

use devhub_core::{
    DeviceStatus, DeviceStatusUpdate, EventBus, EventMetadata, HubEvent, Protocol, UpdateSource,
};
use std::time::Duration;
use tokio::time::timeout;

fn device_update(id: &str, status: DeviceStatus) -> HubEvent {
    HubEvent::DeviceUpdate {
        update: DeviceStatusUpdate::new(id, status, Default::default(), UpdateSource::Poll),
    }
}

#[tokio::test]
async fn test_event_bus_multiple_subscribers() {
    let bus = EventBus::new();
    let mut rx1 = bus.subscribe();
    let mut rx2 = bus.subscribe();
    assert_eq!(bus.subscriber_count(), 2);

    bus.publish(device_update("sensor1", DeviceStatus::Online));

    assert_eq!(rx1.recv().await.unwrap().0.device_id(), Some("sensor1"));
    assert_eq!(rx2.recv().await.unwrap().0.device_id(), Some("sensor1"));
}

#[tokio::test]
async fn test_event_bus_preserves_publish_order() {
    let bus = EventBus::new();
    let mut rx = bus.subscribe();

    bus.publish(device_update("a", DeviceStatus::Online));
    bus.publish(HubEvent::AdapterConnected {
        protocol: Protocol::Tuya,
        timestamp: 1,
    });
    bus.publish(device_update("b", DeviceStatus::Offline));

    let names: Vec<&str> = vec![
        rx.recv().await.unwrap().0.type_name(),
        rx.recv().await.unwrap().0.type_name(),
        rx.recv().await.unwrap().0.type_name(),
    ];
    assert_eq!(names, vec!["deviceUpdate", "adapterConnected", "deviceUpdate"]);
}

#[tokio::test]
async fn test_event_bus_custom_filter() {
    let bus = EventBus::new();
    let mut rx = bus.filter().custom(|event| {
        matches!(event, HubEvent::AdapterHealthCheckFailed { .. })
    });

    bus.publish(HubEvent::AdapterRecovered {
        protocol: Protocol::Tuya,
        timestamp: 1,
    });
    bus.publish(HubEvent::AdapterHealthCheckFailed {
        protocol: Protocol::Tuya,
        error: "Operation timeout after 10000ms".into(),
        timestamp: 2,
    });

    let (event, _) = timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.type_name(), "adapterHealthCheckFailed");
}

#[tokio::test]
async fn test_event_bus_metadata() {
    let bus = EventBus::with_name("devices");
    let mut rx = bus.subscribe();

    let meta = EventMetadata::new("adapter:tuya").with_correlation_id("cmd-1");
    bus.publish_with_metadata(device_update("x", DeviceStatus::Error), meta);

    let (_, received) = rx.recv().await.unwrap();
    assert_eq!(received.source, "adapter:tuya");
    assert_eq!(received.correlation_id.as_deref(), Some("cmd-1"));
    assert_eq!(bus.name(), "devices");
}
