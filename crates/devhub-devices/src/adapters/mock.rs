//! Scriptable in-memory adapter for tests.

use crate::adapter::{
    AdapterConfig, AdapterCore, AdapterDiagnostics, AdapterError, AdapterResult, DeviceAdapter,
};
use async_trait::async_trait;
use devhub_core::{
    CommandResult, DeviceCommand, DeviceDiscovery, DeviceInfo, DeviceStatus, DeviceStatusUpdate,
    DeviceType, DiscoveryFilters, Protocol, UpdateSource,
};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Scripted outcome of one `send_command` call.
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// Succeed after `latency`; without a `result` the command parameters are
    /// echoed back as the state fragment.
    Success {
        latency: Duration,
        result: Option<Value>,
    },
    /// Fail with a rejected-command error carrying this message.
    Failure(String),
}

impl MockResponse {
    pub fn ok() -> Self {
        Self::Success {
            latency: Duration::ZERO,
            result: None,
        }
    }

    pub fn ok_after(latency: Duration) -> Self {
        Self::Success {
            latency,
            result: None,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self::Failure(message.into())
    }
}

/// Scripted behaviour of `get_diagnostics`.
#[derive(Debug, Clone)]
pub enum MockDiagnostics {
    Healthy,
    Fail(String),
    /// Never returns.
    Hang,
}

struct MockDevice {
    discovery: DeviceDiscovery,
    online: bool,
    state: Map<String, Value>,
}

/// Call counters.
#[derive(Debug, Default)]
pub struct MockCalls {
    pub initialize: AtomicUsize,
    pub disconnect: AtomicUsize,
    pub discover: AtomicUsize,
    pub send_command: AtomicUsize,
    pub get_device_status: AtomicUsize,
    pub diagnostics: AtomicUsize,
}

impl MockCalls {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// Mock adapter for testing.
pub struct MockAdapter {
    name: String,
    core: AdapterCore,
    devices: RwLock<Vec<MockDevice>>,
    scripts: Mutex<HashMap<String, VecDeque<MockResponse>>>,
    fail_initialize: Mutex<Option<String>>,
    fail_disconnect: Mutex<Option<String>>,
    status_failure: Mutex<Option<String>>,
    diagnostics: Mutex<MockDiagnostics>,
    command_log: Mutex<Vec<(String, DeviceCommand)>>,
    pub calls: MockCalls,
}

impl MockAdapter {
    /// Create a mock adapter for a protocol with default configuration.
    pub fn new(protocol: Protocol) -> Self {
        Self::with_config(Arc::new(AdapterConfig::new(protocol)))
    }

    pub fn with_config(config: Arc<AdapterConfig>) -> Self {
        Self {
            name: format!("mock-{}", config.protocol),
            core: AdapterCore::new(config),
            devices: RwLock::new(Vec::new()),
            scripts: Mutex::new(HashMap::new()),
            fail_initialize: Mutex::new(None),
            fail_disconnect: Mutex::new(None),
            status_failure: Mutex::new(None),
            diagnostics: Mutex::new(MockDiagnostics::Healthy),
            command_log: Mutex::new(Vec::new()),
            calls: MockCalls::default(),
        }
    }

    /// Add an online device to the mock adapter.
    pub fn with_device(self, device_id: impl Into<String>, device_type: DeviceType) -> Self {
        self.add_device(device_id, device_type, true);
        self
    }

    pub fn add_device(&self, device_id: impl Into<String>, device_type: DeviceType, online: bool) {
        let device_id = device_id.into();
        let discovery = DeviceDiscovery::new(
            self.core.protocol(),
            device_id.clone(),
            device_type,
            format!("Mock {}", device_id),
        )
        .with_capabilities(vec!["on_off".to_string()]);
        let mut devices = self.devices.write();
        devices.retain(|d| d.discovery.device_id != device_id);
        devices.push(MockDevice {
            discovery,
            online,
            state: Map::new(),
        });
    }

    /// Queue responses for a device; the last one repeats once the queue drains.
    pub fn script(&self, device_id: &str, responses: Vec<MockResponse>) {
        self.scripts
            .lock()
            .insert(device_id.to_string(), responses.into());
    }

    pub fn fail_initialize(&self, message: Option<&str>) {
        *self.fail_initialize.lock() = message.map(str::to_string);
    }

    pub fn fail_disconnect(&self, message: Option<&str>) {
        *self.fail_disconnect.lock() = message.map(str::to_string);
    }

    pub fn fail_status(&self, message: Option<&str>) {
        *self.status_failure.lock() = message.map(str::to_string);
    }

    pub fn set_diagnostics(&self, behaviour: MockDiagnostics) {
        *self.diagnostics.lock() = behaviour;
    }

    pub fn set_device_state(&self, device_id: &str, online: bool, state: Map<String, Value>) {
        if let Some(d) = self
            .devices
            .write()
            .iter_mut()
            .find(|d| d.discovery.device_id == device_id)
        {
            d.online = online;
            d.state = state;
        }
    }

    /// Publish a device update as if a poll had detected it.
    pub fn emit_update(&self, update: DeviceStatusUpdate) {
        self.core.publish_update(update);
    }

    pub fn commands_sent(&self) -> Vec<(String, DeviceCommand)> {
        self.command_log.lock().clone()
    }

    fn next_response(&self, device_id: &str) -> MockResponse {
        let mut scripts = self.scripts.lock();
        match scripts.get_mut(device_id) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_else(MockResponse::ok),
            Some(queue) => queue.front().cloned().unwrap_or_else(MockResponse::ok),
            None => MockResponse::ok(),
        }
    }

    fn find<T>(&self, device_id: &str, f: impl FnOnce(&MockDevice) -> T) -> AdapterResult<T> {
        self.devices
            .read()
            .iter()
            .find(|d| d.discovery.device_id == device_id)
            .map(f)
            .ok_or_else(|| AdapterError::DeviceNotFound(device_id.to_string()))
    }
}

#[async_trait]
impl DeviceAdapter for MockAdapter {
    fn core(&self) -> &AdapterCore {
        &self.core
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self) -> AdapterResult<()> {
        self.calls.initialize.fetch_add(1, Ordering::SeqCst);
        self.core.record_connection_attempt();
        if let Some(msg) = self.fail_initialize.lock().clone() {
            self.core.set_disconnected(Some(msg.clone()));
            return Err(AdapterError::Connection(msg));
        }
        self.core.set_initialized(true);
        self.core.set_connected();
        Ok(())
    }

    async fn disconnect(&self) -> AdapterResult<()> {
        self.calls.disconnect.fetch_add(1, Ordering::SeqCst);
        self.core.set_initialized(false);
        self.core.set_disconnected(None);
        match self.fail_disconnect.lock().clone() {
            Some(msg) => Err(AdapterError::Connection(msg)),
            None => Ok(()),
        }
    }

    async fn discover_devices(
        &self,
        filters: Option<&DiscoveryFilters>,
    ) -> AdapterResult<Vec<DeviceDiscovery>> {
        self.calls.discover.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .devices
            .read()
            .iter()
            .filter(|d| filters.is_none_or(|f| f.matches(&d.discovery, d.online)))
            .map(|d| d.discovery.clone())
            .collect())
    }

    async fn get_device_info(&self, device_id: &str) -> AdapterResult<DeviceInfo> {
        let protocol = self.core.protocol();
        self.find(device_id, |d| DeviceInfo {
            protocol,
            device_id: d.discovery.device_id.clone(),
            device_type: d.discovery.device_type,
            name: d.discovery.name.clone(),
            model: Some("mock".to_string()),
            manufacturer: None,
            capabilities: d.discovery.capabilities.clone(),
            network: None,
            online: d.online,
            metadata: Value::Null,
        })
    }

    async fn send_command(
        &self,
        device_id: &str,
        command: &DeviceCommand,
    ) -> AdapterResult<CommandResult> {
        self.calls.send_command.fetch_add(1, Ordering::SeqCst);
        self.validate_command(device_id, command).await?;
        self.command_log
            .lock()
            .push((device_id.to_string(), command.clone()));

        let response = self.next_response(device_id);
        let (result, elapsed_ms) = self
            .core
            .track_command(async {
                match response {
                    MockResponse::Success { latency, result } => {
                        if !latency.is_zero() {
                            tokio::time::sleep(latency).await;
                        }
                        Ok(result.unwrap_or_else(|| json!({ "state": command.parameters })))
                    }
                    MockResponse::Failure(msg) => Err(AdapterError::CommandRejected(msg)),
                }
            })
            .await?;
        Ok(CommandResult::success(Some(result), elapsed_ms))
    }

    async fn get_device_status(&self, device_id: &str) -> AdapterResult<DeviceStatusUpdate> {
        self.calls.get_device_status.fetch_add(1, Ordering::SeqCst);
        if let Some(msg) = self.status_failure.lock().clone() {
            return Err(AdapterError::Communication(msg));
        }
        self.find(device_id, |d| {
            let status = if d.online {
                DeviceStatus::Online
            } else {
                DeviceStatus::Offline
            };
            DeviceStatusUpdate::new(device_id, status, d.state.clone(), UpdateSource::Query)
        })
    }

    async fn test_device_connection(&self, device_id: &str) -> AdapterResult<bool> {
        self.find(device_id, |d| d.online)
    }

    async fn get_diagnostics(&self) -> AdapterResult<AdapterDiagnostics> {
        self.calls.diagnostics.fetch_add(1, Ordering::SeqCst);
        let behaviour = self.diagnostics.lock().clone();
        match behaviour {
            MockDiagnostics::Healthy => Ok(self.core.diagnostics(
                &self.name,
                self.core.is_connected(),
                json!({ "devices": self.devices.read().len() }),
            )),
            MockDiagnostics::Fail(msg) => Err(AdapterError::Communication(msg)),
            MockDiagnostics::Hang => {
                std::future::pending::<()>().await;
                Err(AdapterError::Timeout(0))
            }
        }
    }

    fn supports_device_type(&self, _device_type: DeviceType) -> bool {
        true
    }

    fn supports_capability(&self, capability: &str) -> bool {
        capability == "on_off"
    }

    fn validate_device_id(&self, device_id: &str) -> bool {
        !device_id.is_empty()
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_script_repeats_last_response() {
        let adapter = MockAdapter::new(Protocol::Tuya).with_device("dev1", DeviceType::Light);
        adapter.initialize().await.unwrap();
        adapter.script(
            "dev1",
            vec![MockResponse::fail("busy"), MockResponse::ok()],
        );
        let cmd = DeviceCommand::new("turn_on");

        assert!(adapter.send_command("dev1", &cmd).await.is_err());
        assert!(adapter.send_command("dev1", &cmd).await.is_ok());
        assert!(adapter.send_command("dev1", &cmd).await.is_ok());

        let stats = adapter.stats();
        assert_eq!(stats.commands.total_commands, 3);
        assert_eq!(stats.commands.failed_commands, 1);
    }

    #[tokio::test]
    async fn test_echoes_parameters_as_state() {
        let adapter = MockAdapter::new(Protocol::Tuya).with_device("dev1", DeviceType::Light);
        let cmd = DeviceCommand::new("set").with_param("bright_value", 40);

        let result = adapter.send_command("dev1", &cmd).await.unwrap();
        assert_eq!(
            result.state_fragment().and_then(|s| s.get("bright_value")),
            Some(&json!(40))
        );
    }
}
