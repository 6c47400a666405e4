//! Tuya cloud adapter.
//!
//! Talks to the Tuya OpenAPI over signed HTTPS and keeps a local snapshot of
//! the account's device list. A background loop re-fetches the list on an
//! interval (30 s by default), diffs every device against the snapshot and
//! emits a status update for each one that changed.
//!
//! ## Configuration
//!
//! ```toml
//! [[adapters]]
//! protocol = "tuya"
//! auth = { client_id = "...", client_secret = "${TUYA_SECRET}", uid = "ay1234" }
//! options = { base_url = "https://openapi.tuyaeu.com", poll_interval_secs = 30 }
//! ```

pub mod client;
pub mod snapshot;

pub use client::{TOKEN_REFRESH_BUFFER_SECS, TokenState, TuyaClient, sign, string_to_sign};
pub use snapshot::{StatusEntry, TuyaDevice, has_device_status_changed};

use crate::adapter::{
    AdapterConfig, AdapterCore, AdapterDiagnostics, AdapterError, AdapterResult, DeviceAdapter,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use client::CallKind;
use devhub_core::{
    CommandResult, DeviceCommand, DeviceDiscovery, DeviceInfo, DeviceStatusUpdate, DeviceType,
    DiscoveryFilters, UpdateSource,
};
use parking_lot::{Mutex, RwLock};
use reqwest::Method;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

pub const DEFAULT_BASE_URL: &str = "https://openapi.tuyaus.com";
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
const MIN_DEVICE_ID_LEN: usize = 10;

struct TuyaInner {
    name: String,
    core: AdapterCore,
    client: TuyaClient,
    poll_interval: Duration,
    /// Last polled record per device. Written only by `poll_once`.
    snapshot: RwLock<HashMap<String, TuyaDevice>>,
    poll_lock: tokio::sync::Mutex<()>,
    last_poll_at: RwLock<Option<DateTime<Utc>>>,
    last_poll_error: RwLock<Option<String>>,
}

impl TuyaInner {
    /// Authenticated API call; an authentication failure drops the connection.
    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        kind: CallKind,
    ) -> AdapterResult<Value> {
        match self.client.request(method, path, body, kind).await {
            Err(AdapterError::Authentication(msg)) => {
                self.core
                    .set_disconnected(Some(format!("Authentication failed: {}", msg)));
                Err(AdapterError::Authentication(msg))
            }
            other => other,
        }
    }

    async fn fetch_devices(&self) -> AdapterResult<Vec<TuyaDevice>> {
        let uid = match self.client.uid().await {
            Ok(uid) => uid,
            Err(AdapterError::Authentication(msg)) => {
                self.core
                    .set_disconnected(Some(format!("Authentication failed: {}", msg)));
                return Err(AdapterError::Authentication(msg));
            }
            Err(e) => return Err(e),
        };
        let path = format!("/v1.0/users/{}/devices", uid);
        let result = self.call(Method::GET, &path, None, CallKind::Read).await?;
        serde_json::from_value(result)
            .map_err(|e| AdapterError::Communication(format!("malformed device list: {}", e)))
    }

    async fn fetch_device(&self, device_id: &str) -> AdapterResult<TuyaDevice> {
        let path = format!("/v1.0/devices/{}", device_id);
        let result = self.call(Method::GET, &path, None, CallKind::Read).await?;
        if result.is_null() {
            return Err(AdapterError::DeviceNotFound(device_id.to_string()));
        }
        serde_json::from_value(result)
            .map_err(|e| AdapterError::Communication(format!("malformed device record: {}", e)))
    }

    /// Fetch the device list, diff it against the snapshot and replace the
    /// snapshot. Returns the updates for changed devices; they are published
    /// only when `emit` is set.
    ///
    /// A device absent from the previous snapshot counts as changed.
    async fn poll_once(&self, emit: bool) -> AdapterResult<Vec<DeviceStatusUpdate>> {
        let _tick = self.poll_lock.lock().await;

        let devices = match self.fetch_devices().await {
            Ok(devices) => devices,
            Err(e) => {
                *self.last_poll_error.write() = Some(e.to_string());
                if !matches!(e, AdapterError::Authentication(_)) {
                    self.core.record_error(format!("poll failed: {}", e));
                }
                return Err(e);
            }
        };

        *self.last_poll_at.write() = Some(Utc::now());
        *self.last_poll_error.write() = None;
        if self.core.is_initialized() {
            self.core.set_connected();
        }

        let changed: Vec<DeviceStatusUpdate> = {
            let mut snapshot = self.snapshot.write();
            let mut changed = Vec::new();
            let mut next = HashMap::with_capacity(devices.len());
            for device in devices {
                let is_changed = snapshot
                    .get(&device.id)
                    .map(|prev| has_device_status_changed(prev, &device))
                    .unwrap_or(true);
                if is_changed {
                    changed.push(device.status_update(UpdateSource::Poll));
                }
                next.insert(device.id.clone(), device);
            }
            *snapshot = next;
            changed
        };

        debug!(
            protocol = "tuya",
            devices = self.snapshot.read().len(),
            changed = changed.len(),
            "poll complete"
        );

        if emit {
            for update in &changed {
                self.core.publish_update(update.clone());
            }
        }
        Ok(changed)
    }

    async fn poll_loop(self: Arc<Self>) {
        let mut ticker =
            tokio::time::interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.poll_once(true).await {
                warn!(protocol = "tuya", error = %e, "polling tick failed");
            }
        }
    }
}

/// Cloud-polled Tuya adapter.
pub struct TuyaAdapter {
    inner: Arc<TuyaInner>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl TuyaAdapter {
    pub fn new(config: Arc<AdapterConfig>) -> AdapterResult<Self> {
        let base_url = config
            .options
            .get("base_url")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_BASE_URL)
            .to_string();
        let poll_secs = config
            .options
            .get("poll_interval_secs")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_POLL_INTERVAL_SECS);
        if poll_secs == 0 {
            return Err(AdapterError::Configuration(
                "options.poll_interval_secs must be greater than zero".to_string(),
            ));
        }
        let name = config
            .options
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("Tuya Cloud")
            .to_string();

        let client = TuyaClient::new(&config, base_url)?;
        Ok(Self {
            inner: Arc::new(TuyaInner {
                name,
                core: AdapterCore::new(config),
                client,
                poll_interval: Duration::from_secs(poll_secs),
                snapshot: RwLock::new(HashMap::new()),
                poll_lock: tokio::sync::Mutex::new(()),
                last_poll_at: RwLock::new(None),
                last_poll_error: RwLock::new(None),
            }),
            poll_task: Mutex::new(None),
        })
    }

    pub fn poll_interval(&self) -> Duration {
        self.inner.poll_interval
    }

    /// Run one polling tick immediately and return the updates it emitted.
    pub async fn poll_now(&self) -> AdapterResult<Vec<DeviceStatusUpdate>> {
        self.inner.poll_once(true).await
    }

    pub fn snapshot_len(&self) -> usize {
        self.inner.snapshot.read().len()
    }

    /// Last polled record for a device.
    pub fn snapshot_device(&self, device_id: &str) -> Option<TuyaDevice> {
        self.inner.snapshot.read().get(device_id).cloned()
    }

    fn check_device_id(&self, device_id: &str) -> AdapterResult<()> {
        if self.validate_device_id(device_id) {
            Ok(())
        } else {
            Err(AdapterError::Validation(format!(
                "Invalid tuya device id: {}",
                device_id
            )))
        }
    }

    fn start_polling(&self) {
        let mut task = self.poll_task.lock();
        if let Some(old) = task.take() {
            old.abort();
        }
        *task = Some(tokio::spawn(self.inner.clone().poll_loop()));
    }
}

#[async_trait]
impl DeviceAdapter for TuyaAdapter {
    fn core(&self) -> &AdapterCore {
        &self.inner.core
    }

    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn initialize(&self) -> AdapterResult<()> {
        let core = &self.inner.core;
        let config = core.config().clone();
        let attempts = config.retry_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            core.record_connection_attempt();
            // Load the snapshot without announcing every device as new.
            match self.inner.poll_once(false).await {
                Ok(_) => {
                    last_error = None;
                    break;
                }
                Err(e) => {
                    warn!(protocol = "tuya", attempt, error = %e, "connection attempt failed");
                    core.set_disconnected(Some(e.to_string()));
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(config.retry_delay()).await;
                    }
                }
            }
        }

        if let Some(e) = last_error {
            return Err(e);
        }

        core.set_initialized(true);
        core.set_connected();
        self.start_polling();
        info!(
            protocol = "tuya",
            devices = self.snapshot_len(),
            poll_interval_secs = self.inner.poll_interval.as_secs(),
            "Tuya adapter initialized"
        );
        Ok(())
    }

    async fn disconnect(&self) -> AdapterResult<()> {
        if let Some(task) = self.poll_task.lock().take() {
            task.abort();
        }
        let core = &self.inner.core;
        core.set_initialized(false);
        core.set_disconnected(None);
        info!(protocol = "tuya", "Tuya adapter disconnected");
        Ok(())
    }

    async fn discover_devices(
        &self,
        filters: Option<&DiscoveryFilters>,
    ) -> AdapterResult<Vec<DeviceDiscovery>> {
        let devices = self.inner.fetch_devices().await?;
        Ok(devices
            .iter()
            .map(|d| (d.online, d.to_discovery()))
            .filter(|(online, d)| filters.is_none_or(|f| f.matches(d, *online)))
            .map(|(_, d)| d)
            .collect())
    }

    async fn get_device_info(&self, device_id: &str) -> AdapterResult<DeviceInfo> {
        self.check_device_id(device_id)?;
        Ok(self.inner.fetch_device(device_id).await?.to_info())
    }

    async fn send_command(
        &self,
        device_id: &str,
        command: &DeviceCommand,
    ) -> AdapterResult<CommandResult> {
        self.validate_command(device_id, command).await?;

        let known = self.snapshot_device(device_id);
        let commands = snapshot::translate_command(command, known.as_ref())?;
        let body = json!({ "commands": commands });
        let path = format!("/v1.0/devices/{}/commands", device_id);

        debug!(protocol = "tuya", device_id = %device_id, command = %command.command, "sending command");
        let (response, elapsed_ms) = self
            .inner
            .core
            .track_command(self.inner.call(Method::POST, &path, Some(&body), CallKind::Command))
            .await?;

        Ok(CommandResult::success(
            Some(json!({
                "commands": commands,
                "response": response,
                "state": snapshot::state_from_commands(&commands),
            })),
            elapsed_ms,
        ))
    }

    async fn get_device_status(&self, device_id: &str) -> AdapterResult<DeviceStatusUpdate> {
        self.check_device_id(device_id)?;
        Ok(self
            .inner
            .fetch_device(device_id)
            .await?
            .status_update(UpdateSource::Query))
    }

    async fn test_device_connection(&self, device_id: &str) -> AdapterResult<bool> {
        self.check_device_id(device_id)?;
        Ok(self.inner.fetch_device(device_id).await?.online)
    }

    async fn get_diagnostics(&self) -> AdapterResult<AdapterDiagnostics> {
        let inner = &self.inner;
        let token_expires_at = inner.client.token_expires_at().await;
        let details = json!({
            "base_url": inner.client.base_url(),
            "token_expires_at": token_expires_at,
            "last_poll_at": *inner.last_poll_at.read(),
            "last_poll_error": inner.last_poll_error.read().clone(),
            "poll_interval_secs": inner.poll_interval.as_secs(),
            "snapshot_size": inner.snapshot.read().len(),
        });
        let healthy = inner.core.is_connected() && inner.last_poll_error.read().is_none();
        Ok(inner.core.diagnostics(&inner.name, healthy, details))
    }

    fn supports_device_type(&self, device_type: DeviceType) -> bool {
        !matches!(device_type, DeviceType::Unknown)
    }

    fn supports_capability(&self, capability: &str) -> bool {
        snapshot::SUPPORTED_CAPABILITIES.contains(&capability)
    }

    fn validate_device_id(&self, device_id: &str) -> bool {
        device_id.len() >= MIN_DEVICE_ID_LEN && device_id.chars().all(|c| c.is_ascii_alphanumeric())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl Drop for TuyaAdapter {
    fn drop(&mut self) {
        if let Some(task) = self.poll_task.lock().take() {
            task.abort();
        }
    }
}

/// Factory used by the adapter registry.
pub fn create_tuya_adapter(config: Arc<AdapterConfig>) -> AdapterResult<Arc<dyn DeviceAdapter>> {
    Ok(Arc::new(TuyaAdapter::new(config)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use devhub_core::Protocol;

    fn config() -> Arc<AdapterConfig> {
        Arc::new(
            AdapterConfig::new(Protocol::Tuya)
                .with_auth("client_id", "cid")
                .with_auth("client_secret", "secret"),
        )
    }

    #[test]
    fn test_requires_credentials() {
        let bare = Arc::new(AdapterConfig::new(Protocol::Tuya));
        assert!(matches!(
            TuyaAdapter::new(bare),
            Err(AdapterError::Configuration(_))
        ));
    }

    #[test]
    fn test_default_poll_interval() {
        let adapter = TuyaAdapter::new(config()).unwrap();
        assert_eq!(adapter.poll_interval(), Duration::from_secs(30));
        assert_eq!(adapter.name(), "Tuya Cloud");
        assert!(!adapter.is_connected());
    }

    #[test]
    fn test_device_id_validation() {
        let adapter = TuyaAdapter::new(config()).unwrap();
        assert!(adapter.validate_device_id("bf0123456789abcd"));
        assert!(!adapter.validate_device_id("short"));
        assert!(!adapter.validate_device_id("bf01234567-89"));
    }

    #[tokio::test]
    async fn test_invalid_id_fails_before_network() {
        // Unroutable base URL: reaching the network would surface a Connection error.
        let cfg = AdapterConfig::new(Protocol::Tuya)
            .with_auth("client_id", "cid")
            .with_auth("client_secret", "secret")
            .with_option("base_url", "http://127.0.0.1:1");
        let adapter = TuyaAdapter::new(Arc::new(cfg)).unwrap();

        let err = adapter
            .send_command("bad-id", &DeviceCommand::new("turn_on"))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Validation(_)));

        let err = adapter.get_device_status("x").await.unwrap_err();
        assert!(matches!(err, AdapterError::Validation(_)));
        assert_eq!(adapter.stats().commands.total_commands, 0);
    }
}
