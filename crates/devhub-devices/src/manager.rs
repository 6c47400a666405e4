//! Adapter manager.
//!
//! Owns one adapter per configured protocol, the device → adapter routing
//! map built from discovery, periodic health checks, and manager-wide
//! statistics. Adapter notifications are re-published on the hub
//! [`EventBus`] as [`HubEvent`]s.
//!
//! Every delegated adapter call runs in its own task and is awaited under
//! the adapter's connection + command timeout. A call that outlives that
//! deadline is detached: the caller gets [`AdapterError::Timeout`] and the
//! task is left to finish in the background with its result discarded.

use crate::adapter::{
    AdapterConfig, AdapterDiagnostics, AdapterError, AdapterEvent, AdapterResult, AdapterStats,
    CommandStats, DeviceAdapter,
};
use crate::adapters::AdapterRegistry;
use chrono::{DateTime, Utc};
use devhub_core::{
    CommandResult, DeviceCommand, DeviceDiscovery, DeviceInfo, DeviceStatusUpdate, DeviceType,
    DiscoveryFilters, EventBus, EventBusReceiver, HubEvent, Protocol,
};
use futures::StreamExt;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval};
use tracing::{debug, error, info, warn};

/// Manager settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerConfig {
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_health_check_timeout_secs")]
    pub health_check_timeout_secs: u64,
}

fn default_health_check_interval_secs() -> u64 {
    60
}

fn default_health_check_timeout_secs() -> u64 {
    10
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: default_health_check_interval_secs(),
            health_check_timeout_secs: default_health_check_timeout_secs(),
        }
    }
}

impl ManagerConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout_secs)
    }
}

/// Routing entry for one device.
#[derive(Clone)]
pub struct DeviceMapEntry {
    pub device_id: String,
    pub protocol: Protocol,
    /// Non-owning; the manager's adapter table holds the strong reference.
    pub adapter: Weak<dyn DeviceAdapter>,
    pub last_seen: DateTime<Utc>,
    /// Mirrors the owning adapter's connection state.
    pub is_active: bool,
}

impl std::fmt::Debug for DeviceMapEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceMapEntry")
            .field("device_id", &self.device_id)
            .field("protocol", &self.protocol)
            .field("last_seen", &self.last_seen)
            .field("is_active", &self.is_active)
            .finish_non_exhaustive()
    }
}

/// Manager-wide statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ManagerStats {
    /// Routed `send_command` calls
    pub commands: CommandStats,
    /// Routed `get_device_status` calls
    pub status_queries: CommandStats,
    pub total_adapters: usize,
    pub connected_adapters: usize,
    pub routed_devices: usize,
    pub active_devices: usize,
    pub unhealthy_adapters: Vec<Protocol>,
    pub adapters: BTreeMap<Protocol, AdapterStats>,
}

/// Outcome of one adapter's health check.
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub protocol: Protocol,
    pub healthy: bool,
    pub error: Option<String>,
}

pub struct AdapterManager {
    registry: AdapterRegistry,
    configs: Vec<Arc<AdapterConfig>>,
    config: ManagerConfig,
    adapters: RwLock<BTreeMap<Protocol, Arc<dyn DeviceAdapter>>>,
    device_map: RwLock<HashMap<String, DeviceMapEntry>>,
    command_stats: RwLock<CommandStats>,
    status_stats: RwLock<CommandStats>,
    unhealthy: Mutex<HashSet<Protocol>>,
    event_bus: EventBus,
    forwarders: Mutex<HashMap<Protocol, JoinHandle<()>>>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl AdapterManager {
    pub fn new(configs: Vec<AdapterConfig>, config: ManagerConfig, registry: AdapterRegistry) -> Self {
        Self::with_event_bus(configs, config, registry, EventBus::with_name("devices"))
    }

    pub fn with_event_bus(
        configs: Vec<AdapterConfig>,
        config: ManagerConfig,
        registry: AdapterRegistry,
        event_bus: EventBus,
    ) -> Self {
        Self {
            registry,
            configs: configs.into_iter().map(Arc::new).collect(),
            config,
            adapters: RwLock::new(BTreeMap::new()),
            device_map: RwLock::new(HashMap::new()),
            command_stats: RwLock::new(CommandStats::default()),
            status_stats: RwLock::new(CommandStats::default()),
            unhealthy: Mutex::new(HashSet::new()),
            event_bus,
            forwarders: Mutex::new(HashMap::new()),
            health_task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Subscribe to hub notifications.
    pub fn subscribe(&self) -> EventBusReceiver {
        self.event_bus.subscribe()
    }

    /// Instantiate and initialize one adapter per enabled configuration, then
    /// start the health-check timer.
    ///
    /// An adapter that fails to initialize is dropped and reported with an
    /// `AdapterError` notification; the others still start. Returns the
    /// number of adapters running.
    pub async fn initialize(self: &Arc<Self>) -> AdapterResult<usize> {
        for config in self.configs.iter().filter(|c| c.enabled) {
            let protocol = config.protocol;
            if self.adapters.read().contains_key(&protocol) {
                warn!(protocol = %protocol, "duplicate adapter configuration ignored");
                continue;
            }

            let adapter = match self.registry.create(config.clone()) {
                Ok(adapter) => adapter,
                Err(e) => {
                    error!(protocol = %protocol, error = %e, "failed to create adapter");
                    self.publish_adapter_error(protocol, e.to_string());
                    continue;
                }
            };

            // Subscribe before initialize so the Connected notification is forwarded.
            let forwarder = self.spawn_forwarder(&adapter);

            match adapter.initialize().await {
                Ok(()) => {
                    info!(protocol = %protocol, adapter = adapter.name(), "adapter initialized");
                    self.forwarders.lock().insert(protocol, forwarder);
                    self.adapters.write().insert(protocol, adapter);
                }
                Err(e) => {
                    forwarder.abort();
                    error!(protocol = %protocol, error = %e, "adapter initialization failed");
                    self.publish_adapter_error(protocol, e.to_string());
                }
            }
        }

        self.start_health_checks();
        let running = self.adapters.read().len();
        info!(adapters = running, "adapter manager initialized");
        Ok(running)
    }

    /// Stop health checks and disconnect every adapter.
    ///
    /// Disconnect is attempted for every adapter; failures are collected and
    /// returned rather than raised.
    pub async fn shutdown(&self) -> Vec<(Protocol, AdapterError)> {
        if let Some(task) = self.health_task.lock().take() {
            task.abort();
        }

        let adapters: Vec<Arc<dyn DeviceAdapter>> = self.adapters.read().values().cloned().collect();
        let mut failures = Vec::new();
        for adapter in adapters {
            let protocol = adapter.protocol();
            let limit = adapter.core().config().connection_timeout();
            let outcome = match tokio::time::timeout(limit, adapter.disconnect()).await {
                Ok(result) => result,
                Err(_) => Err(AdapterError::Timeout(limit.as_millis() as u64)),
            };
            if let Err(e) = outcome {
                warn!(protocol = %protocol, error = %e, "adapter disconnect failed");
                failures.push((protocol, e));
            }
        }

        // Give forwarders a turn to relay the final disconnect notifications.
        tokio::task::yield_now().await;
        for (_, task) in self.forwarders.lock().drain() {
            task.abort();
        }

        self.adapters.write().clear();
        self.device_map.write().clear();
        self.unhealthy.lock().clear();
        info!(failures = failures.len(), "adapter manager shut down");
        failures
    }

    pub fn adapter(&self, protocol: Protocol) -> Option<Arc<dyn DeviceAdapter>> {
        self.adapters.read().get(&protocol).cloned()
    }

    pub fn adapters(&self) -> Vec<Arc<dyn DeviceAdapter>> {
        self.adapters.read().values().cloned().collect()
    }

    pub fn device_entry(&self, device_id: &str) -> Option<DeviceMapEntry> {
        self.device_map.read().get(device_id).cloned()
    }

    pub fn routed_devices(&self) -> Vec<(String, Protocol)> {
        let mut routed: Vec<(String, Protocol)> = self
            .device_map
            .read()
            .values()
            .map(|e| (e.device_id.clone(), e.protocol))
            .collect();
        routed.sort();
        routed
    }

    /// Query every connected adapter and overwrite the routing map with the
    /// results. The last discovery of an id wins.
    pub async fn discover_devices(
        &self,
        protocol_filter: Option<Protocol>,
        device_type_filter: Option<DeviceType>,
    ) -> AdapterResult<Vec<DeviceDiscovery>> {
        let targets: Vec<Arc<dyn DeviceAdapter>> = match protocol_filter {
            Some(p) => {
                let adapter = self.adapter(p).ok_or_else(|| {
                    AdapterError::Configuration(format!("No adapter running for protocol: {}", p))
                })?;
                if !adapter.is_connected() {
                    return Err(AdapterError::AdapterUnavailable(p));
                }
                vec![adapter]
            }
            None => self
                .adapters()
                .into_iter()
                .filter(|a| a.is_connected())
                .collect(),
        };

        let filters = device_type_filter.map(DiscoveryFilters::by_type);
        let scans = targets.iter().map(|adapter| {
            let filters = filters.clone();
            self.run_detached(adapter, "discover_devices", move |a| async move {
                a.discover_devices(filters.as_ref()).await
            })
        });
        let outcomes = join_all(scans).await;

        let mut merged = Vec::new();
        for (adapter, outcome) in targets.iter().zip(outcomes) {
            match outcome {
                Ok(found) => {
                    debug!(protocol = %adapter.protocol(), count = found.len(), "discovery complete");
                    for device in &found {
                        self.register_route(&device.device_id, adapter);
                    }
                    merged.extend(found);
                }
                Err(e) => {
                    warn!(protocol = %adapter.protocol(), error = %e, "discovery failed");
                }
            }
        }

        info!(devices = merged.len(), routed = self.device_map.read().len(), "discovery merged");
        Ok(merged)
    }

    /// Route a device manually.
    pub fn add_device(&self, device_id: &str, protocol: Protocol) -> AdapterResult<()> {
        let adapter = self.adapter(protocol).ok_or_else(|| {
            AdapterError::Configuration(format!("No adapter running for protocol: {}", protocol))
        })?;
        if !adapter.validate_device_id(device_id) {
            return Err(AdapterError::Validation(format!(
                "Invalid {} device id: {}",
                protocol, device_id
            )));
        }
        self.register_route(device_id, &adapter);
        Ok(())
    }

    /// Remove a device from the routing map; returns whether it was routed.
    pub fn remove_device(&self, device_id: &str) -> bool {
        self.device_map.write().remove(device_id).is_some()
    }

    pub async fn send_command(
        &self,
        device_id: &str,
        command: &DeviceCommand,
    ) -> AdapterResult<CommandResult> {
        let adapter = self.route(device_id)?;
        let started = Instant::now();
        let (id, cmd) = (device_id.to_string(), command.clone());
        let result = self
            .run_detached(&adapter, "send_command", move |a| async move {
                a.send_command(&id, &cmd).await
            })
            .await;

        self.touch(device_id);
        record(&self.command_stats, result.is_ok(), started);
        result
    }

    pub async fn get_device_status(&self, device_id: &str) -> AdapterResult<DeviceStatusUpdate> {
        let adapter = self.route(device_id)?;
        let started = Instant::now();
        let id = device_id.to_string();
        let result = self
            .run_detached(&adapter, "get_device_status", move |a| async move {
                a.get_device_status(&id).await
            })
            .await;

        self.touch(device_id);
        record(&self.status_stats, result.is_ok(), started);
        result
    }

    pub async fn get_device_info(&self, device_id: &str) -> AdapterResult<DeviceInfo> {
        let adapter = self.route(device_id)?;
        let id = device_id.to_string();
        self.run_detached(&adapter, "get_device_info", move |a| async move {
            a.get_device_info(&id).await
        })
        .await
    }

    pub async fn test_device_connection(&self, device_id: &str) -> AdapterResult<bool> {
        let adapter = self.route(device_id)?;
        let id = device_id.to_string();
        self.run_detached(&adapter, "test_device_connection", move |a| async move {
            a.test_device_connection(&id).await
        })
        .await
    }

    /// Diagnostics of every adapter; one that fails or times out is reported
    /// unhealthy with the error in `details`.
    pub async fn adapter_diagnostics(&self) -> Vec<AdapterDiagnostics> {
        let limit = self.config.health_check_timeout();
        let adapters = self.adapters();
        let checks = adapters.iter().map(|adapter| async move {
            match diagnostics_within(adapter.as_ref(), limit).await {
                Ok(diagnostics) => diagnostics,
                Err(msg) => {
                    adapter
                        .core()
                        .diagnostics(adapter.name(), false, json!({ "error": msg }))
                }
            }
        });
        join_all(checks).await
    }

    /// Run one health-check round across all adapters.
    pub async fn health_check_once(&self) -> Vec<HealthReport> {
        let limit = self.config.health_check_timeout();
        let adapters = self.adapters();
        let checks = adapters.iter().map(|adapter| async move {
            let protocol = adapter.protocol();
            let report = match diagnostics_within(adapter.as_ref(), limit).await {
                Ok(_) => {
                    if self.unhealthy.lock().remove(&protocol) {
                        info!(protocol = %protocol, "adapter recovered");
                        self.event_bus.publish_with_source(
                            HubEvent::AdapterRecovered {
                                protocol,
                                timestamp: Utc::now().timestamp(),
                            },
                            "manager",
                        );
                    }
                    HealthReport {
                        protocol,
                        healthy: true,
                        error: None,
                    }
                }
                Err(msg) => {
                    warn!(protocol = %protocol, error = %msg, "adapter health check failed");
                    self.unhealthy.lock().insert(protocol);
                    self.event_bus.publish_with_source(
                        HubEvent::AdapterHealthCheckFailed {
                            protocol,
                            error: msg.clone(),
                            timestamp: Utc::now().timestamp(),
                        },
                        "manager",
                    );
                    if adapter.is_connected() {
                        adapter.mark_disconnected(&format!("Health check failed: {}", msg));
                    }
                    HealthReport {
                        protocol,
                        healthy: false,
                        error: Some(msg),
                    }
                }
            };
            // Route flags follow lifecycle events, which a lagging stream can drop.
            self.set_protocol_active(protocol, adapter.is_connected());
            report
        });
        join_all(checks).await
    }

    pub fn stats(&self) -> ManagerStats {
        let adapters = self.adapters.read();
        let map = self.device_map.read();
        let mut unhealthy: Vec<Protocol> = self.unhealthy.lock().iter().copied().collect();
        unhealthy.sort();
        ManagerStats {
            commands: self.command_stats.read().clone(),
            status_queries: self.status_stats.read().clone(),
            total_adapters: adapters.len(),
            connected_adapters: adapters.values().filter(|a| a.is_connected()).count(),
            routed_devices: map.len(),
            active_devices: map.values().filter(|e| e.is_active).count(),
            unhealthy_adapters: unhealthy,
            adapters: adapters.iter().map(|(p, a)| (*p, a.stats())).collect(),
        }
    }

    fn route(&self, device_id: &str) -> AdapterResult<Arc<dyn DeviceAdapter>> {
        let map = self.device_map.read();
        let entry = map
            .get(device_id)
            .ok_or_else(|| AdapterError::NotMapped(device_id.to_string()))?;
        match entry.adapter.upgrade() {
            Some(adapter) if adapter.is_connected() => Ok(adapter),
            _ => Err(AdapterError::AdapterUnavailable(entry.protocol)),
        }
    }

    fn register_route(&self, device_id: &str, adapter: &Arc<dyn DeviceAdapter>) {
        let protocol = adapter.protocol();
        let entry = DeviceMapEntry {
            device_id: device_id.to_string(),
            protocol,
            adapter: Arc::downgrade(adapter),
            last_seen: Utc::now(),
            is_active: adapter.is_connected(),
        };
        if let Some(previous) = self.device_map.write().insert(device_id.to_string(), entry) {
            if previous.protocol != protocol {
                warn!(
                    device_id = %device_id,
                    from = %previous.protocol,
                    to = %protocol,
                    "device route overwritten by a different protocol"
                );
            }
        }
    }

    fn touch(&self, device_id: &str) {
        if let Some(entry) = self.device_map.write().get_mut(device_id) {
            entry.last_seen = Utc::now();
        }
    }

    fn set_protocol_active(&self, protocol: Protocol, active: bool) {
        for entry in self.device_map.write().values_mut() {
            if entry.protocol == protocol {
                entry.is_active = active;
            }
        }
    }

    fn publish_adapter_error(&self, protocol: Protocol, error: String) {
        self.event_bus.publish_with_source(
            HubEvent::AdapterError {
                protocol,
                error,
                timestamp: Utc::now().timestamp(),
            },
            "manager",
        );
    }

    /// Run an adapter call in its own task, bounded by the adapter's
    /// connection + command timeout.
    async fn run_detached<T, F, Fut>(
        &self,
        adapter: &Arc<dyn DeviceAdapter>,
        operation: &'static str,
        call: F,
    ) -> AdapterResult<T>
    where
        F: FnOnce(Arc<dyn DeviceAdapter>) -> Fut,
        Fut: Future<Output = AdapterResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let config = adapter.core().config();
        let limit = config.connection_timeout() + config.command_timeout();
        let mut handle = tokio::spawn(call(adapter.clone()));

        match tokio::time::timeout(limit, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(AdapterError::Other(anyhow::anyhow!(
                "{} task failed: {}",
                operation,
                join_error
            ))),
            Err(_) => {
                // Detach: the call may still complete; its result is discarded.
                drop(handle);
                warn!(
                    protocol = %adapter.protocol(),
                    operation,
                    timeout_ms = limit.as_millis() as u64,
                    "adapter call timed out and was detached"
                );
                Err(AdapterError::Timeout(limit.as_millis() as u64))
            }
        }
    }

    /// Relay an adapter's notifications onto the hub event bus.
    fn spawn_forwarder(self: &Arc<Self>, adapter: &Arc<dyn DeviceAdapter>) -> JoinHandle<()> {
        let mut events = adapter.events();
        let protocol = adapter.protocol();
        let source = format!("adapter:{}", protocol);
        let manager = Arc::downgrade(self);

        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                let timestamp = Utc::now().timestamp();
                let hub_event = match event {
                    AdapterEvent::Connected => {
                        manager.set_protocol_active(protocol, true);
                        HubEvent::AdapterConnected {
                            protocol,
                            timestamp,
                        }
                    }
                    AdapterEvent::Disconnected { error } => {
                        manager.set_protocol_active(protocol, false);
                        HubEvent::AdapterDisconnected {
                            protocol,
                            error,
                            timestamp,
                        }
                    }
                    AdapterEvent::Error { message } => HubEvent::AdapterError {
                        protocol,
                        error: message,
                        timestamp,
                    },
                    AdapterEvent::DeviceUpdate(update) => {
                        manager.touch(&update.device_id);
                        HubEvent::DeviceUpdate { update }
                    }
                };
                manager
                    .event_bus
                    .publish_with_source(hub_event, source.clone());
            }
            debug!(protocol = %protocol, "adapter event stream closed");
        })
    }

    fn start_health_checks(self: &Arc<Self>) {
        let manager = Arc::downgrade(self);
        let period = self.config.health_check_interval();
        if period.is_zero() {
            return;
        }

        let task = tokio::spawn(async move {
            let mut timer = interval(period);
            timer.tick().await; // Skip first tick

            loop {
                timer.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                let reports = manager.health_check_once().await;
                debug!(
                    checked = reports.len(),
                    unhealthy = reports.iter().filter(|r| !r.healthy).count(),
                    "health check round complete"
                );
            }
        });

        if let Some(old) = self.health_task.lock().replace(task) {
            old.abort();
        }
    }
}

impl Drop for AdapterManager {
    fn drop(&mut self) {
        if let Some(task) = self.health_task.lock().take() {
            task.abort();
        }
        for (_, task) in self.forwarders.lock().drain() {
            task.abort();
        }
    }
}

fn record(stats: &RwLock<CommandStats>, success: bool, started: Instant) {
    let mut stats = stats.write();
    if success {
        stats.record_success(started.elapsed().as_millis() as f64);
    } else {
        stats.record_failure();
    }
}

async fn diagnostics_within(
    adapter: &dyn DeviceAdapter,
    limit: Duration,
) -> Result<AdapterDiagnostics, String> {
    match tokio::time::timeout(limit, adapter.get_diagnostics()).await {
        Ok(Ok(diagnostics)) => Ok(diagnostics),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(AdapterError::Timeout(limit.as_millis() as u64).to_string()),
    }
}
