//! Device integration service.
//!
//! The façade the rest of the hub talks to. It sits on top of the
//! [`AdapterManager`] and adds:
//! - a TTL read cache for status, device info, capabilities and discovery
//! - command execution with bounded retry and exponential backoff
//! - state merge, cache invalidation and broadcast after every success
//! - a degraded fallback status when no adapter can answer
//! - a staleness monitor for online devices that went quiet
//!
//! Command and status calls never return an error to the caller. A failed
//! command comes back as a failed [`CommandResult`]; a failed status query
//! comes back as the last known state tagged [`UpdateSource::Fallback`].

use crate::broadcaster::Broadcaster;
use crate::cache::{
    CachePayload, TtlCache, capabilities_key, discovery_key, info_key, status_key,
};
use crate::config::IntegrationConfig;
use crate::error::{IntegrationError, Result};
use crate::retry::is_non_retryable;
use crate::store::{DeviceRecord, DeviceStore};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use devhub_core::{
    CommandResult, DeviceCommand, DeviceDiscovery, DeviceInfo, DeviceStatus, DeviceStatusUpdate,
    DeviceType, HubEvent, Protocol, UpdateSource,
};
use devhub_devices::{AdapterDiagnostics, AdapterError, AdapterManager, ManagerStats};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, info, warn};

/// Lifecycle of one command execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ExecutionState {
    Pending,
    Executing { attempt: u32 },
    Completed,
    Failed,
}

/// One attempt of a command execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 0-based
    pub attempt: u32,
    /// Backoff slept before this attempt
    pub delay_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandExecution {
    pub id: String,
    pub device_id: String,
    pub user_id: String,
    pub command: DeviceCommand,
    pub state: ExecutionState,
    pub attempts: Vec<AttemptRecord>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<CommandResult>,
}

impl CommandExecution {
    fn new(device_id: &str, user_id: &str, command: DeviceCommand) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            device_id: device_id.to_string(),
            user_id: user_id.to_string(),
            command,
            state: ExecutionState::Pending,
            attempts: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
            result: None,
        }
    }

    fn finish(&mut self, result: CommandResult) {
        self.state = if result.success {
            ExecutionState::Completed
        } else {
            ExecutionState::Failed
        };
        self.finished_at = Some(Utc::now());
        self.result = Some(result);
    }
}

/// Request to bring a device under management.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRegistration {
    pub device_id: String,
    pub protocol: Protocol,
    /// Falls back to the adapter-reported name, then the device id
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub device_type: Option<DeviceType>,
    #[serde(default)]
    pub metadata: Value,
}

impl DeviceRegistration {
    pub fn new(device_id: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            device_id: device_id.into(),
            protocol,
            name: None,
            device_type: None,
            metadata: Value::Null,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Editable fields of a device record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DevicePatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub device_type: Option<DeviceType>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceDiagnostics {
    pub device: DeviceRecord,
    pub routed: bool,
    pub route_active: bool,
    pub route_last_seen: Option<DateTime<Utc>>,
    /// `None` when the connection test itself failed
    pub reachable: Option<bool>,
    pub connection_error: Option<String>,
    pub adapter: Option<AdapterDiagnostics>,
    pub active_executions: usize,
    pub recent_commands: Vec<CommandExecution>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub total_commands: u64,
    pub successful_commands: u64,
    pub failed_commands: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub fallback_responses: u64,
    pub active_executions: usize,
    pub cached_entries: usize,
    pub manager: ManagerStats,
}

#[derive(Default)]
struct Counters {
    total_commands: AtomicU64,
    successful_commands: AtomicU64,
    failed_commands: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    fallback_responses: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// One async mutex per device id.
#[derive(Default)]
struct KeyedLocks {
    locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl KeyedLocks {
    fn get(&self, key: &str) -> Arc<AsyncMutex<()>> {
        self.locks.entry(key.to_string()).or_default().value().clone()
    }

    fn remove(&self, key: &str) {
        self.locks.remove(key);
    }
}

pub struct DeviceIntegrationService {
    manager: Arc<AdapterManager>,
    store: Arc<dyn DeviceStore>,
    broadcaster: Arc<dyn Broadcaster>,
    config: IntegrationConfig,
    cache: TtlCache<CachePayload>,
    /// Serializes command executions per device
    command_locks: KeyedLocks,
    /// Serializes read-modify-write of store records per device
    record_locks: KeyedLocks,
    active: DashMap<String, CommandExecution>,
    history: Mutex<HashMap<String, VecDeque<CommandExecution>>>,
    counters: Counters,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DeviceIntegrationService {
    pub fn new(
        manager: Arc<AdapterManager>,
        store: Arc<dyn DeviceStore>,
        broadcaster: Arc<dyn Broadcaster>,
        config: IntegrationConfig,
    ) -> Self {
        let cache = TtlCache::with_compaction_threshold(config.cache.compaction_threshold);
        Self {
            manager,
            store,
            broadcaster,
            config,
            cache,
            command_locks: KeyedLocks::default(),
            record_locks: KeyedLocks::default(),
            active: DashMap::new(),
            history: Mutex::new(HashMap::new()),
            counters: Counters::default(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn manager(&self) -> &Arc<AdapterManager> {
        &self.manager
    }

    pub fn config(&self) -> &IntegrationConfig {
        &self.config
    }

    /// Start the update listener and staleness monitor, then run an initial
    /// discovery and re-route stored devices discovery did not find.
    ///
    /// Returns the number of devices discovered.
    pub async fn start(self: &Arc<Self>) -> usize {
        {
            let mut tasks = self.tasks.lock();
            if !tasks.is_empty() {
                warn!("device integration service already started");
                return 0;
            }
            tasks.push(self.spawn_update_listener());
            if let Some(monitor) = self.spawn_staleness_monitor() {
                tasks.push(monitor);
            }
        }

        let discovered = match self.discover_devices(None, None).await {
            Ok(devices) => devices.len(),
            Err(e) => {
                warn!(error = %e, "initial discovery failed");
                0
            }
        };
        let restored = self.restore_routes().await;
        info!(discovered, restored, "device integration service started");
        discovered
    }

    /// Stop background tasks and drop cached reads. The manager is left running.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.cache.clear();
        info!("device integration service stopped");
    }

    /// Run a command with retry and backoff.
    ///
    /// Attempt `k > 0` is preceded by the policy's backoff delay. A failure
    /// whose message is non-retryable stops immediately. The returned
    /// result's `retry_count` is the index of the final attempt, or
    /// `max_attempts` when every attempt failed.
    pub async fn execute_device_command(
        &self,
        device_id: &str,
        user_id: &str,
        command: &str,
        params: Map<String, Value>,
    ) -> CommandResult {
        let started = Instant::now();
        let command = DeviceCommand::new(command).with_parameters(params);
        bump(&self.counters.total_commands);

        if let Err(e) = self.owned_record(device_id, user_id).await {
            warn!(device_id, user_id, error = %e, "command refused");
            bump(&self.counters.failed_commands);
            return CommandResult::failure(e.to_string(), elapsed_ms(started));
        }

        let lock = self.command_locks.get(device_id);
        let _guard = lock.lock().await;

        let mut execution = CommandExecution::new(device_id, user_id, command);
        self.active.insert(execution.id.clone(), execution.clone());
        debug!(
            device_id,
            command = %execution.command.command,
            execution_id = %execution.id,
            "executing command"
        );

        let result = self.run_attempts(&mut execution, started).await;
        if result.success {
            bump(&self.counters.successful_commands);
            self.apply_command_success(device_id, &result).await;
            info!(
                device_id,
                command = %execution.command.command,
                retry_count = result.retry_count,
                response_time_ms = result.response_time_ms,
                "command succeeded"
            );
        } else {
            bump(&self.counters.failed_commands);
            warn!(
                device_id,
                command = %execution.command.command,
                retry_count = result.retry_count,
                error = result.error.as_deref().unwrap_or_default(),
                "command failed"
            );
        }

        execution.finish(result.clone());
        self.active.remove(&execution.id);
        self.push_history(execution);
        result
    }

    async fn run_attempts(
        &self,
        execution: &mut CommandExecution,
        started: Instant,
    ) -> CommandResult {
        let policy = &self.config.retry;
        let max_attempts = policy.max_attempts.max(1);
        let mut last_error = String::from("Command was not attempted");

        for attempt in 0..max_attempts {
            let delay = policy.delay_for_attempt(attempt);
            if !delay.is_zero() {
                debug!(
                    device_id = %execution.device_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "backing off before retry"
                );
                tokio::time::sleep(delay).await;
            }
            execution.state = ExecutionState::Executing { attempt };
            self.active.insert(execution.id.clone(), execution.clone());

            let delay_ms = delay.as_millis() as u64;
            let outcome = self
                .manager
                .send_command(&execution.device_id, &execution.command)
                .await;
            let error = match outcome {
                Ok(result) if result.success => {
                    execution.attempts.push(AttemptRecord {
                        attempt,
                        delay_ms,
                        error: None,
                    });
                    return result.with_retry_count(attempt);
                }
                Ok(result) => result
                    .error
                    .unwrap_or_else(|| "Command failed without an error message".to_string()),
                Err(e) => e.to_string(),
            };
            execution.attempts.push(AttemptRecord {
                attempt,
                delay_ms,
                error: Some(error.clone()),
            });

            if is_non_retryable(&error) {
                debug!(device_id = %execution.device_id, attempt, error = %error, "non-retryable failure");
                return CommandResult::failure(error, elapsed_ms(started)).with_retry_count(attempt);
            }
            debug!(
                device_id = %execution.device_id,
                attempt,
                max_attempts,
                error = %error,
                "command attempt failed"
            );
            last_error = error;
        }

        CommandResult::failure(last_error, elapsed_ms(started)).with_retry_count(max_attempts)
    }

    async fn apply_command_success(&self, device_id: &str, result: &CommandResult) {
        let fragment = result.state_fragment().cloned().unwrap_or_default();
        let updated = self
            .modify_record(device_id, |record| {
                record.merge_state(&fragment);
                record.mark_seen(DeviceStatus::Online);
            })
            .await;
        self.cache.invalidate_device(device_id);

        let state = updated.map(|r| r.state).unwrap_or(fragment);
        self.broadcaster.broadcast(&DeviceStatusUpdate::new(
            device_id,
            DeviceStatus::Online,
            state,
            UpdateSource::Command,
        ));
    }

    /// Current status of a device.
    ///
    /// Served from cache unless `force_refresh`. When the adapter cannot
    /// answer, the last stored state is returned tagged as a fallback and a
    /// device previously marked online is flipped offline.
    pub async fn get_device_status(
        &self,
        device_id: &str,
        user_id: &str,
        force_refresh: bool,
    ) -> DeviceStatusUpdate {
        let record = match self.owned_record(device_id, user_id).await {
            Ok(record) => Some(record),
            Err(IntegrationError::DeviceNotFound(_)) => None,
            Err(e) => {
                warn!(device_id, user_id, error = %e, "status lookup refused");
                return DeviceStatusUpdate::new(
                    device_id,
                    DeviceStatus::Unknown,
                    Map::new(),
                    UpdateSource::Fallback,
                );
            }
        };

        if !force_refresh {
            if let Some(CachePayload::Status(update)) = self.cached(&status_key(device_id)) {
                return update;
            }
        }

        match self.manager.get_device_status(device_id).await {
            Ok(update) => {
                self.cache.set(
                    status_key(device_id),
                    CachePayload::Status(update.clone()),
                    self.config.cache.status(),
                );
                if let Some(previous) = record {
                    self.modify_record(device_id, |r| {
                        r.merge_state(&update.state);
                        r.mark_seen(update.status);
                    })
                    .await;
                    if previous.status != update.status {
                        self.broadcaster.broadcast(&update);
                    }
                }
                update
            }
            Err(e) => self.fallback_status(device_id, record, &e).await,
        }
    }

    async fn fallback_status(
        &self,
        device_id: &str,
        record: Option<DeviceRecord>,
        error: &AdapterError,
    ) -> DeviceStatusUpdate {
        bump(&self.counters.fallback_responses);
        warn!(device_id, error = %error, "status query failed, serving last known state");

        let Some(record) = record else {
            return DeviceStatusUpdate::new(
                device_id,
                DeviceStatus::Unknown,
                Map::new(),
                UpdateSource::Fallback,
            );
        };
        if !record.online {
            return DeviceStatusUpdate::new(
                device_id,
                record.status,
                record.state,
                UpdateSource::Fallback,
            );
        }

        let updated = self
            .modify_record(device_id, |r| {
                r.online = false;
                r.status = DeviceStatus::Offline;
                r.updated_at = Utc::now();
            })
            .await;
        self.cache.invalidate_device(device_id);
        info!(device_id, "device marked offline");

        let state = updated.map(|r| r.state).unwrap_or(record.state);
        let update =
            DeviceStatusUpdate::new(device_id, DeviceStatus::Offline, state, UpdateSource::Fallback);
        self.broadcaster.broadcast(&update);
        update
    }

    /// Discover devices through the manager. Results are cached per filter pair.
    pub async fn discover_devices(
        &self,
        protocol: Option<Protocol>,
        device_type: Option<DeviceType>,
    ) -> Result<Vec<DeviceDiscovery>> {
        let key = discovery_key(
            protocol.as_ref().map(Protocol::as_str),
            device_type.as_ref().map(DeviceType::as_str),
        );
        if let Some(CachePayload::Discovery(devices)) = self.cached(&key) {
            return Ok(devices);
        }

        let devices = self.manager.discover_devices(protocol, device_type).await?;
        self.cache.set(
            key,
            CachePayload::Discovery(devices.clone()),
            self.config.cache.discovery(),
        );
        Ok(devices)
    }

    pub async fn get_device_info(&self, device_id: &str) -> Result<DeviceInfo> {
        let key = info_key(device_id);
        if let Some(CachePayload::Info(info)) = self.cached(&key) {
            return Ok(info);
        }

        let info = self.manager.get_device_info(device_id).await?;
        self.cache.set(
            key,
            CachePayload::Info(info.clone()),
            self.config.cache.device_info(),
        );
        Ok(info)
    }

    pub async fn get_device_capabilities(&self, device_id: &str) -> Result<Vec<String>> {
        let key = capabilities_key(device_id);
        if let Some(CachePayload::Capabilities(capabilities)) = self.cached(&key) {
            return Ok(capabilities);
        }

        let capabilities = self.get_device_info(device_id).await?.capabilities;
        self.cache.set(
            key,
            CachePayload::Capabilities(capabilities.clone()),
            self.config.cache.capabilities(),
        );
        Ok(capabilities)
    }

    /// Route a device through the manager and store it under `user_id`.
    ///
    /// Re-registering a device the user already owns refreshes its record
    /// and keeps its state.
    pub async fn add_device(
        &self,
        user_id: &str,
        registration: DeviceRegistration,
    ) -> Result<DeviceRecord> {
        let device_id = registration.device_id.clone();
        let existing = self.store.get(&device_id).await?;
        if let Some(existing) = &existing {
            if existing.owner_id != user_id {
                return Err(IntegrationError::PermissionDenied(format!(
                    "device {} is registered to another user",
                    device_id
                )));
            }
        }

        self.manager.add_device(&device_id, registration.protocol)?;
        self.cache.invalidate_device(&device_id);

        let info = match self.get_device_info(&device_id).await {
            Ok(info) => Some(info),
            Err(e) => {
                debug!(device_id = %device_id, error = %e, "device info unavailable at registration");
                None
            }
        };

        let device_type = registration
            .device_type
            .or(info.as_ref().map(|i| i.device_type))
            .unwrap_or(DeviceType::Unknown);
        let name = registration
            .name
            .or_else(|| info.as_ref().map(|i| i.name.clone()))
            .unwrap_or_else(|| device_id.clone());

        let mut record = DeviceRecord::new(
            &device_id,
            user_id,
            registration.protocol,
            device_type,
            name,
        );
        record.metadata = registration.metadata;
        if let Some(info) = info {
            record.capabilities = info.capabilities;
            record.mark_seen(if info.online {
                DeviceStatus::Online
            } else {
                DeviceStatus::Offline
            });
        }
        if let Some(existing) = existing {
            record.created_at = existing.created_at;
            record.state = existing.state;
        }

        self.store.upsert(record.clone()).await?;
        self.cache.invalidate_prefix("discovery:");
        info!(
            device_id = %device_id,
            user_id,
            protocol = %record.protocol,
            "device added"
        );
        Ok(record)
    }

    pub async fn update_device(
        &self,
        device_id: &str,
        user_id: &str,
        patch: DevicePatch,
    ) -> Result<DeviceRecord> {
        self.owned_record(device_id, user_id).await?;
        let updated = self
            .modify_record(device_id, |record| {
                if let Some(name) = patch.name {
                    record.name = name;
                }
                if let Some(device_type) = patch.device_type {
                    record.device_type = device_type;
                }
                if let Some(metadata) = patch.metadata {
                    record.metadata = metadata;
                }
                record.updated_at = Utc::now();
            })
            .await
            .ok_or_else(|| IntegrationError::DeviceNotFound(device_id.to_string()))?;
        self.cache.invalidate_device(device_id);
        debug!(device_id, "device updated");
        Ok(updated)
    }

    /// Delete a device record and its route. Returns whether a record existed.
    pub async fn remove_device(&self, device_id: &str, user_id: &str) -> Result<bool> {
        self.owned_record(device_id, user_id).await?;
        let removed = self.store.delete(device_id).await?;
        let unrouted = self.manager.remove_device(device_id);

        self.cache.invalidate_device(device_id);
        self.cache.invalidate_prefix("discovery:");
        self.history.lock().remove(device_id);
        self.command_locks.remove(device_id);
        self.record_locks.remove(device_id);
        info!(device_id, user_id, unrouted, "device removed");
        Ok(removed)
    }

    pub async fn list_user_devices(&self, user_id: &str) -> Result<Vec<DeviceRecord>> {
        Ok(self.store.list_by_owner(user_id).await?)
    }

    pub async fn get_device_diagnostics(
        &self,
        device_id: &str,
        user_id: &str,
    ) -> Result<DeviceDiagnostics> {
        let device = self.owned_record(device_id, user_id).await?;
        let route = self.manager.device_entry(device_id);

        let (reachable, connection_error) =
            match self.manager.test_device_connection(device_id).await {
                Ok(ok) => (Some(ok), None),
                Err(e) => (None, Some(e.to_string())),
            };

        let adapter = match self.manager.adapter(device.protocol) {
            Some(adapter) => {
                let limit = self.manager.config().health_check_timeout();
                match tokio::time::timeout(limit, adapter.get_diagnostics()).await {
                    Ok(Ok(diagnostics)) => Some(diagnostics),
                    Ok(Err(e)) => {
                        debug!(device_id, error = %e, "adapter diagnostics failed");
                        None
                    }
                    Err(_) => {
                        debug!(device_id, "adapter diagnostics timed out");
                        None
                    }
                }
            }
            None => None,
        };

        let active_executions = self
            .active
            .iter()
            .filter(|e| e.device_id == device_id)
            .count();
        let recent_commands = self
            .command_history(device_id)
            .into_iter()
            .rev()
            .take(10)
            .collect();

        Ok(DeviceDiagnostics {
            device,
            routed: route.is_some(),
            route_active: route.as_ref().is_some_and(|r| r.is_active),
            route_last_seen: route.map(|r| r.last_seen),
            reachable,
            connection_error,
            adapter,
            active_executions,
            recent_commands,
        })
    }

    /// Executions currently in flight.
    pub fn active_executions(&self) -> Vec<CommandExecution> {
        let mut executions: Vec<CommandExecution> =
            self.active.iter().map(|e| e.value().clone()).collect();
        executions.sort_by_key(|e| e.started_at);
        executions
    }

    /// Finished executions for a device, oldest first.
    pub fn command_history(&self, device_id: &str) -> Vec<CommandExecution> {
        self.history
            .lock()
            .get(device_id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> ServiceStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        ServiceStats {
            total_commands: load(&self.counters.total_commands),
            successful_commands: load(&self.counters.successful_commands),
            failed_commands: load(&self.counters.failed_commands),
            cache_hits: load(&self.counters.cache_hits),
            cache_misses: load(&self.counters.cache_misses),
            fallback_responses: load(&self.counters.fallback_responses),
            active_executions: self.active.len(),
            cached_entries: self.cache.len(),
            manager: self.manager.stats(),
        }
    }

    /// Force a status refresh for every online device not seen within the
    /// staleness threshold. Returns how many were refreshed.
    pub async fn refresh_stale_devices(&self) -> usize {
        let records = match self.store.list_all().await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "staleness scan could not list devices");
                return 0;
            }
        };

        let now = Utc::now();
        let threshold = self.config.staleness_threshold();
        let stale: Vec<DeviceRecord> = records
            .into_iter()
            .filter(|r| {
                r.online
                    && r.last_seen.is_none_or(|seen| {
                        now.signed_duration_since(seen)
                            .to_std()
                            .is_ok_and(|age| age > threshold)
                    })
            })
            .collect();

        for record in &stale {
            debug!(device_id = %record.device_id, "refreshing stale device");
            self.get_device_status(&record.device_id, &record.owner_id, true)
                .await;
        }
        stale.len()
    }

    /// Apply an adapter-originated update: merge it into the stored record,
    /// drop cached reads and pass it on to the broadcaster unchanged.
    pub async fn handle_device_update(&self, update: DeviceStatusUpdate) {
        let stored = self
            .modify_record(&update.device_id, |r| {
                r.merge_state(&update.state);
                r.mark_seen(update.status);
            })
            .await;
        if stored.is_none() {
            debug!(device_id = %update.device_id, "update for unregistered device");
        }
        self.cache.invalidate_device(&update.device_id);
        self.broadcaster.broadcast(&update);
    }

    async fn owned_record(&self, device_id: &str, user_id: &str) -> Result<DeviceRecord> {
        let record = self
            .store
            .get(device_id)
            .await?
            .ok_or_else(|| IntegrationError::DeviceNotFound(device_id.to_string()))?;
        if record.owner_id != user_id {
            return Err(IntegrationError::PermissionDenied(format!(
                "user {} does not own device {}",
                user_id, device_id
            )));
        }
        Ok(record)
    }

    /// Read-modify-write a stored record under its device lock.
    async fn modify_record<F>(&self, device_id: &str, apply: F) -> Option<DeviceRecord>
    where
        F: FnOnce(&mut DeviceRecord) + Send,
    {
        let lock = self.record_locks.get(device_id);
        let _guard = lock.lock().await;

        let mut record = match self.store.get(device_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => {
                warn!(device_id, error = %e, "failed to load device record");
                return None;
            }
        };
        apply(&mut record);
        if let Err(e) = self.store.upsert(record.clone()).await {
            warn!(device_id, error = %e, "failed to save device record");
            return None;
        }
        Some(record)
    }

    fn cached(&self, key: &str) -> Option<CachePayload> {
        let value = self.cache.get(key);
        if value.is_some() {
            bump(&self.counters.cache_hits);
        } else {
            bump(&self.counters.cache_misses);
        }
        value
    }

    fn push_history(&self, execution: CommandExecution) {
        let limit = self.config.command_history_limit;
        if limit == 0 {
            return;
        }
        let mut history = self.history.lock();
        let entries = history.entry(execution.device_id.clone()).or_default();
        entries.push_back(execution);
        while entries.len() > limit {
            entries.pop_front();
        }
    }

    /// Route stored devices that discovery did not pick up.
    async fn restore_routes(&self) -> usize {
        let records = match self.store.list_all().await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "could not list stored devices");
                return 0;
            }
        };

        let mut restored = 0;
        for record in records {
            if self.manager.device_entry(&record.device_id).is_some() {
                continue;
            }
            match self.manager.add_device(&record.device_id, record.protocol) {
                Ok(()) => restored += 1,
                Err(e) => debug!(device_id = %record.device_id, error = %e, "route not restored"),
            }
        }
        restored
    }

    fn spawn_update_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = self.manager.event_bus().filter().device_events();
        let service: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            while let Some((event, _)) = events.recv().await {
                let Some(service) = service.upgrade() else {
                    break;
                };
                if let HubEvent::DeviceUpdate { update } = event {
                    service.handle_device_update(update).await;
                }
            }
            debug!("device update listener stopped");
        })
    }

    fn spawn_staleness_monitor(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let period = self.config.staleness_interval();
        if period.is_zero() {
            return None;
        }
        let service: Weak<Self> = Arc::downgrade(self);

        Some(tokio::spawn(async move {
            let mut timer = interval(period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            timer.tick().await; // Skip first tick

            loop {
                timer.tick().await;
                let Some(service) = service.upgrade() else {
                    break;
                };
                let refreshed = service.refresh_stale_devices().await;
                if refreshed > 0 {
                    debug!(refreshed, "staleness scan complete");
                }
            }
        }))
    }
}

impl Drop for DeviceIntegrationService {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
