//! Device adapter contract.
//!
//! Every protocol implementation satisfies [`DeviceAdapter`] and embeds an
//! [`AdapterCore`], which owns the state the contract guarantees:
//! connection status, rolling command statistics, per-device update
//! subscriptions, the notification channel and the command gate.
//!
//! ## Notification delivery
//!
//! When an adapter publishes a device update, matching subscription callbacks
//! run synchronously, in subscription order, on the publishing task. Only then
//! is the update sent on the broadcast channel returned by
//! [`DeviceAdapter::events`]. Connection notifications are sent only on an
//! actual state change.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use devhub_core::{
    CommandResult, DeviceCommand, DeviceDiscovery, DeviceInfo, DeviceStatusUpdate, DeviceType,
    DiscoveryFilters, Protocol,
};
use futures::Stream;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, broadcast};
use tokio::time::Instant;

/// Result type for adapter operations.
pub type AdapterResult<T> = Result<T, AdapterError>;

/// Error type for device adapter operations.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Adapter configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Communication error
    #[error("Communication error: {0}")]
    Communication(String),

    /// Token acquisition or refresh failed
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Device unknown to the protocol backend
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Device id absent from the manager's routing map
    #[error("Device not found in routing map: {0}")]
    NotMapped(String),

    /// The adapter that owns the device is not connected
    #[error("Adapter unavailable: {0} is not connected")]
    AdapterUnavailable(Protocol),

    /// Protocol-level command failure
    #[error("Command rejected: {0}")]
    CommandRejected(String),

    /// Malformed device id or command shape
    #[error("Validation error: {0}")]
    Validation(String),

    /// Operation timeout
    #[error("Operation timeout after {0}ms")]
    Timeout(u64),

    /// Other error
    #[error("Adapter error: {0}")]
    Other(#[from] anyhow::Error),
}

impl AdapterError {
    /// Short machine-readable kind, used in logs and diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Connection(_) => "connection",
            Self::Communication(_) => "communication",
            Self::Authentication(_) => "authentication",
            Self::DeviceNotFound(_) => "device_not_found",
            Self::NotMapped(_) => "not_mapped",
            Self::AdapterUnavailable(_) => "adapter_unavailable",
            Self::CommandRejected(_) => "command_rejected",
            Self::Validation(_) => "validation",
            Self::Timeout(_) => "timeout",
            Self::Other(_) => "other",
        }
    }
}

/// Token-bucket rate limit applied to outgoing commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub requests_per_second: f64,
    pub burst: u32,
}

impl RateLimitConfig {
    /// A usable limit has a finite, positive refill rate.
    pub fn is_valid(&self) -> bool {
        self.requests_per_second.is_finite() && self.requests_per_second > 0.0
    }
}

/// Static per-protocol adapter configuration.
///
/// Owned by the caller; adapters hold it behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfig {
    pub protocol: Protocol,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_max_concurrent_commands")]
    pub max_concurrent_commands: usize,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    /// Credentials, protocol specific
    #[serde(default)]
    pub auth: Map<String, Value>,
    /// Protocol-specific options
    #[serde(default)]
    pub options: Map<String, Value>,
}

fn default_enabled() -> bool {
    true
}

fn default_connection_timeout_ms() -> u64 {
    10_000
}

fn default_command_timeout_ms() -> u64 {
    5_000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn default_max_concurrent_commands() -> usize {
    10
}

impl AdapterConfig {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            enabled: true,
            connection_timeout_ms: default_connection_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            max_concurrent_commands: default_max_concurrent_commands(),
            rate_limit: None,
            auth: Map::new(),
            options: Map::new(),
        }
    }

    pub fn with_auth(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.auth.insert(key.into(), value.into());
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn with_rate_limit(mut self, requests_per_second: f64, burst: u32) -> Self {
        self.rate_limit = Some(RateLimitConfig {
            requests_per_second,
            burst,
        });
        self
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Required string credential.
    pub fn auth_str(&self, key: &str) -> AdapterResult<&str> {
        self.auth
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                AdapterError::Configuration(format!(
                    "{} adapter requires auth.{}",
                    self.protocol, key
                ))
            })
    }

    /// Optional string credential.
    pub fn auth_opt(&self, key: &str) -> Option<&str> {
        self.auth
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }
}

/// Connection state of an adapter.
///
/// Mutated only by the adapter that owns it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_disconnected_at: Option<DateTime<Utc>>,
    pub connection_attempts: u32,
    pub error_count: u32,
    pub last_error: Option<String>,
}

/// Rolling command statistics.
///
/// Updated incrementally: the running average is
/// `avg' = (avg * (n - 1) + value) / n` where `n` is the total command count
/// after the increment. It is never recomputed from history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandStats {
    pub total_commands: u64,
    pub successful_commands: u64,
    pub failed_commands: u64,
    pub average_response_time_ms: f64,
    pub last_command_at: Option<DateTime<Utc>>,
}

impl CommandStats {
    pub fn record_success(&mut self, response_time_ms: f64) {
        self.total_commands += 1;
        self.successful_commands += 1;
        let n = self.total_commands as f64;
        self.average_response_time_ms =
            (self.average_response_time_ms * (n - 1.0) + response_time_ms) / n;
        self.last_command_at = Some(Utc::now());
    }

    pub fn record_failure(&mut self) {
        self.total_commands += 1;
        self.failed_commands += 1;
        self.last_command_at = Some(Utc::now());
    }

    /// Fraction of successful commands, `0.0` when nothing ran yet.
    pub fn success_rate(&self) -> f64 {
        if self.total_commands == 0 {
            0.0
        } else {
            self.successful_commands as f64 / self.total_commands as f64
        }
    }
}

/// Adapter statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdapterStats {
    #[serde(flatten)]
    pub commands: CommandStats,
    /// Share of the adapter's lifetime spent connected, in percent
    pub uptime_percent: f64,
}

impl AdapterStats {
    pub fn success_rate(&self) -> f64 {
        self.commands.success_rate()
    }
}

/// Notification emitted by an adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
    Connected,
    Disconnected { error: Option<String> },
    Error { message: String },
    DeviceUpdate(DeviceStatusUpdate),
}

/// Callback invoked for matching device updates.
pub type UpdateCallback = Arc<dyn Fn(&DeviceStatusUpdate) + Send + Sync>;

/// A per-device update subscription.
#[derive(Clone)]
pub struct EventSubscription {
    pub subscription_id: String,
    pub device_id: String,
    /// State keys of interest; empty (or `"*"`) means every update
    pub event_types: Vec<String>,
    pub callback: UpdateCallback,
    pub subscribed_at: DateTime<Utc>,
}

impl EventSubscription {
    /// Whether an update is delivered to this subscription.
    ///
    /// `"status"` matches every update since each carries a status; any other
    /// entry matches when the update's state map contains that key.
    pub fn matches(&self, update: &DeviceStatusUpdate) -> bool {
        if update.device_id != self.device_id {
            return false;
        }
        self.event_types.is_empty()
            || self.event_types.iter().any(|t| {
                t == "*" || t == "status" || update.state.contains_key(t.as_str())
            })
    }
}

impl std::fmt::Debug for EventSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSubscription")
            .field("subscription_id", &self.subscription_id)
            .field("device_id", &self.device_id)
            .field("event_types", &self.event_types)
            .field("subscribed_at", &self.subscribed_at)
            .finish_non_exhaustive()
    }
}

/// Adapter self-report used for health checking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterDiagnostics {
    pub protocol: Protocol,
    pub name: String,
    pub healthy: bool,
    pub connection: ConnectionStatus,
    pub stats: AdapterStats,
    pub subscriptions: usize,
    #[serde(default)]
    pub details: Value,
    pub checked_at: DateTime<Utc>,
}

struct UptimeTracker {
    created_at: Instant,
    connected_since: Option<Instant>,
    accumulated: Duration,
}

impl UptimeTracker {
    fn new() -> Self {
        Self {
            created_at: Instant::now(),
            connected_since: None,
            accumulated: Duration::ZERO,
        }
    }

    fn connected(&mut self) {
        if self.connected_since.is_none() {
            self.connected_since = Some(Instant::now());
        }
    }

    fn disconnected(&mut self) {
        if let Some(since) = self.connected_since.take() {
            self.accumulated += since.elapsed();
        }
    }

    fn percent(&self) -> f64 {
        let lifetime = self.created_at.elapsed();
        let up = self.accumulated + self.connected_since.map(|s| s.elapsed()).unwrap_or_default();
        if lifetime.is_zero() {
            return if self.connected_since.is_some() { 100.0 } else { 0.0 };
        }
        (up.as_secs_f64() / lifetime.as_secs_f64() * 100.0).min(100.0)
    }
}

/// Longest single wait for a rate token. The command timeout still bounds
/// the whole acquisition.
const MAX_RATE_WAIT: Duration = Duration::from_secs(60);

struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Returns `None` unless the refill rate is finite and positive.
    fn new(config: &RateLimitConfig) -> Option<Self> {
        if !config.is_valid() {
            return None;
        }
        let capacity = f64::from(config.burst.max(1));
        Some(Self {
            capacity,
            tokens: capacity,
            refill_per_sec: config.requests_per_second,
            last_refill: Instant::now(),
        })
    }

    /// Take a token, or report how long until one is available.
    fn try_take(&mut self) -> Result<(), Duration> {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let wait = (1.0 - self.tokens) / self.refill_per_sec;
            Err(Duration::try_from_secs_f64(wait).unwrap_or(MAX_RATE_WAIT))
        }
    }
}

/// Concurrency and rate gate for outgoing commands.
pub struct CommandGate {
    permits: Arc<Semaphore>,
    bucket: Option<Mutex<TokenBucket>>,
}

impl CommandGate {
    pub fn new(max_concurrent: usize, rate_limit: Option<&RateLimitConfig>) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            bucket: rate_limit.and_then(|r| {
                let bucket = TokenBucket::new(r);
                if bucket.is_none() {
                    tracing::warn!(
                        requests_per_second = r.requests_per_second,
                        "ignoring rate limit with a non-positive rate"
                    );
                }
                bucket.map(Mutex::new)
            }),
        }
    }

    /// Wait for a concurrency slot and a rate token.
    pub async fn acquire(&self) -> AdapterResult<OwnedSemaphorePermit> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AdapterError::Connection("command gate closed".to_string()))?;

        if let Some(bucket) = &self.bucket {
            loop {
                let wait = bucket.lock().try_take();
                match wait {
                    Ok(()) => break,
                    Err(delay) => tokio::time::sleep(delay).await,
                }
            }
        }
        Ok(permit)
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}

/// State shared by every adapter implementation.
pub struct AdapterCore {
    protocol: Protocol,
    config: Arc<AdapterConfig>,
    initialized: AtomicBool,
    status: RwLock<ConnectionStatus>,
    stats: RwLock<CommandStats>,
    uptime: Mutex<UptimeTracker>,
    subscriptions: RwLock<Vec<EventSubscription>>,
    event_tx: broadcast::Sender<AdapterEvent>,
    gate: CommandGate,
}

impl AdapterCore {
    pub fn new(config: Arc<AdapterConfig>) -> Self {
        let (event_tx, _) = broadcast::channel(1000);
        let gate = CommandGate::new(config.max_concurrent_commands, config.rate_limit.as_ref());
        Self {
            protocol: config.protocol,
            config,
            initialized: AtomicBool::new(false),
            status: RwLock::new(ConnectionStatus::default()),
            stats: RwLock::new(CommandStats::default()),
            uptime: Mutex::new(UptimeTracker::new()),
            subscriptions: RwLock::new(Vec::new()),
            event_tx,
            gate,
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn config(&self) -> &Arc<AdapterConfig> {
        &self.config
    }

    /// True only after a successful `initialize()` while the status flag is set.
    pub fn is_connected(&self) -> bool {
        self.initialized.load(Ordering::Acquire) && self.status.read().connected
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn set_initialized(&self, initialized: bool) {
        self.initialized.store(initialized, Ordering::Release);
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.status.read().clone()
    }

    pub fn record_connection_attempt(&self) {
        self.status.write().connection_attempts += 1;
    }

    /// Mark the adapter connected; notifies only on an actual transition.
    pub fn set_connected(&self) {
        let changed = {
            let mut status = self.status.write();
            if status.connected {
                false
            } else {
                status.connected = true;
                status.last_connected_at = Some(Utc::now());
                true
            }
        };
        if changed {
            self.uptime.lock().connected();
            tracing::info!(protocol = %self.protocol, "adapter connected");
            let _ = self.event_tx.send(AdapterEvent::Connected);
        }
    }

    /// Mark the adapter disconnected; notifies only on an actual transition.
    ///
    /// The error, when present, is recorded even if the adapter was already
    /// disconnected.
    pub fn set_disconnected(&self, error: Option<String>) {
        let changed = {
            let mut status = self.status.write();
            if let Some(e) = &error {
                status.error_count += 1;
                status.last_error = Some(e.clone());
            }
            if status.connected {
                status.connected = false;
                status.last_disconnected_at = Some(Utc::now());
                true
            } else {
                false
            }
        };
        if changed {
            self.uptime.lock().disconnected();
            tracing::warn!(protocol = %self.protocol, error = ?error, "adapter disconnected");
            let _ = self.event_tx.send(AdapterEvent::Disconnected { error });
        }
    }

    /// Record an error that does not change the connection state.
    pub fn record_error(&self, message: impl Into<String>) {
        let message = message.into();
        {
            let mut status = self.status.write();
            status.error_count += 1;
            status.last_error = Some(message.clone());
        }
        let _ = self.event_tx.send(AdapterEvent::Error { message });
    }

    pub fn record_command_success(&self, response_time_ms: f64) {
        self.stats.write().record_success(response_time_ms);
    }

    pub fn record_command_failure(&self) {
        self.stats.write().record_failure();
    }

    pub fn stats(&self) -> AdapterStats {
        AdapterStats {
            commands: self.stats.read().clone(),
            uptime_percent: self.uptime.lock().percent(),
        }
    }

    pub fn gate(&self) -> &CommandGate {
        &self.gate
    }

    /// Run one command through the gate under the command timeout and record
    /// its outcome in the statistics.
    ///
    /// Returns the operation's value and its response time in milliseconds.
    pub async fn track_command<T, Fut>(&self, op: Fut) -> AdapterResult<(T, u64)>
    where
        Fut: Future<Output = AdapterResult<T>>,
    {
        let limit = self.config.command_timeout();
        let started = Instant::now();
        let outcome = tokio::time::timeout(limit, async {
            let _permit = self.gate.acquire().await?;
            op.await
        })
        .await
        .unwrap_or(Err(AdapterError::Timeout(self.config.command_timeout_ms)));

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(value) => {
                self.record_command_success(elapsed_ms as f64);
                Ok((value, elapsed_ms))
            }
            Err(e) => {
                self.record_command_failure();
                Err(e)
            }
        }
    }

    /// Register a callback for a device's updates and return its id.
    pub fn subscribe(
        &self,
        device_id: &str,
        event_types: Option<Vec<String>>,
        callback: UpdateCallback,
    ) -> String {
        let subscription = EventSubscription {
            subscription_id: uuid::Uuid::new_v4().to_string(),
            device_id: device_id.to_string(),
            event_types: event_types.unwrap_or_default(),
            callback,
            subscribed_at: Utc::now(),
        };
        let id = subscription.subscription_id.clone();
        self.subscriptions.write().push(subscription);
        id
    }

    /// Remove a subscription; returns whether it existed.
    pub fn unsubscribe(&self, subscription_id: &str) -> bool {
        let mut subs = self.subscriptions.write();
        let before = subs.len();
        subs.retain(|s| s.subscription_id != subscription_id);
        subs.len() != before
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    pub fn subscriptions_for(&self, device_id: &str) -> Vec<EventSubscription> {
        self.subscriptions
            .read()
            .iter()
            .filter(|s| s.device_id == device_id)
            .cloned()
            .collect()
    }

    /// Fan a device update out to subscription callbacks, then to the event channel.
    pub fn publish_update(&self, update: DeviceStatusUpdate) {
        // Callbacks run without the lock held so they may (un)subscribe.
        let matching: Vec<EventSubscription> = self
            .subscriptions
            .read()
            .iter()
            .filter(|s| s.matches(&update))
            .cloned()
            .collect();
        for sub in &matching {
            (sub.callback)(&update);
        }
        let _ = self.event_tx.send(AdapterEvent::DeviceUpdate(update));
    }

    /// Subscribe to raw adapter notifications.
    pub fn subscribe_events(&self) -> broadcast::Receiver<AdapterEvent> {
        self.event_tx.subscribe()
    }

    /// Notification stream; the receiver is created at call time.
    pub fn event_stream(&self) -> Pin<Box<dyn Stream<Item = AdapterEvent> + Send + 'static>> {
        let rx = self.event_tx.subscribe();
        let protocol = self.protocol;
        Box::pin(async_stream::stream! {
            let mut rx = rx;
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(protocol = %protocol, skipped, "adapter event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Baseline diagnostics shared by every adapter.
    pub fn diagnostics(&self, name: &str, healthy: bool, details: Value) -> AdapterDiagnostics {
        AdapterDiagnostics {
            protocol: self.protocol,
            name: name.to_string(),
            healthy,
            connection: self.connection_status(),
            stats: self.stats(),
            subscriptions: self.subscription_count(),
            details,
            checked_at: Utc::now(),
        }
    }
}

/// Device adapter trait.
///
/// All protocol implementations satisfy this contract so the manager can
/// route operations without knowing which protocol serves a device.
#[async_trait]
pub trait DeviceAdapter: Send + Sync {
    /// Shared adapter state.
    fn core(&self) -> &AdapterCore;

    /// Get the adapter name.
    fn name(&self) -> &str;

    fn protocol(&self) -> Protocol {
        self.core().protocol()
    }

    fn is_connected(&self) -> bool {
        self.core().is_connected()
    }

    fn connection_status(&self) -> ConnectionStatus {
        self.core().connection_status()
    }

    fn stats(&self) -> AdapterStats {
        self.core().stats()
    }

    /// Stream of adapter notifications.
    fn events(&self) -> Pin<Box<dyn Stream<Item = AdapterEvent> + Send + 'static>> {
        self.core().event_stream()
    }

    /// Force the adapter into the disconnected state.
    fn mark_disconnected(&self, reason: &str) {
        self.core().set_disconnected(Some(reason.to_string()));
    }

    /// Connect to the protocol backend.
    async fn initialize(&self) -> AdapterResult<()>;

    /// Disconnect and stop background work.
    async fn disconnect(&self) -> AdapterResult<()>;

    async fn discover_devices(
        &self,
        filters: Option<&DiscoveryFilters>,
    ) -> AdapterResult<Vec<DeviceDiscovery>>;

    async fn get_device_info(&self, device_id: &str) -> AdapterResult<DeviceInfo>;

    /// Send a command. Implementations must record the outcome in the stats.
    async fn send_command(
        &self,
        device_id: &str,
        command: &DeviceCommand,
    ) -> AdapterResult<CommandResult>;

    async fn get_device_status(&self, device_id: &str) -> AdapterResult<DeviceStatusUpdate>;

    async fn subscribe_to_updates(
        &self,
        device_id: &str,
        event_types: Option<Vec<String>>,
        callback: UpdateCallback,
    ) -> AdapterResult<String> {
        if !self.validate_device_id(device_id) {
            return Err(AdapterError::Validation(format!(
                "Invalid {} device id: {}",
                self.protocol(),
                device_id
            )));
        }
        Ok(self.core().subscribe(device_id, event_types, callback))
    }

    async fn unsubscribe_from_updates(&self, subscription_id: &str) -> AdapterResult<bool> {
        Ok(self.core().unsubscribe(subscription_id))
    }

    async fn test_device_connection(&self, device_id: &str) -> AdapterResult<bool>;

    async fn get_diagnostics(&self) -> AdapterResult<AdapterDiagnostics>;

    fn supports_device_type(&self, device_type: DeviceType) -> bool;

    fn supports_capability(&self, capability: &str) -> bool;

    /// Protocol-specific id format check.
    fn validate_device_id(&self, device_id: &str) -> bool;

    /// Check a command's shape before it is sent.
    async fn validate_command(&self, device_id: &str, command: &DeviceCommand) -> AdapterResult<()> {
        if !self.validate_device_id(device_id) {
            return Err(AdapterError::Validation(format!(
                "Invalid {} device id: {}",
                self.protocol(),
                device_id
            )));
        }
        if command.command.trim().is_empty() {
            return Err(AdapterError::Validation(
                "Invalid command: name must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Get this adapter as `Any` for downcasting
    fn as_any(&self) -> &dyn std::any::Any;
}
