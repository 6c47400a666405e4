//! Device integration layer for DevHub.
//!
//! [`DeviceIntegrationService`] is what the rest of the hub calls to work
//! with devices. It wraps the adapter manager with a read cache, retrying
//! command execution, fallback status reads and a staleness monitor, and
//! pushes every status change to a [`Broadcaster`].
//!
//! Persistence and client fan-out are collaborators behind the
//! [`DeviceStore`] and [`Broadcaster`] traits.

pub mod broadcaster;
pub mod cache;
pub mod config;
pub mod error;
pub mod retry;
pub mod service;
pub mod store;

pub use broadcaster::{Broadcaster, ChannelBroadcaster};
pub use cache::{CachePayload, TtlCache};
pub use config::{CacheTtlConfig, DEFAULT_CONFIG_PATH, HubConfig, IntegrationConfig};
pub use error::{IntegrationError, Result, StoreError};
pub use retry::{NON_RETRYABLE_PATTERNS, RetryPolicy, is_non_retryable};
pub use service::{
    AttemptRecord, CommandExecution, DeviceDiagnostics, DeviceIntegrationService, DevicePatch,
    DeviceRegistration, ExecutionState, ServiceStats,
};
pub use store::{DeviceRecord, DeviceStore, InMemoryDeviceStore};
