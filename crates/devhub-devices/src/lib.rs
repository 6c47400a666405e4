//! Device protocol abstraction for DevHub.
//!
//! This crate provides:
//! - The [`DeviceAdapter`] contract every protocol implementation satisfies,
//!   with shared connection/statistics/subscription state in [`AdapterCore`]
//! - Protocol adapters (`adapters::tuya`) and a factory [`AdapterRegistry`]
//! - The [`AdapterManager`], which routes device operations to the adapter
//!   that discovered each device and watches adapter health

pub mod adapter;
pub mod adapters;
pub mod manager;

pub use adapter::{
    AdapterConfig, AdapterCore, AdapterDiagnostics, AdapterError, AdapterEvent, AdapterResult,
    AdapterStats, CommandGate, CommandStats, ConnectionStatus, DeviceAdapter, EventSubscription,
    RateLimitConfig, UpdateCallback,
};
pub use adapters::{
    AdapterFactory, AdapterRegistry, MockAdapter, MockDiagnostics, MockResponse,
    available_adapters,
};
pub use manager::{AdapterManager, DeviceMapEntry, HealthReport, ManagerConfig, ManagerStats};

#[cfg(feature = "tuya")]
pub use adapters::tuya::TuyaAdapter;
