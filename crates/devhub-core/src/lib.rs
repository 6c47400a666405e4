//! Core types for DevHub.
//!
//! This crate defines the device domain model shared by the adapter layer and
//! the integration service, the hub notification types, and the event bus
//! they travel on.

pub mod device;
pub mod error;
pub mod event;
pub mod eventbus;

pub use device::{
    CommandResult, DeviceCommand, DeviceDiscovery, DeviceInfo, DeviceStatus, DeviceStatusUpdate,
    DeviceType, DiscoveryFilters, NetworkInfo, Protocol, UpdateSource,
};
pub use error::{Error, Result};
pub use event::{EventMetadata, HubEvent};
pub use eventbus::{
    DEFAULT_CHANNEL_CAPACITY, EventBus, EventBusReceiver, FilterBuilder, FilteredReceiver,
    SharedEventBus,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
