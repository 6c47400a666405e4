//! Notification types that flow through the event bus.
//!
//! The adapter manager publishes these; the integration service and any
//! outer transport subscribe to the ones they care about.

use crate::device::{DeviceStatusUpdate, Protocol};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Hub-wide notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HubEvent {
    /// A device reported a state or status change.
    DeviceUpdate { update: DeviceStatusUpdate },

    /// An adapter finished connecting.
    AdapterConnected { protocol: Protocol, timestamp: i64 },

    /// An adapter lost its connection.
    AdapterDisconnected {
        protocol: Protocol,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        timestamp: i64,
    },

    /// An adapter reported an error that did not change its connection state.
    AdapterError {
        protocol: Protocol,
        error: String,
        timestamp: i64,
    },

    /// A periodic health check failed or timed out.
    AdapterHealthCheckFailed {
        protocol: Protocol,
        error: String,
        timestamp: i64,
    },

    /// A health check passed after a previous failure.
    AdapterRecovered { protocol: Protocol, timestamp: i64 },
}

impl HubEvent {
    /// Get the event type name.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::DeviceUpdate { .. } => "deviceUpdate",
            Self::AdapterConnected { .. } => "adapterConnected",
            Self::AdapterDisconnected { .. } => "adapterDisconnected",
            Self::AdapterError { .. } => "adapterError",
            Self::AdapterHealthCheckFailed { .. } => "adapterHealthCheckFailed",
            Self::AdapterRecovered { .. } => "adapterRecovered",
        }
    }

    /// Protocol the event concerns, if it is an adapter event.
    pub fn protocol(&self) -> Option<Protocol> {
        match self {
            Self::DeviceUpdate { .. } => None,
            Self::AdapterConnected { protocol, .. }
            | Self::AdapterDisconnected { protocol, .. }
            | Self::AdapterError { protocol, .. }
            | Self::AdapterHealthCheckFailed { protocol, .. }
            | Self::AdapterRecovered { protocol, .. } => Some(*protocol),
        }
    }

    /// Device id, if it is a device event.
    pub fn device_id(&self) -> Option<&str> {
        match self {
            Self::DeviceUpdate { update } => Some(&update.device_id),
            _ => None,
        }
    }

    pub fn is_device_event(&self) -> bool {
        matches!(self, Self::DeviceUpdate { .. })
    }

    pub fn is_adapter_event(&self) -> bool {
        !self.is_device_event()
    }
}

impl fmt::Display for HubEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeviceUpdate { update } => {
                write!(f, "deviceUpdate({} -> {})", update.device_id, update.status)
            }
            other => match other.protocol() {
                Some(p) => write!(f, "{}({})", other.type_name(), p),
                None => f.write_str(other.type_name()),
            },
        }
    }
}

/// Event metadata.
///
/// Attached to each event for tracking and correlation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Unique event ID
    pub event_id: String,
    /// Optional correlation ID (for grouping related events)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Event source (component that published)
    pub source: String,
    /// Event timestamp
    pub timestamp: i64,
}

impl EventMetadata {
    /// Create new event metadata.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            correlation_id: None,
            source: source.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Create with a specific correlation ID.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}
