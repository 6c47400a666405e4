//! Shared device domain types.
//!
//! These types cross every layer: adapters produce them, the manager routes
//! them and the integration service caches, persists and broadcasts them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Protocol identifier.
///
/// Only protocols with a registered adapter factory can be instantiated;
/// the remaining variants are reserved so configuration and routing can
/// name them before an implementation exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Cloud-polled Tuya OpenAPI
    Tuya,
    /// Zigbee coordinator (reserved)
    Zigbee,
    /// Z-Wave controller (reserved)
    Zwave,
    /// Matter fabric (reserved)
    Matter,
    /// MQTT broker (reserved)
    Mqtt,
}

impl Protocol {
    /// All known protocol identifiers.
    pub const ALL: [Protocol; 5] = [
        Protocol::Tuya,
        Protocol::Zigbee,
        Protocol::Zwave,
        Protocol::Matter,
        Protocol::Mqtt,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tuya => "tuya",
            Self::Zigbee => "zigbee",
            Self::Zwave => "zwave",
            Self::Matter => "matter",
            Self::Mqtt => "mqtt",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Protocol::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| crate::Error::Validation(format!("Unknown protocol: {}", s)))
    }
}

/// Device category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Light,
    Switch,
    Plug,
    Sensor,
    Thermostat,
    Lock,
    Camera,
    Unknown,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Switch => "switch",
            Self::Plug => "plug",
            Self::Sensor => "sensor",
            Self::Thermostat => "thermostat",
            Self::Lock => "lock",
            Self::Camera => "camera",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = match s.trim().to_ascii_lowercase().as_str() {
            "light" => Self::Light,
            "switch" => Self::Switch,
            "plug" => Self::Plug,
            "sensor" => Self::Sensor,
            "thermostat" => Self::Thermostat,
            "lock" => Self::Lock,
            "camera" => Self::Camera,
            "unknown" => Self::Unknown,
            other => {
                return Err(crate::Error::Validation(format!(
                    "Unknown device type: {}",
                    other
                )));
            }
        };
        Ok(t)
    }
}

/// Reported device status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
    Error,
    #[default]
    Unknown,
}

impl DeviceStatus {
    pub fn is_online(&self) -> bool {
        matches!(self, Self::Online)
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
            Self::Error => write!(f, "error"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Network details reported for a device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_strength: Option<i32>,
}

/// Point lookup result for a single device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub protocol: Protocol,
    /// External (protocol-side) device identifier
    pub device_id: String,
    pub device_type: DeviceType,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    pub capabilities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkInfo>,
    pub online: bool,
    #[serde(default)]
    pub metadata: Value,
}

/// Candidate device produced by a discovery scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDiscovery {
    pub protocol: Protocol,
    pub device_id: String,
    pub device_type: DeviceType,
    pub name: String,
    pub capabilities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkInfo>,
    /// Confidence score (0.0 to 1.0)
    pub confidence: f32,
    pub discovered_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Value,
}

impl DeviceDiscovery {
    pub fn new(
        protocol: Protocol,
        device_id: impl Into<String>,
        device_type: DeviceType,
        name: impl Into<String>,
    ) -> Self {
        Self {
            protocol,
            device_id: device_id.into(),
            device_type,
            name: name.into(),
            capabilities: Vec::new(),
            network: None,
            confidence: 1.0,
            discovered_at: Utc::now(),
            metadata: Value::Null,
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Set the confidence, clamped into `0.0..=1.0`.
    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }
}

/// Filters applied to a discovery scan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryFilters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_type: Option<DeviceType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    #[serde(default)]
    pub online_only: bool,
}

impl DiscoveryFilters {
    pub fn by_type(device_type: DeviceType) -> Self {
        Self {
            device_type: Some(device_type),
            ..Default::default()
        }
    }

    /// Check whether a discovery candidate passes these filters.
    pub fn matches(&self, device: &DeviceDiscovery, online: bool) -> bool {
        if let Some(t) = self.device_type {
            if device.device_type != t {
                return false;
            }
        }
        if let Some(cap) = &self.capability {
            if !device.capabilities.iter().any(|c| c == cap) {
                return false;
            }
        }
        !self.online_only || online
    }
}

/// Origin of a status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateSource {
    /// Change detected by an adapter's polling loop
    Poll,
    /// Direct status query against the adapter
    Query,
    /// Side effect of a successful command
    Command,
    /// Last known persisted state, used when the adapter could not answer
    Fallback,
}

/// Status change for a device, as emitted by adapters and the integration service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatusUpdate {
    pub device_id: String,
    pub status: DeviceStatus,
    pub state: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
    pub source: UpdateSource,
}

impl DeviceStatusUpdate {
    pub fn new(
        device_id: impl Into<String>,
        status: DeviceStatus,
        state: Map<String, Value>,
        source: UpdateSource,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            status,
            state,
            timestamp: Utc::now(),
            source,
        }
    }
}

/// A command addressed to a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCommand {
    pub command: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl DeviceCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            parameters: Map::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_parameters(mut self, parameters: Map<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }
}

/// Terminal artifact of one command attempt sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    pub response_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retry_count: u32,
}

impl CommandResult {
    pub fn success(result: Option<Value>, response_time_ms: u64) -> Self {
        Self {
            success: true,
            timestamp: Utc::now(),
            response_time_ms,
            result,
            error: None,
            retry_count: 0,
        }
    }

    pub fn failure(error: impl Into<String>, response_time_ms: u64) -> Self {
        Self {
            success: false,
            timestamp: Utc::now(),
            response_time_ms,
            result: None,
            error: Some(error.into()),
            retry_count: 0,
        }
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// State fragment carried by the result, if the adapter returned one.
    pub fn state_fragment(&self) -> Option<&Map<String, Value>> {
        self.result
            .as_ref()
            .and_then(|r| r.get("state"))
            .and_then(Value::as_object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_protocol_round_trip_str() {
        for p in Protocol::ALL {
            assert_eq!(p.as_str().parse::<Protocol>().unwrap(), p);
        }
        assert!("bluetooth".parse::<Protocol>().is_err());
        assert_eq!(" TUYA ".parse::<Protocol>().unwrap(), Protocol::Tuya);
    }

    #[test]
    fn test_protocol_serde_lowercase() {
        let v = serde_json::to_value(Protocol::Zwave).unwrap();
        assert_eq!(v, json!("zwave"));
    }

    #[test]
    fn test_discovery_confidence_clamped() {
        let d = DeviceDiscovery::new(Protocol::Tuya, "abc", DeviceType::Light, "Lamp")
            .with_confidence(1.7);
        assert_eq!(d.confidence, 1.0);
    }

    #[test]
    fn test_discovery_filters() {
        let d = DeviceDiscovery::new(Protocol::Tuya, "abc", DeviceType::Light, "Lamp")
            .with_capabilities(vec!["on_off".into(), "brightness".into()]);

        assert!(DiscoveryFilters::default().matches(&d, false));
        assert!(DiscoveryFilters::by_type(DeviceType::Light).matches(&d, true));
        assert!(!DiscoveryFilters::by_type(DeviceType::Lock).matches(&d, true));

        let filters = DiscoveryFilters {
            capability: Some("color".into()),
            ..Default::default()
        };
        assert!(!filters.matches(&d, true));

        let filters = DiscoveryFilters {
            online_only: true,
            ..Default::default()
        };
        assert!(!filters.matches(&d, false));
    }

    #[test]
    fn test_command_result_state_fragment() {
        let result = CommandResult::success(Some(json!({"state": {"switch_1": true}})), 12);
        assert_eq!(
            result.state_fragment().and_then(|s| s.get("switch_1")),
            Some(&json!(true))
        );
        assert!(CommandResult::failure("boom", 5).state_fragment().is_none());
    }
}
