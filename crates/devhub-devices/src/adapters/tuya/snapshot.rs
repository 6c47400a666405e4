//! Tuya device records, change detection and command translation.

use crate::adapter::{AdapterError, AdapterResult};
use devhub_core::{
    DeviceCommand, DeviceDiscovery, DeviceInfo, DeviceStatus, DeviceStatusUpdate, DeviceType,
    NetworkInfo, Protocol, UpdateSource,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// One data point of a device's status list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub code: String,
    #[serde(default)]
    pub value: Value,
}

/// Device record as returned by the device list and device endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuyaDevice {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub product_id: Option<String>,
    #[serde(default)]
    pub product_name: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub ip: Option<String>,
    /// Server-side last update time (epoch seconds)
    #[serde(default)]
    pub update_time: Option<i64>,
    #[serde(default)]
    pub status: Vec<StatusEntry>,
}

impl TuyaDevice {
    pub fn device_type(&self) -> DeviceType {
        device_type_for_category(&self.category)
    }

    pub fn device_status(&self) -> DeviceStatus {
        if self.online {
            DeviceStatus::Online
        } else {
            DeviceStatus::Offline
        }
    }

    /// Status list as a code → value object.
    pub fn state_map(&self) -> Map<String, Value> {
        self.status
            .iter()
            .map(|s| (s.code.clone(), s.value.clone()))
            .collect()
    }

    pub fn status_update(&self, source: UpdateSource) -> DeviceStatusUpdate {
        DeviceStatusUpdate::new(&self.id, self.device_status(), self.state_map(), source)
    }

    pub fn capabilities(&self) -> Vec<String> {
        capabilities_for_codes(self.status.iter().map(|s| s.code.as_str()))
    }

    fn network(&self) -> Option<NetworkInfo> {
        self.ip.as_ref().map(|ip| NetworkInfo {
            ip: Some(ip.clone()),
            ..Default::default()
        })
    }

    fn metadata(&self) -> Value {
        json!({
            "category": self.category,
            "product_id": self.product_id,
            "update_time": self.update_time,
        })
    }

    pub fn to_discovery(&self) -> DeviceDiscovery {
        let mut d = DeviceDiscovery::new(Protocol::Tuya, &self.id, self.device_type(), &self.name)
            .with_capabilities(self.capabilities())
            .with_confidence(if self.online { 1.0 } else { 0.6 });
        d.network = self.network();
        d.metadata = self.metadata();
        d
    }

    pub fn to_info(&self) -> DeviceInfo {
        DeviceInfo {
            protocol: Protocol::Tuya,
            device_id: self.id.clone(),
            device_type: self.device_type(),
            name: self.name.clone(),
            model: self.model.clone().or_else(|| self.product_name.clone()),
            manufacturer: Some("Tuya".to_string()),
            capabilities: self.capabilities(),
            network: self.network(),
            online: self.online,
            metadata: self.metadata(),
        }
    }

    /// First `switch*` code reported by the device.
    fn primary_switch_code(&self) -> Option<&str> {
        self.status
            .iter()
            .map(|s| s.code.as_str())
            .find(|c| c.starts_with("switch"))
    }
}

/// Whether a freshly polled record differs from the cached one.
///
/// Changed when the online flag flips, the server update time differs, the
/// status lists differ in length, or any same-index `(code, value)` pair
/// differs.
pub fn has_device_status_changed(previous: &TuyaDevice, current: &TuyaDevice) -> bool {
    if previous.online != current.online {
        return true;
    }
    if previous.update_time != current.update_time {
        return true;
    }
    if previous.status.len() != current.status.len() {
        return true;
    }
    previous
        .status
        .iter()
        .zip(&current.status)
        .any(|(a, b)| a.code != b.code || a.value != b.value)
}

pub fn device_type_for_category(category: &str) -> DeviceType {
    match category {
        "dj" | "dd" | "fwd" => DeviceType::Light,
        "kg" => DeviceType::Switch,
        "cz" | "pc" => DeviceType::Plug,
        "wk" => DeviceType::Thermostat,
        "ms" => DeviceType::Lock,
        "sp" => DeviceType::Camera,
        "wsdcg" | "pir" | "mcs" => DeviceType::Sensor,
        _ => DeviceType::Unknown,
    }
}

/// Capabilities understood by the adapter.
pub const SUPPORTED_CAPABILITIES: &[&str] = &[
    "on_off",
    "brightness",
    "color",
    "color_temperature",
    "temperature",
    "humidity",
    "target_temperature",
    "motion",
    "contact",
    "battery",
    "power_metering",
    "lock",
];

fn capability_for_code(code: &str) -> Option<&'static str> {
    let cap = match code {
        c if c.starts_with("switch") => "on_off",
        c if c.starts_with("bright_value") => "brightness",
        "colour_data" | "colour_data_v2" => "color",
        c if c.starts_with("temp_value") => "color_temperature",
        "va_temperature" | "temp_current" => "temperature",
        "va_humidity" | "humidity_value" => "humidity",
        "temp_set" => "target_temperature",
        "pir" => "motion",
        "doorcontact_state" => "contact",
        "battery_percentage" | "battery_state" => "battery",
        "cur_power" | "cur_current" | "cur_voltage" => "power_metering",
        c if c.starts_with("unlock") || c == "lock_motor_state" => "lock",
        _ => return None,
    };
    Some(cap)
}

/// Capability names derived from status codes, first occurrence order.
pub fn capabilities_for_codes<'a>(codes: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut caps: Vec<String> = Vec::new();
    for cap in codes.filter_map(capability_for_code) {
        if !caps.iter().any(|c| c == cap) {
            caps.push(cap.to_string());
        }
    }
    caps
}

/// Translate a device command into the `{code, value}` list the API expects.
///
/// `known` is the device's last polled record, used to resolve the
/// `turn_on`/`turn_off` aliases to the device's switch code.
pub fn translate_command(
    command: &DeviceCommand,
    known: Option<&TuyaDevice>,
) -> AdapterResult<Vec<Value>> {
    if let Some(raw) = command.parameters.get("commands") {
        let list = raw.as_array().ok_or_else(|| {
            AdapterError::Validation("Invalid command: 'commands' must be an array".to_string())
        })?;
        if list.iter().any(|c| c.get("code").and_then(Value::as_str).is_none()) {
            return Err(AdapterError::Validation(
                "Invalid command: every entry needs a string 'code'".to_string(),
            ));
        }
        return Ok(list.clone());
    }

    match command.command.as_str() {
        "turn_on" | "turn_off" => {
            let code = known
                .and_then(TuyaDevice::primary_switch_code)
                .unwrap_or("switch_1");
            return Ok(vec![json!({
                "code": code,
                "value": command.command == "turn_on",
            })]);
        }
        _ => {}
    }

    if command.parameters.is_empty() {
        return Ok(vec![json!({ "code": command.command, "value": true })]);
    }

    Ok(command
        .parameters
        .iter()
        .map(|(code, value)| json!({ "code": code, "value": value }))
        .collect())
}

/// State implied by a sent command list.
pub fn state_from_commands(commands: &[Value]) -> Map<String, Value> {
    commands
        .iter()
        .filter_map(|c| {
            let code = c.get("code")?.as_str()?;
            Some((code.to_string(), c.get("value").cloned().unwrap_or(Value::Null)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(online: bool, update_time: i64, status: &[(&str, Value)]) -> TuyaDevice {
        TuyaDevice {
            id: "bf0123456789abcd".into(),
            name: "Desk Lamp".into(),
            category: "dj".into(),
            product_id: None,
            product_name: None,
            model: None,
            online,
            ip: None,
            update_time: Some(update_time),
            status: status
                .iter()
                .map(|(c, v)| StatusEntry {
                    code: c.to_string(),
                    value: v.clone(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_unchanged_when_all_checks_agree() {
        let a = device(true, 100, &[("switch_led", json!(true)), ("bright_value", json!(500))]);
        assert!(!has_device_status_changed(&a, &a.clone()));
    }

    #[test]
    fn test_changed_on_online_flip() {
        let a = device(true, 100, &[("switch_led", json!(true))]);
        let b = device(false, 100, &[("switch_led", json!(true))]);
        assert!(has_device_status_changed(&a, &b));
    }

    #[test]
    fn test_changed_on_update_time() {
        let a = device(true, 100, &[("switch_led", json!(true))]);
        let b = device(true, 101, &[("switch_led", json!(true))]);
        assert!(has_device_status_changed(&a, &b));
    }

    #[test]
    fn test_changed_on_length_mismatch() {
        let a = device(true, 100, &[("switch_led", json!(true))]);
        let b = device(true, 100, &[("switch_led", json!(true)), ("bright_value", json!(10))]);
        assert!(has_device_status_changed(&a, &b));
        assert!(has_device_status_changed(&b, &a));
    }

    #[test]
    fn test_changed_on_same_index_pair() {
        let a = device(true, 100, &[("switch_led", json!(true)), ("bright_value", json!(10))]);
        let value = device(true, 100, &[("switch_led", json!(true)), ("bright_value", json!(11))]);
        let reordered =
            device(true, 100, &[("bright_value", json!(10)), ("switch_led", json!(true))]);
        assert!(has_device_status_changed(&a, &value));
        assert!(has_device_status_changed(&a, &reordered));
    }

    #[test]
    fn test_category_mapping() {
        assert_eq!(device_type_for_category("dj"), DeviceType::Light);
        assert_eq!(device_type_for_category("kg"), DeviceType::Switch);
        assert_eq!(device_type_for_category("cz"), DeviceType::Plug);
        assert_eq!(device_type_for_category("wsdcg"), DeviceType::Sensor);
        assert_eq!(device_type_for_category("zzz"), DeviceType::Unknown);
    }

    #[test]
    fn test_discovery_confidence_and_capabilities() {
        let online = device(true, 1, &[("switch_led", json!(true)), ("bright_value", json!(1))]);
        let d = online.to_discovery();
        assert_eq!(d.confidence, 1.0);
        assert_eq!(d.capabilities, vec!["on_off", "brightness"]);
        assert_eq!(device(false, 1, &[]).to_discovery().confidence, 0.6);
    }

    #[test]
    fn test_translate_parameters_to_codes() {
        let cmd = DeviceCommand::new("set").with_param("bright_value", 300);
        let out = translate_command(&cmd, None).unwrap();
        assert_eq!(out, vec![json!({"code": "bright_value", "value": 300})]);
    }

    #[test]
    fn test_translate_bare_command() {
        let out = translate_command(&DeviceCommand::new("reset"), None).unwrap();
        assert_eq!(out, vec![json!({"code": "reset", "value": true})]);
    }

    #[test]
    fn test_translate_turn_off_uses_switch_code() {
        let known = device(true, 1, &[("bright_value", json!(1)), ("switch_led", json!(true))]);
        let out = translate_command(&DeviceCommand::new("turn_off"), Some(&known)).unwrap();
        assert_eq!(out, vec![json!({"code": "switch_led", "value": false})]);

        let out = translate_command(&DeviceCommand::new("turn_on"), None).unwrap();
        assert_eq!(out, vec![json!({"code": "switch_1", "value": true})]);
    }

    #[test]
    fn test_translate_passthrough_commands() {
        let cmd = DeviceCommand::new("raw").with_param(
            "commands",
            json!([{"code": "switch_1", "value": false}, {"code": "countdown_1", "value": 60}]),
        );
        let out = translate_command(&cmd, None).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(state_from_commands(&out).get("countdown_1"), Some(&json!(60)));

        let bad = DeviceCommand::new("raw").with_param("commands", json!({"code": "x"}));
        assert!(matches!(
            translate_command(&bad, None),
            Err(AdapterError::Validation(_))
        ));
    }
}
