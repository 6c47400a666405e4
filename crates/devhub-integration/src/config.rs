//! Hub configuration.
//!
//! Loaded from a single TOML file:
//!
//! ```toml
//! [[adapters]]
//! protocol = "tuya"
//! auth = { client_id = "...", client_secret = "${TUYA_CLIENT_SECRET}" }
//!
//! [manager]
//! health_check_interval_secs = 60
//!
//! [integration.retry]
//! max_attempts = 3
//! ```
//!
//! `${VAR}` references anywhere in the file are replaced with the value of
//! the environment variable before parsing.

use crate::error::{IntegrationError, Result};
use crate::retry::RetryPolicy;
use devhub_devices::{AdapterConfig, ManagerConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

pub const DEFAULT_CONFIG_PATH: &str = "devhub.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default)]
    pub adapters: Vec<AdapterConfig>,
    #[serde(default)]
    pub manager: ManagerConfig,
    #[serde(default)]
    pub integration: IntegrationConfig,
}

/// Cache lifetimes, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheTtlConfig {
    #[serde(default = "default_status_ttl_secs")]
    pub status_secs: u64,
    #[serde(default = "default_info_ttl_secs")]
    pub device_info_secs: u64,
    #[serde(default = "default_capabilities_ttl_secs")]
    pub capabilities_secs: u64,
    #[serde(default = "default_discovery_ttl_secs")]
    pub discovery_secs: u64,
    #[serde(default = "default_compaction_threshold")]
    pub compaction_threshold: usize,
}

fn default_status_ttl_secs() -> u64 {
    30
}

fn default_info_ttl_secs() -> u64 {
    600
}

fn default_capabilities_ttl_secs() -> u64 {
    300
}

fn default_discovery_ttl_secs() -> u64 {
    120
}

fn default_compaction_threshold() -> usize {
    crate::cache::DEFAULT_COMPACTION_THRESHOLD
}

impl Default for CacheTtlConfig {
    fn default() -> Self {
        Self {
            status_secs: default_status_ttl_secs(),
            device_info_secs: default_info_ttl_secs(),
            capabilities_secs: default_capabilities_ttl_secs(),
            discovery_secs: default_discovery_ttl_secs(),
            compaction_threshold: default_compaction_threshold(),
        }
    }
}

impl CacheTtlConfig {
    pub fn status(&self) -> Duration {
        Duration::from_secs(self.status_secs)
    }

    pub fn device_info(&self) -> Duration {
        Duration::from_secs(self.device_info_secs)
    }

    pub fn capabilities(&self) -> Duration {
        Duration::from_secs(self.capabilities_secs)
    }

    pub fn discovery(&self) -> Duration {
        Duration::from_secs(self.discovery_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationConfig {
    #[serde(default)]
    pub cache: CacheTtlConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Staleness scan period; 0 disables the monitor
    #[serde(default = "default_staleness_interval_secs")]
    pub staleness_interval_secs: u64,
    /// Online devices unseen for longer than this are refreshed
    #[serde(default = "default_staleness_threshold_secs")]
    pub staleness_threshold_secs: u64,
    #[serde(default = "default_command_history_limit")]
    pub command_history_limit: usize,
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
}

fn default_staleness_interval_secs() -> u64 {
    60
}

fn default_staleness_threshold_secs() -> u64 {
    300
}

fn default_command_history_limit() -> usize {
    100
}

fn default_broadcast_capacity() -> usize {
    256
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            cache: CacheTtlConfig::default(),
            retry: RetryPolicy::default(),
            staleness_interval_secs: default_staleness_interval_secs(),
            staleness_threshold_secs: default_staleness_threshold_secs(),
            command_history_limit: default_command_history_limit(),
            broadcast_capacity: default_broadcast_capacity(),
        }
    }
}

impl IntegrationConfig {
    pub fn staleness_interval(&self) -> Duration {
        Duration::from_secs(self.staleness_interval_secs)
    }

    pub fn staleness_threshold(&self) -> Duration {
        Duration::from_secs(self.staleness_threshold_secs)
    }
}

impl HubConfig {
    /// Read, expand and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            IntegrationError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml_str(&raw)?;
        info!(
            category = "config",
            path = %path.display(),
            adapters = config.adapters.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let expanded = expand_env_vars(raw)?;
        let config: HubConfig = toml::from_str(&expanded)
            .map_err(|e| IntegrationError::Config(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for adapter in self.adapters.iter().filter(|a| a.enabled) {
            if adapter.connection_timeout_ms == 0 || adapter.command_timeout_ms == 0 {
                return Err(IntegrationError::Config(format!(
                    "Adapter {} must have non-zero connection and command timeouts",
                    adapter.protocol
                )));
            }
            if let Some(limit) = adapter.rate_limit.as_ref().filter(|l| !l.is_valid()) {
                return Err(IntegrationError::Config(format!(
                    "Adapter {} rate_limit.requests_per_second must be positive, got {}",
                    adapter.protocol, limit.requests_per_second
                )));
            }
        }

        let retry = &self.integration.retry;
        if retry.max_attempts == 0 {
            return Err(IntegrationError::Config(
                "integration.retry.max_attempts must be at least 1".into(),
            ));
        }
        if retry.backoff_factor.is_nan() || retry.backoff_factor < 1.0 {
            return Err(IntegrationError::Config(format!(
                "integration.retry.backoff_factor must be >= 1.0, got {}",
                retry.backoff_factor
            )));
        }
        if self.manager.health_check_interval_secs > 0 && self.manager.health_check_timeout_secs == 0
        {
            return Err(IntegrationError::Config(
                "manager.health_check_timeout_secs must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Configurations of enabled adapters.
    pub fn enabled_adapters(&self) -> impl Iterator<Item = &AdapterConfig> {
        self.adapters.iter().filter(|a| a.enabled)
    }
}

/// Replace `${NAME}` with the value of environment variable `NAME`.
/// Comment lines are left untouched.
fn expand_env_vars(raw: &str) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    for line in raw.split_inclusive('\n') {
        if line.trim_start().starts_with('#') {
            out.push_str(line);
        } else {
            expand_line(line, &mut out)?;
        }
    }
    Ok(out)
}

fn expand_line(line: &str, out: &mut String) -> Result<()> {
    let mut rest = line;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or_else(|| {
            IntegrationError::Config("Unterminated ${...} reference in configuration".into())
        })?;
        let name = &after[..end];
        if name.is_empty() {
            return Err(IntegrationError::Config(
                "Empty ${} reference in configuration".into(),
            ));
        }
        let value = std::env::var(name).map_err(|_| {
            IntegrationError::Config(format!("Environment variable not set: {}", name))
        })?;
        out.push_str(&value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(())
}
