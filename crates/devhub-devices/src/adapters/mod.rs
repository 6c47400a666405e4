//! Protocol adapter implementations and the factory registry.
//!
//! ## Feature Flags
//!
//! | Feature | Description |
//! |---------|-------------|
//! | `tuya` | Tuya cloud adapter (default) |
//!
//! Adding a protocol means registering a factory for its [`Protocol`] id;
//! existing adapters and the manager stay untouched.

pub mod mock;
pub use mock::{MockAdapter, MockCalls, MockDiagnostics, MockResponse};

#[cfg(feature = "tuya")]
pub mod tuya;
#[cfg(feature = "tuya")]
pub use tuya::{TuyaAdapter, create_tuya_adapter};

use crate::adapter::{AdapterConfig, AdapterError, AdapterResult, DeviceAdapter};
use devhub_core::Protocol;
use std::collections::HashMap;
use std::sync::Arc;

/// Constructor for one protocol's adapter.
pub type AdapterFactory =
    Arc<dyn Fn(Arc<AdapterConfig>) -> AdapterResult<Arc<dyn DeviceAdapter>> + Send + Sync>;

/// Map from protocol id to adapter factory, populated at startup.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    factories: HashMap<Protocol, AdapterFactory>,
}

impl AdapterRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every adapter compiled into this build.
    pub fn with_defaults() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::new();
        #[cfg(feature = "tuya")]
        registry.register(Protocol::Tuya, create_tuya_adapter);
        registry
    }

    /// Register (or replace) the factory for a protocol.
    pub fn register<F>(&mut self, protocol: Protocol, factory: F) -> &mut Self
    where
        F: Fn(Arc<AdapterConfig>) -> AdapterResult<Arc<dyn DeviceAdapter>> + Send + Sync + 'static,
    {
        if self.factories.insert(protocol, Arc::new(factory)).is_some() {
            tracing::debug!(protocol = %protocol, "replaced adapter factory");
        }
        self
    }

    pub fn is_registered(&self, protocol: Protocol) -> bool {
        self.factories.contains_key(&protocol)
    }

    /// Registered protocols, sorted.
    pub fn protocols(&self) -> Vec<Protocol> {
        let mut protocols: Vec<Protocol> = self.factories.keys().copied().collect();
        protocols.sort();
        protocols
    }

    /// Instantiate the adapter for a configuration.
    pub fn create(&self, config: Arc<AdapterConfig>) -> AdapterResult<Arc<dyn DeviceAdapter>> {
        let factory = self.factories.get(&config.protocol).ok_or_else(|| {
            AdapterError::Configuration(format!(
                "No adapter registered for protocol: {}. Registered: {:?}",
                config.protocol,
                self.protocols()
            ))
        })?;
        factory(config)
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("protocols", &self.protocols())
            .finish()
    }
}

/// Get list of adapter protocols compiled into this build.
pub fn available_adapters() -> Vec<&'static str> {
    #[allow(unused_mut)]
    let mut adapters = Vec::new();

    #[cfg(feature = "tuya")]
    adapters.push(Protocol::Tuya.as_str());

    adapters
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unregistered_protocol_is_configuration_error() {
        let registry = AdapterRegistry::new();
        let result = registry.create(Arc::new(AdapterConfig::new(Protocol::Zigbee)));
        assert!(matches!(result, Err(AdapterError::Configuration(_))));
    }

    #[test]
    fn test_register_factory() {
        let mut registry = AdapterRegistry::new();
        registry.register(Protocol::Zigbee, |config| {
            Ok(Arc::new(MockAdapter::with_config(config)) as Arc<dyn DeviceAdapter>)
        });

        assert!(registry.is_registered(Protocol::Zigbee));
        let adapter = registry
            .create(Arc::new(AdapterConfig::new(Protocol::Zigbee)))
            .unwrap();
        assert_eq!(adapter.protocol(), Protocol::Zigbee);
    }

    #[cfg(feature = "tuya")]
    #[test]
    fn test_defaults_include_tuya() {
        let registry = AdapterRegistry::with_defaults();
        assert_eq!(registry.protocols(), vec![Protocol::Tuya]);
        assert_eq!(available_adapters(), vec!["tuya"]);
    }
}
