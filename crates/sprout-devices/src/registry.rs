//! Device type registry.
//!
//! Maps a stable type name to a factory producing a fresh driver, so a
//! device can be rebuilt from the type name recorded in storage.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::driver::{DeviceDriver, DeviceSpec};
use crate::error::{DeviceError, Result};

/// Creates a driver for a spec. Returns `None` if the spec is not acceptable.
pub type DeviceFactory = Arc<dyn Fn(&DeviceSpec) -> Option<Box<dyn DeviceDriver>> + Send + Sync>;

/// Registry of device factories keyed by type name.
#[derive(Default)]
pub struct DeviceTypeRegistry {
    factories: RwLock<HashMap<String, DeviceFactory>>,
}

impl DeviceTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory, replacing any previous one for the same type.
    pub fn register<F>(&self, type_name: impl Into<String>, factory: F)
    where
        F: Fn(&DeviceSpec) -> Option<Box<dyn DeviceDriver>> + Send + Sync + 'static,
    {
        let type_name = type_name.into();
        tracing::debug!(type_name = %type_name, "Registered device type");
        self.factories.write().insert(type_name, Arc::new(factory));
    }

    pub fn unregister(&self, type_name: &str) -> bool {
        self.factories.write().remove(type_name).is_some()
    }

    pub fn resolve(&self, type_name: &str) -> Option<DeviceFactory> {
        self.factories.read().get(type_name).cloned()
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.read().contains_key(type_name)
    }

    /// Registered type names, sorted.
    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Build a driver for `spec` through the registered factory.
    pub fn instantiate(&self, spec: &DeviceSpec) -> Result<Box<dyn DeviceDriver>> {
        let factory = self
            .resolve(&spec.type_name)
            .ok_or_else(|| DeviceError::UnknownType(spec.type_name.clone()))?;
        factory(spec).ok_or_else(|| DeviceError::FactoryDeclined {
            type_name: spec.type_name.clone(),
            device_id: spec.id.clone(),
        })
    }
}
