//! Device driver contract.
//!
//! A driver holds the device-specific behavior (pump, moisture sensor, ...).
//! [`ManagedDevice`](crate::device::ManagedDevice) wraps it with the lifecycle
//! state machine and self-healing logic, so drivers only implement hooks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identity passed to device factories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub id: String,
    pub name: String,
    pub type_name: String,
}

impl DeviceSpec {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        type_name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

/// Device-specific hooks.
///
/// Hooks take `&self`; drivers keep mutable state behind their own locks.
#[async_trait]
pub trait DeviceDriver: Send + Sync {
    /// Stable type identifier, used to reconstruct the device from storage.
    fn type_name(&self) -> &str;

    async fn on_initialize(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_stop(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Device-specific recovery. Returns whether the device is healthy again.
    ///
    /// Defaults to re-running initialization.
    async fn on_recover(&self) -> anyhow::Result<bool> {
        self.on_initialize().await.map(|_| true)
    }

    /// Current persisted properties.
    fn properties(&self) -> Value {
        Value::Null
    }

    /// Restore properties from a persisted snapshot.
    fn load_properties(&self, _properties: &Value) -> anyhow::Result<()> {
        Ok(())
    }
}
