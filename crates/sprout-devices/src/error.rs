//! Device error types.

use thiserror::Error;

use crate::state::DeviceState;

/// Result type for device operations.
pub type Result<T> = std::result::Result<T, DeviceError>;

/// Device layer errors.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Device {device_id} cannot {operation} while {state}")]
    InvalidState {
        device_id: String,
        operation: &'static str,
        state: DeviceState,
    },

    #[error("Device {device_id} failed to {operation}: {source}")]
    Lifecycle {
        device_id: String,
        operation: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("Unknown device type: {0}")]
    UnknownType(String),

    #[error("Factory for type {type_name} declined to create device {device_id}")]
    FactoryDeclined { type_name: String, device_id: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Core(#[from] sprout_core::Error),
}
