//! Device lifecycle states.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a managed device.
///
/// `Created -> Initializing -> Ready -> Running -> Stopping -> Ready`, with
/// `Error` reachable from any active state and `Disposed` terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    #[default]
    Created,
    Initializing,
    Ready,
    Running,
    Stopping,
    Error,
    Disposed,
}

impl DeviceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Error => "error",
            Self::Disposed => "disposed",
        }
    }

    pub fn can_initialize(&self) -> bool {
        matches!(self, Self::Created | Self::Error)
    }

    pub fn can_start(&self) -> bool {
        matches!(self, Self::Ready | Self::Error)
    }
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
