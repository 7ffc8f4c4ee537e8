//! Recovery error types.

use sprout_devices::DeviceError;
use thiserror::Error;

/// Result type for recovery operations.
pub type Result<T> = std::result::Result<T, RecoveryError>;

/// Reasons a recovery step fails.
///
/// Public recovery operations report failure as a boolean or an unsuccessful
/// status; these errors are what gets logged along the way.
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("No persisted properties for device {0}")]
    NoPersistedState(String),

    #[error("No recorded type name for device {0}")]
    MissingTypeName(String),

    #[error("Recovery already in progress for device {0}")]
    InFlight(String),

    #[error("Recovery throttled for device {device_id} ({remaining_secs}s remaining)")]
    Throttled {
        device_id: String,
        remaining_secs: i64,
    },

    #[error("Handler is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Device(#[from] DeviceError),
}
