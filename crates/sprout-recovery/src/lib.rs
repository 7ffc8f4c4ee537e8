//! System-wide recovery for Sprout.
//!
//! - [`StrategyOrchestrator`]: ordered recovery strategies tried before anything else
//! - [`ComponentRecoveryService`]: rebuilds a device from its persisted snapshot
//! - [`RecoveryManagerService`]: combines both paths and keeps recovery statistics
//! - [`UnrecoverableErrorHandler`]: throttled notifications for errors needing an operator

pub mod component;
pub mod error;
pub mod manager;
pub mod notifier;
pub mod orchestrator;
pub mod unrecoverable;

pub use component::ComponentRecoveryService;
pub use error::{RecoveryError, Result};
pub use manager::{
    CodeStatistics, RecoveryHistory, RecoveryManagerService, RecoveryStatistics,
    COMPONENT_RECOVERY, DEVICE_RECOVERY, ORCHESTRATED_RECOVERY,
};
pub use notifier::{
    EmailNotifier, LogNotifier, MemoryNotifier, MultiNotifier, Notifier, SmsNotifier,
    MANUAL_INTERVENTION,
};
pub use orchestrator::{RecoveryStrategy, RestartDeviceStrategy, StrategyOrchestrator};
pub use unrecoverable::{is_unrecoverable, UnrecoverableErrorHandler};
