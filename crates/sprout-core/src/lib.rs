//! Core types for Sprout.
//!
//! This crate defines the error record model, the error monitor and the
//! shared abstractions (clock, configuration, event bus, recovery outcome)
//! used by the device and recovery crates.

pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod eventbus;
pub mod monitor;
pub mod record;
pub mod recovery;

pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use config::{MonitorConfig, RecoveryConfig, SelfHealingConfig, UnrecoverableConfig};
pub use error::{Error, Result};
pub use event::{AlertSeverity, EventMetadata, SproutEvent};
pub use eventbus::{
    EventBus, EventBusReceiver, EventFilter, EventHandler, FilteredReceiver, SharedEventBus,
    SubscriptionId, SubscriptionOptions, DEFAULT_CHANNEL_CAPACITY,
};
pub use monitor::{ErrorFilter, ErrorHandler, ErrorMonitor, SharedErrorMonitor};
pub use record::{codes, ErrorRecord, ErrorRecordBuilder, ExceptionInfo, Severity};
pub use recovery::{backoff_elapsed, backoff_for, RecoveryOrchestrator, RecoveryStatus};

/// Re-exports commonly used types.
pub mod prelude {
    // Configuration
    pub use crate::config::{defaults, env_vars, RecoveryConfig};

    // Error handling
    pub use crate::error::{Error, Result};

    // Time
    pub use crate::clock::{Clock, SharedClock};

    // Records and monitoring
    pub use crate::monitor::{ErrorHandler, ErrorMonitor};
    pub use crate::record::{codes, ErrorRecord, Severity};
    pub use crate::recovery::{RecoveryOrchestrator, RecoveryStatus};

    // Event bus
    pub use crate::event::SproutEvent;
    pub use crate::eventbus::{EventBus, SharedEventBus};
}
