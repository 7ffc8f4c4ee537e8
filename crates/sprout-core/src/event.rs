//! Events carried by the event bus.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::record::{ErrorRecord, Severity};

/// Alert severity as seen by event bus consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Error,
    Critical,
}

impl From<Severity> for AlertSeverity {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Warning => Self::Warning,
            Severity::Error => Self::Error,
            Severity::Critical | Severity::Catastrophic => Self::Critical,
        }
    }
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

/// Events published on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SproutEvent {
    /// A device reported a fault.
    DeviceAlert {
        device_id: String,
        error_code: Option<String>,
        severity: AlertSeverity,
        message: String,
        correlation_id: Option<String>,
        timestamp: i64,
    },
    /// Application traffic the recovery core does not interpret.
    Custom {
        kind: String,
        payload: serde_json::Value,
        timestamp: i64,
    },
}

impl SproutEvent {
    /// Derive the alert event for an error record.
    pub fn alert_for(record: &ErrorRecord) -> Self {
        Self::DeviceAlert {
            device_id: record.device_id().to_string(),
            error_code: record.code().map(str::to_string),
            severity: record.severity().into(),
            message: record.message().to_string(),
            correlation_id: record.correlation_id().map(str::to_string),
            timestamp: record.timestamp().timestamp(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::DeviceAlert { .. } => "DeviceAlert",
            Self::Custom { .. } => "Custom",
        }
    }

    pub fn is_alert_event(&self) -> bool {
        matches!(self, Self::DeviceAlert { .. })
    }

    pub fn device_id(&self) -> Option<&str> {
        match self {
            Self::DeviceAlert { device_id, .. } => Some(device_id),
            Self::Custom { .. } => None,
        }
    }
}

/// Metadata attached to every published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub event_id: Uuid,
    pub source: String,
    pub timestamp: i64,
}

impl EventMetadata {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            source: source.into(),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_mapping() {
        assert_eq!(AlertSeverity::from(Severity::Warning), AlertSeverity::Warning);
        assert_eq!(AlertSeverity::from(Severity::Error), AlertSeverity::Error);
        assert_eq!(AlertSeverity::from(Severity::Critical), AlertSeverity::Critical);
        assert_eq!(
            AlertSeverity::from(Severity::Catastrophic),
            AlertSeverity::Critical
        );
    }

    #[test]
    fn test_alert_for_record() {
        let record = ErrorRecord::builder("sensor-3", "reading out of range")
            .code("MOISTURE_RANGE")
            .severity(Severity::Catastrophic)
            .correlation_id("chain-1")
            .build();

        match SproutEvent::alert_for(&record) {
            SproutEvent::DeviceAlert {
                device_id,
                error_code,
                severity,
                correlation_id,
                ..
            } => {
                assert_eq!(device_id, "sensor-3");
                assert_eq!(error_code.as_deref(), Some("MOISTURE_RANGE"));
                assert_eq!(severity, AlertSeverity::Critical);
                assert_eq!(correlation_id.as_deref(), Some("chain-1"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
