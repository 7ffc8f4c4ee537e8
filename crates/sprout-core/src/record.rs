//! Error record model.
//!
//! An [`ErrorRecord`] describes one reported fault. Identity fields (device,
//! code, severity) are fixed at construction; the attempt counter and the
//! handled flag only change through the [`ErrorMonitor`](crate::monitor::ErrorMonitor).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Well-known error codes.
pub mod codes {
    pub const RECOVERY_LIMIT_EXCEEDED: &str = "RECOVERY_LIMIT_EXCEEDED";
    pub const RECOVERY_EXCEPTION: &str = "RECOVERY_EXCEPTION";
    pub const HARDWARE_FAILURE: &str = "HARDWARE_FAILURE";
    pub const CONFIGURATION_INVALID: &str = "CONFIGURATION_INVALID";
    pub const DEPENDENCY_UNRECOVERABLE: &str = "DEPENDENCY_UNRECOVERABLE";
    pub const DATA_CORRUPTION: &str = "DATA_CORRUPTION";
    pub const INITIALIZATION_FAILED: &str = "INITIALIZATION_FAILED";
    pub const START_FAILED: &str = "START_FAILED";
    pub const STOP_FAILED: &str = "STOP_FAILED";

    /// Codes that are never healed automatically, whatever the record's flags say.
    pub const UNRECOVERABLE: &[&str] = &[
        HARDWARE_FAILURE,
        CONFIGURATION_INVALID,
        RECOVERY_LIMIT_EXCEEDED,
        DEPENDENCY_UNRECOVERABLE,
        DATA_CORRUPTION,
    ];

    pub fn is_unrecoverable(code: &str) -> bool {
        UNRECOVERABLE.contains(&code)
    }
}

/// Error severity, ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning = 0,
    #[default]
    Error = 1,
    Critical = 2,
    Catastrophic = 3,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
            Self::Catastrophic => "catastrophic",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "warning" | "warn" => Some(Self::Warning),
            "error" => Some(Self::Error),
            "critical" | "crit" => Some(Self::Critical),
            "catastrophic" | "fatal" => Some(Self::Catastrophic),
            _ => None,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Captured description of the failure that caused a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionInfo {
    /// Short type label for the failure.
    pub kind: String,
    /// Top-level message.
    pub message: String,
    /// Cause chain, outermost first (excluding `message`).
    pub chain: Vec<String>,
}

impl ExceptionInfo {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            chain: Vec::new(),
        }
    }

    /// Capture an `anyhow::Error` with its cause chain.
    pub fn from_anyhow(kind: impl Into<String>, err: &anyhow::Error) -> Self {
        Self {
            kind: kind.into(),
            message: err.to_string(),
            chain: err.chain().skip(1).map(|c| c.to_string()).collect(),
        }
    }

    /// Cause chain rendered as a multi-line trace.
    pub fn trace(&self) -> String {
        self.chain
            .iter()
            .enumerate()
            .map(|(i, c)| format!("  {}: {}", i, c))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// One reported fault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    id: Uuid,
    device_id: String,
    error_code: Option<String>,
    severity: Severity,
    message: String,
    source: Option<String>,
    context: HashMap<String, serde_json::Value>,
    exception: Option<ExceptionInfo>,
    is_recoverable: bool,
    is_transient: bool,
    correlation_id: Option<String>,
    recovery_attempt_count: u32,
    handled: bool,
    timestamp: DateTime<Utc>,
}

impl ErrorRecord {
    /// Start building a record for `device_id`.
    pub fn builder(device_id: impl Into<String>, message: impl Into<String>) -> ErrorRecordBuilder {
        ErrorRecordBuilder::new(device_id, message)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Error code, if the record carries a non-empty one.
    pub fn code(&self) -> Option<&str> {
        self.error_code.as_deref().filter(|c| !c.is_empty())
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn context(&self) -> &HashMap<String, serde_json::Value> {
        &self.context
    }

    pub fn exception(&self) -> Option<&ExceptionInfo> {
        self.exception.as_ref()
    }

    /// Recoverable flag, after the fixed unrecoverable codes are applied.
    pub fn is_recoverable(&self) -> bool {
        self.is_recoverable && !self.code().is_some_and(codes::is_unrecoverable)
    }

    pub fn is_transient(&self) -> bool {
        self.is_transient
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn recovery_attempt_count(&self) -> u32 {
        self.recovery_attempt_count
    }

    pub fn is_handled(&self) -> bool {
        self.handled
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Whether automatic recovery may still be attempted for this record.
    ///
    /// One attempt past `max_attempts` is allowed so the device reaches its
    /// own ceiling and escalates.
    pub fn is_eligible_for_recovery(&self, max_attempts: u32) -> bool {
        self.is_recoverable() && self.code().is_some() && self.recovery_attempt_count <= max_attempts
    }

    /// Key identifying the (device, code) pair; code-less records use `"unknown"`.
    pub fn key(&self) -> (String, String) {
        (
            self.device_id.clone(),
            self.code().unwrap_or("unknown").to_string(),
        )
    }

    pub(crate) fn set_recovery_attempt_count(&mut self, count: u32) {
        self.recovery_attempt_count = count;
    }

    pub(crate) fn increment_recovery_attempts(&mut self) -> u32 {
        self.recovery_attempt_count = self.recovery_attempt_count.saturating_add(1);
        self.recovery_attempt_count
    }

    pub(crate) fn mark_handled(&mut self) {
        self.handled = true;
    }
}

impl std::fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {} {}: {}",
            self.severity,
            self.device_id,
            self.code().unwrap_or("-"),
            self.message
        )
    }
}

/// Builder for [`ErrorRecord`].
#[derive(Debug, Clone)]
pub struct ErrorRecordBuilder {
    record: ErrorRecord,
}

impl ErrorRecordBuilder {
    fn new(device_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            record: ErrorRecord {
                id: Uuid::new_v4(),
                device_id: device_id.into(),
                error_code: None,
                severity: Severity::Error,
                message: message.into(),
                source: None,
                context: HashMap::new(),
                exception: None,
                is_recoverable: true,
                is_transient: false,
                correlation_id: None,
                recovery_attempt_count: 0,
                handled: false,
                timestamp: Utc::now(),
            },
        }
    }

    /// Start from an existing record, keeping its identity.
    pub fn from_record(record: ErrorRecord) -> Self {
        Self { record }
    }

    pub fn device_id(mut self, device_id: impl Into<String>) -> Self {
        self.record.device_id = device_id.into();
        self
    }

    pub fn code(mut self, code: impl Into<String>) -> Self {
        self.record.error_code = Some(code.into());
        self
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.record.severity = severity;
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.record.source = Some(source.into());
        self
    }

    pub fn context(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.record.context.insert(key.into(), value.into());
        self
    }

    pub fn exception(mut self, exception: ExceptionInfo) -> Self {
        self.record.exception = Some(exception);
        self
    }

    pub fn recoverable(mut self, recoverable: bool) -> Self {
        self.record.is_recoverable = recoverable;
        self
    }

    pub fn transient(mut self, transient: bool) -> Self {
        self.record.is_transient = transient;
        self
    }

    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.record.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.record.timestamp = timestamp;
        self
    }

    pub fn build(mut self) -> ErrorRecord {
        if self
            .record
            .error_code
            .as_deref()
            .is_some_and(codes::is_unrecoverable)
        {
            self.record.is_recoverable = false;
        }
        self.record
    }
}
