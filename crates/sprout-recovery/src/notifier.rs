//! Notification channels for unrecoverable errors.
//!
//! [`LogNotifier`] is the default channel. Email and SMS are placeholders
//! that only log what they would have sent.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use sprout_core::ErrorRecord;

/// Marker attached to every unrecoverable-error notification.
pub const MANUAL_INTERVENTION: &str = "REQUIRES MANUAL INTERVENTION";

/// Delivers a human-visible notification for an error.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn notify(&self, error: &ErrorRecord) -> anyhow::Result<()>;
}

/// Logs the full record at error level.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&self, error: &ErrorRecord) -> anyhow::Result<()> {
        let context = serde_json::to_string(error.context())?;
        let (exception_kind, exception_message, exception_trace) = match error.exception() {
            Some(e) => (e.kind.as_str(), e.message.as_str(), e.trace()),
            None => ("-", "-", String::new()),
        };

        tracing::error!(
            device_id = %error.device_id(),
            code = error.code().unwrap_or("-"),
            severity = %error.severity(),
            correlation_id = error.correlation_id().unwrap_or("-"),
            context = %context,
            exception_kind,
            exception_message,
            exception_trace = %exception_trace,
            timestamp = %error.timestamp(),
            "{}: {}",
            MANUAL_INTERVENTION,
            error.message()
        );
        Ok(())
    }
}

/// Placeholder email channel.
#[derive(Debug, Clone)]
pub struct EmailNotifier {
    recipients: Vec<String>,
}

impl EmailNotifier {
    pub fn new(recipients: Vec<String>) -> Self {
        Self { recipients }
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    fn name(&self) -> &str {
        "email"
    }

    async fn notify(&self, error: &ErrorRecord) -> anyhow::Result<()> {
        tracing::info!(
            recipients = ?self.recipients,
            device_id = %error.device_id(),
            "Email delivery not configured, notification logged only"
        );
        Ok(())
    }
}

/// Placeholder SMS channel.
#[derive(Debug, Clone)]
pub struct SmsNotifier {
    numbers: Vec<String>,
}

impl SmsNotifier {
    pub fn new(numbers: Vec<String>) -> Self {
        Self { numbers }
    }
}

#[async_trait]
impl Notifier for SmsNotifier {
    fn name(&self) -> &str {
        "sms"
    }

    async fn notify(&self, error: &ErrorRecord) -> anyhow::Result<()> {
        tracing::info!(
            numbers = self.numbers.len(),
            device_id = %error.device_id(),
            "SMS delivery not configured, notification logged only"
        );
        Ok(())
    }
}

/// Keeps notified records in memory. Useful in tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryNotifier {
    sent: Arc<Mutex<Vec<ErrorRecord>>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<ErrorRecord> {
        self.sent.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    fn name(&self) -> &str {
        "memory"
    }

    async fn notify(&self, error: &ErrorRecord) -> anyhow::Result<()> {
        self.sent.lock().push(error.clone());
        Ok(())
    }
}

/// Fans a notification out to several channels.
///
/// Every channel is tried; the first failure is returned after all ran.
#[derive(Default, Clone)]
pub struct MultiNotifier {
    channels: Vec<Arc<dyn Notifier>>,
}

impl MultiNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channel(mut self, channel: Arc<dyn Notifier>) -> Self {
        self.channels.push(channel);
        self
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[async_trait]
impl Notifier for MultiNotifier {
    fn name(&self) -> &str {
        "multi"
    }

    async fn notify(&self, error: &ErrorRecord) -> anyhow::Result<()> {
        let mut first_error = None;
        for channel in &self.channels {
            if let Err(e) = channel.notify(error).await {
                tracing::warn!(channel = channel.name(), error = %e, "Notification channel failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
