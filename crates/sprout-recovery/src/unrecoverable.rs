//! Escalation of errors that automatic recovery cannot fix.
//!
//! The handler listens to the monitor for unrecoverable records and sends one
//! notification per (device, code) per cooldown window. A periodic sweep
//! re-scans recent records to catch anything reported before the subscription
//! existed.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use sprout_core::{
    codes, ErrorFilter, ErrorHandler, ErrorMonitor, ErrorRecord, Severity, SharedClock,
    SubscriptionId, UnrecoverableConfig,
};

use crate::error::{RecoveryError, Result};
use crate::notifier::{LogNotifier, Notifier};

/// Whether `error` needs a human.
pub fn is_unrecoverable(error: &ErrorRecord) -> bool {
    error.severity() >= Severity::Critical
        || error.code().is_some_and(codes::is_unrecoverable)
        || !error.is_recoverable()
}

struct Running {
    subscription: SubscriptionId,
    shutdown: watch::Sender<bool>,
    sweep: JoinHandle<()>,
}

/// Notifies operators about unrecoverable errors.
pub struct UnrecoverableErrorHandler {
    monitor: Arc<ErrorMonitor>,
    notifier: Arc<dyn Notifier>,
    clock: SharedClock,
    config: UnrecoverableConfig,
    /// (device, code) -> last notification time
    last_notified: Mutex<HashMap<(String, String), DateTime<Utc>>>,
    running: parking_lot::Mutex<Option<Running>>,
}

impl UnrecoverableErrorHandler {
    pub fn new(monitor: Arc<ErrorMonitor>, clock: SharedClock, config: UnrecoverableConfig) -> Self {
        Self {
            monitor,
            notifier: Arc::new(LogNotifier),
            clock,
            config,
            last_notified: Mutex::new(HashMap::new()),
            running: parking_lot::Mutex::new(None),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn config(&self) -> &UnrecoverableConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Last notification time for a (device, code) pair.
    pub async fn last_notified(&self, device_id: &str, code: &str) -> Option<DateTime<Utc>> {
        self.last_notified
            .lock()
            .await
            .get(&(device_id.to_string(), code.to_string()))
            .copied()
    }

    /// Notify about `error` unless it is recoverable or its pair is cooling down.
    ///
    /// Returns whether a notification went out.
    pub async fn handle_error(&self, error: &ErrorRecord) -> bool {
        if !is_unrecoverable(error) {
            return false;
        }

        let key = error.key();
        let now = self.clock.now();
        {
            let mut last_notified = self.last_notified.lock().await;
            if let Some(last) = last_notified.get(&key) {
                if now - *last < self.config.cooldown() {
                    tracing::debug!(
                        device_id = %key.0,
                        code = %key.1,
                        "Unrecoverable error notification suppressed"
                    );
                    return false;
                }
            }
            last_notified.insert(key.clone(), now);
        }

        match self.notifier.notify(error).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    device_id = %key.0,
                    code = %key.1,
                    channel = self.notifier.name(),
                    error = %e,
                    "Failed to deliver unrecoverable error notification"
                );
                let mut last_notified = self.last_notified.lock().await;
                if last_notified.get(&key) == Some(&now) {
                    last_notified.remove(&key);
                }
                false
            }
        }
    }

    /// Re-scan the most recent records once. Returns the number of notifications sent.
    pub async fn sweep_once(&self) -> usize {
        let recent = self
            .monitor
            .get_recent_errors(self.config.sweep_batch_size)
            .await;

        let mut notified = 0;
        for error in recent
            .iter()
            .filter(|e| !e.is_handled() && is_unrecoverable(e))
        {
            if self.handle_error(error).await {
                notified += 1;
            }
        }

        if notified > 0 {
            tracing::info!(notified, "Sweep found unrecoverable errors");
        }
        notified
    }

    /// Subscribe to the monitor and start the sweep loop.
    ///
    /// The first sweep runs immediately.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(RecoveryError::AlreadyRunning);
        }

        let filter: ErrorFilter = Arc::new(is_unrecoverable);
        let subscription = self.monitor.subscribe(
            Arc::new(HandlerSubscriber {
                handler: Arc::downgrade(self),
            }),
            Some(filter),
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        let sweep = tokio::spawn(sweep_loop(
            Arc::downgrade(self),
            self.config.sweep_interval(),
            shutdown_rx,
        ));

        *running = Some(Running {
            subscription,
            shutdown,
            sweep,
        });
        tracing::info!(
            interval_secs = self.config.sweep_interval_secs,
            batch = self.config.sweep_batch_size,
            "Unrecoverable error handler started"
        );
        Ok(())
    }

    /// Stop the sweep loop and unsubscribe. Does nothing when not running.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        let Some(running) = running else {
            return;
        };

        let _ = running.shutdown.send(true);
        if let Err(e) = running.sweep.await {
            tracing::warn!(error = %e, "Sweep task ended abnormally");
        }
        self.monitor.unsubscribe(running.subscription);
        tracing::info!("Unrecoverable error handler stopped");
    }
}

async fn sweep_loop(
    handler: Weak<UnrecoverableErrorHandler>,
    period: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut timer = tokio::time::interval(period);

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => break,
            _ = timer.tick() => {
                let Some(handler) = handler.upgrade() else {
                    break;
                };
                if AssertUnwindSafe(handler.sweep_once())
                    .catch_unwind()
                    .await
                    .is_err()
                {
                    tracing::error!("Unrecoverable error sweep panicked");
                }
            }
        }
    }
}

struct HandlerSubscriber {
    handler: Weak<UnrecoverableErrorHandler>,
}

#[async_trait]
impl ErrorHandler for HandlerSubscriber {
    async fn handle(&self, error: &ErrorRecord) -> anyhow::Result<()> {
        if let Some(handler) = self.handler.upgrade() {
            handler.handle_error(error).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let warning = ErrorRecord::builder("pump-1", "low flow")
            .code("LOW_FLOW")
            .severity(Severity::Warning)
            .build();
        assert!(!is_unrecoverable(&warning));

        let critical = ErrorRecord::builder("pump-1", "dry run")
            .code("DRY_RUN")
            .severity(Severity::Critical)
            .build();
        assert!(is_unrecoverable(&critical));

        let corrupt = ErrorRecord::builder("sensor-1", "bad calibration")
            .code(codes::DATA_CORRUPTION)
            .severity(Severity::Warning)
            .build();
        assert!(is_unrecoverable(&corrupt));

        let flagged = ErrorRecord::builder("sensor-1", "sensor cable cut")
            .code("PROBE")
            .recoverable(false)
            .build();
        assert!(is_unrecoverable(&flagged));
    }
}
