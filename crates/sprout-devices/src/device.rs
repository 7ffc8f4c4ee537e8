//! Managed devices.
//!
//! [`ManagedDevice`] wraps a [`DeviceDriver`] with the lifecycle state
//! machine and the self-healing logic every device carries:
//!
//! - faults are reported to the [`ErrorMonitor`] and published as alerts,
//! - recoverable faults schedule a background recovery attempt,
//! - attempts are throttled per error code with exponential backoff,
//! - consecutive in-process failures past a ceiling escalate to a critical,
//!   unrecoverable `RECOVERY_LIMIT_EXCEEDED` error.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{watch, Mutex};

use sprout_core::config::SelfHealingConfig;
use sprout_core::record::{codes, ErrorRecordBuilder, ExceptionInfo};
use sprout_core::recovery::backoff_elapsed;
use sprout_core::{
    system_clock, ErrorMonitor, ErrorRecord, EventBus, RecoveryOrchestrator, Severity,
    SharedClock, SproutEvent,
};

use crate::driver::{DeviceDriver, DeviceSpec};
use crate::error::{DeviceError, Result};
use crate::state::DeviceState;
use crate::store::DeviceSnapshot;

/// Collaborators shared by all devices.
#[derive(Clone)]
pub struct DeviceDeps {
    pub monitor: Arc<ErrorMonitor>,
    pub event_bus: EventBus,
    pub orchestrator: Option<Arc<dyn RecoveryOrchestrator>>,
    pub clock: SharedClock,
    pub config: SelfHealingConfig,
}

impl DeviceDeps {
    pub fn new(monitor: Arc<ErrorMonitor>, event_bus: EventBus) -> Self {
        Self {
            monitor,
            event_bus,
            orchestrator: None,
            clock: system_clock(),
            config: SelfHealingConfig::default(),
        }
    }

    pub fn with_orchestrator(mut self, orchestrator: Arc<dyn RecoveryOrchestrator>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: SelfHealingConfig) -> Self {
        self.config = config;
        self
    }
}

/// Throttle state for one error code.
#[derive(Debug, Clone, Copy, Default)]
struct RecoveryState {
    last_attempt: Option<DateTime<Utc>>,
    consecutive_failures: u32,
}

/// A device under lifecycle and self-healing management.
pub struct ManagedDevice {
    id: String,
    name: String,
    driver: Box<dyn DeviceDriver>,
    deps: DeviceDeps,
    state: RwLock<DeviceState>,
    /// State the device was in when it last entered `Error`.
    last_active_state: RwLock<DeviceState>,
    metadata: RwLock<HashMap<String, Value>>,
    throttle: Mutex<HashMap<String, RecoveryState>>,
    consecutive_failures: AtomicU32,
    limit_reported: AtomicBool,
    /// Flipped to `true` on dispose; background recoveries watch it.
    disposed: watch::Sender<bool>,
}

impl ManagedDevice {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        driver: Box<dyn DeviceDriver>,
        deps: DeviceDeps,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            name: name.into(),
            driver,
            deps,
            state: RwLock::new(DeviceState::Created),
            last_active_state: RwLock::new(DeviceState::Created),
            metadata: RwLock::new(HashMap::new()),
            throttle: Mutex::new(HashMap::new()),
            consecutive_failures: AtomicU32::new(0),
            limit_reported: AtomicBool::new(false),
            disposed: watch::channel(false).0,
        })
    }

    pub fn from_spec(
        spec: &DeviceSpec,
        driver: Box<dyn DeviceDriver>,
        deps: DeviceDeps,
    ) -> Arc<Self> {
        Self::new(spec.id.clone(), spec.name.clone(), driver, deps)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_name(&self) -> &str {
        self.driver.type_name()
    }

    pub fn state(&self) -> DeviceState {
        *self.state.read()
    }

    pub fn driver(&self) -> &dyn DeviceDriver {
        self.driver.as_ref()
    }

    /// Consecutive in-process recovery failures.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    pub fn metadata(&self) -> HashMap<String, Value> {
        self.metadata.read().clone()
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: Value) {
        self.metadata.write().insert(key.into(), value);
    }

    pub fn load_metadata(&self, metadata: HashMap<String, Value>) {
        self.metadata.write().extend(metadata);
    }

    pub fn load_properties(&self, properties: &Value) -> Result<()> {
        self.driver
            .load_properties(properties)
            .map_err(|source| DeviceError::Lifecycle {
                device_id: self.id.clone(),
                operation: "load properties",
                source,
            })
    }

    /// Persistable view of the device.
    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            type_name: self.driver.type_name().to_string(),
            properties: self.driver.properties(),
            metadata: self.metadata(),
            state: self.state(),
            updated_at: self.deps.clock.now(),
        }
    }

    fn set_state(&self, next: DeviceState) {
        let mut state = self.state.write();
        if *state != next {
            tracing::debug!(device_id = %self.id, from = state.as_str(), to = next.as_str(), "Device state changed");
            *state = next;
        }
    }

    fn enter_error_state(&self) {
        let mut state = self.state.write();
        if matches!(*state, DeviceState::Error | DeviceState::Disposed) {
            return;
        }
        *self.last_active_state.write() = *state;
        tracing::debug!(device_id = %self.id, from = state.as_str(), "Device entered error state");
        *state = DeviceState::Error;
    }

    fn guard(&self, operation: &'static str, allowed: fn(&DeviceState) -> bool) -> Result<()> {
        let state = self.state();
        if allowed(&state) {
            Ok(())
        } else {
            Err(DeviceError::InvalidState {
                device_id: self.id.clone(),
                operation,
                state,
            })
        }
    }

    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        self.initialize_with(true).await
    }

    /// Initialize without scheduling background recovery on failure.
    ///
    /// The failure is still recorded and published. Used for instances that
    /// are not registered anywhere yet and are dropped if this fails.
    pub async fn initialize_without_recovery(self: &Arc<Self>) -> Result<()> {
        self.initialize_with(false).await
    }

    async fn initialize_with(self: &Arc<Self>, schedule_recovery: bool) -> Result<()> {
        self.guard("initialize", DeviceState::can_initialize)?;
        let from_error = self.state() == DeviceState::Error;
        self.set_state(DeviceState::Initializing);

        match self.driver.on_initialize().await {
            Ok(()) => {
                if from_error {
                    self.reset_failure_streak();
                }
                self.set_state(DeviceState::Ready);
                tracing::info!(device_id = %self.id, type_name = self.type_name(), "Device initialized");
                Ok(())
            }
            Err(e) => Err(self
                .lifecycle_failed(
                    "initialize",
                    codes::INITIALIZATION_FAILED,
                    e,
                    schedule_recovery,
                )
                .await),
        }
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.guard("start", DeviceState::can_start)?;
        let from_error = self.state() == DeviceState::Error;

        match self.driver.on_start().await {
            Ok(()) => {
                if from_error {
                    self.reset_failure_streak();
                }
                self.set_state(DeviceState::Running);
                tracing::info!(device_id = %self.id, "Device started");
                Ok(())
            }
            Err(e) => Err(self
                .lifecycle_failed("start", codes::START_FAILED, e, true)
                .await),
        }
    }

    /// Stop the device. Does nothing unless it is running.
    pub async fn stop(self: &Arc<Self>) -> Result<()> {
        if self.state() != DeviceState::Running {
            return Ok(());
        }
        self.set_state(DeviceState::Stopping);

        match self.driver.on_stop().await {
            Ok(()) => {
                self.set_state(DeviceState::Ready);
                tracing::info!(device_id = %self.id, "Device stopped");
                Ok(())
            }
            Err(e) => Err(self
                .lifecycle_failed("stop", codes::STOP_FAILED, e, true)
                .await),
        }
    }

    /// Stop the device, drop its throttle state and mark it disposed.
    /// Pending background recoveries are cancelled.
    pub async fn dispose(self: &Arc<Self>) {
        if let Err(e) = self.stop().await {
            tracing::warn!(device_id = %self.id, error = %e, "Stop failed during dispose");
        }
        self.disposed.send_replace(true);
        self.throttle.lock().await.clear();
        self.set_state(DeviceState::Disposed);
    }

    async fn lifecycle_failed(
        self: &Arc<Self>,
        operation: &'static str,
        code: &str,
        source: anyhow::Error,
        schedule_recovery: bool,
    ) -> DeviceError {
        self.enter_error_state();

        let record = ErrorRecord::builder(
            self.id.clone(),
            format!("Failed to {}: {}", operation, source),
        )
        .code(code)
        .severity(Severity::Error)
        .exception(ExceptionInfo::from_anyhow("DeviceLifecycleError", &source))
        .context("operation", operation)
        .build();
        if schedule_recovery {
            self.report_error(record).await;
        } else {
            self.record_error(record).await;
        }

        DeviceError::Lifecycle {
            device_id: self.id.clone(),
            operation,
            source,
        }
    }

    /// Report a fault for this device.
    ///
    /// The record is normalized, stored in the monitor and published as an
    /// alert. If it is eligible, a recovery attempt is scheduled in the
    /// background. Returns the stored record.
    pub async fn report_error(self: &Arc<Self>, record: ErrorRecord) -> ErrorRecord {
        let stored = self.record_error(record).await;

        if stored.is_eligible_for_recovery(self.deps.config.max_consecutive_failures) {
            if let Some(code) = stored.code() {
                self.spawn_recovery(code.to_string());
            }
        }
        stored
    }

    /// Store and publish without scheduling recovery.
    async fn record_error(&self, record: ErrorRecord) -> ErrorRecord {
        let stored = self.deps.monitor.report_error(self.normalize(record)).await;

        if stored.severity() >= Severity::Error {
            self.enter_error_state();
        }

        let alert = SproutEvent::alert_for(&stored);
        if !self
            .deps
            .event_bus
            .publish_with_source(alert, self.id.clone())
            .await
        {
            tracing::trace!(device_id = %self.id, "No alert subscribers");
        }
        stored
    }

    fn normalize(&self, record: ErrorRecord) -> ErrorRecord {
        let source = record
            .source()
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}/{}", self.driver.type_name(), self.id));

        ErrorRecordBuilder::from_record(record)
            .device_id(self.id.clone())
            .source(source)
            .timestamp(self.deps.clock.now())
            .build()
    }

    fn spawn_recovery(self: &Arc<Self>, code: String) {
        let mut disposed = self.disposed.subscribe();
        if *disposed.borrow() {
            return;
        }

        let device = Arc::clone(self);
        tokio::spawn(async move {
            let recovery = AssertUnwindSafe(device.attempt_recovery_for_error(&code)).catch_unwind();
            tokio::select! {
                biased;
                _ = disposed.wait_for(|done| *done) => {
                    tracing::debug!(device_id = %device.id, code = %code, "Background recovery cancelled");
                }
                outcome = recovery => match outcome {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::debug!(device_id = %device.id, code = %code, "Background recovery did not heal the device")
                    }
                    Err(_) => {
                        tracing::error!(device_id = %device.id, code = %code, "Background recovery panicked")
                    }
                },
            }
        });
    }

    /// Throttled recovery for one error code.
    ///
    /// Returns `false` without attempting anything if the backoff for `code`
    /// has not elapsed since the last attempt.
    pub async fn attempt_recovery_for_error(&self, code: &str) -> bool {
        if self.state() == DeviceState::Disposed {
            return false;
        }

        {
            let mut throttle = self.throttle.lock().await;
            let attempts = self
                .deps
                .monitor
                .get_active_error(&self.id, code)
                .await
                .map(|r| r.recovery_attempt_count())
                .unwrap_or(0);
            let backoff = self.deps.config.backoff(attempts);
            let now = self.deps.clock.now();

            let entry = throttle.entry(code.to_string()).or_default();
            if !backoff_elapsed(entry.last_attempt, now, backoff) {
                tracing::debug!(
                    device_id = %self.id,
                    code,
                    attempts,
                    backoff_secs = backoff.num_seconds(),
                    "Recovery throttled"
                );
                return false;
            }
            entry.last_attempt = Some(now);
        }

        let recovered = self.try_recover().await;
        if self.state() == DeviceState::Disposed {
            return false;
        }
        self.deps
            .monitor
            .register_recovery_attempt(&self.id, code, recovered)
            .await;

        let mut throttle = self.throttle.lock().await;
        if recovered {
            throttle.remove(code);
        } else if let Some(entry) = throttle.get_mut(code) {
            entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        }
        recovered
    }

    /// Time of the last throttle pass for `code`.
    pub async fn last_recovery_attempt(&self, code: &str) -> Option<DateTime<Utc>> {
        self.throttle
            .lock()
            .await
            .get(code)
            .and_then(|s| s.last_attempt)
    }

    /// Consecutive failed attempts recorded by the throttle for `code`.
    pub async fn throttle_failures(&self, code: &str) -> u32 {
        self.throttle
            .lock()
            .await
            .get(code)
            .map(|s| s.consecutive_failures)
            .unwrap_or(0)
    }

    /// Attempt in-process recovery.
    ///
    /// Succeeds immediately if the device is not in `Error`, and fails if it
    /// is disposed. Once the consecutive failure ceiling is reached it
    /// reports a single `RECOVERY_LIMIT_EXCEEDED` error and refuses further
    /// attempts until the device is healed.
    pub async fn try_recover(&self) -> bool {
        match self.state() {
            DeviceState::Error => {}
            DeviceState::Disposed => return false,
            _ => return true,
        }

        let failures = self.consecutive_failures();
        if failures >= self.deps.config.max_consecutive_failures {
            if !self.limit_reported.swap(true, Ordering::SeqCst) {
                tracing::error!(device_id = %self.id, failures, "Recovery limit exceeded");
                let record = ErrorRecord::builder(
                    self.id.clone(),
                    format!(
                        "Recovery abandoned after {} consecutive failures",
                        failures
                    ),
                )
                .code(codes::RECOVERY_LIMIT_EXCEEDED)
                .severity(Severity::Critical)
                .recoverable(false)
                .context("consecutive_failures", failures)
                .build();
                self.record_error(record).await;
            }
            return false;
        }

        if let Some(orchestrator) = self.deps.orchestrator.clone() {
            if self.recover_with_orchestrator(orchestrator.as_ref()).await {
                self.recovery_succeeded("orchestrator").await;
                return true;
            }
            tracing::debug!(device_id = %self.id, "Orchestrated recovery failed, trying direct recovery");
        }

        self.recover_directly().await
    }

    async fn recover_with_orchestrator(&self, orchestrator: &dyn RecoveryOrchestrator) -> bool {
        let errors = self.deps.monitor.get_active_errors_for_device(&self.id).await;
        if errors.is_empty() {
            return false;
        }

        for error in &errors {
            match orchestrator.attempt_recovery(error).await {
                Ok(status) if status.is_successful => {}
                Ok(_) => return false,
                Err(e) => {
                    tracing::warn!(
                        device_id = %self.id,
                        code = error.code().unwrap_or("-"),
                        error = %e,
                        "Orchestrator failed"
                    );
                    return false;
                }
            }
        }
        true
    }

    async fn recover_directly(&self) -> bool {
        if *self.last_active_state.read() == DeviceState::Running {
            if let Err(e) = self.driver.on_stop().await {
                tracing::warn!(device_id = %self.id, error = %e, "Stop before recovery failed");
            }
        }

        let failure = match self.driver.on_recover().await {
            Ok(true) => {
                self.recovery_succeeded("direct").await;
                return true;
            }
            Ok(false) => None,
            Err(e) => Some(e),
        };

        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        let message = match &failure {
            Some(e) => format!("Recovery attempt {} failed: {}", failures, e),
            None => format!("Recovery attempt {} did not restore the device", failures),
        };
        tracing::warn!(device_id = %self.id, failures, "{}", message);

        let mut record = ErrorRecord::builder(self.id.clone(), message)
            .code(codes::RECOVERY_EXCEPTION)
            .severity(Severity::Error)
            .context("consecutive_failures", failures);
        if let Some(e) = &failure {
            record = record.exception(ExceptionInfo::from_anyhow("RecoveryError", e));
        }
        self.record_error(record.build()).await;
        false
    }

    fn reset_failure_streak(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.limit_reported.store(false, Ordering::SeqCst);
    }

    async fn recovery_succeeded(&self, path: &str) {
        self.reset_failure_streak();
        self.set_state(DeviceState::Ready);
        self.deps
            .monitor
            .register_recovery_attempt(&self.id, codes::RECOVERY_EXCEPTION, true)
            .await;
        tracing::info!(device_id = %self.id, path, "Device recovered");
    }
}

impl std::fmt::Debug for ManagedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedDevice")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("type_name", &self.driver.type_name())
            .field("state", &self.state())
            .finish()
    }
}
