//! Recovery manager.
//!
//! Front door for system-wide recovery: tries the orchestrator first, falls
//! back to rebuilding the device through [`ComponentRecoveryService`], and
//! keeps per code and per device attempt history for statistics.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use sprout_core::{
    codes, ErrorFilter, ErrorHandler, ErrorMonitor, ErrorRecord, RecoveryOrchestrator,
    RecoveryStatus, SharedClock, SubscriptionId,
};

use crate::component::ComponentRecoveryService;

/// Strategy name recorded when the orchestrator heals an error.
pub const ORCHESTRATED_RECOVERY: &str = "Orchestrated Recovery";
/// Strategy name recorded when the device is rebuilt.
pub const COMPONENT_RECOVERY: &str = "Component Recovery Service";
/// History key for device recoveries without an active error code.
pub const DEVICE_RECOVERY: &str = "DEVICE_RECOVERY";

/// Attempt history for one (code, device) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryHistory {
    pub attempt_count: u32,
    pub success_count: u32,
    pub last_attempt: DateTime<Utc>,
}

/// Aggregated outcomes for one error code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeStatistics {
    pub attempts: u32,
    pub successes: u32,
    /// Integer percentage; `None` when there were no attempts.
    pub success_rate: Option<u32>,
}

/// Recovery statistics since a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryStatistics {
    pub since: DateTime<Utc>,
    pub by_code: HashMap<String, CodeStatistics>,
    pub total_attempts: u32,
    pub total_successes: u32,
    pub success_rate: Option<u32>,
}

fn success_rate(successes: u32, attempts: u32) -> Option<u32> {
    if attempts == 0 {
        None
    } else {
        Some((u64::from(successes) * 100 / u64::from(attempts)) as u32)
    }
}

/// Coordinates recovery paths and records their outcomes.
pub struct RecoveryManagerService {
    orchestrator: Option<Arc<dyn RecoveryOrchestrator>>,
    component: Arc<ComponentRecoveryService>,
    monitor: Arc<ErrorMonitor>,
    clock: SharedClock,
    /// code -> device -> history
    history: Mutex<HashMap<String, HashMap<String, RecoveryHistory>>>,
}

impl RecoveryManagerService {
    pub fn new(
        orchestrator: Option<Arc<dyn RecoveryOrchestrator>>,
        component: Arc<ComponentRecoveryService>,
        monitor: Arc<ErrorMonitor>,
        clock: SharedClock,
    ) -> Self {
        Self {
            orchestrator,
            component,
            monitor,
            clock,
            history: Mutex::new(HashMap::new()),
        }
    }

    /// Try to heal `error`. Never fails; failures come back as an unsuccessful status.
    pub async fn attempt_recovery(&self, error: &ErrorRecord) -> RecoveryStatus {
        let code = error.code().unwrap_or("unknown").to_string();

        let strategy = if self.orchestrate(error).await {
            if let Some(code) = error.code() {
                self.monitor
                    .register_recovery_attempt(error.device_id(), code, true)
                    .await;
            }
            Some(ORCHESTRATED_RECOVERY)
        } else if self.component.recover_device(error.device_id()).await {
            Some(COMPONENT_RECOVERY)
        } else {
            None
        };

        let attempts = self
            .record_outcome(&code, error.device_id(), strategy.is_some())
            .await;
        let codes: Vec<String> = error.code().map(str::to_string).into_iter().collect();
        let now = self.clock.now();

        match strategy {
            Some(name) => {
                tracing::info!(
                    device_id = %error.device_id(),
                    code = %code,
                    strategy = name,
                    "Recovery succeeded"
                );
                RecoveryStatus::succeeded(name, attempts, codes, now)
            }
            None => {
                tracing::warn!(
                    device_id = %error.device_id(),
                    code = %code,
                    attempts,
                    "Recovery failed"
                );
                RecoveryStatus::failed(attempts, codes, now)
            }
        }
    }

    /// Recover a device by id, covering all of its active errors.
    pub async fn attempt_device_recovery(&self, device_id: &str) -> RecoveryStatus {
        let active = self.monitor.get_active_errors_for_device(device_id).await;

        let mut orchestrated = !active.is_empty();
        for error in &active {
            if !self.orchestrate(error).await {
                orchestrated = false;
                break;
            }
        }

        let strategy = if orchestrated {
            for code in active.iter().filter_map(ErrorRecord::code) {
                self.monitor
                    .register_recovery_attempt(device_id, code, true)
                    .await;
            }
            Some(ORCHESTRATED_RECOVERY)
        } else if self.component.recover_device(device_id).await {
            Some(COMPONENT_RECOVERY)
        } else {
            None
        };

        let mut codes: Vec<String> = active
            .iter()
            .filter_map(|e| e.code().map(str::to_string))
            .collect();
        codes.dedup();

        let mut attempts = 0;
        if codes.is_empty() {
            attempts = self
                .record_outcome(DEVICE_RECOVERY, device_id, strategy.is_some())
                .await;
        } else {
            for code in &codes {
                attempts = attempts.max(
                    self.record_outcome(code, device_id, strategy.is_some())
                        .await,
                );
            }
        }

        let now = self.clock.now();
        match strategy {
            Some(name) => {
                tracing::info!(device_id, strategy = name, "Device recovered");
                RecoveryStatus::succeeded(name, attempts, codes, now)
            }
            None => {
                tracing::warn!(device_id, "Device recovery failed");
                RecoveryStatus::failed(attempts, codes, now)
            }
        }
    }

    async fn orchestrate(&self, error: &ErrorRecord) -> bool {
        let Some(orchestrator) = &self.orchestrator else {
            return false;
        };

        match AssertUnwindSafe(orchestrator.attempt_recovery(error))
            .catch_unwind()
            .await
        {
            Ok(Ok(status)) => status.is_successful,
            Ok(Err(e)) => {
                tracing::warn!(
                    device_id = %error.device_id(),
                    error = %e,
                    "Orchestrator raised an error"
                );
                false
            }
            Err(_) => {
                tracing::error!(device_id = %error.device_id(), "Orchestrator panicked");
                false
            }
        }
    }

    /// Update history and return the attempt count for (code, device).
    async fn record_outcome(&self, code: &str, device_id: &str, success: bool) -> u32 {
        let now = self.clock.now();
        let mut history = self.history.lock().await;
        let entry = history
            .entry(code.to_string())
            .or_default()
            .entry(device_id.to_string())
            .or_insert(RecoveryHistory {
                attempt_count: 0,
                success_count: 0,
                last_attempt: now,
            });
        entry.attempt_count = entry.attempt_count.saturating_add(1);
        if success {
            entry.success_count = entry.success_count.saturating_add(1);
        }
        entry.last_attempt = now;
        entry.attempt_count
    }

    pub async fn history(&self) -> HashMap<String, HashMap<String, RecoveryHistory>> {
        self.history.lock().await.clone()
    }

    /// Statistics over devices whose last attempt is at or after `since`.
    pub async fn get_recovery_statistics(&self, since: DateTime<Utc>) -> RecoveryStatistics {
        let history = self.history.lock().await;
        let mut by_code = HashMap::new();
        let mut total_attempts = 0u32;
        let mut total_successes = 0u32;

        for (code, devices) in history.iter() {
            let (attempts, successes) = devices
                .values()
                .filter(|h| h.last_attempt >= since)
                .fold((0u32, 0u32), |(a, s), h| {
                    (
                        a.saturating_add(h.attempt_count),
                        s.saturating_add(h.success_count),
                    )
                });
            total_attempts = total_attempts.saturating_add(attempts);
            total_successes = total_successes.saturating_add(successes);
            by_code.insert(
                code.clone(),
                CodeStatistics {
                    attempts,
                    successes,
                    success_rate: success_rate(successes, attempts),
                },
            );
        }

        RecoveryStatistics {
            since,
            by_code,
            total_attempts,
            total_successes,
            success_rate: success_rate(total_successes, total_attempts),
        }
    }

    /// Subscribe to `monitor` so every recoverable error whose code is outside
    /// the unrecoverable set is handed to [`attempt_recovery`](Self::attempt_recovery).
    pub fn attach(self: &Arc<Self>, monitor: &ErrorMonitor) -> SubscriptionId {
        let filter: ErrorFilter = Arc::new(|error: &ErrorRecord| {
            error.is_recoverable() && error.code().is_some_and(|c| !codes::is_unrecoverable(c))
        });
        monitor.subscribe(
            Arc::new(ManagerSubscriber {
                manager: Arc::downgrade(self),
            }),
            Some(filter),
        )
    }
}

struct ManagerSubscriber {
    manager: Weak<RecoveryManagerService>,
}

#[async_trait]
impl ErrorHandler for ManagerSubscriber {
    async fn handle(&self, error: &ErrorRecord) -> anyhow::Result<()> {
        if let Some(manager) = self.manager.upgrade() {
            manager.attempt_recovery(error).await;
        }
        Ok(())
    }
}
