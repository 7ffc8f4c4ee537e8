//! Strategy-based recovery orchestrator.
//!
//! [`StrategyOrchestrator`] walks an ordered list of [`RecoveryStrategy`]
//! implementations and stops at the first one that heals the error.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use sprout_core::{ErrorRecord, RecoveryOrchestrator, RecoveryStatus, SharedClock};
use sprout_devices::{DeviceState, DeviceStore, SharedDeviceStore};

/// One way of healing an error.
#[async_trait]
pub trait RecoveryStrategy: Send + Sync {
    fn name(&self) -> &str;

    fn can_handle(&self, error: &ErrorRecord) -> bool;

    /// Returns whether the error is healed.
    async fn execute(&self, error: &ErrorRecord) -> anyhow::Result<bool>;
}

/// Orchestrator trying strategies in registration order.
pub struct StrategyOrchestrator {
    strategies: RwLock<Vec<Arc<dyn RecoveryStrategy>>>,
    clock: SharedClock,
}

impl StrategyOrchestrator {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            strategies: RwLock::new(Vec::new()),
            clock,
        }
    }

    pub fn with_strategy(self, strategy: Arc<dyn RecoveryStrategy>) -> Self {
        self.add_strategy(strategy);
        self
    }

    pub fn add_strategy(&self, strategy: Arc<dyn RecoveryStrategy>) {
        self.strategies.write().push(strategy);
    }

    pub fn strategy_names(&self) -> Vec<String> {
        self.strategies
            .read()
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }
}

#[async_trait]
impl RecoveryOrchestrator for StrategyOrchestrator {
    async fn attempt_recovery(&self, error: &ErrorRecord) -> anyhow::Result<RecoveryStatus> {
        let codes: Vec<String> = error.code().map(str::to_string).into_iter().collect();

        if !error.is_recoverable() {
            return Ok(RecoveryStatus::failed(0, codes, self.clock.now()));
        }

        let candidates: Vec<Arc<dyn RecoveryStrategy>> = self
            .strategies
            .read()
            .iter()
            .filter(|s| s.can_handle(error))
            .cloned()
            .collect();

        let mut attempts = 0;
        for strategy in candidates {
            attempts += 1;
            match strategy.execute(error).await {
                Ok(true) => {
                    tracing::info!(
                        device_id = %error.device_id(),
                        strategy = strategy.name(),
                        "Recovery strategy succeeded"
                    );
                    return Ok(RecoveryStatus::succeeded(
                        strategy.name(),
                        attempts,
                        codes,
                        self.clock.now(),
                    ));
                }
                Ok(false) => {
                    tracing::debug!(
                        device_id = %error.device_id(),
                        strategy = strategy.name(),
                        "Recovery strategy did not heal the error"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        device_id = %error.device_id(),
                        strategy = strategy.name(),
                        error = %e,
                        "Recovery strategy failed"
                    );
                }
            }
        }

        Ok(RecoveryStatus::failed(attempts, codes, self.clock.now()))
    }
}

/// Re-initializes the live device through the store.
pub struct RestartDeviceStrategy {
    store: SharedDeviceStore,
}

impl RestartDeviceStrategy {
    pub const NAME: &'static str = "Restart Device";

    pub fn new(store: SharedDeviceStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl RecoveryStrategy for RestartDeviceStrategy {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn can_handle(&self, error: &ErrorRecord) -> bool {
        error.code().is_some()
    }

    async fn execute(&self, error: &ErrorRecord) -> anyhow::Result<bool> {
        let Some(device) = self.store.get_device(error.device_id()).await else {
            return Ok(false);
        };

        match device.state() {
            DeviceState::Created | DeviceState::Error => {
                device.initialize_without_recovery().await?;
                Ok(true)
            }
            DeviceState::Disposed => Ok(false),
            _ => Ok(true),
        }
    }
}
