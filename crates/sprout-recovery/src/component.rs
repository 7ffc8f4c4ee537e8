//! Component recovery service.
//!
//! Rebuilds a device from its persisted snapshot when no live reference is
//! available: resolve the recorded type through the registry, reload
//! properties and metadata, initialize, then re-register the live instance
//! with the store. Attempts per device are guarded against concurrent runs
//! and throttled with the same exponential backoff devices use, on a counter
//! local to this service.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Mutex;

use sprout_core::recovery::backoff_elapsed;
use sprout_devices::{
    properties, DeviceDeps, DeviceSpec, DeviceStore, DeviceStoreExt, DeviceTypeRegistry,
    ManagedDevice, SharedDeviceStore,
};

use crate::error::{RecoveryError, Result};

#[derive(Debug, Clone, Copy, Default)]
struct AttemptState {
    attempts: u32,
    last_attempt: Option<DateTime<Utc>>,
}

/// Reconstructs devices from persisted state.
pub struct ComponentRecoveryService {
    store: SharedDeviceStore,
    registry: Arc<DeviceTypeRegistry>,
    /// Collaborators handed to rebuilt devices; also supplies clock, backoff and monitor.
    deps: DeviceDeps,
    in_flight: DashMap<String, DateTime<Utc>>,
    attempts: Mutex<HashMap<String, AttemptState>>,
}

impl ComponentRecoveryService {
    pub fn new(
        store: SharedDeviceStore,
        registry: Arc<DeviceTypeRegistry>,
        deps: DeviceDeps,
    ) -> Self {
        Self {
            store,
            registry,
            deps,
            in_flight: DashMap::new(),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a rebuild of `device_id` is in progress.
    pub fn is_recovering(&self, device_id: &str) -> bool {
        self.in_flight.contains_key(device_id)
    }

    /// Failed attempts on file for `device_id`.
    pub async fn attempt_count(&self, device_id: &str) -> u32 {
        self.attempts
            .lock()
            .await
            .get(device_id)
            .map(|s| s.attempts)
            .unwrap_or(0)
    }

    /// Rebuild `device_id` from storage. Never fails; returns whether the
    /// device is live and initialized again.
    pub async fn recover_device(&self, device_id: &str) -> bool {
        match self.in_flight.entry(device_id.to_string()) {
            Entry::Occupied(_) => {
                tracing::debug!(
                    device_id,
                    "{}",
                    RecoveryError::InFlight(device_id.to_string())
                );
                return false;
            }
            Entry::Vacant(slot) => {
                slot.insert(self.deps.clock.now());
            }
        }
        let _in_flight = scopeguard::guard((), |_| {
            self.in_flight.remove(device_id);
        });

        if let Err(e) = self.check_throttle(device_id).await {
            tracing::debug!(device_id, "{}", e);
            return false;
        }

        match self.rebuild(device_id).await {
            Ok(device) => {
                self.attempts.lock().await.remove(device_id);
                for error in self
                    .deps
                    .monitor
                    .get_active_errors_for_device(device_id)
                    .await
                {
                    if let Some(code) = error.code() {
                        self.deps
                            .monitor
                            .register_recovery_attempt(device_id, code, true)
                            .await;
                    }
                }
                tracing::info!(
                    device_id,
                    type_name = device.type_name(),
                    "Device rebuilt from persisted state"
                );
                true
            }
            Err(e) => {
                let attempts = {
                    let mut attempts = self.attempts.lock().await;
                    let state = attempts.entry(device_id.to_string()).or_default();
                    state.attempts = state.attempts.saturating_add(1);
                    state.last_attempt = Some(self.deps.clock.now());
                    state.attempts
                };
                tracing::warn!(device_id, attempts, error = %e, "Component recovery failed");
                false
            }
        }
    }

    async fn check_throttle(&self, device_id: &str) -> Result<()> {
        let attempts = self.attempts.lock().await;
        let Some(state) = attempts.get(device_id) else {
            return Ok(());
        };

        let backoff = self.deps.config.backoff(state.attempts);
        let now = self.deps.clock.now();
        if backoff_elapsed(state.last_attempt, now, backoff) {
            return Ok(());
        }

        let remaining = state
            .last_attempt
            .map(|last| (backoff - (now - last)).num_seconds())
            .unwrap_or(0);
        Err(RecoveryError::Throttled {
            device_id: device_id.to_string(),
            remaining_secs: remaining,
        })
    }

    async fn rebuild(&self, device_id: &str) -> Result<Arc<ManagedDevice>> {
        let persisted = self
            .store
            .get_property(device_id, properties::PROPERTIES)
            .await?
            .ok_or_else(|| RecoveryError::NoPersistedState(device_id.to_string()))?;

        let type_name = self
            .store
            .get_property_as::<String>(device_id, properties::TYPE_NAME)
            .await?
            .filter(|t| !t.is_empty())
            .ok_or_else(|| RecoveryError::MissingTypeName(device_id.to_string()))?;

        let name = self
            .store
            .get_property_as::<String>(device_id, properties::NAME)
            .await?
            .unwrap_or_else(|| device_id.to_string());

        let spec = DeviceSpec::new(device_id, name, type_name);
        let driver = self.registry.instantiate(&spec)?;
        let device = ManagedDevice::from_spec(&spec, driver, self.deps.clone());

        device.load_properties(&persisted)?;
        if let Some(metadata) = self
            .store
            .get_property_as::<HashMap<String, Value>>(device_id, properties::METADATA)
            .await?
        {
            device.load_metadata(metadata);
        }

        device.initialize_without_recovery().await?;
        self.store.add_or_update(device.clone()).await?;
        Ok(device)
    }
}
