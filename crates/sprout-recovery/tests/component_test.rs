//! Tests for ComponentRecoveryService

use async_trait::async_trait;
use serde_json::{json, Value};
use sprout_core::record::codes;
use sprout_core::{ErrorMonitor, ErrorRecord, EventBus, ManualClock};
use sprout_devices::{
    DeviceDeps, DeviceDriver, DeviceSnapshot, DeviceState, DeviceStore, DeviceTypeRegistry,
    MemoryDeviceStore,
};
use sprout_recovery::ComponentRecoveryService;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::test;

struct Pump {
    flow_lpm: parking_lot::Mutex<u64>,
    gate: Option<Arc<Notify>>,
}

#[async_trait]
impl DeviceDriver for Pump {
    fn type_name(&self) -> &str {
        "pump"
    }

    async fn on_initialize(&self) -> anyhow::Result<()> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        Ok(())
    }

    fn properties(&self) -> Value {
        json!({ "flow_lpm": *self.flow_lpm.lock() })
    }

    fn load_properties(&self, properties: &Value) -> anyhow::Result<()> {
        if let Some(flow) = properties["flow_lpm"].as_u64() {
            *self.flow_lpm.lock() = flow;
        }
        Ok(())
    }
}

struct Fixture {
    service: Arc<ComponentRecoveryService>,
    store: Arc<MemoryDeviceStore>,
    monitor: Arc<ErrorMonitor>,
    clock: Arc<ManualClock>,
    constructed: Arc<AtomicU32>,
}

fn fixture(gate: Option<Arc<Notify>>) -> Fixture {
    let monitor = Arc::new(ErrorMonitor::default());
    let clock = Arc::new(ManualClock::starting_now());
    let store = Arc::new(MemoryDeviceStore::new());
    let constructed = Arc::new(AtomicU32::new(0));

    let registry = Arc::new(DeviceTypeRegistry::new());
    let counter = constructed.clone();
    registry.register("pump", move |_spec| {
        counter.fetch_add(1, Ordering::SeqCst);
        Some(Box::new(Pump {
            flow_lpm: parking_lot::Mutex::new(0),
            gate: gate.clone(),
        }) as Box<dyn DeviceDriver>)
    });

    let deps = DeviceDeps::new(monitor.clone(), EventBus::new()).with_clock(clock.clone());
    let service = Arc::new(ComponentRecoveryService::new(
        store.clone(),
        registry,
        deps,
    ));

    Fixture {
        service,
        store,
        monitor,
        clock,
        constructed,
    }
}

async fn seed(store: &MemoryDeviceStore, type_name: &str) {
    store
        .save_snapshot(
            DeviceSnapshot::new("pump-1", "Main pump", type_name, json!({"flow_lpm": 12}))
                .with_metadata("zone", json!("greenhouse")),
        )
        .await
        .unwrap();
}

#[test]
async fn test_missing_properties_skips_construction() {
    let f = fixture(None);

    assert!(!f.service.recover_device("pump-1").await);
    assert_eq!(f.constructed.load(Ordering::SeqCst), 0);
    assert!(f.store.get_device("pump-1").await.is_none());
}

#[test]
async fn test_rebuild_from_snapshot() {
    let f = fixture(None);
    seed(&f.store, "pump").await;
    f.monitor
        .report_error(
            ErrorRecord::builder("pump-1", "driver crashed")
                .code("DRIVER_CRASH")
                .build(),
        )
        .await;

    assert!(f.service.recover_device("pump-1").await);
    assert_eq!(f.constructed.load(Ordering::SeqCst), 1);

    let device = f.store.get_device("pump-1").await.unwrap();
    assert_eq!(device.state(), DeviceState::Ready);
    assert_eq!(device.name(), "Main pump");
    assert_eq!(device.driver().properties(), json!({"flow_lpm": 12}));
    assert_eq!(device.metadata().get("zone"), Some(&json!("greenhouse")));

    assert!(f
        .monitor
        .get_active_errors_for_device("pump-1")
        .await
        .is_empty());
    assert!(!f.service.is_recovering("pump-1"));
}

#[test]
async fn test_concurrent_recovery_is_rejected() {
    let gate = Arc::new(Notify::new());
    let f = fixture(Some(gate.clone()));
    seed(&f.store, "pump").await;

    let first = {
        let service = f.service.clone();
        tokio::spawn(async move { service.recover_device("pump-1").await })
    };
    while !f.service.is_recovering("pump-1") {
        tokio::task::yield_now().await;
    }

    assert!(!f.service.recover_device("pump-1").await);

    gate.notify_one();
    assert!(first.await.unwrap());
    assert!(!f.service.is_recovering("pump-1"));
    assert_eq!(f.constructed.load(Ordering::SeqCst), 1);
}

#[test]
async fn test_failed_rebuilds_are_throttled() {
    let f = fixture(None);
    seed(&f.store, "sprinkler").await;

    assert!(!f.service.recover_device("pump-1").await);
    assert_eq!(f.service.attempt_count("pump-1").await, 1);

    // One failure on file: next attempt needs 10s.
    assert!(!f.service.recover_device("pump-1").await);
    assert_eq!(f.service.attempt_count("pump-1").await, 1);

    f.clock.advance_secs(9);
    assert!(!f.service.recover_device("pump-1").await);
    assert_eq!(f.service.attempt_count("pump-1").await, 1);

    f.clock.advance_secs(1);
    assert!(!f.service.recover_device("pump-1").await);
    assert_eq!(f.service.attempt_count("pump-1").await, 2);

    // Fix the snapshot; the 20s window still applies.
    seed(&f.store, "pump").await;
    f.clock.advance_secs(19);
    assert!(!f.service.recover_device("pump-1").await);
    f.clock.advance_secs(1);
    assert!(f.service.recover_device("pump-1").await);
    assert_eq!(f.service.attempt_count("pump-1").await, 0);
}

/// Fails its first initialization, succeeds afterwards.
struct ColdStart {
    warmed_up: Arc<AtomicBool>,
}

#[async_trait]
impl DeviceDriver for ColdStart {
    fn type_name(&self) -> &str {
        "pump"
    }

    async fn on_initialize(&self) -> anyhow::Result<()> {
        if !self.warmed_up.swap(true, Ordering::SeqCst) {
            anyhow::bail!("controller still booting");
        }
        Ok(())
    }
}

#[test]
async fn test_failed_rebuild_leaves_no_recovery_behind() {
    let monitor = Arc::new(ErrorMonitor::default());
    let clock = Arc::new(ManualClock::starting_now());
    let store = Arc::new(MemoryDeviceStore::new());

    let registry = Arc::new(DeviceTypeRegistry::new());
    let warmed_up = Arc::new(AtomicBool::new(false));
    registry.register("pump", move |_spec| {
        Some(Box::new(ColdStart {
            warmed_up: warmed_up.clone(),
        }) as Box<dyn DeviceDriver>)
    });
    let deps = DeviceDeps::new(monitor.clone(), EventBus::new()).with_clock(clock.clone());
    let service = ComponentRecoveryService::new(store.clone(), registry, deps);

    seed(&store, "pump").await;
    monitor
        .report_error(
            ErrorRecord::builder("pump-1", "driver crashed")
                .code("DRIVER_CRASH")
                .build(),
        )
        .await;

    assert!(!service.recover_device("pump-1").await);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    assert!(store.get_device("pump-1").await.is_none());
    let active = monitor.get_active_errors_for_device("pump-1").await;
    assert!(active.iter().any(|r| r.code() == Some("DRIVER_CRASH")));
    assert!(active
        .iter()
        .any(|r| r.code() == Some(codes::INITIALIZATION_FAILED)));

    clock.advance_secs(10);
    assert!(service.recover_device("pump-1").await);
    assert!(store.get_device("pump-1").await.is_some());
    assert!(monitor
        .get_active_errors_for_device("pump-1")
        .await
        .is_empty());
}
