//! Tests for RecoveryManagerService

use async_trait::async_trait;
use chrono::Duration;
use serde_json::json;
use sprout_core::record::codes;
use sprout_core::{
    Clock, ErrorMonitor, ErrorRecord, EventBus, ManualClock, RecoveryOrchestrator, RecoveryStatus,
    Severity,
};
use sprout_devices::{
    DeviceDeps, DeviceDriver, DeviceSnapshot, DeviceStore, DeviceTypeRegistry, MemoryDeviceStore,
};
use sprout_recovery::{
    ComponentRecoveryService, RecoveryManagerService, COMPONENT_RECOVERY, DEVICE_RECOVERY,
    ORCHESTRATED_RECOVERY,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::test;

#[derive(Clone, Copy)]
enum Outcome {
    Heal,
    Decline,
    Fail,
    Panic,
}

struct Scripted {
    outcome: Outcome,
    calls: AtomicU32,
    clock: Arc<ManualClock>,
}

#[async_trait]
impl RecoveryOrchestrator for Scripted {
    async fn attempt_recovery(&self, error: &ErrorRecord) -> anyhow::Result<RecoveryStatus> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let codes: Vec<String> = error.code().map(str::to_string).into_iter().collect();
        match self.outcome {
            Outcome::Heal => Ok(RecoveryStatus::succeeded("scripted", 1, codes, self.clock.now())),
            Outcome::Decline => Ok(RecoveryStatus::failed(1, codes, self.clock.now())),
            Outcome::Fail => anyhow::bail!("strategy table unavailable"),
            Outcome::Panic => panic!("orchestrator bug"),
        }
    }
}

struct Valve;

#[async_trait]
impl DeviceDriver for Valve {
    fn type_name(&self) -> &str {
        "valve"
    }
}

struct Fixture {
    manager: Arc<RecoveryManagerService>,
    monitor: Arc<ErrorMonitor>,
    store: Arc<MemoryDeviceStore>,
    clock: Arc<ManualClock>,
    orchestrator: Option<Arc<Scripted>>,
}

fn fixture(outcome: Option<Outcome>) -> Fixture {
    let monitor = Arc::new(ErrorMonitor::default());
    let clock = Arc::new(ManualClock::starting_now());
    let store = Arc::new(MemoryDeviceStore::new());

    let registry = Arc::new(DeviceTypeRegistry::new());
    registry.register("valve", |_spec| Some(Box::new(Valve) as Box<dyn DeviceDriver>));

    let deps = DeviceDeps::new(monitor.clone(), EventBus::new()).with_clock(clock.clone());
    let component = Arc::new(ComponentRecoveryService::new(
        store.clone(),
        registry,
        deps,
    ));

    let orchestrator = outcome.map(|outcome| {
        Arc::new(Scripted {
            outcome,
            calls: AtomicU32::new(0),
            clock: clock.clone(),
        })
    });
    let manager = Arc::new(RecoveryManagerService::new(
        orchestrator
            .clone()
            .map(|o| o as Arc<dyn RecoveryOrchestrator>),
        component,
        monitor.clone(),
        clock.clone(),
    ));

    Fixture {
        manager,
        monitor,
        store,
        clock,
        orchestrator,
    }
}

async fn seed_valve(store: &MemoryDeviceStore, id: &str) {
    store
        .save_snapshot(DeviceSnapshot::new(id, "Drip valve", "valve", json!({"zone": 2})))
        .await
        .unwrap();
}

fn leak(device_id: &str) -> ErrorRecord {
    ErrorRecord::builder(device_id, "pressure drop")
        .code("LEAK")
        .build()
}

#[test]
async fn test_orchestrator_is_tried_first() {
    let f = fixture(Some(Outcome::Heal));
    seed_valve(&f.store, "valve-1").await;

    let status = f.manager.attempt_recovery(&leak("valve-1")).await;
    assert!(status.is_successful);
    assert_eq!(status.successful_strategy.as_deref(), Some(ORCHESTRATED_RECOVERY));
    assert_eq!(status.attempt_count, 1);
    assert_eq!(status.error_codes, vec!["LEAK".to_string()]);
    assert!(f.store.get_device("valve-1").await.is_none());
}

#[test]
async fn test_orchestrated_success_clears_active_error() {
    let f = fixture(Some(Outcome::Heal));
    let error = f.monitor.report_error(leak("valve-1")).await;
    assert!(f.monitor.has_active_errors(Severity::Error).await);

    let status = f.manager.attempt_recovery(&error).await;
    assert!(status.is_successful);
    assert_eq!(status.successful_strategy.as_deref(), Some(ORCHESTRATED_RECOVERY));

    assert!(f.monitor.get_active_error("valve-1", "LEAK").await.is_none());
    assert!(!f.monitor.has_active_errors(Severity::Error).await);
}

#[test]
async fn test_falls_back_to_component_recovery() {
    for outcome in [Outcome::Decline, Outcome::Fail, Outcome::Panic] {
        let f = fixture(Some(outcome));
        seed_valve(&f.store, "valve-1").await;

        let status = f.manager.attempt_recovery(&leak("valve-1")).await;
        assert!(status.is_successful);
        assert_eq!(status.successful_strategy.as_deref(), Some(COMPONENT_RECOVERY));
        assert!(f.store.get_device("valve-1").await.is_some());
        assert_eq!(
            f.orchestrator.as_ref().unwrap().calls.load(Ordering::SeqCst),
            1
        );
    }
}

#[test]
async fn test_failure_is_reported_not_raised() {
    let f = fixture(Some(Outcome::Fail));

    let status = f.manager.attempt_recovery(&leak("valve-9")).await;
    assert!(!status.is_successful);
    assert!(status.successful_strategy.is_none());
    assert_eq!(status.attempt_count, 1);

    f.clock.advance_secs(10);
    let status = f.manager.attempt_recovery(&leak("valve-9")).await;
    assert_eq!(status.attempt_count, 2);
}

#[test]
async fn test_statistics_by_code() {
    let f = fixture(None);
    let start = f.clock.now();
    seed_valve(&f.store, "valve-1").await;

    assert!(f.manager.attempt_recovery(&leak("valve-1")).await.is_successful);
    assert!(!f.manager.attempt_recovery(&leak("valve-2")).await.is_successful);
    f.clock.advance_secs(60);
    assert!(!f.manager.attempt_recovery(&leak("valve-3")).await.is_successful);

    let coded_less = ErrorRecord::builder("valve-4", "unknown fault").build();
    f.manager.attempt_recovery(&coded_less).await;

    let stats = f.manager.get_recovery_statistics(start).await;
    let leak_stats = &stats.by_code["LEAK"];
    assert_eq!(leak_stats.attempts, 3);
    assert_eq!(leak_stats.successes, 1);
    assert_eq!(leak_stats.success_rate, Some(33));
    assert_eq!(stats.by_code["unknown"].attempts, 1);
    assert_eq!(stats.total_attempts, 4);
    assert_eq!(stats.success_rate, Some(25));

    let recent = f
        .manager
        .get_recovery_statistics(start + Duration::seconds(30))
        .await;
    assert_eq!(recent.by_code["LEAK"].attempts, 1);
    assert_eq!(recent.by_code["LEAK"].success_rate, Some(0));

    let future = f
        .manager
        .get_recovery_statistics(f.clock.now() + Duration::hours(1))
        .await;
    assert_eq!(future.total_attempts, 0);
    assert_eq!(future.success_rate, None);
}

#[test]
async fn test_device_recovery_without_active_errors() {
    let f = fixture(None);
    seed_valve(&f.store, "valve-1").await;

    let status = f.manager.attempt_device_recovery("valve-1").await;
    assert!(status.is_successful);
    assert_eq!(status.successful_strategy.as_deref(), Some(COMPONENT_RECOVERY));
    assert!(status.error_codes.is_empty());

    let history = f.manager.history().await;
    assert_eq!(history[DEVICE_RECOVERY]["valve-1"].success_count, 1);
}

#[test]
async fn test_device_recovery_covers_active_errors() {
    let f = fixture(Some(Outcome::Heal));
    f.monitor.report_error(leak("valve-1")).await;
    f.monitor
        .report_error(
            ErrorRecord::builder("valve-1", "solenoid slow")
                .code("SLOW_ACTUATION")
                .severity(Severity::Warning)
                .build(),
        )
        .await;

    let status = f.manager.attempt_device_recovery("valve-1").await;
    assert!(status.is_successful);
    assert_eq!(status.successful_strategy.as_deref(), Some(ORCHESTRATED_RECOVERY));
    assert_eq!(status.error_codes.len(), 2);
    assert_eq!(
        f.orchestrator.as_ref().unwrap().calls.load(Ordering::SeqCst),
        2
    );

    let history = f.manager.history().await;
    assert!(history.contains_key("LEAK"));
    assert!(history.contains_key("SLOW_ACTUATION"));
    assert!(f
        .monitor
        .get_active_errors_for_device("valve-1")
        .await
        .is_empty());
}

#[test]
async fn test_attach_routes_recoverable_errors() {
    let f = fixture(Some(Outcome::Heal));
    f.manager.attach(&f.monitor);
    assert_eq!(f.monitor.subscriber_count(), 1);

    f.monitor.report_error(leak("valve-1")).await;
    f.monitor
        .report_error(
            ErrorRecord::builder("valve-1", "coil burnt")
                .code(codes::HARDWARE_FAILURE)
                .build(),
        )
        .await;
    f.monitor
        .report_error(ErrorRecord::builder("valve-1", "no code").build())
        .await;

    let orchestrator = f.orchestrator.as_ref().unwrap();
    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while orchestrator.calls.load(Ordering::SeqCst) < 1 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    assert_eq!(orchestrator.calls.load(Ordering::SeqCst), 1);
    let history = f.manager.history().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history["LEAK"]["valve-1"].success_count, 1);
}
