//! Tests for ManagedDevice self-healing

use async_trait::async_trait;
use chrono::Duration;
use sprout_core::record::codes;
use sprout_core::{
    AlertSeverity, Clock, ErrorMonitor, ErrorRecord, EventBus, ManualClock, RecoveryOrchestrator,
    RecoveryStatus, Severity, SproutEvent,
};
use sprout_devices::{DeviceDeps, DeviceDriver, DeviceState, ManagedDevice};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::test;

struct TestPump {
    recover_calls: Arc<AtomicU32>,
    failures_left: AtomicU32,
}

#[async_trait]
impl DeviceDriver for TestPump {
    fn type_name(&self) -> &str {
        "test_pump"
    }

    async fn on_recover(&self) -> anyhow::Result<bool> {
        self.recover_calls.fetch_add(1, Ordering::SeqCst);
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Ok(false);
        }
        Ok(true)
    }
}

struct Harness {
    device: Arc<ManagedDevice>,
    monitor: Arc<ErrorMonitor>,
    clock: Arc<ManualClock>,
    recover_calls: Arc<AtomicU32>,
}

fn harness(failures_before_success: u32) -> Harness {
    harness_with(failures_before_success, None)
}

fn harness_with(
    failures_before_success: u32,
    orchestrator: Option<Arc<dyn RecoveryOrchestrator>>,
) -> Harness {
    let monitor = Arc::new(ErrorMonitor::default());
    let clock = Arc::new(ManualClock::starting_now());
    let recover_calls = Arc::new(AtomicU32::new(0));

    let mut deps = DeviceDeps::new(monitor.clone(), EventBus::new()).with_clock(clock.clone());
    if let Some(orchestrator) = orchestrator {
        deps = deps.with_orchestrator(orchestrator);
    }

    let device = ManagedDevice::new(
        "pump-1",
        "Main pump",
        Box::new(TestPump {
            recover_calls: recover_calls.clone(),
            failures_left: AtomicU32::new(failures_before_success),
        }),
        deps,
    );

    Harness {
        device,
        monitor,
        clock,
        recover_calls,
    }
}

/// Put the device in `Error` without scheduling background recovery, and
/// register an active `PUMP_STALL` error directly with the monitor.
async fn break_device(h: &Harness) {
    h.device.initialize().await.unwrap();
    h.device
        .report_error(
            ErrorRecord::builder("pump-1", "wiring fault")
                .code("WIRING")
                .severity(Severity::Error)
                .recoverable(false)
                .build(),
        )
        .await;
    assert_eq!(h.device.state(), DeviceState::Error);

    h.monitor
        .report_error(
            ErrorRecord::builder("pump-1", "impeller stalled")
                .code("PUMP_STALL")
                .timestamp(h.clock.now())
                .build(),
        )
        .await;
}

#[test]
async fn test_ceiling_reports_limit_exceeded_once() {
    let h = harness(u32::MAX);
    break_device(&h).await;

    for _ in 0..3 {
        assert!(!h.device.try_recover().await);
    }
    assert_eq!(h.recover_calls.load(Ordering::SeqCst), 3);
    assert_eq!(h.device.consecutive_failures(), 3);

    for _ in 0..4 {
        assert!(!h.device.try_recover().await);
    }
    assert_eq!(h.recover_calls.load(Ordering::SeqCst), 3);

    let since = h.clock.now() - Duration::days(1);
    let limit = h
        .monitor
        .get_errors_by_code(codes::RECOVERY_LIMIT_EXCEEDED, since)
        .await;
    assert_eq!(limit.len(), 1);
    assert_eq!(limit[0].severity(), Severity::Critical);
    assert!(!limit[0].is_recoverable());

    let exceptions = h
        .monitor
        .get_errors_by_code(codes::RECOVERY_EXCEPTION, since)
        .await;
    assert_eq!(exceptions.len(), 3);
}

#[test]
async fn test_throttle_follows_backoff() {
    let h = harness(u32::MAX);
    break_device(&h).await;

    // First attempt always passes.
    assert!(!h.device.attempt_recovery_for_error("PUMP_STALL").await);
    assert_eq!(h.recover_calls.load(Ordering::SeqCst), 1);
    let active = h.monitor.get_active_error("pump-1", "PUMP_STALL").await.unwrap();
    assert_eq!(active.recovery_attempt_count(), 1);

    // One failed attempt on file: 10s backoff.
    assert!(!h.device.attempt_recovery_for_error("PUMP_STALL").await);
    h.clock.advance_secs(9);
    assert!(!h.device.attempt_recovery_for_error("PUMP_STALL").await);
    assert_eq!(h.recover_calls.load(Ordering::SeqCst), 1);

    h.clock.advance_secs(1);
    assert!(!h.device.attempt_recovery_for_error("PUMP_STALL").await);
    assert_eq!(h.recover_calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.device.throttle_failures("PUMP_STALL").await, 2);

    // Two failed attempts: 20s backoff.
    h.clock.advance_secs(19);
    assert!(!h.device.attempt_recovery_for_error("PUMP_STALL").await);
    assert_eq!(h.recover_calls.load(Ordering::SeqCst), 2);
    h.clock.advance_secs(1);
    assert!(!h.device.attempt_recovery_for_error("PUMP_STALL").await);
    assert_eq!(h.recover_calls.load(Ordering::SeqCst), 3);
}

#[test]
async fn test_success_resets_counter_and_clears_error() {
    let h = harness(1);
    break_device(&h).await;

    assert!(!h.device.attempt_recovery_for_error("PUMP_STALL").await);
    assert_eq!(h.device.consecutive_failures(), 1);

    h.clock.advance_secs(10);
    assert!(h.device.attempt_recovery_for_error("PUMP_STALL").await);

    assert_eq!(h.device.consecutive_failures(), 0);
    assert_eq!(h.device.state(), DeviceState::Ready);
    assert!(h
        .monitor
        .get_active_error("pump-1", "PUMP_STALL")
        .await
        .is_none());
    assert!(h
        .monitor
        .get_active_error("pump-1", codes::RECOVERY_EXCEPTION)
        .await
        .is_none());
    assert!(h.device.last_recovery_attempt("PUMP_STALL").await.is_none());
}

#[test]
async fn test_not_in_error_is_noop_success() {
    let h = harness(u32::MAX);
    h.device.initialize().await.unwrap();

    assert!(h.device.try_recover().await);
    assert_eq!(h.recover_calls.load(Ordering::SeqCst), 0);
}

#[test]
async fn test_report_schedules_background_recovery() {
    let h = harness(0);
    h.device.initialize().await.unwrap();
    h.device.start().await.unwrap();

    h.device
        .report_error(
            ErrorRecord::builder("pump-1", "pressure drop")
                .code("LOW_PRESSURE")
                .severity(Severity::Error)
                .transient(true)
                .build(),
        )
        .await;

    for _ in 0..100 {
        if h.device.state() == DeviceState::Ready {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    assert_eq!(h.device.state(), DeviceState::Ready);
    assert_eq!(h.recover_calls.load(Ordering::SeqCst), 1);
    for _ in 0..100 {
        if h.monitor.get_active_error("pump-1", "LOW_PRESSURE").await.is_none() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(h
        .monitor
        .get_active_errors_for_device("pump-1")
        .await
        .is_empty());
}

#[test]
async fn test_warning_does_not_change_state_or_recover() {
    let h = harness(0);
    h.device.initialize().await.unwrap();

    h.device
        .report_error(
            ErrorRecord::builder("pump-1", "slightly warm")
                .code("TEMP_HIGH")
                .severity(Severity::Warning)
                .build(),
        )
        .await;
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    assert_eq!(h.device.state(), DeviceState::Ready);
    assert_eq!(h.recover_calls.load(Ordering::SeqCst), 0);
}

#[test]
async fn test_alert_published_with_mapped_severity() {
    let monitor = Arc::new(ErrorMonitor::default());
    let bus = EventBus::new();
    let mut rx = bus.subscribe_filtered(SproutEvent::is_alert_event);
    let device = ManagedDevice::new(
        "valve-1",
        "Valve",
        Box::new(TestPump {
            recover_calls: Arc::new(AtomicU32::new(0)),
            failures_left: AtomicU32::new(0),
        }),
        DeviceDeps::new(monitor, bus.clone()),
    );

    device
        .report_error(
            ErrorRecord::builder("valve-1", "coil burnt")
                .code(codes::HARDWARE_FAILURE)
                .severity(Severity::Catastrophic)
                .build(),
        )
        .await;

    let (event, meta) = rx.recv().await.unwrap();
    assert_eq!(meta.source, "valve-1");
    match event {
        SproutEvent::DeviceAlert {
            device_id,
            severity,
            error_code,
            ..
        } => {
            assert_eq!(device_id, "valve-1");
            assert_eq!(severity, AlertSeverity::Critical);
            assert_eq!(error_code.as_deref(), Some(codes::HARDWARE_FAILURE));
        }
        other => panic!("unexpected event {:?}", other),
    }
}

struct AlwaysHeals {
    calls: AtomicU32,
}

#[async_trait]
impl RecoveryOrchestrator for AlwaysHeals {
    async fn attempt_recovery(&self, error: &ErrorRecord) -> anyhow::Result<RecoveryStatus> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(RecoveryStatus::succeeded(
            "test",
            1,
            error.code().map(str::to_string).into_iter().collect(),
            error.timestamp(),
        ))
    }
}

struct NeverHeals;

#[async_trait]
impl RecoveryOrchestrator for NeverHeals {
    async fn attempt_recovery(&self, _error: &ErrorRecord) -> anyhow::Result<RecoveryStatus> {
        anyhow::bail!("no strategy")
    }
}

#[test]
async fn test_orchestrator_is_tried_first() {
    let orchestrator = Arc::new(AlwaysHeals {
        calls: AtomicU32::new(0),
    });
    let h = harness_with(u32::MAX, Some(orchestrator.clone() as Arc<dyn RecoveryOrchestrator>));
    break_device(&h).await;

    assert!(h.device.try_recover().await);
    assert_eq!(orchestrator.calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.recover_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.device.state(), DeviceState::Ready);
}

#[test]
async fn test_orchestrator_failure_falls_back_to_direct() {
    let h = harness_with(0, Some(Arc::new(NeverHeals) as Arc<dyn RecoveryOrchestrator>));
    break_device(&h).await;

    assert!(h.device.try_recover().await);
    assert_eq!(h.recover_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.device.state(), DeviceState::Ready);
}

#[test]
async fn test_dispose() {
    let h = harness(0);
    h.device.initialize().await.unwrap();
    h.device.start().await.unwrap();

    h.device.dispose().await;
    assert_eq!(h.device.state(), DeviceState::Disposed);
    assert!(h.device.initialize().await.is_err());
}

#[test]
async fn test_dispose_cancels_pending_recovery() {
    let h = harness(0);
    h.device.initialize().await.unwrap();

    h.device
        .report_error(
            ErrorRecord::builder("pump-1", "impeller stalled")
                .code("PUMP_STALL")
                .severity(Severity::Error)
                .build(),
        )
        .await;
    h.device.dispose().await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    assert_eq!(h.device.state(), DeviceState::Disposed);
    assert_eq!(h.recover_calls.load(Ordering::SeqCst), 0);
    assert!(h
        .monitor
        .get_active_error("pump-1", "PUMP_STALL")
        .await
        .is_some());

    assert!(!h.device.try_recover().await);
    assert!(!h.device.attempt_recovery_for_error("PUMP_STALL").await);
    assert!(h
        .monitor
        .get_active_error("pump-1", "PUMP_STALL")
        .await
        .is_some());
}

#[test]
async fn test_external_restart_resets_failure_ceiling() {
    let h = harness(u32::MAX);
    break_device(&h).await;

    for _ in 0..4 {
        assert!(!h.device.try_recover().await);
    }
    assert_eq!(h.device.consecutive_failures(), 3);

    // Healed from outside the device, as a restart strategy does.
    h.device.initialize().await.unwrap();
    assert_eq!(h.device.state(), DeviceState::Ready);
    assert_eq!(h.device.consecutive_failures(), 0);

    h.device
        .report_error(
            ErrorRecord::builder("pump-1", "wiring fault")
                .code("WIRING")
                .severity(Severity::Error)
                .recoverable(false)
                .build(),
        )
        .await;
    assert_eq!(h.device.state(), DeviceState::Error);

    for _ in 0..4 {
        assert!(!h.device.try_recover().await);
    }
    assert_eq!(h.recover_calls.load(Ordering::SeqCst), 6);

    let since = h.clock.now() - Duration::days(1);
    let limit = h
        .monitor
        .get_errors_by_code(codes::RECOVERY_LIMIT_EXCEEDED, since)
        .await;
    assert_eq!(limit.len(), 2);
}
