//! Simulated garden: a few pumps and moisture sensors that fault at random
//! and are healed by the recovery pipeline.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::{json, Value};

use sprout_core::{
    codes, system_clock, Clock, ErrorMonitor, ErrorRecord, EventBus, EventHandler, EventMetadata,
    RecoveryConfig, RecoveryOrchestrator, Severity, SproutEvent, SubscriptionOptions,
};
use sprout_devices::{
    DeviceDeps, DeviceDriver, DeviceSpec, DeviceStore, DeviceTypeRegistry, ManagedDevice,
    MemoryDeviceStore, RedbDeviceStore, SharedDeviceStore,
};
use sprout_recovery::{
    ComponentRecoveryService, RecoveryManagerService, RestartDeviceStrategy, StrategyOrchestrator,
    UnrecoverableErrorHandler,
};

pub const PUMP: &str = "pump";
pub const MOISTURE_SENSOR: &str = "moisture_sensor";

const PUMP_FAULTS: &[&str] = &["PUMP_STALL", "LOW_PRESSURE", "DRY_RUN"];
const SENSOR_FAULTS: &[&str] = &["SENSOR_TIMEOUT", "READING_OUT_OF_RANGE"];

#[derive(Debug, Clone)]
pub struct SimulationOptions {
    pub devices: usize,
    pub duration_secs: u64,
    pub fail_rate: f64,
    pub managed_recovery: bool,
    pub store: Option<PathBuf>,
}

/// Water pump. Recovery fails with probability `fail_rate`.
struct SimulatedPump {
    fail_rate: f64,
    initialized: AtomicBool,
    running: AtomicBool,
    flow_lpm: AtomicU64,
}

impl SimulatedPump {
    fn new(fail_rate: f64) -> Self {
        Self {
            fail_rate,
            initialized: AtomicBool::new(false),
            running: AtomicBool::new(false),
            flow_lpm: AtomicU64::new(12),
        }
    }
}

#[async_trait]
impl DeviceDriver for SimulatedPump {
    fn type_name(&self) -> &str {
        PUMP
    }

    async fn on_initialize(&self) -> anyhow::Result<()> {
        // Only re-initialization can fail, so the garden always comes up.
        let reinit = self.initialized.swap(true, Ordering::SeqCst);
        if reinit && rand::thread_rng().gen_bool(self.fail_rate) {
            anyhow::bail!("pump controller did not answer");
        }
        Ok(())
    }

    async fn on_start(&self) -> anyhow::Result<()> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn on_stop(&self) -> anyhow::Result<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn on_recover(&self) -> anyhow::Result<bool> {
        let healed = rand::thread_rng().gen_bool(1.0 - self.fail_rate);
        if !healed {
            anyhow::bail!("impeller still blocked");
        }
        Ok(true)
    }

    fn properties(&self) -> Value {
        json!({ "flow_lpm": self.flow_lpm.load(Ordering::SeqCst) })
    }

    fn load_properties(&self, properties: &Value) -> anyhow::Result<()> {
        if let Some(flow) = properties["flow_lpm"].as_u64() {
            self.flow_lpm.store(flow, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Soil moisture sensor. Recovery re-calibrates and may report "not yet".
struct MoistureSensor {
    fail_rate: f64,
    threshold: AtomicU64,
}

#[async_trait]
impl DeviceDriver for MoistureSensor {
    fn type_name(&self) -> &str {
        MOISTURE_SENSOR
    }

    async fn on_recover(&self) -> anyhow::Result<bool> {
        Ok(rand::thread_rng().gen_bool(1.0 - self.fail_rate))
    }

    fn properties(&self) -> Value {
        json!({ "threshold": self.threshold.load(Ordering::SeqCst) })
    }

    fn load_properties(&self, properties: &Value) -> anyhow::Result<()> {
        if let Some(threshold) = properties["threshold"].as_u64() {
            self.threshold.store(threshold, Ordering::SeqCst);
        }
        Ok(())
    }
}

fn build_registry(fail_rate: f64) -> DeviceTypeRegistry {
    let registry = DeviceTypeRegistry::new();
    registry.register(PUMP, move |_spec| {
        Some(Box::new(SimulatedPump::new(fail_rate)) as Box<dyn DeviceDriver>)
    });
    registry.register(MOISTURE_SENSOR, move |_spec| {
        Some(Box::new(MoistureSensor {
            fail_rate,
            threshold: AtomicU64::new(35),
        }) as Box<dyn DeviceDriver>)
    });
    registry
}

/// Logs every device alert published on the bus.
struct AlertLogger;

#[async_trait]
impl EventHandler for AlertLogger {
    async fn handle(&self, event: &SproutEvent, metadata: &EventMetadata) -> anyhow::Result<()> {
        if let SproutEvent::DeviceAlert {
            device_id,
            error_code,
            severity,
            message,
            ..
        } = event
        {
            tracing::info!(
                device_id = %device_id,
                code = error_code.as_deref().unwrap_or("-"),
                severity = severity.as_str(),
                source = %metadata.source,
                "Alert: {}",
                message
            );
        }
        Ok(())
    }
}

fn random_fault(device: &ManagedDevice, fail_rate: f64) -> ErrorRecord {
    let mut rng = rand::thread_rng();

    // Roughly one fault in twenty is a hardware failure.
    if rng.gen_bool(0.05) {
        return ErrorRecord::builder(device.id(), "hardware self-test failed")
            .code(codes::HARDWARE_FAILURE)
            .severity(Severity::Critical)
            .build();
    }

    let faults = if device.type_name() == PUMP {
        PUMP_FAULTS
    } else {
        SENSOR_FAULTS
    };
    let code = faults.choose(&mut rng).copied().unwrap_or("UNKNOWN");
    let severity = if rng.gen_bool(0.3) {
        Severity::Warning
    } else {
        Severity::Error
    };

    ErrorRecord::builder(device.id(), format!("simulated {}", code.to_lowercase()))
        .code(code)
        .severity(severity)
        .transient(rng.gen_bool(0.5))
        .context("fail_rate", fail_rate)
        .build()
}

pub async fn run(options: SimulationOptions, config: RecoveryConfig) -> Result<()> {
    let clock = system_clock();
    let started = clock.now();

    let monitor = Arc::new(ErrorMonitor::new(config.monitor.clone()));
    let event_bus = EventBus::with_name("garden");
    let store: SharedDeviceStore = match &options.store {
        Some(path) => Arc::new(RedbDeviceStore::open(path)?),
        None => Arc::new(MemoryDeviceStore::new()),
    };
    let registry = Arc::new(build_registry(options.fail_rate));

    let orchestrator: Arc<dyn RecoveryOrchestrator> = Arc::new(
        StrategyOrchestrator::new(clock.clone())
            .with_strategy(Arc::new(RestartDeviceStrategy::new(store.clone()))),
    );
    let deps = DeviceDeps::new(monitor.clone(), event_bus.clone())
        .with_clock(clock.clone())
        .with_config(config.self_healing.clone())
        .with_orchestrator(orchestrator.clone());

    let component = Arc::new(ComponentRecoveryService::new(
        store.clone(),
        registry.clone(),
        deps.clone(),
    ));
    let manager = Arc::new(RecoveryManagerService::new(
        Some(orchestrator.clone()),
        component,
        monitor.clone(),
        clock.clone(),
    ));
    if options.managed_recovery {
        manager.attach(&monitor);
    }

    let unrecoverable = Arc::new(UnrecoverableErrorHandler::new(
        monitor.clone(),
        clock.clone(),
        config.unrecoverable.clone(),
    ));
    unrecoverable.start()?;

    let alerts = event_bus.subscribe_handler(Arc::new(AlertLogger), SubscriptionOptions::alerts());

    let mut devices = Vec::with_capacity(options.devices);
    for i in 0..options.devices {
        let (type_name, name) = if i % 2 == 0 {
            (PUMP, format!("Pump {}", i / 2 + 1))
        } else {
            (MOISTURE_SENSOR, format!("Moisture sensor {}", i / 2 + 1))
        };
        let spec = DeviceSpec::new(format!("{}-{}", type_name, i + 1), name, type_name);
        let device = ManagedDevice::from_spec(&spec, registry.instantiate(&spec)?, deps.clone());
        device.initialize().await?;
        device.start().await?;
        store.add_or_update(device.clone()).await?;
        devices.push(device);
    }

    tracing::info!(
        devices = devices.len(),
        duration_secs = options.duration_secs,
        fail_rate = options.fail_rate,
        managed_recovery = options.managed_recovery,
        "Simulation started"
    );

    let deadline = tokio::time::sleep(Duration::from_secs(options.duration_secs));
    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(deadline, interrupted);
    let mut tick = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = &mut interrupted => {
                tracing::info!("Interrupted");
                break;
            }
            _ = tick.tick() => {
                for device in &devices {
                    if rand::thread_rng().gen_bool(options.fail_rate) {
                        device.report_error(random_fault(device, options.fail_rate)).await;
                    }
                }
            }
        }
    }

    unrecoverable.stop().await;
    event_bus.unsubscribe(alerts);

    let error_stats = monitor.get_error_statistics(started).await;
    let recovery_stats = manager.get_recovery_statistics(started).await;
    let states: serde_json::Map<String, Value> = devices
        .iter()
        .map(|d| (d.id().to_string(), json!(d.state().as_str())))
        .collect();

    for device in &devices {
        device.dispose().await;
    }

    let summary = json!({
        "errors_by_code": error_stats,
        "queued_errors": monitor.queue_len().await,
        "device_states": states,
        "managed_recovery": recovery_stats,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
