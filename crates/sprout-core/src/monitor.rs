//! Error monitor.
//!
//! Central registry of reported faults. It keeps:
//! - a bounded FIFO queue of recent records (oldest evicted first),
//! - the active records per device, keyed by error code,
//! - lifetime counts per error code,
//! - an index of records by correlation id,
//! - the error subscribers.
//!
//! Every subscriber gets its own worker task fed through an unbounded channel,
//! so a slow or failing subscriber never blocks reporting and each subscriber
//! sees records in report order.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::config::MonitorConfig;
use crate::eventbus::SubscriptionId;
use crate::record::{ErrorRecord, Severity};

/// Consumer of reported errors.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    async fn handle(&self, error: &ErrorRecord) -> anyhow::Result<()>;
}

/// Predicate deciding which records a subscriber receives.
pub type ErrorFilter = Arc<dyn Fn(&ErrorRecord) -> bool + Send + Sync>;

struct Subscriber {
    filter: Option<ErrorFilter>,
    tx: mpsc::UnboundedSender<ErrorRecord>,
}

impl Subscriber {
    fn accepts(&self, record: &ErrorRecord) -> bool {
        self.filter.as_ref().map_or(true, |f| f(record))
    }
}

/// Thread-safe error registry shared by devices and recovery services.
pub struct ErrorMonitor {
    capacity: usize,
    queue: RwLock<VecDeque<ErrorRecord>>,
    /// device id -> error code -> latest record.
    active: DashMap<String, DashMap<String, ErrorRecord>>,
    /// Lifetime report counts per code.
    totals: Mutex<HashMap<String, u64>>,
    correlations: DashMap<String, Vec<ErrorRecord>>,
    subscribers: DashMap<SubscriptionId, Subscriber>,
}

impl ErrorMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self::with_capacity(config.queue_capacity)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            queue: RwLock::new(VecDeque::with_capacity(capacity.min(4096))),
            active: DashMap::new(),
            totals: Mutex::new(HashMap::new()),
            correlations: DashMap::new(),
            subscribers: DashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Record an error and fan it out to subscribers.
    ///
    /// A record whose (device, code) pair is already active replaces the stored
    /// record but keeps its recovery attempt count. The stored record is returned.
    pub async fn report_error(&self, mut record: ErrorRecord) -> ErrorRecord {
        if let Some(code) = record.code().map(str::to_string) {
            let device_errors = self.active.entry(record.device_id().to_string()).or_default();
            match device_errors.entry(code.clone()) {
                Entry::Occupied(mut existing) => {
                    record.set_recovery_attempt_count(existing.get().recovery_attempt_count());
                    existing.insert(record.clone());
                }
                Entry::Vacant(slot) => {
                    slot.insert(record.clone());
                }
            }
            drop(device_errors);

            let mut totals = self.totals.lock().await;
            *totals.entry(code).or_insert(0) += 1;
        }

        if let Some(correlation_id) = record.correlation_id() {
            self.correlations
                .entry(correlation_id.to_string())
                .or_default()
                .push(record.clone());
        }

        let evicted = {
            let mut queue = self.queue.write().await;
            queue.push_back(record.clone());
            let mut evicted = Vec::new();
            while queue.len() > self.capacity {
                if let Some(old) = queue.pop_front() {
                    evicted.push(old);
                }
            }
            evicted
        };
        for old in &evicted {
            self.forget_correlation(old);
        }

        match record.severity() {
            Severity::Warning => tracing::debug!(
                device_id = %record.device_id(),
                code = record.code().unwrap_or("-"),
                "Error reported: {}",
                record.message()
            ),
            _ => tracing::warn!(
                device_id = %record.device_id(),
                code = record.code().unwrap_or("-"),
                severity = %record.severity(),
                "Error reported: {}",
                record.message()
            ),
        }

        self.notify_subscribers(&record);
        record
    }

    fn forget_correlation(&self, evicted: &ErrorRecord) {
        let Some(correlation_id) = evicted.correlation_id() else {
            return;
        };
        if let Some(mut group) = self.correlations.get_mut(correlation_id) {
            group.retain(|r| r.id() != evicted.id());
        }
        self.correlations
            .remove_if(correlation_id, |_, group| group.is_empty());
    }

    fn notify_subscribers(&self, record: &ErrorRecord) {
        for sub in self.subscribers.iter() {
            if !sub.accepts(record) {
                continue;
            }
            if sub.tx.send(record.clone()).is_err() {
                tracing::debug!(subscription = %sub.key(), "Error subscriber worker has stopped");
            }
        }
    }

    /// The newest `count` records, oldest first.
    pub async fn get_recent_errors(&self, count: usize) -> Vec<ErrorRecord> {
        let queue = self.queue.read().await;
        let skip = queue.len().saturating_sub(count);
        queue.iter().skip(skip).cloned().collect()
    }

    /// Whether any unhandled record in the queue is at least `min_severity`.
    pub async fn has_active_errors(&self, min_severity: Severity) -> bool {
        self.queue
            .read()
            .await
            .iter()
            .any(|r| !r.is_handled() && r.severity() >= min_severity)
    }

    /// Snapshot of the device's active records, oldest first. Empty if none.
    pub async fn get_active_errors_for_device(&self, device_id: &str) -> Vec<ErrorRecord> {
        let mut errors: Vec<ErrorRecord> = self
            .active
            .get(device_id)
            .map(|codes| codes.iter().map(|e| e.value().clone()).collect())
            .unwrap_or_default();
        errors.sort_by_key(|r| r.timestamp());
        errors
    }

    pub async fn get_active_error(&self, device_id: &str, code: &str) -> Option<ErrorRecord> {
        self.active
            .get(device_id)
            .and_then(|codes| codes.get(code).map(|r| r.value().clone()))
    }

    /// Register the outcome of a recovery attempt for (device, code).
    ///
    /// Success removes the active entry and marks queued records handled;
    /// failure increments the stored attempt count. Returns `false` if
    /// the pair was not active.
    pub async fn register_recovery_attempt(
        &self,
        device_id: &str,
        code: &str,
        successful: bool,
    ) -> bool {
        if !successful {
            let Some(codes) = self.active.get(device_id) else {
                return false;
            };
            let Some(mut record) = codes.get_mut(code) else {
                return false;
            };
            let attempts = record.increment_recovery_attempts();
            tracing::debug!(device_id, code, attempts, "Recovery attempt failed");
            return true;
        }

        let removed = self
            .active
            .get(device_id)
            .and_then(|codes| codes.remove(code))
            .is_some();
        self.active.remove_if(device_id, |_, codes| codes.is_empty());

        {
            let mut queue = self.queue.write().await;
            for record in queue
                .iter_mut()
                .filter(|r| r.device_id() == device_id && r.code() == Some(code))
            {
                record.mark_handled();
            }
        }
        for mut group in self.correlations.iter_mut() {
            for record in group
                .iter_mut()
                .filter(|r| r.device_id() == device_id && r.code() == Some(code))
            {
                record.mark_handled();
            }
        }

        if removed {
            tracing::info!(device_id, code, "Error cleared after recovery");
        }
        removed
    }

    /// Mark (device, code) as handled. Same effect as a successful recovery.
    pub async fn mark_error_handled(&self, device_id: &str, code: &str) -> bool {
        self.register_recovery_attempt(device_id, code, true).await
    }

    /// Queued records since `since`, counted by code. Code-less records are skipped.
    pub async fn get_error_statistics(&self, since: DateTime<Utc>) -> HashMap<String, usize> {
        let queue = self.queue.read().await;
        let mut stats = HashMap::new();
        for record in queue.iter().filter(|r| r.timestamp() >= since) {
            if let Some(code) = record.code() {
                *stats.entry(code.to_string()).or_insert(0) += 1;
            }
        }
        stats
    }

    /// Lifetime report counts per code, unaffected by queue eviction.
    pub async fn total_counts_by_code(&self) -> HashMap<String, u64> {
        self.totals.lock().await.clone()
    }

    pub async fn get_errors_by_code(&self, code: &str, since: DateTime<Utc>) -> Vec<ErrorRecord> {
        self.queue
            .read()
            .await
            .iter()
            .filter(|r| r.code() == Some(code) && r.timestamp() >= since)
            .cloned()
            .collect()
    }

    pub async fn get_errors_by_correlation_id(&self, correlation_id: &str) -> Vec<ErrorRecord> {
        self.correlations
            .get(correlation_id)
            .map(|group| group.value().clone())
            .unwrap_or_default()
    }

    pub async fn queue_len(&self) -> usize {
        self.queue.read().await.len()
    }

    /// Register an error subscriber. Without a filter every record is delivered.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn subscribe(
        &self,
        handler: Arc<dyn ErrorHandler>,
        filter: Option<ErrorFilter>,
    ) -> SubscriptionId {
        let id = SubscriptionId::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<ErrorRecord>();

        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                let outcome = AssertUnwindSafe(handler.handle(&record))
                    .catch_unwind()
                    .await;
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::error!(
                        subscription = %id,
                        device_id = %record.device_id(),
                        error = %e,
                        "Error subscriber failed"
                    ),
                    Err(_) => tracing::error!(
                        subscription = %id,
                        device_id = %record.device_id(),
                        "Error subscriber panicked"
                    ),
                }
            }
        });

        self.subscribers.insert(id, Subscriber { filter, tx });
        tracing::debug!(subscription = %id, "Error subscriber registered");
        id
    }

    /// Remove a subscriber. Records already queued for it are still delivered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.remove(&id).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl Default for ErrorMonitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}

/// Shared monitor handle.
pub type SharedErrorMonitor = Arc<ErrorMonitor>;
