//! Shared recovery vocabulary: outcome values, the backoff formula and the
//! orchestrator seam.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::record::ErrorRecord;

/// Largest exponent applied before the cap takes over.
const MAX_BACKOFF_EXPONENT: u32 = 20;

/// Wait required after `attempt_count` previous attempts:
/// `min(max_secs, base_secs * 2^attempt_count)`.
pub fn backoff_for(attempt_count: u32, base_secs: u64, max_secs: u64) -> Duration {
    let factor = 1u64 << attempt_count.min(MAX_BACKOFF_EXPONENT);
    let secs = base_secs.saturating_mul(factor).min(max_secs);
    Duration::seconds(secs as i64)
}

/// Whether an attempt is allowed given the last attempt time.
pub fn backoff_elapsed(
    last_attempt: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    backoff: Duration,
) -> bool {
    match last_attempt {
        Some(last) => now - last >= backoff,
        None => true,
    }
}

/// Result of one recovery attempt. Never mutated after it is returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryStatus {
    pub is_successful: bool,
    pub attempt_count: u32,
    pub error_codes: Vec<String>,
    /// Name of the path that worked, if any.
    pub successful_strategy: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl RecoveryStatus {
    pub fn succeeded(
        strategy: impl Into<String>,
        attempt_count: u32,
        error_codes: Vec<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            is_successful: true,
            attempt_count,
            error_codes,
            successful_strategy: Some(strategy.into()),
            timestamp,
        }
    }

    pub fn failed(attempt_count: u32, error_codes: Vec<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            is_successful: false,
            attempt_count,
            error_codes,
            successful_strategy: None,
            timestamp,
        }
    }
}

/// First-choice recovery path, resolving a strategy for a given error.
#[async_trait]
pub trait RecoveryOrchestrator: Send + Sync {
    /// Attempt to recover from `error`.
    async fn attempt_recovery(&self, error: &ErrorRecord) -> anyhow::Result<RecoveryStatus>;
}
