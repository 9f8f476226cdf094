//! Per-operation performance metrics
//!
//! Call count, timing and an exponential moving average of the success rate.

use crate::envelope::{Envelope, Failure};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Weight of the newest sample in the success-rate EMA
pub const SUCCESS_RATE_ALPHA: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationStats {
    pub count: u64,
    /// Seconds
    pub total_time: f64,
    /// Seconds
    pub average_time: f64,
    pub success_rate: f64,
}

impl Default for OperationStats {
    fn default() -> Self {
        Self {
            count: 0,
            total_time: 0.0,
            average_time: 0.0,
            success_rate: 1.0,
        }
    }
}

impl OperationStats {
    fn observe(&mut self, duration: Duration, success: bool) {
        self.count += 1;
        self.total_time += duration.as_secs_f64();
        self.average_time = self.total_time / self.count as f64;
        let sample = if success { 1.0 } else { 0.0 };
        self.success_rate = (1.0 - SUCCESS_RATE_ALPHA) * self.success_rate + SUCCESS_RATE_ALPHA * sample;
    }
}

/// Metrics owned by one operations object
#[derive(Debug, Default)]
pub struct PerformanceMetrics {
    operations: Mutex<HashMap<String, OperationStats>>,
}

impl PerformanceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, operation: &str, duration: Duration, success: bool) {
        let mut operations = self.operations.lock().unwrap_or_else(PoisonError::into_inner);
        operations
            .entry(operation.to_string())
            .or_default()
            .observe(duration, success);
    }

    pub fn get(&self, operation: &str) -> Option<OperationStats> {
        let operations = self.operations.lock().unwrap_or_else(PoisonError::into_inner);
        operations.get(operation).cloned()
    }

    /// Sorted copy of every operation's stats
    pub fn snapshot(&self) -> BTreeMap<String, OperationStats> {
        let operations = self.operations.lock().unwrap_or_else(PoisonError::into_inner);
        operations
            .iter()
            .map(|(name, stats)| (name.clone(), stats.clone()))
            .collect()
    }

    /// Stop the clock, record the sample and wrap the outcome.
    pub fn complete<T>(
        &self,
        operation: &str,
        started: Instant,
        outcome: Result<T, Failure>,
    ) -> Envelope<T> {
        let duration = started.elapsed();
        self.record(operation, duration, outcome.is_ok());
        if let Err(failure) = &outcome {
            tracing::debug!(operation, error = %failure, "IPFS operation failed");
        }
        Envelope { outcome, duration }
    }
}
