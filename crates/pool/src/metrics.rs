use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counter keyed by a reason or outcome label.
#[derive(Default)]
pub struct LabeledCounter {
    values: Mutex<BTreeMap<String, u64>>,
}

impl LabeledCounter {
    pub fn inc(&self, label: &str) {
        let mut values = self
            .values
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *values.entry(label.to_string()).or_insert(0) += 1;
    }

    pub fn get(&self, label: &str) -> u64 {
        self.values
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(label)
            .copied()
            .unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.values
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .values()
            .sum()
    }

    pub fn to_json(&self) -> serde_json::Value {
        let values = self
            .values
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        serde_json::to_value(&*values).unwrap_or_default()
    }
}

/// Running sum/count pair for a duration series.
#[derive(Default)]
pub struct DurationSummary {
    count: AtomicU64,
    total_us: AtomicU64,
}

impl DurationSummary {
    pub fn observe(&self, elapsed: Duration) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn to_json(&self) -> serde_json::Value {
        let count = self.count.load(Ordering::Relaxed);
        let total_us = self.total_us.load(Ordering::Relaxed);
        let avg_ms = if count == 0 {
            0.0
        } else {
            total_us as f64 / count as f64 / 1000.0
        };
        serde_json::json!({
            "count": count,
            "sum_seconds": total_us as f64 / 1_000_000.0,
            "avg_ms": avg_ms,
        })
    }
}

// ========== Pool Metrics ==========

/// Metrics for monitoring pool health
#[derive(Default)]
pub struct PoolMetrics {
    pub created: LabeledCounter,
    pub disposed: LabeledCounter,
    pub poisoned: LabeledCounter,
    pub acquire_errors: LabeledCounter,
    pub acquired: AtomicU64,
    pub handoffs: AtomicU64,
    pub acquire_duration: DurationSummary,
    pub queue_wait: DurationSummary,
    active: AtomicU64,
    total: AtomicU64,
    queue_length: AtomicU64,
}

impl PoolMetrics {
    pub fn set_gauges(&self, active: usize, idle: usize, queued: usize) {
        self.active.store(active as u64, Ordering::Relaxed);
        self.total.store((active + idle) as u64, Ordering::Relaxed);
        self.queue_length.store(queued as u64, Ordering::Relaxed);
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    pub fn queue_length(&self) -> u64 {
        self.queue_length.load(Ordering::Relaxed)
    }

    /// Get metrics as a JSON-serializable snapshot
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "active_isolates": self.active.load(Ordering::Relaxed),
            "pool_size": self.total.load(Ordering::Relaxed),
            "queue_length": self.queue_length.load(Ordering::Relaxed),
            "acquired_total": self.acquired.load(Ordering::Relaxed),
            "handoffs_total": self.handoffs.load(Ordering::Relaxed),
            "acquire_errors_total": self.acquire_errors.to_json(),
            "isolates_created_total": self.created.to_json(),
            "isolates_disposed_total": self.disposed.to_json(),
            "isolates_poisoned_total": self.poisoned.to_json(),
            "acquire_duration": self.acquire_duration.to_json(),
            "queue_wait": self.queue_wait.to_json(),
        })
    }
}
