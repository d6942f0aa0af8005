use std::time::Duration;

use pool::{DurationSummary, LabeledCounter};

/// Outcome counters for `Sandbox::execute`.
#[derive(Default)]
pub struct ExecutionMetrics {
    /// Keyed by "ok" or the error code
    pub executions: LabeledCounter,
    pub duration: DurationSummary,
}

impl ExecutionMetrics {
    pub fn record(&self, outcome: &str, elapsed: Duration) {
        self.executions.inc(outcome);
        self.duration.observe(elapsed);
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "executions_total": self.executions.to_json(),
            "execution_duration": self.duration.to_json(),
        })
    }
}
