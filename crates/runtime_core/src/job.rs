use serde::Serialize;
use serde_json::Value;

use crate::error::{BoxError, ErrorKind};

/// Per-run counters reported by the execution runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobCounters {
    pub fetch_count: u32,
    pub fetch_bytes: u64,
    pub log_bytes: u64,
    pub logs_truncated: bool,
}

/// What a runtime hands back after a clean run.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub result: Value,
    pub job: JobCounters,
}

/// Faults a runtime can raise. Every one of them poisons the context.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RunError {
    #[error("execution timed out after {0}ms")]
    Timeout(u64),
    #[error("{0}")]
    Script(String),
    #[error("{0}")]
    ResultRejected(String),
    #[error("{0}")]
    Fatal(String),
}

impl RunError {
    /// Reason recorded when the faulted context is released.
    pub fn poison_reason(&self) -> &'static str {
        match self {
            RunError::Timeout(_) => "timeout",
            _ => "error_execution",
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RunError::Timeout(_) => ErrorKind::SandboxTimeout,
            RunError::Script(_) => ErrorKind::ScriptFail,
            RunError::ResultRejected(_) => ErrorKind::ResultNotSerializable,
            RunError::Fatal(_) => ErrorKind::SandboxFatal,
        }
    }
}

impl From<RunError> for BoxError {
    fn from(err: RunError) -> Self {
        let kind = err.kind();
        match err {
            RunError::Timeout(ms) => BoxError::new(kind, "Execution Timed Out")
                .with_details(serde_json::json!({ "timeoutMs": ms })),
            RunError::Script(message)
            | RunError::ResultRejected(message)
            | RunError::Fatal(message) => BoxError::new(kind, first_line(&message)),
        }
    }
}

/// Engine messages can carry source excerpts on later lines.
fn first_line(message: &str) -> String {
    let line = message.lines().next().unwrap_or_default().trim();
    if line.is_empty() {
        "Script failed".to_string()
    } else {
        line.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMeta {
    pub duration_ms: u64,
    pub fetch_count: u32,
    pub fetch_bytes: u64,
    pub log_bytes: u64,
    pub logs_truncated: bool,
}

impl ExecutionMeta {
    pub fn from_job(duration_ms: u64, job: &JobCounters) -> Self {
        Self {
            duration_ms,
            fetch_count: job.fetch_count,
            fetch_bytes: job.fetch_bytes,
            log_bytes: job.log_bytes,
            logs_truncated: job.logs_truncated,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub result: Value,
    pub meta: ExecutionMeta,
}

#[derive(Debug, Serialize)]
pub struct SuccessBody<'a> {
    pub ok: bool,
    pub result: &'a Value,
    pub meta: &'a ExecutionMeta,
}

impl ExecutionResult {
    pub fn to_body(&self) -> SuccessBody<'_> {
        SuccessBody {
            ok: true,
            result: &self.result,
            meta: &self.meta,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn timeout_has_its_own_poison_reason() {
        assert_eq!(RunError::Timeout(2000).poison_reason(), "timeout");
        assert_eq!(
            RunError::Script("boom".into()).poison_reason(),
            "error_execution"
        );
        assert_eq!(
            RunError::Fatal("heap".into()).poison_reason(),
            "error_execution"
        );
    }

    #[test]
    fn script_errors_keep_only_the_first_line() {
        let err = BoxError::from(RunError::Script(
            "SyntaxError: Invalid or unexpected token\n    at function main() { return \"x".into(),
        ));
        assert_eq!(err.kind, ErrorKind::ScriptFail);
        assert_eq!(err.message, "SyntaxError: Invalid or unexpected token");
    }

    #[test]
    fn success_body_uses_camel_case_meta() {
        let result = ExecutionResult {
            result: json!("ok"),
            meta: ExecutionMeta::from_job(
                12,
                &JobCounters {
                    fetch_count: 1,
                    fetch_bytes: 20,
                    log_bytes: 3,
                    logs_truncated: false,
                },
            ),
        };
        let body = serde_json::to_value(result.to_body()).expect("serialize");
        assert_eq!(
            body,
            json!({
                "ok": true,
                "result": "ok",
                "meta": {
                    "durationMs": 12,
                    "fetchCount": 1,
                    "fetchBytes": 20,
                    "logBytes": 3,
                    "logsTruncated": false
                }
            })
        );
    }
}
