use std::sync::Arc;
use std::time::{Duration, Instant};

use pool::{IsolatePool, PooledIsolate};
use runtime_core::{BoxError, ErrorKind, ExecutionMeta, ExecutionResult, Params, RunError};

use crate::metrics::ExecutionMetrics;
use crate::runtime::ExecutionRuntime;

/// Slack on top of the run timeout before the facade gives up on a runtime
/// that failed to enforce its own deadline.
const RUNTIME_GRACE: Duration = Duration::from_millis(1_000);

/// One script per call: acquire, run under a deadline, release.
pub struct Sandbox<R: ExecutionRuntime> {
    pool: IsolatePool<R>,
    exec_timeout: Duration,
    metrics: Arc<ExecutionMetrics>,
}

impl<R: ExecutionRuntime> Sandbox<R> {
    pub fn new(pool: IsolatePool<R>, exec_timeout: Duration) -> Self {
        Self {
            pool,
            exec_timeout,
            metrics: Arc::new(ExecutionMetrics::default()),
        }
    }

    pub fn pool(&self) -> &IsolatePool<R> {
        &self.pool
    }

    pub fn metrics(&self) -> &ExecutionMetrics {
        &self.metrics
    }

    pub async fn execute(&self, script: &str, params: &Params) -> Result<ExecutionResult, BoxError> {
        let started = Instant::now();
        let isolate = match self.pool.acquire().await {
            Ok(isolate) => isolate,
            Err(err) => {
                self.metrics.record(err.code(), started.elapsed());
                return Err(err);
            }
        };
        let mut lease = Lease::new(&self.pool, isolate);
        tracing::debug!(isolate = %lease.id(), "Running script");

        let runtime = Arc::clone(self.pool.factory());
        let deadline = self.exec_timeout + RUNTIME_GRACE;
        let Some(isolate) = lease.inner_mut() else {
            return Err(BoxError::new(ErrorKind::Internal, "Lease lost its isolate"));
        };
        let outcome = match tokio::time::timeout(
            deadline,
            runtime.run(isolate, script, params, self.exec_timeout),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(RunError::Timeout(self.exec_timeout.as_millis() as u64)),
        };
        let elapsed = started.elapsed();

        match outcome {
            Ok(output) => {
                lease.release(None);
                self.metrics.record("ok", elapsed);
                Ok(ExecutionResult {
                    result: output.result,
                    meta: ExecutionMeta::from_job(elapsed.as_millis() as u64, &output.job),
                })
            }
            Err(err) => {
                let reason = err.poison_reason();
                lease.release(Some(reason));
                let err = BoxError::from(err);
                self.metrics.record(err.code(), elapsed);
                tracing::debug!(reason, code = err.code(), "Script run failed");
                Err(err)
            }
        }
    }
}

/// Holds a borrowed isolate. Released exactly once, by `release` or on drop.
struct Lease<'a, R: ExecutionRuntime> {
    pool: &'a IsolatePool<R>,
    isolate: Option<PooledIsolate<R::Isolate>>,
}

impl<'a, R: ExecutionRuntime> Lease<'a, R> {
    fn new(pool: &'a IsolatePool<R>, isolate: PooledIsolate<R::Isolate>) -> Self {
        Self {
            pool,
            isolate: Some(isolate),
        }
    }

    fn id(&self) -> &str {
        self.isolate.as_ref().map(|isolate| isolate.id()).unwrap_or_default()
    }

    fn inner_mut(&mut self) -> Option<&mut R::Isolate> {
        self.isolate.as_mut().map(PooledIsolate::inner_mut)
    }

    fn release(&mut self, poison: Option<&str>) {
        if let Some(isolate) = self.isolate.take() {
            self.pool.release(isolate, poison);
        }
    }
}

impl<R: ExecutionRuntime> Drop for Lease<'_, R> {
    fn drop(&mut self) {
        // Only reached when the request future was dropped mid-run.
        self.release(Some("abandoned"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pool::{IsolateFactory, PoolConfig};
    use runtime_core::{JobCounters, RunOutput};
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Scripts are matched by keyword instead of being executed.
    #[derive(Default)]
    struct ScriptedRuntime {
        disposed: Mutex<Vec<String>>,
    }

    struct StubIsolate {
        id: String,
        dead: AtomicBool,
    }

    #[async_trait]
    impl IsolateFactory for ScriptedRuntime {
        type Isolate = StubIsolate;

        async fn create(&self, id: &str) -> Result<StubIsolate, String> {
            Ok(StubIsolate {
                id: id.to_string(),
                dead: AtomicBool::new(false),
            })
        }

        fn is_disposed(&self, isolate: &StubIsolate) -> bool {
            isolate.dead.load(Ordering::SeqCst)
        }

        fn dispose(&self, isolate: StubIsolate) {
            self.disposed.lock().expect("lock").push(isolate.id);
        }
    }

    #[async_trait]
    impl ExecutionRuntime for ScriptedRuntime {
        async fn run(
            &self,
            _isolate: &mut StubIsolate,
            script: &str,
            params: &Params,
            timeout: Duration,
        ) -> Result<RunOutput, RunError> {
            if script.contains("hang") {
                tokio::time::sleep(Duration::from_secs(3_600)).await;
            }
            if script.contains("spin") {
                return Err(RunError::Timeout(timeout.as_millis() as u64));
            }
            if script.contains("throw") {
                return Err(RunError::Script("Error: boom".to_string()));
            }
            if script.contains("explode") {
                return Err(RunError::Fatal("isolate crashed".to_string()));
            }
            Ok(RunOutput {
                result: json!({ "echo": params.get("name").cloned().unwrap_or_default() }),
                job: JobCounters {
                    fetch_count: 2,
                    fetch_bytes: 128,
                    log_bytes: 5,
                    logs_truncated: false,
                },
            })
        }
    }

    async fn sandbox(exec_timeout_ms: u64) -> Sandbox<ScriptedRuntime> {
        let config = PoolConfig {
            pool_size: 1,
            max_concurrency: 1,
            max_queue_size: 1,
            ..PoolConfig::default()
        };
        let pool = IsolatePool::new(config, Arc::new(ScriptedRuntime::default()));
        pool.warm_up().await.expect("warm up");
        Sandbox::new(pool, Duration::from_millis(exec_timeout_ms))
    }

    fn params(value: serde_json::Value) -> Params {
        value.as_object().cloned().expect("object")
    }

    #[tokio::test]
    async fn success_returns_result_and_meta() {
        let sandbox = sandbox(100).await;
        let out = sandbox
            .execute("main", &params(json!({ "name": "box" })))
            .await
            .expect("execute");
        assert_eq!(out.result, json!({ "echo": "box" }));
        assert_eq!(out.meta.fetch_count, 2);
        assert_eq!(out.meta.fetch_bytes, 128);
        assert_eq!(out.meta.log_bytes, 5);
        assert!(!out.meta.logs_truncated);

        let stats = sandbox.pool().stats();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.idle, 1);
        assert_eq!(sandbox.metrics().executions.get("ok"), 1);
    }

    #[tokio::test]
    async fn timeout_poisons_with_timeout_reason() {
        let sandbox = sandbox(100).await;
        let err = sandbox.execute("spin", &Params::new()).await.expect_err("timeout");
        assert_eq!(err.kind, ErrorKind::SandboxTimeout);
        assert_eq!(err.status(), 504);
        assert_eq!(sandbox.pool().metrics().poisoned.get("timeout"), 1);
        assert_eq!(sandbox.pool().stats().active, 0);
        assert_eq!(sandbox.pool().stats().idle, 0);
    }

    #[tokio::test]
    async fn runtime_that_ignores_its_deadline_still_times_out() {
        let sandbox = sandbox(20).await;
        let err = sandbox.execute("hang", &Params::new()).await.expect_err("timeout");
        assert_eq!(err.kind, ErrorKind::SandboxTimeout);
        assert_eq!(sandbox.pool().metrics().poisoned.get("timeout"), 1);
    }

    #[tokio::test]
    async fn script_errors_poison_as_execution_fault() {
        let sandbox = sandbox(100).await;
        let err = sandbox.execute("throw", &Params::new()).await.expect_err("script");
        assert_eq!(err.kind, ErrorKind::ScriptFail);
        assert_eq!(err.message, "Error: boom");

        let err = sandbox.execute("explode", &Params::new()).await.expect_err("fatal");
        assert_eq!(err.kind, ErrorKind::SandboxFatal);
        assert_eq!(sandbox.pool().metrics().poisoned.get("error_execution"), 2);
        assert_eq!(sandbox.pool().stats().active, 0);
        assert_eq!(sandbox.metrics().executions.get("ERR_SCRIPT_FAIL"), 1);
    }

    #[tokio::test]
    async fn every_failure_leaves_no_active_isolate() {
        let sandbox = sandbox(50).await;
        for script in ["main", "throw", "spin", "explode", "main"] {
            let _ = sandbox.execute(script, &Params::new()).await;
            assert_eq!(sandbox.pool().stats().active, 0, "after {script}");
        }
        let out = sandbox.execute("main", &Params::new()).await.expect("healthy");
        assert_eq!(out.result, json!({ "echo": null }));
    }

    #[tokio::test]
    async fn dropped_execution_releases_as_abandoned() {
        let sandbox = Arc::new(sandbox(5_000).await);
        let task = {
            let sandbox = Arc::clone(&sandbox);
            tokio::spawn(async move { sandbox.execute("hang", &Params::new()).await.map(|_| ()) })
        };
        for _ in 0..100 {
            if sandbox.pool().stats().active == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        task.abort();
        let _ = task.await;

        assert_eq!(sandbox.pool().stats().active, 0);
        assert_eq!(sandbox.pool().metrics().poisoned.get("abandoned"), 1);
    }

    #[tokio::test]
    async fn pool_errors_propagate_verbatim() {
        let config = PoolConfig {
            pool_size: 0,
            max_concurrency: 1,
            max_queue_size: 0,
            ..PoolConfig::default()
        };
        let pool = IsolatePool::new(config, Arc::new(ScriptedRuntime::default()));
        pool.warm_up().await.expect("warm up");
        let sandbox = Sandbox::new(pool, Duration::from_millis(5_000));
        let held = sandbox.pool().acquire().await.expect("held");

        let err = sandbox.execute("main", &Params::new()).await.expect_err("full");
        assert_eq!(err.kind, ErrorKind::QueueFull);
        assert_eq!(sandbox.metrics().executions.get("ERR_QUEUE_FULL"), 1);
        sandbox.pool().release(held, None);
    }
}
