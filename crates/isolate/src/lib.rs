//! V8-backed execution runtime.
//!
//! Each context is a `JsRuntime` pinned to a dedicated OS thread with its own
//! current-thread tokio runtime. The pool only ever sees [`V8Isolate`]
//! handles, which are `Send` and talk to their thread over a channel.

mod bootstrap;
mod fetch;
mod marshal;
mod ops;
mod worker;

use std::time::Duration;

use async_trait::async_trait;
use engine::ExecutionRuntime;
use pool::IsolateFactory;
use runtime_core::{Params, RunError, RunOutput, SandboxLimits};

pub use fetch::{FetchError, FetchRequest, FetchResponse};
pub use marshal::marshal_result;
pub use worker::V8Isolate;

pub struct V8Runtime {
    limits: SandboxLimits,
}

impl V8Runtime {
    pub fn new(limits: SandboxLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }
}

#[async_trait]
impl IsolateFactory for V8Runtime {
    type Isolate = V8Isolate;

    async fn create(&self, id: &str) -> Result<V8Isolate, String> {
        V8Isolate::spawn(id, self.limits.clone()).await
    }

    fn is_disposed(&self, isolate: &V8Isolate) -> bool {
        isolate.is_disposed()
    }

    fn dispose(&self, isolate: V8Isolate) {
        tracing::debug!(isolate = %isolate.id(), "Terminating isolate");
        isolate.dispose();
    }
}

#[async_trait]
impl ExecutionRuntime for V8Runtime {
    async fn run(
        &self,
        isolate: &mut V8Isolate,
        script: &str,
        params: &Params,
        timeout: Duration,
    ) -> Result<RunOutput, RunError> {
        isolate.run(script, params, timeout).await
    }
}
