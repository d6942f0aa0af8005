use std::time::Duration;

use async_trait::async_trait;
use pool::IsolateFactory;
use runtime_core::{Params, RunError, RunOutput};

/// Runs one script inside an isolate the pool lent out.
///
/// Implementations enforce the wall-clock `timeout` themselves and raise
/// `RunError::Timeout` when it fires. Outbound network denial and console
/// budgets are their concern too; the facade only sees the counters.
#[async_trait]
pub trait ExecutionRuntime: IsolateFactory {
    async fn run(
        &self,
        isolate: &mut Self::Isolate,
        script: &str,
        params: &Params,
        timeout: Duration,
    ) -> Result<RunOutput, RunError>;
}
