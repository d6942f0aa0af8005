use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use deno_core::{OpState, op2};
use deno_error::JsErrorBox;
use runtime_core::{JobCounters, SandboxLimits};

use crate::fetch::{self, ByteMeter, FetchBudget, FetchRequest, FetchResponse};

/// How the script's wrapper settled.
#[derive(Debug, Clone, PartialEq)]
pub enum Settled {
    /// JSON text of the return value
    Done(String),
    /// Uncaught error message
    Failed(String),
    /// The return value could not be serialized
    Rejected(String),
}

/// Per-context state shared with the host ops. Reset at the start of every run.
pub struct JobState {
    pub limits: SandboxLimits,
    pub counters: JobCounters,
    pub params_json: String,
    pub settled: Option<Settled>,
    fetch_bytes: Arc<ByteMeter>,
    context_id: String,
}

impl JobState {
    pub fn new(context_id: &str, limits: SandboxLimits) -> Self {
        Self {
            counters: JobCounters::default(),
            params_json: "{}".to_string(),
            settled: None,
            fetch_bytes: Arc::new(ByteMeter::new(limits.max_fetch_bytes_total)),
            limits,
            context_id: context_id.to_string(),
        }
    }

    pub fn begin(&mut self, params_json: String) {
        self.counters = JobCounters::default();
        self.params_json = params_json;
        self.settled = None;
        self.fetch_bytes = Arc::new(ByteMeter::new(self.limits.max_fetch_bytes_total));
    }

    /// Counters for the run so far, with fetch bytes read off the shared meter.
    pub fn snapshot(&self) -> JobCounters {
        JobCounters {
            fetch_bytes: self.fetch_bytes.used(),
            ..self.counters.clone()
        }
    }

    fn settle(&mut self, settled: Settled) {
        // First settlement wins.
        if self.settled.is_none() {
            self.settled = Some(settled);
        }
    }

    /// Charge one console line against the log budget.
    fn record_log(&mut self, line: &str) -> bool {
        let max = self.limits.max_log_bytes_per_exec;
        if self.counters.log_bytes > max {
            self.counters.logs_truncated = true;
            return false;
        }
        self.counters.log_bytes += line.len() as u64;
        if self.counters.log_bytes > max {
            self.counters.logs_truncated = true;
            return false;
        }
        true
    }
}

deno_core::extension!(
    box_sandbox,
    ops = [
        op_box_params,
        op_box_done,
        op_box_fail,
        op_box_reject,
        op_box_log,
        op_box_fetch,
    ],
);

#[op2]
#[string]
fn op_box_params(state: &mut OpState) -> String {
    state.borrow::<JobState>().params_json.clone()
}

#[op2(fast)]
fn op_box_done(state: &mut OpState, #[string] json: String) {
    state.borrow_mut::<JobState>().settle(Settled::Done(json));
}

#[op2(fast)]
fn op_box_fail(state: &mut OpState, #[string] message: String) {
    state.borrow_mut::<JobState>().settle(Settled::Failed(message));
}

#[op2(fast)]
fn op_box_reject(state: &mut OpState, #[string] message: String) {
    state.borrow_mut::<JobState>().settle(Settled::Rejected(message));
}

#[op2(fast)]
fn op_box_log(state: &mut OpState, #[string] line: String) {
    let job = state.borrow_mut::<JobState>();
    if job.record_log(&line) {
        tracing::debug!(target: "box::console", context = %job.context_id, "{}", line);
    }
}

#[op2]
#[serde]
async fn op_box_fetch(
    state: Rc<RefCell<OpState>>,
    #[serde] request: FetchRequest,
) -> Result<FetchResponse, JsErrorBox> {
    let budget = {
        let mut state = state.borrow_mut();
        let job = state.borrow_mut::<JobState>();
        if job.counters.fetch_count >= job.limits.max_fetches_per_exec {
            return Err(JsErrorBox::generic(fetch::FetchError::LimitExceeded.to_string()));
        }
        job.counters.fetch_count += 1;
        FetchBudget {
            per_response: job.limits.max_fetch_bytes_per_response,
            total: Arc::clone(&job.fetch_bytes),
            timeout: job.limits.fetch_timeout(),
            deny_private_networks: job.limits.deny_private_networks,
        }
    };

    match fetch::perform(request, budget).await {
        Ok(response) => Ok(response),
        Err(err) => {
            tracing::debug!(error = %err, "Script fetch refused");
            Err(JsErrorBox::generic(err.to_string()))
        }
    }
}
