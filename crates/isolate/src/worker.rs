use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use deno_core::{JsRuntime, PollEventLoopOptions, RuntimeOptions, v8};
use runtime_core::{Params, RunError, RunOutput, SandboxLimits};
use tokio::sync::{mpsc, oneshot};

use crate::bootstrap;
use crate::marshal::marshal_result;
use crate::ops::{JobState, Settled, box_sandbox};

/// Extra heap granted after the limit is hit so termination can unwind.
const HEAP_GRACE_BYTES: usize = 1024 * 1024;

enum Command {
    Run {
        script: String,
        params: Params,
        timeout: Duration,
        reply: oneshot::Sender<Result<RunOutput, RunError>>,
    },
}

/// Handle to one sandbox context living on its own thread.
///
/// The thread keeps a fresh V8 runtime ready and replaces it after every run,
/// so no two runs ever share a heap. Dropping the handle closes the command
/// channel, which ends the thread.
pub struct V8Isolate {
    id: String,
    sender: mpsc::UnboundedSender<Command>,
    handle: SharedHandle,
    disposed: Arc<AtomicBool>,
}

/// Termination handle of whichever runtime the thread currently holds.
type SharedHandle = Arc<Mutex<Option<v8::IsolateHandle>>>;

impl V8Isolate {
    pub async fn spawn(id: &str, limits: SandboxLimits) -> Result<Self, String> {
        let (init_tx, init_rx) = oneshot::channel();
        let (sender, receiver) = mpsc::unbounded_channel();
        let disposed = Arc::new(AtomicBool::new(false));
        let handle: SharedHandle = Arc::new(Mutex::new(None));
        let thread_disposed = Arc::clone(&disposed);
        let thread_handle = Arc::clone(&handle);
        let thread_id = id.to_string();

        std::thread::Builder::new()
            .name(format!("box-isolate-{}", id))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        let _ = init_tx.send(Err(format!("failed to build runtime: {}", err)));
                        return;
                    }
                };
                runtime.block_on(serve(thread_id, limits, receiver, thread_handle, init_tx));
                thread_disposed.store(true, Ordering::SeqCst);
            })
            .map_err(|err| format!("failed to spawn isolate thread: {}", err))?;

        init_rx
            .await
            .map_err(|_| "isolate thread exited during startup".to_string())??;

        Ok(Self {
            id: id.to_string(),
            sender,
            handle,
            disposed,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst) || self.sender.is_closed()
    }

    /// Stop whatever is running and let the thread wind down.
    pub fn dispose(self) {
        self.disposed.store(true, Ordering::SeqCst);
        let handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = handle.as_ref() {
            handle.terminate_execution();
        }
    }

    pub async fn run(
        &self,
        script: &str,
        params: &Params,
        timeout: Duration,
    ) -> Result<RunOutput, RunError> {
        if self.is_disposed() {
            return Err(RunError::Fatal("Isolate is disposed".to_string()));
        }
        let (reply, response) = oneshot::channel();
        self.sender
            .send(Command::Run {
                script: script.to_string(),
                params: params.clone(),
                timeout,
                reply,
            })
            .map_err(|_| RunError::Fatal("Isolate thread is gone".to_string()))?;
        response
            .await
            .map_err(|_| RunError::Fatal("Isolate thread exited mid-run".to_string()))?
    }
}

async fn serve(
    id: String,
    limits: SandboxLimits,
    mut receiver: mpsc::UnboundedReceiver<Command>,
    handle: SharedHandle,
    init_tx: oneshot::Sender<Result<(), String>>,
) {
    let mut realm = match Realm::new(&id, &limits, &handle) {
        Ok(realm) => realm,
        Err(err) => {
            let _ = init_tx.send(Err(err));
            return;
        }
    };
    if init_tx.send(Ok(())).is_err() {
        return;
    }

    while let Some(command) = receiver.recv().await {
        match command {
            Command::Run {
                script,
                params,
                timeout,
                reply,
            } => {
                let outcome = realm.run(&script, &params, timeout).await;
                let broken = outcome.is_err();
                let _ = reply.send(outcome);
                // A faulted context is never reused.
                if broken {
                    break;
                }
                // The old runtime must be gone before the next one is entered.
                handle.lock().unwrap_or_else(PoisonError::into_inner).take();
                drop(realm);
                realm = match Realm::new(&id, &limits, &handle) {
                    Ok(realm) => realm,
                    Err(err) => {
                        tracing::error!(isolate = %id, error = %err, "Failed to rebuild runtime");
                        break;
                    }
                };
            }
        }
    }
    handle.lock().unwrap_or_else(PoisonError::into_inner).take();
    tracing::debug!(isolate = %id, "Isolate thread exiting");
}

struct HeapLimitState {
    handle: v8::IsolateHandle,
    triggered: AtomicBool,
}

extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points at the realm's boxed HeapLimitState, which is
    // dropped only after the runtime that invokes this callback.
    let state = unsafe { &*(data as *const HeapLimitState) };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.handle.terminate_execution();
    }
    current_heap_limit + HEAP_GRACE_BYTES
}

/// One bootstrapped runtime, used for exactly one run. Lives only on the
/// isolate thread.
struct Realm {
    // Must drop before `heap`.
    runtime: JsRuntime,
    heap: Box<HeapLimitState>,
    limits: SandboxLimits,
}

impl Realm {
    fn new(id: &str, limits: &SandboxLimits, shared: &SharedHandle) -> Result<Self, String> {
        let create_params = v8::CreateParams::default().heap_limits(0, limits.heap_limit_bytes());
        let mut runtime = JsRuntime::new(RuntimeOptions {
            extensions: vec![box_sandbox::init()],
            create_params: Some(create_params),
            ..Default::default()
        });
        runtime
            .op_state()
            .borrow_mut()
            .put(JobState::new(id, limits.clone()));

        let heap = Box::new(HeapLimitState {
            handle: runtime.v8_isolate().thread_safe_handle(),
            triggered: AtomicBool::new(false),
        });
        runtime.v8_isolate().add_near_heap_limit_callback(
            near_heap_limit_callback,
            &*heap as *const HeapLimitState as *mut std::ffi::c_void,
        );

        runtime
            .execute_script("[box:bootstrap]", bootstrap::BOOTSTRAP)
            .map_err(|err| format!("bootstrap failed: {}", err))?;

        *shared.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(runtime.v8_isolate().thread_safe_handle());

        Ok(Self {
            runtime,
            heap,
            limits: limits.clone(),
        })
    }

    async fn run(
        &mut self,
        script: &str,
        params: &Params,
        timeout: Duration,
    ) -> Result<RunOutput, RunError> {
        let params_json = serde_json::to_string(params)
            .map_err(|err| RunError::Fatal(format!("failed to encode params: {}", err)))?;
        self.runtime
            .op_state()
            .borrow_mut()
            .borrow_mut::<JobState>()
            .begin(params_json);

        let watchdog_handle = self.runtime.v8_isolate().thread_safe_handle();
        let timed_out = Arc::new(AtomicBool::new(false));
        let watchdog_timed_out = Arc::clone(&timed_out);
        let (cancel_tx, cancel_rx) = std::sync::mpsc::channel::<()>();
        let watchdog = std::thread::spawn(move || {
            if let Err(std::sync::mpsc::RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(timeout) {
                watchdog_timed_out.store(true, Ordering::SeqCst);
                watchdog_handle.terminate_execution();
            }
        });

        let exec_error = match self
            .runtime
            .execute_script("[box:run]", bootstrap::wrap_script(script))
        {
            Ok(_) => match tokio::time::timeout(
                timeout,
                self.runtime.run_event_loop(PollEventLoopOptions::default()),
            )
            .await
            {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(err.to_string()),
                Err(_) => {
                    timed_out.store(true, Ordering::SeqCst);
                    None
                }
            },
            Err(err) => Some(err.to_string()),
        };

        // The watchdog holds an isolate handle; it must be gone before the
        // isolate can be.
        let _ = cancel_tx.send(());
        let _ = watchdog.join();

        if self.heap.triggered.load(Ordering::SeqCst) {
            return Err(RunError::Fatal("Isolate memory limit exceeded".to_string()));
        }
        if timed_out.load(Ordering::SeqCst) {
            return Err(RunError::Timeout(timeout.as_millis() as u64));
        }
        if let Some(message) = exec_error {
            return Err(RunError::Script(message));
        }

        let (settled, job) = {
            let state = self.runtime.op_state();
            let mut state = state.borrow_mut();
            let job = state.borrow_mut::<JobState>();
            (job.settled.take(), job.snapshot())
        };
        let result = match settled {
            Some(Settled::Done(json)) => marshal_result(&json, &self.limits)?,
            Some(Settled::Failed(message)) => return Err(RunError::Script(message)),
            Some(Settled::Rejected(message)) => return Err(RunError::ResultRejected(message)),
            None => {
                return Err(RunError::Script(
                    "Script finished without settling its result".to_string(),
                ));
            }
        };

        Ok(RunOutput { result, job })
    }
}
