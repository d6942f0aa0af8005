//! Bounded pool of reusable sandbox isolates.
//!
//! Admission is three-tiered: reuse an idle isolate, otherwise create one
//! while under `max_concurrency`, otherwise wait in a bounded FIFO queue.
//! A full queue rejects immediately with `ERR_QUEUE_FULL`.
//!
//! Architecture:
//! - The pool owns no threads. Isolates come from an `IsolateFactory`, which
//!   decides what an isolate is (a V8 thread in production, a stub in tests).
//! - All bookkeeping (idle stack, active count, waiter queue) sits behind one
//!   mutex and is only touched in short synchronous sections. No `.await`
//!   happens while the lock is held.
//! - Waiters are oneshot channels. A waiter is resolved exactly once: by a
//!   release handing it an isolate, by its deadline, or by its acquire future
//!   being dropped.
//! - Warm-up failure disables the pool for the rest of the process.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nanoid::nanoid;
use runtime_core::env::{env_parse_with, process_env};
use runtime_core::{BoxError, ErrorKind};
use serde::Deserialize;
use tokio::sync::{oneshot, watch};

use crate::metrics::PoolMetrics;

const ID_ALPHABET: [char; 62] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I',
    'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R', 'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z', 'a', 'b',
    'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u',
    'v', 'w', 'x', 'y', 'z',
];

// ========== Configuration ==========

/// Configuration for the isolate pool
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Isolates created at warm-up, and the idle stack capacity
    pub pool_size: usize,
    /// Max isolates checked out at once
    pub max_concurrency: usize,
    /// Max waiters queued behind `max_concurrency`
    pub max_queue_size: usize,
    /// How long a waiter may sit in the queue (ms)
    pub max_queue_wait_ms: u64,
    /// Dispose an isolate after this many runs (0 = never)
    pub max_runs_per_isolate: u64,
    /// Dispose an isolate older than this (ms, 0 = never)
    pub max_isolate_age_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 2,
            max_concurrency: 2,
            max_queue_size: 2,
            max_queue_wait_ms: 5_000,
            max_runs_per_isolate: 1_000,
            max_isolate_age_ms: 3_600_000,
        }
    }
}

impl PoolConfig {
    /// Create config from environment variables
    ///
    /// Environment variables:
    /// - POOL_SIZE: Isolates warmed at startup (default: 2)
    /// - MAX_CONCURRENCY: Isolates checked out at once (default: 2)
    /// - MAX_QUEUE_SIZE: Waiters allowed behind the cap (default: 2)
    /// - MAX_QUEUE_WAIT_MS: Waiter deadline in ms (default: 5000)
    /// - MAX_RUNS_PER_ISOLATE: Runs before recycling (default: 1000)
    /// - MAX_ISOLATE_AGE_MS: Age before recycling in ms (default: 3600000)
    pub fn from_env() -> Self {
        Self::default().with_env(&process_env)
    }

    /// Overlay environment values on top of `self`.
    pub fn with_env<F>(self, env_get: &F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let max_concurrency =
            env_parse_with("MAX_CONCURRENCY", self.max_concurrency, env_get).max(1);
        Self {
            pool_size: env_parse_with("POOL_SIZE", self.pool_size, env_get),
            max_concurrency,
            max_queue_size: env_parse_with("MAX_QUEUE_SIZE", self.max_queue_size, env_get),
            max_queue_wait_ms: env_parse_with("MAX_QUEUE_WAIT_MS", self.max_queue_wait_ms, env_get),
            max_runs_per_isolate: env_parse_with(
                "MAX_RUNS_PER_ISOLATE",
                self.max_runs_per_isolate,
                env_get,
            ),
            max_isolate_age_ms: env_parse_with(
                "MAX_ISOLATE_AGE_MS",
                self.max_isolate_age_ms,
                env_get,
            ),
        }
    }

    pub fn max_queue_wait(&self) -> Duration {
        Duration::from_millis(self.max_queue_wait_ms)
    }
}

// ========== Isolates ==========

/// Builds and tears down the isolates the pool lends out.
#[async_trait]
pub trait IsolateFactory: Send + Sync + 'static {
    type Isolate: Send + 'static;

    /// Build a fresh isolate. `id` is the pool-assigned identifier.
    async fn create(&self, id: &str) -> Result<Self::Isolate, String>;

    /// Whether the isolate died on its own (crashed thread, OOM, terminated).
    fn is_disposed(&self, isolate: &Self::Isolate) -> bool;

    fn dispose(&self, isolate: Self::Isolate);
}

/// An isolate together with the bookkeeping the pool needs to recycle it.
pub struct PooledIsolate<I> {
    id: String,
    created_at: Instant,
    runs: u64,
    poisoned: bool,
    inner: I,
}

impl<I> PooledIsolate<I> {
    fn new(id: String, inner: I) -> Self {
        Self {
            id,
            created_at: Instant::now(),
            runs: 0,
            poisoned: false,
            inner,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn runs(&self) -> u64 {
        self.runs
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn inner(&self) -> &I {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut I {
        &mut self.inner
    }
}

// ========== Pool State ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarmupStatus {
    Pending,
    Ready,
    Disabled,
}

impl WarmupStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WarmupStatus::Pending => "pending",
            WarmupStatus::Ready => "ready",
            WarmupStatus::Disabled => "disabled",
        }
    }
}

type Handoff<I> = Result<PooledIsolate<I>, BoxError>;

struct Waiter<I> {
    id: u64,
    enqueued_at: Instant,
    tx: oneshot::Sender<Handoff<I>>,
}

struct PoolState<I> {
    /// LIFO: idle isolates are interchangeable
    idle: Vec<PooledIsolate<I>>,
    active: usize,
    queue: VecDeque<Waiter<I>>,
}

/// Point-in-time view of the pool bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub active: usize,
    pub queued: usize,
    pub status: WarmupStatus,
}

enum Admission<I> {
    Ready(PooledIsolate<I>),
    Create,
    Wait(u64, oneshot::Receiver<Handoff<I>>),
}

struct PoolInner<F: IsolateFactory> {
    factory: Arc<F>,
    config: PoolConfig,
    state: Mutex<PoolState<F::Isolate>>,
    warmup: watch::Sender<WarmupStatus>,
    metrics: PoolMetrics,
    waiter_seq: AtomicU64,
}

// ========== Main Pool ==========

/// The isolate pool. Cheap to clone; clones share one pool.
pub struct IsolatePool<F: IsolateFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: IsolateFactory> Clone for IsolatePool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: IsolateFactory> IsolatePool<F> {
    /// Create an empty pool. Nothing is lent out until `warm_up` finishes.
    pub fn new(config: PoolConfig, factory: Arc<F>) -> Self {
        let (warmup, _) = watch::channel(WarmupStatus::Pending);
        Self {
            inner: Arc::new(PoolInner {
                factory,
                config,
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    active: 0,
                    queue: VecDeque::new(),
                }),
                warmup,
                metrics: PoolMetrics::default(),
                waiter_seq: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn factory(&self) -> &Arc<F> {
        &self.inner.factory
    }

    pub fn metrics(&self) -> &PoolMetrics {
        &self.inner.metrics
    }

    pub fn status(&self) -> WarmupStatus {
        *self.inner.warmup.borrow()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock_state();
        PoolStats {
            idle: state.idle.len(),
            active: state.active,
            queued: state.queue.len(),
            status: self.status(),
        }
    }

    /// Pre-create `pool_size` isolates. Any failure disables the pool for good.
    pub async fn warm_up(&self) -> Result<(), BoxError> {
        match self.status() {
            WarmupStatus::Ready => return Ok(()),
            WarmupStatus::Disabled => return Err(unavailable()),
            WarmupStatus::Pending => {}
        }

        let target = self.inner.config.pool_size;
        tracing::info!(
            pool_size = target,
            max_concurrency = self.inner.config.max_concurrency,
            max_queue_size = self.inner.config.max_queue_size,
            "Warming isolate pool"
        );

        let attempts = (0..target).map(|_| self.create_isolate("warmup"));
        let mut created = Vec::with_capacity(target);
        let mut failure = None;
        for attempt in futures_util::future::join_all(attempts).await {
            match attempt {
                Ok(isolate) => created.push(isolate),
                Err(err) => {
                    failure.get_or_insert(err);
                }
            }
        }

        if let Some(err) = failure {
            for isolate in created {
                self.dispose(isolate, "warmup_failed");
            }
            tracing::error!(error = %err.message, "Isolate pool warm-up failed, sandbox disabled");
            self.inner.warmup.send_replace(WarmupStatus::Disabled);
            return Err(unavailable());
        }

        {
            let mut state = self.lock_state();
            state.idle.extend(created);
            self.publish_gauges(&state);
        }
        self.inner.warmup.send_replace(WarmupStatus::Ready);
        tracing::info!(idle = target, "Isolate pool ready");
        Ok(())
    }

    /// Borrow an isolate. Every successful acquire must be paired with one
    /// `release`.
    pub async fn acquire(&self) -> Result<PooledIsolate<F::Isolate>, BoxError> {
        let started = Instant::now();
        let result = self.acquire_inner().await;
        let metrics = &self.inner.metrics;
        metrics.acquire_duration.observe(started.elapsed());
        match &result {
            Ok(_) => {
                metrics.acquired.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => metrics.acquire_errors.inc(err.code()),
        }
        result
    }

    async fn acquire_inner(&self) -> Result<PooledIsolate<F::Isolate>, BoxError> {
        if self.status() == WarmupStatus::Disabled {
            return Err(unavailable());
        }
        self.await_warmup().await?;

        match self.admit()? {
            Admission::Ready(isolate) => Ok(isolate),
            Admission::Create => match self.create_isolate("on_demand").await {
                Ok(isolate) => Ok(isolate),
                Err(err) => {
                    self.free_slot();
                    Err(err)
                }
            },
            Admission::Wait(id, rx) => {
                QueuedWaiter {
                    pool: self,
                    id,
                    rx,
                    settled: false,
                }
                .wait()
                .await
            }
        }
    }

    async fn await_warmup(&self) -> Result<(), BoxError> {
        let mut rx = self.inner.warmup.subscribe();
        let status = rx
            .wait_for(|status| *status != WarmupStatus::Pending)
            .await
            .map(|status| *status)
            .unwrap_or(WarmupStatus::Disabled);
        if status == WarmupStatus::Disabled {
            return Err(unavailable());
        }
        Ok(())
    }

    /// Decide how an acquire is served. Slots are reserved here, under the
    /// lock, so concurrent creators can never overshoot the cap.
    fn admit(&self) -> Result<Admission<F::Isolate>, BoxError> {
        let mut dead = Vec::new();
        let admission = {
            let mut state = self.lock_state();
            let mut reused = None;
            while let Some(isolate) = state.idle.pop() {
                if self.inner.factory.is_disposed(isolate.inner()) {
                    dead.push(isolate);
                    continue;
                }
                reused = Some(isolate);
                break;
            }

            let admission = if let Some(isolate) = reused {
                state.active += 1;
                Ok(Admission::Ready(isolate))
            } else if state.active < self.inner.config.max_concurrency {
                state.active += 1;
                Ok(Admission::Create)
            } else if state.queue.len() >= self.inner.config.max_queue_size {
                Err(BoxError::from(ErrorKind::QueueFull).with_details(serde_json::json!({
                    "queueLength": state.queue.len(),
                    "maxQueueSize": self.inner.config.max_queue_size,
                })))
            } else {
                let (tx, rx) = oneshot::channel();
                let id = self.inner.waiter_seq.fetch_add(1, Ordering::Relaxed);
                state.queue.push_back(Waiter {
                    id,
                    enqueued_at: Instant::now(),
                    tx,
                });
                Ok(Admission::Wait(id, rx))
            };
            self.publish_gauges(&state);
            admission
        };

        for isolate in dead {
            tracing::warn!(isolate = %isolate.id, "Discarding dead isolate found in idle set");
            self.dispose(isolate, "found_dead");
        }
        admission
    }

    /// Return an isolate. A poison reason always disposes it.
    pub fn release(&self, isolate: PooledIsolate<F::Isolate>, poison: Option<&str>) {
        self.release_inner(isolate, poison, true);
    }

    fn release_inner(
        &self,
        mut isolate: PooledIsolate<F::Isolate>,
        poison: Option<&str>,
        count_run: bool,
    ) {
        if count_run {
            isolate.runs += 1;
        }
        if let Some(reason) = poison {
            isolate.poisoned = true;
            self.inner.metrics.poisoned.inc(reason);
            tracing::warn!(isolate = %isolate.id, reason, "Isolate poisoned");
        }
        let dispose_reason = self.dispose_reason(&isolate, poison);

        let mut current = Some(isolate);
        let mut disposals = Vec::new();
        let mut needs_replacement = None;
        {
            let mut state = self.lock_state();
            state.active = state.active.saturating_sub(1);

            // Waiters are served before the idle stack is touched.
            while let Some(isolate) = current.take() {
                let Some(waiter) = state.queue.pop_front() else {
                    current = Some(isolate);
                    break;
                };
                state.active += 1;
                if let Some(reason) = &dispose_reason {
                    disposals.push((isolate, reason.clone()));
                    needs_replacement = Some(waiter);
                    break;
                }
                let enqueued_at = waiter.enqueued_at;
                match waiter.tx.send(Ok(isolate)) {
                    Ok(()) => {
                        self.inner.metrics.handoffs.fetch_add(1, Ordering::Relaxed);
                        self.inner.metrics.queue_wait.observe(enqueued_at.elapsed());
                    }
                    Err(returned) => {
                        state.active -= 1;
                        current = returned.ok();
                    }
                }
            }

            if let Some(isolate) = current.take() {
                match dispose_reason {
                    Some(reason) => disposals.push((isolate, reason)),
                    None if state.idle.len() < self.inner.config.pool_size => {
                        state.idle.push(isolate)
                    }
                    None => disposals.push((isolate, "pool_full".to_string())),
                }
            }
            self.publish_gauges(&state);
        }

        for (isolate, reason) in disposals {
            self.dispose(isolate, &reason);
        }
        if let Some(waiter) = needs_replacement {
            self.spawn_replacement(waiter);
        }
    }

    fn dispose_reason(&self, isolate: &PooledIsolate<F::Isolate>, poison: Option<&str>) -> Option<String> {
        let config = &self.inner.config;
        if let Some(reason) = poison {
            return Some(format!("poison:{}", reason));
        }
        if config.max_runs_per_isolate > 0 && isolate.runs >= config.max_runs_per_isolate {
            return Some("max_runs".to_string());
        }
        if config.max_isolate_age_ms > 0
            && isolate.age() > Duration::from_millis(config.max_isolate_age_ms)
        {
            return Some("max_age".to_string());
        }
        if self.inner.factory.is_disposed(isolate.inner()) {
            return Some("already_disposed".to_string());
        }
        None
    }

    /// Build a fresh isolate for a waiter whose handed-off isolate was disposed.
    fn spawn_replacement(&self, waiter: Waiter<F::Isolate>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            self.fail_waiter(waiter, BoxError::new(ErrorKind::Internal, "No runtime to build a replacement isolate"));
            return;
        };
        let pool = self.clone();
        handle.spawn(async move {
            match pool.create_isolate("replacement").await {
                Ok(isolate) => {
                    let enqueued_at = waiter.enqueued_at;
                    match waiter.tx.send(Ok(isolate)) {
                        Ok(()) => {
                            pool.inner.metrics.handoffs.fetch_add(1, Ordering::Relaxed);
                            pool.inner.metrics.queue_wait.observe(enqueued_at.elapsed());
                        }
                        Err(returned) => {
                            if let Ok(isolate) = returned {
                                pool.release_inner(isolate, None, false);
                            }
                        }
                    }
                }
                Err(err) => pool.fail_waiter(waiter, err),
            }
        });
    }

    fn fail_waiter(&self, waiter: Waiter<F::Isolate>, err: BoxError) {
        let _ = waiter.tx.send(Err(err));
        self.free_slot();
    }

    /// Give back a reserved slot that never received an isolate. A queued
    /// waiter may take it over, otherwise it would sit until another release.
    fn free_slot(&self) {
        let next = {
            let mut state = self.lock_state();
            state.active = state.active.saturating_sub(1);
            let next = if state.active < self.inner.config.max_concurrency {
                state.queue.pop_front()
            } else {
                None
            };
            if next.is_some() {
                state.active += 1;
            }
            self.publish_gauges(&state);
            next
        };
        if let Some(waiter) = next {
            self.spawn_replacement(waiter);
        }
    }

    /// Drop a waiter from the queue. `false` means a release already took it.
    fn remove_waiter(&self, id: u64) -> bool {
        let mut state = self.lock_state();
        let Some(position) = state.queue.iter().position(|waiter| waiter.id == id) else {
            return false;
        };
        state.queue.remove(position);
        self.publish_gauges(&state);
        true
    }

    async fn create_isolate(&self, reason: &str) -> Result<PooledIsolate<F::Isolate>, BoxError> {
        let id = nanoid!(10, &ID_ALPHABET);
        match self.inner.factory.create(&id).await {
            Ok(inner) => {
                self.inner.metrics.created.inc(reason);
                tracing::debug!(isolate = %id, reason, "Isolate created");
                Ok(PooledIsolate::new(id, inner))
            }
            Err(err) => {
                self.inner.metrics.created.inc("failed");
                tracing::error!(isolate = %id, reason, error = %err, "Isolate creation failed");
                Err(BoxError::new(
                    ErrorKind::Internal,
                    "Failed to create sandbox isolate",
                ))
            }
        }
    }

    fn dispose(&self, isolate: PooledIsolate<F::Isolate>, reason: &str) {
        tracing::debug!(
            isolate = %isolate.id,
            runs = isolate.runs,
            reason,
            "Disposing isolate"
        );
        self.inner.metrics.disposed.inc(reason);
        self.inner.factory.dispose(isolate.inner);
    }

    fn publish_gauges(&self, state: &PoolState<F::Isolate>) {
        self.inner
            .metrics
            .set_gauges(state.active, state.idle.len(), state.queue.len());
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState<F::Isolate>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn unavailable() -> BoxError {
    BoxError::from(ErrorKind::IvmUnavailable)
}

// ========== Queued Waiter ==========

/// A parked acquire. Dropping it before it settles removes it from the queue
/// and returns anything already handed to it.
struct QueuedWaiter<'a, F: IsolateFactory> {
    pool: &'a IsolatePool<F>,
    id: u64,
    rx: oneshot::Receiver<Handoff<F::Isolate>>,
    settled: bool,
}

impl<F: IsolateFactory> QueuedWaiter<'_, F> {
    async fn wait(mut self) -> Handoff<F::Isolate> {
        let deadline = self.pool.inner.config.max_queue_wait();
        let outcome = match tokio::time::timeout(deadline, &mut self.rx).await {
            Ok(received) => received,
            Err(_) => {
                if self.pool.remove_waiter(self.id) {
                    self.settled = true;
                    tracing::warn!(
                        waited_ms = deadline.as_millis() as u64,
                        "Timed out waiting for an isolate"
                    );
                    return Err(BoxError::from(ErrorKind::QueueTimeout));
                }
                // A release popped us just as the deadline fired.
                (&mut self.rx).await
            }
        };
        self.settled = true;
        outcome.unwrap_or_else(|_| {
            Err(BoxError::new(
                ErrorKind::Internal,
                "Isolate pool dropped a waiter",
            ))
        })
    }
}

impl<F: IsolateFactory> Drop for QueuedWaiter<'_, F> {
    fn drop(&mut self) {
        if self.settled || self.pool.remove_waiter(self.id) {
            return;
        }
        self.rx.close();
        if let Ok(Ok(isolate)) = self.rx.try_recv() {
            self.pool.release_inner(isolate, None, false);
        }
    }
}
