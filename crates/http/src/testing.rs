use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use engine::{AuthConfig, ExecutionRuntime, IngressLimits, Sandbox};
use envelope::KeyStore;
use pool::{IsolateFactory, IsolatePool, PoolConfig};
use runtime_core::{JobCounters, Params, RunError, RunOutput};
use serde_json::{Value, json};
use tower::ServiceExt;

use crate::router::{AppState, app_router};

/// Echoes params back; scripts containing `throw` or `spin` fail.
pub struct EchoRuntime;

pub struct EchoIsolate;

#[async_trait]
impl IsolateFactory for EchoRuntime {
    type Isolate = EchoIsolate;

    async fn create(&self, _id: &str) -> Result<EchoIsolate, String> {
        Ok(EchoIsolate)
    }

    fn is_disposed(&self, _isolate: &EchoIsolate) -> bool {
        false
    }

    fn dispose(&self, _isolate: EchoIsolate) {}
}

#[async_trait]
impl ExecutionRuntime for EchoRuntime {
    async fn run(
        &self,
        _isolate: &mut EchoIsolate,
        script: &str,
        params: &Params,
        timeout: Duration,
    ) -> Result<RunOutput, RunError> {
        if script.contains("throw") {
            return Err(RunError::Script("Error: boom".to_string()));
        }
        if script.contains("spin") {
            return Err(RunError::Timeout(timeout.as_millis() as u64));
        }
        Ok(RunOutput {
            result: json!({ "script": script, "params": params }),
            job: JobCounters::default(),
        })
    }
}

pub struct Harness {
    pub state: AppState<EchoRuntime>,
}

impl Harness {
    pub async fn new(auth: AuthConfig, keys: KeyStore) -> Self {
        Self::with_limits(auth, keys, IngressLimits::default()).await
    }

    pub async fn with_limits(auth: AuthConfig, keys: KeyStore, ingress: IngressLimits) -> Self {
        let config = PoolConfig {
            pool_size: 1,
            max_concurrency: 2,
            max_queue_size: 2,
            ..PoolConfig::default()
        };
        let pool = IsolatePool::new(config, Arc::new(EchoRuntime));
        pool.warm_up().await.expect("warm up");
        Self {
            state: AppState {
                sandbox: Arc::new(Sandbox::new(pool, Duration::from_millis(500))),
                keys: Arc::new(keys),
                ingress,
                auth: Arc::new(auth),
            },
        }
    }

    pub fn router(&self) -> Router {
        app_router(self.state.clone())
    }
}

pub fn open_auth() -> AuthConfig {
    AuthConfig::default()
}

pub fn token_auth(token: &str) -> AuthConfig {
    AuthConfig {
        internal_auth_key: Some(token.to_string()),
        strict: true,
    }
}

pub fn post_json(path: &str, body: &Value, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::post(path).header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).expect("request")
}

pub fn get(path: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::get(path);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::empty()).expect("request")
}

pub async fn send(router: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}
