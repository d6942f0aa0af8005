use std::sync::Arc;

use anyhow::Context;
use engine::{BoxConfig, Sandbox};
use envelope::KeyStore;
use http::AppState;
use isolate::V8Runtime;
use pool::IsolatePool;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> anyhow::Result<()> {
    init_tracing();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;
    rt.block_on(run(BoxConfig::load()))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| {
            std::env::var("LOG_LEVEL")
                .map_err(|_| ())
                .and_then(|level| EnvFilter::try_new(level).map_err(|_| ()))
        })
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run(config: BoxConfig) -> anyhow::Result<()> {
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        git_sha = env!("BOX_GIT_SHA"),
        "Starting box"
    );
    let keys = KeyStore::from_settings(
        config.keys.private_key.as_deref(),
        config.keys.private_key_file.as_deref(),
        config.keys.strict,
    );
    if config.auth.internal_auth_key.is_none() {
        tracing::warn!(strict = config.auth.strict, "INTERNAL_AUTH_KEY is not set");
    }

    let runtime = Arc::new(V8Runtime::new(config.limits.clone()));
    let pool = IsolatePool::new(config.pool.clone(), runtime);
    tokio::spawn({
        let pool = pool.clone();
        async move {
            if let Err(err) = pool.warm_up().await {
                tracing::error!(error = %err.message, "Pool warm-up failed, service disabled");
            }
        }
    });

    let state = AppState {
        sandbox: Arc::new(Sandbox::new(pool, config.limits.exec_timeout())),
        keys: Arc::new(keys),
        ingress: config.ingress.clone(),
        auth: Arc::new(config.auth.clone()),
    };
    http::serve(&config.server, state)
        .await
        .with_context(|| format!("failed to serve on {}:{}", config.server.host, config.server.port))
}
