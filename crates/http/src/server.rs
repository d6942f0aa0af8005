use std::io;

use engine::{ExecutionRuntime, ServerConfig};
use tokio::net::TcpListener;

use crate::router::{AppState, app_router};

/// Bind and serve until ctrl-c or SIGTERM.
pub async fn serve<R: ExecutionRuntime>(config: &ServerConfig, state: AppState<R>) -> io::Result<()> {
    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    tracing::info!(addr = %listener.local_addr()?, "Box listening");
    serve_on(listener, state).await
}

pub async fn serve_on<R: ExecutionRuntime>(listener: TcpListener, state: AppState<R>) -> io::Result<()> {
    axum::serve(listener, app_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutting down");
}
