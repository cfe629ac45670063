mod api;
mod backend;
mod config;
mod engine;
mod error;
mod models;
mod observability;
mod state;

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::backend::Backend;
use crate::backend::http::HttpBackend;
use crate::backend::memory::MemoryBackend;

#[tokio::main]
async fn main() -> Result<(), error::AppError> {
    let config = config::Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .with_target(false)
        .compact()
        .init();

    let backend: Arc<dyn Backend> = match &config.backend_url {
        Some(url) => Arc::new(
            HttpBackend::new(url, config.backend_token.clone())
                .map_err(|err| error::AppError::Internal(format!("backend client: {err}")))?,
        ),
        None => {
            tracing::warn!("BACKEND_URL not set; running against the in-memory sandbox backend");
            Arc::new(MemoryBackend::new(config.event_buffer_size))
        }
    };

    let shared_state = Arc::new(state::AppState::new(
        backend,
        config.courier_id,
        config.sync.clone(),
    ));

    match shared_state.controller.recover().await {
        Ok(Some(snapshot)) => {
            tracing::info!(epoch = snapshot.epoch, step = %snapshot.step, "resumed active order");
        }
        Ok(None) => tracing::info!(courier_id = %config.courier_id, "no active order to resume"),
        Err(err) => tracing::warn!(error = %err, "failed to resume active order"),
    }

    let app = api::rest::router(shared_state.clone());

    let bind_addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|err| error::AppError::Internal(format!("failed to bind {bind_addr}: {err}")))?;

    tracing::info!(http_port = config.http_port, "http server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| error::AppError::Internal(format!("server error: {err}")))?;

    if let Some(order) = shared_state.controller.shutdown().await {
        tracing::info!(order_id = %order.id, "left active order for the next start");
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
