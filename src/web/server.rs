use axum::{routing::get, Router};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::config::WebConfig;
use crate::service::LogService;

use super::api::{add_log, get_log, health_check, list_logs, log_stats, AppState};

pub fn router(service: Arc<LogService>) -> Router {
    let app_state = AppState { service };

    Router::new()
        .route("/health", get(health_check))
        .route("/api/logs", get(list_logs).post(add_log))
        .route("/api/logs/stats", get(log_stats))
        .route("/api/logs/:id", get(get_log))
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
}

/// Serve the query API until `cancel` fires.
pub async fn run_server(
    service: Arc<LogService>,
    web_config: WebConfig,
    cancel: CancellationToken,
) -> Result<(), std::io::Error> {
    let app = router(service);

    let listener = tokio::net::TcpListener::bind(&web_config.listen).await?;
    tracing::info!("Web server listening on {}", web_config.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
            tracing::info!("Web server shutting down gracefully");
        })
        .await?;

    Ok(())
}
