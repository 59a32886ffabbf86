//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::options::ServerOptions;
use crate::errors::PlatformError;
use crate::server::handlers::{
    app_status_handler, create_app_handler, delete_app_handler, deploy_app_handler,
    get_app_handler, get_deployment_handler, github_webhook_handler, health_handler,
    list_apps_handler, list_backups_handler, list_deployments_handler, restart_app_handler,
    restore_backup_handler, routes_handler, undeploy_app_handler, version_handler,
};
use crate::server::state::ServerState;

/// Build the API router
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        // Health and version
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        // Apps
        .route("/apps", get(list_apps_handler).post(create_app_handler))
        .route("/apps/{id}", get(get_app_handler).delete(delete_app_handler))
        .route("/apps/{id}/deploy", post(deploy_app_handler))
        .route("/apps/{id}/undeploy", post(undeploy_app_handler))
        .route("/apps/{id}/restart", post(restart_app_handler))
        .route("/apps/{id}/status", get(app_status_handler))
        .route("/apps/{id}/deployments", get(list_deployments_handler))
        .route("/apps/{id}/backups", get(list_backups_handler))
        .route("/apps/{id}/restore", post(restore_backup_handler))
        // Deployments
        .route("/deployments/{id}", get(get_deployment_handler))
        // Proxy
        .route("/routes", get(routes_handler))
        // Webhooks
        .route("/webhooks/github", post(github_webhook_handler))
        // State and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Start the HTTP server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), PlatformError>>, PlatformError> {
    let app = router(state);

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| PlatformError::ServerError(format!("failed to bind {addr}: {e}")))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| PlatformError::ServerError(e.to_string()))
    });

    Ok(handle)
}
