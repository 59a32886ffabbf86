//! HTTP request handlers

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::deploy::fsm::AppStatus;
use crate::deploy::webhook::{WebhookEvent, EVENT_HEADER};
use crate::errors::PlatformError;
use crate::models::app::{Application, NewApplication};
use crate::models::backup::Backup;
use crate::models::deployment::Deployment;
use crate::reconcile::Route;
use crate::server::state::ServerState;
use crate::supervisor::ProcessInfo;
use crate::utils::version_info;

/// Error body returned by every failing handler
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl IntoResponse for PlatformError {
    fn into_response(self) -> Response {
        let status = match self.root() {
            PlatformError::NotFound(_) => StatusCode::NOT_FOUND,
            PlatformError::Conflict(_) => StatusCode::CONFLICT,
            PlatformError::ValidationError(_) => StatusCode::BAD_REQUEST,
            PlatformError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }
        (status, Json(ErrorResponse { error: self.to_string() })).into_response()
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "shipyard".to_string(),
        version: version.version,
    })
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    Json(version_info())
}

pub async fn list_apps_handler(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<Vec<Application>>, PlatformError> {
    Ok(Json(state.store.list_apps().await?))
}

pub async fn create_app_handler(
    State(state): State<Arc<ServerState>>,
    Json(new_app): Json<NewApplication>,
) -> Result<impl IntoResponse, PlatformError> {
    let app = state.store.create_app(new_app).await?;
    info!(app_id = %app.id, name = %app.name, "App registered");
    Ok((StatusCode::CREATED, Json(app)))
}

pub async fn get_app_handler(
    State(state): State<Arc<ServerState>>,
    Path(app_id): Path<String>,
) -> Result<Json<Application>, PlatformError> {
    Ok(Json(state.store.get_app(&app_id).await?))
}

/// Undeploy the app, then forget it
pub async fn delete_app_handler(
    State(state): State<Arc<ServerState>>,
    Path(app_id): Path<String>,
) -> Result<StatusCode, PlatformError> {
    state.store.get_app(&app_id).await?;
    state.pipeline.undeploy_app(&app_id).await?;
    state.store.delete_app(&app_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Deploy request; an empty body deploys the branch head
#[derive(Debug, Default, Deserialize)]
pub struct DeployRequest {
    #[serde(default)]
    pub commit: String,
}

/// Queue a deploy; the pending deployment is returned right away
pub async fn deploy_app_handler(
    State(state): State<Arc<ServerState>>,
    Path(app_id): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<Deployment>), PlatformError> {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        DeployRequest::default()
    } else {
        serde_json::from_slice::<DeployRequest>(&body)
            .map_err(|e| PlatformError::ValidationError(format!("invalid deploy request: {e}")))?
    };

    let deployment = state.pipeline.enqueue_deploy(&app_id, &request.commit).await?;
    Ok((StatusCode::ACCEPTED, Json(deployment)))
}

/// Generic status body
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

pub async fn undeploy_app_handler(
    State(state): State<Arc<ServerState>>,
    Path(app_id): Path<String>,
) -> Result<Json<StatusResponse>, PlatformError> {
    state.pipeline.undeploy_app(&app_id).await?;
    Ok(Json(StatusResponse {
        status: "undeployed".to_string(),
    }))
}

pub async fn restart_app_handler(
    State(state): State<Arc<ServerState>>,
    Path(app_id): Path<String>,
) -> Result<Json<ProcessInfo>, PlatformError> {
    state.supervisor.restart_app(&app_id).await?;
    Ok(Json(state.supervisor.info(&app_id).await?))
}

/// Recorded and live status of an app
#[derive(Debug, Serialize)]
pub struct AppStatusResponse {
    pub app_id: String,
    pub status: AppStatus,
    pub process: Option<ProcessInfo>,
}

pub async fn app_status_handler(
    State(state): State<Arc<ServerState>>,
    Path(app_id): Path<String>,
) -> Result<Json<AppStatusResponse>, PlatformError> {
    let app = state.store.get_app(&app_id).await?;
    let process = match state.supervisor.info(&app_id).await {
        Ok(info) => Some(info),
        Err(e) if e.is_not_found() => None,
        Err(e) => return Err(e),
    };

    Ok(Json(AppStatusResponse {
        app_id: app.id,
        status: app.status,
        process,
    }))
}

pub async fn list_deployments_handler(
    State(state): State<Arc<ServerState>>,
    Path(app_id): Path<String>,
) -> Result<Json<Vec<Deployment>>, PlatformError> {
    state.store.get_app(&app_id).await?;
    Ok(Json(state.store.list_deployments(&app_id).await?))
}

pub async fn get_deployment_handler(
    State(state): State<Arc<ServerState>>,
    Path(deployment_id): Path<String>,
) -> Result<Json<Deployment>, PlatformError> {
    Ok(Json(state.store.get_deployment(&deployment_id).await?))
}

pub async fn list_backups_handler(
    State(state): State<Arc<ServerState>>,
    Path(app_id): Path<String>,
) -> Result<Json<Vec<Backup>>, PlatformError> {
    state.store.get_app(&app_id).await?;
    Ok(Json(state.store.list_backups(&app_id).await?))
}

/// Restore the app's registered database from its replica
pub async fn restore_backup_handler(
    State(state): State<Arc<ServerState>>,
    Path(app_id): Path<String>,
) -> Result<Json<Backup>, PlatformError> {
    let db_path = state
        .backup
        .databases()
        .await
        .remove(&app_id)
        .ok_or_else(|| PlatformError::NotFound(format!("app {app_id} has no registered database")))?;

    Ok(Json(state.backup.restore_database(&app_id, &db_path).await?))
}

pub async fn routes_handler(State(state): State<Arc<ServerState>>) -> Json<BTreeMap<String, Route>> {
    Json(state.proxy.routes().await)
}

/// GitHub webhook receiver
pub async fn github_webhook_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, PlatformError> {
    let event_type = headers
        .get(EVENT_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    match WebhookEvent::parse(event_type, &body)? {
        WebhookEvent::Ping => Ok(Json(StatusResponse {
            status: "pong".to_string(),
        })
        .into_response()),
        WebhookEvent::Push(push) => {
            let deployments = state.pipeline.process_webhook(&push).await?;
            Ok((
                StatusCode::ACCEPTED,
                Json(serde_json::json!({ "status": "accepted", "deployments": deployments })),
            )
                .into_response())
        }
        WebhookEvent::Other(kind) => {
            info!(event = %kind, "Ignoring webhook event");
            Ok(Json(StatusResponse {
                status: "ignored".to_string(),
            })
            .into_response())
        }
    }
}
