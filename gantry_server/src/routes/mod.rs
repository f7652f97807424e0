//! Platform HTTP routes: webhook, deployment API, provisioning, WebSocket.

pub mod api;
pub mod webhook;
pub mod websocket;

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;

use crate::config::CoreConfig;
use crate::errors::Error;
use crate::repo::ScopeStore;
use crate::services::deployment_service::DeploymentService;
use crate::services::environment_service::EnvironmentRegistry;
use crate::services::provision_service::{self, Dispatcher, InfraKind};
use crate::stream::StreamHub;

/// Shared state for route handlers. Every dependency is an explicit handle
/// constructed in `main`.
#[derive(Clone)]
pub struct AppState {
    pub config: CoreConfig,
    pub environments: Arc<EnvironmentRegistry>,
    pub deployments: Arc<DeploymentService>,
    pub dispatcher: Arc<Dispatcher>,
    pub scopes: Arc<dyn ScopeStore>,
    pub hub: Arc<StreamHub>,
}

/// Build the platform's Axum router.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        // Webhook
        .route("/webhooks/github", post(webhook_handler))
        // Deployment API
        .route(
            "/projects/{project_id}/clusters/{cluster_id}/installations/{installation_id}/environments/{owner}/{name}/deployments/finalize",
            post(finalize_deployment),
        )
        .route(
            "/projects/{project_id}/clusters/{cluster_id}/installations/{installation_id}/environments/{owner}/{name}/deployments/{namespace}",
            get(get_deployment).delete(delete_deployment),
        )
        .route(
            "/projects/{project_id}/clusters/{cluster_id}/installations/{installation_id}/environments/{owner}/{name}/deployments/{namespace}/fail",
            post(fail_deployment),
        )
        // Provisioning API
        .route("/projects/{project_id}/infra/{kind}", post(launch_infra))
        .route(
            "/projects/{project_id}/provision/{kind}/{infra_id}/logs",
            get(provisioning_logs),
        )
        .with_state(state)
}

/// Map the error taxonomy onto response statuses. Conflicts carry their
/// message so clients can tell a closed PR from a generic failure.
fn error_response(context: &str, err: Error) -> (StatusCode, String) {
    let status = match &err {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Conflict(_) => StatusCode::CONFLICT,
        Error::UpstreamRejected(_) => StatusCode::BAD_GATEWAY,
        Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    match &err {
        Error::Internal(_) => tracing::error!("{context}: {err}"),
        Error::UpstreamRejected(_) => tracing::error!("{context}: {err}"),
        _ => tracing::info!("{context}: {err}"),
    }
    (status, err.to_string())
}

// ── Webhook ──

async fn webhook_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, StatusCode> {
    crate::metrics::webhook_received(
        headers
            .get("x-github-event")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown"),
    );

    webhook::handle_webhook(&state, &headers, body).await
}

// ── Deployment API ──

type EnvironmentPath = (i64, i64, i64, String, String);

async fn finalize_deployment(
    State(state): State<AppState>,
    Path((project_id, cluster_id, installation_id, owner, name)): Path<EnvironmentPath>,
    Json(request): Json<api::FinalizeRequest>,
) -> Result<Json<api::DeploymentJson>, (StatusCode, String)> {
    let env = state
        .environments
        .resolve(project_id, cluster_id, installation_id, &owner, &name)
        .await
        .map_err(|e| error_response("Finalize deployment", e))?;

    let cluster = state
        .scopes
        .read_cluster(project_id, cluster_id)
        .await
        .map_err(|e| error_response("Finalize deployment", e))?;

    let deployment = state
        .deployments
        .finalize(
            &env,
            &cluster,
            &request.namespace,
            &request.subdomain,
            &request.successful_resources,
        )
        .await
        .map_err(|e| error_response("Finalize deployment", e))?;

    Ok(Json(api::DeploymentJson::from(&deployment)))
}

async fn get_deployment(
    State(state): State<AppState>,
    Path((project_id, cluster_id, installation_id, owner, name, namespace)): Path<(
        i64,
        i64,
        i64,
        String,
        String,
        String,
    )>,
) -> Result<Json<api::DeploymentJson>, (StatusCode, String)> {
    let env = state
        .environments
        .resolve(project_id, cluster_id, installation_id, &owner, &name)
        .await
        .map_err(|e| error_response("Read deployment", e))?;

    let deployment = state
        .deployments
        .read(env.id, &namespace)
        .await
        .map_err(|e| error_response("Read deployment", e))?;

    Ok(Json(api::DeploymentJson::from(&deployment)))
}

async fn delete_deployment(
    State(state): State<AppState>,
    Path((project_id, cluster_id, installation_id, owner, name, namespace)): Path<(
        i64,
        i64,
        i64,
        String,
        String,
        String,
    )>,
) -> Result<Json<api::DeploymentJson>, (StatusCode, String)> {
    let env = state
        .environments
        .resolve(project_id, cluster_id, installation_id, &owner, &name)
        .await
        .map_err(|e| error_response("Close deployment", e))?;

    let deployment = state
        .deployments
        .close(env.id, &namespace)
        .await
        .map_err(|e| error_response("Close deployment", e))?;

    Ok(Json(api::DeploymentJson::from(&deployment)))
}

/// Provisioning worker reported an error for this namespace.
async fn fail_deployment(
    State(state): State<AppState>,
    Path((project_id, cluster_id, installation_id, owner, name, namespace)): Path<(
        i64,
        i64,
        i64,
        String,
        String,
        String,
    )>,
) -> Result<Json<api::DeploymentJson>, (StatusCode, String)> {
    let env = state
        .environments
        .resolve(project_id, cluster_id, installation_id, &owner, &name)
        .await
        .map_err(|e| error_response("Fail deployment", e))?;

    let deployment = state
        .deployments
        .fail(env.id, &namespace)
        .await
        .map_err(|e| error_response("Fail deployment", e))?;

    Ok(Json(api::DeploymentJson::from(&deployment)))
}

// ── Provisioning API ──

async fn launch_infra(
    State(state): State<AppState>,
    Path((project_id, kind)): Path<(i64, String)>,
    Json(request): Json<api::LaunchInfraRequest>,
) -> Result<(StatusCode, Json<api::LaunchInfraResponse>), (StatusCode, String)> {
    let kind: InfraKind = kind
        .parse()
        .map_err(|_| (StatusCode::NOT_FOUND, format!("unknown infra kind {kind}")))?;

    // Verify the project scope exists before provisioning under it.
    state
        .scopes
        .read_project(project_id)
        .await
        .map_err(|e| error_response("Launch provisioning", e))?;

    let (infra_id, stream_id) = match request.infra_id {
        Some(infra_id) => {
            let stream_id = state
                .dispatcher
                .dispatch(kind, project_id, infra_id, request.params)
                .await
                .map_err(|e| error_response("Launch provisioning", e))?;
            (infra_id, stream_id)
        }
        None => {
            let (infra, stream_id) = state
                .dispatcher
                .launch(kind, project_id, request.params)
                .await
                .map_err(|e| error_response("Launch provisioning", e))?;
            (infra.id, stream_id)
        }
    };

    Ok((
        StatusCode::CREATED,
        Json(api::LaunchInfraResponse { infra_id, stream_id }),
    ))
}

#[derive(Debug, serde::Deserialize)]
struct StreamQuery {
    last_seen: Option<u64>,
}

async fn provisioning_logs(
    State(state): State<AppState>,
    Path((project_id, kind, infra_id)): Path<(i64, String, i64)>,
    Query(query): Query<StreamQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, (StatusCode, String)> {
    let kind: InfraKind = kind
        .parse()
        .map_err(|_| (StatusCode::NOT_FOUND, format!("unknown infra kind {kind}")))?;

    let stream_id = provision_service::stream_id(kind, project_id, infra_id);
    let hub = state.hub.clone();
    Ok(ws
        .on_upgrade(move |socket| websocket::relay(socket, hub, stream_id, query.last_seen))
        .into_response())
}
