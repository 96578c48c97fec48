//! HTTP handlers for the daemon's own API.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use fleetd_protocol::{HubStats, UnsubscribeRequest, UnsubscribeResponse};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::auth::{CurrentUser, RequireAdmin};
use super::error::{ApiError, ApiResult};
use super::state::AppState;
use crate::host_api::VmAction;
use crate::hosts::HostRecord;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============================================================================
// Events
// ============================================================================

/// POST /api/v1/events/unsubscribe
pub async fn unsubscribe(
    State(state): State<AppState>,
    _user: CurrentUser,
    Json(request): Json<UnsubscribeRequest>,
) -> ApiResult<Json<UnsubscribeResponse>> {
    if request.client_id.trim().is_empty() {
        return Err(ApiError::BadRequest("client_id is required".to_string()));
    }
    let removed = state
        .hub
        .unsubscribe(&request.client_id, &request.event_types)
        .await?;
    Ok(Json(UnsubscribeResponse {
        client_id: request.client_id,
        removed,
    }))
}

/// GET /api/v1/events/stats
pub async fn event_stats(State(state): State<AppState>, user: CurrentUser) -> Json<HubStats> {
    Json(state.hub.get_stats(user.is_admin()))
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Cached host record plus live event stream status.
#[derive(Debug, Serialize)]
pub struct HostView {
    #[serde(flatten)]
    pub host: HostRecord,
    pub websocket_connected: bool,
    /// Summary of the last system health check's services.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub services_status: Option<&'static str>,
}

impl HostView {
    async fn build(state: &AppState, host: &HostRecord) -> Self {
        Self {
            websocket_connected: state.connections.is_connected(&host.id).await,
            services_status: host.health_check.as_ref().map(|check| check.status().1),
            host: host.redacted(),
        }
    }
}

/// GET /api/v1/orchestrator/hosts
pub async fn list_hosts(
    State(state): State<AppState>,
    user: CurrentUser,
) -> ApiResult<Json<Vec<HostView>>> {
    let hosts = state.store.list().await?;
    let mut views = Vec::with_capacity(hosts.len());
    for host in hosts.iter().filter(|h| user.can_access(h)) {
        views.push(HostView::build(&state, host).await);
    }
    Ok(Json(views))
}

/// GET /api/v1/orchestrator/hosts/{host_id}
///
/// Unlike the list, `state` comes from a live probe of the host.
pub async fn get_host(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(host_id): Path<String>,
) -> ApiResult<Json<HostView>> {
    let mut host = state
        .store
        .get(&host_id)
        .await?
        .filter(|h| user.can_access(h))
        .ok_or_else(|| ApiError::NotFound(format!("host {host_id} not found")))?;
    host.state = state.operations.live_state(&host).await;
    Ok(Json(HostView::build(&state, &host).await))
}

/// POST /api/v1/orchestrator/refresh
pub async fn refresh(State(state): State<AppState>, _admin: RequireAdmin) -> StatusCode {
    state.reconciler.refresh();
    StatusCode::ACCEPTED
}

#[derive(Debug, Default, Deserialize)]
pub struct VmActionQuery {
    #[serde(default)]
    pub force: bool,
}

/// POST /api/v1/orchestrator/hosts/{host_id}/machines/{vm_id}/{action}
pub async fn vm_action(
    State(state): State<AppState>,
    _admin: RequireAdmin,
    Path((host_id, vm_id, action)): Path<(String, String, String)>,
    Query(query): Query<VmActionQuery>,
) -> ApiResult<Json<Value>> {
    let action = match action.parse::<VmAction>().map_err(ApiError::BadRequest)? {
        VmAction::Stop { .. } => VmAction::Stop { force: query.force },
        other => other,
    };
    let result = state.operations.vm_action(&host_id, &vm_id, action).await?;
    Ok(Json(result))
}

/// DELETE /api/v1/orchestrator/hosts/{host_id}/machines/{vm_id}
pub async fn delete_vm(
    State(state): State<AppState>,
    _admin: RequireAdmin,
    Path((host_id, vm_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    state.operations.delete_vm(&host_id, &vm_id).await?;
    Ok(StatusCode::ACCEPTED)
}

/// GET /api/v1/orchestrator/hosts/{host_id}/catalog/cache
pub async fn catalog_cache(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(host_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let host = state
        .store
        .get(&host_id)
        .await?
        .filter(|h| user.can_access(h))
        .ok_or_else(|| ApiError::NotFound(format!("host {host_id} not found")))?;
    Ok(Json(state.operations.catalog_cache(&host.id).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct CatalogCacheQuery {
    pub catalog_id: Option<String>,
    pub version: Option<String>,
}

/// DELETE /api/v1/orchestrator/hosts/{host_id}/catalog/cache
pub async fn delete_catalog_cache(
    State(state): State<AppState>,
    _admin: RequireAdmin,
    Path(host_id): Path<String>,
    Query(query): Query<CatalogCacheQuery>,
) -> ApiResult<StatusCode> {
    if query.version.is_some() && query.catalog_id.is_none() {
        return Err(ApiError::BadRequest(
            "version requires catalog_id".to_string(),
        ));
    }
    state
        .operations
        .delete_catalog_cache(
            &host_id,
            query.catalog_id.as_deref(),
            query.version.as_deref(),
        )
        .await?;
    Ok(StatusCode::ACCEPTED)
}
