use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use super::{checked_id, failure, AppState};
use crate::store::{ConnectionStatus, EndpointStatus, HostInfo, StoreError, TunnelUpdate};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct RegisterEndpoint {
    endpoint_id: String,
    #[serde(default)]
    host: HostInfo,
}

#[derive(Debug, Deserialize)]
pub(super) struct FullReport {
    tunnels: Vec<TunnelUpdate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct StatusReport {
    status: EndpointStatus,
    connection_status: ConnectionStatus,
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, Response> {
    payload
        .map(|Json(value)| value)
        .map_err(|e| failure(StatusCode::BAD_REQUEST, e.body_text()))
}

fn store_failure(e: StoreError) -> Response {
    let status = if e.is_malformed() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::CONFLICT
    };
    failure(status, e.to_string())
}

/// POST /api/ingest/endpoints
pub(super) async fn upsert_endpoint(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RegisterEndpoint>, JsonRejection>,
) -> Response {
    let req = match body(payload) {
        Ok(req) => req,
        Err(rejection) => return rejection,
    };

    match state.hub.registry().upsert_endpoint(&req.endpoint_id, req.host) {
        Ok(created) => Json(json!({ "success": true, "created": created })).into_response(),
        Err(e) => store_failure(e),
    }
}

/// DELETE /api/ingest/endpoints/{id}
pub(super) async fn remove_endpoint(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    if let Err(rejection) = checked_id("endpoint", &id) {
        return rejection;
    }

    let removed = state.hub.registry().remove_endpoint(&id);
    Json(json!({ "success": true, "removed": removed })).into_response()
}

/// POST /api/ingest/endpoints/{id}/tunnels
pub(super) async fn tunnel_update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    payload: Result<Json<TunnelUpdate>, JsonRejection>,
) -> Response {
    let update = match body(payload) {
        Ok(update) => update,
        Err(rejection) => return rejection,
    };

    match state.hub.registry().apply_tunnel_update(&id, &update) {
        Ok(outcome) => Json(json!({ "success": true, "outcome": outcome })).into_response(),
        Err(e) => {
            if !e.is_malformed() {
                warn!(endpoint_id = %id, error = %e, "rejected tunnel update");
            }
            store_failure(e)
        }
    }
}

/// PUT /api/ingest/endpoints/{id}/tunnels
pub(super) async fn full_report(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    payload: Result<Json<FullReport>, JsonRejection>,
) -> Response {
    let report = match body(payload) {
        Ok(report) => report,
        Err(rejection) => return rejection,
    };

    match state.hub.registry().apply_full_report(&id, &report.tunnels) {
        Ok(outcome) => Json(json!({ "success": true, "data": outcome })).into_response(),
        Err(e) => store_failure(e),
    }
}

/// DELETE /api/ingest/endpoints/{id}/tunnels/{instance}
pub(super) async fn remove_tunnel(
    State(state): State<Arc<AppState>>,
    Path((id, instance)): Path<(String, String)>,
) -> Response {
    if let Err(rejection) =
        checked_id("endpoint", &id).and_then(|()| checked_id("instance", &instance))
    {
        return rejection;
    }

    let removed = state.hub.registry().remove_tunnel(&id, &instance);
    Json(json!({ "success": true, "removed": removed })).into_response()
}

/// PUT /api/ingest/endpoints/{id}/status
pub(super) async fn set_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    payload: Result<Json<StatusReport>, JsonRejection>,
) -> impl IntoResponse {
    if let Err(rejection) = checked_id("endpoint", &id) {
        return rejection;
    }
    let report = match body(payload) {
        Ok(report) => report,
        Err(rejection) => return rejection,
    };

    if state
        .hub
        .registry()
        .set_endpoint_status(&id, report.status, report.connection_status)
    {
        Json(json!({ "success": true })).into_response()
    } else {
        failure(StatusCode::OK, format!("endpoint {id} not found"))
    }
}
