use std::sync::Arc;

use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use super::{checked_id, failure, AppState};
use crate::hub::TunnelLookup;
use crate::store::{clamp_hours, DEFAULT_QUERY_HOURS};

#[derive(Debug, Deserialize)]
pub(super) struct TrendParams {
    hours: Option<i64>,
}

/// GET /api/dashboard
pub(super) async fn dashboard(State(state): State<Arc<AppState>>) -> Response {
    let view = state.hub.dashboard();
    let timestamp = view.timestamp;
    Json(json!({
        "success": true,
        "data": view,
        "source": "memory",
        "timestamp": timestamp,
    }))
    .into_response()
}

/// GET /api/endpoints
pub(super) async fn endpoints(State(state): State<Arc<AppState>>) -> Response {
    let summaries = state.hub.endpoints();
    Json(json!({
        "success": true,
        "count": summaries.len(),
        "data": summaries,
    }))
    .into_response()
}

/// GET /api/endpoints/{id}
pub(super) async fn endpoint(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    if let Err(rejection) = checked_id("endpoint", &id) {
        return rejection;
    }

    match state.hub.endpoint(&id) {
        Some(snapshot) => Json(json!({ "success": true, "data": snapshot })).into_response(),
        None => Json(json!({
            "success": true,
            "data": null,
            "message": format!("no data for endpoint {id}"),
        }))
        .into_response(),
    }
}

/// GET /api/endpoints/{id}/tunnels/{instance}
pub(super) async fn tunnel(
    State(state): State<Arc<AppState>>,
    Path((id, instance)): Path<(String, String)>,
) -> Response {
    if let Err(rejection) =
        checked_id("endpoint", &id).and_then(|()| checked_id("instance", &instance))
    {
        return rejection;
    }

    match state.hub.tunnel(&id, &instance) {
        TunnelLookup::Found(view) => Json(json!({ "success": true, "data": view })).into_response(),
        TunnelLookup::EndpointNotFound => {
            failure(StatusCode::OK, format!("endpoint {id} not found"))
        }
        TunnelLookup::TunnelNotFound => failure(
            StatusCode::OK,
            format!("tunnel {instance} not found on endpoint {id}"),
        ),
    }
}

/// GET /api/endpoints/{id}/trend?hours=
pub(super) async fn trend(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    params: Result<Query<TrendParams>, QueryRejection>,
) -> Response {
    if let Err(rejection) = checked_id("endpoint", &id) {
        return rejection;
    }

    let Query(params) = match params {
        Ok(params) => params,
        Err(e) => return failure(StatusCode::BAD_REQUEST, e.body_text()),
    };
    let hours = params.hours.unwrap_or(i64::from(DEFAULT_QUERY_HOURS));

    match state.hub.trend(&id, hours) {
        Some(view) => Json(json!({
            "success": true,
            "data": view.samples,
            "hours": view.hours,
            "count": view.count,
        }))
        .into_response(),
        None => Json(json!({
            "success": true,
            "data": [],
            "hours": clamp_hours(hours),
            "count": 0,
            "message": format!("no data for endpoint {id}"),
        }))
        .into_response(),
    }
}

/// GET /api/stats
pub(super) async fn stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "success": true, "data": state.stats.collect() }))
}
