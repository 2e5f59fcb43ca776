//! HTTP surface: poll, push, ingestion and self-observability routes.

mod ingest;
mod poll;
mod stream;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::hub::FanOutHub;
use crate::metrics::StoreMetrics;
use crate::stats::StatsCollector;
use crate::store::validate_id;

/// Shared state for axum handlers.
pub struct AppState {
    pub hub: Arc<FanOutHub>,
    pub stats: Arc<StatsCollector>,
    pub metrics: Arc<StoreMetrics>,
}

/// Builds the full route table.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/dashboard", get(poll::dashboard))
        .route("/api/endpoints", get(poll::endpoints))
        .route("/api/endpoints/{id}", get(poll::endpoint))
        .route("/api/endpoints/{id}/tunnels/{instance}", get(poll::tunnel))
        .route("/api/endpoints/{id}/trend", get(poll::trend))
        .route("/api/stats", get(poll::stats))
        .route("/api/sse/dashboard", get(stream::dashboard_sse))
        .route("/api/sse/tunnel/{instance}", get(stream::tunnel_sse))
        .route("/api/ws", get(stream::monitor_ws))
        .route("/api/ingest/endpoints", post(ingest::upsert_endpoint))
        .route("/api/ingest/endpoints/{id}", delete(ingest::remove_endpoint))
        .route(
            "/api/ingest/endpoints/{id}/tunnels",
            post(ingest::tunnel_update).put(ingest::full_report),
        )
        .route(
            "/api/ingest/endpoints/{id}/tunnels/{instance}",
            delete(ingest::remove_tunnel),
        )
        .route("/api/ingest/endpoints/{id}/status", put(ingest::set_status))
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(state)
}

/// HTTP server lifecycle around [`router`].
pub struct ApiServer {
    /// Bind address with the ":port" shorthand already expanded.
    addr: String,
    state: Arc<AppState>,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ApiServer {
    pub fn new(cfg: &ServerConfig, state: Arc<AppState>) -> Self {
        Self {
            addr: cfg.bind_addr(),
            state,
            shutdown: parking_lot::Mutex::new(None),
            task: parking_lot::Mutex::new(None),
        }
    }

    /// Binds and starts serving. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let bind_addr = self.addr.as_str();
        let app = router(Arc::clone(&self.state));

        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        let task = tokio::spawn(async move {
            info!(addr = %local_addr, "api server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                error!(error = %e, "api server error");
            }
        });
        *self.task.lock() = Some(task);

        Ok(local_addr)
    }

    /// Stops accepting connections and waits for in-flight requests.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        let task = self.task.lock().take();
        if let Some(task) = task {
            task.await.context("joining api server task")?;
        }

        Ok(())
    }
}

// --- Response envelopes ---

/// `{"success": false, "error": ...}` with the given status.
pub(crate) fn failure(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({ "success": false, "error": message.into() })),
    )
        .into_response()
}

/// Validates a path identifier, mapping failures to a 400 envelope.
pub(crate) fn checked_id(kind: &'static str, id: &str) -> Result<(), Response> {
    validate_id(kind, id).map_err(|e| failure(StatusCode::BAD_REQUEST, e.to_string()))
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.stats.publish(&state.metrics);

    match state.metrics.encode() {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
