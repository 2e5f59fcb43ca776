use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::QueryRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::header::{self, HeaderName};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::debug;

use super::{checked_id, failure, AppState};
use crate::hub::{FanOutHub, StreamSession};

const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

/// Wraps a session as an SSE response with intermediary buffering disabled.
fn sse_response(session: StreamSession, keep_alive: Duration) -> Response {
    let events = session
        .into_stream()
        .map(|frame| Ok::<_, Infallible>(Event::default().data(frame)));

    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (X_ACCEL_BUFFERING, "no"),
        ],
        Sse::new(events).keep_alive(KeepAlive::new().interval(keep_alive)),
    )
        .into_response()
}

/// GET /api/sse/dashboard
pub(super) async fn dashboard_sse(State(state): State<Arc<AppState>>) -> Response {
    let session = state.hub.open_dashboard_stream();
    sse_response(session, state.hub.streaming_config().keep_alive)
}

/// GET /api/sse/tunnel/{instance}
pub(super) async fn tunnel_sse(
    State(state): State<Arc<AppState>>,
    Path(instance): Path<String>,
) -> Response {
    if let Err(rejection) = checked_id("instance", &instance) {
        return rejection;
    }

    let session = state.hub.open_tunnel_stream(&instance);
    sse_response(session, state.hub.streaming_config().keep_alive)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct MonitorParams {
    #[serde(rename = "type")]
    kind: String,
    endpoint_id: Option<String>,
    instance_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum MonitorTarget {
    System(String),
    Tunnel(String),
}

impl MonitorParams {
    fn target(self) -> Result<MonitorTarget, String> {
        let (target, kind, id) = match self.kind.as_str() {
            "system" => (
                self.endpoint_id.map(MonitorTarget::System),
                "endpoint",
                "endpointId",
            ),
            "tunnel" => (
                self.instance_id.map(MonitorTarget::Tunnel),
                "instance",
                "instanceId",
            ),
            other => return Err(format!("unknown monitor type {other:?}")),
        };

        let target = target.ok_or_else(|| format!("{id} is required"))?;
        let (MonitorTarget::System(value) | MonitorTarget::Tunnel(value)) = &target;
        crate::store::validate_id(kind, value).map_err(|e| e.to_string())?;
        Ok(target)
    }
}

/// GET /api/ws?type=system&endpointId= or ?type=tunnel&instanceId=
pub(super) async fn monitor_ws(
    State(state): State<Arc<AppState>>,
    params: Result<Query<MonitorParams>, QueryRejection>,
    ws: WebSocketUpgrade,
) -> Response {
    let target = match params {
        Ok(Query(params)) => params.target(),
        Err(e) => Err(e.body_text()),
    };
    let target = match target {
        Ok(target) => target,
        Err(message) => return failure(StatusCode::BAD_REQUEST, message),
    };

    let hub = Arc::clone(&state.hub);
    ws.on_upgrade(move |socket| run_monitor(socket, hub, target))
}

/// Pumps session frames into the socket until either side goes away.
async fn run_monitor(socket: WebSocket, hub: Arc<FanOutHub>, target: MonitorTarget) {
    let mut session = match &target {
        MonitorTarget::System(endpoint_id) => hub.open_system_monitor(endpoint_id),
        MonitorTarget::Tunnel(instance_id) => hub.open_tunnel_monitor(instance_id),
    };
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            frame = session.next_frame() => {
                let Some(frame) = frame else { break };
                if sender.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    session.cancel();
    let _ = sender.close().await;
    debug!(session_id = session.id(), monitor = ?target, "monitor socket closed");
}
