//! Poll and push delivery over the endpoint registry.
//!
//! Every push session runs its own sampling loop on its own timer. Loops
//! hold no lock across an await and stop within one tick of cancellation.

mod frame;
mod session;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::config::StreamingConfig;
use crate::dashboard::{self, DashboardRollup};
use crate::metrics::StoreMetrics;
use crate::store::{
    clamp_hours, EndpointRegistry, EndpointSnapshot, EndpointSummary, TrendSample, TunnelView,
};

pub use frame::{SessionKind, StreamFrame};
pub use session::{SessionStream, StreamSession};

/// Dashboard poll result.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardView {
    pub rollup: DashboardRollup,
    pub endpoints: Vec<EndpointSummary>,
    pub timestamp: i64,
}

/// Tunnel poll result.
#[derive(Debug, Clone, PartialEq)]
pub enum TunnelLookup {
    Found(TunnelView),
    EndpointNotFound,
    TunnelNotFound,
}

/// Trend poll result.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendView {
    /// Window actually applied after clamping.
    pub hours: u32,
    pub count: usize,
    pub samples: Vec<TrendSample>,
}

/// Open sessions by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCounts {
    pub dashboard_stream: usize,
    pub tunnel_stream: usize,
    pub system_monitor: usize,
    pub tunnel_monitor: usize,
    pub total: usize,
}

impl SessionCounts {
    pub fn get(&self, kind: SessionKind) -> usize {
        match kind {
            SessionKind::DashboardStream => self.dashboard_stream,
            SessionKind::TunnelStream => self.tunnel_stream,
            SessionKind::SystemMonitor => self.system_monitor,
            SessionKind::TunnelMonitor => self.tunnel_monitor,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    Cancelled,
    ConsumerGone,
}

impl CloseReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::ConsumerGone => "consumer_gone",
        }
    }
}

/// Read-only delivery surface over the registry.
pub struct FanOutHub {
    registry: Arc<EndpointRegistry>,
    cfg: StreamingConfig,
    root: CancellationToken,
    tracker: TaskTracker,
    sessions: DashMap<u64, SessionKind>,
    next_id: AtomicU64,
    metrics: Option<Arc<StoreMetrics>>,
}

impl FanOutHub {
    pub fn new(
        registry: Arc<EndpointRegistry>,
        cfg: StreamingConfig,
        metrics: Option<Arc<StoreMetrics>>,
    ) -> Self {
        Self {
            registry,
            cfg,
            root: CancellationToken::new(),
            tracker: TaskTracker::new(),
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
            metrics,
        }
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    pub fn streaming_config(&self) -> &StreamingConfig {
        &self.cfg
    }

    // --- Poll surface ---

    pub fn dashboard(&self) -> DashboardView {
        let endpoints = self.registry.summaries();
        DashboardView {
            rollup: dashboard::aggregate(&endpoints),
            endpoints,
            timestamp: Utc::now().timestamp(),
        }
    }

    pub fn endpoints(&self) -> Vec<EndpointSummary> {
        self.registry.summaries()
    }

    pub fn endpoint(&self, endpoint_id: &str) -> Option<EndpointSnapshot> {
        self.registry.get(endpoint_id)
    }

    pub fn tunnel(&self, endpoint_id: &str, instance_id: &str) -> TunnelLookup {
        match self.registry.tunnel(endpoint_id, instance_id) {
            Some(view) => TunnelLookup::Found(view),
            None if !self.registry.contains(endpoint_id) => TunnelLookup::EndpointNotFound,
            None => TunnelLookup::TunnelNotFound,
        }
    }

    pub fn trend(&self, endpoint_id: &str, hours: i64) -> Option<TrendView> {
        let hours = clamp_hours(hours);
        let samples = self.registry.trend(endpoint_id, i64::from(hours))?;
        Some(TrendView {
            hours,
            count: samples.len(),
            samples,
        })
    }

    // --- Push surface ---

    /// Dashboard rollup plus endpoint summaries every dashboard tick.
    pub fn open_dashboard_stream(self: &Arc<Self>) -> StreamSession {
        self.open(
            SessionKind::DashboardStream,
            self.cfg.dashboard_interval,
            None,
            None,
            |hub| {
                let view = hub.dashboard();
                StreamFrame::Dashboard {
                    rollup: view.rollup,
                    endpoints: view.endpoints,
                    timestamp: view.timestamp,
                }
            },
        )
    }

    /// One tunnel, found by instance id across all endpoints, every tunnel tick.
    pub fn open_tunnel_stream(self: &Arc<Self>, instance_id: &str) -> StreamSession {
        self.open_tunnel_session(SessionKind::TunnelStream, self.cfg.tunnel_interval, instance_id)
    }

    /// Tunnel monitor for the WebSocket surface.
    pub fn open_tunnel_monitor(self: &Arc<Self>, instance_id: &str) -> StreamSession {
        self.open_tunnel_session(SessionKind::TunnelMonitor, self.cfg.monitor_interval, instance_id)
    }

    /// Endpoint detail for the WebSocket surface.
    pub fn open_system_monitor(self: &Arc<Self>, endpoint_id: &str) -> StreamSession {
        let target = endpoint_id.to_string();
        self.open(
            SessionKind::SystemMonitor,
            self.cfg.monitor_interval,
            Some(target.clone()),
            None,
            move |hub| {
                StreamFrame::endpoint_or_not_found(
                    &target,
                    hub.registry.get(&target),
                    Utc::now().timestamp(),
                )
            },
        )
    }

    fn open_tunnel_session(
        self: &Arc<Self>,
        kind: SessionKind,
        period: Duration,
        instance_id: &str,
    ) -> StreamSession {
        let target = instance_id.to_string();
        let current = self.registry.find_tunnel(&target);
        self.open(kind, period, Some(target.clone()), current, move |hub| {
            StreamFrame::tunnel_or_not_found(
                &target,
                hub.registry.find_tunnel(&target),
                Utc::now().timestamp(),
            )
        })
    }

    fn open<F>(
        self: &Arc<Self>,
        kind: SessionKind,
        period: Duration,
        target: Option<String>,
        tunnel: Option<TunnelView>,
        sample: F,
    ) -> StreamSession
    where
        F: Fn(&FanOutHub) -> StreamFrame + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.cfg.channel_capacity.max(1));
        let cancel = self.root.child_token();

        self.sessions.insert(id, kind);
        if let Some(metrics) = &self.metrics {
            metrics.active_sessions.with_label_values(&[kind.as_str()]).inc();
        }
        debug!(session_id = id, kind = kind.as_str(), watch = ?target, "stream session opened");

        let ack = StreamFrame::Connected {
            session_id: id,
            kind,
            target,
            tunnel,
            timestamp: Utc::now().timestamp(),
        };

        let hub = Arc::clone(self);
        let loop_cancel = cancel.clone();
        self.tracker.spawn(async move {
            let reason = hub
                .run_session(kind, period, &loop_cancel, &tx, ack, sample)
                .await;

            hub.sessions.remove(&id);
            if let Some(metrics) = &hub.metrics {
                metrics.active_sessions.with_label_values(&[kind.as_str()]).dec();
            }
            debug!(
                session_id = id,
                kind = kind.as_str(),
                reason = reason.as_str(),
                "stream session closed"
            );
        });

        StreamSession::new(id, kind, rx, cancel)
    }

    /// Connecting -> Open -> (tick: sample, send)* -> Closed.
    async fn run_session<F>(
        &self,
        kind: SessionKind,
        period: Duration,
        cancel: &CancellationToken,
        tx: &mpsc::Sender<String>,
        ack: StreamFrame,
        sample: F,
    ) -> CloseReason
    where
        F: Fn(&FanOutHub) -> StreamFrame,
    {
        if cancel.is_cancelled() {
            return CloseReason::Cancelled;
        }

        if let Some(reason) = self.deliver(kind, cancel, tx, &ack).await {
            return reason;
        }

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return CloseReason::Cancelled,
                _ = ticker.tick() => {
                    let frame = sample(self);
                    if let Some(reason) = self.deliver(kind, cancel, tx, &frame).await {
                        return reason;
                    }
                }
            }
        }
    }

    /// Serialize and send one frame. Returns a close reason if the session must end.
    async fn deliver(
        &self,
        kind: SessionKind,
        cancel: &CancellationToken,
        tx: &mpsc::Sender<String>,
        frame: &StreamFrame,
    ) -> Option<CloseReason> {
        let payload = match serde_json::to_string(frame) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(kind = kind.as_str(), error = %e, "skipping unserializable frame");
                if let Some(metrics) = &self.metrics {
                    metrics
                        .stream_frame_errors
                        .with_label_values(&[kind.as_str()])
                        .inc();
                }
                return None;
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => Some(CloseReason::Cancelled),
            sent = tx.send(payload) => match sent {
                Ok(()) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.stream_frames.with_label_values(&[kind.as_str()]).inc();
                    }
                    None
                }
                Err(_) => Some(CloseReason::ConsumerGone),
            },
        }
    }

    // --- Bookkeeping ---

    pub fn session_counts(&self) -> SessionCounts {
        let mut counts = SessionCounts::default();
        for entry in self.sessions.iter() {
            match *entry.value() {
                SessionKind::DashboardStream => counts.dashboard_stream += 1,
                SessionKind::TunnelStream => counts.tunnel_stream += 1,
                SessionKind::SystemMonitor => counts.system_monitor += 1,
                SessionKind::TunnelMonitor => counts.tunnel_monitor += 1,
            }
            counts.total += 1;
        }
        counts
    }

    /// Cancel every session and wait for all loops to exit.
    pub async fn shutdown(&self) {
        self.root.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        debug!("all stream sessions drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{TunnelStatus, TunnelUpdate};

    fn streaming() -> StreamingConfig {
        StreamingConfig {
            dashboard_interval: Duration::from_secs(2),
            tunnel_interval: Duration::from_secs(1),
            monitor_interval: Duration::from_secs(2),
            channel_capacity: 4,
            keep_alive: Duration::from_secs(15),
        }
    }

    fn hub_with_registry() -> (Arc<FanOutHub>, Arc<EndpointRegistry>) {
        let registry = Arc::new(EndpointRegistry::default());
        let hub = Arc::new(FanOutHub::new(Arc::clone(&registry), streaming(), None));
        (hub, registry)
    }

    fn parse(frame: &str) -> serde_json::Value {
        serde_json::from_str(frame).expect("frame is json")
    }

    #[test]
    fn test_poll_not_found_outcomes() {
        let (hub, registry) = hub_with_registry();
        assert!(hub.endpoint("E1").is_none());
        assert!(hub.trend("E1", 24).is_none());
        assert_eq!(hub.tunnel("E1", "T1"), TunnelLookup::EndpointNotFound);

        registry
            .apply_tunnel_update("E1", &TunnelUpdate::new("T0"))
            .expect("apply");
        assert_eq!(hub.tunnel("E1", "T1"), TunnelLookup::TunnelNotFound);
        assert!(matches!(hub.tunnel("E1", "T0"), TunnelLookup::Found(_)));
    }

    #[test]
    fn test_trend_poll_echoes_clamped_hours() {
        let (hub, registry) = hub_with_registry();
        registry
            .apply_tunnel_update("E1", &TunnelUpdate::new("T1"))
            .expect("apply");
        assert_eq!(hub.trend("E1", 0).expect("known").hours, 1);
        assert_eq!(hub.trend("E1", 500).expect("known").hours, 168);
        assert_eq!(hub.trend("E1", 24).expect("known").count, 0);
    }

    #[test]
    fn test_dashboard_poll_rolls_up() {
        let (hub, registry) = hub_with_registry();
        registry
            .apply_tunnel_update(
                "E1",
                &TunnelUpdate::new("T1")
                    .with_status(TunnelStatus::Running)
                    .with_tcp(10, 0),
            )
            .expect("apply");
        let view = hub.dashboard();
        assert_eq!(view.rollup.endpoints.total, 1);
        assert_eq!(view.rollup.traffic.tcp_rx_bytes, 10);
        assert_eq!(view.endpoints.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dashboard_stream_ack_then_ticks() {
        let (hub, _registry) = hub_with_registry();
        let mut session = hub.open_dashboard_stream();

        let ack = parse(&session.next_frame().await.expect("ack"));
        assert_eq!(ack["type"], "connected");
        assert_eq!(ack["kind"], "dashboard_stream");

        for _ in 0..2 {
            let frame = parse(&session.next_frame().await.expect("tick"));
            assert_eq!(frame["type"], "dashboard");
            assert_eq!(frame["rollup"]["endpoints"]["total"], 0);
        }
        assert_eq!(hub.session_counts().dashboard_stream, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tunnel_stream_names_owning_endpoint() {
        let (hub, registry) = hub_with_registry();
        registry
            .apply_tunnel_update("E2", &TunnelUpdate::new("T").with_tcp(77, 3))
            .expect("apply");

        let mut session = hub.open_tunnel_stream("T");
        let first = parse(&session.next_frame().await.expect("ack"));
        assert_eq!(first["type"], "connected");
        assert_eq!(first["tunnel"]["endpointId"], "E2");
        assert_eq!(first["tunnel"]["tcpRxBytes"], 77);

        let tick = parse(&session.next_frame().await.expect("tick"));
        assert_eq!(tick["type"], "tunnel");
        assert_eq!(tick["tunnel"]["endpointId"], "E2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_tunnel_stream_reports_not_found() {
        let (hub, _registry) = hub_with_registry();
        let mut session = hub.open_tunnel_stream("ghost");
        let _ack = session.next_frame().await.expect("ack");

        let frame = parse(&session.next_frame().await.expect("tick"));
        assert_eq!(frame["type"], "tunnel_not_found");
        assert_eq!(frame["instanceId"], "ghost");
    }

    #[tokio::test(start_paused = true)]
    async fn test_system_monitor_follows_endpoint() {
        let (hub, registry) = hub_with_registry();
        let mut session = hub.open_system_monitor("E1");
        let _ack = session.next_frame().await.expect("ack");
        let frame = parse(&session.next_frame().await.expect("tick"));
        assert_eq!(frame["type"], "endpoint_not_found");

        registry
            .apply_tunnel_update("E1", &TunnelUpdate::new("T1"))
            .expect("apply");
        let frame = parse(&session.next_frame().await.expect("tick"));
        assert_eq!(frame["type"], "endpoint");
        assert_eq!(frame["endpoint"]["endpointId"], "E1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_session_stops_loop() {
        let (hub, _registry) = hub_with_registry();
        let session = hub.open_tunnel_stream("T");
        assert_eq!(hub.session_counts().total, 1);

        drop(session);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(hub.session_counts().total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drains_sessions() {
        let (hub, _registry) = hub_with_registry();
        let mut dashboard = hub.open_dashboard_stream();
        let _tunnel = hub.open_tunnel_monitor("T");
        assert_eq!(hub.session_counts().total, 2);

        hub.shutdown().await;
        assert_eq!(hub.session_counts().total, 0);

        // Buffered frames stay readable, then the session reports closure.
        while dashboard.next_frame().await.is_some() {}
    }
}
