use anyhow::{Context, Result};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

const NAMESPACE: &str = "tunnelboard";

/// Prometheus metrics for the store and its streaming sessions.
///
/// All metrics use the "tunnelboard" namespace and live in a private
/// registry so tests can build as many instances as they like.
pub struct StoreMetrics {
    registry: Registry,

    /// Endpoint records currently held.
    pub endpoints_tracked: IntGauge,
    /// Tunnel instances currently held, by status.
    pub tunnels_tracked: IntGaugeVec,
    /// Trend samples across all endpoints.
    pub trend_samples: IntGauge,
    /// Approximate in-memory footprint of the store.
    pub store_bytes: IntGauge,
    /// Ingestion calls by outcome.
    pub ingest_updates: IntCounterVec,
    /// Open streaming sessions by kind.
    pub active_sessions: IntGaugeVec,
    /// Frames delivered to streaming consumers, by session kind.
    pub stream_frames: IntCounterVec,
    /// Ticks skipped because the frame could not be built, by session kind.
    pub stream_frame_errors: IntCounterVec,
    /// Duration of one maintenance pass.
    pub maintenance_duration: Histogram,
}

impl StoreMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let endpoints_tracked = IntGauge::with_opts(
            Opts::new("endpoints_tracked", "Endpoint records currently held.").namespace(NAMESPACE),
        )?;
        let tunnels_tracked = IntGaugeVec::new(
            Opts::new("tunnels_tracked", "Tunnel instances currently held, by status.")
                .namespace(NAMESPACE),
            &["status"],
        )?;
        let trend_samples = IntGauge::with_opts(
            Opts::new("trend_samples", "Trend samples held across all endpoints.")
                .namespace(NAMESPACE),
        )?;
        let store_bytes = IntGauge::with_opts(
            Opts::new(
                "store_approx_bytes",
                "Approximate in-memory footprint of the store in bytes.",
            )
            .namespace(NAMESPACE),
        )?;
        let ingest_updates = IntCounterVec::new(
            Opts::new("ingest_updates_total", "Ingestion calls by outcome.").namespace(NAMESPACE),
            &["outcome"],
        )?;
        let active_sessions = IntGaugeVec::new(
            Opts::new("active_sessions", "Open streaming sessions by kind.").namespace(NAMESPACE),
            &["kind"],
        )?;
        let stream_frames = IntCounterVec::new(
            Opts::new(
                "stream_frames_total",
                "Frames delivered to streaming consumers, by session kind.",
            )
            .namespace(NAMESPACE),
            &["kind"],
        )?;
        let stream_frame_errors = IntCounterVec::new(
            Opts::new(
                "stream_frame_errors_total",
                "Ticks skipped because a frame could not be built, by session kind.",
            )
            .namespace(NAMESPACE),
            &["kind"],
        )?;
        let maintenance_duration = Histogram::with_opts(
            HistogramOpts::new(
                "maintenance_duration_seconds",
                "Duration of one maintenance pass in seconds.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )?;

        registry.register(Box::new(endpoints_tracked.clone()))?;
        registry.register(Box::new(tunnels_tracked.clone()))?;
        registry.register(Box::new(trend_samples.clone()))?;
        registry.register(Box::new(store_bytes.clone()))?;
        registry.register(Box::new(ingest_updates.clone()))?;
        registry.register(Box::new(active_sessions.clone()))?;
        registry.register(Box::new(stream_frames.clone()))?;
        registry.register(Box::new(stream_frame_errors.clone()))?;
        registry.register(Box::new(maintenance_duration.clone()))?;

        Ok(Self {
            registry,
            endpoints_tracked,
            tunnels_tracked,
            trend_samples,
            store_bytes,
            ingest_updates,
            active_sessions,
            stream_frames,
            stream_frame_errors,
            maintenance_duration,
        })
    }

    /// Render every registered metric in the Prometheus text format.
    pub fn encode(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("encoding metrics")?;
        String::from_utf8(buffer).context("converting metrics to string")
    }
}
