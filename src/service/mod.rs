use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::api::{ApiServer, AppState};
use crate::config::Config;
use crate::hub::FanOutHub;
use crate::metrics::StoreMetrics;
use crate::stats::StatsCollector;
use crate::store::EndpointRegistry;

/// Owns the registry, the hub and the HTTP server, and runs maintenance.
pub struct Service {
    cfg: Config,
    registry: Arc<EndpointRegistry>,
    hub: Arc<FanOutHub>,
    stats: Arc<StatsCollector>,
    metrics: Arc<StoreMetrics>,
    server: ApiServer,
    local_addr: Option<SocketAddr>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl Service {
    /// Builds every component without starting anything.
    pub fn new(cfg: Config) -> Result<Self> {
        let metrics = Arc::new(StoreMetrics::new().context("creating store metrics")?);
        let registry = Arc::new(EndpointRegistry::new(cfg.trend.settings()));
        let hub = Arc::new(FanOutHub::new(
            Arc::clone(&registry),
            cfg.streaming.clone(),
            Some(Arc::clone(&metrics)),
        ));
        let stats = Arc::new(StatsCollector::new(Arc::clone(&registry), Arc::clone(&hub)));

        let state = Arc::new(AppState {
            hub: Arc::clone(&hub),
            stats: Arc::clone(&stats),
            metrics: Arc::clone(&metrics),
        });
        let server = ApiServer::new(&cfg.server, state);

        Ok(Self {
            cfg,
            registry,
            hub,
            stats,
            metrics,
            server,
            local_addr: None,
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    pub fn hub(&self) -> &Arc<FanOutHub> {
        &self.hub
    }

    /// Address the HTTP server is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Start the HTTP server and background loops.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        let addr = self
            .server
            .start()
            .await
            .context("starting api server")?;
        self.local_addr = Some(addr);

        self.spawn_trend_sampler();
        self.spawn_maintenance();

        info!(
            addr = %addr,
            retention_hours = self.cfg.trend.retention_hours(),
            "service started"
        );

        Ok(addr)
    }

    /// Stop background loops, drain streaming sessions, then stop the server.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;

        // Sessions must end first so open SSE responses complete.
        self.hub.shutdown().await;

        self.server.stop().await?;

        info!("service stopped");
        Ok(())
    }

    /// Samples every endpoint's aggregate into its trend on a fixed cadence.
    fn spawn_trend_sampler(&self) {
        let cancel = self.cancel.clone();
        let registry = Arc::clone(&self.registry);
        let interval = self.cfg.trend.sample_interval;

        self.tasks.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let sampled = registry.sample_trends(Utc::now());
                        debug!(endpoints = sampled, "sampled trends");
                    }
                }
            }
        });
    }

    /// Evicts expired trend samples, purges long-stopped tunnels and refreshes metrics.
    fn spawn_maintenance(&self) {
        let cancel = self.cancel.clone();
        let registry = Arc::clone(&self.registry);
        let stats = Arc::clone(&self.stats);
        let metrics = Arc::clone(&self.metrics);
        let interval = self.cfg.retention.maintenance_interval;
        let stopped_ttl = self.cfg.retention.stopped_tunnel_ttl();

        self.tasks.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let start = Instant::now();
                        let now = Utc::now();

                        let evicted = registry.evict_expired(now);
                        let purged = stopped_ttl
                            .map(|ttl| registry.purge_stopped_tunnels(now, ttl))
                            .unwrap_or(0);
                        let snapshot = stats.publish(&metrics);

                        metrics
                            .maintenance_duration
                            .observe(start.elapsed().as_secs_f64());

                        if evicted > 0 || purged > 0 {
                            info!(
                                evicted_samples = evicted,
                                purged_tunnels = purged,
                                endpoints = snapshot.endpoints,
                                "maintenance pass"
                            );
                        }
                    }
                }
            }
        });
    }
}
