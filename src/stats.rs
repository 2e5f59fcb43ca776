use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::hub::{FanOutHub, SessionCounts, SessionKind};
use crate::metrics::StoreMetrics;
use crate::store::{EndpointRegistry, IngestOutcome, StatusCounts, TunnelStatus};

/// Operational counters about the store itself.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub endpoints: usize,
    pub tunnels: usize,
    pub tunnels_by_status: StatusCounts,
    pub trend_samples: usize,
    pub index_entries: usize,
    pub approx_memory_bytes: usize,
    pub sessions: SessionCounts,
    /// Running ingestion totals keyed by outcome.
    pub ingest: BTreeMap<&'static str, u64>,
    pub uptime_seconds: i64,
    pub timestamp: i64,
}

/// Read-only view over the registry and hub for self-observability.
pub struct StatsCollector {
    registry: Arc<EndpointRegistry>,
    hub: Arc<FanOutHub>,
    started_at: DateTime<Utc>,
    /// Ingest totals already pushed into Prometheus counters.
    published: Mutex<BTreeMap<&'static str, u64>>,
}

impl StatsCollector {
    pub fn new(registry: Arc<EndpointRegistry>, hub: Arc<FanOutHub>) -> Self {
        Self {
            registry,
            hub,
            started_at: Utc::now(),
            published: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn collect(&self) -> StoreStats {
        let now = Utc::now();
        let counts = self.registry.counts();
        let ingest = self
            .registry
            .ingest_stats()
            .totals()
            .into_iter()
            .map(|(outcome, n)| (outcome.as_str(), n))
            .collect();

        StoreStats {
            endpoints: counts.endpoints,
            tunnels: counts.tunnels.total(),
            tunnels_by_status: counts.tunnels,
            trend_samples: counts.trend_samples,
            index_entries: counts.index_entries,
            approx_memory_bytes: counts.approx_bytes,
            sessions: self.hub.session_counts(),
            ingest,
            uptime_seconds: (now - self.started_at).num_seconds(),
            timestamp: now.timestamp(),
        }
    }

    /// Refresh gauges and advance ingest counters to the current totals.
    pub fn publish(&self, metrics: &StoreMetrics) -> StoreStats {
        let stats = self.collect();

        metrics.endpoints_tracked.set(stats.endpoints as i64);
        for status in TunnelStatus::ALL {
            metrics
                .tunnels_tracked
                .with_label_values(&[status.as_str()])
                .set(stats.tunnels_by_status.get(status) as i64);
        }
        metrics.trend_samples.set(stats.trend_samples as i64);
        metrics.store_bytes.set(stats.approx_memory_bytes as i64);

        for kind in SessionKind::ALL {
            metrics
                .active_sessions
                .with_label_values(&[kind.as_str()])
                .set(stats.sessions.get(kind) as i64);
        }

        let mut published = self.published.lock();
        for outcome in IngestOutcome::ALL {
            let name = outcome.as_str();
            let total = stats.ingest.get(name).copied().unwrap_or(0);
            let seen = published.entry(name).or_insert(0);
            if total > *seen {
                metrics
                    .ingest_updates
                    .with_label_values(&[name])
                    .inc_by(total - *seen);
                *seen = total;
            }
        }

        stats
    }
}
