use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::error::StoreError;
use super::trend::{TrendBuffer, TrendSample, DEFAULT_QUERY_HOURS};
use super::tunnel::{ApplyOutcome, Counters, InstanceType, TunnelState, TunnelStatus, TunnelUpdate};

/// Host identity of an endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
}

/// Overall health of an endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointStatus {
    Online,
    #[default]
    Offline,
    Error,
}

impl EndpointStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Error => "error",
        }
    }
}

/// Health of the ingestion link to an endpoint, independent of tunnel status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Connecting,
    #[default]
    Disconnected,
    Failed,
}

/// Tunnel counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCounts {
    pub running: usize,
    pub stopped: usize,
    pub error: usize,
    pub unknown: usize,
}

impl StatusCounts {
    pub fn add(&mut self, status: TunnelStatus) {
        match status {
            TunnelStatus::Running => self.running += 1,
            TunnelStatus::Stopped => self.stopped += 1,
            TunnelStatus::Error => self.error += 1,
            TunnelStatus::Unknown => self.unknown += 1,
        }
    }

    pub fn get(&self, status: TunnelStatus) -> usize {
        match status {
            TunnelStatus::Running => self.running,
            TunnelStatus::Stopped => self.stopped,
            TunnelStatus::Error => self.error,
            TunnelStatus::Unknown => self.unknown,
        }
    }

    pub fn total(&self) -> usize {
        self.running + self.stopped + self.error + self.unknown
    }

    pub fn merge(&mut self, other: &StatusCounts) {
        self.running += other.running;
        self.stopped += other.stopped;
        self.error += other.error;
        self.unknown += other.unknown;
    }
}

/// Tunnel counts by instance type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeCounts {
    pub client: usize,
    pub server: usize,
}

impl TypeCounts {
    pub fn add(&mut self, instance_type: InstanceType) {
        match instance_type {
            InstanceType::Client => self.client += 1,
            InstanceType::Server => self.server += 1,
        }
    }

    pub fn merge(&mut self, other: &TypeCounts) {
        self.client += other.client;
        self.server += other.server;
    }
}

/// Cached aggregate of an endpoint's tunnels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointStats {
    #[serde(flatten)]
    pub traffic: Counters,
    pub total_rx: u64,
    pub total_tx: u64,
    pub total_bytes: u64,
    pub total_tunnels: usize,
    pub tunnels: StatusCounts,
    pub types: TypeCounts,
}

impl EndpointStats {
    /// Fold a set of tunnels into their aggregate.
    pub fn fold<'a>(tunnels: impl IntoIterator<Item = &'a TunnelState>) -> Self {
        let mut stats = Self::default();
        for tunnel in tunnels {
            stats.traffic += tunnel.counters;
            stats.tunnels.add(tunnel.status);
            stats.types.add(tunnel.instance_type);
        }
        stats.total_rx = stats.traffic.rx();
        stats.total_tx = stats.traffic.tx();
        stats.total_bytes = stats.traffic.total();
        stats.total_tunnels = stats.tunnels.total();
        stats
    }
}

/// Outcome of a full-state report for one endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FullReportOutcome {
    pub created: usize,
    pub updated: usize,
    pub resets: usize,
    pub stale: Vec<String>,
    /// Instances absent from the report, now marked stopped.
    pub marked_stopped: Vec<String>,
}

/// Point-in-time copy of an endpoint, safe to hold without any lock.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSnapshot {
    pub endpoint_id: String,
    pub host: HostInfo,
    pub status: EndpointStatus,
    pub connection_status: ConnectionStatus,
    pub stats: EndpointStats,
    /// Sorted by instance id.
    pub tunnels: Vec<TunnelState>,
    pub trend: Vec<TrendSample>,
    pub created_at: DateTime<Utc>,
    pub last_update_time: DateTime<Utc>,
}

impl EndpointSnapshot {
    pub fn tunnel(&self, instance_id: &str) -> Option<&TunnelState> {
        self.tunnels.iter().find(|t| t.instance_id == instance_id)
    }

    pub fn summary(&self) -> EndpointSummary {
        EndpointSummary {
            endpoint_id: self.endpoint_id.clone(),
            host: self.host.clone(),
            status: self.status,
            connection_status: self.connection_status,
            stats: self.stats,
            last_update_time: self.last_update_time,
        }
    }
}

/// Lightweight per-endpoint row used by list views and the dashboard stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSummary {
    pub endpoint_id: String,
    pub host: HostInfo,
    pub status: EndpointStatus,
    pub connection_status: ConnectionStatus,
    pub stats: EndpointStats,
    pub last_update_time: DateTime<Utc>,
}

/// All state of one endpoint. Lives behind the registry's per-record lock.
#[derive(Debug)]
pub struct EndpointRecord {
    pub(crate) endpoint_id: String,
    pub(crate) host: HostInfo,
    pub(crate) status: EndpointStatus,
    pub(crate) connection_status: ConnectionStatus,
    pub(crate) stats: EndpointStats,
    pub(crate) tunnels: HashMap<String, TunnelState>,
    pub(crate) trend: TrendBuffer,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) last_update_time: DateTime<Utc>,
    /// Set once the record is unlinked from the registry.
    pub(crate) removed: bool,
}

impl EndpointRecord {
    pub fn new(
        endpoint_id: impl Into<String>,
        host: HostInfo,
        trend: TrendBuffer,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
            host,
            status: EndpointStatus::default(),
            connection_status: ConnectionStatus::default(),
            stats: EndpointStats::default(),
            tunnels: HashMap::new(),
            trend,
            created_at: now,
            last_update_time: now,
            removed: false,
        }
    }

    pub fn stats(&self) -> &EndpointStats {
        &self.stats
    }

    pub fn tunnel_count(&self) -> usize {
        self.tunnels.len()
    }

    pub fn trend_len(&self) -> usize {
        self.trend.len()
    }

    fn refresh_stats(&mut self) {
        self.stats = EndpointStats::fold(self.tunnels.values());
    }

    /// Apply one tunnel update and refresh the cached aggregate.
    pub fn apply_update(
        &mut self,
        update: &TunnelUpdate,
        now: DateTime<Utc>,
    ) -> Result<ApplyOutcome, StoreError> {
        let outcome = match self.tunnels.get_mut(&update.instance_id) {
            Some(tunnel) => tunnel.apply(update, now)?,
            None => {
                let mut tunnel = TunnelState::new(update.instance_id.clone(), now);
                tunnel.apply(update, now)?;
                self.tunnels.insert(update.instance_id.clone(), tunnel);
                ApplyOutcome::Created
            }
        };

        self.last_update_time = now;
        self.refresh_stats();
        Ok(outcome)
    }

    /// Apply a complete listing of the endpoint's tunnels.
    ///
    /// Instances missing from `updates` are marked stopped with their last
    /// counters preserved. Stale entries are skipped individually.
    pub fn apply_full_report(
        &mut self,
        updates: &[TunnelUpdate],
        now: DateTime<Utc>,
    ) -> FullReportOutcome {
        let mut outcome = FullReportOutcome::default();

        for update in updates {
            let result = match self.tunnels.get_mut(&update.instance_id) {
                Some(tunnel) => tunnel.apply(update, now),
                None => {
                    let mut tunnel = TunnelState::new(update.instance_id.clone(), now);
                    tunnel.apply(update, now).map(|_| {
                        self.tunnels.insert(update.instance_id.clone(), tunnel);
                        ApplyOutcome::Created
                    })
                }
            };

            match result {
                Ok(ApplyOutcome::Created) => outcome.created += 1,
                Ok(ApplyOutcome::Updated) => outcome.updated += 1,
                Ok(ApplyOutcome::Reset) => outcome.resets += 1,
                Err(_) => outcome.stale.push(update.instance_id.clone()),
            }
        }

        for (id, tunnel) in &mut self.tunnels {
            let reported = updates.iter().any(|u| &u.instance_id == id);
            if !reported && tunnel.status != TunnelStatus::Stopped {
                tunnel.set_status(TunnelStatus::Stopped, now);
                tunnel.last_update_time = now;
                outcome.marked_stopped.push(id.clone());
            }
        }
        outcome.marked_stopped.sort();

        self.last_update_time = now;
        self.refresh_stats();
        outcome
    }

    /// Remove one tunnel on an explicit removal event.
    pub fn remove_tunnel(&mut self, instance_id: &str, now: DateTime<Utc>) -> Option<TunnelState> {
        let removed = self.tunnels.remove(instance_id)?;
        self.last_update_time = now;
        self.refresh_stats();
        Some(removed)
    }

    /// Remove tunnels that have been stopped for longer than `ttl`.
    pub fn purge_stopped(&mut self, now: DateTime<Utc>, ttl: Duration) -> Vec<String> {
        let mut purged: Vec<String> = self
            .tunnels
            .values()
            .filter(|t| t.status == TunnelStatus::Stopped)
            .filter(|t| t.stopped_since.is_some_and(|since| now - since >= ttl))
            .map(|t| t.instance_id.clone())
            .collect();

        if purged.is_empty() {
            return purged;
        }

        for id in &purged {
            self.tunnels.remove(id);
        }
        purged.sort();
        self.refresh_stats();
        purged
    }

    pub fn set_status(&mut self, status: EndpointStatus, connection_status: ConnectionStatus) {
        self.status = status;
        self.connection_status = connection_status;
    }

    /// Record the current aggregate as a trend sample.
    pub fn sample_trend(&mut self, now: DateTime<Utc>) {
        self.trend
            .append_at(TrendSample::new(now, self.stats.traffic), now);
    }

    pub fn trend(&self) -> &TrendBuffer {
        &self.trend
    }

    pub fn trend_mut(&mut self) -> &mut TrendBuffer {
        &mut self.trend
    }

    pub fn tunnel(&self, instance_id: &str) -> Option<&TunnelState> {
        self.tunnels.get(instance_id)
    }

    pub fn snapshot(&self) -> EndpointSnapshot {
        self.snapshot_at(Utc::now())
    }

    pub fn snapshot_at(&self, now: DateTime<Utc>) -> EndpointSnapshot {
        let mut tunnels: Vec<TunnelState> = self.tunnels.values().cloned().collect();
        tunnels.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

        EndpointSnapshot {
            endpoint_id: self.endpoint_id.clone(),
            host: self.host.clone(),
            status: self.status,
            connection_status: self.connection_status,
            stats: self.stats,
            tunnels,
            trend: self.trend.query_at(i64::from(DEFAULT_QUERY_HOURS), now),
            created_at: self.created_at,
            last_update_time: self.last_update_time,
        }
    }

    pub fn summary(&self) -> EndpointSummary {
        EndpointSummary {
            endpoint_id: self.endpoint_id.clone(),
            host: self.host.clone(),
            status: self.status,
            connection_status: self.connection_status,
            stats: self.stats,
            last_update_time: self.last_update_time,
        }
    }

    pub(crate) fn approx_bytes(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.endpoint_id.len()
            + self.host.name.len()
            + self.host.url.len()
            + self
                .tunnels
                .values()
                .map(|t| t.approx_bytes() + t.instance_id.len())
                .sum::<usize>()
            + self.trend.approx_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).expect("valid timestamp")
    }

    fn record() -> EndpointRecord {
        EndpointRecord::new("E1", HostInfo::default(), TrendBuffer::default(), t(0))
    }

    fn assert_stats_match_fold(rec: &EndpointRecord) {
        assert_eq!(rec.stats, EndpointStats::fold(rec.tunnels.values()));
    }

    #[test]
    fn test_stats_follow_updates() {
        let mut rec = record();
        rec.apply_update(&TunnelUpdate::new("T1").with_tcp(100, 0), t(1))
            .expect("apply");
        assert_eq!(rec.stats.traffic.tcp_rx_bytes, 100);

        rec.apply_update(&TunnelUpdate::new("T1").with_tcp(150, 0), t(2))
            .expect("apply");
        assert_eq!(rec.stats.traffic.tcp_rx_bytes, 150);

        let outcome = rec
            .apply_update(&TunnelUpdate::new("T2").with_tcp(50, 5), t(3))
            .expect("apply");
        assert_eq!(outcome, ApplyOutcome::Created);
        assert_eq!(rec.stats.traffic.tcp_rx_bytes, 200);
        assert_eq!(rec.stats.total_tunnels, 2);
        assert_eq!(rec.stats.total_bytes, 205);
        assert_stats_match_fold(&rec);
    }

    #[test]
    fn test_new_instance_accepts_any_event_time() {
        let mut rec = record();
        let update = TunnelUpdate::new("T1").at(DateTime::<Utc>::MIN_UTC);
        // A brand new instance accepts any event time.
        assert!(rec.apply_update(&update, t(1)).is_ok());
        assert_eq!(rec.tunnel_count(), 1);
    }

    #[test]
    fn test_full_report_marks_missing_stopped() {
        let mut rec = record();
        for id in ["T1", "T2", "T3"] {
            rec.apply_update(
                &TunnelUpdate::new(id)
                    .with_status(TunnelStatus::Running)
                    .with_tcp(10, 10),
                t(1),
            )
            .expect("apply");
        }

        let outcome = rec.apply_full_report(
            &[
                TunnelUpdate::new("T1").with_status(TunnelStatus::Running),
                TunnelUpdate::new("T4").with_status(TunnelStatus::Running),
            ],
            t(2),
        );

        assert_eq!(outcome.created, 1);
        assert_eq!(outcome.updated, 1);
        assert_eq!(outcome.marked_stopped, vec!["T2".to_string(), "T3".to_string()]);

        let t2 = rec.tunnel("T2").expect("kept");
        assert_eq!(t2.status, TunnelStatus::Stopped);
        assert_eq!(t2.counters.tcp_rx_bytes, 10);
        assert_eq!(rec.stats.tunnels.stopped, 2);
        assert_eq!(rec.stats.tunnels.running, 2);
        assert_stats_match_fold(&rec);
    }

    #[test]
    fn test_full_report_skips_stale_entries() {
        let mut rec = record();
        rec.apply_update(&TunnelUpdate::new("T1").at(t(10)), t(10))
            .expect("apply");
        let outcome = rec.apply_full_report(&[TunnelUpdate::new("T1").at(t(5))], t(11));
        assert_eq!(outcome.stale, vec!["T1".to_string()]);
        assert!(outcome.marked_stopped.is_empty());
    }

    #[test]
    fn test_purge_stopped_after_ttl() {
        let mut rec = record();
        rec.apply_update(
            &TunnelUpdate::new("T1").with_status(TunnelStatus::Stopped),
            t(0),
        )
        .expect("apply");
        rec.apply_update(
            &TunnelUpdate::new("T2").with_status(TunnelStatus::Running),
            t(0),
        )
        .expect("apply");

        assert!(rec.purge_stopped(t(30), Duration::seconds(60)).is_empty());
        assert_eq!(
            rec.purge_stopped(t(61), Duration::seconds(60)),
            vec!["T1".to_string()]
        );
        assert_eq!(rec.tunnel_count(), 1);
        assert_stats_match_fold(&rec);
    }

    #[test]
    fn test_remove_tunnel_refreshes_stats() {
        let mut rec = record();
        rec.apply_update(&TunnelUpdate::new("T1").with_tcp(5, 5), t(1))
            .expect("apply");
        assert!(rec.remove_tunnel("T1", t(2)).is_some());
        assert!(rec.remove_tunnel("T1", t(3)).is_none());
        assert_eq!(rec.stats, EndpointStats::default());
    }

    #[test]
    fn test_sample_trend_uses_cached_aggregate() {
        let mut rec = record();
        rec.apply_update(&TunnelUpdate::new("T1").with_udp(3, 4), t(1))
            .expect("apply");
        rec.sample_trend(t(60));

        let latest = rec.trend().latest().expect("sample");
        assert_eq!(latest.timestamp, t(60));
        assert_eq!(latest.traffic.udp_tx_bytes, 4);
    }

    #[test]
    fn test_snapshot_sorted_and_summarised() {
        let mut rec = record();
        for id in ["b", "a", "c"] {
            rec.apply_update(&TunnelUpdate::new(id), t(1)).expect("apply");
        }
        let snap = rec.snapshot_at(t(2));
        let ids: Vec<_> = snap.tunnels.iter().map(|t| t.instance_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(snap.summary(), rec.summary());
        assert!(snap.tunnel("c").is_some());
    }
}
