//! In-memory telemetry store.
//!
//! Two lock levels: the registry's shape lock guards which endpoints exist,
//! and every [`EndpointRecord`] carries its own reader/writer lock. Lock
//! order is always shape then record, and only `remove_endpoint` holds both.
//! Callers only ever receive copies.

pub mod error;
pub mod ingest_stats;
pub mod record;
pub mod trend;
pub mod tunnel;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

pub use error::{validate_id, StoreError};
pub use ingest_stats::{IngestOutcome, IngestStats};
pub use record::{
    ConnectionStatus, EndpointRecord, EndpointSnapshot, EndpointStats, EndpointStatus,
    EndpointSummary, FullReportOutcome, HostInfo, StatusCounts, TypeCounts,
};
pub use trend::{clamp_hours, TrendBuffer, TrendSample, DEFAULT_QUERY_HOURS, MAX_RETENTION_HOURS};
pub use tunnel::{ApplyOutcome, Counters, InstanceType, TunnelState, TunnelStatus, TunnelUpdate};

type SharedRecord = Arc<RwLock<EndpointRecord>>;

/// Trend buffer settings applied to every new record.
#[derive(Debug, Clone, Copy)]
pub struct TrendSettings {
    pub retention_hours: u32,
    pub max_samples: usize,
}

impl Default for TrendSettings {
    fn default() -> Self {
        Self {
            retention_hours: MAX_RETENTION_HOURS,
            max_samples: 0,
        }
    }
}

/// A copied tunnel together with the endpoint that owns it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelView {
    pub endpoint_id: String,
    pub endpoint_name: String,
    #[serde(flatten)]
    pub tunnel: TunnelState,
}

/// Point-in-time sizes of the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryCounts {
    pub endpoints: usize,
    pub tunnels: StatusCounts,
    pub trend_samples: usize,
    pub index_entries: usize,
    pub approx_bytes: usize,
}

/// Owner of every endpoint record.
pub struct EndpointRegistry {
    records: RwLock<HashMap<String, SharedRecord>>,
    /// instance id -> ids of the endpoints currently holding that instance.
    instance_index: DashMap<String, BTreeSet<String>>,
    trend: TrendSettings,
    stats: IngestStats,
}

impl EndpointRegistry {
    pub fn new(trend: TrendSettings) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            instance_index: DashMap::new(),
            trend,
            stats: IngestStats::new(),
        }
    }

    pub fn ingest_stats(&self) -> &IngestStats {
        &self.stats
    }

    fn lookup(&self, endpoint_id: &str) -> Option<SharedRecord> {
        self.records.read().get(endpoint_id).cloned()
    }

    fn new_record(&self, endpoint_id: &str, host: HostInfo, now: DateTime<Utc>) -> EndpointRecord {
        let mut record = EndpointRecord::new(
            endpoint_id,
            host,
            TrendBuffer::new(self.trend.retention_hours, self.trend.max_samples),
            now,
        );
        record.set_status(EndpointStatus::Online, ConnectionStatus::Connected);
        record
    }

    /// Returns the record for `endpoint_id`, creating it if needed.
    fn get_or_create(&self, endpoint_id: &str, now: DateTime<Utc>) -> (SharedRecord, bool) {
        if let Some(record) = self.lookup(endpoint_id) {
            return (record, false);
        }

        let mut records = self.records.write();
        if let Some(record) = records.get(endpoint_id) {
            return (Arc::clone(record), false);
        }

        let record = Arc::new(RwLock::new(self.new_record(
            endpoint_id,
            HostInfo::default(),
            now,
        )));
        records.insert(endpoint_id.to_string(), Arc::clone(&record));
        debug!(endpoint_id, "created endpoint record");
        (record, true)
    }

    fn index_insert(&self, instance_id: &str, endpoint_id: &str) {
        self.instance_index
            .entry(instance_id.to_string())
            .or_default()
            .insert(endpoint_id.to_string());
    }

    fn index_remove(&self, instance_id: &str, endpoint_id: &str) {
        if let Some(mut owners) = self.instance_index.get_mut(instance_id) {
            owners.remove(endpoint_id);
        }
        self.instance_index
            .remove_if(instance_id, |_, owners| owners.is_empty());
    }

    /// Register an endpoint or refresh its host info. Returns true if created.
    pub fn upsert_endpoint(&self, endpoint_id: &str, host: HostInfo) -> Result<bool, StoreError> {
        validate_id("endpoint", endpoint_id)?;
        let now = Utc::now();

        let (record, created) = self.get_or_create(endpoint_id, now);
        let mut guard = record.write();
        guard.host = host;
        guard.last_update_time = now;

        if created {
            info!(endpoint_id, host = %guard.host.name, "registered endpoint");
        }
        Ok(created)
    }

    /// Deregister an endpoint, dropping its tunnels and trend. Returns false if unknown.
    pub fn remove_endpoint(&self, endpoint_id: &str) -> bool {
        let mut records = self.records.write();
        let Some(record) = records.remove(endpoint_id) else {
            return false;
        };

        let mut guard = record.write();
        guard.removed = true;
        for instance_id in guard.tunnels.keys() {
            self.index_remove(instance_id, endpoint_id);
        }
        self.stats
            .record_n(IngestOutcome::Removed, guard.tunnels.len() as u64);

        info!(endpoint_id, tunnels = guard.tunnels.len(), "removed endpoint");
        true
    }

    /// Apply one tunnel update, creating the endpoint record if needed.
    pub fn apply_tunnel_update(
        &self,
        endpoint_id: &str,
        update: &TunnelUpdate,
    ) -> Result<ApplyOutcome, StoreError> {
        self.apply_tunnel_update_at(endpoint_id, update, Utc::now())
    }

    pub fn apply_tunnel_update_at(
        &self,
        endpoint_id: &str,
        update: &TunnelUpdate,
        now: DateTime<Utc>,
    ) -> Result<ApplyOutcome, StoreError> {
        if let Err(e) = validate_id("endpoint", endpoint_id)
            .and_then(|()| validate_id("instance", &update.instance_id))
        {
            self.stats.record(IngestOutcome::Rejected);
            return Err(e);
        }

        loop {
            let (record, _) = self.get_or_create(endpoint_id, now);
            let mut guard = record.write();
            if guard.removed {
                // Deregistered between lookup and lock; start over on a fresh record.
                continue;
            }

            let result = guard.apply_update(update, now);
            match &result {
                Ok(ApplyOutcome::Created) => {
                    self.index_insert(&update.instance_id, endpoint_id);
                    self.stats.record(IngestOutcome::Created);
                }
                Ok(ApplyOutcome::Updated) => self.stats.record(IngestOutcome::Updated),
                Ok(ApplyOutcome::Reset) => {
                    self.stats.record(IngestOutcome::Reset);
                    debug!(
                        endpoint_id,
                        instance_id = %update.instance_id,
                        "counter reset"
                    );
                }
                Err(e) => {
                    self.stats.record(IngestOutcome::Stale);
                    debug!(endpoint_id, error = %e, "dropped stale update");
                }
            }
            return result;
        }
    }

    /// Apply a complete listing of an endpoint's tunnels under one write lock.
    pub fn apply_full_report(
        &self,
        endpoint_id: &str,
        updates: &[TunnelUpdate],
    ) -> Result<FullReportOutcome, StoreError> {
        self.apply_full_report_at(endpoint_id, updates, Utc::now())
    }

    pub fn apply_full_report_at(
        &self,
        endpoint_id: &str,
        updates: &[TunnelUpdate],
        now: DateTime<Utc>,
    ) -> Result<FullReportOutcome, StoreError> {
        let valid = validate_id("endpoint", endpoint_id).and_then(|()| {
            updates
                .iter()
                .try_for_each(|u| validate_id("instance", &u.instance_id))
        });
        if let Err(e) = valid {
            self.stats.record(IngestOutcome::Rejected);
            return Err(e);
        }

        loop {
            let (record, _) = self.get_or_create(endpoint_id, now);
            let mut guard = record.write();
            if guard.removed {
                continue;
            }

            let known: Vec<bool> = updates
                .iter()
                .map(|u| guard.tunnels.contains_key(&u.instance_id))
                .collect();
            let outcome = guard.apply_full_report(updates, now);

            for (update, was_known) in updates.iter().zip(known) {
                if !was_known && guard.tunnels.contains_key(&update.instance_id) {
                    self.index_insert(&update.instance_id, endpoint_id);
                }
            }

            self.stats
                .record_n(IngestOutcome::Created, outcome.created as u64);
            self.stats
                .record_n(IngestOutcome::Updated, outcome.updated as u64);
            self.stats
                .record_n(IngestOutcome::Reset, outcome.resets as u64);
            self.stats
                .record_n(IngestOutcome::Stale, outcome.stale.len() as u64);
            self.stats.record_n(
                IngestOutcome::MarkedStopped,
                outcome.marked_stopped.len() as u64,
            );

            debug!(
                endpoint_id,
                reported = updates.len(),
                marked_stopped = outcome.marked_stopped.len(),
                "applied full report"
            );
            return Ok(outcome);
        }
    }

    /// Remove one tunnel on an explicit removal event. Returns false if unknown.
    pub fn remove_tunnel(&self, endpoint_id: &str, instance_id: &str) -> bool {
        let Some(record) = self.lookup(endpoint_id) else {
            return false;
        };

        let mut guard = record.write();
        if guard.removed || guard.remove_tunnel(instance_id, Utc::now()).is_none() {
            return false;
        }
        self.index_remove(instance_id, endpoint_id);
        self.stats.record(IngestOutcome::Removed);
        true
    }

    /// Set endpoint and link status. Returns false if the endpoint is unknown.
    pub fn set_endpoint_status(
        &self,
        endpoint_id: &str,
        status: EndpointStatus,
        connection_status: ConnectionStatus,
    ) -> bool {
        let Some(record) = self.lookup(endpoint_id) else {
            return false;
        };
        let mut guard = record.write();
        guard.set_status(status, connection_status);
        guard.last_update_time = Utc::now();
        true
    }

    pub fn get(&self, endpoint_id: &str) -> Option<EndpointSnapshot> {
        let record = self.lookup(endpoint_id)?;
        let snapshot = record.read().snapshot();
        Some(snapshot)
    }

    /// Snapshots of every endpoint, ordered by id.
    pub fn get_all(&self) -> Vec<EndpointSnapshot> {
        let now = Utc::now();
        self.all_records()
            .iter()
            .map(|record| record.read().snapshot_at(now))
            .collect()
    }

    /// Summaries of every endpoint, ordered by id.
    pub fn summaries(&self) -> Vec<EndpointSummary> {
        self.all_records()
            .iter()
            .map(|record| record.read().summary())
            .collect()
    }

    fn all_records(&self) -> Vec<SharedRecord> {
        let records = self.records.read();
        let mut ids: Vec<&String> = records.keys().collect();
        ids.sort();
        ids.into_iter()
            .filter_map(|id| records.get(id).cloned())
            .collect()
    }

    /// Whether an endpoint record exists. Takes only the shape lock.
    pub fn contains(&self, endpoint_id: &str) -> bool {
        self.records.read().contains_key(endpoint_id)
    }

    pub fn tunnel(&self, endpoint_id: &str, instance_id: &str) -> Option<TunnelView> {
        let record = self.lookup(endpoint_id)?;
        let guard = record.read();
        let tunnel = guard.tunnel(instance_id)?.clone();
        Some(TunnelView {
            endpoint_id: guard.endpoint_id.clone(),
            endpoint_name: guard.host.name.clone(),
            tunnel,
        })
    }

    /// Locate a tunnel by instance id alone.
    ///
    /// When several endpoints report the same instance id, the lowest
    /// endpoint id wins.
    pub fn find_tunnel(&self, instance_id: &str) -> Option<TunnelView> {
        let owners: Vec<String> = self
            .instance_index
            .get(instance_id)
            .map(|owners| owners.iter().cloned().collect())?;

        owners
            .iter()
            .find_map(|endpoint_id| self.tunnel(endpoint_id, instance_id))
    }

    pub fn trend(&self, endpoint_id: &str, hours: i64) -> Option<Vec<TrendSample>> {
        let record = self.lookup(endpoint_id)?;
        let samples = record.read().trend().query(hours);
        Some(samples)
    }

    /// Append an externally produced sample. Returns false if the endpoint is unknown.
    pub fn append_trend_sample(&self, endpoint_id: &str, sample: TrendSample) -> bool {
        let Some(record) = self.lookup(endpoint_id) else {
            return false;
        };
        record.write().trend_mut().append(sample);
        true
    }

    /// Record the current aggregate of every endpoint as a trend sample.
    pub fn sample_trends(&self, now: DateTime<Utc>) -> usize {
        let records = self.all_records();
        for record in &records {
            record.write().sample_trend(now);
        }
        records.len()
    }

    /// Evict trend samples outside retention on every record.
    pub fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        self.all_records()
            .iter()
            .map(|record| record.write().trend_mut().evict_at(now))
            .sum()
    }

    /// Drop tunnels stopped for at least `ttl`. Returns how many were purged.
    pub fn purge_stopped_tunnels(&self, now: DateTime<Utc>, ttl: Duration) -> usize {
        let mut purged = 0;
        for record in self.all_records() {
            let mut guard = record.write();
            if guard.removed {
                continue;
            }
            let ids = guard.purge_stopped(now, ttl);
            for instance_id in &ids {
                self.index_remove(instance_id, &guard.endpoint_id);
            }
            if !ids.is_empty() {
                debug!(
                    endpoint_id = %guard.endpoint_id,
                    purged = ids.len(),
                    "purged stopped tunnels"
                );
            }
            purged += ids.len();
        }
        self.stats.record_n(IngestOutcome::Removed, purged as u64);
        purged
    }

    pub fn counts(&self) -> RegistryCounts {
        let records = self.all_records();
        let mut counts = RegistryCounts {
            endpoints: records.len(),
            index_entries: self.instance_index.len(),
            ..Default::default()
        };

        for record in &records {
            let guard = record.read();
            counts.tunnels.merge(&guard.stats().tunnels);
            counts.trend_samples += guard.trend_len();
            counts.approx_bytes += guard.approx_bytes();
        }

        counts
    }
}

impl Default for EndpointRegistry {
    fn default() -> Self {
        Self::new(TrendSettings::default())
    }
}
