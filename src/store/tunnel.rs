use std::ops::AddAssign;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::StoreError;

/// Role of a tunnel instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceType {
    #[default]
    Client,
    Server,
}

impl InstanceType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Server => "server",
        }
    }
}

/// Reported run state of a tunnel instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelStatus {
    Running,
    Stopped,
    Error,
    #[default]
    Unknown,
}

impl TunnelStatus {
    pub const ALL: [TunnelStatus; 4] = [Self::Running, Self::Stopped, Self::Error, Self::Unknown];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }
}

/// TCP/UDP byte counters of one tunnel, or a sum over several.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Counters {
    pub tcp_rx_bytes: u64,
    pub tcp_tx_bytes: u64,
    pub udp_rx_bytes: u64,
    pub udp_tx_bytes: u64,
}

impl Counters {
    /// Sum of all four counters.
    pub fn total(&self) -> u64 {
        self.tcp_rx_bytes
            .saturating_add(self.tcp_tx_bytes)
            .saturating_add(self.udp_rx_bytes)
            .saturating_add(self.udp_tx_bytes)
    }

    /// Received bytes over TCP and UDP.
    pub fn rx(&self) -> u64 {
        self.tcp_rx_bytes.saturating_add(self.udp_rx_bytes)
    }

    /// Transmitted bytes over TCP and UDP.
    pub fn tx(&self) -> u64 {
        self.tcp_tx_bytes.saturating_add(self.udp_tx_bytes)
    }

    /// Returns true if any counter in `self` is lower than in `previous`.
    pub fn decreased_from(&self, previous: &Counters) -> bool {
        self.tcp_rx_bytes < previous.tcp_rx_bytes
            || self.tcp_tx_bytes < previous.tcp_tx_bytes
            || self.udp_rx_bytes < previous.udp_rx_bytes
            || self.udp_tx_bytes < previous.udp_tx_bytes
    }
}

impl AddAssign for Counters {
    fn add_assign(&mut self, rhs: Self) {
        self.tcp_rx_bytes = self.tcp_rx_bytes.saturating_add(rhs.tcp_rx_bytes);
        self.tcp_tx_bytes = self.tcp_tx_bytes.saturating_add(rhs.tcp_tx_bytes);
        self.udp_rx_bytes = self.udp_rx_bytes.saturating_add(rhs.udp_rx_bytes);
        self.udp_tx_bytes = self.udp_tx_bytes.saturating_add(rhs.udp_tx_bytes);
    }
}

/// A single status report for one tunnel instance.
///
/// Absent fields keep their previous value. Counters are absolute values
/// reported by the endpoint and replace the stored ones.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelUpdate {
    pub instance_id: String,
    #[serde(default)]
    pub instance_type: Option<InstanceType>,
    #[serde(default)]
    pub status: Option<TunnelStatus>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub restart_policy: Option<bool>,
    #[serde(default)]
    pub tcp_rx_bytes: Option<u64>,
    #[serde(default)]
    pub tcp_tx_bytes: Option<u64>,
    #[serde(default)]
    pub udp_rx_bytes: Option<u64>,
    #[serde(default)]
    pub udp_tx_bytes: Option<u64>,
    #[serde(default)]
    pub pool_size: Option<i64>,
    #[serde(default)]
    pub ping_millis: Option<i64>,
    /// When the endpoint observed this state. Defaults to the ingestion time.
    #[serde(default)]
    pub event_time: Option<DateTime<Utc>>,
    /// Explicit reconnect marker: counters restart from the reported values.
    #[serde(default)]
    pub reset: bool,
}

impl TunnelUpdate {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: TunnelStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_tcp(mut self, rx: u64, tx: u64) -> Self {
        self.tcp_rx_bytes = Some(rx);
        self.tcp_tx_bytes = Some(tx);
        self
    }

    pub fn with_udp(mut self, rx: u64, tx: u64) -> Self {
        self.udp_rx_bytes = Some(rx);
        self.udp_tx_bytes = Some(tx);
        self
    }

    pub fn at(mut self, event_time: DateTime<Utc>) -> Self {
        self.event_time = Some(event_time);
        self
    }

    /// Counters after overlaying this update on `current`.
    fn counters_over(&self, current: &Counters) -> Counters {
        Counters {
            tcp_rx_bytes: self.tcp_rx_bytes.unwrap_or(current.tcp_rx_bytes),
            tcp_tx_bytes: self.tcp_tx_bytes.unwrap_or(current.tcp_tx_bytes),
            udp_rx_bytes: self.udp_rx_bytes.unwrap_or(current.udp_rx_bytes),
            udp_tx_bytes: self.udp_tx_bytes.unwrap_or(current.udp_tx_bytes),
        }
    }
}

/// What a successful tunnel update did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOutcome {
    /// First report for this instance.
    Created,
    /// Existing instance updated in place.
    Updated,
    /// Counters restarted (explicit reset flag or a decrease).
    Reset,
}

/// Latest known state of one tunnel instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelState {
    pub instance_id: String,
    pub instance_type: InstanceType,
    pub status: TunnelStatus,
    pub url: String,
    pub alias: String,
    pub restart_policy: bool,
    #[serde(flatten)]
    pub counters: Counters,
    pub pool_size: i64,
    /// Round-trip latency in milliseconds, -1 when unknown.
    pub ping_millis: i64,
    pub last_update_time: DateTime<Utc>,
    pub last_event_time: DateTime<Utc>,
    /// Number of counter resets seen for this instance.
    pub resets: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_since: Option<DateTime<Utc>>,
}

impl TunnelState {
    pub fn new(instance_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            instance_id: instance_id.into(),
            instance_type: InstanceType::default(),
            status: TunnelStatus::Unknown,
            url: String::new(),
            alias: String::new(),
            restart_policy: false,
            counters: Counters::default(),
            pool_size: 0,
            ping_millis: -1,
            last_update_time: now,
            last_event_time: DateTime::<Utc>::MIN_UTC,
            resets: 0,
            stopped_since: None,
        }
    }

    /// Apply an update in place.
    ///
    /// An event older than the last applied one is rejected without touching
    /// any field. A decrease in any counter (or `update.reset`) is a reset:
    /// the reported values become the new baseline.
    pub fn apply(
        &mut self,
        update: &TunnelUpdate,
        now: DateTime<Utc>,
    ) -> Result<ApplyOutcome, StoreError> {
        let event_time = update.event_time.unwrap_or(now);
        if event_time < self.last_event_time {
            return Err(StoreError::StaleUpdate {
                instance_id: self.instance_id.clone(),
                event_time,
                last_event_time: self.last_event_time,
            });
        }

        let reported = update.counters_over(&self.counters);
        let reset = update.reset || reported.decreased_from(&self.counters);
        self.counters = reported;

        if let Some(instance_type) = update.instance_type {
            self.instance_type = instance_type;
        }
        if let Some(url) = &update.url {
            self.url.clone_from(url);
        }
        if let Some(alias) = &update.alias {
            self.alias.clone_from(alias);
        }
        if let Some(restart_policy) = update.restart_policy {
            self.restart_policy = restart_policy;
        }
        if let Some(pool_size) = update.pool_size {
            self.pool_size = pool_size;
        }
        if let Some(ping) = update.ping_millis {
            self.ping_millis = ping.max(-1);
        }
        if let Some(status) = update.status {
            self.set_status(status, now);
        }

        self.last_update_time = now;
        self.last_event_time = event_time;

        if reset {
            self.resets = self.resets.saturating_add(1);
            Ok(ApplyOutcome::Reset)
        } else {
            Ok(ApplyOutcome::Updated)
        }
    }

    /// Set the status, tracking when the instance entered `stopped`.
    pub fn set_status(&mut self, status: TunnelStatus, now: DateTime<Utc>) {
        match status {
            TunnelStatus::Stopped => {
                if self.stopped_since.is_none() {
                    self.stopped_since = Some(now);
                }
            }
            _ => self.stopped_since = None,
        }
        self.status = status;
    }

    /// Approximate heap + inline size, used for footprint reporting.
    pub(crate) fn approx_bytes(&self) -> usize {
        std::mem::size_of::<Self>() + self.instance_id.len() + self.url.len() + self.alias.len()
    }
}
