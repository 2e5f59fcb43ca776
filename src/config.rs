use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::store::{TrendSettings, MAX_RETENTION_HOURS};

/// Top-level configuration for the tunnelboard service.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Push stream cadence and buffering.
    #[serde(default)]
    pub streaming: StreamingConfig,

    /// Per-endpoint trend series configuration.
    #[serde(default)]
    pub trend: TrendConfig,

    /// Background cleanup configuration.
    #[serde(default)]
    pub retention: RetentionConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen address; ":port" binds all interfaces. Default: ":8080".
    #[serde(default = "default_server_addr")]
    pub addr: String,
}

/// Push stream configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamingConfig {
    /// Dashboard stream tick. Default: 2s.
    #[serde(default = "default_dashboard_interval", with = "humantime_serde")]
    pub dashboard_interval: Duration,

    /// Tunnel stream tick. Default: 1s.
    #[serde(default = "default_tunnel_interval", with = "humantime_serde")]
    pub tunnel_interval: Duration,

    /// System and tunnel monitor tick. Default: 2s.
    #[serde(default = "default_monitor_interval", with = "humantime_serde")]
    pub monitor_interval: Duration,

    /// Frames buffered per session before a tick blocks on the consumer. Default: 16.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// SSE keep-alive comment interval. Default: 15s.
    #[serde(default = "default_keep_alive", with = "humantime_serde")]
    pub keep_alive: Duration,
}

/// Trend series configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TrendConfig {
    /// How long samples are kept. Must be within 1h..=168h. Default: 168h.
    #[serde(default = "default_trend_retention", with = "humantime_serde")]
    pub retention: Duration,

    /// Hard cap on samples per endpoint; 0 disables. Default: 10080.
    #[serde(default = "default_trend_max_samples")]
    pub max_samples: usize,

    /// How often every endpoint's aggregate is sampled. Default: 1m.
    #[serde(default = "default_trend_sample_interval", with = "humantime_serde")]
    pub sample_interval: Duration,
}

/// Background cleanup configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// Stopped tunnels are purged after this long; 0s disables purging. Default: 168h.
    #[serde(default = "default_stopped_tunnel_ttl", with = "humantime_serde")]
    pub stopped_tunnel_ttl: Duration,

    /// Eviction, purge and metrics refresh cadence. Default: 1m.
    #[serde(default = "default_maintenance_interval", with = "humantime_serde")]
    pub maintenance_interval: Duration,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_server_addr() -> String {
    ":8080".to_string()
}

fn default_dashboard_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_tunnel_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_monitor_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_channel_capacity() -> usize {
    16
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(15)
}

fn default_trend_retention() -> Duration {
    Duration::from_secs(u64::from(MAX_RETENTION_HOURS) * 60 * 60)
}

fn default_trend_max_samples() -> usize {
    10_080 // one week at one sample per minute
}

fn default_trend_sample_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_stopped_tunnel_ttl() -> Duration {
    Duration::from_secs(u64::from(MAX_RETENTION_HOURS) * 60 * 60)
}

fn default_maintenance_interval() -> Duration {
    Duration::from_secs(60)
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            server: ServerConfig::default(),
            streaming: StreamingConfig::default(),
            trend: TrendConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_server_addr(),
        }
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            dashboard_interval: default_dashboard_interval(),
            tunnel_interval: default_tunnel_interval(),
            monitor_interval: default_monitor_interval(),
            channel_capacity: default_channel_capacity(),
            keep_alive: default_keep_alive(),
        }
    }
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            retention: default_trend_retention(),
            max_samples: default_trend_max_samples(),
            sample_interval: default_trend_sample_interval(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            stopped_tunnel_ttl: default_stopped_tunnel_ttl(),
            maintenance_interval: default_maintenance_interval(),
        }
    }
}

impl ServerConfig {
    /// Socket address to bind, expanding the ":port" shorthand.
    pub fn bind_addr(&self) -> String {
        if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
        }
    }
}

impl TrendConfig {
    /// Whole retention hours, as used by the trend buffers.
    pub fn retention_hours(&self) -> u32 {
        (self.retention.as_secs() / 3600) as u32
    }

    pub fn settings(&self) -> TrendSettings {
        TrendSettings {
            retention_hours: self.retention_hours(),
            max_samples: self.max_samples,
        }
    }
}

impl RetentionConfig {
    /// Purge TTL, or `None` when purging is disabled.
    pub fn stopped_tunnel_ttl(&self) -> Option<chrono::Duration> {
        if self.stopped_tunnel_ttl.is_zero() {
            return None;
        }
        chrono::Duration::from_std(self.stopped_tunnel_ttl).ok()
    }
}

impl Config {
    /// Loads and validates configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validates the configuration, returning an error for invalid values.
    pub fn validate(&self) -> Result<()> {
        if self.server.addr.is_empty() {
            bail!("server.addr is required");
        }

        let streaming = &self.streaming;
        if streaming.dashboard_interval.is_zero() {
            bail!("streaming.dashboard_interval must be positive");
        }

        if streaming.tunnel_interval.is_zero() {
            bail!("streaming.tunnel_interval must be positive");
        }

        if streaming.monitor_interval.is_zero() {
            bail!("streaming.monitor_interval must be positive");
        }

        if streaming.channel_capacity == 0 {
            bail!("streaming.channel_capacity must be positive");
        }

        if streaming.keep_alive.is_zero() {
            bail!("streaming.keep_alive must be positive");
        }

        let hours = self.trend.retention.as_secs() / 3600;
        if self.trend.retention.as_secs() % 3600 != 0 {
            bail!("trend.retention must be a whole number of hours");
        }

        if !(1..=u64::from(MAX_RETENTION_HOURS)).contains(&hours) {
            bail!("trend.retention must be between 1h and {MAX_RETENTION_HOURS}h");
        }

        if self.trend.sample_interval.is_zero() {
            bail!("trend.sample_interval must be positive");
        }

        if self.retention.maintenance_interval.is_zero() {
            bail!("retention.maintenance_interval must be positive");
        }

        Ok(())
    }
}
