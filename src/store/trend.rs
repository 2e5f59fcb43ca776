//! Bounded per-endpoint traffic time series.
//!
//! Samples are kept sorted by timestamp. Age is measured in whole elapsed
//! hours, so a sample belongs to an `h`-hour window while
//! `floor((now - timestamp) / 1h) <= h`.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::tunnel::Counters;

/// Longest window a trend query or buffer may cover.
pub const MAX_RETENTION_HOURS: u32 = 168;

/// Window used when a caller does not ask for one.
pub const DEFAULT_QUERY_HOURS: u32 = 24;

/// Aggregate traffic of one endpoint at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendSample {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub traffic: Counters,
}

impl TrendSample {
    pub fn new(timestamp: DateTime<Utc>, traffic: Counters) -> Self {
        Self { timestamp, traffic }
    }
}

/// Clamp a requested window to `[1, 168]` hours.
pub fn clamp_hours(hours: i64) -> u32 {
    hours.clamp(1, i64::from(MAX_RETENTION_HOURS)) as u32
}

fn age_hours(now: DateTime<Utc>, ts: DateTime<Utc>) -> i64 {
    (now - ts).num_hours()
}

/// Time-ordered sample buffer with lazy eviction.
#[derive(Debug, Clone)]
pub struct TrendBuffer {
    samples: VecDeque<TrendSample>,
    retention_hours: u32,
    /// Hard cap on stored samples; 0 disables the cap.
    max_samples: usize,
}

impl TrendBuffer {
    pub fn new(retention_hours: u32, max_samples: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            retention_hours: retention_hours.clamp(1, MAX_RETENTION_HOURS),
            max_samples,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn latest(&self) -> Option<&TrendSample> {
        self.samples.back()
    }

    /// Append a sample, evicting relative to the wall clock.
    pub fn append(&mut self, sample: TrendSample) {
        self.append_at(sample, Utc::now());
    }

    /// Append a sample and evict everything outside retention as of `now`.
    ///
    /// In-order samples go to the tail. A late sample is inserted at its
    /// sorted position so queries can keep returning a contiguous suffix.
    pub fn append_at(&mut self, sample: TrendSample, now: DateTime<Utc>) {
        let at = self
            .samples
            .partition_point(|s| s.timestamp <= sample.timestamp);
        if at == self.samples.len() {
            self.samples.push_back(sample);
        } else {
            self.samples.insert(at, sample);
        }

        self.evict_at(now);
    }

    /// Drop expired samples and enforce the capacity cap. Returns the number evicted.
    pub fn evict_at(&mut self, now: DateTime<Utc>) -> usize {
        let retention = i64::from(self.retention_hours);
        let expired = self
            .samples
            .partition_point(|s| age_hours(now, s.timestamp) > retention);
        self.samples.drain(..expired);

        let mut evicted = expired;
        if self.max_samples > 0 && self.samples.len() > self.max_samples {
            let excess = self.samples.len() - self.max_samples;
            self.samples.drain(..excess);
            evicted += excess;
        }

        evicted
    }

    /// Samples within the last `hours` hours as of the wall clock.
    pub fn query(&self, hours: i64) -> Vec<TrendSample> {
        self.query_at(hours, Utc::now())
    }

    /// Samples within the last `hours` hours (clamped to 1..=168) as of `now`.
    ///
    /// Age is counted in whole elapsed hours, so a sample is kept while its
    /// age is below `hours + 1` hours: `query_at(1, ..)` still returns a
    /// sample 119 minutes old but not one 120 minutes old.
    ///
    /// Returns a contiguous, ascending suffix. Samples past retention that
    /// have not been physically evicted yet are never returned.
    pub fn query_at(&self, hours: i64, now: DateTime<Utc>) -> Vec<TrendSample> {
        let window = i64::from(clamp_hours(hours).min(self.retention_hours));
        let start = self
            .samples
            .partition_point(|s| age_hours(now, s.timestamp) > window);
        self.samples.range(start..).copied().collect()
    }

    pub(crate) fn approx_bytes(&self) -> usize {
        self.samples.capacity() * std::mem::size_of::<TrendSample>()
    }
}

impl Default for TrendBuffer {
    fn default() -> Self {
        Self::new(MAX_RETENTION_HOURS, 0)
    }
}
