use chrono::{DateTime, Utc};
use thiserror::Error;

/// Maximum accepted length for endpoint and instance identifiers.
pub const MAX_ID_LEN: usize = 128;

/// Errors raised by store mutations.
///
/// Lookups never fail: an unknown endpoint or instance is reported as `None`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("invalid {kind} id {id:?}: {reason}")]
    InvalidId {
        kind: &'static str,
        id: String,
        reason: &'static str,
    },

    #[error(
        "stale update for instance {instance_id}: event at {event_time} precedes last event at {last_event_time}"
    )]
    StaleUpdate {
        instance_id: String,
        event_time: DateTime<Utc>,
        last_event_time: DateTime<Utc>,
    },
}

impl StoreError {
    /// Returns true for errors caused by malformed caller input.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::InvalidId { .. })
    }
}

/// Validate an endpoint or instance identifier.
///
/// Accepts 1..=128 characters from `[A-Za-z0-9_.:-]`.
pub fn validate_id(kind: &'static str, id: &str) -> Result<(), StoreError> {
    let invalid = |reason| StoreError::InvalidId {
        kind,
        id: id.to_string(),
        reason,
    };

    if id.is_empty() {
        return Err(invalid("must not be empty"));
    }

    if id.len() > MAX_ID_LEN {
        return Err(invalid("longer than 128 characters"));
    }

    if !id
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.' | b':'))
    {
        return Err(invalid("contains unsupported characters"));
    }

    Ok(())
}
