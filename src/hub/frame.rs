use serde::Serialize;

use crate::dashboard::DashboardRollup;
use crate::store::{EndpointSnapshot, EndpointSummary, TunnelView};

/// Kind of a long-lived consumer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    /// Periodic dashboard rollup over SSE.
    DashboardStream,
    /// Periodic single-tunnel frames over SSE.
    TunnelStream,
    /// Periodic endpoint detail over a WebSocket.
    SystemMonitor,
    /// Periodic single-tunnel frames over a WebSocket.
    TunnelMonitor,
}

impl SessionKind {
    pub const ALL: [SessionKind; 4] = [
        Self::DashboardStream,
        Self::TunnelStream,
        Self::SystemMonitor,
        Self::TunnelMonitor,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DashboardStream => "dashboard_stream",
            Self::TunnelStream => "tunnel_stream",
            Self::SystemMonitor => "system_monitor",
            Self::TunnelMonitor => "tunnel_monitor",
        }
    }
}

/// One message pushed to a streaming consumer, tagged by `type`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum StreamFrame {
    /// Acknowledgement sent as soon as a session opens.
    Connected {
        session_id: u64,
        kind: SessionKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        /// Current state of the watched tunnel, when it is already known.
        #[serde(skip_serializing_if = "Option::is_none")]
        tunnel: Option<TunnelView>,
        timestamp: i64,
    },
    Dashboard {
        rollup: DashboardRollup,
        endpoints: Vec<EndpointSummary>,
        timestamp: i64,
    },
    Tunnel {
        tunnel: TunnelView,
        timestamp: i64,
    },
    TunnelNotFound {
        instance_id: String,
        message: String,
        timestamp: i64,
    },
    Endpoint {
        endpoint: Box<EndpointSnapshot>,
        timestamp: i64,
    },
    EndpointNotFound {
        endpoint_id: String,
        message: String,
        timestamp: i64,
    },
}

impl StreamFrame {
    pub fn tunnel_or_not_found(instance_id: &str, found: Option<TunnelView>, timestamp: i64) -> Self {
        match found {
            Some(tunnel) => Self::Tunnel { tunnel, timestamp },
            None => Self::TunnelNotFound {
                instance_id: instance_id.to_string(),
                message: format!("tunnel {instance_id} not found"),
                timestamp,
            },
        }
    }

    pub fn endpoint_or_not_found(
        endpoint_id: &str,
        found: Option<EndpointSnapshot>,
        timestamp: i64,
    ) -> Self {
        match found {
            Some(endpoint) => Self::Endpoint {
                endpoint: Box::new(endpoint),
                timestamp,
            },
            None => Self::EndpointNotFound {
                endpoint_id: endpoint_id.to_string(),
                message: format!("endpoint {endpoint_id} not found"),
                timestamp,
            },
        }
    }
}
