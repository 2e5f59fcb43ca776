//! Fleet-wide rollup over endpoint summaries.

use serde::Serialize;

use crate::store::{Counters, EndpointStatus, EndpointSummary, StatusCounts, TypeCounts};

/// Endpoint counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointCounts {
    pub total: usize,
    pub online: usize,
    pub offline: usize,
    pub error: usize,
}

/// Tunnel counts by status, with the overall total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelCounts {
    pub total: usize,
    #[serde(flatten)]
    pub by_status: StatusCounts,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardRollup {
    pub endpoints: EndpointCounts,
    pub tunnels: TunnelCounts,
    pub tunnel_types: TypeCounts,
    pub traffic: Counters,
    pub total_rx: u64,
    pub total_tx: u64,
    pub total_bytes: u64,
}

/// Fold endpoint summaries into one rollup. Pure; an empty fleet yields zeros.
pub fn aggregate(summaries: &[EndpointSummary]) -> DashboardRollup {
    let mut rollup = DashboardRollup::default();

    for summary in summaries {
        rollup.endpoints.total += 1;
        match summary.status {
            EndpointStatus::Online => rollup.endpoints.online += 1,
            EndpointStatus::Offline => rollup.endpoints.offline += 1,
            EndpointStatus::Error => rollup.endpoints.error += 1,
        }

        rollup.tunnels.by_status.merge(&summary.stats.tunnels);
        rollup.tunnel_types.merge(&summary.stats.types);
        rollup.traffic += summary.stats.traffic;
    }

    rollup.tunnels.total = rollup.tunnels.by_status.total();
    rollup.total_rx = rollup.traffic.rx();
    rollup.total_tx = rollup.traffic.tx();
    rollup.total_bytes = rollup.traffic.total();
    rollup
}
