use std::alloc::System;
use std::hint::black_box;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serial_test::serial;
use stats_alloc::{Region, StatsAlloc, INSTRUMENTED_SYSTEM};
use tunnelboard::dashboard::aggregate;
use tunnelboard::store::{EndpointRegistry, TrendSettings, TunnelStatus, TunnelUpdate};

#[global_allocator]
static GLOBAL: &StatsAlloc<System> = &INSTRUMENTED_SYSTEM;

const ENDPOINTS: usize = 8;
const TUNNELS_PER_ENDPOINT: usize = 64;

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0)
        .single()
        .expect("valid time")
}

fn measure_alloc_counts<T>(f: impl FnOnce() -> T) -> (T, usize, usize) {
    // Calibrate for ambient allocator activity in the test harness process.
    let idle_region = Region::new(&GLOBAL);
    black_box(());
    let idle = idle_region.change();

    let region = Region::new(&GLOBAL);
    let output = f();
    let used = region.change();

    let allocations = used.allocations.saturating_sub(idle.allocations);
    let deallocations = used.deallocations.saturating_sub(idle.deallocations);
    (output, allocations, deallocations)
}

fn populated_registry() -> EndpointRegistry {
    let registry = EndpointRegistry::new(TrendSettings::default());
    let now = base_time();

    for e in 0..ENDPOINTS {
        let endpoint_id = format!("endpoint-{e}");
        for t in 0..TUNNELS_PER_ENDPOINT {
            let status = if t % 5 == 0 {
                TunnelStatus::Stopped
            } else {
                TunnelStatus::Running
            };
            let update = TunnelUpdate::new(format!("tunnel-{e}-{t}"))
                .with_status(status)
                .with_tcp(1_000 * t as u64, 500 * t as u64)
                .with_udp(10 * t as u64, 5 * t as u64);
            registry
                .apply_tunnel_update_at(&endpoint_id, &update, now)
                .expect("seed update");
        }
    }

    registry
}

#[test]
#[serial]
fn steady_state_tunnel_update_allocation_budget() {
    let registry = populated_registry();
    let now = base_time();

    // Prebuilt updates against existing instances with growing counters.
    let updates: Vec<TunnelUpdate> = (0..1_000u64)
        .map(|i| {
            TunnelUpdate::new("tunnel-3-17")
                .with_tcp(20_000 + i * 100, 10_000 + i * 50)
                .at(now + Duration::milliseconds(i as i64 + 1))
        })
        .collect();

    let (applied, allocations, deallocations) = measure_alloc_counts(|| {
        let mut applied = 0usize;
        for update in &updates {
            if registry
                .apply_tunnel_update_at("endpoint-3", update, now)
                .is_ok()
            {
                applied += 1;
            }
        }
        applied
    });

    assert_eq!(applied, updates.len());
    assert!(
        allocations <= 8,
        "in-place tunnel update allocation budget exceeded: {}",
        allocations
    );
    assert!(
        deallocations <= 8,
        "in-place tunnel update deallocation budget exceeded: {}",
        deallocations
    );
}

#[test]
#[serial]
fn summaries_allocate_less_than_snapshots() {
    let registry = populated_registry();

    let (snapshots, snapshot_allocations, _) = measure_alloc_counts(|| registry.get_all());
    let (summaries, summary_allocations, _) = measure_alloc_counts(|| registry.summaries());

    assert_eq!(snapshots.len(), ENDPOINTS);
    assert_eq!(summaries.len(), ENDPOINTS);
    assert!(
        summary_allocations < snapshot_allocations,
        "summaries should allocate less (summaries={} snapshots={})",
        summary_allocations,
        snapshot_allocations
    );
}

#[test]
#[serial]
fn dashboard_rollup_allocation_budget() {
    let registry = populated_registry();
    let summaries = registry.summaries();

    let (rollup, allocations, deallocations) = measure_alloc_counts(|| aggregate(&summaries));

    assert_eq!(rollup.endpoints.total, ENDPOINTS);
    assert_eq!(rollup.tunnels.total, ENDPOINTS * TUNNELS_PER_ENDPOINT);
    assert!(
        allocations <= 2,
        "dashboard rollup allocation budget exceeded: {}",
        allocations
    );
    assert!(
        deallocations <= 2,
        "dashboard rollup deallocation budget exceeded: {}",
        deallocations
    );
}
