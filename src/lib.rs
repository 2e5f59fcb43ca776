//! In-memory telemetry store and fan-out hub for tunnel endpoint dashboards.

pub mod api;
pub mod config;
pub mod dashboard;
pub mod hub;
pub mod metrics;
pub mod service;
pub mod stats;
pub mod store;
