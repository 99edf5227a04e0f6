//! Metrics for the sync monitor and snapshot pipeline.
//!
//! This module defines Prometheus-compatible metrics and a small HTTP
//! exporter that serves `/metrics` in Prometheus text format plus a
//! `/health` liveness route.
//!
//! Typical usage while syncing:
//!
//! ```ignore
//! use std::net::SocketAddr;
//! use std::sync::Arc;
//! use manager::metrics::{MetricsRegistry, run_prometheus_http_server};
//!
//! let registry = Arc::new(MetricsRegistry::new()?);
//! let addr: SocketAddr = "127.0.0.1:9898".parse()?;
//!
//! // Spawn the HTTP exporter in the background:
//! tokio::spawn(run_prometheus_http_server(registry.clone(), addr, cancel.clone()));
//!
//! // Elsewhere in the code:
//! registry.sync.local_height.set(height as i64);
//! ```

pub mod prometheus;

pub use self::prometheus::{
    MetricsRegistry, SnapshotMetrics, SyncMetrics, router, run_prometheus_http_server,
};
