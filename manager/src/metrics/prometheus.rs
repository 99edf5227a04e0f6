//! Prometheus-backed metrics and HTTP exporter.
//!
//! [`MetricsRegistry`] owns a Prometheus registry and the strongly-typed
//! sync and snapshot metrics. The exporter is an `axum` router serving
//! `/metrics` and `/health`.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use prometheus::{Encoder, Gauge, IntCounter, IntGauge, Opts, Registry, TextEncoder};

/// Sync-monitor metrics, updated once per tick.
#[derive(Clone)]
pub struct SyncMetrics {
    /// Latest height reported by the local node.
    pub local_height: IntGauge,
    /// Latest height reported by the remote endpoint.
    pub remote_height: IntGauge,
    /// Block rate over the sliding window.
    pub blocks_per_second: Gauge,
    /// Connected peers of the local node.
    pub peers: IntGauge,
    /// Number of reset-and-restart cycles triggered by stall detection.
    pub resets: IntCounter,
    /// Ticks whose local status call failed.
    pub status_errors: IntCounter,
}

impl SyncMetrics {
    /// Registers sync metrics into the given `Registry`.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let local_height = IntGauge::with_opts(Opts::new(
            "sync_local_height",
            "Latest block height reported by the local node",
        ))?;
        registry.register(Box::new(local_height.clone()))?;

        let remote_height = IntGauge::with_opts(Opts::new(
            "sync_remote_height",
            "Latest block height reported by the remote endpoint",
        ))?;
        registry.register(Box::new(remote_height.clone()))?;

        let blocks_per_second = Gauge::with_opts(Opts::new(
            "sync_blocks_per_second",
            "Local block rate over the sliding window",
        ))?;
        registry.register(Box::new(blocks_per_second.clone()))?;

        let peers = IntGauge::with_opts(Opts::new(
            "sync_peers",
            "Connected peers of the local node",
        ))?;
        registry.register(Box::new(peers.clone()))?;

        let resets = IntCounter::with_opts(Opts::new(
            "sync_resets_total",
            "Reset-and-restart cycles triggered by stall detection",
        ))?;
        registry.register(Box::new(resets.clone()))?;

        let status_errors = IntCounter::with_opts(Opts::new(
            "sync_status_errors_total",
            "Monitor ticks whose local status call failed",
        ))?;
        registry.register(Box::new(status_errors.clone()))?;

        Ok(Self {
            local_height,
            remote_height,
            blocks_per_second,
            peers,
            resets,
            status_errors,
        })
    }
}

/// Snapshot pipeline metrics.
#[derive(Clone)]
pub struct SnapshotMetrics {
    /// Archive bytes received from the network.
    pub downloaded_bytes: IntCounter,
    /// Bytes written while extracting.
    pub extracted_bytes: IntCounter,
    /// Downloads answered from the cache.
    pub cache_hits: IntCounter,
}

impl SnapshotMetrics {
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let downloaded_bytes = IntCounter::with_opts(Opts::new(
            "snapshot_downloaded_bytes_total",
            "Snapshot archive bytes received from the network",
        ))?;
        registry.register(Box::new(downloaded_bytes.clone()))?;

        let extracted_bytes = IntCounter::with_opts(Opts::new(
            "snapshot_extracted_bytes_total",
            "Bytes written while extracting snapshots",
        ))?;
        registry.register(Box::new(extracted_bytes.clone()))?;

        let cache_hits = IntCounter::with_opts(Opts::new(
            "snapshot_cache_hits_total",
            "Snapshot downloads answered from the local cache",
        ))?;
        registry.register(Box::new(cache_hits.clone()))?;

        Ok(Self {
            downloaded_bytes,
            extracted_bytes,
            cache_hits,
        })
    }
}

/// Wrapper around a Prometheus registry and the manager's metrics.
///
/// Wrap it in an [`Arc`] to share it between the monitor and the exporter.
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Registry,
    pub sync: SyncMetrics,
    pub snapshot: SnapshotMetrics,
}

impl MetricsRegistry {
    /// Creates a fresh `Registry` with the `push_validator` prefix and
    /// registers all metrics.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("push_validator".to_string()), None)?;
        let sync = SyncMetrics::register(&registry)?;
        let snapshot = SnapshotMetrics::register(&registry)?;
        Ok(Self {
            registry,
            sync,
            snapshot,
        })
    }

    /// Encodes all metrics in this registry into the Prometheus text format.
    pub fn gather_text(&self) -> String {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!(%err, "failed to encode Prometheus metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// Simple health-check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// `GET /health`
async fn health() -> (StatusCode, Json<HealthResponse>) {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

/// `GET /metrics`
async fn metrics(State(registry): State<Arc<MetricsRegistry>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        registry.gather_text(),
    )
}

/// Router serving `/metrics` and `/health`. Other paths return 404.
pub fn router(registry: Arc<MetricsRegistry>) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .with_state(registry)
}

/// Serves [`router`] on `addr` until `cancel` fires.
///
/// Intended to be spawned next to the sync monitor:
///
/// ```ignore
/// tokio::spawn(run_prometheus_http_server(registry.clone(), addr, cancel.clone()));
/// ```
pub async fn run_prometheus_http_server(
    registry: Arc<MetricsRegistry>,
    addr: SocketAddr,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "serving Prometheus metrics");
    axum::serve(listener, router(registry))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}
