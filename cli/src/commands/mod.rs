//! Command implementations, one module per command group.

pub mod doctor;
pub mod node;
pub mod reset;
pub mod snapshot;
pub mod sync;
pub mod validator;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use manager::metrics::SnapshotMetrics;
use manager::snapshot::ProgressFn;
use manager::{MetricsRegistry, Phase, SnapshotProgress, run_prometheus_http_server};

use crate::output::Printer;

/// Prometheus exporter running next to a long command.
pub struct Exporter {
    pub registry: Arc<MetricsRegistry>,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl Exporter {
    /// Serves `/metrics` and `/health` on `addr` until [`Exporter::shutdown`]
    /// or until `parent` is cancelled.
    pub fn spawn(addr: SocketAddr, parent: &CancellationToken) -> anyhow::Result<Self> {
        let registry = Arc::new(MetricsRegistry::new()?);
        let stop = parent.child_token();

        let server_registry = registry.clone();
        let server_stop = stop.clone();
        let task = tokio::spawn(async move {
            if let Err(err) = run_prometheus_http_server(server_registry, addr, server_stop).await {
                tracing::warn!(%addr, %err, "metrics exporter stopped");
            }
        });

        Ok(Self {
            registry,
            stop,
            task,
        })
    }

    pub async fn shutdown(self) {
        self.stop.cancel();
        let _ = self.task.await;
    }
}

/// Spawns an exporter when an address is configured.
pub fn maybe_exporter(
    addr: Option<SocketAddr>,
    cancel: &CancellationToken,
) -> anyhow::Result<Option<Exporter>> {
    addr.map(|addr| Exporter::spawn(addr, cancel)).transpose()
}

#[derive(Default)]
struct ProgressState {
    phase: Option<Phase>,
    bytes: u64,
    decile: u64,
}

/// Progress callback that prints phase changes and every tenth of the
/// total, and feeds snapshot metrics when given.
pub fn snapshot_progress(out: &Printer, metrics: Option<SnapshotMetrics>) -> ProgressFn {
    let out = out.clone();
    let state = Mutex::new(ProgressState::default());

    Arc::new(move |event: &SnapshotProgress| {
        let Ok(mut st) = state.lock() else {
            return;
        };
        let new_phase = st.phase != Some(event.phase);
        if new_phase {
            st.phase = Some(event.phase);
            st.bytes = 0;
            st.decile = 0;
        }

        if let Some(m) = &metrics {
            let delta = event.current.saturating_sub(st.bytes);
            match event.phase {
                Phase::Download => m.downloaded_bytes.inc_by(delta),
                Phase::Extract => m.extracted_bytes.inc_by(delta),
                Phase::Cache if new_phase => m.cache_hits.inc(),
                Phase::Cache | Phase::Verify => {}
            }
        }
        st.bytes = st.bytes.max(event.current);

        if new_phase {
            out.step(&format!("{}: {}", event.phase, event.message));
            return;
        }
        if event.total > 0 {
            let decile = event.current.saturating_mul(10) / event.total;
            if decile > st.decile {
                st.decile = decile;
                out.step(&format!(
                    "{} {}% ({} / {})",
                    event.phase,
                    decile * 10,
                    human_bytes(event.current),
                    human_bytes(event.total)
                ));
            }
        }
    })
}

/// `1536` -> `1.5 KiB`.
pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
