use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use clap::Args;

use manager::sync::ResetError as HookError;
use manager::{Classify, SyncError, SyncMonitor, SyncOptions, SyncReport};

use super::{Exporter, maybe_exporter};
use crate::CliError;
use crate::deps::Deps;

#[derive(Args, Clone, Debug, Default)]
pub struct SyncArgs {
    /// Single short progress line
    #[arg(long)]
    pub compact: bool,

    /// Samples in the block-rate window
    #[arg(long)]
    pub window: Option<usize>,

    /// Time between status polls, e.g. 500ms
    #[arg(long, value_parser = humantime::parse_duration)]
    pub interval: Option<Duration>,

    /// No height progress for this long counts as stuck, e.g. 5m
    #[arg(long, value_parser = humantime::parse_duration)]
    pub stuck_timeout: Option<Duration>,

    /// Reset-and-restart attempts when stuck
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Serve Prometheus metrics on this address while monitoring
    #[arg(long)]
    pub metrics_addr: Option<SocketAddr>,
}

pub async fn sync(deps: &Deps, args: &SyncArgs) -> anyhow::Result<()> {
    let exporter = maybe_exporter(args.metrics_addr.or(deps.cfg.metrics.listen_addr), &deps.cancel)?;
    let result = monitor(deps, args, exporter.as_ref()).await;
    if let Some(exporter) = exporter {
        exporter.shutdown().await;
    }
    let report = result.context("sync monitor failed")?;

    deps.out.emit(&report, |p| {
        format!(
            "{} synced at height {} in {}",
            p.status_word(true, "node"),
            report.snapshot.local_height,
            humantime::format_duration(Duration::from_secs(report.elapsed.as_secs()))
        )
    })
}

/// Runs the monitor with the bounded reset-and-restart loop.
pub async fn monitor(
    deps: &Deps,
    args: &SyncArgs,
    exporter: Option<&Exporter>,
) -> Result<SyncReport, SyncError> {
    let opts = options(deps, args);
    let max_retries = args.max_retries.unwrap_or(deps.cfg.sync.max_retries);

    let mut monitor = SyncMonitor::new(deps.rpc.clone(), deps.cancel.clone());
    if let Some(exporter) = exporter {
        monitor = monitor.with_metrics(exporter.registry.sync.clone());
    }

    let supervisor = deps.supervisor.clone();
    let start = deps.start_options();
    monitor
        .run_with_retry(&opts, max_retries, || {
            let supervisor = supervisor.clone();
            let start = start.as_ref().cloned().map_err(|_| CliError::BinaryMissing);
            async move {
                let start = start.map_err(boxed)?;
                supervisor.stop().await.map_err(boxed)?;
                let report = manager::reset_data(supervisor.layout()).map_err(boxed)?;
                tracing::info!(removed = report.removed.len(), "data reset after stall");
                supervisor.start(&start).await.map_err(boxed)?;
                Ok::<(), HookError>(())
            }
        })
        .await
}

fn options(deps: &Deps, args: &SyncArgs) -> SyncOptions {
    let mut opts = SyncOptions::from_config(&deps.cfg.sync, &deps.cfg.rpc);
    opts.log_path = Some(deps.supervisor.log_path());
    opts.compact = args.compact;
    opts.quiet = deps.flags.quiet || !deps.out.is_text();
    opts.debug = deps.flags.debug;
    if !opts.quiet {
        opts.out = Some(Arc::new(Mutex::new(std::io::stderr())));
    }
    if let Some(window) = args.window {
        opts.window = window.max(2);
    }
    if let Some(interval) = args.interval {
        opts.interval = interval;
    }
    if let Some(stuck) = args.stuck_timeout {
        opts.stuck_timeout = stuck;
    }
    opts
}

fn boxed<E: Classify + Send + Sync + 'static>(err: E) -> HookError {
    Box::new(err)
}
