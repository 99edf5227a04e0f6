use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Subcommand;
use serde::Serialize;

use manager::{DownloadOptions, ExtractOptions};

use super::{maybe_exporter, snapshot_progress};
use crate::deps::Deps;
use crate::output::Glyph;

#[derive(Subcommand, Clone, Debug)]
pub enum SnapshotCommand {
    /// Download and verify the snapshot into the local cache
    Download {
        /// Snapshot archive URL (env SNAPSHOT_URL)
        #[arg(long)]
        url: Option<String>,

        /// Download even if the cached archive matches the remote checksum
        #[arg(long)]
        no_cache: bool,

        /// Serve Prometheus metrics on this address while downloading
        #[arg(long)]
        metrics_addr: Option<SocketAddr>,
    },

    /// Verify the cached snapshot and extract it into the data directory
    Extract {
        /// Directory to extract into (default <home>/data)
        #[arg(long)]
        target: Option<PathBuf>,

        /// Serve Prometheus metrics on this address while extracting
        #[arg(long)]
        metrics_addr: Option<SocketAddr>,
    },
}

#[derive(Serialize)]
struct SnapshotReport {
    action: &'static str,
    cache_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    target_dir: Option<PathBuf>,
}

pub async fn run(deps: &Deps, command: &SnapshotCommand) -> anyhow::Result<()> {
    let engine = deps.snapshots()?;
    let home = deps.cfg.node.home.clone();

    let (report, exporter, result) = match command {
        SnapshotCommand::Download {
            url,
            no_cache,
            metrics_addr,
        } => {
            let exporter = maybe_exporter(*metrics_addr, &deps.cancel)?;
            let source_url = url.clone().unwrap_or_else(|| deps.cfg.snapshot.url.clone());
            let mut opts = DownloadOptions::new(source_url.clone(), &home);
            opts.no_cache = *no_cache;
            opts.progress = snapshot_progress(
                &deps.out,
                exporter.as_ref().map(|e| e.registry.snapshot.clone()),
            );
            let result = engine
                .download(&opts)
                .await
                .context("snapshot download failed");
            let report = SnapshotReport {
                action: "download",
                cache_dir: deps.layout().snapshot_cache_dir(),
                source_url: Some(source_url),
                target_dir: None,
            };
            (report, exporter, result)
        }
        SnapshotCommand::Extract {
            target,
            metrics_addr,
        } => {
            let exporter = maybe_exporter(*metrics_addr, &deps.cancel)?;
            let mut opts = ExtractOptions::new(&home);
            if let Some(target) = target {
                opts.target_dir = target.clone();
            }
            opts.progress = snapshot_progress(
                &deps.out,
                exporter.as_ref().map(|e| e.registry.snapshot.clone()),
            );
            let result = engine
                .extract(&opts)
                .await
                .context("snapshot extraction failed");
            let report = SnapshotReport {
                action: "extract",
                cache_dir: deps.layout().snapshot_cache_dir(),
                source_url: None,
                target_dir: Some(opts.target_dir.clone()),
            };
            (report, exporter, result)
        }
    };

    if let Some(exporter) = exporter {
        exporter.shutdown().await;
    }
    result?;

    deps.out.emit(&report, |p| match &report.target_dir {
        Some(target) => format!("{} snapshot extracted into {}", p.glyph(Glyph::Ok), target.display()),
        None => format!(
            "{} snapshot cached in {}",
            p.glyph(Glyph::Ok),
            report.cache_dir.display()
        ),
    })
}
