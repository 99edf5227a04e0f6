//! Node lifecycle: init, start, stop, restart, logs and status.

use std::error::Error;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Args;
use serde::Serialize;

use manager::poststart::{self, Ending, Event, PromptAnswer, Stage};
use manager::supervisor::{cosmovisor, logs, ports};
use manager::sync::TOLERANCE;
use manager::{
    Bootstrap, InitOptions, NodeRpc, NodeStatus, SyncError, SyncReport, ValidatorRecord, config,
    retry_once,
};

use super::sync::{self as sync_cmd, SyncArgs};
use super::validator::{self as validator_cmd, RegisterArgs};
use super::{maybe_exporter, snapshot_progress};
use crate::CliError;
use crate::deps::Deps;
use crate::output::{Glyph, Printer};

/// How long the registration prompt waits for an answer.
const PROMPT_TIMEOUT: Duration = Duration::from_secs(30);
const LISTEN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Args, Clone, Debug, Default)]
pub struct InitArgs {
    /// Node moniker (env MONIKER)
    #[arg(long)]
    pub moniker: Option<String>,

    /// Chain id (env CHAIN_ID)
    #[arg(long)]
    pub chain_id: Option<String>,

    /// Domain serving genesis and public RPC (env GENESIS_DOMAIN)
    #[arg(long)]
    pub genesis_domain: Option<String>,

    /// Snapshot archive URL (env SNAPSHOT_URL)
    #[arg(long)]
    pub snapshot_url: Option<String>,

    /// Do not download or extract a snapshot
    #[arg(long)]
    pub skip_snapshot: bool,

    /// Fetch genesis even if one is present
    #[arg(long)]
    pub refresh_genesis: bool,

    /// Extract the snapshot even if data is present
    #[arg(long)]
    pub refresh_snapshot: bool,

    /// Serve Prometheus metrics on this address while initializing
    #[arg(long)]
    pub metrics_addr: Option<SocketAddr>,
}

#[derive(Serialize)]
struct InitSummary {
    home: PathBuf,
    chain_id: String,
    moniker: String,
    snapshot: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    wrapper_binary: Option<PathBuf>,
}

pub async fn init(deps: &Deps, args: &InitArgs) -> anyhow::Result<()> {
    let binary = deps.require_binary()?.to_path_buf();
    let cfg = &deps.cfg;
    let genesis_domain = args
        .genesis_domain
        .clone()
        .unwrap_or_else(|| cfg.rpc.genesis_domain.clone());
    let remote = deps.rpc.with_base_url(config::remote_url_for(&genesis_domain));
    let engine = deps.snapshots()?;
    let exporter = maybe_exporter(args.metrics_addr, &deps.cancel)?;

    let out = deps.out.clone();
    let opts = InitOptions {
        home_dir: cfg.node.home.clone(),
        chain_id: args.chain_id.clone().unwrap_or_else(|| cfg.node.chain_id.clone()),
        moniker: args.moniker.clone().unwrap_or_else(|| cfg.node.moniker.clone()),
        genesis_domain,
        node_bin_path: binary.clone(),
        snapshot_url: args.snapshot_url.clone().unwrap_or_else(|| cfg.snapshot.url.clone()),
        skip_snapshot: args.skip_snapshot,
        refresh_genesis: args.refresh_genesis,
        refresh_snapshot: args.refresh_snapshot,
        progress: Arc::new(move |msg: &str| out.step(msg)),
        snapshot_progress: snapshot_progress(
            &deps.out,
            exporter.as_ref().map(|e| e.registry.snapshot.clone()),
        ),
    };

    let result = Bootstrap::new(&deps.runner, &remote, &engine).init(&opts).await;
    if let Some(exporter) = exporter {
        exporter.shutdown().await;
    }
    result.context("node initialization failed")?;

    let layout = deps.layout();
    let wrapper_binary = if !cfg.node.disable_wrapper && cosmovisor::wrapper_on_path().is_some() {
        let installed = cosmovisor::init_layout(&layout, &binary).with_context(|| {
            format!(
                "failed to prepare upgrade wrapper layout under {}",
                layout.cosmovisor_dir().display()
            )
        })?;
        Some(installed)
    } else {
        None
    };

    let summary = InitSummary {
        home: opts.home_dir.clone(),
        chain_id: opts.chain_id.clone(),
        moniker: opts.moniker.clone(),
        snapshot: manager::snapshot::is_present(&opts.home_dir),
        wrapper_binary,
    };
    deps.out.emit(&summary, |p| {
        let mut text = format!("{} node initialized\n", p.glyph(Glyph::Ok));
        text.push_str(&p.field("home", summary.home.display()));
        text.push_str(&p.field("chain id", &summary.chain_id));
        text.push_str(&p.field("moniker", &summary.moniker));
        text.push_str(&p.field("snapshot", if summary.snapshot { "extracted" } else { "none" }));
        if let Some(bin) = &summary.wrapper_binary {
            text.push_str(&p.field("upgrade wrapper", bin.display()));
        }
        text.push_str(&format!("\n{} push-validator start", p.glyph(Glyph::Hint)));
        text
    })
}

#[derive(Args, Clone, Debug, Default)]
pub struct StartArgs {
    /// Return as soon as the process is up
    #[arg(long)]
    pub no_wait: bool,

    #[command(flatten)]
    pub sync: SyncArgs,
}

#[derive(Serialize)]
struct StartReport {
    pid: u32,
    backend: &'static str,
    already_running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    sync: Option<SyncReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    registered_tx: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    next: Option<Ending>,
}

pub async fn start(deps: &Deps, args: &StartArgs) -> anyhow::Result<()> {
    let opts = deps.start_options()?;
    let already_running = deps.supervisor.is_running();
    let pid = deps
        .supervisor
        .start(&opts)
        .await
        .context("failed to start node")?;
    if already_running {
        deps.out.success(&format!("node already running (pid {pid})"));
    } else {
        deps.out.success(&format!(
            "node started (pid {pid}, {})",
            deps.supervisor.backend().label()
        ));
    }

    let mut report = StartReport {
        pid,
        backend: deps.supervisor.backend().label(),
        already_running,
        sync: None,
        registered_tx: None,
        next: None,
    };
    if !args.no_wait {
        post_start(deps, args, &mut report).await?;
    }

    deps.out.emit(&report, |p| match report.next {
        Some(Ending::Steps) => steps_text(p),
        Some(Ending::DashboardHint) => dashboard_text(p),
        None => format!("{} push-validator sync", p.glyph(Glyph::Hint)),
    })
}

/// Waits for sync, then offers registration when this node is not yet a
/// validator.
async fn post_start(deps: &Deps, args: &StartArgs, report: &mut StartReport) -> anyhow::Result<()> {
    let exporter = maybe_exporter(
        args.sync.metrics_addr.or(deps.cfg.metrics.listen_addr),
        &deps.cancel,
    )?;
    let mut stage = Stage::CheckingSync;

    let outcome = loop {
        stage = match stage {
            Stage::CheckingSync => {
                deps.out.step("waiting for the node to catch up");
                match sync_cmd::monitor(deps, &args.sync, exporter.as_ref()).await {
                    Ok(synced) => {
                        report.sync = Some(synced);
                        poststart::step(stage, Event::Synced)
                    }
                    Err(err @ SyncError::Stuck { .. }) => {
                        deps.out.warn(&err.to_string());
                        poststart::step(stage, Event::SyncStuck)
                    }
                    Err(err) => break Err(anyhow::Error::new(err).context("sync monitor failed")),
                }
            }
            Stage::CheckingRegistration => {
                let checked = registration_status(deps).await;
                if let Err(err) = &checked {
                    deps.out
                        .warn(&format!("could not check validator registration: {err:#}"));
                }
                let result: Result<bool, &(dyn Error + 'static)> = match &checked {
                    Ok(is_validator) => Ok(*is_validator),
                    Err(err) => Err(&**err),
                };
                poststart::step(
                    stage,
                    Event::Registration {
                        result,
                        interactive: deps.prompter.interactive() && deps.out.is_text(),
                    },
                )
            }
            Stage::PromptRegister => {
                let answer = deps
                    .prompter
                    .confirm("Register this node as a validator now?", PROMPT_TIMEOUT)
                    .await;
                if answer == PromptAnswer::TimedOut {
                    deps.out.warn("no answer, skipping registration");
                }
                poststart::step(stage, Event::Answer(answer))
            }
            Stage::Registering => {
                match validator_cmd::register_flow(deps, &RegisterArgs::default()).await {
                    Ok(outcome) => {
                        deps.out
                            .success(&format!("validator registered (tx {})", outcome.txhash));
                        report.registered_tx = Some(outcome.txhash);
                    }
                    Err(err) => deps.out.warn(&format!("registration failed: {err:#}")),
                }
                poststart::step(stage, Event::Registered)
            }
            Stage::Done(ending) => break Ok(ending),
        };
    };

    if let Some(exporter) = exporter {
        exporter.shutdown().await;
    }
    report.next = Some(outcome?);
    Ok(())
}

async fn registration_status(deps: &Deps) -> anyhow::Result<bool> {
    let facade = deps.validator()?;
    Ok(facade.is_validator("").await?)
}

fn dashboard_text(p: &Printer) -> String {
    format!(
        "{hint} push-validator status\n{hint} push-validator logs --follow",
        hint = p.glyph(Glyph::Hint)
    )
}

fn steps_text(p: &Printer) -> String {
    let mut text = String::from("To become a validator:\n");
    for step in poststart::registration_steps() {
        text.push_str(&format!("  {} {step}\n", p.glyph(Glyph::Step)));
    }
    text
}

#[derive(Serialize)]
struct StopReport {
    stopped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pid: Option<u32>,
}

pub async fn stop(deps: &Deps) -> anyhow::Result<()> {
    let pid = deps.supervisor.pid();
    deps.supervisor.stop().await.context("failed to stop node")?;

    let report = StopReport {
        stopped: pid.is_some(),
        pid,
    };
    deps.out.emit(&report, |p| match report.pid {
        Some(pid) => format!("{} node stopped (pid {pid})", p.glyph(Glyph::Ok)),
        None => format!("{} node was not running", p.glyph(Glyph::Ok)),
    })
}

#[derive(Serialize)]
struct RestartReport {
    pid: u32,
    backend: &'static str,
}

pub async fn restart(deps: &Deps) -> anyhow::Result<()> {
    let opts = deps.start_options()?;
    let pid = deps
        .supervisor
        .restart(&opts)
        .await
        .context("failed to restart node")?;

    let report = RestartReport {
        pid,
        backend: deps.supervisor.backend().label(),
    };
    deps.out.emit(&report, |p| {
        format!("{} node restarted (pid {pid})", p.glyph(Glyph::Ok))
    })
}

#[derive(Args, Clone, Debug)]
pub struct LogsArgs {
    /// Lines to show from the end of the log
    #[arg(short = 'n', long, default_value_t = 50)]
    pub lines: usize,

    /// Keep printing appended lines until interrupted
    #[arg(short, long)]
    pub follow: bool,
}

#[derive(Serialize)]
struct LogsReport {
    path: PathBuf,
    lines: Vec<String>,
}

pub async fn logs(deps: &Deps, args: &LogsArgs) -> anyhow::Result<()> {
    let path = deps.supervisor.log_path();
    if !path.is_file() {
        return Err(CliError::Precondition(format!(
            "no log file at {}; the node has not been started from this home",
            path.display()
        ))
        .into());
    }

    let lines = logs::tail_lines(&path, args.lines)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let offset = logs::current_len(&path);

    if !args.follow {
        let report = LogsReport { path, lines };
        return deps.out.emit(&report, |_| report.lines.join("\n"));
    }

    for line in &lines {
        println!("{line}");
    }
    logs::follow(&path, offset, &deps.cancel, |line| println!("{line}"))
        .await
        .with_context(|| format!("failed to follow {}", path.display()))
}

/// Everything `status` reports.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub home: PathBuf,
    pub initialized: bool,
    pub running: bool,
    pub pid: Option<u32>,
    pub backend: &'static str,
    pub binary: Option<PathBuf>,
    pub rpc_listening: bool,
    pub node: Option<NodeStatus>,
    pub peers: Option<usize>,
    pub remote_height: Option<u64>,
    pub synced: Option<bool>,
    pub validator: Option<ValidatorRecord>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

pub async fn status(deps: &Deps) -> anyhow::Result<()> {
    let report = collect_status(deps).await;
    deps.out.emit(&report, |p| render_status(p, &report))
}

async fn collect_status(deps: &Deps) -> StatusReport {
    let layout = deps.layout();
    let pid = deps.supervisor.pid();
    let rpc_listening = ports::is_rpc_listening(
        &ports::hostport_from_url(&deps.cfg.rpc.local_url),
        LISTEN_TIMEOUT,
    )
    .await;

    let mut report = StatusReport {
        home: layout.root().to_path_buf(),
        initialized: layout.genesis_file().is_file(),
        running: pid.is_some(),
        pid,
        backend: deps.supervisor.backend().label(),
        binary: deps.binary.clone(),
        rpc_listening,
        node: None,
        peers: None,
        remote_height: None,
        synced: None,
        validator: None,
        errors: Vec::new(),
    };

    if rpc_listening {
        match retry_once(|| deps.rpc.status()).await {
            Ok(status) => report.node = Some(status),
            Err(err) => report.errors.push(format!("local status: {err}")),
        }
        match deps.rpc.peers().await {
            Ok(peers) => report.peers = Some(peers.len()),
            Err(err) => tracing::debug!(%err, "peer list unavailable"),
        }
    }

    let remote_url = deps.cfg.rpc.remote_url();
    match retry_once(|| deps.rpc.remote_status(&remote_url)).await {
        Ok(remote) => report.remote_height = Some(remote.height),
        Err(err) => report.errors.push(format!("remote status: {err}")),
    }

    report.synced = report.node.as_ref().map(|node| {
        !node.catching_up
            && report
                .remote_height
                .is_none_or(|remote| node.height + TOLERANCE >= remote)
    });

    if report.node.is_some() {
        if let Ok(facade) = deps.validator() {
            match facade.my_validator().await {
                Ok(record) => report.validator = record,
                Err(err) => tracing::debug!(%err, "validator record unavailable"),
            }
        }
    }
    report
}

fn render_status(p: &Printer, r: &StatusReport) -> String {
    let mut text = String::new();
    let process = match r.pid {
        Some(pid) => p.status_word(true, &format!("running (pid {pid}, {})", r.backend)),
        None => p.status_word(false, "stopped"),
    };
    text.push_str(&p.field("node", process));
    text.push_str(&p.field("home", r.home.display()));
    if !r.initialized {
        text.push_str(&p.field("genesis", p.status_word(false, "missing (run push-validator init)")));
    }
    text.push_str(&p.field(
        "rpc",
        if r.rpc_listening {
            p.status_word(true, "listening")
        } else {
            p.status_word(false, "not listening")
        },
    ));

    if let Some(node) = &r.node {
        let height = match r.remote_height {
            Some(remote) => format!("{} / {remote}", node.height),
            None => node.height.to_string(),
        };
        text.push_str(&p.field("height", height));
        text.push_str(&p.field("chain id", &node.chain_id));
        text.push_str(&p.field("moniker", &node.moniker));
        let synced = r.synced.unwrap_or(false);
        text.push_str(&p.field(
            "sync",
            p.status_word(synced, if synced { "synced" } else { "catching up" }),
        ));
    } else if let Some(remote) = r.remote_height {
        text.push_str(&p.field("network height", remote));
    }
    if let Some(peers) = r.peers {
        text.push_str(&p.field("peers", peers));
    }

    match &r.validator {
        Some(v) => {
            let state = if v.jailed {
                p.status_word(false, "jailed")
            } else {
                p.status_word(true, v.status.label())
            };
            text.push_str(&p.field("validator", format!("{} ({state})", v.moniker)));
            text.push_str(&p.field("operator", &v.operator_address));
            text.push_str(&p.field(
                "voting power",
                format!("{} ({:.2}%)", v.voting_power, v.voting_fraction * 100.0),
            ));
            text.push_str(&p.field("commission", &v.commission_rate));
            if let Some(until) = v.jailed_until.filter(|_| v.jailed) {
                text.push_str(&p.field("jailed until", until.to_rfc3339()));
            }
        }
        None if r.node.is_some() => text.push_str(&p.field("validator", "not registered")),
        None => {}
    }

    for err in &r.errors {
        text.push_str(&format!("{} {err}\n", p.glyph(Glyph::Warn)));
    }
    text
}
