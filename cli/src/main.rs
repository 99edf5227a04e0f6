//! `push-validator` binary.
//!
//! Operator CLI for a single Push Chain validator node. The binary owns
//! the command surface, output rendering, signal handling and exit codes;
//! everything that touches the node lives in the `manager` crate.

mod commands;
mod deps;
mod output;
mod prompt;

use std::io::IsTerminal;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use manager::{Classify, ErrorKind, ManagerConfig, Remediation};

use commands::{doctor, node, reset, snapshot, sync, validator};
use deps::{Deps, Flags};
use output::{OutputFormat, Printer};

/// Push Chain validator manager
#[derive(Parser)]
#[command(name = "push-validator")]
#[command(version)]
#[command(about = "Bootstrap, run, sync and manage a Push Chain validator node", long_about = None)]
#[command(propagate_version = true)]
#[command(arg_required_else_help = true)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Flags honoured by every command.
#[derive(Args, Clone, Debug)]
struct GlobalArgs {
    /// Node home directory (default ~/.pchain, env HOME_DIR)
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    /// Node binary (env PCHAIND)
    #[arg(long = "bin", global = true)]
    binary: Option<PathBuf>,

    /// Local node RPC URL (env RPC_LOCAL)
    #[arg(long, global = true)]
    rpc: Option<String>,

    /// Output format
    #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    output: OutputFormat,

    /// Disable colors
    #[arg(long, global = true)]
    no_color: bool,

    /// Replace emoji with ASCII markers
    #[arg(long, global = true)]
    no_emoji: bool,

    /// Answer yes to confirmations
    #[arg(short, long, global = true)]
    yes: bool,

    /// Never prompt
    #[arg(long, global = true)]
    non_interactive: bool,

    /// Only print results and errors
    #[arg(short, long, global = true, conflicts_with = "debug")]
    quiet: bool,

    /// Verbose logs
    #[arg(long, global = true)]
    debug: bool,
}

impl GlobalArgs {
    /// Flag layer on top of defaults and environment.
    fn apply(&self, cfg: &mut ManagerConfig) {
        if let Some(home) = &self.home {
            cfg.node.home = home.clone();
        }
        if let Some(binary) = &self.binary {
            cfg.node.binary = Some(binary.clone());
        }
        if let Some(rpc) = &self.rpc {
            cfg.rpc.local_url = rpc.clone();
        }
        if self.no_color {
            cfg.no_color = true;
        }
    }

    fn flags(&self) -> Flags {
        Flags {
            yes: self.yes,
            non_interactive: self.non_interactive,
            quiet: self.quiet,
            debug: self.debug,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the home directory: keys, genesis, peers and snapshot
    Init(node::InitArgs),

    /// Start the node, wait for sync and offer validator registration
    Start(node::StartArgs),

    /// Stop the node
    Stop,

    /// Stop then start the node
    Restart,

    /// Print the node log
    Logs(node::LogsArgs),

    /// Node, sync and validator status
    Status,

    /// Monitor sync progress until the node catches up
    Sync(sync::SyncArgs),

    /// Remove chain data, keeping keys, address book and signing state
    Reset,

    /// Remove chain data, configuration and wrapper layout; keeps keys
    #[command(name = "full-reset")]
    FullReset,

    /// Download or extract the chain snapshot
    Snapshot {
        #[command(subcommand)]
        command: snapshot::SnapshotCommand,
    },

    /// Run preflight checks
    Doctor,

    /// Register this node as a validator
    Register(validator::RegisterArgs),

    /// Delegate stake to a validator
    Delegate(validator::DelegateArgs),

    /// Unjail this node's validator
    Unjail(validator::KeyArgs),

    /// Withdraw staking rewards
    #[command(name = "withdraw-rewards")]
    WithdrawRewards(validator::WithdrawArgs),

    /// Withdraw rewards and delegate them back
    Restake(validator::RestakeArgs),

    /// Vote on a governance proposal
    Vote(validator::VoteArgs),

    /// Spendable balance of an account
    Balance(validator::BalanceArgs),

    /// Manage the validator key
    Keys {
        #[command(subcommand)]
        command: validator::KeysCommand,
    },

    /// List validators
    Validators,

    /// Show every encoding of an address
    Addr(validator::AddrArgs),
}

/// Failures raised by the binary itself.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Validation(String),
    #[error("node binary not found")]
    BinaryMissing,
    #[error("{0}")]
    Precondition(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("{failed} preflight check(s) failed")]
    DoctorFailed { failed: usize },
}

impl Classify for CliError {
    fn kind(&self) -> ErrorKind {
        match self {
            CliError::Validation(_) => ErrorKind::Validation,
            CliError::BinaryMissing | CliError::Precondition(_) | CliError::DoctorFailed { .. } => {
                ErrorKind::Precondition
            }
            CliError::Cancelled => ErrorKind::Cancellation,
        }
    }

    fn remediation(&self) -> Remediation {
        let base = Remediation::new(self.to_string());
        match self {
            CliError::BinaryMissing => base
                .cause("pchaind is neither on PATH nor under <home>/cosmovisor/genesis/bin")
                .action("push-validator --bin /path/to/pchaind <command>")
                .action("export PCHAIND=/path/to/pchaind"),
            CliError::DoctorFailed { .. } => base.action("fix the failing checks and run push-validator doctor again"),
            _ => base,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut cfg = ManagerConfig::from_env();
    cli.global.apply(&mut cfg);

    let color = !cfg.no_color && std::io::stderr().is_terminal();
    init_tracing(&cli.global, color);

    let emoji = !cli.global.no_emoji && output::locale_supports_utf8();
    let printer = Printer::new(cli.global.output, color, emoji, cli.global.quiet);

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let flags = cli.global.flags();
    if let Err(err) = run(cli.command, cfg, printer.clone(), flags, cancel.clone()).await {
        let err = if cancel.is_cancelled()
            && output::classify(&err).map(|c| c.kind()) != Some(ErrorKind::Cancellation)
        {
            anyhow::Error::new(CliError::Cancelled)
        } else {
            err
        };
        let status = printer.error(&err);
        std::process::exit(status.code());
    }
}

async fn run(
    command: Commands,
    cfg: ManagerConfig,
    printer: Printer,
    flags: Flags,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let deps = Deps::new(cfg, printer, flags, cancel)?;

    match command {
        Commands::Init(args) => node::init(&deps, &args).await,
        Commands::Start(args) => node::start(&deps, &args).await,
        Commands::Stop => node::stop(&deps).await,
        Commands::Restart => node::restart(&deps).await,
        Commands::Logs(args) => node::logs(&deps, &args).await,
        Commands::Status => node::status(&deps).await,
        Commands::Sync(args) => sync::sync(&deps, &args).await,
        Commands::Reset => reset::reset(&deps).await,
        Commands::FullReset => reset::full_reset(&deps).await,
        Commands::Snapshot { command } => snapshot::run(&deps, &command).await,
        Commands::Doctor => doctor::doctor(&deps).await,
        Commands::Register(args) => validator::register(&deps, &args).await,
        Commands::Delegate(args) => validator::delegate(&deps, &args).await,
        Commands::Unjail(args) => validator::unjail(&deps, &args).await,
        Commands::WithdrawRewards(args) => validator::withdraw_rewards(&deps, &args).await,
        Commands::Restake(args) => validator::restake(&deps, &args).await,
        Commands::Vote(args) => validator::vote(&deps, &args).await,
        Commands::Balance(args) => validator::balance(&deps, &args).await,
        Commands::Keys { command } => validator::keys(&deps, &command).await,
        Commands::Validators => validator::validators(&deps).await,
        Commands::Addr(args) => validator::addr(&deps, &args).await,
    }
}

/// `RUST_LOG` wins; otherwise `--debug` and `--quiet` pick the level.
fn init_tracing(global: &GlobalArgs, color: bool) {
    let default = if global.debug {
        "manager=debug,push_validator=debug"
    } else if global.quiet {
        "warn"
    } else {
        "manager=info,push_validator=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(global.debug)
        .with_ansi(color)
        .init();
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("interrupt received, shutting down");
        cancel.cancel();
    });
}

/// Waits for SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::debug!(%err, "SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
