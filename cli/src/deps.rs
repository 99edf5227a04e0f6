//! Composition root: builds the manager's collaborators once per command.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use manager::exec::process::library_dirs;
use manager::validator::ValidatorFacade;
use manager::{
    HomeLayout, HttpRpcClient, ManagerConfig, ProcessRunner, SnapshotEngine, StartOptions,
    Supervisor,
};

use crate::CliError;
use crate::output::Printer;
use crate::prompt::{self, Prompter};

/// Deadline for one node-binary invocation; `tx` with `--gas auto`
/// simulates before broadcasting.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(90);

/// Behaviour switches from the global flags.
#[derive(Clone, Copy, Debug, Default)]
pub struct Flags {
    pub yes: bool,
    pub non_interactive: bool,
    pub quiet: bool,
    pub debug: bool,
}

pub struct Deps {
    pub cfg: ManagerConfig,
    /// Resolved node binary, if any.
    pub binary: Option<PathBuf>,
    pub supervisor: Supervisor,
    /// Client for the local node.
    pub rpc: HttpRpcClient,
    pub runner: ProcessRunner,
    pub cancel: CancellationToken,
    pub out: Printer,
    pub prompter: Prompter,
    pub flags: Flags,
}

impl Deps {
    pub fn new(
        cfg: ManagerConfig,
        out: Printer,
        flags: Flags,
        cancel: CancellationToken,
    ) -> anyhow::Result<Self> {
        let binary = cfg.node.resolve_binary();
        let supervisor = Supervisor::select(&cfg.node, binary.as_deref());
        let rpc = HttpRpcClient::new(
            cfg.rpc.local_url.clone(),
            cfg.rpc.local_timeout,
            cfg.rpc.remote_timeout,
        )
        .context("failed to build RPC client")?;

        let mut runner =
            ProcessRunner::new(COMMAND_TIMEOUT, cancel.clone()).with_grace(cfg.node.stop_grace);
        if let Some(bin) = &binary {
            runner = runner.with_library_paths(library_dirs(bin, &cfg.node.layout()));
        }

        let interactive = !flags.non_interactive && prompt::is_tty();
        let prompter = Prompter::new(interactive, cancel.clone());
        tracing::debug!(
            home = %cfg.node.home.display(),
            binary = ?binary,
            interactive,
            "resolved configuration"
        );

        Ok(Self {
            cfg,
            binary,
            supervisor,
            rpc,
            runner,
            cancel,
            out,
            prompter,
            flags,
        })
    }

    pub fn layout(&self) -> HomeLayout {
        self.cfg.node.layout()
    }

    pub fn require_binary(&self) -> Result<&Path, CliError> {
        self.binary.as_deref().ok_or(CliError::BinaryMissing)
    }

    pub fn start_options(&self) -> Result<StartOptions, CliError> {
        Ok(StartOptions {
            home: self.cfg.node.home.clone(),
            moniker: self.cfg.node.moniker.clone(),
            binary: self.require_binary()?.to_path_buf(),
        })
    }

    pub fn snapshots(&self) -> anyhow::Result<SnapshotEngine> {
        SnapshotEngine::new(&self.cfg.snapshot, self.cancel.clone())
            .context("failed to build snapshot client")
    }

    pub fn validator(&self) -> Result<ValidatorFacade<ProcessRunner>, CliError> {
        Ok(ValidatorFacade::new(
            self.runner.clone(),
            self.require_binary()?,
            &self.cfg.node.home,
            &self.cfg.node.chain_id,
            &self.cfg.rpc.local_url,
            self.cfg.validator.clone(),
        ))
    }
}
