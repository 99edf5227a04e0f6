//! Node process supervision.
//!
//! A [`Supervisor`] owns one node home directory and one of two backends:
//!
//! - [`Backend::Direct`] spawns the node binary itself,
//! - [`Backend::Cosmovisor`] spawns the upgrade wrapper, which launches the
//!   node binary and swaps it on upgrade events.
//!
//! The backends differ only in the argv they spawn and in the PID/log file
//! names. Both write `<home>/<name>.pid` and append to `<home>/<name>.log`.
//! The PID file is the only cross-invocation coordination: a live PID makes
//! a second `start` a no-op, and `stop` tolerates its absence.
//!
//! ```text
//! [Absent] --start--> [Running] --stop--> [Absent]
//! [Running] --restart--> [Running']
//! [Running] --crashed externally--> [Absent]
//! ```

pub mod cosmovisor;
pub mod logs;
pub mod pidfile;
pub mod ports;

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use thiserror::Error;

use crate::config::{self, NodeConfig, WRAPPER_BINARY_NAME};
use crate::error::{Classify, ErrorKind, Remediation};
use crate::home::HomeLayout;

pub use ports::{is_rpc_listening, port_in_use};

/// How long `start` watches for an immediate crash.
const STARTUP_WATCH: Duration = Duration::from_secs(1);
const POLL: Duration = Duration::from_millis(100);
const KILL_WAIT: Duration = Duration::from_secs(2);

/// Which process the supervisor spawns.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Backend {
    Direct,
    Cosmovisor { wrapper: PathBuf },
}

impl Backend {
    pub fn label(&self) -> &'static str {
        match self {
            Backend::Direct => "direct",
            Backend::Cosmovisor { .. } => "cosmovisor",
        }
    }
}

/// Passed by value to every `start`/`restart`.
#[derive(Clone, Debug)]
pub struct StartOptions {
    pub home: PathBuf,
    pub moniker: String,
    pub binary: PathBuf,
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("home directory {0} does not exist")]
    HomeMissing(PathBuf),
    #[error("genesis file {0} is missing")]
    GenesisMissing(PathBuf),
    #[error("validator keys are missing under {0}")]
    KeysMissing(PathBuf),
    #[error("port {port} is already in use by another process")]
    PortInUse { port: u16 },
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("node exited immediately with {}", .code.map(|c| format!("exit code {c}")).unwrap_or_else(|| "a signal".to_string()))]
    ExitedEarly {
        code: Option<i32>,
        log_tail: Vec<String>,
        log_path: PathBuf,
    },
    #[error("process {pid} did not exit after SIGKILL")]
    StopFailed { pid: u32 },
    #[error("failed to prepare the upgrade-wrapper layout: {0}")]
    Layout(#[source] std::io::Error),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl SupervisorError {
    fn io(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> Self {
        let context = context.into();
        move |source| SupervisorError::Io { context, source }
    }
}

impl Classify for SupervisorError {
    fn kind(&self) -> ErrorKind {
        match self {
            SupervisorError::HomeMissing(_)
            | SupervisorError::GenesisMissing(_)
            | SupervisorError::KeysMissing(_)
            | SupervisorError::PortInUse { .. } => ErrorKind::Precondition,
            SupervisorError::Spawn { .. }
            | SupervisorError::ExitedEarly { .. }
            | SupervisorError::StopFailed { .. } => ErrorKind::Subprocess,
            SupervisorError::Layout(_) | SupervisorError::Io { .. } => ErrorKind::Internal,
        }
    }

    fn remediation(&self) -> Remediation {
        let base = Remediation::new(self.to_string());
        match self {
            SupervisorError::HomeMissing(_) | SupervisorError::GenesisMissing(_) => base
                .cause("the node has not been initialised")
                .action("push-validator init"),
            SupervisorError::KeysMissing(_) => base
                .cause("config/priv_validator_key.json or config/node_key.json was removed")
                .action("restore the key files from backup, or run push-validator init on a fresh home"),
            SupervisorError::PortInUse { port } => base
                .cause("another node or service is listening on the port")
                .action(format!("find it with: lsof -i :{port}"))
                .action("push-validator stop"),
            SupervisorError::ExitedEarly { log_tail, log_path, .. } => {
                let mut r = base.action(format!("inspect {}", log_path.display()));
                r.causes.extend(log_tail.iter().cloned());
                r
            }
            SupervisorError::StopFailed { pid } => base
                .cause("the process is stuck in uninterruptible I/O or owned by another user")
                .action(format!("kill -9 {pid}")),
            _ => base,
        }
    }
}

/// Supervisor handle for one home directory and backend.
#[derive(Clone, Debug)]
pub struct Supervisor {
    layout: HomeLayout,
    backend: Backend,
    binary_name: String,
    p2p_port: u16,
    rpc_port: u16,
    grace: Duration,
}

impl Supervisor {
    pub fn new(home: impl Into<PathBuf>, backend: Backend) -> Self {
        let defaults = NodeConfig::default();
        Self {
            layout: HomeLayout::new(home),
            backend,
            binary_name: config::DEFAULT_BINARY_NAME.to_string(),
            p2p_port: defaults.p2p_port,
            rpc_port: defaults.rpc_port,
            grace: defaults.stop_grace,
        }
    }

    /// Backend selection: the wrapper when it is installed, its layout is
    /// present under the home directory, and it is not disabled.
    pub fn select(cfg: &NodeConfig, binary: Option<&Path>) -> Self {
        let binary_name = binary
            .map(config::binary_name)
            .unwrap_or_else(|| config::DEFAULT_BINARY_NAME.to_string());
        let backend = if cfg.disable_wrapper {
            Backend::Direct
        } else {
            match cosmovisor::detect(&cfg.layout(), &binary_name) {
                Some(wrapper) => Backend::Cosmovisor { wrapper },
                None => Backend::Direct,
            }
        };
        tracing::debug!(backend = backend.label(), "selected supervisor backend");

        Self::new(&cfg.home, backend)
            .with_binary_name(binary_name)
            .with_ports(cfg.p2p_port, cfg.rpc_port)
            .with_grace(cfg.stop_grace)
    }

    pub fn with_binary_name(mut self, name: impl Into<String>) -> Self {
        self.binary_name = name.into();
        self
    }

    pub fn with_ports(mut self, p2p: u16, rpc: u16) -> Self {
        self.p2p_port = p2p;
        self.rpc_port = rpc;
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn layout(&self) -> &HomeLayout {
        &self.layout
    }

    /// Basename of the PID and log files.
    fn process_name(&self) -> &str {
        match &self.backend {
            Backend::Direct => &self.binary_name,
            Backend::Cosmovisor { .. } => WRAPPER_BINARY_NAME,
        }
    }

    pub fn pid_path(&self) -> PathBuf {
        self.layout.pid_file(self.process_name())
    }

    pub fn log_path(&self) -> PathBuf {
        self.layout.log_file(self.process_name())
    }

    /// PID from the PID file, if it names a live process we may signal.
    pub fn pid(&self) -> Option<u32> {
        pidfile::read_pid(&self.pid_path()).filter(|pid| pidfile::is_alive(*pid))
    }

    pub fn is_running(&self) -> bool {
        self.pid().is_some()
    }

    /// Validates home, genesis, keys and ports; each violation has its own
    /// error variant.
    pub fn check_preconditions(&self, opts: &StartOptions) -> Result<(), SupervisorError> {
        let layout = HomeLayout::new(&opts.home);
        if !layout.root().is_dir() {
            return Err(SupervisorError::HomeMissing(layout.root().to_path_buf()));
        }
        if !layout.genesis_file().is_file() {
            return Err(SupervisorError::GenesisMissing(layout.genesis_file()));
        }
        if !layout.has_validator_keys() {
            return Err(SupervisorError::KeysMissing(layout.config_dir()));
        }
        if self.is_running() {
            // Ports are held by our own process.
            return Ok(());
        }
        for port in [self.p2p_port, self.rpc_port] {
            if ports::port_in_use(port) {
                return Err(SupervisorError::PortInUse { port });
            }
        }
        Ok(())
    }

    /// Program, argv and extra environment for the configured backend.
    pub fn spawn_spec(&self, opts: &StartOptions) -> (PathBuf, Vec<String>, Vec<(String, String)>) {
        let home = opts.home.display().to_string();
        match &self.backend {
            Backend::Direct => (
                opts.binary.clone(),
                vec!["start".into(), "--home".into(), home],
                Vec::new(),
            ),
            Backend::Cosmovisor { wrapper } => (
                wrapper.clone(),
                vec!["run".into(), "start".into(), "--home".into(), home],
                cosmovisor::environment(&self.layout, &config::binary_name(&opts.binary)),
            ),
        }
    }

    /// Starts the node and returns its PID. A live PID file makes this a
    /// no-op that returns the existing PID.
    pub async fn start(&self, opts: &StartOptions) -> Result<u32, SupervisorError> {
        if let Some(pid) = self.pid() {
            tracing::info!(pid, "node already running");
            return Ok(pid);
        }
        self.check_preconditions(opts)?;

        if matches!(self.backend, Backend::Cosmovisor { .. }) {
            cosmovisor::init_layout(&self.layout, &opts.binary).map_err(SupervisorError::Layout)?;
        }

        let log_path = self.log_path();
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(SupervisorError::io(format!("open {}", log_path.display())))?;
        let log_err = log
            .try_clone()
            .map_err(SupervisorError::io("duplicate log handle"))?;

        let (program, args, env) = self.spawn_spec(opts);
        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        detach(&mut cmd);
        apply_library_path(&mut cmd, &opts.binary, &self.layout);

        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            program: program.display().to_string(),
            source,
        })?;
        let pid = child.id();
        pidfile::write_pid(&self.pid_path(), pid)
            .map_err(SupervisorError::io("write PID file"))?;
        tracing::info!(
            pid,
            backend = self.backend.label(),
            moniker = %opts.moniker,
            log = %log_path.display(),
            "node started"
        );

        let deadline = tokio::time::Instant::now() + STARTUP_WATCH;
        while tokio::time::Instant::now() < deadline {
            if let Ok(Some(status)) = child.try_wait() {
                let _ = pidfile::remove_pid(&self.pid_path());
                return Err(SupervisorError::ExitedEarly {
                    code: status.code(),
                    log_tail: logs::tail_lines_or_empty(&log_path, 10),
                    log_path,
                });
            }
            tokio::time::sleep(POLL).await;
        }

        Ok(pid)
    }

    /// Stops the node: SIGTERM, then SIGKILL after the grace period.
    /// Succeeds when nothing is running.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        let pid_path = self.pid_path();
        let Some(pid) = pidfile::read_pid(&pid_path) else {
            return Ok(());
        };
        if !pidfile::is_alive(pid) {
            tracing::debug!(pid, "removing stale PID file");
            return pidfile::remove_pid(&pid_path).map_err(SupervisorError::io("remove PID file"));
        }

        tracing::info!(pid, "stopping node");
        pidfile::send_signal(pid, libc::SIGTERM);
        if !wait_for_exit(pid, self.grace).await {
            tracing::warn!(pid, grace = ?self.grace, "node ignored SIGTERM, sending SIGKILL");
            pidfile::send_signal(pid, libc::SIGKILL);
            if !wait_for_exit(pid, KILL_WAIT).await {
                return Err(SupervisorError::StopFailed { pid });
            }
        }

        pidfile::remove_pid(&pid_path).map_err(SupervisorError::io("remove PID file"))
    }

    /// Stop then start; a failed stop aborts the restart.
    pub async fn restart(&self, opts: &StartOptions) -> Result<u32, SupervisorError> {
        self.stop().await?;
        self.start(opts).await
    }
}

async fn wait_for_exit(pid: u32, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if !pidfile::is_alive(pid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL).await;
    }
}

/// New process group so terminal signals aimed at the CLI do not reach the node.
#[cfg(unix)]
fn detach(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn detach(_cmd: &mut Command) {}

#[cfg(target_os = "macos")]
fn apply_library_path(cmd: &mut Command, binary: &Path, layout: &HomeLayout) {
    let dirs = crate::exec::process::library_dirs(binary, layout);
    if let Some(joined) = crate::exec::process::join_paths(&dirs) {
        cmd.env("DYLD_LIBRARY_PATH", joined);
    }
}

#[cfg(not(target_os = "macos"))]
fn apply_library_path(_cmd: &mut Command, _binary: &Path, _layout: &HomeLayout) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn free_port() -> u16 {
        TcpListener::bind(("0.0.0.0", 0))
            .expect("bind ephemeral")
            .local_addr()
            .expect("addr")
            .port()
    }

    struct Fixture {
        _tmp: TempDir,
        opts: StartOptions,
        supervisor: Supervisor,
    }

    fn fixture(script: &str) -> Fixture {
        let tmp = TempDir::new().expect("create temp dir");
        let home = tmp.path().join("home");
        let layout = HomeLayout::new(&home);
        std::fs::create_dir_all(layout.config_dir()).expect("mkdir config");
        std::fs::write(layout.genesis_file(), "{}").expect("write genesis");
        std::fs::write(layout.validator_key_file(), "{}").expect("write key");
        std::fs::write(layout.node_key_file(), "{}").expect("write node key");

        let binary = tmp.path().join("pchaind");
        std::fs::write(&binary, format!("#!/bin/sh\n{script}\n")).expect("write script");
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755))
            .expect("chmod script");

        let supervisor = Supervisor::new(&home, Backend::Direct)
            .with_ports(free_port(), free_port())
            .with_grace(Duration::from_secs(2));
        Fixture {
            _tmp: tmp,
            opts: StartOptions {
                home,
                moniker: "test".into(),
                binary,
            },
            supervisor,
        }
    }

    #[tokio::test]
    async fn start_stop_lifecycle() {
        let fx = fixture("exec sleep 30");
        let sup = &fx.supervisor;

        assert!(!sup.is_running());
        let pid = sup.start(&fx.opts).await.expect("start");
        assert!(sup.is_running());
        assert_eq!(sup.pid(), Some(pid));

        // Second start is a no-op returning the same PID.
        assert_eq!(sup.start(&fx.opts).await.expect("second start"), pid);

        sup.stop().await.expect("stop");
        assert!(!sup.is_running());
        assert!(!sup.pid_path().exists());

        // Stop without a PID file succeeds.
        sup.stop().await.expect("idempotent stop");
    }

    #[tokio::test]
    async fn restart_replaces_the_process() {
        let fx = fixture("exec sleep 30");
        let sup = &fx.supervisor;

        let first = sup.start(&fx.opts).await.expect("start");
        let second = sup.restart(&fx.opts).await.expect("restart");
        assert_ne!(first, second);
        assert!(!pidfile::is_alive(first));
        sup.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn sigterm_ignoring_process_is_killed() {
        let fx = fixture("trap '' TERM; while true; do sleep 1; done");
        let sup = fx.supervisor.clone().with_grace(Duration::from_millis(300));

        sup.start(&fx.opts).await.expect("start");
        sup.stop().await.expect("stop escalates to SIGKILL");
        assert!(!sup.is_running());
    }

    #[tokio::test]
    async fn immediate_exit_is_reported_with_log_tail() {
        let fx = fixture("echo 'panic: bad genesis' >&2; exit 2");
        let err = fx.supervisor.start(&fx.opts).await.expect_err("start fails");
        match err {
            SupervisorError::ExitedEarly { code, log_tail, .. } => {
                assert_eq!(code, Some(2));
                assert!(log_tail.iter().any(|l| l.contains("bad genesis")));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!fx.supervisor.pid_path().exists());
    }

    #[tokio::test]
    async fn stale_pid_file_is_cleared_by_stop() {
        let fx = fixture("exec sleep 30");
        let mut child = std::process::Command::new("true").spawn().expect("spawn");
        let dead = child.id();
        child.wait().expect("wait");
        pidfile::write_pid(&fx.supervisor.pid_path(), dead).expect("write stale pid");

        assert!(!fx.supervisor.is_running());
        fx.supervisor.stop().await.expect("stop clears stale file");
        assert!(!fx.supervisor.pid_path().exists());
    }

    #[test]
    fn preconditions_have_distinct_errors() {
        let fx = fixture("exit 0");
        let layout = HomeLayout::new(&fx.opts.home);

        std::fs::remove_file(layout.node_key_file()).expect("remove node key");
        assert!(matches!(
            fx.supervisor.check_preconditions(&fx.opts),
            Err(SupervisorError::KeysMissing(_))
        ));

        std::fs::remove_file(layout.genesis_file()).expect("remove genesis");
        assert!(matches!(
            fx.supervisor.check_preconditions(&fx.opts),
            Err(SupervisorError::GenesisMissing(_))
        ));

        let missing = StartOptions {
            home: fx.opts.home.join("nope"),
            ..fx.opts.clone()
        };
        assert!(matches!(
            fx.supervisor.check_preconditions(&missing),
            Err(SupervisorError::HomeMissing(_))
        ));
    }

    #[test]
    fn busy_port_blocks_start() {
        let fx = fixture("exit 0");
        let listener = TcpListener::bind(("0.0.0.0", 0)).expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let sup = fx.supervisor.clone().with_ports(port, free_port());

        let err = sup.check_preconditions(&fx.opts).expect_err("port busy");
        assert!(matches!(err, SupervisorError::PortInUse { port: p } if p == port));
        assert_eq!(err.kind(), ErrorKind::Precondition);
    }

    #[test]
    fn backends_differ_in_argv_and_file_names() {
        let opts = StartOptions {
            home: PathBuf::from("/h"),
            moniker: "m".into(),
            binary: PathBuf::from("/bin/pchaind"),
        };

        let direct = Supervisor::new("/h", Backend::Direct);
        let (program, args, env) = direct.spawn_spec(&opts);
        assert_eq!(program, PathBuf::from("/bin/pchaind"));
        assert_eq!(args, vec!["start", "--home", "/h"]);
        assert!(env.is_empty());
        assert_eq!(direct.pid_path(), PathBuf::from("/h/pchaind.pid"));

        let wrapped = Supervisor::new(
            "/h",
            Backend::Cosmovisor {
                wrapper: PathBuf::from("/usr/bin/cosmovisor"),
            },
        );
        let (program, args, env) = wrapped.spawn_spec(&opts);
        assert_eq!(program, PathBuf::from("/usr/bin/cosmovisor"));
        assert_eq!(args, vec!["run", "start", "--home", "/h"]);
        assert!(env.iter().any(|(k, v)| k == "DAEMON_NAME" && v == "pchaind"));
        assert_eq!(wrapped.log_path(), PathBuf::from("/h/cosmovisor.log"));
    }
}
