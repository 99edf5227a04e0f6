//! Preflight checks for `push-validator doctor`.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::exec::{self, CommandRunner};
use crate::home::HomeLayout;
use crate::rpc::NodeRpc;
use crate::snapshot::CHECKSUM_SUFFIX;
use crate::supervisor::{cosmovisor, ports};

const LISTEN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

#[derive(Clone, Debug, Serialize)]
pub struct Check {
    pub name: &'static str,
    pub status: CheckStatus,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl Check {
    fn pass(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            status: CheckStatus::Pass,
            detail: detail.into(),
            hint: None,
        }
    }

    fn warn(name: &'static str, detail: impl Into<String>, hint: impl Into<String>) -> Self {
        Self {
            name,
            status: CheckStatus::Warn,
            detail: detail.into(),
            hint: Some(hint.into()),
        }
    }

    fn fail(name: &'static str, detail: impl Into<String>, hint: impl Into<String>) -> Self {
        Self {
            name,
            status: CheckStatus::Fail,
            detail: detail.into(),
            hint: Some(hint.into()),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct DoctorReport {
    pub checks: Vec<Check>,
}

impl DoctorReport {
    /// No check failed; warnings are allowed.
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.status != CheckStatus::Fail)
    }
}

/// What the checks run against.
#[derive(Clone, Debug)]
pub struct DoctorInput {
    pub layout: HomeLayout,
    pub binary: Option<PathBuf>,
    pub binary_name: String,
    pub chain_id: String,
    pub p2p_port: u16,
    pub rpc_port: u16,
    pub local_rpc_url: String,
    pub remote_rpc_url: String,
    /// The supervisor's PID file names a live process.
    pub node_running: bool,
}

pub async fn run<R, P>(input: &DoctorInput, runner: &R, rpc: &P) -> DoctorReport
where
    R: CommandRunner,
    P: NodeRpc,
{
    let mut checks = vec![check_home(&input.layout)];
    checks.push(check_binary(input, runner).await);
    checks.push(check_genesis(input));
    checks.push(check_keys(&input.layout));
    checks.extend(check_ports(input));
    checks.push(check_local_rpc(input, rpc).await);
    checks.push(check_remote_rpc(input, rpc).await);
    checks.push(check_wrapper(input));
    checks.push(check_snapshot_cache(&input.layout));

    for check in &checks {
        tracing::debug!(check = check.name, status = ?check.status, detail = %check.detail, "doctor check");
    }
    DoctorReport { checks }
}

fn check_home(layout: &HomeLayout) -> Check {
    if layout.config_dir().is_dir() {
        Check::pass("home", layout.root().display().to_string())
    } else {
        Check::fail(
            "home",
            format!("{} is not initialized", layout.root().display()),
            "push-validator init",
        )
    }
}

async fn check_binary<R: CommandRunner>(input: &DoctorInput, runner: &R) -> Check {
    let Some(binary) = &input.binary else {
        return Check::fail(
            "binary",
            format!("{} not found", input.binary_name),
            "install the node binary or pass --bin / set PCHAIND",
        );
    };
    match runner.run(binary, &exec::args(["version"])).await {
        Ok(out) => {
            let version = String::from_utf8_lossy(&out).trim().to_string();
            Check::pass("binary", format!("{} {version}", binary.display()))
        }
        Err(err) => Check::fail(
            "binary",
            err.to_string(),
            "check the binary is executable and built for this platform",
        ),
    }
}

fn check_genesis(input: &DoctorInput) -> Check {
    let path = input.layout.genesis_file();
    let Ok(body) = std::fs::read(&path) else {
        return Check::fail("genesis", "genesis.json missing", "push-validator init");
    };
    let chain_id = serde_json::from_slice::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("chain_id").and_then(|c| c.as_str()).map(str::to_string));
    match chain_id {
        Some(id) if id == input.chain_id => Check::pass("genesis", id),
        Some(id) => Check::fail(
            "genesis",
            format!("chain id {id} does not match {}", input.chain_id),
            "push-validator init --refresh-genesis",
        ),
        None => Check::fail(
            "genesis",
            "genesis.json is not valid JSON with a chain_id",
            "push-validator init --refresh-genesis",
        ),
    }
}

fn check_keys(layout: &HomeLayout) -> Check {
    if layout.has_validator_keys() {
        Check::pass("keys", "node and validator keys present")
    } else {
        Check::fail(
            "keys",
            "priv_validator_key.json or node_key.json missing",
            "restore your key files into config/ or run push-validator init on a fresh home",
        )
    }
}

/// Busy ports only matter while the node is down.
fn check_ports(input: &DoctorInput) -> Vec<Check> {
    [("p2p port", input.p2p_port), ("rpc port", input.rpc_port)]
        .into_iter()
        .map(|(name, port)| {
            if input.node_running || !ports::port_in_use(port) {
                Check::pass(name, port.to_string())
            } else {
                Check::fail(
                    name,
                    format!("port {port} is held by another process"),
                    format!("stop the other process (lsof -i :{port}) or change the port"),
                )
            }
        })
        .collect()
}

async fn check_local_rpc<P: NodeRpc>(input: &DoctorInput, rpc: &P) -> Check {
    if !input.node_running {
        return Check::warn("local rpc", "node is not running", "push-validator start");
    }
    let hostport = ports::hostport_from_url(&input.local_rpc_url);
    if !ports::is_rpc_listening(&hostport, LISTEN_TIMEOUT).await {
        return Check::warn(
            "local rpc",
            format!("nothing listening on {hostport} yet"),
            "the node may still be starting; push-validator logs",
        );
    }
    match rpc.status().await {
        Ok(status) => Check::pass(
            "local rpc",
            format!("height {} catching_up={}", status.height, status.catching_up),
        ),
        Err(err) => Check::fail("local rpc", err.to_string(), "push-validator logs --lines 50"),
    }
}

async fn check_remote_rpc<P: NodeRpc>(input: &DoctorInput, rpc: &P) -> Check {
    match rpc.remote_status(&input.remote_rpc_url).await {
        Ok(status) => Check::pass("remote rpc", format!("height {}", status.height)),
        Err(err) => Check::fail(
            "remote rpc",
            err.to_string(),
            "check outbound HTTPS and GENESIS_DOMAIN",
        ),
    }
}

fn check_wrapper(input: &DoctorInput) -> Check {
    match cosmovisor::detect(&input.layout, &input.binary_name) {
        Some(path) => Check::pass("upgrade wrapper", path.display().to_string()),
        None => Check::warn(
            "upgrade wrapper",
            "not available, the node runs without automatic upgrades",
            "install cosmovisor and re-run push-validator init",
        ),
    }
}

fn check_snapshot_cache(layout: &HomeLayout) -> Check {
    let dir = layout.snapshot_cache_dir();
    let Ok(entries) = std::fs::read_dir(&dir) else {
        return Check::pass("snapshot cache", "empty");
    };
    let mut archives = 0usize;
    let mut unverified = Vec::new();
    for entry in entries.filter_map(Result::ok) {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(CHECKSUM_SUFFIX) || name.ends_with(".part") || name.starts_with('.') {
            continue;
        }
        archives += 1;
        let recorded = dir.join(format!("{name}{CHECKSUM_SUFFIX}"));
        if !recorded.is_file() {
            unverified.push(name);
        }
    }
    if unverified.is_empty() {
        Check::pass("snapshot cache", format!("{archives} verified archive(s)"))
    } else {
        Check::warn(
            "snapshot cache",
            format!("no recorded checksum for {}", unverified.join(", ")),
            "push-validator snapshot download --no-cache",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::FakeRunner;
    use crate::rpc::{AbciQueryResponse, NodeStatus, Peer, RpcError};
    use std::fs;
    use tempfile::TempDir;

    struct StaticRpc;

    impl NodeRpc for StaticRpc {
        async fn status(&self) -> Result<NodeStatus, RpcError> {
            Ok(NodeStatus::default())
        }

        async fn peers(&self) -> Result<Vec<Peer>, RpcError> {
            Ok(Vec::new())
        }

        async fn remote_status(&self, base_url: &str) -> Result<NodeStatus, RpcError> {
            Err(RpcError::Network {
                url: base_url.to_string(),
                message: "unreachable".into(),
            })
        }

        async fn abci_query(
            &self,
            _path: &str,
            _data: &[u8],
        ) -> Result<AbciQueryResponse, RpcError> {
            Ok(AbciQueryResponse::default())
        }
    }

    fn input(tmp: &TempDir) -> DoctorInput {
        DoctorInput {
            layout: HomeLayout::new(tmp.path()),
            binary: Some(PathBuf::from("/opt/bin/pchaind")),
            binary_name: "pchaind".into(),
            chain_id: "push_42101-1".into(),
            p2p_port: 0,
            rpc_port: 0,
            local_rpc_url: "http://127.0.0.1:1".into(),
            remote_rpc_url: "https://rpc.example.org".into(),
            node_running: false,
        }
    }

    fn find<'a>(report: &'a DoctorReport, name: &str) -> &'a Check {
        report
            .checks
            .iter()
            .find(|c| c.name == name)
            .expect("check present")
    }

    #[tokio::test]
    async fn uninitialized_home_fails_with_hints() {
        let tmp = TempDir::new().expect("create temp dir");
        let runner = FakeRunner::new().respond("pchaind version", "v1.2.3\n");
        let report = run(&input(&tmp), &runner, &StaticRpc).await;

        assert!(!report.passed());
        assert_eq!(find(&report, "home").status, CheckStatus::Fail);
        assert_eq!(find(&report, "genesis").hint.as_deref(), Some("push-validator init"));
        assert_eq!(find(&report, "binary").detail, "/opt/bin/pchaind v1.2.3");
        assert_eq!(find(&report, "remote rpc").status, CheckStatus::Fail);
        assert_eq!(find(&report, "local rpc").status, CheckStatus::Warn);
    }

    #[tokio::test]
    async fn genesis_chain_id_is_compared() {
        let tmp = TempDir::new().expect("create temp dir");
        let layout = HomeLayout::new(tmp.path());
        fs::create_dir_all(layout.config_dir()).expect("mkdir");
        fs::write(layout.genesis_file(), r#"{"chain_id":"other-1"}"#).expect("write");

        let check = check_genesis(&input(&tmp));
        assert_eq!(check.status, CheckStatus::Fail);
        assert!(check.detail.contains("other-1"));

        fs::write(layout.genesis_file(), r#"{"chain_id":"push_42101-1"}"#).expect("write");
        assert_eq!(check_genesis(&input(&tmp)).status, CheckStatus::Pass);
    }

    #[test]
    fn unverified_cached_archive_warns() {
        let tmp = TempDir::new().expect("create temp dir");
        let layout = HomeLayout::new(tmp.path());
        fs::create_dir_all(layout.snapshot_cache_dir()).expect("mkdir");
        fs::write(layout.snapshot_cache_dir().join("a.tar.gz"), "x").expect("write");
        fs::write(layout.snapshot_cache_dir().join(".lock"), "1").expect("write");

        assert_eq!(check_snapshot_cache(&layout).status, CheckStatus::Warn);
        fs::write(layout.snapshot_cache_dir().join("a.tar.gz.sha256"), "ab\n").expect("write");
        assert_eq!(check_snapshot_cache(&layout).status, CheckStatus::Pass);
    }
}
