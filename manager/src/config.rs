//! Top-level configuration for the validator manager.
//!
//! This module aggregates configuration for:
//!
//! - the node binary and its home directory (`NodeConfig`),
//! - local and remote JSON-RPC endpoints (`RpcConfig`),
//! - the snapshot source (`SnapshotConfig`),
//! - the sync monitor (`SyncConfig`),
//! - validator transaction defaults (`ValidatorDefaults`),
//! - the optional Prometheus exporter (`MetricsConfig`).
//!
//! Values are layered defaults → environment → command-line flags. The
//! binary applies the flag layer; [`ManagerConfig::from_env`] applies the
//! first two.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::home::HomeLayout;

pub const DEFAULT_BINARY_NAME: &str = "pchaind";
pub const WRAPPER_BINARY_NAME: &str = "cosmovisor";
pub const DEFAULT_HOME_DIR: &str = ".pchain";
pub const DEFAULT_P2P_PORT: u16 = 26656;
pub const DEFAULT_RPC_PORT: u16 = 26657;

/// Node binary and home directory.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Node home directory (`--home`).
    pub home: PathBuf,
    /// Explicit node binary; resolved lazily when `None`.
    pub binary: Option<PathBuf>,
    /// Moniker used by `init` and `register`.
    pub moniker: String,
    /// Chain id expected in the genesis file.
    pub chain_id: String,
    /// P2P listen port checked before start.
    pub p2p_port: u16,
    /// Local RPC port checked before start.
    pub rpc_port: u16,
    /// Grace period between SIGTERM and SIGKILL.
    pub stop_grace: Duration,
    /// Skip the upgrade wrapper even when it is available.
    pub disable_wrapper: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            home: default_home_dir(),
            binary: None,
            moniker: "push-validator".to_string(),
            chain_id: "push_42101-1".to_string(),
            p2p_port: DEFAULT_P2P_PORT,
            rpc_port: DEFAULT_RPC_PORT,
            stop_grace: Duration::from_secs(5),
            disable_wrapper: false,
        }
    }
}

impl NodeConfig {
    pub fn layout(&self) -> HomeLayout {
        HomeLayout::new(&self.home)
    }

    /// Resolves the node binary: explicit path, then the wrapper's genesis
    /// bin under the home directory, then `PATH`.
    pub fn resolve_binary(&self) -> Option<PathBuf> {
        if let Some(explicit) = &self.binary {
            return Some(explicit.clone());
        }
        let in_home = self.layout().wrapper_genesis_bin(DEFAULT_BINARY_NAME);
        if in_home.is_file() {
            return Some(in_home);
        }
        which::which(DEFAULT_BINARY_NAME).ok()
    }
}

/// JSON-RPC endpoints and per-call deadlines.
#[derive(Clone, Debug)]
pub struct RpcConfig {
    /// Local node RPC, e.g. `"http://127.0.0.1:26657"`.
    pub local_url: String,
    /// Domain serving genesis and the public RPC, e.g. `"donut.rpc.push.org"`.
    pub genesis_domain: String,
    /// Deadline for calls against the local node.
    pub local_timeout: Duration,
    /// Deadline for calls against the remote endpoint.
    pub remote_timeout: Duration,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            local_url: format!("http://127.0.0.1:{DEFAULT_RPC_PORT}"),
            genesis_domain: "donut.rpc.push.org".to_string(),
            local_timeout: Duration::from_secs(2),
            remote_timeout: Duration::from_secs(3),
        }
    }
}

impl RpcConfig {
    /// Remote endpoint derived from the genesis domain.
    pub fn remote_url(&self) -> String {
        remote_url_for(&self.genesis_domain)
    }
}

/// `https://<domain>` unless the domain already carries a scheme.
pub fn remote_url_for(domain: &str) -> String {
    if domain.starts_with("http://") || domain.starts_with("https://") {
        domain.trim_end_matches('/').to_string()
    } else {
        format!("https://{}", domain.trim_end_matches('/'))
    }
}

/// Snapshot source.
#[derive(Clone, Debug)]
pub struct SnapshotConfig {
    /// Archive URL; the checksum lives at the same URL plus `.sha256`.
    pub url: String,
    /// Deadline for fetching the small checksum file.
    pub checksum_timeout: Duration,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            url: "https://snapshots.donut.push.org/latest.tar.gz".to_string(),
            checksum_timeout: Duration::from_secs(15),
        }
    }
}

/// Sync monitor tuning.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub interval: Duration,
    pub window: usize,
    pub stuck_timeout: Duration,
    pub max_retries: u32,
    /// Pause between a reset and the next attempt so the node can bind RPC.
    pub retry_pause: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(120),
            window: 30,
            stuck_timeout: Duration::from_secs(120),
            max_retries: 2,
            retry_pause: Duration::from_secs(3),
        }
    }
}

/// Defaults for validator transactions.
#[derive(Clone, Debug)]
pub struct ValidatorDefaults {
    pub key_name: String,
    pub keyring_backend: String,
    pub denom: String,
    /// Self-bond in base units.
    pub stake_amount: String,
    /// Decimal fraction in `[0.01, 1.0]`.
    pub commission_rate: String,
    pub min_self_delegation: String,
    pub gas_prices: String,
    pub gas_adjustment: String,
}

impl Default for ValidatorDefaults {
    fn default() -> Self {
        Self {
            key_name: "validator-key".to_string(),
            keyring_backend: "test".to_string(),
            denom: "upc".to_string(),
            stake_amount: "1500000000000000000000".to_string(),
            commission_rate: "0.10".to_string(),
            min_self_delegation: "1".to_string(),
            gas_prices: "1000000000upc".to_string(),
            gas_adjustment: "1.3".to_string(),
        }
    }
}

/// Configuration for the Prometheus metrics exporter.
#[derive(Clone, Debug, Default)]
pub struct MetricsConfig {
    /// Address to serve `/metrics` on while syncing; disabled when `None`.
    pub listen_addr: Option<SocketAddr>,
}

/// Top-level configuration.
#[derive(Clone, Debug, Default)]
pub struct ManagerConfig {
    pub node: NodeConfig,
    pub rpc: RpcConfig,
    pub snapshot: SnapshotConfig,
    pub sync: SyncConfig,
    pub validator: ValidatorDefaults,
    pub metrics: MetricsConfig,
    pub no_color: bool,
}

impl ManagerConfig {
    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`; empty values are ignored.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut cfg = Self::default();

        if let Some(home) = get("HOME_DIR") {
            cfg.node.home = PathBuf::from(home);
        }
        if let Some(bin) = get("PCHAIND").or_else(|| get("PCHAIND_BIN")) {
            cfg.node.binary = Some(PathBuf::from(bin));
        }
        if let Some(moniker) = get("MONIKER") {
            cfg.node.moniker = moniker;
        }
        if let Some(chain_id) = get("CHAIN_ID") {
            cfg.node.chain_id = chain_id;
        }
        if let Some(flag) = get("PUSH_VALIDATOR_NO_COSMOVISOR") {
            cfg.node.disable_wrapper = is_truthy(&flag);
        }
        if let Some(domain) = get("GENESIS_DOMAIN") {
            cfg.rpc.genesis_domain = domain;
        }
        if let Some(url) = get("RPC_LOCAL") {
            cfg.rpc.local_url = url;
        }
        if let Some(url) = get("SNAPSHOT_URL") {
            cfg.snapshot.url = url;
        }
        if let Some(timeout) = get("PUSH_VALIDATOR_SYNC_STUCK_TIMEOUT") {
            match humantime::parse_duration(&timeout) {
                Ok(d) => cfg.sync.stuck_timeout = d,
                Err(err) => tracing::warn!(value = %timeout, %err, "ignoring invalid sync stuck timeout"),
            }
        }
        if let Some(key) = get("KEY_NAME") {
            cfg.validator.key_name = key;
        }
        if let Some(backend) = get("KEYRING_BACKEND") {
            cfg.validator.keyring_backend = backend;
        }
        if let Some(denom) = get("DENOM") {
            cfg.validator.denom = denom;
        }
        if let Some(amount) = get("STAKE_AMOUNT") {
            cfg.validator.stake_amount = amount;
        }
        if let Some(rate) = get("COMMISSION_RATE") {
            cfg.validator.commission_rate = rate;
        }
        if let Some(min) = get("MIN_SELF_DELEGATION") {
            cfg.validator.min_self_delegation = min;
        }
        if let Some(prices) = get("GAS_PRICES") {
            cfg.validator.gas_prices = prices;
        }
        cfg.no_color = lookup("NO_COLOR").is_some();

        cfg
    }
}

/// `~/.pchain`, or `./.pchain` when no home directory is known.
pub fn default_home_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DEFAULT_HOME_DIR)
}

/// File name of a binary path, falling back to the default node binary name.
pub fn binary_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| DEFAULT_BINARY_NAME.to_string())
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
