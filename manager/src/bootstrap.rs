//! First-time node home bootstrap.
//!
//! Steps run strictly in order and each reports a progress line:
//!
//! 1. `<node> init` when `config/` is absent,
//! 2. genesis from `https://<domain>/genesis`, checked for the chain id,
//! 3. `config.toml` patched with persistent peers from the remote `net_info`,
//! 4. snapshot download and extraction into `data/`,
//! 5. zero anti-double-sign state when missing.
//!
//! Re-running on a populated home is a no-op apart from steps the operator
//! asks to refresh. Validator keys are never touched.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use serde_json::value::RawValue;
use thiserror::Error;

use crate::config::remote_url_for;
use crate::error::{Classify, ErrorKind, Remediation};
use crate::exec::{self, CommandRunner, ExecError};
use crate::home::HomeLayout;
use crate::rpc::NodeRpc;
use crate::snapshot::{self, DownloadOptions, ExtractOptions, ProgressFn, SnapshotEngine, SnapshotError};

const GENESIS_TIMEOUT: Duration = Duration::from_secs(30);

pub type StepFn = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone)]
pub struct InitOptions {
    pub home_dir: PathBuf,
    pub chain_id: String,
    pub moniker: String,
    pub genesis_domain: String,
    pub node_bin_path: PathBuf,
    pub snapshot_url: String,
    pub skip_snapshot: bool,
    /// Re-fetch genesis even when a matching file exists.
    pub refresh_genesis: bool,
    /// Re-download and re-extract even when a snapshot was extracted before.
    pub refresh_snapshot: bool,
    pub progress: StepFn,
    pub snapshot_progress: ProgressFn,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("node init failed: {0}")]
    NodeInit(#[source] ExecError),
    #[error("failed to fetch genesis from {url}: {message}")]
    GenesisFetch { url: String, message: String },
    #[error("genesis from {url} is not a valid genesis document: {message}")]
    GenesisInvalid { url: String, message: String },
    #[error("genesis chain id is {found:?}, expected {expected:?}")]
    ChainIdMismatch { expected: String, found: String },
    #[error("patched {} is not valid TOML: {message}", path.display())]
    ConfigInvalid { path: PathBuf, message: String },
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl BootstrapError {
    fn io(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> Self {
        let context = context.into();
        move |source| BootstrapError::Io { context, source }
    }
}

impl Classify for BootstrapError {
    fn kind(&self) -> ErrorKind {
        match self {
            BootstrapError::NodeInit(e) => e.kind(),
            BootstrapError::GenesisFetch { .. } => ErrorKind::Network,
            BootstrapError::GenesisInvalid { .. } => ErrorKind::Protocol,
            BootstrapError::ChainIdMismatch { .. } => ErrorKind::Precondition,
            BootstrapError::ConfigInvalid { .. } | BootstrapError::Io { .. } => ErrorKind::Internal,
            BootstrapError::Snapshot(e) => e.kind(),
        }
    }

    fn remediation(&self) -> Remediation {
        match self {
            BootstrapError::NodeInit(e) => e.remediation(),
            BootstrapError::Snapshot(e) => e.remediation(),
            BootstrapError::ChainIdMismatch { .. } => Remediation::new(self.to_string())
                .cause("GENESIS_DOMAIN points at a different network than CHAIN_ID")
                .action("check GENESIS_DOMAIN and CHAIN_ID"),
            BootstrapError::GenesisFetch { .. } => Remediation::new(self.to_string())
                .cause("the genesis domain is unreachable")
                .action("push-validator doctor"),
            _ => Remediation::new(self.to_string()),
        }
    }
}

/// Composes node init, genesis, config patching and the snapshot engine.
pub struct Bootstrap<'a, R, P> {
    runner: &'a R,
    remote: &'a P,
    snapshots: &'a SnapshotEngine,
    http: reqwest::Client,
}

impl<'a, R, P> Bootstrap<'a, R, P>
where
    R: CommandRunner,
    P: NodeRpc,
{
    /// `remote` must point at the network's public RPC; its peers seed
    /// `persistent_peers`.
    pub fn new(runner: &'a R, remote: &'a P, snapshots: &'a SnapshotEngine) -> Self {
        Self {
            runner,
            remote,
            snapshots,
            http: reqwest::Client::new(),
        }
    }

    pub async fn init(&self, opts: &InitOptions) -> Result<(), BootstrapError> {
        let layout = HomeLayout::new(&opts.home_dir);
        let step = |msg: &str| {
            tracing::info!(step = msg, "bootstrap");
            (opts.progress)(msg);
        };

        step("initializing node home");
        let fresh = if layout.config_dir().is_dir() {
            false
        } else {
            self.node_init(opts).await?;
            true
        };

        step("fetching genesis");
        let existing = existing_chain_id(&layout.genesis_file());
        if fresh || opts.refresh_genesis || existing.as_deref() != Some(opts.chain_id.as_str()) {
            self.fetch_genesis(opts, &layout).await?;
        } else {
            tracing::debug!("genesis already present");
        }

        step("configuring peers");
        match self.remote.peers().await {
            Ok(peers) if !peers.is_empty() => {
                let list: Vec<String> = peers.iter().map(|p| p.to_persistent()).collect();
                patch_config(&layout.config_toml(), &list.join(","))?;
            }
            Ok(_) => {
                tracing::warn!("remote reported no peers, leaving persistent_peers unchanged");
                patch_config(&layout.config_toml(), "")?;
            }
            Err(err) => {
                tracing::warn!(%err, "could not read remote peers, leaving persistent_peers unchanged");
                patch_config(&layout.config_toml(), "")?;
            }
        }

        if opts.skip_snapshot {
            step("skipping snapshot");
        } else if snapshot::is_present(&opts.home_dir) && !opts.refresh_snapshot {
            step("snapshot already extracted");
        } else {
            step("downloading snapshot");
            let mut download = DownloadOptions::new(&opts.snapshot_url, &opts.home_dir);
            download.progress = opts.snapshot_progress.clone();
            download.no_cache = opts.refresh_snapshot;
            self.snapshots.download(&download).await?;

            step("extracting snapshot");
            let mut extract = ExtractOptions::new(&opts.home_dir);
            extract.progress = opts.snapshot_progress.clone();
            self.snapshots.extract(&extract).await?;
        }

        step("writing validator state");
        if layout
            .ensure_validator_state()
            .map_err(BootstrapError::io("write validator state"))?
        {
            tracing::info!(path = %layout.validator_state_file().display(), "created empty validator state");
        }
        Ok(())
    }

    async fn node_init(&self, opts: &InitOptions) -> Result<(), BootstrapError> {
        let args = exec::args([
            "init".to_string(),
            opts.moniker.clone(),
            "--chain-id".to_string(),
            opts.chain_id.clone(),
            "--home".to_string(),
            opts.home_dir.display().to_string(),
        ]);
        self.runner
            .run(&opts.node_bin_path, &args)
            .await
            .map_err(BootstrapError::NodeInit)?;
        Ok(())
    }

    async fn fetch_genesis(&self, opts: &InitOptions, layout: &HomeLayout) -> Result<(), BootstrapError> {
        let url = format!("{}/genesis", remote_url_for(&opts.genesis_domain));
        let fetch = |message: String| BootstrapError::GenesisFetch {
            url: url.clone(),
            message,
        };
        let body = self
            .http
            .get(&url)
            .timeout(GENESIS_TIMEOUT)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| fetch(e.to_string()))?
            .bytes()
            .await
            .map_err(|e| fetch(e.to_string()))?;

        let genesis = parse_genesis(&body).map_err(|message| BootstrapError::GenesisInvalid {
            url: url.clone(),
            message,
        })?;
        if genesis.chain_id != opts.chain_id {
            return Err(BootstrapError::ChainIdMismatch {
                expected: opts.chain_id.clone(),
                found: genesis.chain_id,
            });
        }

        write_atomic(&layout.genesis_file(), genesis.raw)?;
        tracing::info!(chain_id = %opts.chain_id, path = %layout.genesis_file().display(), "genesis written");
        Ok(())
    }
}

/// Genesis document as served, without re-encoding; its hash must match
/// the one recorded in chain state.
struct Genesis<'a> {
    chain_id: String,
    raw: &'a [u8],
}

#[derive(Deserialize)]
struct GenesisEnvelope<'a> {
    #[serde(borrow)]
    result: GenesisResult<'a>,
}

#[derive(Deserialize)]
struct GenesisResult<'a> {
    #[serde(borrow)]
    genesis: &'a RawValue,
}

/// Genesis from either a JSON-RPC `/genesis` envelope (`result.genesis`)
/// or a bare document.
fn parse_genesis(body: &[u8]) -> Result<Genesis<'_>, String> {
    let value: Value = serde_json::from_slice(body).map_err(|e| e.to_string())?;
    if let Some(err) = value.get("error") {
        return Err(format!("rpc error: {err}"));
    }
    let (doc, raw) = match value.pointer("/result/genesis") {
        Some(doc) => {
            let envelope: GenesisEnvelope<'_> =
                serde_json::from_slice(body).map_err(|e| e.to_string())?;
            (doc, envelope.result.genesis.get().as_bytes())
        }
        None => (&value, body),
    };
    let chain_id = doc
        .get("chain_id")
        .and_then(Value::as_str)
        .ok_or_else(|| "missing chain_id".to_string())?
        .to_string();
    Ok(Genesis { chain_id, raw })
}

fn existing_chain_id(path: &Path) -> Option<String> {
    let bytes = std::fs::read(path).ok()?;
    let value: Value = serde_json::from_slice(&bytes).ok()?;
    value.get("chain_id")?.as_str().map(str::to_string)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), BootstrapError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(BootstrapError::io(format!("create {}", parent.display())))?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes).map_err(BootstrapError::io(format!("write {}", tmp.display())))?;
    std::fs::rename(&tmp, path).map_err(BootstrapError::io(format!("rename into {}", path.display())))
}

/// Sets `persistent_peers` (when `peers` is non-empty) and `pex = true` in
/// the `[p2p]` table. Lines outside those keys are preserved byte for byte;
/// the file is rewritten only when something changed.
pub fn patch_config(path: &Path, peers: &str) -> Result<bool, BootstrapError> {
    let original = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(BootstrapError::io(format!("read {}", path.display()))(e)),
    };

    let mut wanted: Vec<(&str, String)> = vec![("pex", "true".to_string())];
    if !peers.is_empty() {
        wanted.push(("persistent_peers", format!("\"{peers}\"")));
    }
    let patched = set_table_keys(&original, "p2p", &wanted);

    if let Err(e) = patched.parse::<toml::Table>() {
        return Err(BootstrapError::ConfigInvalid {
            path: path.to_path_buf(),
            message: e.to_string(),
        });
    }
    if patched == original {
        return Ok(false);
    }
    write_atomic(path, patched.as_bytes())?;
    tracing::info!(path = %path.display(), "config.toml updated");
    Ok(true)
}

fn set_table_keys(text: &str, table: &str, wanted: &[(&str, String)]) -> String {
    let header = format!("[{table}]");
    let mut out: Vec<String> = Vec::new();
    let mut in_table = false;
    let mut seen_table = false;
    let mut done = vec![false; wanted.len()];

    let flush_missing = |out: &mut Vec<String>, done: &mut Vec<bool>| {
        for (i, (key, value)) in wanted.iter().enumerate() {
            if !done[i] {
                out.push(format!("{key} = {value}"));
                done[i] = true;
            }
        }
    };

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('[') {
            if in_table {
                flush_missing(&mut out, &mut done);
            }
            in_table = trimmed == header;
            seen_table |= in_table;
            out.push(line.to_string());
            continue;
        }
        if in_table {
            if let Some((key, _)) = trimmed.split_once('=') {
                let key = key.trim();
                if let Some(i) = wanted.iter().position(|(k, _)| *k == key) {
                    out.push(format!("{key} = {}", wanted[i].1));
                    done[i] = true;
                    continue;
                }
            }
        }
        out.push(line.to_string());
    }
    if in_table {
        flush_missing(&mut out, &mut done);
    } else if !seen_table {
        if !out.is_empty() {
            out.push(String::new());
        }
        out.push(header);
        flush_missing(&mut out, &mut done);
    }

    let mut joined = out.join("\n");
    joined.push('\n');
    joined
}
