//! Snapshot engine: download, verify, cache and extract chain-data archives.
//!
//! An archive is identified by its SHA-256. The remote publishes the digest
//! next to the archive (`<url>.sha256`), and the cache records the digest of
//! every archive it holds (`snapshot-cache/<name>.sha256`). A cached archive
//! whose recorded digest equals the remote one is reused without touching
//! the network for the archive body.
//!
//! Progress events are emitted in order `Cache? -> Download? -> Verify ->
//! Extract`. The callback is invoked synchronously by the producer and must
//! not block.

mod download;
mod extract;
pub mod lock;

use std::fmt;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::SnapshotConfig;
use crate::error::{Classify, ErrorKind, Remediation};
use crate::home::HomeLayout;

pub use extract::MARKER_FILE;
pub use lock::CacheLock;

/// Extension of the checksum sibling, both remote and in the cache.
pub const CHECKSUM_SUFFIX: &str = ".sha256";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Snapshot pipeline phase.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Cache,
    Download,
    Verify,
    Extract,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Cache => "cache",
            Phase::Download => "download",
            Phase::Verify => "verify",
            Phase::Extract => "extract",
        })
    }
}

/// One progress event. `total` is 0 when unknown.
#[derive(Clone, Debug, Serialize)]
pub struct SnapshotProgress {
    pub phase: Phase,
    pub current: u64,
    pub total: u64,
    pub message: String,
}

impl SnapshotProgress {
    pub fn new(phase: Phase, current: u64, total: u64, message: impl Into<String>) -> Self {
        Self {
            phase,
            current,
            total,
            message: message.into(),
        }
    }
}

pub type ProgressFn = Arc<dyn Fn(&SnapshotProgress) + Send + Sync>;

/// Progress callback that ignores every event.
pub fn noop_progress() -> ProgressFn {
    Arc::new(|_| {})
}

/// Where an archive comes from and where its cached copy lives.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SnapshotDescriptor {
    pub source_url: String,
    pub checksum_url: String,
    pub archive_path: PathBuf,
    pub checksum_path: PathBuf,
}

impl SnapshotDescriptor {
    /// Derives the descriptor for `source_url` cached under `home`.
    pub fn new(source_url: &str, home: &HomeLayout) -> Result<Self, SnapshotError> {
        let name = archive_name(source_url).ok_or_else(|| SnapshotError::InvalidUrl {
            url: source_url.to_string(),
        })?;
        let cache = home.snapshot_cache_dir();
        Ok(Self {
            source_url: source_url.to_string(),
            checksum_url: format!("{source_url}{CHECKSUM_SUFFIX}"),
            archive_path: cache.join(&name),
            checksum_path: cache.join(format!("{name}{CHECKSUM_SUFFIX}")),
        })
    }

    /// Temp file the archive body streams into.
    pub fn part_path(&self) -> PathBuf {
        let mut name = self.archive_path.as_os_str().to_owned();
        name.push(".part");
        PathBuf::from(name)
    }

    /// Digest recorded for the cached archive, if both files exist.
    pub fn recorded_checksum(&self) -> Option<String> {
        if !self.archive_path.is_file() {
            return None;
        }
        let text = std::fs::read_to_string(&self.checksum_path).ok()?;
        parse_checksum(&text)
    }
}

/// Last path segment of `url`, without query or fragment.
fn archive_name(url: &str) -> Option<String> {
    let (scheme, rest) = url.split_once("://")?;
    if scheme != "http" && scheme != "https" {
        return None;
    }
    let path = rest.split(['?', '#']).next().unwrap_or(rest);
    let (_, path) = path.split_once('/')?;
    let name = path.rsplit('/').next()?;
    (!name.is_empty()).then(|| name.to_string())
}

/// First whitespace-separated token, lowercased, if it is 64 hex digits.
///
/// Accepts both a bare digest and `sha256sum` output (`<hex>  <file>`).
pub fn parse_checksum(text: &str) -> Option<String> {
    let token = text.split_whitespace().next()?.to_ascii_lowercase();
    (token.len() == 64 && token.bytes().all(|b| b.is_ascii_hexdigit())).then_some(token)
}

/// Hex SHA-256 of a file, read in 1 MiB blocks.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1 << 20];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot URL {url} does not name an archive")]
    InvalidUrl { url: String },
    #[error("failed to fetch {url}: {message}")]
    Http { url: String, message: String },
    #[error("checksum at {url} is not a SHA-256 hex digest: {body:?}")]
    BadChecksum { url: String, body: String },
    #[error("downloaded archive hashes to {actual}, remote checksum is {expected}")]
    Mismatch { expected: String, actual: String },
    #[error("cached archive {} is corrupt: hashes to {actual}, recorded {expected}", path.display())]
    CorruptCache {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    #[error("no verified archive in {}", dir.display())]
    NoCachedArchive { dir: PathBuf },
    #[error("archive entry {entry:?} escapes the target directory")]
    UnsafeEntry { entry: String },
    #[error("archive is truncated or malformed: {0}")]
    Archive(#[source] io::Error),
    #[error("another snapshot operation (pid {pid}) holds the cache lock")]
    Locked { pid: u32 },
    #[error("snapshot cache lock {} has no readable owner yet", path.display())]
    LockPending { path: PathBuf },
    #[error("snapshot operation cancelled")]
    Cancelled,
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl SnapshotError {
    pub(crate) fn io(context: impl Into<String>) -> impl FnOnce(io::Error) -> Self {
        let context = context.into();
        move |source| SnapshotError::Io { context, source }
    }
}

impl Classify for SnapshotError {
    fn kind(&self) -> ErrorKind {
        match self {
            SnapshotError::InvalidUrl { .. } => ErrorKind::Validation,
            SnapshotError::Http { .. } => ErrorKind::Network,
            SnapshotError::BadChecksum { .. } => ErrorKind::Protocol,
            SnapshotError::Mismatch { .. }
            | SnapshotError::CorruptCache { .. }
            | SnapshotError::UnsafeEntry { .. }
            | SnapshotError::Archive(_) => ErrorKind::Integrity,
            SnapshotError::NoCachedArchive { .. }
            | SnapshotError::Locked { .. }
            | SnapshotError::LockPending { .. } => ErrorKind::Precondition,
            SnapshotError::Cancelled => ErrorKind::Cancellation,
            SnapshotError::Io { .. } => ErrorKind::Internal,
        }
    }

    fn remediation(&self) -> Remediation {
        let base = Remediation::new(self.to_string());
        match self {
            SnapshotError::Mismatch { .. } => base
                .cause("the download was corrupted in transit")
                .cause("the snapshot was replaced while downloading")
                .action("push-validator snapshot download --no-cache"),
            SnapshotError::CorruptCache { .. } => base
                .cause("the cached archive was modified or truncated on disk")
                .action("push-validator snapshot download --no-cache"),
            SnapshotError::UnsafeEntry { .. } | SnapshotError::Archive(_) => base
                .cause("the archive is damaged or was not produced for this network")
                .action("push-validator reset")
                .action("push-validator snapshot download --no-cache"),
            SnapshotError::NoCachedArchive { .. } => {
                base.action("push-validator snapshot download")
            }
            SnapshotError::Locked { pid } => base
                .cause("a download or extraction is already running")
                .action(format!("wait for process {pid} to finish")),
            SnapshotError::LockPending { path } => base
                .cause("another snapshot operation is acquiring the lock")
                .cause("a crashed run left an empty lock file")
                .action("retry in a minute")
                .action(format!("remove {} if no snapshot operation is running", path.display())),
            SnapshotError::Http { .. } => base
                .cause("the snapshot host is unreachable")
                .action("check SNAPSHOT_URL and network connectivity"),
            _ => base,
        }
    }
}

/// Arguments to [`SnapshotEngine::download`].
#[derive(Clone)]
pub struct DownloadOptions {
    pub source_url: String,
    pub home_dir: PathBuf,
    pub progress: ProgressFn,
    pub no_cache: bool,
}

impl DownloadOptions {
    pub fn new(source_url: impl Into<String>, home_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_url: source_url.into(),
            home_dir: home_dir.into(),
            progress: noop_progress(),
            no_cache: false,
        }
    }
}

/// Arguments to [`SnapshotEngine::extract`].
#[derive(Clone)]
pub struct ExtractOptions {
    pub home_dir: PathBuf,
    pub target_dir: PathBuf,
    pub progress: ProgressFn,
}

impl ExtractOptions {
    /// Extraction into `<home>/data`.
    pub fn new(home_dir: impl Into<PathBuf>) -> Self {
        let home_dir = home_dir.into();
        Self {
            target_dir: HomeLayout::new(&home_dir).data_dir(),
            home_dir,
            progress: noop_progress(),
        }
    }
}

/// Downloads and extracts snapshots for one home directory at a time.
#[derive(Clone, Debug)]
pub struct SnapshotEngine {
    client: reqwest::Client,
    checksum_timeout: Duration,
    cancel: CancellationToken,
}

impl SnapshotEngine {
    pub fn new(cfg: &SnapshotConfig, cancel: CancellationToken) -> Result<Self, SnapshotError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| SnapshotError::Http {
                url: cfg.url.clone(),
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            checksum_timeout: cfg.checksum_timeout,
            cancel,
        })
    }

    /// Makes sure a verified copy of `opts.source_url` is in the cache.
    pub async fn download(&self, opts: &DownloadOptions) -> Result<(), SnapshotError> {
        let home = HomeLayout::new(&opts.home_dir);
        let desc = SnapshotDescriptor::new(&opts.source_url, &home)?;
        let _lock = CacheLock::acquire(&home.snapshot_cache_dir())?;
        download::run(self, &desc, opts).await
    }

    /// Verifies the newest cached archive and unpacks it into
    /// `opts.target_dir`, never overwriting an existing validator state file.
    pub async fn extract(&self, opts: &ExtractOptions) -> Result<(), SnapshotError> {
        let home = HomeLayout::new(&opts.home_dir);
        let _lock = CacheLock::acquire(&home.snapshot_cache_dir())?;
        extract::run(self, &home, opts).await
    }

    pub(crate) fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub(crate) fn checksum_timeout(&self) -> Duration {
        self.checksum_timeout
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// A previous extraction into `<home>/data` completed.
pub fn is_present(home_dir: &Path) -> bool {
    HomeLayout::new(home_dir).data_dir().join(MARKER_FILE).is_file()
}
