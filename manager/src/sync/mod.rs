//! Sync monitor: watch local vs. remote height until caught up.
//!
//! Each tick queries local and remote `/status` concurrently, feeds the
//! local height into a sliding rate window, renders a progress line and
//! checks for a stall. The monitor ends when
//!
//! - the node is synced: `!catching_up` and `local >= remote - 5`
//!   (or the remote height is unknown),
//! - the token is cancelled,
//! - the local height has not strictly increased for `stuck_timeout`.
//!
//! [`SyncMonitor::run_with_retry`] wraps `run` with a bounded
//! reset-and-restart loop for the stall case.

mod progress;
mod window;

use std::future::Future;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::{RpcConfig, SyncConfig};
use crate::error::{Classify, ErrorKind, Remediation};
use crate::metrics::SyncMetrics;
use crate::rpc::NodeRpc;
use crate::supervisor::logs;

pub use progress::{ChainSnapshot, eta, group_digits, percent, render};
pub use window::RateWindow;

/// Blocks the local node may trail the remote and still count as synced.
pub const TOLERANCE: u64 = 5;

/// How often the peer count is refreshed.
const PEER_REFRESH: Duration = Duration::from_secs(5);

/// Sink for progress lines.
pub type Output = Arc<Mutex<dyn Write + Send>>;

/// Error surfaced by a failed reset hook; its classification is kept.
pub type ResetError = Box<dyn Classify + Send + Sync>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("sync stuck at height {height}: no progress for {stalled_for:?}")]
    Stuck {
        height: u64,
        remote_height: u64,
        stalled_for: Duration,
        log_tail: Vec<String>,
    },
    #[error("sync monitoring cancelled")]
    Cancelled,
    #[error("{0}")]
    Reset(ResetError),
}

impl Classify for SyncError {
    fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Stuck { .. } => ErrorKind::SyncStuck,
            SyncError::Cancelled => ErrorKind::Cancellation,
            SyncError::Reset(e) => e.kind(),
        }
    }

    fn remediation(&self) -> Remediation {
        match self {
            SyncError::Stuck { log_tail, .. } => {
                let mut r = Remediation::new(self.to_string())
                    .cause("the node has no useful peers")
                    .cause("the data directory is corrupt or from another network")
                    .action("push-validator logs --lines 100")
                    .action("push-validator reset && push-validator start");
                r.causes.extend(log_tail.iter().map(|l| format!("log: {l}")));
                r
            }
            SyncError::Reset(e) => e.remediation(),
            SyncError::Cancelled => Remediation::new(self.to_string()),
        }
    }
}

/// Monitor parameters.
#[derive(Clone)]
pub struct SyncOptions {
    /// Local RPC URL, for messages; the monitor's client already targets it.
    pub local_rpc: String,
    /// Remote RPC base URL passed to `remote_status`.
    pub remote_rpc: String,
    /// Supervisor log; its tail is attached to a stall error.
    pub log_path: Option<PathBuf>,
    pub window: usize,
    pub compact: bool,
    /// Progress sink; `None` discards progress lines.
    pub out: Option<Output>,
    pub interval: Duration,
    /// Deadline shared by the calls of one tick; capped at `interval`.
    pub rpc_deadline: Duration,
    pub quiet: bool,
    /// One line per tick instead of rewriting a single line.
    pub debug: bool,
    pub stuck_timeout: Duration,
    /// Pause after a reset so the node can bind its RPC port.
    pub retry_pause: Duration,
}

impl SyncOptions {
    pub fn from_config(sync: &SyncConfig, rpc: &RpcConfig) -> Self {
        Self {
            local_rpc: rpc.local_url.clone(),
            remote_rpc: rpc.remote_url(),
            log_path: None,
            window: sync.window,
            compact: false,
            out: None,
            interval: sync.interval,
            rpc_deadline: rpc.local_timeout,
            quiet: false,
            debug: false,
            stuck_timeout: sync.stuck_timeout,
            retry_pause: sync.retry_pause,
        }
    }
}

/// Outcome of a successful run.
#[derive(Clone, Debug, serde::Serialize)]
pub struct SyncReport {
    pub snapshot: ChainSnapshot,
    pub ticks: u64,
    #[serde(skip)]
    pub elapsed: Duration,
}

/// Tracks progress of one node through its [`NodeRpc`].
pub struct SyncMonitor<P> {
    rpc: P,
    cancel: CancellationToken,
    metrics: Option<SyncMetrics>,
}

impl<P: NodeRpc> SyncMonitor<P> {
    pub fn new(rpc: P, cancel: CancellationToken) -> Self {
        Self {
            rpc,
            cancel,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: SyncMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Ticks every `opts.interval` until synced, cancelled or stuck.
    pub async fn run(&self, opts: &SyncOptions) -> Result<SyncReport, SyncError> {
        let started = Instant::now();
        let mut window = RateWindow::new(opts.window);
        let mut best_pct: f64 = 0.0;
        let mut snap = ChainSnapshot::default();
        let mut last_height: Option<u64> = None;
        let mut last_change = started;
        let mut peers_at: Option<Instant> = None;
        let mut ticks: u64 = 0;
        let mut printer = Printer::new(opts);

        tracing::info!(local = %opts.local_rpc, remote = %opts.remote_rpc, "monitoring sync");

        let mut ticker = tokio::time::interval(opts.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    printer.finish();
                    return Err(SyncError::Cancelled);
                }
                _ = ticker.tick() => {}
            }
            ticks += 1;
            let deadline = opts.rpc_deadline.min(opts.interval);
            let want_peers = peers_at.is_none_or(|t| t.elapsed() >= PEER_REFRESH);

            let call_start = Instant::now();
            let (local, remote, peers) = tokio::join!(
                async {
                    let res = tokio::time::timeout(deadline, self.rpc.status()).await;
                    (res, call_start.elapsed())
                },
                tokio::time::timeout(deadline, self.rpc.remote_status(&opts.remote_rpc)),
                async {
                    if want_peers {
                        Some(tokio::time::timeout(deadline, self.rpc.peers()).await)
                    } else {
                        None
                    }
                },
            );
            let now = Instant::now();

            if let Ok(Ok(status)) = remote {
                if status.height > 0 {
                    snap.remote_height = status.height;
                }
            }
            if let Some(Ok(Ok(list))) = peers {
                snap.peers = list.len();
                peers_at = Some(now);
            }

            match local {
                (Ok(Ok(status)), latency) => {
                    snap.local_height = status.height;
                    snap.catching_up = status.catching_up;
                    snap.latency = latency;
                    window.push(now, status.height);
                    snap.rate = window.rate();

                    if last_height.is_none_or(|h| status.height > h) {
                        last_height = Some(status.height);
                        last_change = now;
                    }

                    let synced = !snap.catching_up
                        && (snap.remote_height == 0
                            || snap.local_height + TOLERANCE >= snap.remote_height);
                    let pct = if synced {
                        100.0
                    } else {
                        percent(snap.local_height, snap.remote_height)
                    };
                    best_pct = best_pct.max(pct);
                    self.record(&snap);

                    if !opts.quiet {
                        printer.line(&render(&snap, best_pct, opts.compact));
                    }
                    if opts.debug {
                        tracing::debug!(
                            local = snap.local_height,
                            remote = snap.remote_height,
                            catching_up = snap.catching_up,
                            rate = snap.rate,
                            "sync tick"
                        );
                    }

                    if synced {
                        printer.finish();
                        tracing::info!(height = snap.local_height, "node is synced");
                        return Ok(SyncReport {
                            snapshot: snap,
                            ticks,
                            elapsed: started.elapsed(),
                        });
                    }
                }
                (Ok(Err(err)), _) => {
                    tracing::debug!(%err, "local status failed");
                    self.record_error();
                }
                (Err(_), _) => {
                    tracing::debug!(?deadline, "local status timed out");
                    self.record_error();
                }
            }

            let stalled_for = now.saturating_duration_since(last_change);
            if stalled_for > opts.stuck_timeout {
                printer.finish();
                let log_tail = opts
                    .log_path
                    .as_deref()
                    .map(|p| logs::tail_lines_or_empty(p, 20))
                    .unwrap_or_default();
                tracing::warn!(height = snap.local_height, ?stalled_for, "sync stuck");
                return Err(SyncError::Stuck {
                    height: snap.local_height,
                    remote_height: snap.remote_height,
                    stalled_for,
                    log_tail,
                });
            }
        }
    }

    /// Runs the monitor; on a stall calls `reset` and tries again, at most
    /// `max_retries` times. A failing reset is returned as is.
    pub async fn run_with_retry<F, Fut>(
        &self,
        opts: &SyncOptions,
        max_retries: u32,
        mut reset: F,
    ) -> Result<SyncReport, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), ResetError>>,
    {
        let mut resets = 0;
        loop {
            match self.run(opts).await {
                Err(SyncError::Stuck { height, .. }) if resets < max_retries => {
                    resets += 1;
                    tracing::warn!(height, attempt = resets, max_retries, "resetting stuck node");
                    if let Some(m) = &self.metrics {
                        m.resets.inc();
                    }
                    reset().await.map_err(SyncError::Reset)?;

                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(SyncError::Cancelled),
                        _ = tokio::time::sleep(opts.retry_pause) => {}
                    }
                }
                other => return other,
            }
        }
    }

    fn record(&self, snap: &ChainSnapshot) {
        if let Some(m) = &self.metrics {
            m.local_height.set(snap.local_height as i64);
            m.remote_height.set(snap.remote_height as i64);
            m.blocks_per_second.set(snap.rate);
            m.peers.set(snap.peers as i64);
        }
    }

    fn record_error(&self) {
        if let Some(m) = &self.metrics {
            m.status_errors.inc();
        }
    }
}

/// Rewrites a single terminal line, or appends lines in debug mode.
struct Printer {
    out: Option<Output>,
    newline_each: bool,
    last_len: usize,
    dirty: bool,
}

impl Printer {
    fn new(opts: &SyncOptions) -> Self {
        Self {
            out: if opts.quiet { None } else { opts.out.clone() },
            newline_each: opts.debug,
            last_len: 0,
            dirty: false,
        }
    }

    fn line(&mut self, text: &str) {
        let Some(out) = &self.out else { return };
        let Ok(mut w) = out.lock() else { return };
        let result = if self.newline_each {
            writeln!(w, "{text}")
        } else {
            let pad = self.last_len.saturating_sub(text.len());
            write!(w, "\r{text}{}", " ".repeat(pad))
        };
        let _ = result.and_then(|_| w.flush());
        self.last_len = text.len();
        self.dirty = !self.newline_each;
    }

    fn finish(&mut self) {
        if !self.dirty {
            return;
        }
        if let Some(out) = &self.out {
            if let Ok(mut w) = out.lock() {
                let _ = writeln!(w);
            }
        }
        self.dirty = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{AbciQueryResponse, NodeStatus, Peer, RpcError};
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

    /// Scripted node: constant height until `advancing` is set, then one
    /// block per call until it reaches the remote.
    struct ReplayNode {
        height: AtomicU64,
        remote: u64,
        advancing: AtomicBool,
        step: u64,
    }

    impl ReplayNode {
        fn stuck_at(height: u64, remote: u64) -> Arc<Self> {
            Arc::new(Self {
                height: AtomicU64::new(height),
                remote,
                advancing: AtomicBool::new(false),
                step: 1,
            })
        }
    }

    impl NodeRpc for Arc<ReplayNode> {
        async fn status(&self) -> Result<NodeStatus, RpcError> {
            let height = if self.advancing.load(Ordering::SeqCst) {
                let next = (self.height.load(Ordering::SeqCst) + self.step).min(self.remote);
                self.height.store(next, Ordering::SeqCst);
                next
            } else {
                self.height.load(Ordering::SeqCst)
            };
            Ok(NodeStatus {
                height,
                catching_up: height < self.remote,
                ..NodeStatus::default()
            })
        }

        async fn peers(&self) -> Result<Vec<Peer>, RpcError> {
            Ok(vec![Peer {
                id: "p".into(),
                address: "1.2.3.4:26656".into(),
            }])
        }

        async fn remote_status(&self, _base_url: &str) -> Result<NodeStatus, RpcError> {
            Ok(NodeStatus {
                height: self.remote,
                ..NodeStatus::default()
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

    fn options(stuck: Duration) -> SyncOptions {
        SyncOptions {
            local_rpc: "http://127.0.0.1:26657".into(),
            remote_rpc: "https://remote".into(),
            log_path: None,
            window: 30,
            compact: true,
            out: None,
            interval: Duration::from_millis(120),
            rpc_deadline: Duration::from_secs(2),
            quiet: true,
            debug: false,
            stuck_timeout: stuck,
            retry_pause: Duration::from_secs(3),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn returns_once_within_tolerance() {
        let node = ReplayNode::stuck_at(596, 600);
        node.advancing.store(true, Ordering::SeqCst);
        let monitor = SyncMonitor::new(node.clone(), CancellationToken::new());

        let report = monitor.run(&options(Duration::from_secs(5))).await.expect("synced");
        assert!(report.snapshot.local_height + TOLERANCE >= 600);
        assert!(!report.snapshot.catching_up);
    }

    #[tokio::test(start_paused = true)]
    async fn constant_height_is_reported_stuck_within_one_tick() {
        let node = ReplayNode::stuck_at(500, 10_000);
        let monitor = SyncMonitor::new(node, CancellationToken::new());
        let opts = options(Duration::from_secs(5));

        let started = Instant::now();
        let err = monitor.run(&opts).await.expect_err("stuck");
        let elapsed = started.elapsed();

        match err {
            SyncError::Stuck { height, remote_height, .. } => {
                assert_eq!(height, 500);
                assert_eq!(remote_height, 10_000);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(elapsed > opts.stuck_timeout);
        assert!(elapsed <= opts.stuck_timeout + 2 * opts.interval);
    }

    /// Local `/status` never answers; the remote does.
    struct SilentNode;

    impl NodeRpc for SilentNode {
        async fn status(&self) -> Result<NodeStatus, RpcError> {
            std::future::pending().await
        }

        async fn peers(&self) -> Result<Vec<Peer>, RpcError> {
            std::future::pending().await
        }

        async fn remote_status(&self, _base_url: &str) -> Result<NodeStatus, RpcError> {
            Ok(NodeStatus {
                height: 10_000,
                ..NodeStatus::default()
            })
        }

        async fn abci_query(
            &self,
            _path: &str,
            _data: &[u8],
        ) -> Result<AbciQueryResponse, RpcError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_local_status_is_reported_stuck_within_one_tick() {
        let monitor = SyncMonitor::new(SilentNode, CancellationToken::new());
        let opts = options(Duration::from_secs(5));

        let started = Instant::now();
        let err = monitor.run(&opts).await.expect_err("stuck");
        let elapsed = started.elapsed();

        assert!(matches!(err, SyncError::Stuck { remote_height: 10_000, .. }), "{err:?}");
        assert!(elapsed > opts.stuck_timeout);
        assert!(elapsed <= opts.stuck_timeout + opts.interval, "took {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_then_reset_then_synced() {
        let node = ReplayNode::stuck_at(500, 2_000);
        let monitor = SyncMonitor::new(node.clone(), CancellationToken::new());
        let resets = AtomicUsize::new(0);

        let report = monitor
            .run_with_retry(&options(Duration::from_secs(5)), 1, || {
                resets.fetch_add(1, Ordering::SeqCst);
                node.advancing.store(true, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await
            .expect("recovers after one reset");

        assert_eq!(resets.load(Ordering::SeqCst), 1);
        assert!(report.snapshot.local_height + TOLERANCE >= 2_000);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_budget_is_bounded() {
        let node = ReplayNode::stuck_at(500, 2_000);
        let monitor = SyncMonitor::new(node, CancellationToken::new());
        let resets = AtomicUsize::new(0);

        let err = monitor
            .run_with_retry(&options(Duration::from_secs(2)), 2, || {
                resets.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await
            .expect_err("still stuck");

        assert!(matches!(err, SyncError::Stuck { .. }));
        assert_eq!(err.kind(), ErrorKind::SyncStuck);
        assert_eq!(resets.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reset_is_surfaced() {
        let node = ReplayNode::stuck_at(500, 2_000);
        let monitor = SyncMonitor::new(node, CancellationToken::new());

        let err = monitor
            .run_with_retry(&options(Duration::from_secs(1)), 3, || async {
                let err: ResetError = Box::new(crate::exec::ExecError::NotFound {
                    program: "pchaind".into(),
                });
                Err(err)
            })
            .await
            .expect_err("reset failed");

        assert!(matches!(err, SyncError::Reset(_)));
        assert_eq!(err.kind(), ErrorKind::Precondition);
        assert_eq!(err.to_string(), "pchaind not found");
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_monitor() {
        let node = ReplayNode::stuck_at(500, 2_000);
        let cancel = CancellationToken::new();
        let monitor = SyncMonitor::new(node, cancel.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        });
        let err = monitor
            .run(&options(Duration::from_secs(60)))
            .await
            .expect_err("cancelled");
        canceller.await.expect("join");
        assert!(matches!(err, SyncError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn progress_percentage_never_decreases() {
        // Remote grows faster than local for a while; the rendered
        // percentage must still be monotone.
        struct Racing {
            tick: AtomicU64,
        }
        impl NodeRpc for Arc<Racing> {
            async fn status(&self) -> Result<NodeStatus, RpcError> {
                let t = self.tick.fetch_add(1, Ordering::SeqCst);
                Ok(NodeStatus {
                    height: 100 + t,
                    catching_up: t < 40,
                    ..NodeStatus::default()
                })
            }
            async fn peers(&self) -> Result<Vec<Peer>, RpcError> {
                Ok(Vec::new())
            }
            async fn remote_status(&self, _: &str) -> Result<NodeStatus, RpcError> {
                let t = self.tick.load(Ordering::SeqCst);
                Ok(NodeStatus {
                    height: 140 + if t < 20 { 3 * t } else { 60 },
                    ..NodeStatus::default()
                })
            }
            async fn abci_query(&self, _: &str, _: &[u8]) -> Result<AbciQueryResponse, RpcError> {
                Ok(AbciQueryResponse::default())
            }
        }

        let buf: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let mut opts = options(Duration::from_secs(60));
        opts.quiet = false;
        opts.debug = true;
        let out: Output = buf.clone();
        opts.out = Some(out);

        let node = Arc::new(Racing {
            tick: AtomicU64::new(0),
        });
        SyncMonitor::new(node, CancellationToken::new())
            .run(&opts)
            .await
            .expect("synced");

        let text = String::from_utf8(buf.lock().expect("lock").clone()).expect("utf8");
        let pcts: Vec<f64> = text
            .lines()
            .filter_map(|l| l.trim().split('%').next()?.trim().parse().ok())
            .collect();
        assert!(pcts.len() > 10);
        assert!(pcts.windows(2).all(|w| w[1] >= w[0]), "{pcts:?}");
        assert_eq!(pcts.last().copied(), Some(100.0));
    }
}
