//! Manager library crate.
//!
//! Everything the `push-validator` binary does to a node lives here:
//!
//! - node JSON-RPC access (`rpc`),
//! - node-binary invocation behind a fakeable runner (`exec`),
//! - process supervision, direct or through the upgrade wrapper (`supervisor`),
//! - snapshot download, verification, caching and extraction (`snapshot`),
//! - first-time home bootstrap (`bootstrap`),
//! - sync monitoring with stall detection and recovery (`sync`),
//! - validator transactions and queries (`validator`),
//! - the post-start decision (`poststart`),
//! - data resets and preflight checks (`reset`, `doctor`),
//! - Prometheus metrics (`metrics`),
//! - and layered configuration plus the error taxonomy (`config`, `error`).
//!
//! The binary composes these behind its own command surface; every
//! subsystem takes its collaborators as generics so tests can swap in
//! fakes.

pub mod bootstrap;
pub mod config;
pub mod doctor;
pub mod error;
pub mod exec;
pub mod home;
pub mod metrics;
pub mod poststart;
pub mod reset;
pub mod rpc;
pub mod snapshot;
pub mod supervisor;
pub mod sync;
pub mod validator;

// Re-export configuration types.
pub use config::{
    ManagerConfig, MetricsConfig, NodeConfig, RpcConfig, SnapshotConfig, SyncConfig,
    ValidatorDefaults,
};

// Re-export the error taxonomy.
pub use error::{Classify, ErrorKind, ExitStatus, Remediation};

// Re-export the subsystem seams and their production implementations.
pub use exec::{CommandRunner, ExecError, ProcessRunner};
pub use home::HomeLayout;
pub use rpc::{
    AbciQueryResponse, HttpRpcClient, NodeRpc, NodeStatus, Peer, RpcError, retry_once,
};
pub use supervisor::{Backend, StartOptions, Supervisor, SupervisorError};

// Re-export the long-running engines.
pub use bootstrap::{Bootstrap, BootstrapError, InitOptions};
pub use snapshot::{
    DownloadOptions, ExtractOptions, Phase, SnapshotEngine, SnapshotError, SnapshotProgress,
};
pub use sync::{ChainSnapshot, SyncError, SyncMonitor, SyncOptions, SyncReport};

// Re-export validator management and the post-start flow.
pub use poststart::{PostStartDecision, decide};
pub use reset::{ResetError, ResetReport, full_reset, reset_data};
pub use validator::{ValidatorError, ValidatorFacade, ValidatorRecord};

// Re-export metrics registry and exporter.
pub use metrics::{MetricsRegistry, run_prometheus_http_server};
