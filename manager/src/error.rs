//! Error taxonomy shared by every subsystem.
//!
//! Each subsystem defines its own `thiserror` enum (`RpcError`,
//! `SnapshotError`, ...). Those enums implement [`Classify`] so the binary
//! can pick an exit code, a rendering, and remediation hints without
//! matching on every concrete type:
//!
//! - [`ErrorKind`] is the coarse classification,
//! - [`Remediation`] is the problem/causes/actions block shown to operators,
//! - [`ExitStatus`] maps kinds onto process exit codes.

use std::fmt;

use serde::Serialize;

/// Coarse error classification used for exit codes and retry policy.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing files, ports in use, wrong directory.
    Precondition,
    /// Deadline, connection refused, DNS.
    Network,
    /// Malformed RPC or subprocess response.
    Protocol,
    /// Checksum mismatch, path-traversal entry, truncated archive.
    Integrity,
    /// Node binary exited non-zero.
    Subprocess,
    /// Chain state forbids the action (already registered, not jailed, ...).
    State,
    /// Invalid operator input (flags, mnemonic, amounts).
    Validation,
    /// User interrupt or parent cancellation.
    Cancellation,
    /// The monitor observed no height progress within the stuck timeout.
    SyncStuck,
    /// Bug.
    Internal,
}

impl ErrorKind {
    /// Stable lowercase label used in JSON/YAML error objects.
    pub fn label(self) -> &'static str {
        match self {
            ErrorKind::Precondition => "precondition",
            ErrorKind::Network => "network",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Subprocess => "subprocess",
            ErrorKind::State => "state",
            ErrorKind::Validation => "validation",
            ErrorKind::Cancellation => "cancellation",
            ErrorKind::SyncStuck => "sync_stuck",
            ErrorKind::Internal => "internal",
        }
    }

    /// Whether a command-scope caller may retry once.
    ///
    /// Only network failures qualify; integrity failures are never retried.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Network)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Process exit codes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExitStatus {
    Success,
    Generic,
    Validation,
    Precondition,
    SyncStuck,
    Integrity,
    Cancelled,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::Generic => 1,
            ExitStatus::Validation => 2,
            ExitStatus::Precondition => 3,
            ExitStatus::SyncStuck => 4,
            ExitStatus::Integrity => 5,
            ExitStatus::Cancelled => 130,
        }
    }
}

impl From<ErrorKind> for ExitStatus {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Validation => ExitStatus::Validation,
            ErrorKind::Precondition => ExitStatus::Precondition,
            ErrorKind::SyncStuck => ExitStatus::SyncStuck,
            ErrorKind::Integrity => ExitStatus::Integrity,
            ErrorKind::Cancellation => ExitStatus::Cancelled,
            ErrorKind::Network
            | ErrorKind::Protocol
            | ErrorKind::Subprocess
            | ErrorKind::State
            | ErrorKind::Internal => ExitStatus::Generic,
        }
    }
}

/// Structured message for operators: what broke, why, what to do next.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Remediation {
    pub problem: String,
    pub causes: Vec<String>,
    pub actions: Vec<String>,
}

impl Remediation {
    pub fn new(problem: impl Into<String>) -> Self {
        Self {
            problem: problem.into(),
            ..Self::default()
        }
    }

    pub fn cause(mut self, cause: impl Into<String>) -> Self {
        self.causes.push(cause.into());
        self
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.actions.push(action.into());
        self
    }
}

/// Implemented by every library error enum.
pub trait Classify: std::error::Error {
    fn kind(&self) -> ErrorKind;

    /// Operator-facing remediation. The default carries only the message.
    fn remediation(&self) -> Remediation {
        Remediation::new(self.to_string())
    }
}
