//! Node-binary invocation.
//!
//! Every subprocess call the manager makes (`init`, `keys`, `query`, `tx`,
//! `debug addr`, ...) goes through [`CommandRunner`]. This keeps the
//! validator façade and the bootstrap orchestrator testable: tests swap in
//! [`FakeRunner`], which answers from a map keyed by the joined command
//! line.

pub mod fake;
pub mod process;

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;

use crate::error::{Classify, ErrorKind, Remediation};

pub use fake::FakeRunner;
pub use process::ProcessRunner;

/// Errors from running a subprocess.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("{program} not found")]
    NotFound { program: String },
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    /// Non-zero exit; stderr is surfaced verbatim.
    #[error("{program} exited with {}: {}", .code.map(|c| c.to_string()).unwrap_or_else(|| "signal".into()), .stderr.trim())]
    Failed {
        program: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    #[error("{program} did not finish within {after:?}")]
    Timeout { program: String, after: Duration },
    #[error("{program} was cancelled")]
    Cancelled { program: String },
}

impl ExecError {
    /// stdout and stderr of a failed run, joined, for error classification.
    pub fn output_text(&self) -> String {
        match self {
            ExecError::Failed { stdout, stderr, .. } => format!("{stdout}\n{stderr}"),
            other => other.to_string(),
        }
    }
}

impl Classify for ExecError {
    fn kind(&self) -> ErrorKind {
        match self {
            ExecError::NotFound { .. } => ErrorKind::Precondition,
            ExecError::Spawn { .. } | ExecError::Failed { .. } => ErrorKind::Subprocess,
            ExecError::Timeout { .. } => ErrorKind::Network,
            ExecError::Cancelled { .. } => ErrorKind::Cancellation,
        }
    }

    fn remediation(&self) -> Remediation {
        let base = Remediation::new(self.to_string());
        match self {
            ExecError::NotFound { .. } => base
                .cause("the node binary is not installed or not on PATH")
                .action("pass --bin <path> or set PCHAIND"),
            ExecError::Failed { .. } => base
                .cause("the node binary rejected the command")
                .action("re-run with --debug to see the full invocation"),
            _ => base,
        }
    }
}

/// Runs a program to completion and returns its stdout.
pub trait CommandRunner: Send + Sync {
    fn run(
        &self,
        program: &Path,
        args: &[String],
    ) -> impl Future<Output = Result<Vec<u8>, ExecError>> + Send;

    /// Like [`CommandRunner::run`] but writes `input` to the child's stdin.
    fn run_with_input(
        &self,
        program: &Path,
        args: &[String],
        input: &str,
    ) -> impl Future<Output = Result<Vec<u8>, ExecError>> + Send;
}

/// `program args...` with the program reduced to its file name. This is
/// the key [`FakeRunner`] matches on and the form logged at debug level.
pub fn command_line(program: &Path, args: &[String]) -> String {
    let name = program
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.display().to_string());
    let mut line = name;
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// Converts string literals into an owned argument vector.
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn command_line_uses_file_name() {
        let line = command_line(
            &PathBuf::from("/opt/bin/pchaind"),
            &args(["keys", "show", "k"]),
        );
        assert_eq!(line, "pchaind keys show k");
    }

    #[test]
    fn failed_error_renders_stderr() {
        let err = ExecError::Failed {
            program: "pchaind".into(),
            code: Some(1),
            stdout: String::new(),
            stderr: "key not found\n".into(),
        };
        assert_eq!(err.to_string(), "pchaind exited with 1: key not found");
        assert_eq!(err.kind(), ErrorKind::Subprocess);
    }
}
