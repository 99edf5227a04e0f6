//! Production [`CommandRunner`] backed by `tokio::process`.
//!
//! Every invocation has a deadline and honours a shared cancellation token.
//! On cancellation or timeout the child receives SIGTERM, then SIGKILL once
//! the grace period has elapsed.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use super::{CommandRunner, ExecError, command_line};

/// Subprocess runner used by the binary.
#[derive(Clone)]
pub struct ProcessRunner {
    timeout: Duration,
    grace: Duration,
    cancel: CancellationToken,
    library_paths: Vec<PathBuf>,
}

impl ProcessRunner {
    pub fn new(timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            timeout,
            grace: Duration::from_secs(5),
            cancel,
            library_paths: Vec::new(),
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Directories exported as `DYLD_LIBRARY_PATH` on macOS, where the node
    /// binary ships its shared libraries next to the executable.
    pub fn with_library_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.library_paths = paths;
        self
    }

    fn command(&self, program: &Path, args: &[String]) -> Command {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        apply_library_path(&mut cmd, &self.library_paths);
        cmd
    }

    async fn execute(
        &self,
        program: &Path,
        args: &[String],
        input: Option<&str>,
    ) -> Result<Vec<u8>, ExecError> {
        let line = command_line(program, args);
        let name = program.display().to_string();
        tracing::debug!(command = %line, "running node binary");

        let mut cmd = self.command(program, args);
        cmd.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = cmd.spawn().map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ExecError::NotFound {
                    program: name.clone(),
                }
            } else {
                ExecError::Spawn {
                    program: name.clone(),
                    source,
                }
            }
        })?;

        if let (Some(text), Some(mut stdin)) = (input, child.stdin.take()) {
            stdin
                .write_all(text.as_bytes())
                .await
                .map_err(|source| ExecError::Spawn {
                    program: name.clone(),
                    source,
                })?;
            // Dropping stdin closes the pipe so the child sees EOF.
        }

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();

        let finished = tokio::select! {
            res = async {
                let read_out = async {
                    let mut buf = Vec::new();
                    if let Some(s) = stdout.as_mut() {
                        s.read_to_end(&mut buf).await?;
                    }
                    Ok::<_, std::io::Error>(buf)
                };
                let read_err = async {
                    let mut buf = Vec::new();
                    if let Some(s) = stderr.as_mut() {
                        s.read_to_end(&mut buf).await?;
                    }
                    Ok::<_, std::io::Error>(buf)
                };
                tokio::try_join!(child.wait(), read_out, read_err)
            } => Some(res),
            _ = self.cancel.cancelled() => None,
            _ = tokio::time::sleep(self.timeout) => {
                terminate(&mut child, self.grace).await;
                return Err(ExecError::Timeout { program: name, after: self.timeout });
            }
        };

        let Some(result) = finished else {
            terminate(&mut child, self.grace).await;
            return Err(ExecError::Cancelled { program: name });
        };

        let (status, out, err) = result.map_err(|source| ExecError::Spawn {
            program: name.clone(),
            source,
        })?;

        if status.success() {
            Ok(out)
        } else {
            Err(ExecError::Failed {
                program: name,
                code: status.code(),
                stdout: String::from_utf8_lossy(&out).into_owned(),
                stderr: String::from_utf8_lossy(&err).into_owned(),
            })
        }
    }
}

impl CommandRunner for ProcessRunner {
    async fn run(&self, program: &Path, args: &[String]) -> Result<Vec<u8>, ExecError> {
        self.execute(program, args, None).await
    }

    async fn run_with_input(
        &self,
        program: &Path,
        args: &[String],
        input: &str,
    ) -> Result<Vec<u8>, ExecError> {
        self.execute(program, args, Some(input)).await
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL.
pub(crate) async fn terminate(child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        crate::supervisor::pidfile::send_signal(pid, libc::SIGTERM);
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
    }
    let _ = child.kill().await;
}

#[cfg(target_os = "macos")]
fn apply_library_path(cmd: &mut Command, paths: &[PathBuf]) {
    if let Some(joined) = join_paths(paths) {
        cmd.env("DYLD_LIBRARY_PATH", joined);
    }
}

#[cfg(not(target_os = "macos"))]
fn apply_library_path(_cmd: &mut Command, _paths: &[PathBuf]) {}

/// Existing directories from `paths` joined with `:`.
pub fn join_paths(paths: &[PathBuf]) -> Option<String> {
    let existing: Vec<String> = paths
        .iter()
        .filter(|p| p.is_dir())
        .map(|p| p.display().to_string())
        .collect();
    if existing.is_empty() {
        None
    } else {
        Some(existing.join(":"))
    }
}

/// Directories the node binary may load shared libraries from: the
/// binary's own directory plus the wrapper's `genesis/bin` and
/// `current/bin`.
pub fn library_dirs(binary: &Path, home: &crate::home::HomeLayout) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(parent) = binary.parent() {
        dirs.push(parent.to_path_buf());
    }
    dirs.push(home.cosmovisor_dir().join("genesis").join("bin"));
    dirs.push(home.wrapper_current().join("bin"));
    dirs
}
