//! Wiping chain state.
//!
//! Both functions assume the node is already stopped. `reset_data` is what
//! the sync monitor's recovery path runs between attempts.

use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use crate::error::{Classify, ErrorKind, Remediation};
use crate::home::{HomeLayout, PRIV_VALIDATOR_STATE};

#[derive(Debug, Error)]
pub enum ResetError {
    #[error("home directory {0} does not exist")]
    HomeMissing(PathBuf),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl ResetError {
    fn io(context: impl Into<String>) -> impl FnOnce(io::Error) -> Self {
        let context = context.into();
        move |source| ResetError::Io { context, source }
    }
}

impl Classify for ResetError {
    fn kind(&self) -> ErrorKind {
        match self {
            ResetError::HomeMissing(_) => ErrorKind::Precondition,
            ResetError::Io { .. } => ErrorKind::Internal,
        }
    }

    fn remediation(&self) -> Remediation {
        let base = Remediation::new(self.to_string());
        match self {
            ResetError::HomeMissing(_) => base.action("push-validator init"),
            ResetError::Io { .. } => base
                .cause("a file under the home directory is not writable by this user")
                .action("check ownership of the home directory"),
        }
    }
}

/// Paths removed by a reset, relative to the home directory.
#[derive(Debug, Default, Serialize)]
pub struct ResetReport {
    pub removed: Vec<PathBuf>,
    pub state_written: bool,
}

/// Empties `data/` except the anti-double-sign state, keeps
/// `config/addrbook.json`, and writes the zero state if none exists.
pub fn reset_data(layout: &HomeLayout) -> Result<ResetReport, ResetError> {
    if !layout.root().is_dir() {
        return Err(ResetError::HomeMissing(layout.root().to_path_buf()));
    }
    let mut report = ResetReport::default();
    let data = layout.data_dir();

    match std::fs::read_dir(&data) {
        Ok(entries) => {
            for entry in entries {
                let entry = entry.map_err(ResetError::io("list data directory"))?;
                if entry.file_name() == PRIV_VALIDATOR_STATE {
                    continue;
                }
                remove_any(&entry.path())?;
                report.removed.push(relative(layout, &entry.path()));
            }
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(ResetError::io("list data directory")(err)),
    }

    report.state_written = layout
        .ensure_validator_state()
        .map_err(ResetError::io("write validator state"))?;
    tracing::info!(removed = report.removed.len(), "chain data reset");
    Ok(report)
}

/// Removes `data/`, `config/`, the wrapper layout and supervisor files.
/// Keyring directories and the snapshot cache survive.
pub fn full_reset(layout: &HomeLayout) -> Result<ResetReport, ResetError> {
    if !layout.root().is_dir() {
        return Err(ResetError::HomeMissing(layout.root().to_path_buf()));
    }
    let mut report = ResetReport::default();

    for dir in [layout.data_dir(), layout.config_dir(), layout.cosmovisor_dir()] {
        if dir.exists() {
            remove_any(&dir)?;
            report.removed.push(relative(layout, &dir));
        }
    }

    let entries = std::fs::read_dir(layout.root()).map_err(ResetError::io("list home directory"))?;
    for entry in entries {
        let entry = entry.map_err(ResetError::io("list home directory"))?;
        let path = entry.path();
        let supervisor_file = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("pid") | Some("log")
        );
        if supervisor_file && path.is_file() {
            remove_any(&path)?;
            report.removed.push(relative(layout, &path));
        }
    }
    tracing::warn!(removed = report.removed.len(), "full reset completed");
    Ok(report)
}

fn remove_any(path: &Path) -> Result<(), ResetError> {
    let meta = std::fs::symlink_metadata(path)
        .map_err(ResetError::io(format!("inspect {}", path.display())))?;
    let result = if meta.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    result.map_err(ResetError::io(format!("remove {}", path.display())))
}

fn relative(layout: &HomeLayout, path: &Path) -> PathBuf {
    path.strip_prefix(layout.root())
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| path.to_path_buf())
}
