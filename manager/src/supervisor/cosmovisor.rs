//! Upgrade-wrapper (cosmovisor) layout and detection.
//!
//! The wrapper expects:
//!
//! ```text
//! <home>/cosmovisor/genesis/bin/<node-bin>
//! <home>/cosmovisor/upgrades/<name>/bin/<node-bin>
//! <home>/cosmovisor/current -> genesis | upgrades/<name>
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::config::WRAPPER_BINARY_NAME;
use crate::home::HomeLayout;

/// The wrapper binary, if installed on `PATH`.
pub fn wrapper_on_path() -> Option<PathBuf> {
    which::which(WRAPPER_BINARY_NAME).ok()
}

/// Wrapper binary on `PATH` and its genesis layout under `home`.
pub fn detect(home: &HomeLayout, binary_name: &str) -> Option<PathBuf> {
    let wrapper = wrapper_on_path()?;
    home.wrapper_genesis_bin(binary_name)
        .is_file()
        .then_some(wrapper)
}

/// Creates the genesis layout, copying `node_binary` in when the copy is
/// missing or differs in size, and points `current` at `genesis`.
pub fn init_layout(home: &HomeLayout, node_binary: &Path) -> io::Result<PathBuf> {
    let name = crate::config::binary_name(node_binary);
    let target = home.wrapper_genesis_bin(&name);
    let bin_dir = target
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| home.cosmovisor_dir());
    fs::create_dir_all(&bin_dir)?;
    fs::create_dir_all(home.cosmovisor_dir().join("upgrades"))?;

    let same_file = fs::canonicalize(node_binary).ok() == fs::canonicalize(&target).ok();
    if !same_file && needs_copy(node_binary, &target)? {
        fs::copy(node_binary, &target)?;
        set_executable(&target)?;
        tracing::info!(binary = %target.display(), "installed node binary into wrapper layout");
    }

    let current = home.wrapper_current();
    if fs::symlink_metadata(&current).is_err() {
        link_dir(Path::new("genesis"), &current)?;
    }
    Ok(target)
}

/// Environment the wrapper reads its configuration from.
pub fn environment(home: &HomeLayout, binary_name: &str) -> Vec<(String, String)> {
    vec![
        ("DAEMON_NAME".into(), binary_name.to_string()),
        ("DAEMON_HOME".into(), home.root().display().to_string()),
        ("DAEMON_RESTART_AFTER_UPGRADE".into(), "true".into()),
        ("DAEMON_ALLOW_DOWNLOAD_BINARIES".into(), "false".into()),
        ("UNSAFE_SKIP_BACKUP".into(), "true".into()),
    ]
}

/// Upgrade names present under `upgrades/`, sorted.
pub fn upgrades(home: &HomeLayout) -> Vec<String> {
    let Ok(entries) = fs::read_dir(home.cosmovisor_dir().join("upgrades")) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(Result::ok)
        .filter(|e| e.path().is_dir())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

fn needs_copy(src: &Path, dst: &Path) -> io::Result<bool> {
    let src_len = fs::metadata(src)?.len();
    Ok(match fs::metadata(dst) {
        Ok(meta) => meta.len() != src_len,
        Err(_) => true,
    })
}

#[cfg(unix)]
fn set_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn link_dir(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn link_dir(target: &Path, link: &Path) -> io::Result<()> {
    let parent = link.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(parent.join(target))?;
    fs::create_dir_all(link)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn init_layout_copies_binary_and_links_current() {
        let tmp = TempDir::new().expect("create temp dir");
        let bin = tmp.path().join("pchaind");
        fs::write(&bin, b"#!/bin/sh\n").expect("write fake binary");
        let home = HomeLayout::new(tmp.path().join("home"));

        let installed = init_layout(&home, &bin).expect("init layout");
        assert_eq!(installed, home.wrapper_genesis_bin("pchaind"));
        assert!(installed.is_file());

        let link = fs::read_link(home.wrapper_current()).expect("current is a symlink");
        assert_eq!(link, PathBuf::from("genesis"));

        // Second run is a no-op.
        init_layout(&home, &bin).expect("idempotent");
    }

    #[test]
    fn upgrades_are_listed_sorted() {
        let tmp = TempDir::new().expect("create temp dir");
        let home = HomeLayout::new(tmp.path());
        fs::create_dir_all(home.wrapper_upgrade_bin("v2", "pchaind")).expect("mkdir v2");
        fs::create_dir_all(home.wrapper_upgrade_bin("v1", "pchaind")).expect("mkdir v1");
        assert_eq!(upgrades(&home), vec!["v1".to_string(), "v2".to_string()]);
    }

    #[test]
    fn environment_names_daemon() {
        let home = HomeLayout::new("/h");
        let env = environment(&home, "pchaind");
        assert!(env.contains(&("DAEMON_NAME".to_string(), "pchaind".to_string())));
        assert!(env.contains(&("DAEMON_HOME".to_string(), "/h".to_string())));
    }
}
