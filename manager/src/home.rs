//! Filesystem layout of a node home directory.
//!
//! ```text
//! <home>/
//!   config/{genesis.json, config.toml, priv_validator_key.json, node_key.json, addrbook.json}
//!   data/{..., priv_validator_state.json}
//!   snapshot-cache/{<archive>.tar.gz, <archive>.tar.gz.sha256, .lock}
//!   cosmovisor/{genesis/bin/<node-bin>, upgrades/<name>/bin/<node-bin>, current -> ...}
//!   <supervisor>.pid
//!   <supervisor>.log
//! ```

use std::path::{Path, PathBuf};

/// Literal content of a fresh anti-double-sign state file.
pub const EMPTY_VALIDATOR_STATE: &str = r#"{"height":"0","round":0,"step":0}"#;

pub const PRIV_VALIDATOR_STATE: &str = "priv_validator_state.json";
pub const PRIV_VALIDATOR_KEY: &str = "priv_validator_key.json";
pub const NODE_KEY: &str = "node_key.json";
pub const GENESIS: &str = "genesis.json";
pub const CONFIG_TOML: &str = "config.toml";
pub const ADDR_BOOK: &str = "addrbook.json";

/// Path helpers rooted at a node home directory.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HomeLayout {
    root: PathBuf,
}

impl HomeLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join("config")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    pub fn snapshot_cache_dir(&self) -> PathBuf {
        self.root.join("snapshot-cache")
    }

    pub fn cosmovisor_dir(&self) -> PathBuf {
        self.root.join("cosmovisor")
    }

    pub fn genesis_file(&self) -> PathBuf {
        self.config_dir().join(GENESIS)
    }

    pub fn config_toml(&self) -> PathBuf {
        self.config_dir().join(CONFIG_TOML)
    }

    pub fn validator_key_file(&self) -> PathBuf {
        self.config_dir().join(PRIV_VALIDATOR_KEY)
    }

    pub fn node_key_file(&self) -> PathBuf {
        self.config_dir().join(NODE_KEY)
    }

    pub fn addr_book_file(&self) -> PathBuf {
        self.config_dir().join(ADDR_BOOK)
    }

    pub fn validator_state_file(&self) -> PathBuf {
        self.data_dir().join(PRIV_VALIDATOR_STATE)
    }

    /// `<home>/cosmovisor/genesis/bin/<binary>`
    pub fn wrapper_genesis_bin(&self, binary_name: &str) -> PathBuf {
        self.cosmovisor_dir()
            .join("genesis")
            .join("bin")
            .join(binary_name)
    }

    /// `<home>/cosmovisor/upgrades/<name>/bin/<binary>`
    pub fn wrapper_upgrade_bin(&self, upgrade: &str, binary_name: &str) -> PathBuf {
        self.cosmovisor_dir()
            .join("upgrades")
            .join(upgrade)
            .join("bin")
            .join(binary_name)
    }

    pub fn wrapper_current(&self) -> PathBuf {
        self.cosmovisor_dir().join("current")
    }

    pub fn pid_file(&self, supervisor: &str) -> PathBuf {
        self.root.join(format!("{supervisor}.pid"))
    }

    pub fn log_file(&self, supervisor: &str) -> PathBuf {
        self.root.join(format!("{supervisor}.log"))
    }

    /// Writes the zero anti-double-sign state if no state file exists.
    ///
    /// Returns `true` when a file was written. An existing file is never
    /// touched.
    pub fn ensure_validator_state(&self) -> std::io::Result<bool> {
        let path = self.validator_state_file();
        if path.exists() {
            return Ok(false);
        }
        std::fs::create_dir_all(self.data_dir())?;
        std::fs::write(&path, EMPTY_VALIDATOR_STATE)?;
        Ok(true)
    }

    /// Both consensus key files are present.
    pub fn has_validator_keys(&self) -> bool {
        self.validator_key_file().is_file() && self.node_key_file().is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn paths_follow_layout() {
        let home = HomeLayout::new("/var/node");
        assert_eq!(home.genesis_file(), PathBuf::from("/var/node/config/genesis.json"));
        assert_eq!(
            home.validator_state_file(),
            PathBuf::from("/var/node/data/priv_validator_state.json")
        );
        assert_eq!(
            home.wrapper_genesis_bin("pchaind"),
            PathBuf::from("/var/node/cosmovisor/genesis/bin/pchaind")
        );
        assert_eq!(
            home.wrapper_upgrade_bin("v2", "pchaind"),
            PathBuf::from("/var/node/cosmovisor/upgrades/v2/bin/pchaind")
        );
        assert_eq!(home.pid_file("pchaind"), PathBuf::from("/var/node/pchaind.pid"));
    }

    #[test]
    fn ensure_validator_state_never_overwrites() {
        let tmp = TempDir::new().expect("create temp dir");
        let home = HomeLayout::new(tmp.path());

        assert!(home.ensure_validator_state().expect("first write"));
        let written = std::fs::read_to_string(home.validator_state_file()).expect("read state");
        assert_eq!(written, EMPTY_VALIDATOR_STATE);

        std::fs::write(home.validator_state_file(), r#"{"height":"42"}"#).expect("overwrite");
        assert!(!home.ensure_validator_state().expect("second call"));
        let kept = std::fs::read_to_string(home.validator_state_file()).expect("read state");
        assert_eq!(kept, r#"{"height":"42"}"#);
    }
}
