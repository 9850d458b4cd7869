//! Viewd Config

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default number of ledger entries targeted per history page.
pub const DEFAULT_TXN_PER_PAGE: u32 = 100;

/// Default idle threshold before a client view is reaped, in seconds.
pub const DEFAULT_IDLE_REAP_SECS: u64 = 600;

/// The network whose chain is being indexed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Main,
    Test,
    Regtest,
}

impl Network {
    /// The p2p magic bytes identifying this network.
    pub fn magic_bytes(&self) -> [u8; 4] {
        match self {
            Network::Main => [0xF9, 0xBE, 0xB4, 0xD9],
            Network::Test => [0x0B, 0x11, 0x09, 0x07],
            Network::Regtest => [0xFA, 0xBF, 0xB5, 0xDA],
        }
    }
}

/// Indexing mode: track everything, or only registered addresses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DbMode {
    /// Track every script hash on the chain unconditionally.
    Super,
    /// Track only the configured/registered set.
    #[default]
    Selective,
}

/// Viewd Configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ViewdConfig {
    /// Network identifier (selects the expected magic bytes).
    #[serde(default)]
    pub network: Network,

    #[serde(default)]
    pub chain: ChainSection,

    #[serde(default)]
    pub store: StoreSection,

    #[serde(default)]
    pub rpc: RpcSection,

    #[serde(default)]
    pub view: ViewSection,
}

/// Settings for the raw-block backend.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ChainSection {
    /// Directory holding the node's raw block files.
    pub blkdir: Option<PathBuf>,
}

/// Settings for the index store.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StoreSection {
    /// Directory where the script-history index lives.
    pub datadir: Option<PathBuf>,

    /// Indexing mode.
    #[serde(default)]
    pub db_mode: DbMode,
}

/// Settings for the client-facing endpoint.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RpcSection {
    /// Address the framing transport binds to. Loopback by default.
    pub listen_addr: Option<SocketAddr>,
}

/// Settings for client views.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ViewSection {
    /// Target number of ledger entries per history page.
    pub txn_per_page: Option<u32>,

    /// Seconds of inactivity before an abandoned view is reaped.
    pub idle_reap: Option<u64>,
}

impl ViewdConfig {
    /// Reads and parses a TOML config file.
    pub fn load(path: &Path) -> Result<Self, crate::error::Error> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| crate::error::ErrorKind::Init.context(e))?;
        toml::from_str(&contents).map_err(|e| crate::error::ErrorKind::Init.context(e))
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.rpc
            .listen_addr
            .unwrap_or_else(|| "127.0.0.1:9050".parse().expect("valid"))
    }

    pub fn txn_per_page(&self) -> u32 {
        self.view.txn_per_page.unwrap_or(DEFAULT_TXN_PER_PAGE)
    }

    pub fn idle_reap(&self) -> Duration {
        Duration::from_secs(self.view.idle_reap.unwrap_or(DEFAULT_IDLE_REAP_SECS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_selective_loopback() {
        let config = ViewdConfig::default();
        assert_eq!(config.store.db_mode, DbMode::Selective);
        assert!(config.listen_addr().ip().is_loopback());
        assert_eq!(config.txn_per_page(), DEFAULT_TXN_PER_PAGE);
    }

    #[test]
    fn parses_sectioned_toml() {
        let config: ViewdConfig = toml::from_str(
            r#"
            network = "regtest"

            [store]
            datadir = "/var/lib/viewd"
            db_mode = "super"

            [view]
            txn_per_page = 25
            "#,
        )
        .unwrap();
        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.store.db_mode, DbMode::Super);
        assert_eq!(config.txn_per_page(), 25);
        assert_eq!(config.idle_reap(), Duration::from_secs(DEFAULT_IDLE_REAP_SECS));
    }

    #[test]
    fn load_round_trips_through_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("viewd.toml");
        let config = ViewdConfig::default();
        std::fs::write(&path, toml::to_string_pretty(&config).unwrap()).unwrap();
        let loaded = ViewdConfig::load(&path).unwrap();
        assert_eq!(loaded.store.db_mode, config.store.db_mode);
    }
}
