use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::domain::cell::IndexScope;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "CKB_CELL_INDEXER_DATA";

/// Load `KEY=value` pairs from a `.env` file into the process environment.
///
/// Without `dir` the file is searched from the working directory upwards.
/// Variables already set in the environment are kept. Call before any
/// other thread starts.
pub fn load_dotenv(dir: Option<&Path>) -> Option<PathBuf> {
    match dir {
        Some(dir) => {
            let path = dir.join(".env");
            dotenvy::from_path(&path).ok().map(|_| path)
        }
        None => dotenvy::dotenv().ok(),
    }
}

/// Get the data directory, preferring an explicit override over the environment.
pub fn resolve_data_dir(override_dir: Option<&str>) -> PathBuf {
    if let Some(dir) = override_dir {
        PathBuf::from(dir)
    } else if let Ok(s) = std::env::var(DATA_DIR_ENV) {
        PathBuf::from(s)
    } else if let Some(proj_dirs) = ProjectDirs::from("org", "nervos", "ckb-cell-indexer") {
        proj_dirs.data_local_dir().to_path_buf()
    } else {
        PathBuf::from(".").join(".data")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub name: String,
    pub rpc_url: String,
}

/// Sync engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerConfig {
    /// First block to index on an empty store.
    pub start_block: u64,
    /// Blocks of undo history kept for reorg rollback.
    pub confirmation_depth: u64,
    pub poll_interval_ms: u64,
    pub fetch_timeout_ms: u64,
    /// Attempts per fetch before the engine fails.
    pub fetch_retries: u32,
    /// Delay before the first retry; doubles on each further attempt.
    pub retry_backoff_ms: u64,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            start_block: 0,
            confirmation_depth: 100,
            poll_interval_ms: 1000,
            fetch_timeout_ms: 10_000,
            fetch_retries: 5,
            retry_backoff_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorConfig {
    pub reservation_ttl_secs: u64,
    /// Only spend cells without type script and data.
    pub safe_mode: bool,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            reservation_ttl_secs: 60,
            safe_mode: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub network: NetworkConfig,
    pub indexer: IndexerConfig,
    pub selector: SelectorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self::testnet()
    }
}

impl Config {
    /// Create config from CLI args.
    pub fn new(network: &str, rpc_url: Option<&str>) -> Self {
        let mut config = Self::from_network(network);
        if let Some(url) = rpc_url {
            config.network.rpc_url = url.to_string();
        }
        config
    }

    pub fn testnet() -> Self {
        Self::with_network("testnet", "https://testnet.ckb.dev")
    }

    pub fn mainnet() -> Self {
        Self::with_network("mainnet", "https://mainnet.ckb.dev")
    }

    pub fn devnet() -> Self {
        let mut config = Self::with_network("devnet", "http://127.0.0.1:8114");
        // Devnet blocks come fast and reorgs are shallow
        config.indexer.poll_interval_ms = 200;
        config.indexer.confirmation_depth = 24;
        config
    }

    pub fn from_network(network: &str) -> Self {
        match network {
            "mainnet" => Self::mainnet(),
            "devnet" => Self::devnet(),
            _ => Self::testnet(),
        }
    }

    fn with_network(name: &str, rpc_url: &str) -> Self {
        Self {
            network: NetworkConfig {
                name: name.to_string(),
                rpc_url: rpc_url.to_string(),
            },
            indexer: IndexerConfig::default(),
            selector: SelectorConfig::default(),
        }
    }

    /// LMDB directory for this network's index of `scope`.
    pub fn store_path(&self, data_dir: &Path, scope: &IndexScope) -> PathBuf {
        data_dir
            .join(&self.network.name)
            .join(scope.store_name())
            .join("cells.mdb")
    }
}
