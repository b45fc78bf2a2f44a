use clap::{Parser, Subcommand};

use ckb_cell_indexer::config::Config;

#[derive(Parser, Debug)]
#[command(name = "ckb-cell-indexer")]
#[command(version)]
#[command(about = "Local cell index and coin selection for Nervos CKB")]
pub struct Args {
    /// Network to connect to (testnet, mainnet, devnet)
    #[arg(short, long, global = true, default_value = "testnet")]
    pub network: String,

    /// Custom RPC URL (overrides network default)
    #[arg(long, global = true, env = "CKB_URL")]
    pub rpc_url: Option<String>,

    /// Data directory path
    #[arg(long, global = true)]
    pub data_dir: Option<String>,

    /// First block to index when the store is empty
    #[arg(long, global = true, env = "CKB_START_BLOCK")]
    pub start_block: Option<u64>,

    /// Blocks of undo history kept for reorg rollback
    #[arg(long, global = true, env = "CKB_CONFIRMATION_DEPTH")]
    pub confirmation_depth: Option<u64>,

    /// Seconds a selection keeps its cells reserved
    #[arg(long, global = true, env = "CKB_RESERVATION_TTL_SECS")]
    pub reservation_ttl_secs: Option<u64>,

    /// Timeout of a single node request, in milliseconds
    #[arg(long, global = true, env = "CKB_FETCH_TIMEOUT_MS")]
    pub fetch_timeout_ms: Option<u64>,

    /// Attempts per node request before sync fails
    #[arg(long, global = true, env = "CKB_FETCH_RETRIES")]
    pub fetch_retries: Option<u32>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Index the chain and follow the tip until Ctrl-C.
    /// With PRI_KEY only that key's cells are indexed.
    Sync {
        #[arg(long, env = "PRI_KEY", hide_env_values = true)]
        private_key: Option<String>,
    },

    /// Print the address and lock args of PRI_KEY
    Address {
        #[arg(long, env = "PRI_KEY", hide_env_values = true)]
        private_key: String,
    },

    /// Sync to tip, then list the live cells of PRI_KEY
    Cells {
        #[arg(long, env = "PRI_KEY", hide_env_values = true)]
        private_key: String,
    },

    /// Sync, select cells, sign and send a transfer
    Transfer {
        #[arg(long, env = "PRI_KEY", hide_env_values = true)]
        private_key: String,

        /// Capacity to send, in shannons
        #[arg(long)]
        capacity: u64,

        /// Transaction fee, in shannons
        #[arg(long, default_value_t = 100_000)]
        fee: u64,

        /// Recipient lock args (20 bytes hex); defaults to the sender
        #[arg(long)]
        to_args: Option<String>,
    },

    /// Wipe the local index for a full resync.
    /// With PRI_KEY the index of that key is wiped, otherwise the full index.
    Reset {
        #[arg(long, env = "PRI_KEY", hide_env_values = true)]
        private_key: Option<String>,
    },
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Network preset with the command line overrides applied.
    pub fn config(&self) -> Config {
        let mut config = Config::new(&self.network, self.rpc_url.as_deref());
        if let Some(start_block) = self.start_block {
            config.indexer.start_block = start_block;
        }
        if let Some(depth) = self.confirmation_depth {
            config.indexer.confirmation_depth = depth;
        }
        if let Some(ttl) = self.reservation_ttl_secs {
            config.selector.reservation_ttl_secs = ttl;
        }
        if let Some(timeout) = self.fetch_timeout_ms {
            config.indexer.fetch_timeout_ms = timeout;
        }
        if let Some(retries) = self.fetch_retries {
            config.indexer.fetch_retries = retries;
        }
        config
    }
}
