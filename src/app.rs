//! Command runner wiring the store, sync engine, selector and builder.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use ckb_cell_indexer::{
    config::Config,
    domain::{
        cell::{IndexScope, LockFilter},
        selector::CoinSelector,
        signer::{Secp256k1Signer, Signer},
        tx_builder::{self, Secp256k1Dep, TransferBuilder, parse_lock_args},
    },
    infra::{
        collector::CellCollector,
        rpc::{NodeRpc, RpcClient},
        store::CellStore,
        sync::SyncEngine,
    },
};
use ckb_jsonrpc_types::Transaction;
use ckb_sdk::{Address, AddressPayload, CodeHashIndex, NetworkType};
use ckb_types::H160;
use color_eyre::eyre::Result;
use tracing::{info, warn};

use crate::cli::{Args, Command};

const SHANNONS_PER_CKB: u64 = 1_00000000;

pub struct App {
    config: Config,
    command: Command,
    rpc: Arc<RpcClient>,
    data_dir: PathBuf,
}

impl App {
    pub async fn new(args: &Args, data_dir: &Path) -> Result<Self> {
        let config = args.config();
        info!(
            "Using {} at {} with data in {}",
            config.network.name,
            config.network.rpc_url,
            data_dir.display()
        );

        // reqwest's blocking client must not be built on a runtime thread
        let url = config.network.rpc_url.clone();
        let rpc = tokio::task::spawn_blocking(move || RpcClient::new(&url)).await?;

        Ok(Self {
            config,
            command: args.command.clone(),
            rpc: Arc::new(rpc),
            data_dir: data_dir.to_path_buf(),
        })
    }

    pub async fn run(&mut self) -> Result<()> {
        match self.command.clone() {
            Command::Sync { private_key } => self.sync(private_key.as_deref()).await,
            Command::Address { private_key } => self.address(&private_key),
            Command::Cells { private_key } => self.cells(&private_key).await,
            Command::Transfer {
                private_key,
                capacity,
                fee,
                to_args,
            } => {
                self.transfer(&private_key, capacity, fee, to_args.as_deref())
                    .await
            }
            Command::Reset { private_key } => self.reset(private_key.as_deref()).await,
        }
    }

    /// Follow the chain until Ctrl-C or a fatal error.
    async fn sync(&self, private_key: Option<&str>) -> Result<()> {
        let scope = self.scope_for(private_key).await?;
        let store = self.open_store(&scope)?;
        let engine = Arc::new(self.engine(store, scope));

        let mut handle = engine.clone().start();
        tokio::select! {
            result = &mut handle => {
                result??;
                return Ok(());
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, stopping sync");
                engine.stop();
            }
        }
        handle.await??;
        Ok(())
    }

    fn address(&self, private_key: &str) -> Result<()> {
        let signer = Secp256k1Signer::from_hex(private_key)?;
        let lock_args = signer.lock_args();
        let payload = AddressPayload::new_short(CodeHashIndex::Sighash, H160(lock_args));
        let address = Address::new(self.network_type(), payload, true);

        println!("address:   {}", address);
        println!("lock args: 0x{}", hex::encode(lock_args));
        Ok(())
    }

    async fn cells(&self, private_key: &str) -> Result<()> {
        let signer = Secp256k1Signer::from_hex(private_key)?;
        let dep = self.load_dep().await?;
        let filter = LockFilter::exact(&dep.lock(&signer.lock_args()));
        let store = self.sync_to_tip(&filter).await?;

        let cells = CellCollector::new(store).collect_vec(&filter)?;
        let mut total = 0u64;
        for cell in &cells {
            total += cell.capacity;
            println!(
                "{}  {} CKB{}",
                cell.out_point,
                format_ckb(cell.capacity),
                if cell.is_plain() { "" } else { "  (typed or data)" }
            );
        }
        println!("{} live cells, {} CKB", cells.len(), format_ckb(total));
        Ok(())
    }

    /// Sync, select, build, sign and send a transfer.
    async fn transfer(
        &self,
        private_key: &str,
        capacity: u64,
        fee: u64,
        to_args: Option<&str>,
    ) -> Result<()> {
        let signer = Secp256k1Signer::from_hex(private_key)?;
        let dep = self.load_dep().await?;
        let sender_lock = dep.lock(&signer.lock_args());
        let filter = LockFilter::exact(&sender_lock);
        let to = match to_args {
            Some(args) => dep.lock(&parse_lock_args(args)?),
            None => sender_lock.clone(),
        };

        let store = self.sync_to_tip(&filter).await?;

        let selector = CoinSelector::from_config(CellCollector::new(store), &self.config.selector);
        let selection = selector.select(&filter, capacity, fee)?;
        info!(
            "Spending {} cells, {} shannons change",
            selection.cells.len(),
            selection.change_capacity
        );

        let signed = TransferBuilder::new(dep, sender_lock)
            .build(&selection, &to)
            .and_then(|built| tx_builder::sign(built, &signer));
        let tx = match signed {
            Ok(tx) => tx,
            Err(e) => {
                selector.release(selection.token);
                return Err(e);
            }
        };

        match self.send(tx).await {
            Ok(tx_hash) => {
                println!("Transaction has been sent with tx hash 0x{}", hex::encode(tx_hash));
                Ok(())
            }
            Err(e) => {
                selector.release(selection.token);
                Err(e)
            }
        }
    }

    /// Wipe the index of `private_key`, or the full index without one.
    async fn reset(&self, private_key: Option<&str>) -> Result<()> {
        let scope = self.scope_for(private_key).await?;
        self.open_store(&scope)?.reset()?;
        println!("Index of {} on {} cleared", scope, self.config.network.name);
        Ok(())
    }

    /// Index scope of a command: the key's sighash lock, or every cell.
    async fn scope_for(&self, private_key: Option<&str>) -> Result<IndexScope> {
        match private_key {
            Some(key) => {
                let signer = Secp256k1Signer::from_hex(key)?;
                let dep = self.load_dep().await?;
                Ok(IndexScope::Locks(vec![LockFilter::exact(
                    &dep.lock(&signer.lock_args()),
                )]))
            }
            None => Ok(IndexScope::All),
        }
    }

    /// Each scope keeps its own store, so commands for different keys never
    /// share a cursor.
    fn open_store(&self, scope: &IndexScope) -> Result<CellStore> {
        let path = self.config.store_path(&self.data_dir, scope);
        info!("Opening store for {} at {}", scope, path.display());
        Ok(CellStore::with_path(
            path,
            self.config.indexer.confirmation_depth,
        )?)
    }

    fn engine(&self, store: CellStore, scope: IndexScope) -> SyncEngine<RpcClient> {
        SyncEngine::new(self.rpc.clone(), store, self.config.indexer.clone(), scope)
    }

    /// Sync the store of `filter` to the tip and return it.
    async fn sync_to_tip(&self, filter: &LockFilter) -> Result<CellStore> {
        let scope = IndexScope::Locks(vec![filter.clone()]);
        let store = self.open_store(&scope)?;
        let engine = self.engine(store.clone(), scope);
        let progress = engine.sync_to_tip().await?;
        if progress.height.is_none_or(|height| height < progress.tip) {
            warn!(
                "Index at {:?} is behind tip {}, balances may be stale",
                progress.height, progress.tip
            );
        }
        Ok(store)
    }

    async fn load_dep(&self) -> Result<Secp256k1Dep> {
        let rpc = self.rpc.clone();
        tokio::task::spawn_blocking(move || tx_builder::load_secp256k1_dep(rpc.as_ref())).await?
    }

    async fn send(&self, tx: Transaction) -> Result<[u8; 32]> {
        let rpc = self.rpc.clone();
        let hash = tokio::task::spawn_blocking(move || rpc.send_transaction(tx)).await??;
        Ok(hash)
    }

    fn network_type(&self) -> NetworkType {
        match self.config.network.name.as_str() {
            "mainnet" => NetworkType::Mainnet,
            "devnet" => NetworkType::Dev,
            _ => NetworkType::Testnet,
        }
    }
}

/// Shannons as a decimal CKB amount.
fn format_ckb(shannons: u64) -> String {
    let whole = shannons / SHANNONS_PER_CKB;
    let frac = shannons % SHANNONS_PER_CKB;
    if frac == 0 {
        whole.to_string()
    } else {
        let frac = format!("{:08}", frac);
        format!("{}.{}", whole, frac.trim_end_matches('0'))
    }
}
