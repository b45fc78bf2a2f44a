//! Block sync engine.
//!
//! Pulls blocks from the node one height at a time, applies their cell deltas
//! to the store and follows the chain through reorgs. Fetches run on the
//! blocking pool with a timeout and bounded exponential-backoff retries.

use std::{sync::Arc, time::Duration};

use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{
    config::IndexerConfig,
    domain::{
        block::{BlockDelta, BlockHeader, IndexBlock},
        cell::IndexScope,
        error::{IndexerError, IndexerResult, short_hex},
    },
    infra::{rpc::NodeRpc, store::CellStore},
};

/// Sync engine lifecycle, published through a watch channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    Stopped,
    Syncing,
    /// Caught up with the node tip.
    Idle { height: Option<u64>, tip: u64 },
    /// Walking back to the fork point after a parent hash mismatch.
    ReorgRecovering { at: u64 },
    /// Stopped on an error that requires intervention (full resync).
    Failed(String),
}

/// Outcome of one catch-up pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncProgress {
    pub blocks_applied: u64,
    pub reorgs: u64,
    pub height: Option<u64>,
    pub tip: u64,
}

/// Explicit sync daemon owning its RPC and store handles.
pub struct SyncEngine<R: NodeRpc> {
    rpc: Arc<R>,
    store: CellStore,
    config: IndexerConfig,
    scope: IndexScope,
    state_tx: watch::Sender<SyncState>,
    stop_tx: watch::Sender<bool>,
}

impl<R: NodeRpc> SyncEngine<R> {
    pub fn new(rpc: Arc<R>, store: CellStore, config: IndexerConfig, scope: IndexScope) -> Self {
        let (state_tx, _) = watch::channel(SyncState::Stopped);
        let (stop_tx, _) = watch::channel(false);
        Self {
            rpc,
            store,
            config,
            scope,
            state_tx,
            stop_tx,
        }
    }

    pub fn store(&self) -> &CellStore {
        &self.store
    }

    pub fn state(&self) -> SyncState {
        self.state_tx.borrow().clone()
    }

    /// Receive state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.state_tx.subscribe()
    }

    /// Spawn [`SyncEngine::run`] on the runtime.
    ///
    /// Clears an earlier stop request, so a stopped engine can be started
    /// again. A `stop` issued after this call is honored even if the task
    /// has not been polled yet.
    pub fn start(self: Arc<Self>) -> JoinHandle<IndexerResult<()>> {
        self.stop_tx.send_replace(false);
        tokio::spawn(async move { self.run().await })
    }

    /// Ask the engine to stop after the block it is applying. Stays in effect
    /// until the next [`SyncEngine::start`].
    pub fn stop(&self) {
        debug!("Sync stop requested");
        self.stop_tx.send_replace(true);
    }

    fn stop_requested(&self) -> bool {
        *self.stop_tx.borrow()
    }

    fn set_state(&self, state: SyncState) {
        self.state_tx.send_replace(state);
    }

    /// Sync to the tip, then poll for new blocks until stopped or failed.
    pub async fn run(&self) -> IndexerResult<()> {
        let mut stop_rx = self.stop_tx.subscribe();
        info!(
            "Sync engine started at block {:?}",
            self.store.cursor()?.height()
        );

        let result = self.run_loop(&mut stop_rx).await;
        match &result {
            Ok(()) => {
                self.set_state(SyncState::Stopped);
                info!("Sync engine stopped");
            }
            Err(e) => {
                error!("Sync engine failed: {}", e);
                self.set_state(SyncState::Failed(e.to_string()));
            }
        }
        result
    }

    async fn run_loop(&self, stop_rx: &mut watch::Receiver<bool>) -> IndexerResult<()> {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        'sync: loop {
            if *stop_rx.borrow() {
                return Ok(());
            }
            self.set_state(SyncState::Syncing);
            let progress = self.sync_to_tip().await?;
            if *stop_rx.borrow() {
                return Ok(());
            }
            self.set_state(SyncState::Idle {
                height: progress.height,
                tip: progress.tip,
            });

            loop {
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = stop_rx.changed() => {}
                }
                if *stop_rx.borrow() {
                    return Ok(());
                }
                let tip = self.fetch_tip().await?;
                let next = self.store.cursor()?.next_height(self.config.start_block);
                if tip.number >= next {
                    debug!("New tip {} observed", tip.number);
                    continue 'sync;
                }
            }
        }
    }

    /// Apply blocks until the cursor reaches the node tip seen at the start of the pass.
    pub async fn sync_to_tip(&self) -> IndexerResult<SyncProgress> {
        self.store.bind_scope(&self.scope)?;
        let tip = self.fetch_tip().await?;
        let mut progress = SyncProgress {
            blocks_applied: 0,
            reorgs: 0,
            height: self.store.cursor()?.height(),
            tip: tip.number,
        };

        let next = self.store.cursor()?.next_height(self.config.start_block);
        if next <= tip.number {
            info!("Syncing blocks {} to {} (tip)", next, tip.number);
        } else {
            debug!("Already synced to tip {}", tip.number);
        }

        while !self.stop_requested() {
            let next = self.store.cursor()?.next_height(self.config.start_block);
            if next > tip.number {
                break;
            }
            let Some(block) = self.fetch_block(next).await? else {
                warn!("Block {} not found, waiting...", next);
                break;
            };

            let delta = self.extract_delta(&block)?;
            match self.store.apply_block(&delta) {
                Ok(cursor) => {
                    progress.blocks_applied += 1;
                    progress.height = cursor.height();
                    if progress.blocks_applied % 1000 == 0 {
                        info!("Synced block {} of {}", next, tip.number);
                    }
                }
                Err(IndexerError::ReorgDetected {
                    number,
                    expected,
                    actual,
                }) => {
                    warn!(
                        "Reorg detected at block {}! Expected parent {}, got {}",
                        number,
                        short_hex(&expected),
                        short_hex(&actual)
                    );
                    self.set_state(SyncState::ReorgRecovering { at: number });
                    let fork = self.recover_from_reorg().await?;
                    progress.reorgs += 1;
                    progress.height = Some(fork);
                    self.set_state(SyncState::Syncing);
                }
                Err(e) => return Err(e),
            }
        }

        if progress.blocks_applied > 0 {
            info!(
                "Sync pass complete: {} blocks applied, now at {:?}",
                progress.blocks_applied, progress.height
            );
        }
        Ok(progress)
    }

    /// Walk back from the head until the node and the store agree on a block
    /// hash, then roll the store back to it. Returns the fork height.
    async fn recover_from_reorg(&self) -> IndexerResult<u64> {
        let head = self.store.cursor()?.current().ok_or_else(|| {
            IndexerError::InconsistentState("reorg reported with no indexed head".to_string())
        })?;

        let mut number = head.number;
        loop {
            let Some(recorded) = self.store.block_hash_at(number)? else {
                return Err(IndexerError::RollbackTooDeep {
                    target: number,
                    oldest: self.store.oldest_undo_height()?,
                });
            };
            let header = self
                .fetch(format!("header {}", number), move |rpc| {
                    rpc.get_header_by_number(number)
                })
                .await?;

            if header.map(|h| h.hash) == Some(recorded) {
                info!("Fork point found at block {}", number);
                self.store.rollback(number)?;
                return Ok(number);
            }

            number = match number.checked_sub(1) {
                Some(parent) => parent,
                None => {
                    return Err(IndexerError::RollbackTooDeep {
                        target: 0,
                        oldest: self.store.oldest_undo_height()?,
                    });
                }
            };
        }
    }

    fn extract_delta(&self, block: &IndexBlock) -> IndexerResult<BlockDelta> {
        if self.scope.is_all() {
            return BlockDelta::extract(block, &self.scope, |_| Ok(true));
        }
        let snapshot = self.store.snapshot()?;
        BlockDelta::extract(block, &self.scope, |out_point| snapshot.contains(out_point))
    }

    async fn fetch_tip(&self) -> IndexerResult<BlockHeader> {
        self.fetch("tip header".to_string(), |rpc| rpc.get_tip_header())
            .await
    }

    async fn fetch_block(&self, number: u64) -> IndexerResult<Option<IndexBlock>> {
        self.fetch(format!("block {}", number), move |rpc| {
            rpc.get_block_by_number(number)
        })
        .await
    }

    /// Run a blocking RPC call with a timeout, retrying transient failures
    /// with exponential backoff.
    async fn fetch<T, F>(&self, what: String, call: F) -> IndexerResult<T>
    where
        T: Send + 'static,
        F: Fn(&R) -> IndexerResult<T> + Clone + Send + 'static,
    {
        let timeout = Duration::from_millis(self.config.fetch_timeout_ms);
        let max_attempts = self.config.fetch_retries.max(1);

        let mut attempt = 0;
        loop {
            attempt += 1;
            let rpc = self.rpc.clone();
            let call = call.clone();
            let result = match tokio::time::timeout(
                timeout,
                tokio::task::spawn_blocking(move || call(&*rpc)),
            )
            .await
            {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => Err(IndexerError::FetchFailed {
                    what: what.clone(),
                    reason: format!("fetch task failed: {}", e),
                }),
                Err(_) => Err(IndexerError::FetchTimeout {
                    what: what.clone(),
                    timeout_ms: self.config.fetch_timeout_ms,
                }),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay_ms = backoff_delay_ms(self.config.retry_backoff_ms, attempt);
                    warn!(
                        "RPC error fetching {}, attempt {}/{}, retrying in {}ms: {}",
                        what, attempt, max_attempts, delay_ms, e
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Delay before retry number `attempt` (1-based): base, 2*base, 4*base, ...
fn backoff_delay_ms(base_ms: u64, attempt: u32) -> u64 {
    base_ms.saturating_mul(1u64 << attempt.saturating_sub(1).min(16))
}
