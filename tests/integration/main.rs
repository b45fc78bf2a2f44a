//! Integration tests for ckb-cell-indexer.
//!
//! Every test runs against an in-memory node and a fresh LMDB store in a
//! temporary directory.

mod sync_engine;
mod transfer_flow;

use std::{collections::BTreeMap, sync::Arc};

use tempfile::TempDir;

use ckb_cell_indexer::{
    config::IndexerConfig,
    domain::cell::{HashType, IndexScope, OutPoint, Script},
    infra::{store::CellStore, sync::SyncEngine},
};

use fake_node::FakeNode;

/// Node, store and temp directory for one test.
pub struct TestEnv {
    pub node: Arc<FakeNode>,
    pub store: CellStore,
    _dir: TempDir,
}

impl TestEnv {
    pub fn new(confirmation_depth: u64) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = CellStore::with_path(dir.path().join("cells.mdb"), confirmation_depth)
            .expect("Failed to open store");
        Self {
            node: Arc::new(FakeNode::new()),
            store,
            _dir: dir,
        }
    }

    pub fn engine(&self, scope: IndexScope, config: IndexerConfig) -> SyncEngine<FakeNode> {
        SyncEngine::new(self.node.clone(), self.store.clone(), config, scope)
    }

    /// Live cells in the store as out point -> capacity.
    pub fn store_live_set(&self) -> BTreeMap<OutPoint, u64> {
        let snapshot = self.store.snapshot().expect("Failed to open snapshot");
        snapshot
            .live_cells()
            .expect("Failed to read live cells")
            .into_iter()
            .map(|cell| (cell.out_point, cell.capacity))
            .collect()
    }
}

/// Fast polling and short timeouts for tests.
pub fn test_config() -> IndexerConfig {
    IndexerConfig {
        start_block: 0,
        confirmation_depth: 100,
        poll_interval_ms: 20,
        fetch_timeout_ms: 1000,
        fetch_retries: 3,
        retry_backoff_ms: 5,
    }
}

/// A sighash-style lock owned by `owner`.
pub fn lock(owner: u8) -> Script {
    Script::new([0x9b; 32], HashType::Type, vec![owner; 20])
}
