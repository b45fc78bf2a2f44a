use ckb_jsonrpc_types::Transaction;
use ckb_sdk::CkbRpcClient;

use crate::domain::{
    block::{BlockHeader, IndexBlock},
    error::{IndexerError, IndexerResult},
};

/// Node calls the indexer depends on.
///
/// Implementations are blocking; the sync engine runs them on the blocking pool.
pub trait NodeRpc: Send + Sync + 'static {
    /// Header of the current tip block.
    fn get_tip_header(&self) -> IndexerResult<BlockHeader>;

    /// Block at `number` on the node's main chain, if it exists yet.
    fn get_block_by_number(&self, number: u64) -> IndexerResult<Option<IndexBlock>>;

    /// Header at `number` on the node's main chain.
    fn get_header_by_number(&self, number: u64) -> IndexerResult<Option<BlockHeader>>;

    /// Submit a signed transaction, returning its hash.
    fn send_transaction(&self, tx: Transaction) -> IndexerResult<[u8; 32]>;
}

/// CKB RPC client wrapper.
pub struct RpcClient {
    client: CkbRpcClient,
    url: String,
}

impl RpcClient {
    pub fn new(url: &str) -> Self {
        let client = CkbRpcClient::new(url);
        Self {
            client,
            url: url.to_string(),
        }
    }

    /// Get the RPC URL.
    pub fn rpc_url(&self) -> &str {
        &self.url
    }
}

fn rpc_error(what: String, e: impl std::fmt::Display) -> IndexerError {
    IndexerError::FetchFailed {
        what,
        reason: e.to_string(),
    }
}

impl NodeRpc for RpcClient {
    fn get_tip_header(&self) -> IndexerResult<BlockHeader> {
        let tip = self
            .client
            .get_tip_header()
            .map_err(|e| rpc_error("tip header".to_string(), e))?;
        Ok(BlockHeader::from(&tip))
    }

    fn get_block_by_number(&self, number: u64) -> IndexerResult<Option<IndexBlock>> {
        let block = self
            .client
            .get_block_by_number(number.into())
            .map_err(|e| rpc_error(format!("block {}", number), e))?;
        block.as_ref().map(IndexBlock::try_from).transpose()
    }

    fn get_header_by_number(&self, number: u64) -> IndexerResult<Option<BlockHeader>> {
        let header = self
            .client
            .get_header_by_number(number.into())
            .map_err(|e| rpc_error(format!("header {}", number), e))?;
        Ok(header.as_ref().map(BlockHeader::from))
    }

    fn send_transaction(&self, tx: Transaction) -> IndexerResult<[u8; 32]> {
        let hash = self
            .client
            .send_transaction(tx, None)
            .map_err(|e| rpc_error("send_transaction".to_string(), e))?;
        Ok(hash.0)
    }
}
