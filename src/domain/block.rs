//! Block data as seen by the indexer, and the cell delta a block produces.

use std::collections::HashSet;

use ckb_jsonrpc_types::{BlockView, HeaderView};
use tracing::trace;

use super::{
    cell::{Cell, CellPosition, IndexScope, OutPoint, Script},
    error::{IndexerError, IndexerResult},
};

/// Header fields the indexer needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub number: u64,
    pub hash: [u8; 32],
    pub parent_hash: [u8; 32],
}

impl From<&HeaderView> for BlockHeader {
    fn from(view: &HeaderView) -> Self {
        Self {
            number: view.inner.number.value(),
            hash: view.hash.0,
            parent_hash: view.inner.parent_hash.0,
        }
    }
}

/// A transaction output with its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    pub capacity: u64,
    pub lock: Script,
    pub type_: Option<Script>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTransaction {
    pub hash: [u8; 32],
    pub inputs: Vec<OutPoint>,
    pub outputs: Vec<TxOutput>,
}

/// A block fetched from the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexBlock {
    pub header: BlockHeader,
    pub transactions: Vec<BlockTransaction>,
}

impl TryFrom<&BlockView> for IndexBlock {
    type Error = IndexerError;

    fn try_from(view: &BlockView) -> IndexerResult<Self> {
        let mut transactions = Vec::with_capacity(view.transactions.len());
        for tx in &view.transactions {
            let inner = &tx.inner;
            if inner.outputs.len() != inner.outputs_data.len() {
                return Err(IndexerError::InvalidData(format!(
                    "tx 0x{} has {} outputs but {} outputs_data",
                    hex::encode(tx.hash.0),
                    inner.outputs.len(),
                    inner.outputs_data.len()
                )));
            }
            let mut outputs = Vec::with_capacity(inner.outputs.len());
            for (output, data) in inner.outputs.iter().zip(inner.outputs_data.iter()) {
                outputs.push(TxOutput {
                    capacity: output.capacity.value(),
                    lock: Script::try_from(&output.lock)?,
                    type_: output.type_.as_ref().map(Script::try_from).transpose()?,
                    data: data.as_bytes().to_vec(),
                });
            }
            transactions.push(BlockTransaction {
                hash: tx.hash.0,
                inputs: inner
                    .inputs
                    .iter()
                    .map(|input| OutPoint::from(&input.previous_output))
                    .collect(),
                outputs,
            });
        }
        Ok(Self {
            header: BlockHeader::from(&view.header),
            transactions,
        })
    }
}

/// Cells created and consumed by one block, within an index scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDelta {
    pub header: BlockHeader,
    pub created: Vec<Cell>,
    pub consumed: Vec<OutPoint>,
}

impl BlockDelta {
    /// Extract the delta of `block`.
    ///
    /// With a lock scope, a consumed out point is kept when it was created
    /// earlier in this block or `is_known` reports it as indexed.
    pub fn extract<F>(block: &IndexBlock, scope: &IndexScope, mut is_known: F) -> IndexerResult<Self>
    where
        F: FnMut(&OutPoint) -> IndexerResult<bool>,
    {
        let mut created = Vec::new();
        let mut consumed = Vec::new();
        let mut created_here: HashSet<OutPoint> = HashSet::new();

        for (tx_index, tx) in block.transactions.iter().enumerate() {
            // Cellbase has no real inputs
            if tx_index > 0 {
                for input in &tx.inputs {
                    if input.is_null() {
                        continue;
                    }
                    if scope.is_all() || created_here.contains(input) || is_known(input)? {
                        consumed.push(*input);
                    }
                }
            }

            for (output_index, output) in tx.outputs.iter().enumerate() {
                if !scope.includes(&output.lock) {
                    continue;
                }
                let out_point = OutPoint::new(tx.hash, output_index as u32);
                let position = CellPosition {
                    block_number: block.header.number,
                    tx_index: tx_index as u32,
                    output_index: output_index as u32,
                };
                created.push(Cell::new(
                    out_point,
                    output.capacity,
                    output.lock.clone(),
                    output.type_.clone(),
                    &output.data,
                    position,
                ));
                created_here.insert(out_point);
            }
        }

        trace!(
            "Block {}: {} created, {} consumed",
            block.header.number,
            created.len(),
            consumed.len()
        );

        Ok(Self {
            header: block.header,
            created,
            consumed,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.consumed.is_empty()
    }
}
