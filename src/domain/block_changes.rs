//! Per-block undo records for reorg rollback.
//!
//! Every applied block stores the out points it created and consumed,
//! allowing the store to revert the block exactly when a reorg is detected.

use serde::{Deserialize, Serialize};

use super::{block::BlockDelta, cell::OutPoint, cursor::BlockRef};

/// Changes made by a single block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockUndo {
    /// Block number.
    pub block_number: u64,

    /// Block hash, used to find the fork point.
    pub block_hash: [u8; 32],

    /// Parent hash. Becomes the cursor hash when this block is reverted.
    pub parent_hash: [u8; 32],

    /// Cells created in this block.
    /// On undo: remove these cells.
    pub created: Vec<OutPoint>,

    /// Cells consumed in this block.
    /// On undo: restore these cells to live.
    pub consumed: Vec<OutPoint>,
}

impl BlockUndo {
    pub fn from_delta(delta: &BlockDelta) -> Self {
        Self {
            block_number: delta.header.number,
            block_hash: delta.header.hash,
            parent_hash: delta.header.parent_hash,
            created: delta.created.iter().map(|c| c.out_point).collect(),
            consumed: delta.consumed.clone(),
        }
    }

    /// The block this one builds on.
    pub fn parent(&self) -> Option<BlockRef> {
        self.block_number.checked_sub(1).map(|number| BlockRef {
            number,
            hash: self.parent_hash,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.consumed.is_empty()
    }
}
