//! Chain cursor tracking the last fully indexed block.

use serde::{Deserialize, Serialize};

use super::{
    block::BlockHeader,
    error::{IndexerError, IndexerResult},
};

/// A block identified by number and hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    pub number: u64,
    pub hash: [u8; 32],
}

/// Cursor persisted in LMDB together with each store mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChainCursor {
    head: Option<BlockRef>,
}

impl ChainCursor {
    /// Create a cursor that has not indexed any block.
    pub fn new() -> Self {
        Self { head: None }
    }

    pub fn at(number: u64, hash: [u8; 32]) -> Self {
        Self {
            head: Some(BlockRef { number, hash }),
        }
    }

    /// Last indexed block.
    pub fn current(&self) -> Option<BlockRef> {
        self.head
    }

    pub fn height(&self) -> Option<u64> {
        self.head.map(|h| h.number)
    }

    /// Next block to fetch.
    pub fn next_height(&self, start_block: u64) -> u64 {
        match self.head {
            Some(head) => head.number + 1,
            None => start_block,
        }
    }

    /// Move the head to `header`, which must extend the current head.
    pub fn advance(&mut self, header: &BlockHeader) -> IndexerResult<()> {
        if let Some(head) = self.head {
            if header.number != head.number + 1 {
                return Err(IndexerError::InconsistentState(format!(
                    "block {} does not follow indexed head {}",
                    header.number, head.number
                )));
            }
            if header.parent_hash != head.hash {
                return Err(IndexerError::ReorgDetected {
                    number: header.number,
                    expected: head.hash,
                    actual: header.parent_hash,
                });
            }
        }
        self.head = Some(BlockRef {
            number: header.number,
            hash: header.hash,
        });
        Ok(())
    }

    /// Reset the head to an ancestor.
    pub fn rollback(&mut self, to: BlockRef) {
        self.head = Some(to);
    }

    pub fn clear(&mut self) {
        self.head = None;
    }
}
