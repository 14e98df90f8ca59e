//! Confirmed block membership and the bounded chain mirror.

use chronoq_core::errors::{ChronoqError, Result};
use chronoq_core::hash::TxHash;
use std::collections::VecDeque;

/// A mined block as the log records it: height, hash, and its member
/// transactions split into those this log already had an id for and those
/// it only ever saw by hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub height: u32,
    pub hash: TxHash,
    pub known: Vec<u64>,
    pub unknown: Vec<TxHash>,
}

impl Block {
    pub fn new(height: u32, hash: TxHash, known: Vec<u64>, unknown: Vec<TxHash>) -> Self {
        Self {
            height,
            hash,
            known,
            unknown,
        }
    }
}

/// An ordered window of at most `max_blocks` recent blocks, plus the
/// derived tip height. Contiguous by height; a reorg pops from the tail
/// before a new tip is appended.
pub struct ChainMirror {
    max_blocks: usize,
    blocks: VecDeque<Block>,
}

impl ChainMirror {
    pub fn new(max_blocks: usize) -> Self {
        Self {
            max_blocks,
            blocks: VecDeque::new(),
        }
    }

    pub fn tip(&self) -> Option<u32> {
        self.blocks.back().map(|b| b.height)
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn blocks(&self) -> impl DoubleEndedIterator<Item = &Block> {
        self.blocks.iter()
    }

    /// Appends a new tip block. Requires contiguity with the current tip
    /// unless the mirror is empty.
    pub fn push(&mut self, block: Block) -> Result<()> {
        if let Some(tip) = self.tip() {
            if block.height != tip + 1 {
                return Err(ChronoqError::invariant(format!(
                    "chain mirror expected height {}, got {}",
                    tip + 1,
                    block.height
                )));
            }
        }
        self.blocks.push_back(block);
        if self.blocks.len() > self.max_blocks {
            self.blocks.pop_front();
        }
        Ok(())
    }

    /// Pops the tip block, used while unwinding a reorg before mining the
    /// replacement chain back in.
    pub fn pop(&mut self) -> Option<Block> {
        self.blocks.pop_back()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_contiguous_append() {
        let mut mirror = ChainMirror::new(6);
        mirror.push(Block::new(10, TxHash::ZERO, vec![], vec![])).unwrap();
        let err = mirror.push(Block::new(12, TxHash::ZERO, vec![], vec![]));
        assert!(err.is_err());
    }

    #[test]
    fn truncates_to_max_blocks_from_the_front() {
        let mut mirror = ChainMirror::new(3);
        for h in 0..5u32 {
            mirror.push(Block::new(h, TxHash::ZERO, vec![], vec![])).unwrap();
        }
        assert_eq!(mirror.len(), 3);
        assert_eq!(mirror.tip(), Some(4));
        assert_eq!(mirror.blocks().next().unwrap().height, 2);
    }

    #[test]
    fn pop_restores_previous_tip() {
        let mut mirror = ChainMirror::new(6);
        mirror.push(Block::new(5, TxHash::ZERO, vec![], vec![])).unwrap();
        mirror.push(Block::new(6, TxHash::ZERO, vec![], vec![])).unwrap();
        let popped = mirror.pop().unwrap();
        assert_eq!(popped.height, 6);
        assert_eq!(mirror.tip(), Some(5));
    }
}
