//! Pieces in progress
//!
//! A [`Piece`] buffers the blocks of one piece until every block arrived and
//! the SHA-1 digest can be checked.

use sha1::{Digest, Sha1};

use crate::error::{Result, TransferError};
use crate::protocol::BlockKey;

/// Standard request size
pub const BLOCK_LENGTH: u32 = 16 * 1024;

/// A piece being assembled from blocks
#[derive(Debug, Clone)]
pub struct Piece {
    index: u32,
    length: u32,
    have: Vec<bool>,
    data: Vec<u8>,
}

impl Piece {
    pub fn new(index: u32, length: u32) -> Self {
        let blocks = length.div_ceil(BLOCK_LENGTH) as usize;
        Self {
            index,
            length,
            have: vec![false; blocks],
            data: vec![0; length as usize],
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn block_count(&self) -> usize {
        self.have.len()
    }

    /// Coordinates of block `n`
    pub fn block_key(&self, n: usize) -> BlockKey {
        let begin = n as u32 * BLOCK_LENGTH;
        BlockKey::new(self.index, begin, BLOCK_LENGTH.min(self.length - begin))
    }

    /// Blocks that have not arrived yet, in offset order
    pub fn missing_blocks(&self) -> Vec<BlockKey> {
        (0..self.have.len())
            .filter(|&n| !self.have[n])
            .map(|n| self.block_key(n))
            .collect()
    }

    /// Store a received block; returns false for a duplicate
    pub fn write(&mut self, begin: u32, block: &[u8]) -> Result<bool> {
        if begin % BLOCK_LENGTH != 0 {
            return Err(TransferError::protocol_error(format!(
                "Block offset {} of piece {} is not aligned",
                begin, self.index
            )));
        }
        let n = (begin / BLOCK_LENGTH) as usize;
        if n >= self.have.len() || block.len() as u32 != self.block_key(n).length {
            return Err(TransferError::protocol_error(format!(
                "Block begin={} length={} does not fit piece {} of length {}",
                begin,
                block.len(),
                self.index,
                self.length
            )));
        }
        if self.have[n] {
            return Ok(false);
        }
        let start = begin as usize;
        self.data[start..start + block.len()].copy_from_slice(block);
        self.have[n] = true;
        Ok(true)
    }

    pub fn is_complete(&self) -> bool {
        self.have.iter().all(|&h| h)
    }

    /// Whether the assembled data hashes to `expected`
    pub fn verify(&self, expected: &[u8; 20]) -> bool {
        let digest: [u8; 20] = Sha1::digest(&self.data).into();
        digest == *expected
    }

    /// Forget every received block
    pub fn reset(&mut self) {
        self.have.iter_mut().for_each(|h| *h = false);
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}
