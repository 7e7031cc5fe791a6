//! Piece bitfields
//!
//! Bits are numbered from the high bit of the first byte, as on the wire.

use bytes::Bytes;

use crate::error::{Result, TransferError};

/// Which pieces a side has
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: usize,
}

impl Bitfield {
    /// Creates an empty bitfield for `piece_count` pieces
    pub fn new(piece_count: usize) -> Self {
        Self {
            bits: vec![0; piece_count.div_ceil(8)],
            piece_count,
        }
    }

    /// Creates a bitfield with every piece set
    pub fn full(piece_count: usize) -> Self {
        let mut bf = Self {
            bits: vec![0xFF; piece_count.div_ceil(8)],
            piece_count,
        };
        bf.clear_spare_bits();
        bf
    }

    /// Parses a bitfield received from a peer.
    ///
    /// The byte length must match the piece count exactly; spare trailing
    /// bits are ignored.
    pub fn from_bytes(bytes: &[u8], piece_count: usize) -> Result<Self> {
        let expected = piece_count.div_ceil(8);
        if bytes.len() != expected {
            return Err(TransferError::protocol_error(format!(
                "Bitfield has {} bytes, expected {}",
                bytes.len(),
                expected
            )));
        }
        let mut bf = Self {
            bits: bytes.to_vec(),
            piece_count,
        };
        bf.clear_spare_bits();
        Ok(bf)
    }

    fn clear_spare_bits(&mut self) {
        let spare = self.bits.len() * 8 - self.piece_count;
        if spare > 0 {
            if let Some(last) = self.bits.last_mut() {
                *last &= 0xFFu8 << spare;
            }
        }
    }

    pub fn has(&self, index: usize) -> bool {
        if index >= self.piece_count {
            return false;
        }
        (self.bits[index / 8] >> (7 - index % 8)) & 1 == 1
    }

    pub fn set(&mut self, index: usize) {
        if index < self.piece_count {
            self.bits[index / 8] |= 1 << (7 - index % 8);
        }
    }

    pub fn clear(&mut self, index: usize) {
        if index < self.piece_count {
            self.bits[index / 8] &= !(1 << (7 - index % 8));
        }
    }

    /// Sets every piece
    pub fn set_all(&mut self) {
        *self = Self::full(self.piece_count);
    }

    /// Clears every piece
    pub fn clear_all(&mut self) {
        self.bits.iter_mut().for_each(|b| *b = 0);
    }

    /// Number of set pieces
    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.count() == self.piece_count
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    pub fn piece_count(&self) -> usize {
        self.piece_count
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    /// Indices set here but not in `ours`
    pub fn missing_from(&self, ours: &Bitfield) -> Vec<usize> {
        (0..self.piece_count)
            .filter(|&i| self.has(i) && !ours.has(i))
            .collect()
    }

    /// Whether this side has any piece `ours` lacks
    pub fn has_any_missing_from(&self, ours: &Bitfield) -> bool {
        (0..self.piece_count).any(|i| self.has(i) && !ours.has(i))
    }
}
