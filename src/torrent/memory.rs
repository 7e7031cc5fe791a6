//! In-memory torrent manager
//!
//! [`MemoryTorrent`] keeps the whole content in memory. Pieces are assembled
//! block by block, verified against their SHA-1 digest, and then logged as
//! advertisements so every other connected peer announces them.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::rc::Rc;

use bytes::Bytes;
use rand::seq::SliceRandom;
use sha1::{Digest, Sha1};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::engine::{Checkpoint, Cuid};
use crate::error::{Result, TransferError};
use crate::peer::{Peer, PeerHandle};
use crate::protocol::BlockKey;
use crate::torrent::manager::{BlockOutcome, TorrentManager};
use crate::torrent::piece::Piece;
use crate::torrent::{Bitfield, TorrentInfo};

#[derive(Debug, Clone, Copy)]
struct Advertisement {
    index: u32,
    at: Instant,
    cuid: Cuid,
}

/// Torrent manager holding the content in memory
#[derive(Debug)]
pub struct MemoryTorrent {
    info: TorrentInfo,
    local_peer_id: [u8; 20],
    content: Vec<u8>,
    bitfield: Bitfield,
    in_progress: HashMap<u32, Piece>,
    holders: HashMap<u32, usize>,
    active: Vec<PeerHandle>,
    pool: VecDeque<PeerHandle>,
    max_peers: usize,
    next_cuid: u64,
    advertised: Vec<Advertisement>,
}

impl MemoryTorrent {
    /// Create an empty torrent awaiting download
    pub fn new(info: TorrentInfo, local_peer_id: [u8; 20], max_peers: usize) -> Self {
        let piece_count = info.piece_count();
        let size = info.total_size() as usize;
        Self {
            info,
            local_peer_id,
            content: vec![0; size],
            bitfield: Bitfield::new(piece_count),
            in_progress: HashMap::new(),
            holders: HashMap::new(),
            active: Vec::new(),
            pool: VecDeque::new(),
            max_peers,
            next_cuid: 1,
            advertised: Vec::new(),
        }
    }

    /// Create a torrent that already has all of `content`
    pub fn seeded(
        info: TorrentInfo,
        local_peer_id: [u8; 20],
        max_peers: usize,
        content: &[u8],
    ) -> Result<Self> {
        if content.len() as u64 != info.total_size() {
            return Err(TransferError::storage_error(format!(
                "Content has {} bytes, torrent expects {}",
                content.len(),
                info.total_size()
            )));
        }
        let mut torrent = Self::new(info, local_peer_id, max_peers);
        for index in 0..torrent.info.piece_count() {
            if let Some((start, end)) = torrent.info.piece_range(index) {
                torrent.store_piece(index as u32, &content[start as usize..end as usize])?;
            }
        }
        Ok(torrent)
    }

    /// Store a complete piece after checking its digest
    pub fn store_piece(&mut self, index: u32, data: &[u8]) -> Result<()> {
        let expected = self
            .info
            .piece_hash(index as usize)
            .ok_or_else(|| TransferError::storage_error(format!("No piece {}", index)))?;
        let digest: [u8; 20] = Sha1::digest(data).into();
        if digest != expected || data.len() as u32 != self.info.piece_size(index as usize) {
            return Err(TransferError::storage_error(format!(
                "Piece {} failed verification",
                index
            )));
        }
        self.commit_piece(index, data);
        Ok(())
    }

    /// Log an advertisement without touching piece data
    pub fn advertise(&mut self, index: u32, cuid: Cuid) {
        self.advertised.push(Advertisement {
            index,
            at: Instant::now(),
            cuid,
        });
    }

    fn commit_piece(&mut self, index: u32, data: &[u8]) {
        if let Some((start, _)) = self.info.piece_range(index as usize) {
            let start = start as usize;
            self.content[start..start + data.len()].copy_from_slice(data);
        }
        self.bitfield.set(index as usize);
        self.in_progress.remove(&index);
    }

    /// Number of reservations on `index`
    pub fn holders(&self, index: u32) -> usize {
        self.holders.get(&index).copied().unwrap_or(0)
    }

    pub fn info(&self) -> &TorrentInfo {
        &self.info
    }

    /// The assembled content; only verified pieces are meaningful
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// Number of peers waiting in the pool
    pub fn pooled_peers(&self) -> usize {
        self.pool.len()
    }

    /// Write the content to `path`
    pub fn write_to(&self, path: &Path) -> Result<()> {
        std::fs::write(path, &self.content).map_err(|e| {
            TransferError::storage_error(format!("Failed to write {}: {}", path.display(), e))
        })?;
        info!("Wrote {} bytes to {}", self.content.len(), path.display());
        Ok(())
    }

    fn piece_mut(&mut self, index: u32) -> &mut Piece {
        let length = self.info.piece_size(index as usize);
        self.in_progress
            .entry(index)
            .or_insert_with(|| Piece::new(index, length))
    }
}

impl TorrentManager for MemoryTorrent {
    fn info_hash(&self) -> [u8; 20] {
        self.info.info_hash
    }

    fn local_peer_id(&self) -> [u8; 20] {
        self.local_peer_id
    }

    fn piece_count(&self) -> usize {
        self.info.piece_count()
    }

    fn piece_length(&self, index: u32) -> u32 {
        self.info.piece_size(index as usize)
    }

    fn bitfield(&self) -> Bitfield {
        self.bitfield.clone()
    }

    fn has_piece(&self, index: u32) -> bool {
        self.bitfield.has(index as usize)
    }

    fn has_all_pieces(&self) -> bool {
        self.bitfield.is_complete()
    }

    fn download_complete(&self) -> bool {
        self.bitfield.is_complete()
    }

    fn add_active_peer(&mut self, peer: &PeerHandle) -> bool {
        if self.active.iter().any(|p| Rc::ptr_eq(p, peer)) {
            warn!("Peer {} is already active", peer.borrow().addr);
            return false;
        }
        debug!("Adding active peer {}", peer.borrow().addr);
        self.active.push(peer.clone());
        true
    }

    fn delete_active_peer(&mut self, peer: &PeerHandle) -> bool {
        let before = self.active.len();
        self.active.retain(|p| !Rc::ptr_eq(p, peer));
        let removed = self.active.len() != before;
        if removed {
            debug!("Removed active peer {}", peer.borrow().addr);
        }
        removed
    }

    fn active_peers(&self) -> Vec<PeerHandle> {
        self.active.clone()
    }

    fn add_peer(&mut self, peer: PeerHandle) -> bool {
        let addr = peer.borrow().addr;
        let known = self
            .pool
            .iter()
            .chain(self.active.iter())
            .any(|p| p.borrow().addr == addr);
        if known {
            return false;
        }
        debug!("Added peer {} to the pool", addr);
        self.pool.push_back(peer);
        true
    }

    fn is_peer_available(&self) -> bool {
        !self.pool.is_empty() && self.active.len() < self.max_peers
    }

    fn get_peer(&mut self) -> Option<PeerHandle> {
        if !self.is_peer_available() {
            return None;
        }
        self.pool.pop_front()
    }

    fn get_new_cuid(&mut self) -> Cuid {
        let cuid = Cuid(self.next_cuid);
        self.next_cuid += 1;
        cuid
    }

    fn get_advertised_piece_indexes(&self, cuid: Cuid, since: &Checkpoint) -> Vec<u32> {
        let mut indexes: Vec<u32> = self
            .advertised
            .iter()
            .filter(|ad| ad.cuid != cuid && ad.at > since.instant())
            .map(|ad| ad.index)
            .collect();
        indexes.sort_unstable();
        indexes.dedup();
        indexes
    }

    fn reserve_missing_piece(&mut self, peer: &Peer, held: &[u32]) -> Option<u32> {
        let candidates: Vec<u32> = (0..self.piece_count() as u32)
            .filter(|&i| peer.has_piece(i as usize) && !self.has_piece(i) && !held.contains(&i))
            .filter(|i| !peer.peer_choking || peer.allowed_fast_incoming.contains(i))
            .collect();

        let free: Vec<u32> = candidates
            .iter()
            .copied()
            .filter(|i| self.holders(*i) == 0)
            .collect();
        let pool = if free.is_empty() { &candidates } else { &free };
        let index = *pool.choose(&mut rand::thread_rng())?;

        *self.holders.entry(index).or_insert(0) += 1;
        debug!("Reserved piece {} ({} holders)", index, self.holders(index));
        Some(index)
    }

    fn cancel_piece(&mut self, index: u32) {
        if let Some(count) = self.holders.get_mut(&index) {
            *count -= 1;
            if *count == 0 {
                self.holders.remove(&index);
            }
            debug!("Released piece {}", index);
        }
    }

    fn missing_blocks(&self, index: u32) -> Vec<BlockKey> {
        if self.has_piece(index) || index as usize >= self.piece_count() {
            return Vec::new();
        }
        match self.in_progress.get(&index) {
            Some(piece) => piece.missing_blocks(),
            None => Piece::new(index, self.piece_length(index)).missing_blocks(),
        }
    }

    fn write_block(&mut self, cuid: Cuid, index: u32, begin: u32, block: &[u8]) -> Result<BlockOutcome> {
        if index as usize >= self.piece_count() {
            return Err(TransferError::protocol_error(format!(
                "Piece index {} out of range",
                index
            )));
        }
        if self.has_piece(index) {
            return Ok(BlockOutcome::Duplicate);
        }

        let piece = self.piece_mut(index);
        if !piece.write(begin, block)? {
            return Ok(BlockOutcome::Duplicate);
        }
        if !piece.is_complete() {
            return Ok(BlockOutcome::Stored);
        }

        let expected = self.info.piece_hash(index as usize).unwrap_or_default();
        let Some(piece) = self.in_progress.remove(&index) else {
            return Ok(BlockOutcome::Stored);
        };
        if !piece.verify(&expected) {
            warn!("{} - Piece {} failed hash check", cuid, index);
            return Ok(BlockOutcome::PieceFailed);
        }

        self.commit_piece(index, piece.data());
        self.advertise(index, cuid);
        info!(
            "{} - Piece {} completed ({}/{})",
            cuid,
            index,
            self.bitfield.count(),
            self.piece_count()
        );
        Ok(BlockOutcome::PieceCompleted)
    }

    fn read_block(&self, key: &BlockKey) -> Result<Bytes> {
        if !self.has_piece(key.index) {
            return Err(TransferError::storage_error(format!(
                "Piece {} is not available",
                key.index
            )));
        }
        let (start, end) = self
            .info
            .piece_range(key.index as usize)
            .ok_or_else(|| TransferError::storage_error(format!("No piece {}", key.index)))?;
        let from = start + key.begin as u64;
        let to = from + key.length as u64;
        if to > end {
            return Err(TransferError::protocol_error(format!(
                "Request begin={} length={} exceeds piece {}",
                key.begin, key.length, key.index
            )));
        }
        Ok(Bytes::copy_from_slice(&self.content[from as usize..to as usize]))
    }

    fn completed_length(&self) -> u64 {
        (0..self.piece_count())
            .filter(|&i| self.bitfield.has(i))
            .map(|i| self.info.piece_size(i) as u64)
            .sum()
    }

    fn total_length(&self) -> u64 {
        self.info.total_size()
    }
}
