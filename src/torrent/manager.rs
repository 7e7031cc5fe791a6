//! Torrent manager interface
//!
//! The [`TorrentManager`] is the authority on one torrent: which peers are
//! being serviced, which are waiting in the pool, which pieces we have, who
//! holds a reservation on which piece, and when pieces became available.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use bytes::Bytes;

use crate::engine::{Checkpoint, Cuid};
use crate::error::Result;
use crate::peer::{Peer, PeerHandle};
use crate::protocol::BlockKey;
use crate::torrent::Bitfield;

/// Shared handle to the torrent manager
pub type TorrentHandle = Rc<RefCell<dyn TorrentManager>>;

/// Result of storing a received block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Stored, the piece still misses blocks
    Stored,
    /// Block already present or piece already complete
    Duplicate,
    /// Last block arrived and the piece verified
    PieceCompleted,
    /// Last block arrived but the digest did not match; the piece restarts
    PieceFailed,
}

/// Registry of peers and pieces for one torrent
pub trait TorrentManager: fmt::Debug {
    fn info_hash(&self) -> [u8; 20];

    fn local_peer_id(&self) -> [u8; 20];

    fn piece_count(&self) -> usize;

    /// Length of piece `index`; the last piece may be short
    fn piece_length(&self, index: u32) -> u32;

    /// Snapshot of the pieces we have
    fn bitfield(&self) -> Bitfield;

    fn has_piece(&self, index: u32) -> bool;

    fn has_all_pieces(&self) -> bool;

    /// Whether everything we want has been downloaded
    fn download_complete(&self) -> bool;

    /// Register a peer as being interacted with; false if already registered
    fn add_active_peer(&mut self, peer: &PeerHandle) -> bool;

    /// Deregister an active peer; false if it was not registered
    fn delete_active_peer(&mut self, peer: &PeerHandle) -> bool;

    fn active_peers(&self) -> Vec<PeerHandle>;

    /// Add a discovered peer to the pool; false for a duplicate address
    fn add_peer(&mut self, peer: PeerHandle) -> bool;

    /// Whether a pooled peer can be connected now
    fn is_peer_available(&self) -> bool;

    /// Take the next pooled peer
    fn get_peer(&mut self) -> Option<PeerHandle>;

    /// Allocate a fresh session id
    fn get_new_cuid(&mut self) -> Cuid;

    /// Pieces that became available after `since`, excluding those the
    /// session `cuid` downloaded itself, in ascending order
    fn get_advertised_piece_indexes(&self, cuid: Cuid, since: &Checkpoint) -> Vec<u32>;

    /// Reserve a piece the peer has and we miss, skipping `held`.
    ///
    /// While the peer chokes us only its allowed-fast pieces qualify.
    fn reserve_missing_piece(&mut self, peer: &Peer, held: &[u32]) -> Option<u32>;

    /// Release one reservation on `index`
    fn cancel_piece(&mut self, index: u32);

    /// Blocks of `index` that have not been stored yet
    fn missing_blocks(&self, index: u32) -> Vec<BlockKey>;

    /// Store a block downloaded by session `cuid`
    fn write_block(&mut self, cuid: Cuid, index: u32, begin: u32, block: &[u8]) -> Result<BlockOutcome>;

    /// Read a block of a piece we have
    fn read_block(&self, key: &BlockKey) -> Result<Bytes>;

    /// Bytes of verified pieces
    fn completed_length(&self) -> u64;

    fn total_length(&self) -> u64;
}
