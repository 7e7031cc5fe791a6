//! Peer state module
//!
//! A [`Peer`] is one remote endpoint with its negotiated capabilities and
//! choke/interest flags. It is shared between the torrent's peer registry
//! and the command servicing its connection, so both observe the same flags.

use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::rc::Rc;

use crate::engine::{Cuid, SpeedMeter};
use crate::torrent::Bitfield;

/// Shared handle to a peer
pub type PeerHandle = Rc<RefCell<Peer>>;

/// Represents a peer with its state and statistics
#[derive(Debug)]
pub struct Peer {
    /// Peer address
    pub addr: SocketAddr,
    /// Peer identifier from the handshake
    pub peer_id: Option<[u8; 20]>,
    /// Session id of the command servicing this peer
    pub cuid: Cuid,
    /// We're choking them
    pub am_choking: bool,
    /// We're interested
    pub am_interested: bool,
    /// They're choking us
    pub peer_choking: bool,
    /// They're interested
    pub peer_interested: bool,
    /// They kept us choked too long while we were interested
    pub snubbing: bool,
    /// Pieces they allow us to request while choked
    pub allowed_fast_incoming: HashSet<u32>,
    /// Pieces we serve to them while choking
    pub allowed_fast_outgoing: HashSet<u32>,
    fast_extension: bool,
    bitfield: Bitfield,
    should_be_choking: bool,
    optimistic_unchoke: bool,
    choke_review_due: bool,
    download: SpeedMeter,
    upload: SpeedMeter,
    error_count: u32,
}

impl Peer {
    /// Create a new peer for a torrent with `piece_count` pieces
    pub fn new(addr: SocketAddr, piece_count: usize) -> Self {
        Self {
            addr,
            peer_id: None,
            cuid: Cuid(0),
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            snubbing: false,
            allowed_fast_incoming: HashSet::new(),
            allowed_fast_outgoing: HashSet::new(),
            fast_extension: false,
            bitfield: Bitfield::new(piece_count),
            should_be_choking: true,
            optimistic_unchoke: false,
            choke_review_due: false,
            download: SpeedMeter::new(),
            upload: SpeedMeter::new(),
            error_count: 0,
        }
    }

    /// Wrap into a shared handle
    pub fn into_handle(self) -> PeerHandle {
        Rc::new(RefCell::new(self))
    }

    pub fn set_peer_id(&mut self, peer_id: [u8; 20]) {
        self.peer_id = Some(peer_id);
    }

    /// Get the peer ID as a hex string
    pub fn peer_id_hex(&self) -> Option<String> {
        self.peer_id.map(hex::encode)
    }

    pub fn is_fast_extension_enabled(&self) -> bool {
        self.fast_extension
    }

    pub fn set_fast_extension(&mut self, enabled: bool) {
        self.fast_extension = enabled;
    }

    pub fn bitfield(&self) -> &Bitfield {
        &self.bitfield
    }

    pub fn update_bitfield(&mut self, bitfield: Bitfield) {
        self.bitfield = bitfield;
    }

    pub fn set_piece(&mut self, index: usize) {
        self.bitfield.set(index);
    }

    pub fn set_all_pieces(&mut self) {
        self.bitfield.set_all();
    }

    pub fn clear_all_pieces(&mut self) {
        self.bitfield.clear_all();
    }

    /// Check if peer has specific piece
    pub fn has_piece(&self, index: usize) -> bool {
        self.bitfield.has(index)
    }

    /// Whether the peer has every piece
    pub fn is_seeder(&self) -> bool {
        self.bitfield.is_complete()
    }

    /// Choke decision written by the choke policy
    pub fn should_be_choking(&self) -> bool {
        self.should_be_choking
    }

    pub fn set_should_be_choking(&mut self, choking: bool) {
        self.should_be_choking = choking;
    }

    pub fn is_optimistic_unchoke(&self) -> bool {
        self.optimistic_unchoke
    }

    pub fn set_optimistic_unchoke(&mut self, optimistic: bool) {
        self.optimistic_unchoke = optimistic;
    }

    /// Ask the servicing command to run its long-idle-choke check
    pub fn request_choke_review(&mut self) {
        self.choke_review_due = true;
    }

    /// Consume a pending choke review request
    pub fn take_choke_review(&mut self) -> bool {
        std::mem::take(&mut self.choke_review_due)
    }

    pub fn record_download(&mut self, bytes: u64) {
        self.download.record(bytes);
    }

    pub fn record_upload(&mut self, bytes: u64) {
        self.upload.record(bytes);
    }

    /// Download rate from this peer in bytes per second
    pub fn download_speed(&self) -> u64 {
        self.download.speed()
    }

    /// Upload rate to this peer in bytes per second
    pub fn upload_speed(&self) -> u64 {
        self.upload.speed()
    }

    pub fn downloaded(&self) -> u64 {
        self.download.total()
    }

    pub fn uploaded(&self) -> u64 {
        self.upload.total()
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn add_error(&mut self) {
        self.error_count += 1;
    }

    /// Forget everything negotiated on the last connection
    pub fn reset_status(&mut self) {
        self.am_choking = true;
        self.am_interested = false;
        self.peer_choking = true;
        self.peer_interested = false;
        self.snubbing = false;
        self.fast_extension = false;
        self.should_be_choking = true;
        self.optimistic_unchoke = false;
        self.choke_review_due = false;
        self.allowed_fast_incoming.clear();
        self.allowed_fast_outgoing.clear();
        self.bitfield.clear_all();
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr)
    }
}
