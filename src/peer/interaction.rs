//! Peer interaction engine
//!
//! A [`PeerInteraction`] speaks the peer wire protocol over one connection:
//! it frames the handshake and messages, keeps the outbound queue, tracks the
//! block requests outstanding at the peer and the pieces reserved for them,
//! and applies the side effects of every received message.
//!
//! The peer is registered active in the torrent manager for exactly the
//! lifetime of this value.

use std::io;
use std::rc::Rc;

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::cli::Config;
use crate::engine::{Checkpoint, Cuid, TransferStats};
use crate::error::{Result, TransferError};
use crate::net::SocketHandle;
use crate::peer::fast::{generate_allowed_fast_set, ALLOWED_FAST_SET_SIZE};
use crate::peer::PeerHandle;
use crate::protocol::handshake::HANDSHAKE_PREFIX_LENGTH;
use crate::protocol::{BlockKey, FrameReader, Handshake, Message, OutboundQueue, HANDSHAKE_LENGTH};
use crate::torrent::{Bitfield, BlockOutcome, TorrentHandle};

/// Largest block a peer may request from us
pub const MAX_REQUEST_LENGTH: u32 = 128 * 1024;

const RECV_BUFFER_SIZE: usize = 16 * 1024;

/// A block requested from the peer and not yet received
#[derive(Debug, Clone, Copy)]
pub struct RequestSlot {
    pub key: BlockKey,
    pub dispatched: Checkpoint,
}

/// Protocol engine for one peer connection
#[derive(Debug)]
pub struct PeerInteraction {
    cuid: Cuid,
    peer: PeerHandle,
    socket: SocketHandle,
    torrent: TorrentHandle,
    config: Rc<Config>,
    reader: FrameReader,
    outbound: OutboundQueue,
    slots: Vec<RequestSlot>,
    held_pieces: Vec<u32>,
    handshake_sent: bool,
    registered: bool,
}

impl PeerInteraction {
    /// Create the engine and register the peer active
    pub fn new(
        cuid: Cuid,
        peer: PeerHandle,
        socket: SocketHandle,
        torrent: TorrentHandle,
        config: Rc<Config>,
    ) -> Self {
        let registered = torrent.borrow_mut().add_active_peer(&peer);
        Self {
            cuid,
            peer,
            socket,
            torrent,
            config,
            reader: FrameReader::new(),
            outbound: OutboundQueue::new(),
            slots: Vec::new(),
            held_pieces: Vec::new(),
            handshake_sent: false,
            registered,
        }
    }

    pub fn cuid(&self) -> Cuid {
        self.cuid
    }

    pub fn peer(&self) -> &PeerHandle {
        &self.peer
    }

    pub fn socket(&self) -> &SocketHandle {
        &self.socket
    }

    /// Remove the peer from the active registry; later calls do nothing
    pub fn deregister(&mut self) {
        if !self.registered {
            return;
        }
        if let Ok(mut torrent) = self.torrent.try_borrow_mut() {
            torrent.delete_active_peer(&self.peer);
            self.registered = false;
        }
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    /// Queue our handshake and try to write it out
    pub fn send_handshake(&mut self) -> Result<()> {
        let (info_hash, peer_id) = {
            let torrent = self.torrent.borrow();
            (torrent.info_hash(), torrent.local_peer_id())
        };
        let handshake = if self.config.fast_extension {
            Handshake::with_fast_extension(info_hash, peer_id)
        } else {
            Handshake::new(info_hash, peer_id)
        };
        debug!("{} - Sending handshake to {}", self.cuid, self.peer.borrow().addr);
        self.outbound.push_handshake(&handshake);
        self.handshake_sent = true;
        self.send_messages(0)?;
        Ok(())
    }

    /// Receive the peer's handshake.
    ///
    /// Returns `Ok(None)` until all 68 bytes arrived. With `expect_incoming`
    /// our own handshake is sent as soon as the protocol name and info hash
    /// checked out, without waiting for the peer id.
    pub fn receive_handshake(&mut self, expect_incoming: bool) -> Result<Option<Handshake>> {
        let open = self.fill(HANDSHAKE_LENGTH)?;

        if self.reader.buffered() >= HANDSHAKE_PREFIX_LENGTH {
            let info_hash = self.torrent.borrow().info_hash();
            Handshake::check_prefix(self.reader.peek(), &info_hash)?;
            if expect_incoming && !self.handshake_sent {
                self.send_handshake()?;
            }
        }

        let Some(bytes) = self.reader.take_handshake() else {
            if !open {
                return Err(self.closed());
            }
            return Ok(None);
        };
        let handshake = Handshake::deserialize(&bytes)?;

        let fast = self.config.fast_extension && handshake.is_fast_extension_supported();
        {
            let mut peer = self.peer.borrow_mut();
            peer.set_peer_id(handshake.peer_id);
            peer.set_fast_extension(fast);
        }
        info!(
            "{} - Received {} from {}",
            self.cuid,
            handshake,
            self.peer.borrow().addr
        );
        if fast {
            debug!("{} - Fast extension enabled", self.cuid);
        }
        Ok(Some(handshake))
    }

    /// Read until `want` bytes are buffered or the socket runs dry.
    /// Returns false once the peer closed the stream.
    fn fill(&mut self, want: usize) -> Result<bool> {
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        while self.reader.buffered() < want {
            let result = self.socket.borrow_mut().recv(&mut buf);
            match result {
                Ok(0) => return Ok(false),
                Ok(n) => self.reader.extend(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(TransferError::network_error(
                        format!("Failed to read from {}", self.peer.borrow().addr),
                        e,
                    ))
                }
            }
        }
        Ok(true)
    }

    fn closed(&self) -> TransferError {
        TransferError::connection_closed(self.peer.borrow().addr.to_string())
    }

    /// Receive at most one complete message.
    ///
    /// Returns `Ok(None)` when no complete frame is available yet.
    pub fn receive_message(&mut self) -> Result<Option<Message>> {
        let frame = match self.reader.next_frame()? {
            Some(frame) => frame,
            None => {
                let open = self.fill(usize::MAX)?;
                match self.reader.next_frame()? {
                    Some(frame) => frame,
                    None if !open => return Err(self.closed()),
                    None => return Ok(None),
                }
            }
        };
        let message = Message::decode(frame)?;
        trace!(
            "{} - From {}: {}",
            self.cuid,
            self.peer.borrow().addr,
            message
        );
        Ok(Some(message))
    }

    /// Whether a complete frame was read from the socket but not handled yet
    pub fn has_buffered_frame(&self) -> bool {
        self.reader.has_frame()
    }

    /// Append a message to the outbound queue
    pub fn add_message(&mut self, message: Message) {
        trace!("{} - To {}: {}", self.cuid, self.peer.borrow().addr, message);
        self.outbound.push_message(&message);
    }

    pub fn count_message_in_queue(&self) -> usize {
        self.outbound.len()
    }

    /// Whether the front frame was partially written
    pub fn is_sending_in_progress(&self) -> bool {
        self.outbound.is_sending_in_progress()
    }

    pub fn outbound(&self) -> &OutboundQueue {
        &self.outbound
    }

    /// Write queued frames until the socket would block.
    ///
    /// Piece frames not started yet wait while `upload_speed` exceeds the
    /// upload limit; a started frame always runs to completion. Returns the
    /// block payload bytes uploaded.
    pub fn send_messages(&mut self, upload_speed: u64) -> Result<u64> {
        let limit = self.config.upload_limit_bytes();
        let mut uploaded = 0;

        while let Some(frame) = self.outbound.front_mut() {
            if limit > 0 && upload_speed > limit && !frame.is_started() && frame.block().is_some() {
                trace!("{} - Upload limit reached", self.cuid);
                break;
            }
            let written = match self.socket.borrow_mut().send(frame.remaining()) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(TransferError::network_error(
                        format!("Failed to send to {}", self.peer.borrow().addr),
                        e,
                    ))
                }
            };
            if written == 0 {
                break;
            }
            frame.advance(written);
            if !frame.is_done() {
                break;
            }
            uploaded += frame.block_payload_len();
            self.outbound.pop_front();
        }

        if uploaded > 0 {
            self.peer.borrow_mut().record_upload(uploaded);
        }
        Ok(uploaded)
    }

    /// Apply the side effects of a received message
    pub fn on_message_received(&mut self, message: Message, stats: &mut TransferStats) -> Result<()> {
        match message {
            Message::KeepAlive => {}
            Message::Choke => {
                let fast = {
                    let mut peer = self.peer.borrow_mut();
                    peer.peer_choking = true;
                    peer.is_fast_extension_enabled()
                };
                if !fast && !self.slots.is_empty() {
                    debug!(
                        "{} - Choked, dropping {} request slots",
                        self.cuid,
                        self.slots.len()
                    );
                    self.slots.clear();
                }
            }
            Message::Unchoke => self.peer.borrow_mut().peer_choking = false,
            Message::Interested => self.peer.borrow_mut().peer_interested = true,
            Message::NotInterested => self.peer.borrow_mut().peer_interested = false,
            Message::Have { piece_index } => {
                self.check_index(piece_index)?;
                self.peer.borrow_mut().set_piece(piece_index as usize);
            }
            Message::Bitfield { bitfield } => {
                let piece_count = self.torrent.borrow().piece_count();
                let bitfield = Bitfield::from_bytes(&bitfield, piece_count)?;
                self.peer.borrow_mut().update_bitfield(bitfield);
            }
            Message::Request {
                index,
                begin,
                length,
            } => self.on_request(BlockKey::new(index, begin, length))?,
            Message::Piece {
                index,
                begin,
                block,
            } => self.on_piece(index, begin, block, stats)?,
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                let key = BlockKey::new(index, begin, length);
                if self.outbound.remove_unstarted_piece(&key) {
                    debug!("{} - Cancelled piece index={} begin={}", self.cuid, index, begin);
                    if self.is_fast() {
                        self.add_message(Message::RejectRequest {
                            index,
                            begin,
                            length,
                        });
                    }
                }
            }
            Message::Port { listen_port } => {
                debug!("{} - Peer DHT port {}", self.cuid, listen_port);
            }
            Message::SuggestPiece { piece_index } => {
                self.require_fast("suggest piece")?;
                self.check_index(piece_index)?;
                debug!("{} - Peer suggests piece {}", self.cuid, piece_index);
            }
            Message::HaveAll => {
                self.require_fast("have all")?;
                self.peer.borrow_mut().set_all_pieces();
            }
            Message::HaveNone => {
                self.require_fast("have none")?;
                self.peer.borrow_mut().clear_all_pieces();
            }
            Message::RejectRequest {
                index,
                begin,
                length,
            } => {
                self.require_fast("reject request")?;
                let key = BlockKey::new(index, begin, length);
                let before = self.slots.len();
                self.slots.retain(|slot| slot.key != key);
                if self.slots.len() == before {
                    debug!("{} - Reject for a block we did not request", self.cuid);
                }
            }
            Message::AllowedFast { piece_index } => {
                self.require_fast("allowed fast")?;
                self.check_index(piece_index)?;
                self.peer
                    .borrow_mut()
                    .allowed_fast_incoming
                    .insert(piece_index);
            }
            Message::Extended { extended_id, .. } => {
                trace!("{} - Ignoring extended message {}", self.cuid, extended_id);
            }
        }
        Ok(())
    }

    fn is_fast(&self) -> bool {
        self.peer.borrow().is_fast_extension_enabled()
    }

    fn require_fast(&self, what: &str) -> Result<()> {
        if self.is_fast() {
            Ok(())
        } else {
            Err(TransferError::protocol_error(format!(
                "Received {} without the fast extension",
                what
            )))
        }
    }

    fn check_index(&self, index: u32) -> Result<()> {
        let piece_count = self.torrent.borrow().piece_count();
        if index as usize >= piece_count {
            return Err(TransferError::protocol_error(format!(
                "Piece index {} out of range ({} pieces)",
                index, piece_count
            )));
        }
        Ok(())
    }

    fn on_request(&mut self, key: BlockKey) -> Result<()> {
        self.check_index(key.index)?;
        if key.length == 0 || key.length > MAX_REQUEST_LENGTH {
            return Err(TransferError::protocol_error(format!(
                "Invalid request length {}",
                key.length
            )));
        }

        let (choking, allowed_fast, fast) = {
            let peer = self.peer.borrow();
            (
                peer.am_choking,
                peer.allowed_fast_outgoing.contains(&key.index),
                peer.is_fast_extension_enabled(),
            )
        };
        let have = self.torrent.borrow().has_piece(key.index);

        if (choking && !allowed_fast) || !have {
            debug!(
                "{} - Not serving index={} begin={} (choking={}, have={})",
                self.cuid, key.index, key.begin, choking, have
            );
            if fast {
                self.add_message(Message::RejectRequest {
                    index: key.index,
                    begin: key.begin,
                    length: key.length,
                });
            }
            return Ok(());
        }

        let block = self.torrent.borrow().read_block(&key)?;
        self.add_message(Message::Piece {
            index: key.index,
            begin: key.begin,
            block,
        });
        Ok(())
    }

    fn on_piece(&mut self, index: u32, begin: u32, block: Bytes, stats: &mut TransferStats) -> Result<()> {
        let key = BlockKey::new(index, begin, block.len() as u32);
        let Some(position) = self.slots.iter().position(|slot| slot.key == key) else {
            debug!(
                "{} - Unsolicited block index={} begin={}, ignoring",
                self.cuid, index, begin
            );
            return Ok(());
        };
        self.slots.remove(position);

        let length = block.len() as u64;
        self.peer.borrow_mut().record_download(length);
        stats.add_downloaded(length);

        let outcome = self
            .torrent
            .borrow_mut()
            .write_block(self.cuid, index, begin, &block)?;
        match outcome {
            BlockOutcome::PieceCompleted => self.release_piece(index),
            BlockOutcome::PieceFailed => {
                warn!("{} - Piece {} from {} failed verification", self.cuid, index, self.peer.borrow().addr);
                self.peer.borrow_mut().add_error();
            }
            BlockOutcome::Stored | BlockOutcome::Duplicate => {}
        }
        Ok(())
    }

    fn release_piece(&mut self, index: u32) {
        if let Some(position) = self.held_pieces.iter().position(|&i| i == index) {
            self.held_pieces.remove(position);
            self.torrent.borrow_mut().cancel_piece(index);
        }
    }

    /// Send interested or not interested when our interest changed
    pub fn update_interest(&mut self) {
        let interested = {
            let ours = self.torrent.borrow().bitfield();
            self.peer.borrow().bitfield().has_any_missing_from(&ours)
        };
        let changed = {
            let mut peer = self.peer.borrow_mut();
            let changed = peer.am_interested != interested;
            peer.am_interested = interested;
            changed
        };
        if changed {
            self.add_message(if interested {
                Message::Interested
            } else {
                Message::NotInterested
            });
        }
    }

    /// Choke the peer, dropping piece frames it has not started receiving.
    ///
    /// Under the fast extension every dropped block is rejected explicitly.
    pub fn choke_peer(&mut self) {
        self.peer.borrow_mut().am_choking = true;
        self.add_message(Message::Choke);

        let dropped = self.outbound.remove_unstarted_pieces();
        if dropped.is_empty() {
            return;
        }
        debug!("{} - Dropped {} queued blocks on choke", self.cuid, dropped.len());
        if !self.is_fast() {
            return;
        }
        for key in dropped {
            self.add_message(Message::RejectRequest {
                index: key.index,
                begin: key.begin,
                length: key.length,
            });
        }
    }

    pub fn unchoke_peer(&mut self) {
        self.peer.borrow_mut().am_choking = false;
        self.add_message(Message::Unchoke);
    }

    /// Drop request slots that timed out or whose piece completed meanwhile.
    ///
    /// Completed ones are cancelled at the peer.
    pub fn check_request_slot(&mut self) {
        let timeout = self.config.request_timeout();
        let cuid = self.cuid;
        self.slots.retain(|slot| {
            if slot.dispatched.elapsed_for(timeout) {
                debug!(
                    "{} - Deleting request slot index={} begin={} because of time out",
                    cuid, slot.key.index, slot.key.begin
                );
                false
            } else {
                true
            }
        });

        let mut acquired = Vec::new();
        {
            let torrent = self.torrent.borrow();
            self.slots.retain(|slot| {
                if torrent.has_piece(slot.key.index) {
                    acquired.push(slot.key);
                    false
                } else {
                    true
                }
            });
        }
        for key in acquired {
            debug!(
                "{} - Deleting request slot index={} begin={} because the block has been acquired",
                cuid, key.index, key.begin
            );
            self.add_message(Message::Cancel {
                index: key.index,
                begin: key.begin,
                length: key.length,
            });
        }
    }

    /// Fill request slots up to the outstanding-request limit.
    ///
    /// Never requests a block that is already outstanding at this peer.
    /// Returns the number of requests queued.
    pub fn add_requests(&mut self) -> Result<usize> {
        if self.torrent.borrow().download_complete() {
            return Ok(0);
        }
        let max = self.config.max_outstanding_requests;
        let mut added = 0;

        while self.slots.len() < max {
            if let Some(key) = self.next_block() {
                self.slots.push(RequestSlot {
                    key,
                    dispatched: Checkpoint::new(),
                });
                self.add_message(Message::Request {
                    index: key.index,
                    begin: key.begin,
                    length: key.length,
                });
                added += 1;
                continue;
            }

            let reserved = {
                let peer = self.peer.borrow();
                self.torrent
                    .borrow_mut()
                    .reserve_missing_piece(&peer, &self.held_pieces)
            };
            match reserved {
                Some(index) => self.held_pieces.push(index),
                None => break,
            }
        }

        if added > 0 {
            trace!("{} - Queued {} requests", self.cuid, added);
        }
        Ok(added)
    }

    fn next_block(&self) -> Option<BlockKey> {
        let peer = self.peer.borrow();
        let torrent = self.torrent.borrow();
        self.held_pieces
            .iter()
            .filter(|index| !peer.peer_choking || peer.allowed_fast_incoming.contains(index))
            .flat_map(|&index| torrent.missing_blocks(index))
            .find(|key| !self.slots.iter().any(|slot| slot.key == *key))
    }

    /// Release reservations on pieces that completed, whoever downloaded
    /// them, and refresh our interest in the peer
    pub fn sync_piece(&mut self) {
        let completed: Vec<u32> = {
            let torrent = self.torrent.borrow();
            self.held_pieces
                .iter()
                .copied()
                .filter(|&index| torrent.has_piece(index))
                .collect()
        };
        for index in completed {
            self.release_piece(index);
        }
        self.update_interest();
    }

    /// Release every piece reservation and forget outstanding requests
    pub fn abort_all_pieces(&mut self) {
        if self.held_pieces.is_empty() && self.slots.is_empty() {
            return;
        }
        debug!(
            "{} - Releasing {} pieces held by {}",
            self.cuid,
            self.held_pieces.len(),
            self.peer.borrow().addr
        );
        self.slots.clear();
        let mut torrent = self.torrent.borrow_mut();
        for index in self.held_pieces.drain(..) {
            torrent.cancel_piece(index);
        }
    }

    pub fn request_slots(&self) -> &[RequestSlot] {
        &self.slots
    }

    pub fn held_pieces(&self) -> &[u32] {
        &self.held_pieces
    }

    /// Announce our pieces: have-all or have-none when the fast extension
    /// allows it, a bitfield otherwise
    pub fn send_bitfield(&mut self) {
        let (bitfield, complete) = {
            let torrent = self.torrent.borrow();
            (torrent.bitfield(), torrent.has_all_pieces())
        };
        let message = if self.is_fast() && complete {
            Message::HaveAll
        } else if self.is_fast() && bitfield.is_empty() {
            Message::HaveNone
        } else {
            Message::Bitfield {
                bitfield: bitfield.to_bytes(),
            }
        };
        self.add_message(message);
    }

    /// Offer the allowed-fast set pieces we have
    pub fn send_allowed_fast(&mut self) {
        if !self.is_fast() {
            return;
        }
        let (info_hash, piece_count) = {
            let torrent = self.torrent.borrow();
            (torrent.info_hash(), torrent.piece_count() as u32)
        };
        let ip = self.peer.borrow().addr.ip();
        let set = generate_allowed_fast_set(&info_hash, ip, piece_count, ALLOWED_FAST_SET_SIZE);
        for index in set {
            if !self.torrent.borrow().has_piece(index) {
                continue;
            }
            self.peer.borrow_mut().allowed_fast_outgoing.insert(index);
            self.add_message(Message::AllowedFast { piece_index: index });
        }
    }
}

impl Drop for PeerInteraction {
    fn drop(&mut self) {
        self.deregister();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    use crate::net::Connection;
    use crate::peer::Peer;
    use crate::protocol::{FrameKind, MessageId};
    use crate::torrent::{MemoryTorrent, TorrentInfo, TorrentManager, BLOCK_LENGTH};

    struct Fixture {
        interaction: PeerInteraction,
        remote: SocketHandle,
        torrent: Rc<RefCell<MemoryTorrent>>,
        peer: PeerHandle,
    }

    fn content() -> Vec<u8> {
        (0..BLOCK_LENGTH * 4).map(|i| (i % 239) as u8).collect()
    }

    fn fixture_with(config: Config, seeded: bool) -> Fixture {
        let info = TorrentInfo::from_content("data.bin", BLOCK_LENGTH * 2, &content());
        let torrent = if seeded {
            MemoryTorrent::seeded(info, [7u8; 20], 10, &content()).unwrap()
        } else {
            MemoryTorrent::new(info, [7u8; 20], 10)
        };
        let torrent = Rc::new(RefCell::new(torrent));
        let handle: TorrentHandle = torrent.clone();
        let peer = Peer::new("10.1.1.1:6881".parse().unwrap(), 2).into_handle();
        let (local, remote) = Connection::pipe_pair(1 << 20);
        let interaction = PeerInteraction::new(
            Cuid(1),
            peer.clone(),
            local.into_handle(),
            handle,
            Rc::new(config),
        );
        Fixture {
            interaction,
            remote: remote.into_handle(),
            torrent,
            peer,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Config::default(), false)
    }

    fn write_remote(remote: &SocketHandle, bytes: &[u8]) {
        remote.borrow_mut().send(bytes).unwrap();
    }

    fn drain_remote(remote: &SocketHandle) -> Vec<Message> {
        let mut reader = FrameReader::new();
        let mut buf = [0u8; 4096];
        while let Ok(n) = remote.borrow_mut().recv(&mut buf) {
            if n == 0 {
                break;
            }
            reader.extend(&buf[..n]);
        }
        let mut messages = Vec::new();
        while let Some(frame) = reader.next_frame().unwrap() {
            messages.push(Message::decode(frame).unwrap());
        }
        messages
    }

    #[test]
    fn test_registration_follows_lifetime() {
        let fx = fixture();
        assert_eq!(fx.torrent.borrow().active_peers().len(), 1);
        let Fixture {
            mut interaction,
            torrent,
            ..
        } = fx;
        interaction.deregister();
        interaction.deregister();
        assert!(torrent.borrow().active_peers().is_empty());
        drop(interaction);
        assert!(torrent.borrow().active_peers().is_empty());
    }

    #[test]
    fn test_drop_deregisters() {
        let fx = fixture();
        let torrent = fx.torrent.clone();
        drop(fx);
        assert!(torrent.borrow().active_peers().is_empty());
    }

    #[test]
    fn test_handshake_waits_for_all_bytes() {
        let mut fx = fixture();
        let info_hash = fx.torrent.borrow().info_hash();
        let theirs = Handshake::with_fast_extension(info_hash, [9u8; 20]).serialize();

        write_remote(&fx.remote, &theirs[..50]);
        assert!(fx.interaction.receive_handshake(true).unwrap().is_none());
        // Quick reply once the info hash checked out
        assert_eq!(fx.interaction.count_message_in_queue(), 0);
        let mut reply = [0u8; 68];
        assert_eq!(fx.remote.borrow_mut().recv(&mut reply).unwrap(), 68);
        assert_eq!(&reply[28..48], &info_hash);

        write_remote(&fx.remote, &theirs[50..]);
        let handshake = fx.interaction.receive_handshake(true).unwrap().unwrap();
        assert_eq!(handshake.peer_id, [9u8; 20]);
        assert_eq!(fx.peer.borrow().peer_id, Some([9u8; 20]));
        assert!(fx.peer.borrow().is_fast_extension_enabled());
    }

    #[test]
    fn test_handshake_rejects_wrong_info_hash() {
        let mut fx = fixture();
        let theirs = Handshake::new([0xee; 20], [9u8; 20]).serialize();
        write_remote(&fx.remote, &theirs);
        assert!(matches!(
            fx.interaction.receive_handshake(false),
            Err(TransferError::Protocol { .. })
        ));
    }

    #[test]
    fn test_receive_message_partial_frames() {
        let mut fx = fixture();
        let have = Message::Have { piece_index: 1 }.serialize();
        write_remote(&fx.remote, &have[..6]);
        assert!(fx.interaction.receive_message().unwrap().is_none());
        write_remote(&fx.remote, &have[6..]);
        assert_eq!(
            fx.interaction.receive_message().unwrap(),
            Some(Message::Have { piece_index: 1 })
        );
    }

    #[test]
    fn test_receive_message_on_closed_connection() {
        let mut fx = fixture();
        fx.remote.borrow_mut().close();
        assert!(matches!(
            fx.interaction.receive_message(),
            Err(TransferError::ConnectionClosed { .. })
        ));
    }

    #[test]
    fn test_malformed_frame_is_protocol_error() {
        let mut fx = fixture();
        write_remote(&fx.remote, &[0, 0, 0, 2, 4, 0]);
        assert!(matches!(
            fx.interaction.receive_message(),
            Err(TransferError::Protocol { .. })
        ));
    }

    #[test]
    fn test_outbound_order_is_preserved() {
        let mut fx = fixture();
        for index in 0..10 {
            fx.interaction.add_message(Message::Have { piece_index: index });
        }
        fx.interaction.send_messages(0).unwrap();
        let received = drain_remote(&fx.remote);
        let expected: Vec<Message> = (0..10).map(|i| Message::Have { piece_index: i }).collect();
        assert_eq!(received, expected);
    }

    #[test]
    fn test_partial_send_resumes() {
        let info = TorrentInfo::from_content("data.bin", BLOCK_LENGTH * 2, &content());
        let torrent = Rc::new(RefCell::new(MemoryTorrent::new(info, [7u8; 20], 10)));
        let peer = Peer::new("10.1.1.1:6881".parse().unwrap(), 2).into_handle();
        let (local, remote) = Connection::pipe_pair(6);
        let remote = remote.into_handle();
        let mut interaction = PeerInteraction::new(
            Cuid(1),
            peer,
            local.into_handle(),
            torrent,
            Rc::new(Config::default()),
        );

        interaction.add_message(Message::Have { piece_index: 1 });
        interaction.add_message(Message::Unchoke);
        interaction.send_messages(0).unwrap();
        assert!(interaction.is_sending_in_progress());

        let mut received = Vec::new();
        let mut buf = [0u8; 16];
        while interaction.count_message_in_queue() > 0 {
            let n = remote.borrow_mut().recv(&mut buf).unwrap();
            received.extend_from_slice(&buf[..n]);
            interaction.send_messages(0).unwrap();
        }
        while let Ok(n) = remote.borrow_mut().recv(&mut buf) {
            received.extend_from_slice(&buf[..n]);
        }

        let mut expected = Message::Have { piece_index: 1 }.serialize().to_vec();
        expected.extend_from_slice(&Message::Unchoke.serialize());
        assert_eq!(received, expected);
    }

    #[test]
    fn test_upload_limit_holds_back_unstarted_pieces() {
        let mut config = Config::default();
        config.upload_limit = 1;
        let limit = config.upload_limit_bytes();
        let mut fx = fixture_with(config, true);
        let block = Bytes::from(vec![5u8; 64]);

        fx.interaction.add_message(Message::Have { piece_index: 0 });
        fx.interaction.add_message(Message::Piece {
            index: 0,
            begin: 0,
            block: block.clone(),
        });
        fx.interaction.add_message(Message::Unchoke);

        assert_eq!(fx.interaction.send_messages(limit + 1).unwrap(), 0);
        assert_eq!(
            fx.interaction.outbound().kinds(),
            vec![
                FrameKind::Message(MessageId::Piece),
                FrameKind::Message(MessageId::Unchoke)
            ]
        );

        assert_eq!(fx.interaction.send_messages(limit).unwrap(), 64);
        assert_eq!(fx.interaction.count_message_in_queue(), 0);
        assert_eq!(
            drain_remote(&fx.remote),
            vec![
                Message::Have { piece_index: 0 },
                Message::Piece {
                    index: 0,
                    begin: 0,
                    block
                },
                Message::Unchoke
            ]
        );
    }

    #[test]
    fn test_started_piece_finishes_over_upload_limit() {
        let info = TorrentInfo::from_content("data.bin", BLOCK_LENGTH * 2, &content());
        let torrent = Rc::new(RefCell::new(MemoryTorrent::new(info, [7u8; 20], 10)));
        let peer = Peer::new("10.1.1.1:6881".parse().unwrap(), 2).into_handle();
        let (local, remote) = Connection::pipe_pair(20);
        let remote = remote.into_handle();
        let mut config = Config::default();
        config.upload_limit = 1;
        let mut interaction =
            PeerInteraction::new(Cuid(1), peer, local.into_handle(), torrent, Rc::new(config));

        interaction.add_message(Message::Piece {
            index: 1,
            begin: 0,
            block: Bytes::from(vec![9u8; 64]),
        });
        assert_eq!(interaction.send_messages(0).unwrap(), 0);
        assert!(interaction.is_sending_in_progress());

        let mut uploaded = 0;
        let mut buf = [0u8; 32];
        for _ in 0..10 {
            if interaction.count_message_in_queue() == 0 {
                break;
            }
            remote.borrow_mut().recv(&mut buf).unwrap();
            uploaded += interaction.send_messages(u64::MAX).unwrap();
        }
        assert_eq!(interaction.count_message_in_queue(), 0);
        assert_eq!(uploaded, 64);
    }

    #[test]
    fn test_requests_are_not_duplicated() {
        let mut config = Config::default();
        config.max_outstanding_requests = 3;
        let mut fx = fixture_with(config, false);
        {
            let mut peer = fx.peer.borrow_mut();
            peer.set_all_pieces();
            peer.peer_choking = false;
        }

        assert_eq!(fx.interaction.add_requests().unwrap(), 3);
        assert_eq!(fx.interaction.add_requests().unwrap(), 0);

        let mut keys: Vec<BlockKey> = fx.interaction.request_slots().iter().map(|s| s.key).collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), 3);
        assert_eq!(fx.interaction.held_pieces().len(), 2);
    }

    #[test]
    fn test_choked_peer_gets_no_requests() {
        let mut fx = fixture();
        fx.peer.borrow_mut().set_all_pieces();
        assert_eq!(fx.interaction.add_requests().unwrap(), 0);
        assert!(fx.interaction.held_pieces().is_empty());
    }

    #[test]
    fn test_piece_completion_releases_reservation() {
        let data = content();
        let mut config = Config::default();
        config.max_outstanding_requests = 2;
        let mut fx = fixture_with(config, false);
        {
            let mut peer = fx.peer.borrow_mut();
            peer.set_piece(0);
            peer.peer_choking = false;
        }
        fx.interaction.add_requests().unwrap();
        assert_eq!(fx.interaction.held_pieces(), &[0]);
        assert_eq!(fx.torrent.borrow().holders(0), 1);

        let mut stats = TransferStats::new();
        for begin in [0, BLOCK_LENGTH] {
            let block = Bytes::copy_from_slice(&data[begin as usize..(begin + BLOCK_LENGTH) as usize]);
            fx.interaction
                .on_message_received(Message::Piece { index: 0, begin, block }, &mut stats)
                .unwrap();
        }

        assert!(fx.torrent.borrow().has_piece(0));
        assert!(fx.interaction.held_pieces().is_empty());
        assert_eq!(fx.torrent.borrow().holders(0), 0);
        assert_eq!(stats.downloaded(), BLOCK_LENGTH as u64 * 2);
    }

    #[test]
    fn test_abort_all_pieces_is_idempotent() {
        let mut fx = fixture();
        {
            let mut peer = fx.peer.borrow_mut();
            peer.set_all_pieces();
            peer.peer_choking = false;
        }
        fx.interaction.add_requests().unwrap();
        assert_eq!(fx.torrent.borrow().holders(0) + fx.torrent.borrow().holders(1), 2);

        fx.interaction.abort_all_pieces();
        fx.interaction.abort_all_pieces();
        assert_eq!(fx.torrent.borrow().holders(0) + fx.torrent.borrow().holders(1), 0);
        assert!(fx.interaction.request_slots().is_empty());
    }

    #[test]
    fn test_request_served_only_when_unchoked() {
        let mut fx = fixture_with(Config::default(), true);
        let mut stats = TransferStats::new();
        let request = Message::Request {
            index: 1,
            begin: 0,
            length: 1024,
        };

        fx.interaction.on_message_received(request.clone(), &mut stats).unwrap();
        assert_eq!(fx.interaction.count_message_in_queue(), 0);

        fx.interaction.unchoke_peer();
        fx.interaction.on_message_received(request, &mut stats).unwrap();
        assert_eq!(
            fx.interaction.outbound().kinds(),
            vec![
                FrameKind::Message(MessageId::Unchoke),
                FrameKind::Message(MessageId::Piece)
            ]
        );

        let uploaded = fx.interaction.send_messages(0).unwrap();
        assert_eq!(uploaded, 1024);
        assert_eq!(fx.peer.borrow().uploaded(), 1024);
    }

    #[test]
    fn test_fast_request_while_choking_is_rejected() {
        let mut fx = fixture_with(Config::default(), true);
        fx.peer.borrow_mut().set_fast_extension(true);
        let mut stats = TransferStats::new();
        fx.interaction
            .on_message_received(
                Message::Request {
                    index: 0,
                    begin: 0,
                    length: 512,
                },
                &mut stats,
            )
            .unwrap();
        assert!(fx.interaction.outbound().contains(MessageId::RejectRequest));
    }

    #[test]
    fn test_cancel_drops_queued_piece() {
        let mut fx = fixture_with(Config::default(), true);
        let mut stats = TransferStats::new();
        fx.interaction.unchoke_peer();
        fx.interaction
            .on_message_received(
                Message::Request {
                    index: 0,
                    begin: 0,
                    length: 256,
                },
                &mut stats,
            )
            .unwrap();
        fx.interaction
            .on_message_received(
                Message::Cancel {
                    index: 0,
                    begin: 0,
                    length: 256,
                },
                &mut stats,
            )
            .unwrap();
        assert!(!fx.interaction.outbound().contains(MessageId::Piece));
    }

    #[test]
    fn test_fast_messages_require_negotiation() {
        let mut fx = fixture();
        let mut stats = TransferStats::new();
        assert!(fx
            .interaction
            .on_message_received(Message::HaveAll, &mut stats)
            .is_err());

        fx.peer.borrow_mut().set_fast_extension(true);
        fx.interaction.on_message_received(Message::HaveAll, &mut stats).unwrap();
        assert!(fx.peer.borrow().is_seeder());
        fx.interaction
            .on_message_received(Message::AllowedFast { piece_index: 1 }, &mut stats)
            .unwrap();
        assert!(fx.peer.borrow().allowed_fast_incoming.contains(&1));
    }

    #[test]
    fn test_have_out_of_range_is_protocol_error() {
        let mut fx = fixture();
        let mut stats = TransferStats::new();
        assert!(fx
            .interaction
            .on_message_received(Message::Have { piece_index: 2 }, &mut stats)
            .is_err());
    }

    #[test]
    fn test_interest_follows_peer_pieces() {
        let mut fx = fixture();
        fx.interaction.update_interest();
        assert_eq!(fx.interaction.count_message_in_queue(), 0);

        fx.peer.borrow_mut().set_piece(1);
        fx.interaction.update_interest();
        assert!(fx.peer.borrow().am_interested);
        assert!(fx.interaction.outbound().contains(MessageId::Interested));
    }

    #[test]
    fn test_send_bitfield_variants() {
        let mut fx = fixture_with(Config::default(), true);
        fx.interaction.send_bitfield();
        assert!(fx.interaction.outbound().contains(MessageId::Bitfield));

        let mut fast = fixture_with(Config::default(), true);
        fast.peer.borrow_mut().set_fast_extension(true);
        fast.interaction.send_bitfield();
        assert!(fast.interaction.outbound().contains(MessageId::HaveAll));

        let mut empty = fixture();
        empty.peer.borrow_mut().set_fast_extension(true);
        empty.interaction.send_bitfield();
        assert!(empty.interaction.outbound().contains(MessageId::HaveNone));
    }
}
