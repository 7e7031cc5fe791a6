//! Peer interaction command
//!
//! [`PeerInteractionCommand`] sequences one peer connection: handshake,
//! piece announcement, then the steady-state pump that applies choke
//! decisions, drains inbound messages, watches for flooding, keeps request
//! slots filled, batches have announcements and sends keep-alives.

use std::rc::Rc;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::cli::Config;
use crate::engine::{
    Checkpoint, Command, CommandId, CommandStatus, Cuid, EngineContext, SocketWatch, Wait,
};
use crate::error::{Result, TransferError};
use crate::net::SocketHandle;
use crate::peer::interaction::PeerInteraction;
use crate::peer::slot::PeerConnectionSlotCommand;
use crate::peer::PeerHandle;
use crate::protocol::Message;
use crate::torrent::TorrentHandle;

/// Length of one flood detection window
pub const FLOODING_CHECK_INTERVAL: Duration = Duration::from_secs(5);
/// Choke and unchoke messages per second that count as flooding
pub const MAX_CHOKE_UNCHOKE_RATE: f64 = 0.4;
/// Keep-alive messages per second that count as flooding
pub const MAX_KEEP_ALIVE_RATE: f64 = 1.0;
/// Newly available pieces from which one bitfield replaces single haves
pub const HAVE_BATCH_THRESHOLD: usize = 20;
/// Inbound messages handled per turn
pub const MAX_RECEIVE_PER_TURN: usize = 50;
/// Longest a wired connection sleeps without socket activity
const PUMP_INTERVAL: Duration = Duration::from_secs(1);

/// Where the connection is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sequence {
    InitiatorSendHandshake,
    InitiatorWaitHandshake,
    ReceiverWaitHandshake,
    Wired,
}

/// Drives one peer connection from handshake to teardown
#[derive(Debug)]
pub struct PeerInteractionCommand {
    id: CommandId,
    cuid: Cuid,
    sequence: Sequence,
    initiator: bool,
    peer: PeerHandle,
    torrent: TorrentHandle,
    config: Rc<Config>,
    interaction: PeerInteraction,
    watch: SocketWatch,
    rate_limited: bool,
    aborted: bool,
    choke_unchoke_count: u32,
    // Counted but not checked: the have-rate flood rule is inactive
    have_count: u32,
    keep_alive_count: u32,
    freq_checkpoint: Checkpoint,
    choke_checkpoint: Checkpoint,
    keep_alive_checkpoint: Checkpoint,
    have_checkpoint: Checkpoint,
    pump_checkpoint: Checkpoint,
}

impl PeerInteractionCommand {
    /// Command for a connection we established
    pub fn initiator(
        id: CommandId,
        cuid: Cuid,
        peer: PeerHandle,
        socket: SocketHandle,
        torrent: TorrentHandle,
        config: Rc<Config>,
    ) -> Self {
        Self::new(id, cuid, peer, socket, torrent, config, Sequence::InitiatorSendHandshake)
    }

    /// Command for a connection the peer opened
    pub fn receiver(
        id: CommandId,
        cuid: Cuid,
        peer: PeerHandle,
        socket: SocketHandle,
        torrent: TorrentHandle,
        config: Rc<Config>,
    ) -> Self {
        Self::new(id, cuid, peer, socket, torrent, config, Sequence::ReceiverWaitHandshake)
    }

    fn new(
        id: CommandId,
        cuid: Cuid,
        peer: PeerHandle,
        socket: SocketHandle,
        torrent: TorrentHandle,
        config: Rc<Config>,
        sequence: Sequence,
    ) -> Self {
        peer.borrow_mut().cuid = cuid;
        let interaction = PeerInteraction::new(
            cuid,
            peer.clone(),
            socket.clone(),
            torrent.clone(),
            config.clone(),
        );
        let watch = SocketWatch::new(socket, config.peer_connection_timeout());
        Self {
            id,
            cuid,
            sequence,
            initiator: sequence == Sequence::InitiatorSendHandshake,
            peer,
            torrent,
            config,
            interaction,
            watch,
            rate_limited: false,
            aborted: false,
            choke_unchoke_count: 0,
            have_count: 0,
            keep_alive_count: 0,
            freq_checkpoint: Checkpoint::new(),
            choke_checkpoint: Checkpoint::new(),
            keep_alive_checkpoint: Checkpoint::new(),
            have_checkpoint: Checkpoint::new(),
            pump_checkpoint: Checkpoint::new(),
        }
    }

    pub fn sequence(&self) -> Sequence {
        self.sequence
    }

    pub fn interaction(&self) -> &PeerInteraction {
        &self.interaction
    }

    pub fn interaction_mut(&mut self) -> &mut PeerInteraction {
        &mut self.interaction
    }

    /// Choke/unchoke, have and keep-alive counts of the current flood window
    pub fn flood_counters(&self) -> (u32, u32, u32) {
        (self.choke_unchoke_count, self.have_count, self.keep_alive_count)
    }

    fn execute_internal(&mut self, ctx: &mut EngineContext) -> Result<()> {
        match self.sequence {
            Sequence::InitiatorSendHandshake => {
                self.interaction.send_handshake()?;
                self.sequence = Sequence::InitiatorWaitHandshake;
            }
            Sequence::InitiatorWaitHandshake => {
                if self.interaction.count_message_in_queue() > 0 {
                    self.interaction.send_messages(0)?;
                    if self.interaction.count_message_in_queue() > 0 {
                        return Ok(());
                    }
                }
                if self.interaction.receive_handshake(false)?.is_some() {
                    self.on_wired(ctx)?;
                }
            }
            Sequence::ReceiverWaitHandshake => {
                if self.interaction.count_message_in_queue() > 0 {
                    self.interaction.send_messages(0)?;
                }
                if self.interaction.receive_handshake(true)?.is_some() {
                    self.on_wired(ctx)?;
                }
            }
            Sequence::Wired => self.pump(ctx)?,
        }

        let pending = self.interaction.count_message_in_queue() > 0;
        if pending && self.interaction.is_sending_in_progress() {
            self.watch.set_write(true);
            self.rate_limited = false;
        } else {
            self.watch.set_write(false);
            self.rate_limited = pending;
        }
        Ok(())
    }

    fn on_wired(&mut self, ctx: &mut EngineContext) -> Result<()> {
        info!(
            "{} - Connected to {} ({})",
            self.cuid,
            self.peer.borrow().addr,
            self.peer.borrow().peer_id_hex().unwrap_or_default()
        );
        self.have_checkpoint.reset();
        self.keep_alive_checkpoint.reset();
        self.freq_checkpoint.reset();
        self.choke_checkpoint.reset();
        self.interaction.send_bitfield();
        self.interaction.send_allowed_fast();
        let uploaded = self.interaction.send_messages(ctx.upload_speed())?;
        ctx.stats_mut().add_uploaded(uploaded);
        self.watch.set_timeout(self.config.peer_timeout());
        self.sequence = Sequence::Wired;
        Ok(())
    }

    fn pump(&mut self, ctx: &mut EngineContext) -> Result<()> {
        self.pump_checkpoint.reset();
        self.interaction.sync_piece();
        self.decide_choking();
        if self.peer.borrow_mut().take_choke_review() {
            self.check_long_time_peer_choking();
        }

        self.receive_messages(ctx)?;
        self.interaction.update_interest();
        self.detect_message_flooding()?;

        self.interaction.check_request_slot();
        self.interaction.add_requests()?;

        self.check_have();

        let uploaded = self.interaction.send_messages(ctx.upload_speed())?;
        ctx.stats_mut().add_uploaded(uploaded);
        self.send_keep_alive(ctx)?;
        Ok(())
    }

    /// Apply the choke policy's decision for this peer
    pub fn decide_choking(&mut self) {
        let (should_choke, am_choking) = {
            let peer = self.peer.borrow();
            (peer.should_be_choking(), peer.am_choking)
        };
        if should_choke && !am_choking {
            debug!("{} - Choking {}", self.cuid, self.peer.borrow().addr);
            self.interaction.choke_peer();
        } else if !should_choke && am_choking {
            debug!("{} - Unchoking {}", self.cuid, self.peer.borrow().addr);
            self.interaction.unchoke_peer();
        }
    }

    /// Handle up to [`MAX_RECEIVE_PER_TURN`] inbound messages
    pub fn receive_messages(&mut self, ctx: &mut EngineContext) -> Result<usize> {
        let mut received = 0;
        while received < MAX_RECEIVE_PER_TURN {
            let Some(message) = self.interaction.receive_message()? else {
                break;
            };
            received += 1;
            match &message {
                Message::KeepAlive => self.keep_alive_count += 1,
                Message::Choke => {
                    if !self.peer.borrow().peer_choking {
                        self.choke_unchoke_count += 1;
                    }
                }
                Message::Unchoke => {
                    if self.peer.borrow().peer_choking {
                        self.choke_unchoke_count += 1;
                    }
                }
                Message::Have { .. } => self.have_count += 1,
                _ => {}
            }
            self.interaction.on_message_received(message, ctx.stats_mut())?;
        }
        if received > 0 {
            trace!("{} - Received {} messages", self.cuid, received);
        }
        Ok(received)
    }

    /// Fail the connection when the peer sends choke/unchoke or keep-alive
    /// messages faster than the allowed rate over one window
    pub fn detect_message_flooding(&mut self) -> Result<()> {
        if !self.freq_checkpoint.elapsed_for(FLOODING_CHECK_INTERVAL) {
            return Ok(());
        }
        let window = FLOODING_CHECK_INTERVAL.as_secs_f64();
        if self.choke_unchoke_count as f64 / window >= MAX_CHOKE_UNCHOKE_RATE
            || self.keep_alive_count as f64 / window >= MAX_KEEP_ALIVE_RATE
        {
            warn!(
                "{} - Flooding from {}: {} choke/unchoke, {} keep-alive in {}s",
                self.cuid,
                self.peer.borrow().addr,
                self.choke_unchoke_count,
                self.keep_alive_count,
                FLOODING_CHECK_INTERVAL.as_secs()
            );
            return Err(TransferError::flooding(self.peer.borrow().addr.to_string()));
        }
        // Have messages are counted per window, but no rate is enforced
        self.choke_unchoke_count = 0;
        self.have_count = 0;
        self.keep_alive_count = 0;
        self.freq_checkpoint.reset();
        Ok(())
    }

    /// Announce pieces that became available since the last check
    pub fn check_have(&mut self) {
        let indexes = self
            .torrent
            .borrow()
            .get_advertised_piece_indexes(self.cuid, &self.have_checkpoint);
        self.have_checkpoint.reset();
        if indexes.is_empty() {
            return;
        }

        if indexes.len() >= HAVE_BATCH_THRESHOLD {
            let (complete, bitfield) = {
                let torrent = self.torrent.borrow();
                (torrent.has_all_pieces(), torrent.bitfield())
            };
            if self.peer.borrow().is_fast_extension_enabled() && complete {
                self.interaction.add_message(Message::HaveAll);
            } else {
                self.interaction.add_message(Message::Bitfield {
                    bitfield: bitfield.to_bytes(),
                });
            }
        } else {
            for piece_index in indexes {
                self.interaction.add_message(Message::Have { piece_index });
            }
        }
    }

    /// Queue and flush a keep-alive after a quiet interval, never behind
    /// other outbound traffic
    pub fn send_keep_alive(&mut self, ctx: &mut EngineContext) -> Result<()> {
        if !self
            .keep_alive_checkpoint
            .elapsed_for(self.config.keep_alive_interval())
        {
            return Ok(());
        }
        if self.interaction.count_message_in_queue() > 0 {
            return Ok(());
        }
        self.interaction.add_message(Message::KeepAlive);
        self.interaction.send_messages(ctx.upload_speed())?;
        self.keep_alive_checkpoint.reset();
        Ok(())
    }

    /// Mark the peer snubbing when it kept us choked for too long while we
    /// were interested
    pub fn check_long_time_peer_choking(&mut self) {
        if self.torrent.borrow().download_complete() {
            return;
        }
        let mut peer = self.peer.borrow_mut();
        if peer.am_interested && peer.peer_choking {
            if self
                .choke_checkpoint
                .elapsed_for(self.config.max_peer_choking_interval())
            {
                info!("{} - The peer is choking too long.", self.cuid);
                peer.snubbing = true;
            }
        } else {
            self.choke_checkpoint.reset();
        }
    }

    fn periodic_due(&self) -> bool {
        self.sequence == Sequence::Wired && self.pump_checkpoint.elapsed_for(PUMP_INTERVAL)
    }

    /// Frames left over from a capped receive are already off the socket
    fn has_backlog(&self) -> bool {
        self.sequence == Sequence::Wired && self.interaction.has_buffered_frame()
    }
}

impl Command for PeerInteractionCommand {
    fn id(&self) -> CommandId {
        self.id
    }

    fn cuid(&self) -> Cuid {
        self.cuid
    }

    fn name(&self) -> &'static str {
        "PeerInteractionCommand"
    }

    fn wait(&self) -> Wait {
        if self.sequence == Sequence::InitiatorSendHandshake || self.has_backlog() {
            return Wait::immediate();
        }
        let upload_limit = self
            .rate_limited
            .then(|| self.config.upload_limit_bytes());
        let mut wait = self.watch.wait(upload_limit);
        if self.sequence == Sequence::Wired {
            let pump = self.pump_checkpoint.deadline(PUMP_INTERVAL);
            wait.deadline = Some(wait.deadline.map_or(pump, |d| d.min(pump)));
        }
        wait
    }

    fn execute(&mut self, ctx: &mut EngineContext) -> Result<CommandStatus> {
        let socket_ready = self.watch.is_ready();
        let gate_open = self.rate_limited && {
            let limit = self.config.upload_limit_bytes();
            limit == 0 || ctx.upload_speed() <= limit
        };

        if socket_ready
            || gate_open
            || self.periodic_due()
            || self.has_backlog()
            || self.sequence == Sequence::InitiatorSendHandshake
        {
            if socket_ready {
                self.watch.touch();
            }
            self.execute_internal(ctx)?;
        }
        self.watch.check_timeout("peer connection")?;
        Ok(CommandStatus::Pending)
    }

    fn on_abort(&mut self, ctx: &mut EngineContext, error: &TransferError) {
        if self.aborted {
            return;
        }
        self.aborted = true;

        self.interaction.abort_all_pieces();

        debug!(
            "{} - Closing connection to {}: {}",
            self.cuid,
            self.peer.borrow().addr,
            error
        );
        self.watch.socket().borrow_mut().close();
        self.interaction.deregister();
        {
            let mut peer = self.peer.borrow_mut();
            peer.reset_status();
            peer.add_error();
        }

        if self.initiator {
            let cuid = self.torrent.borrow_mut().get_new_cuid();
            let id = ctx.next_command_id();
            ctx.push_command(Box::new(PeerConnectionSlotCommand::new(
                id,
                cuid,
                self.torrent.clone(),
                self.config.retry_wait(),
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    use bytes::Bytes;
    use tokio::time::Instant;

    use crate::net::Connection;
    use crate::peer::Peer;
    use crate::protocol::{FrameReader, Handshake, HANDSHAKE_LENGTH};
    use crate::torrent::{MemoryTorrent, TorrentInfo, TorrentManager};

    const PIECE: u32 = 16;
    const PIECES: u32 = 20;

    struct Fixture {
        command: PeerInteractionCommand,
        remote: SocketHandle,
        torrent: Rc<RefCell<MemoryTorrent>>,
        peer: PeerHandle,
        ctx: EngineContext,
    }

    fn content() -> Vec<u8> {
        (0..PIECE * PIECES).map(|i| (i % 251) as u8).collect()
    }

    fn piece(index: u32) -> Vec<u8> {
        let start = (index * PIECE) as usize;
        content()[start..start + PIECE as usize].to_vec()
    }

    fn read_all(remote: &SocketHandle) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        while let Ok(n) = remote.borrow_mut().recv(&mut buf) {
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    fn drain_messages(remote: &SocketHandle) -> Vec<Message> {
        let mut reader = FrameReader::new();
        reader.extend(&read_all(remote));
        let mut messages = Vec::new();
        while let Some(frame) = reader.next_frame().unwrap() {
            messages.push(Message::decode(frame).unwrap());
        }
        messages
    }

    /// A command past the handshake, with everything it sent so far drained
    fn wired(initiator: bool, config: Config, remote_fast: bool) -> Fixture {
        wired_over(initiator, config, remote_fast, 1 << 16)
    }

    fn wired_over(initiator: bool, config: Config, remote_fast: bool, capacity: usize) -> Fixture {
        let info = TorrentInfo::from_content("cmd.bin", PIECE, &content());
        let torrent = Rc::new(RefCell::new(MemoryTorrent::new(info, [1u8; 20], 10)));
        let handle: TorrentHandle = torrent.clone();
        let info_hash = torrent.borrow().info_hash();
        let peer = Peer::new("10.2.2.2:6881".parse().unwrap(), PIECES as usize).into_handle();
        let (local, remote) = Connection::pipe_pair(capacity);
        let remote = remote.into_handle();
        let mut ctx = EngineContext::new(Rc::new(config));
        let id = ctx.next_command_id();

        let socket = local.into_handle();
        let config = ctx.config_handle();
        let mut command = if initiator {
            PeerInteractionCommand::initiator(id, Cuid(4), peer.clone(), socket, handle, config)
        } else {
            PeerInteractionCommand::receiver(id, Cuid(4), peer.clone(), socket, handle, config)
        };

        if initiator {
            command.execute(&mut ctx).unwrap();
            assert_eq!(command.sequence(), Sequence::InitiatorWaitHandshake);
        }
        let theirs = if remote_fast {
            Handshake::with_fast_extension(info_hash, [2u8; 20])
        } else {
            Handshake::new(info_hash, [2u8; 20])
        };
        remote.borrow_mut().send(&theirs.serialize()).unwrap();
        command.execute(&mut ctx).unwrap();
        assert_eq!(command.sequence(), Sequence::Wired);

        let sent = read_all(&remote);
        assert!(sent.len() >= HANDSHAKE_LENGTH);
        Fixture {
            command,
            remote,
            torrent,
            peer,
            ctx,
        }
    }

    fn send_remote(fx: &Fixture, messages: &[Message]) {
        for message in messages {
            fx.remote.borrow_mut().send(&message.serialize()).unwrap();
        }
    }

    #[test]
    fn test_initiator_handshake_reaches_wired() {
        let fx = wired(true, Config::default(), false);
        assert_eq!(fx.peer.borrow().peer_id, Some([2u8; 20]));
        assert!(!fx.peer.borrow().is_fast_extension_enabled());
        assert_eq!(fx.torrent.borrow().active_peers().len(), 1);
    }

    #[test]
    fn test_receiver_sends_bitfield_after_handshake() {
        let info = TorrentInfo::from_content("cmd.bin", PIECE, &content());
        let torrent = Rc::new(RefCell::new(MemoryTorrent::new(info, [1u8; 20], 10)));
        let info_hash = torrent.borrow().info_hash();
        let peer = Peer::new("10.2.2.3:6881".parse().unwrap(), PIECES as usize).into_handle();
        let (local, remote) = Connection::pipe_pair(1 << 16);
        let mut ctx = EngineContext::new(Rc::new(Config::default()));
        let id = ctx.next_command_id();
        let config = ctx.config_handle();
        let mut command =
            PeerInteractionCommand::receiver(id, Cuid(8), peer, local.into_handle(), torrent, config);

        command.execute(&mut ctx).unwrap();
        assert_eq!(command.sequence(), Sequence::ReceiverWaitHandshake);

        let mut remote = remote;
        remote.send(&Handshake::new(info_hash, [3u8; 20]).serialize()).unwrap();
        command.execute(&mut ctx).unwrap();
        assert_eq!(command.sequence(), Sequence::Wired);

        let mut buf = vec![0u8; 4096];
        let n = remote.recv(&mut buf).unwrap();
        let handshake = Handshake::deserialize(&buf[..HANDSHAKE_LENGTH]).unwrap();
        assert_eq!(handshake.info_hash, info_hash);
        let mut reader = FrameReader::new();
        reader.extend(&buf[HANDSHAKE_LENGTH..n]);
        let first = Message::decode(reader.next_frame().unwrap().unwrap()).unwrap();
        assert!(matches!(first, Message::Bitfield { .. }));
    }

    #[test]
    fn test_receive_messages_is_capped_per_turn() {
        let mut fx = wired(false, Config::default(), false);
        let haves: Vec<Message> = (0..60).map(|i| Message::Have { piece_index: i % PIECES }).collect();
        send_remote(&fx, &haves);

        assert_eq!(fx.command.receive_messages(&mut fx.ctx).unwrap(), MAX_RECEIVE_PER_TURN);
        assert_eq!(fx.command.receive_messages(&mut fx.ctx).unwrap(), 10);
        assert_eq!(fx.command.flood_counters(), (0, 60, 0));
        assert!(fx.peer.borrow().is_seeder());
    }

    #[test]
    fn test_buffered_frames_keep_command_eligible() {
        let mut fx = wired(false, Config::default(), false);
        let haves: Vec<Message> = (0..60).map(|i| Message::Have { piece_index: i % PIECES }).collect();
        send_remote(&fx, &haves);

        fx.command.execute(&mut fx.ctx).unwrap();
        assert_eq!(fx.command.flood_counters(), (0, 50, 0));
        assert!(fx.command.interaction().has_buffered_frame());
        assert!(!fx.command.watch.socket().borrow().is_readable());
        assert!(fx.command.wait().is_ready(Instant::now(), 0));

        fx.command.execute(&mut fx.ctx).unwrap();
        assert_eq!(fx.command.flood_counters(), (0, 60, 0));
        assert!(!fx.command.interaction().has_buffered_frame());
    }

    #[test]
    fn test_partial_send_arms_write_watch() {
        let mut fx = wired_over(false, Config::default(), false, 128);
        fx.command.interaction_mut().add_message(Message::Piece {
            index: 0,
            begin: 0,
            block: Bytes::from(vec![1u8; 300]),
        });
        send_remote(&fx, &[Message::KeepAlive]);

        fx.command.execute(&mut fx.ctx).unwrap();
        assert!(fx.command.interaction().is_sending_in_progress());
        assert!(fx.command.watch.is_watching_write());
        assert!(!fx.command.rate_limited);
        let wait = fx.command.wait();
        assert!(wait.write);
        assert_eq!(wait.upload_limit, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_limit_marks_rate_limited() {
        let mut config = Config::default();
        config.upload_limit = 1;
        let limit = config.upload_limit_bytes();
        let mut fx = wired(false, config, false);

        tokio::time::advance(Duration::from_secs(2)).await;
        fx.ctx.stats_mut().add_uploaded(100_000);
        assert!(fx.ctx.upload_speed() > limit);

        fx.command.interaction_mut().add_message(Message::Piece {
            index: 0,
            begin: 0,
            block: Bytes::from(vec![1u8; 64]),
        });
        send_remote(&fx, &[Message::KeepAlive]);
        fx.command.execute(&mut fx.ctx).unwrap();

        assert!(fx.command.interaction().count_message_in_queue() > 0);
        assert!(!fx.command.interaction().is_sending_in_progress());
        assert!(fx.command.rate_limited);
        assert!(!fx.command.watch.is_watching_write());

        let wait = fx.command.wait();
        assert_eq!(wait.upload_limit, Some(limit));
        assert!(!wait.is_ready(Instant::now(), fx.ctx.upload_speed()));
        assert!(wait.is_ready(Instant::now(), limit));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flooding_detected_at_threshold() {
        let mut fx = wired(false, Config::default(), false);
        send_remote(&fx, &[Message::Unchoke, Message::Choke]);
        fx.command.receive_messages(&mut fx.ctx).unwrap();
        assert_eq!(fx.command.flood_counters().0, 2);

        tokio::time::advance(FLOODING_CHECK_INTERVAL).await;
        assert!(matches!(
            fx.command.detect_message_flooding(),
            Err(TransferError::Flooding { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flooding_below_threshold_resets_counters() {
        let mut fx = wired(false, Config::default(), false);
        send_remote(&fx, &[Message::Unchoke, Message::KeepAlive, Message::Have { piece_index: 3 }]);
        fx.command.receive_messages(&mut fx.ctx).unwrap();
        assert_eq!(fx.command.flood_counters(), (1, 1, 1));

        // Counters only reset once the window has elapsed
        fx.command.detect_message_flooding().unwrap();
        assert_eq!(fx.command.flood_counters(), (1, 1, 1));

        tokio::time::advance(FLOODING_CHECK_INTERVAL).await;
        fx.command.detect_message_flooding().unwrap();
        assert_eq!(fx.command.flood_counters(), (0, 0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_choke_is_not_counted() {
        let mut fx = wired(false, Config::default(), false);
        send_remote(&fx, &[Message::Choke, Message::Choke, Message::Choke]);
        fx.command.receive_messages(&mut fx.ctx).unwrap();
        assert_eq!(fx.command.flood_counters().0, 0);
    }

    fn advertise(fx: &Fixture, count: u32) {
        let mut torrent = fx.torrent.borrow_mut();
        for index in 0..count {
            torrent.store_piece(index, &piece(index)).unwrap();
            torrent.advertise(index, Cuid(99));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_have_batching_below_threshold() {
        let mut fx = wired(false, Config::default(), false);
        tokio::time::advance(Duration::from_millis(1)).await;
        advertise(&fx, 19);

        fx.command.check_have();
        fx.command.interaction_mut().send_messages(0).unwrap();
        let expected: Vec<Message> = (0..19).map(|i| Message::Have { piece_index: i }).collect();
        assert_eq!(drain_messages(&fx.remote), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_have_batching_at_threshold_sends_bitfield() {
        let mut fx = wired(false, Config::default(), false);
        tokio::time::advance(Duration::from_millis(1)).await;
        advertise(&fx, 20);

        fx.command.check_have();
        fx.command.interaction_mut().send_messages(0).unwrap();
        let messages = drain_messages(&fx.remote);
        assert_eq!(messages.len(), 1);
        assert!(matches!(messages[0], Message::Bitfield { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_have_batching_with_fast_extension_sends_have_all() {
        let mut fx = wired(false, Config::default(), true);
        assert!(fx.peer.borrow().is_fast_extension_enabled());
        tokio::time::advance(Duration::from_millis(1)).await;
        advertise(&fx, PIECES);

        fx.command.check_have();
        fx.command.interaction_mut().send_messages(0).unwrap();
        assert_eq!(drain_messages(&fx.remote), vec![Message::HaveAll]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_own_pieces_are_not_announced_back() {
        let mut fx = wired(false, Config::default(), false);
        tokio::time::advance(Duration::from_millis(1)).await;
        {
            let mut torrent = fx.torrent.borrow_mut();
            torrent.store_piece(0, &piece(0)).unwrap();
            torrent.advertise(0, Cuid(4));
        }
        fx.command.check_have();
        assert_eq!(fx.command.interaction().count_message_in_queue(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_waits_for_empty_queue() {
        let mut config = Config::default();
        config.keep_alive_interval = 2;
        let mut fx = wired(false, config, false);

        tokio::time::advance(Duration::from_secs(2)).await;
        fx.command.interaction_mut().add_message(Message::Unchoke);
        fx.command.send_keep_alive(&mut fx.ctx).unwrap();
        assert_eq!(fx.command.interaction().count_message_in_queue(), 1);

        fx.command.interaction_mut().send_messages(0).unwrap();
        fx.command.send_keep_alive(&mut fx.ctx).unwrap();
        fx.command.send_keep_alive(&mut fx.ctx).unwrap();
        assert_eq!(drain_messages(&fx.remote), vec![Message::Unchoke, Message::KeepAlive]);
    }

    #[test]
    fn test_decide_choking_applies_policy() {
        let mut fx = wired(false, Config::default(), false);
        fx.peer.borrow_mut().set_should_be_choking(false);
        fx.command.decide_choking();
        assert!(!fx.peer.borrow().am_choking);
        fx.command.decide_choking();

        fx.peer.borrow_mut().set_should_be_choking(true);
        fx.command.decide_choking();
        assert!(fx.peer.borrow().am_choking);

        fx.command.interaction_mut().send_messages(0).unwrap();
        assert_eq!(drain_messages(&fx.remote), vec![Message::Unchoke, Message::Choke]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_choking_marks_snubbing() {
        let mut fx = wired(false, Config::default(), false);
        {
            let mut peer = fx.peer.borrow_mut();
            peer.am_interested = true;
            peer.peer_choking = true;
        }
        fx.command.check_long_time_peer_choking();
        assert!(!fx.peer.borrow().snubbing);

        tokio::time::advance(Duration::from_secs(180)).await;
        fx.command.check_long_time_peer_choking();
        assert!(fx.peer.borrow().snubbing);
    }

    #[test]
    fn test_abort_is_idempotent() {
        let mut fx = wired(true, Config::default(), false);
        {
            let mut peer = fx.peer.borrow_mut();
            peer.set_all_pieces();
            peer.peer_choking = false;
        }
        fx.command.interaction_mut().add_requests().unwrap();
        let held: Vec<u32> = fx.command.interaction().held_pieces().to_vec();
        assert!(!held.is_empty());
        let holders = |fx: &Fixture| held.iter().map(|i| fx.torrent.borrow().holders(*i)).sum::<usize>();
        assert_eq!(holders(&fx), held.len());

        let error = TransferError::protocol_error("test");
        fx.command.on_abort(&mut fx.ctx, &error);
        fx.command.on_abort(&mut fx.ctx, &error);

        assert_eq!(holders(&fx), 0);
        assert!(fx.torrent.borrow().active_peers().is_empty());
        assert!(!fx.command.interaction().is_registered());
        assert_eq!(fx.peer.borrow().error_count(), 1);
        assert_eq!(fx.ctx.spawned().len(), 1);
        assert_eq!(fx.ctx.spawned()[0].name(), "PeerConnectionSlotCommand");
    }

    #[test]
    fn test_receiver_abort_spawns_nothing() {
        let mut fx = wired(false, Config::default(), false);
        fx.command
            .on_abort(&mut fx.ctx, &TransferError::connection_closed("10.2.2.2:6881"));
        assert!(fx.ctx.spawned().is_empty());
        assert!(fx.torrent.borrow().active_peers().is_empty());
    }
}
