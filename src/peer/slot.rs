//! Peer connection slots
//!
//! A [`PeerConnectionSlotCommand`] stands for one outgoing connection the
//! engine may open. Each turn it either takes the next pooled peer and hands
//! it to a connection-initiation command, or sleeps and tries again.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::engine::{Command, CommandId, CommandStatus, Cuid, EngineContext, Wait};
use crate::error::Result;
use crate::peer::initiate::PeerInitiateConnectionCommand;
use crate::torrent::TorrentHandle;

/// Placeholder for a connection without a dedicated peer yet
#[derive(Debug)]
pub struct PeerConnectionSlotCommand {
    id: CommandId,
    cuid: Cuid,
    torrent: TorrentHandle,
    retry_wait: Duration,
    resume_at: Option<Instant>,
}

impl PeerConnectionSlotCommand {
    pub fn new(id: CommandId, cuid: Cuid, torrent: TorrentHandle, retry_wait: Duration) -> Self {
        Self {
            id,
            cuid,
            torrent,
            retry_wait,
            resume_at: None,
        }
    }

    /// Spawn a connection-initiation command for the next pooled peer under
    /// a fresh session id, or retry after `wait` when none is available.
    ///
    /// Exactly one of the two happens per call.
    pub fn prepare_for_next_peer(&mut self, ctx: &mut EngineContext, wait: Duration) -> CommandStatus {
        let next = {
            let mut torrent = self.torrent.borrow_mut();
            if torrent.is_peer_available() {
                torrent.get_peer().map(|peer| (peer, torrent.get_new_cuid()))
            } else {
                None
            }
        };
        let Some((peer, cuid)) = next else {
            return self.prepare_for_retry(wait);
        };

        peer.borrow_mut().cuid = cuid;
        debug!("{} - Assigned peer {}", cuid, peer.borrow().addr);
        let id = ctx.next_command_id();
        ctx.push_command(Box::new(PeerInitiateConnectionCommand::new(
            id,
            cuid,
            peer,
            self.torrent.clone(),
            ctx.config_handle(),
        )));
        CommandStatus::Finished
    }

    /// Run again once `wait` has passed
    pub fn prepare_for_retry(&mut self, wait: Duration) -> CommandStatus {
        trace!("{} - No peer available, retrying in {:?}", self.cuid, wait);
        self.resume_at = Some(Instant::now() + wait);
        CommandStatus::Pending
    }
}

impl Command for PeerConnectionSlotCommand {
    fn id(&self) -> CommandId {
        self.id
    }

    fn cuid(&self) -> Cuid {
        self.cuid
    }

    fn name(&self) -> &'static str {
        "PeerConnectionSlotCommand"
    }

    fn wait(&self) -> Wait {
        match self.resume_at {
            Some(deadline) => Wait::until(deadline),
            None => Wait::immediate(),
        }
    }

    fn execute(&mut self, ctx: &mut EngineContext) -> Result<CommandStatus> {
        if self.torrent.borrow().download_complete() {
            debug!("{} - Download complete, releasing connection slot", self.cuid);
            return Ok(CommandStatus::Finished);
        }
        Ok(self.prepare_for_next_peer(ctx, self.retry_wait))
    }
}
