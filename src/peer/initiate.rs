//! Outgoing peer connections
//!
//! [`PeerInitiateConnectionCommand`] opens a non-blocking TCP connection to
//! one pooled peer and, once it is established, hands the socket to an
//! initiator-side [`PeerInteractionCommand`].

use std::rc::Rc;

use tracing::{debug, info};

use crate::cli::Config;
use crate::engine::{Command, CommandId, CommandStatus, Cuid, EngineContext, SocketWatch, Wait};
use crate::error::{Result, TransferError};
use crate::net::Connection;
use crate::peer::command::PeerInteractionCommand;
use crate::peer::slot::PeerConnectionSlotCommand;
use crate::peer::PeerHandle;
use crate::torrent::TorrentHandle;

/// Connects to a peer and hands over to the interaction command
#[derive(Debug)]
pub struct PeerInitiateConnectionCommand {
    id: CommandId,
    cuid: Cuid,
    peer: PeerHandle,
    torrent: TorrentHandle,
    config: Rc<Config>,
    watch: Option<SocketWatch>,
}

impl PeerInitiateConnectionCommand {
    pub fn new(
        id: CommandId,
        cuid: Cuid,
        peer: PeerHandle,
        torrent: TorrentHandle,
        config: Rc<Config>,
    ) -> Self {
        Self {
            id,
            cuid,
            peer,
            torrent,
            config,
            watch: None,
        }
    }

    fn connect(&mut self) -> Result<()> {
        let addr = self.peer.borrow().addr;
        info!("{} - Connecting to peer {}", self.cuid, addr);
        let mut connection = Connection::new();
        connection.connect(addr)?;
        let mut watch = SocketWatch::new(connection.into_handle(), self.config.peer_connection_timeout());
        watch.set_read(false);
        watch.set_write(true);
        self.watch = Some(watch);
        Ok(())
    }
}

impl Command for PeerInitiateConnectionCommand {
    fn id(&self) -> CommandId {
        self.id
    }

    fn cuid(&self) -> Cuid {
        self.cuid
    }

    fn name(&self) -> &'static str {
        "PeerInitiateConnectionCommand"
    }

    fn wait(&self) -> Wait {
        match &self.watch {
            Some(watch) => watch.wait(None),
            None => Wait::immediate(),
        }
    }

    fn execute(&mut self, ctx: &mut EngineContext) -> Result<CommandStatus> {
        if self.watch.is_none() {
            self.connect()?;
            return Ok(CommandStatus::Pending);
        }
        let Some(watch) = &self.watch else {
            return Ok(CommandStatus::Pending);
        };

        if !watch.is_ready() {
            watch.check_timeout("connect")?;
            return Ok(CommandStatus::Pending);
        }
        let socket = watch.socket().clone();
        if !socket.borrow_mut().finish_connect()? {
            watch.check_timeout("connect")?;
            return Ok(CommandStatus::Pending);
        }

        debug!("{} - Connected to {}", self.cuid, self.peer.borrow().addr);
        let id = ctx.next_command_id();
        ctx.push_command(Box::new(PeerInteractionCommand::initiator(
            id,
            self.cuid,
            self.peer.clone(),
            socket,
            self.torrent.clone(),
            self.config.clone(),
        )));
        Ok(CommandStatus::Finished)
    }

    fn on_abort(&mut self, ctx: &mut EngineContext, error: &TransferError) {
        debug!(
            "{} - Giving up on {}: {}",
            self.cuid,
            self.peer.borrow().addr,
            error
        );
        if let Some(watch) = &self.watch {
            watch.socket().borrow_mut().close();
        }
        {
            let mut peer = self.peer.borrow_mut();
            peer.reset_status();
            peer.add_error();
        }
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    use crate::peer::Peer;
    use crate::torrent::{MemoryTorrent, TorrentInfo};

    #[test]
    fn test_abort_spawns_replacement_slot() {
        let info = TorrentInfo::from_content("i.bin", 16, &[1u8; 40]);
        let torrent: TorrentHandle = Rc::new(RefCell::new(MemoryTorrent::new(info, [0u8; 20], 5)));
        let peer = Peer::new("127.0.0.1:1".parse().unwrap(), 3).into_handle();
        let mut ctx = EngineContext::new(Rc::new(Config::default()));
        let id = ctx.next_command_id();
        let mut command =
            PeerInitiateConnectionCommand::new(id, Cuid(3), peer.clone(), torrent, ctx.config_handle());

        command.on_abort(&mut ctx, &TransferError::timeout("connect"));
        assert_eq!(peer.borrow().error_count(), 1);
        assert_eq!(ctx.spawned().len(), 1);
        assert_eq!(ctx.spawned()[0].name(), "PeerConnectionSlotCommand");
    }
}
