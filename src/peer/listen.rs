//! Incoming peer connections
//!
//! [`PeerListenCommand`] owns the listening socket. Every readable turn it
//! accepts pending connections and starts a receiver-side interaction
//! command for each, as long as the torrent has room for more peers.

use std::net::{Ipv4Addr, SocketAddr};

use tracing::{debug, info, warn};

use crate::engine::{Command, CommandId, CommandStatus, Cuid, EngineContext, Wait};
use crate::error::{Result, TransferError};
use crate::net::{Connection, SocketHandle};
use crate::peer::command::PeerInteractionCommand;
use crate::peer::Peer;
use crate::torrent::TorrentHandle;

/// Connections accepted per turn
const MAX_ACCEPT_PER_TURN: usize = 16;

/// Accepts peer connections
#[derive(Debug)]
pub struct PeerListenCommand {
    id: CommandId,
    cuid: Cuid,
    torrent: TorrentHandle,
    socket: Option<SocketHandle>,
    port: u16,
}

impl PeerListenCommand {
    pub fn new(id: CommandId, cuid: Cuid, torrent: TorrentHandle) -> Self {
        Self {
            id,
            cuid,
            torrent,
            socket: None,
            port: 0,
        }
    }

    /// Bind the first free port in `start..=end` and return it.
    ///
    /// Port 0 asks the system for an ephemeral port.
    pub fn bind_port(&mut self, start: u16, end: u16) -> Result<u16> {
        let mut last_error = None;
        for port in start..=end {
            let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
            match Connection::listen(addr) {
                Ok(listener) => {
                    let bound = listener.local_addr().map(|a| a.port()).unwrap_or(port);
                    info!("{} - Listening to port {}", self.cuid, bound);
                    self.port = bound;
                    self.socket = Some(listener.into_handle());
                    return Ok(bound);
                }
                Err(e) => {
                    debug!("{} - Port {} is not available: {}", self.cuid, port, e);
                    last_error = Some(e);
                }
            }
        }
        Err(TransferError::network_error(
            format!("No free port in {}-{}", start, end),
            last_error.unwrap_or_else(|| std::io::ErrorKind::AddrInUse.into()),
        ))
    }

    /// Port bound by [`PeerListenCommand::bind_port`], 0 before
    pub fn port(&self) -> u16 {
        self.port
    }

    fn accept_one(&mut self, ctx: &mut EngineContext, connection: Connection) {
        let Some(addr) = connection.peer_addr() else {
            return;
        };
        let (active, piece_count) = {
            let torrent = self.torrent.borrow();
            (torrent.active_peers().len(), torrent.piece_count())
        };
        if active >= ctx.config().max_peers {
            warn!("{} - Rejecting {}: too many peers", self.cuid, addr);
            let mut connection = connection;
            connection.close();
            return;
        }

        let cuid = self.torrent.borrow_mut().get_new_cuid();
        info!("{} - Accepted the connection from {}", cuid, addr);
        let peer = Peer::new(addr, piece_count).into_handle();
        let id = ctx.next_command_id();
        let config = ctx.config_handle();
        ctx.push_command(Box::new(PeerInteractionCommand::receiver(
            id,
            cuid,
            peer,
            connection.into_handle(),
            self.torrent.clone(),
            config,
        )));
    }
}

impl Command for PeerListenCommand {
    fn id(&self) -> CommandId {
        self.id
    }

    fn cuid(&self) -> Cuid {
        self.cuid
    }

    fn name(&self) -> &'static str {
        "PeerListenCommand"
    }

    fn wait(&self) -> Wait {
        Wait {
            socket: self.socket.clone(),
            read: true,
            ..Wait::default()
        }
    }

    fn execute(&mut self, ctx: &mut EngineContext) -> Result<CommandStatus> {
        let Some(socket) = self.socket.clone() else {
            return Err(TransferError::config_error("listen command has no bound port"));
        };
        for _ in 0..MAX_ACCEPT_PER_TURN {
            let accepted = socket.borrow_mut().accept()?;
            match accepted {
                Some(connection) => self.accept_one(ctx, connection),
                None => break,
            }
        }
        Ok(CommandStatus::Pending)
    }

    fn on_abort(&mut self, _ctx: &mut EngineContext, error: &TransferError) {
        warn!("{} - Listener on port {} stopped: {}", self.cuid, self.port, error);
        if let Some(socket) = self.socket.take() {
            socket.borrow_mut().close();
        }
    }
}
