//! FTP connection initiation

use std::rc::Rc;

use tracing::debug;

use super::{HandoffHandle, PendingConnection, ProxyMethod, Route};
use crate::cli::Config;
use crate::engine::{Command, CommandId, CommandStatus, Cuid, EngineContext, Wait};
use crate::error::{Result, TransferError};
use crate::net::Request;

/// Opens the control connection for an FTP download.
///
/// Through the HTTP proxy an FTP URL is fetched like an HTTP one: either
/// with an absolute-URL GET or inside a CONNECT tunnel.
#[derive(Debug)]
pub struct FtpInitiateConnectionCommand {
    id: CommandId,
    cuid: Cuid,
    request: Request,
    config: Rc<Config>,
    handoff: HandoffHandle,
    route: Route,
    pending: Option<PendingConnection>,
}

impl FtpInitiateConnectionCommand {
    pub fn new(
        id: CommandId,
        cuid: Cuid,
        request: Request,
        config: Rc<Config>,
        handoff: HandoffHandle,
    ) -> Self {
        Self {
            id,
            cuid,
            request,
            config,
            handoff,
            route: Route::Direct,
            pending: None,
        }
    }
}

impl Command for FtpInitiateConnectionCommand {
    fn id(&self) -> CommandId {
        self.id
    }

    fn cuid(&self) -> Cuid {
        self.cuid
    }

    fn name(&self) -> &'static str {
        "FtpInitiateConnectionCommand"
    }

    fn wait(&self) -> Wait {
        match &self.pending {
            Some(pending) => pending.wait(),
            None => Wait::immediate(),
        }
    }

    fn execute(&mut self, ctx: &mut EngineContext) -> Result<CommandStatus> {
        if self.pending.is_none() {
            self.route = Route::from_config(&self.config)?;
            let (host, port) = self.route.target(&self.request, &self.config);
            self.pending = Some(PendingConnection::start(
                self.cuid,
                host,
                port,
                self.config.timeout(),
            )?);
            return Ok(CommandStatus::Pending);
        }
        let Some(pending) = self.pending.as_mut() else {
            return Ok(CommandStatus::Pending);
        };
        let Some(socket) = pending.poll()? else {
            return Ok(CommandStatus::Pending);
        };

        let id = ctx.next_command_id();
        let request = self.request.clone();
        let command = match self.route {
            Route::Direct => self.handoff.ftp_negotiation(id, self.cuid, request, socket),
            Route::Proxy(ProxyMethod::Get) => {
                self.handoff.http_request(id, self.cuid, request, socket, true)
            }
            Route::Proxy(ProxyMethod::Tunnel) => {
                self.handoff.http_proxy_tunnel(id, self.cuid, request, socket)
            }
        };
        ctx.push_command(command);
        Ok(CommandStatus::Finished)
    }

    fn on_abort(&mut self, _ctx: &mut EngineContext, error: &TransferError) {
        debug!("{} - FTP connection for {} failed: {}", self.cuid, self.request, error);
        if let Some(pending) = &self.pending {
            pending.close();
        }
    }
}
