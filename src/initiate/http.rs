//! HTTP connection initiation

use std::rc::Rc;

use tracing::debug;

use super::{HandoffHandle, PendingConnection, ProxyMethod, Route};
use crate::cli::Config;
use crate::engine::{Command, CommandId, CommandStatus, Cuid, EngineContext, Wait};
use crate::error::{Result, TransferError};
use crate::net::{Request, SocketHandle};

/// Opens the connection for an HTTP(S) download.
///
/// Without a proxy the socket goes to the origin and the transfer continues
/// with a direct request. With a proxy the socket goes to the proxy and the
/// transfer continues with a CONNECT tunnel or an absolute-URL GET.
#[derive(Debug)]
pub struct HttpInitiateConnectionCommand {
    id: CommandId,
    cuid: Cuid,
    request: Request,
    config: Rc<Config>,
    handoff: HandoffHandle,
    route: Route,
    pending: Option<PendingConnection>,
}

impl HttpInitiateConnectionCommand {
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

    fn connect(&mut self) -> Result<()> {
        self.route = Route::from_config(&self.config)?;
        let (host, port) = self.route.target(&self.request, &self.config);
        let pending = PendingConnection::start(self.cuid, host, port, self.config.timeout())?;
        self.pending = Some(pending);
        Ok(())
    }

    fn follow_up(&self, id: CommandId, socket: SocketHandle) -> Box<dyn Command> {
        let request = self.request.clone();
        match self.route {
            Route::Direct => self.handoff.http_request(id, self.cuid, request, socket, false),
            Route::Proxy(ProxyMethod::Get) => {
                self.handoff.http_request(id, self.cuid, request, socket, true)
            }
            Route::Proxy(ProxyMethod::Tunnel) => {
                self.handoff.http_proxy_tunnel(id, self.cuid, request, socket)
            }
        }
    }
}

impl Command for HttpInitiateConnectionCommand {
    fn id(&self) -> CommandId {
        self.id
    }

    fn cuid(&self) -> Cuid {
        self.cuid
    }

    fn name(&self) -> &'static str {
        "HttpInitiateConnectionCommand"
    }

    fn wait(&self) -> Wait {
        match &self.pending {
            Some(pending) => pending.wait(),
            None => Wait::immediate(),
        }
    }

    fn execute(&mut self, ctx: &mut EngineContext) -> Result<CommandStatus> {
        if self.pending.is_none() {
            self.connect()?;
            return Ok(CommandStatus::Pending);
        }
        let Some(pending) = self.pending.as_mut() else {
            return Ok(CommandStatus::Pending);
        };
        let Some(socket) = pending.poll()? else {
            return Ok(CommandStatus::Pending);
        };

        debug!("{} - Connected for {} via {:?}", self.cuid, self.request, self.route);
        let id = ctx.next_command_id();
        let command = self.follow_up(id, socket);
        ctx.push_command(command);
        Ok(CommandStatus::Finished)
    }

    fn on_abort(&mut self, _ctx: &mut EngineContext, error: &TransferError) {
        debug!("{} - Connection for {} failed: {}", self.cuid, self.request, error);
        if let Some(pending) = &self.pending {
            pending.close();
        }
    }
}
