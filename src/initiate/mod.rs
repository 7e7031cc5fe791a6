//! Connection-establishment dispatch
//!
//! The first command of an HTTP(S) or FTP transfer only opens the TCP
//! connection, either to the origin or to the configured HTTP proxy, and then
//! hands the established socket to exactly one protocol command. The
//! protocol commands themselves live behind [`ProtocolHandoff`].

pub mod ftp;
pub mod http;

use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use tracing::{debug, info};

use crate::cli::Config;
use crate::engine::{Command, CommandId, Cuid, EngineContext, SocketWatch, Wait};
use crate::error::{Result, TransferError};
use crate::net::{Connection, Request, SocketHandle};

pub use ftp::FtpInitiateConnectionCommand;
pub use http::HttpInitiateConnectionCommand;

/// Builds the command that continues a transfer on an established socket
pub trait ProtocolHandoff: fmt::Debug {
    /// Plain HTTP request; `via_proxy` means the socket is connected to the
    /// proxy and the request line carries the absolute URL
    fn http_request(
        &self,
        id: CommandId,
        cuid: Cuid,
        request: Request,
        socket: SocketHandle,
        via_proxy: bool,
    ) -> Box<dyn Command>;

    /// CONNECT request that opens a tunnel through the proxy
    fn http_proxy_tunnel(
        &self,
        id: CommandId,
        cuid: Cuid,
        request: Request,
        socket: SocketHandle,
    ) -> Box<dyn Command>;

    /// FTP control connection negotiation
    fn ftp_negotiation(
        &self,
        id: CommandId,
        cuid: Cuid,
        request: Request,
        socket: SocketHandle,
    ) -> Box<dyn Command>;
}

/// Shared handoff collaborator
pub type HandoffHandle = Rc<dyn ProtocolHandoff>;

/// How requests travel through the HTTP proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyMethod {
    /// Absolute-URL GET sent to the proxy
    Get,
    /// CONNECT tunnel, then the origin protocol inside it
    Tunnel,
}

impl ProxyMethod {
    pub fn parse(method: &str) -> Result<Self> {
        match method {
            "get" => Ok(ProxyMethod::Get),
            "tunnel" => Ok(ProxyMethod::Tunnel),
            other => Err(TransferError::unsupported_proxy_method(other)),
        }
    }
}

/// Where the initiate command connects to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Direct,
    Proxy(ProxyMethod),
}

impl Route {
    /// Pick the route from the proxy settings.
    ///
    /// The proxy method is validated here, before any connection is opened.
    pub fn from_config(config: &Config) -> Result<Self> {
        if !config.http_proxy.enabled {
            return Ok(Route::Direct);
        }
        ProxyMethod::parse(&config.http_proxy.method).map(Route::Proxy)
    }

    /// Host and port to connect to for `request`
    pub fn target<'a>(&self, request: &'a Request, config: &'a Config) -> (&'a str, u16) {
        match self {
            Route::Direct => (request.host(), request.port()),
            Route::Proxy(_) => (config.http_proxy.host.as_str(), config.http_proxy.port),
        }
    }
}

/// A non-blocking connect waiting for writability
#[derive(Debug)]
pub struct PendingConnection {
    watch: SocketWatch,
}

impl PendingConnection {
    /// Resolve `host` and start connecting
    pub fn start(cuid: Cuid, host: &str, port: u16, timeout: Duration) -> Result<Self> {
        info!("{} - Connecting to {}:{}", cuid, host, port);
        let mut connection = Connection::new();
        connection.establish(host, port)?;
        let mut watch = SocketWatch::new(connection.into_handle(), timeout);
        watch.set_read(false);
        watch.set_write(true);
        Ok(Self { watch })
    }

    /// The socket once the connect completed, `None` while still in flight
    pub fn poll(&mut self) -> Result<Option<SocketHandle>> {
        if !self.watch.is_ready() {
            self.watch.check_timeout("connect")?;
            return Ok(None);
        }
        let socket = self.watch.socket().clone();
        if !socket.borrow_mut().finish_connect()? {
            self.watch.check_timeout("connect")?;
            return Ok(None);
        }
        Ok(Some(socket))
    }

    pub fn wait(&self) -> Wait {
        self.watch.wait(None)
    }

    pub fn close(&self) {
        self.watch.socket().borrow_mut().close();
    }
}

/// Create the initiate command for `request`'s scheme.
///
/// `http` and `https` go to [`HttpInitiateConnectionCommand`], `ftp` to
/// [`FtpInitiateConnectionCommand`]. Any other scheme fails with a fatal
/// unsupported-protocol error.
pub fn create_initiate_connection_command(
    ctx: &mut EngineContext,
    cuid: Cuid,
    request: Request,
    handoff: HandoffHandle,
) -> Result<Box<dyn Command>> {
    debug!("{} - Dispatching {}", cuid, request);
    match request.protocol() {
        "http" | "https" => {
            let id = ctx.next_command_id();
            Ok(Box::new(HttpInitiateConnectionCommand::new(
                id,
                cuid,
                request,
                ctx.config_handle(),
                handoff,
            )))
        }
        "ftp" => {
            let id = ctx.next_command_id();
            Ok(Box::new(FtpInitiateConnectionCommand::new(
                id,
                cuid,
                request,
                ctx.config_handle(),
                handoff,
            )))
        }
        other => Err(TransferError::unsupported_protocol(other)),
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingHandoff;
    use super::*;
    use crate::error::ErrorKind;

    fn context(config: Config) -> EngineContext {
        EngineContext::new(Rc::new(config))
    }

    #[test]
    fn test_proxy_method_parse() {
        assert_eq!(ProxyMethod::parse("get").unwrap(), ProxyMethod::Get);
        assert_eq!(ProxyMethod::parse("tunnel").unwrap(), ProxyMethod::Tunnel);
        let err = ProxyMethod::parse("socks").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FatalConfiguration);
    }

    #[test]
    fn test_route_from_config() {
        let mut config = Config::default();
        assert_eq!(Route::from_config(&config).unwrap(), Route::Direct);

        config.http_proxy.enabled = true;
        config.http_proxy.host = "proxy.local".to_string();
        config.http_proxy.method = "get".to_string();
        assert_eq!(Route::from_config(&config).unwrap(), Route::Proxy(ProxyMethod::Get));

        let request = Request::parse("http://origin.example/file").unwrap();
        let route = Route::from_config(&config).unwrap();
        assert_eq!(route.target(&request, &config), ("proxy.local", 8080));
        assert_eq!(Route::Direct.target(&request, &config), ("origin.example", 80));
    }

    #[test]
    fn test_dispatch_by_scheme() {
        let mut ctx = context(Config::default());
        let handoff: HandoffHandle = Rc::new(RecordingHandoff::default());

        for (url, name) in [
            ("http://a.example/x", "HttpInitiateConnectionCommand"),
            ("https://a.example/x", "HttpInitiateConnectionCommand"),
            ("ftp://a.example/x", "FtpInitiateConnectionCommand"),
        ] {
            let request = Request::parse(url).unwrap();
            let command =
                create_initiate_connection_command(&mut ctx, Cuid(7), request, handoff.clone()).unwrap();
            assert_eq!(command.name(), name);
            assert_eq!(command.cuid(), Cuid(7));
        }
    }

    #[test]
    fn test_dispatch_unsupported_scheme() {
        let mut ctx = context(Config::default());
        let handoff: HandoffHandle = Rc::new(RecordingHandoff::default());
        let request = Request::parse("sftp://a.example/x").unwrap();

        let err = create_initiate_connection_command(&mut ctx, Cuid(1), request, handoff).unwrap_err();
        assert!(err.is_session_fatal());
        assert_eq!(err.to_string(), "sftp is not supported yet");
        assert!(ctx.spawned().is_empty());
    }
}
