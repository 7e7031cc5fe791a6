//! Non-blocking connections
//!
//! A [`Connection`] wraps a mio TCP stream, a mio listener or an in-memory
//! pipe. TCP readiness is edge-triggered: the scheduler raises the cached
//! flags when the poll reports an event and `send`/`recv` lower them again
//! when the socket answers `WouldBlock`.

use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::rc::Rc;

use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Registry, Token};
use tracing::{debug, trace};

use crate::error::{Result, TransferError};
use crate::net::pipe::{pipe, PipeEnd};

/// Shared handle: the owning command does the I/O, the scheduler polls it
pub type SocketHandle = Rc<RefCell<Connection>>;

/// Lifecycle of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Connecting,
    Established,
    Listening,
    Closed,
}

#[derive(Debug)]
enum Transport {
    None,
    Tcp(TcpStream),
    Listener(TcpListener),
    Pipe(PipeEnd),
}

/// A non-blocking bidirectional byte stream
#[derive(Debug)]
pub struct Connection {
    transport: Transport,
    state: ConnectionState,
    readable: bool,
    writable: bool,
    token: Option<Token>,
    peer_addr: Option<SocketAddr>,
}

impl Connection {
    /// Create an unconnected connection
    pub fn new() -> Self {
        Self::with_transport(Transport::None, ConnectionState::Unconnected, None)
    }

    fn with_transport(
        transport: Transport,
        state: ConnectionState,
        peer_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            transport,
            state,
            readable: false,
            writable: false,
            token: None,
            peer_addr,
        }
    }

    /// Create an established pair of in-memory connections
    pub fn pipe_pair(capacity: usize) -> (Connection, Connection) {
        let (a, b) = pipe(capacity);
        (
            Self::with_transport(Transport::Pipe(a), ConnectionState::Established, None),
            Self::with_transport(Transport::Pipe(b), ConnectionState::Established, None),
        )
    }

    /// Bind a non-blocking listener
    pub fn listen(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        debug!("Listening on {}", addr);
        Ok(Self::with_transport(
            Transport::Listener(listener),
            ConnectionState::Listening,
            None,
        ))
    }

    /// Wrap into a shared handle
    pub fn into_handle(self) -> SocketHandle {
        Rc::new(RefCell::new(self))
    }

    /// Start a non-blocking connect to `host:port`
    pub fn establish(&mut self, host: &str, port: u16) -> Result<()> {
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|e| {
                TransferError::network_error(format!("Failed to resolve {}:{}", host, port), e)
            })?
            .next()
            .ok_or_else(|| {
                TransferError::network_error(
                    format!("No address for {}:{}", host, port),
                    io::ErrorKind::AddrNotAvailable.into(),
                )
            })?;
        self.connect(addr)
    }

    /// Start a non-blocking connect to a resolved address
    pub fn connect(&mut self, addr: SocketAddr) -> Result<()> {
        let stream = TcpStream::connect(addr).map_err(|e| {
            TransferError::network_error(format!("Failed to connect to {}", addr), e)
        })?;
        trace!("Connecting to {}", addr);
        self.transport = Transport::Tcp(stream);
        self.state = ConnectionState::Connecting;
        self.peer_addr = Some(addr);
        self.readable = false;
        self.writable = false;
        self.token = None;
        Ok(())
    }

    /// Complete a pending connect once the socket turned writable.
    ///
    /// Returns `Ok(true)` when the connection is established and `Ok(false)`
    /// when the connect is still in flight.
    pub fn finish_connect(&mut self) -> Result<bool> {
        if self.state != ConnectionState::Connecting {
            return Ok(self.state == ConnectionState::Established);
        }
        let Transport::Tcp(stream) = &self.transport else {
            return Ok(false);
        };
        if let Some(err) = stream.take_error()? {
            return Err(TransferError::network_error("Connection failed", err));
        }
        match stream.peer_addr() {
            Ok(addr) => {
                debug!("Connection established with {}", addr);
                self.peer_addr = Some(addr);
                self.state = ConnectionState::Established;
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(TransferError::network_error("Connection failed", e)),
        }
    }

    /// Accept one pending connection from a listener
    pub fn accept(&mut self) -> Result<Option<Connection>> {
        let Transport::Listener(listener) = &self.transport else {
            return Err(TransferError::config_error("accept on a non-listening connection"));
        };
        match listener.accept() {
            Ok((stream, addr)) => {
                debug!("Accepted connection from {}", addr);
                Ok(Some(Self::with_transport(
                    Transport::Tcp(stream),
                    ConnectionState::Established,
                    Some(addr),
                )))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.readable = false;
                Ok(None)
            }
            Err(e) => Err(TransferError::network_error("Failed to accept connection", e)),
        }
    }

    /// Write bytes; `WouldBlock` is returned as an error and clears writability
    pub fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        let result = match &mut self.transport {
            Transport::Tcp(stream) => stream.write(buf),
            Transport::Pipe(end) => end.write(buf),
            Transport::Listener(_) | Transport::None => Err(io::ErrorKind::NotConnected.into()),
        };
        if matches!(&result, Err(e) if e.kind() == io::ErrorKind::WouldBlock) {
            self.writable = false;
        }
        result
    }

    /// Read bytes; `Ok(0)` means the peer closed the stream
    pub fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let result = match &mut self.transport {
            Transport::Tcp(stream) => stream.read(buf),
            Transport::Pipe(end) => end.read(buf),
            Transport::Listener(_) | Transport::None => Err(io::ErrorKind::NotConnected.into()),
        };
        if matches!(&result, Err(e) if e.kind() == io::ErrorKind::WouldBlock) {
            self.readable = false;
        }
        result
    }

    /// Data, EOF or a pending accept is waiting
    pub fn is_readable(&self) -> bool {
        match &self.transport {
            Transport::Pipe(end) => end.is_readable(),
            Transport::Tcp(_) | Transport::Listener(_) => self.readable,
            Transport::None => false,
        }
    }

    /// A write would make progress (or report the connect result)
    pub fn is_writable(&self) -> bool {
        match &self.transport {
            Transport::Pipe(end) => end.is_writable(),
            Transport::Tcp(_) => self.writable,
            Transport::Listener(_) | Transport::None => false,
        }
    }

    /// Drop the underlying socket
    pub fn close(&mut self) {
        if let Transport::Pipe(end) = &self.transport {
            end.close();
        }
        if self.state != ConnectionState::Closed {
            trace!("Closing connection to {:?}", self.peer_addr);
        }
        self.transport = Transport::None;
        self.state = ConnectionState::Closed;
        self.readable = false;
        self.writable = false;
        self.token = None;
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Remote address, once known
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Local address of a TCP stream or listener
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.transport {
            Transport::Tcp(stream) => stream.local_addr().ok(),
            Transport::Listener(listener) => listener.local_addr().ok(),
            Transport::Pipe(_) | Transport::None => None,
        }
    }

    /// Whether the scheduler still has to register this socket with its poll
    pub(crate) fn needs_registration(&self) -> bool {
        self.token.is_none() && matches!(self.transport, Transport::Tcp(_) | Transport::Listener(_))
    }

    /// Register the socket for edge-triggered readiness events
    pub(crate) fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        match &mut self.transport {
            Transport::Tcp(stream) => {
                registry.register(stream, token, Interest::READABLE | Interest::WRITABLE)?
            }
            Transport::Listener(listener) => {
                registry.register(listener, token, Interest::READABLE)?
            }
            Transport::Pipe(_) | Transport::None => return Ok(()),
        }
        self.token = Some(token);
        Ok(())
    }

    /// Raise cached readiness after a poll event
    pub(crate) fn mark_ready(&mut self, readable: bool, writable: bool) {
        self.readable |= readable;
        self.writable |= writable;
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}
