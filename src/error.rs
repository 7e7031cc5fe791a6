//! Error types for the transfer engine
//!
//! Every failure a command can hit is a [`TransferError`]. The scheduler uses
//! [`TransferError::kind`] to decide how far an abort reaches: protocol and
//! I/O failures end a single command, configuration failures end the whole
//! session.

use std::io;

use thiserror::Error;

/// Result alias used across the library
pub type Result<T> = std::result::Result<T, TransferError>;

/// Coarse classification used by the scheduler when a command fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed frame, flooding, bad handshake: fatal to one connection
    ProtocolViolation,
    /// Socket failure, peer hang-up or timeout: fatal to one connection
    Io,
    /// Piece storage refused an operation
    Storage,
    /// Unsupported scheme or proxy method: fatal to the session
    FatalConfiguration,
}

/// Error type for every command and collaborator in the engine
#[derive(Debug, Error)]
pub enum TransferError {
    /// BitTorrent wire protocol violations
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// The peer sent choke/unchoke or keep-alive messages too often
    #[error("Flooding detected from {peer}")]
    Flooding { peer: String },

    /// No initiate command exists for this URL scheme
    #[error("{protocol} is not supported yet")]
    UnsupportedProtocol { protocol: String },

    /// The configured proxy method is neither `get` nor `tunnel`
    #[error("Proxy method `{method}` is not supported")]
    UnsupportedProxyMethod { method: String },

    /// Invalid configuration values
    #[error("Config error: {message}")]
    Config { message: String },

    /// Socket level failures
    #[error("Network error: {message} ({source})")]
    Network {
        message: String,
        #[source]
        source: io::Error,
    },

    /// The remote side closed the connection
    #[error("Connection closed by {peer}")]
    ConnectionClosed { peer: String },

    /// A command waited longer than its timeout for socket readiness
    #[error("Timed out: {context}")]
    Timeout { context: String },

    /// Piece storage errors
    #[error("Storage error: {message}")]
    Storage { message: String },
}

impl TransferError {
    /// Create a new Protocol error
    pub fn protocol_error(message: impl Into<String>) -> Self {
        TransferError::Protocol {
            message: message.into(),
        }
    }

    /// Create a new Flooding error
    pub fn flooding(peer: impl Into<String>) -> Self {
        TransferError::Flooding { peer: peer.into() }
    }

    /// Create a new UnsupportedProtocol error
    pub fn unsupported_protocol(protocol: impl Into<String>) -> Self {
        TransferError::UnsupportedProtocol {
            protocol: protocol.into(),
        }
    }

    /// Create a new UnsupportedProxyMethod error
    pub fn unsupported_proxy_method(method: impl Into<String>) -> Self {
        TransferError::UnsupportedProxyMethod {
            method: method.into(),
        }
    }

    /// Create a new Config error
    pub fn config_error(message: impl Into<String>) -> Self {
        TransferError::Config {
            message: message.into(),
        }
    }

    /// Create a new Network error wrapping an I/O error
    pub fn network_error(message: impl Into<String>, source: io::Error) -> Self {
        TransferError::Network {
            message: message.into(),
            source,
        }
    }

    /// Create a new ConnectionClosed error
    pub fn connection_closed(peer: impl Into<String>) -> Self {
        TransferError::ConnectionClosed { peer: peer.into() }
    }

    /// Create a new Timeout error
    pub fn timeout(context: impl Into<String>) -> Self {
        TransferError::Timeout {
            context: context.into(),
        }
    }

    /// Create a new Storage error
    pub fn storage_error(message: impl Into<String>) -> Self {
        TransferError::Storage {
            message: message.into(),
        }
    }

    /// Classify the error for abort handling
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::Protocol { .. } | TransferError::Flooding { .. } => {
                ErrorKind::ProtocolViolation
            }
            TransferError::UnsupportedProtocol { .. }
            | TransferError::UnsupportedProxyMethod { .. }
            | TransferError::Config { .. } => ErrorKind::FatalConfiguration,
            TransferError::Network { .. }
            | TransferError::ConnectionClosed { .. }
            | TransferError::Timeout { .. } => ErrorKind::Io,
            TransferError::Storage { .. } => ErrorKind::Storage,
        }
    }

    /// Whether the failure must abort every command sharing the session id
    pub fn is_session_fatal(&self) -> bool {
        self.kind() == ErrorKind::FatalConfiguration
    }
}

impl From<io::Error> for TransferError {
    fn from(err: io::Error) -> Self {
        TransferError::network_error("I/O failure", err)
    }
}

impl From<url::ParseError> for TransferError {
    fn from(err: url::ParseError) -> Self {
        TransferError::config_error(format!("Invalid URL: {}", err))
    }
}
