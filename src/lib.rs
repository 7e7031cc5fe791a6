//! rust-multi-downloader
//!
//! A multi-protocol download client whose connections are driven by one
//! cooperative command loop: HTTP(S) and FTP connection initiation plus the
//! BitTorrent peer wire engine.

pub mod cli;
pub mod engine;
pub mod error;
pub mod initiate;
pub mod net;
pub mod peer;
pub mod protocol;
pub mod torrent;

pub use error::{ErrorKind, Result, TransferError};

pub use cli::{CliArgs, Config, ProxyConfig};
pub use engine::{
    Checkpoint, Command, CommandId, CommandStatus, Cuid, EngineContext, Scheduler, SessionFailure,
    SocketWatch, TransferStats, Wait,
};
pub use initiate::{
    create_initiate_connection_command, FtpInitiateConnectionCommand, HandoffHandle,
    HttpInitiateConnectionCommand, ProtocolHandoff, ProxyMethod,
};
pub use net::{Connection, ConnectionState, Request, SocketHandle};
pub use peer::{
    Peer, PeerChokeCommand, PeerConnectionSlotCommand, PeerHandle, PeerInitiateConnectionCommand,
    PeerInteraction, PeerInteractionCommand, PeerListenCommand, Sequence,
};
pub use protocol::{Handshake, Message, MessageId};
pub use torrent::{
    DownloadMonitorCommand, MemoryTorrent, TorrentHandle, TorrentInfo, TorrentManager, TorrentParser,
};
