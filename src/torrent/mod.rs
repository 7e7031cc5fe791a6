//! Torrent module
//!
//! Metainfo parsing, piece bookkeeping and the torrent manager the peer
//! commands report to.

pub mod bitfield;
pub mod info;
pub mod manager;
pub mod memory;
pub mod monitor;
pub mod parser;
pub mod piece;

pub use bitfield::Bitfield;
pub use info::{TorrentFile, TorrentInfo};
pub use manager::{BlockOutcome, TorrentHandle, TorrentManager};
pub use memory::MemoryTorrent;
pub use monitor::DownloadMonitorCommand;
pub use parser::TorrentParser;
pub use piece::{Piece, BLOCK_LENGTH};
