//! BitTorrent protocol module
//!
//! Implements the BitTorrent peer wire protocol framing.

pub mod handshake;
pub mod message;
pub mod wire;

// Re-export main types
pub use handshake::{Handshake, HANDSHAKE_LENGTH, PROTOCOL_LENGTH, PROTOCOL_STRING};
pub use message::{BlockKey, Message, MessageId};
pub use wire::{FrameKind, FrameReader, OutboundFrame, OutboundQueue};
