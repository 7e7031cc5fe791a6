//! Peer management module
//!
//! Peer state, the per-connection interaction engine, and the commands that
//! open, accept, service and choke peer connections.

pub mod choke;
pub mod command;
pub mod fast;
pub mod initiate;
pub mod interaction;
pub mod listen;
pub mod slot;
pub mod state;

// Re-export main types
pub use choke::PeerChokeCommand;
pub use command::{PeerInteractionCommand, Sequence};
pub use initiate::PeerInitiateConnectionCommand;
pub use interaction::PeerInteraction;
pub use listen::PeerListenCommand;
pub use slot::PeerConnectionSlotCommand;
pub use state::{Peer, PeerHandle};
