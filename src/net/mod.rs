//! Networking module
//!
//! Non-blocking connections and download requests.

pub mod connection;
pub mod pipe;
pub mod request;

pub use connection::{Connection, ConnectionState, SocketHandle};
pub use request::Request;
