//! Peer wire handshake
//!
//! Handles the fixed-length handshake exchanged before any framed message.

use std::fmt;

use bytes::{BufMut, BytesMut};
use rand::Rng;
use tracing::{debug, info, trace, warn};

use crate::error::{Result, TransferError};

/// Protocol name sent in every handshake
pub const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// Value of the leading length byte
pub const PROTOCOL_LENGTH: u8 = 19;

/// Total handshake length on the wire
pub const HANDSHAKE_LENGTH: usize = 68;

/// Bytes before the peer id; enough to check protocol and info hash
pub const HANDSHAKE_PREFIX_LENGTH: usize = 48;

/// Reserved-bit mask for the fast extension (BEP 6), in reserved byte 7
pub const FAST_EXTENSION_BIT: u8 = 0x04;

const RESERVED: std::ops::Range<usize> = 20..28;
const INFO_HASH: std::ops::Range<usize> = 28..48;
const PEER_ID: std::ops::Range<usize> = 48..68;

/// Opening message of a peer connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    /// Sender's peer id
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        trace!("Handshake for torrent {}", hex::encode(info_hash));
        Self {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    /// Create a handshake advertising the fast extension
    pub fn with_fast_extension(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        let mut handshake = Self::new(info_hash, peer_id);
        handshake.reserved[7] |= FAST_EXTENSION_BIT;
        handshake
    }

    pub fn is_fast_extension_supported(&self) -> bool {
        self.reserved[7] & FAST_EXTENSION_BIT != 0
    }

    /// Azureus-style id: `-RM0100-` followed by 12 random bytes
    pub fn generate_peer_id() -> [u8; 20] {
        let mut id = [0u8; 20];
        id[..8].copy_from_slice(b"-RM0100-");
        rand::thread_rng().fill(&mut id[8..]);
        info!("Using peer id {}", String::from_utf8_lossy(&id[..8]));
        debug!("Full peer id: {}", hex::encode(id));
        id
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = BytesMut::with_capacity(HANDSHAKE_LENGTH);
        out.put_u8(PROTOCOL_LENGTH);
        out.extend_from_slice(PROTOCOL_STRING.as_bytes());
        out.extend_from_slice(&self.reserved);
        out.extend_from_slice(&self.info_hash);
        out.extend_from_slice(&self.peer_id);
        out.to_vec()
    }

    /// Check the protocol name and info hash in the first 48 bytes
    pub fn check_prefix(data: &[u8], expected_info_hash: &[u8; 20]) -> Result<()> {
        if data.len() < HANDSHAKE_PREFIX_LENGTH {
            return Err(TransferError::protocol_error(format!(
                "Handshake prefix too short: {} bytes",
                data.len()
            )));
        }
        check_protocol(data)?;
        if data[INFO_HASH] != expected_info_hash[..] {
            warn!(
                "Peer offered info hash {}, wanted {}",
                hex::encode(&data[INFO_HASH]),
                hex::encode(expected_info_hash)
            );
            return Err(TransferError::protocol_error(format!(
                "Info hash mismatch: expected {}, got {}",
                hex::encode(expected_info_hash),
                hex::encode(&data[INFO_HASH])
            )));
        }
        Ok(())
    }

    /// Parse a complete 68-byte handshake
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < HANDSHAKE_LENGTH {
            return Err(TransferError::protocol_error(format!(
                "Handshake needs {} bytes, got {}",
                HANDSHAKE_LENGTH,
                data.len()
            )));
        }
        check_protocol(data)?;

        let mut handshake = Self::new([0u8; 20], [0u8; 20]);
        handshake.reserved.copy_from_slice(&data[RESERVED]);
        handshake.info_hash.copy_from_slice(&data[INFO_HASH]);
        handshake.peer_id.copy_from_slice(&data[PEER_ID]);
        trace!("Parsed {}", handshake);
        Ok(handshake)
    }

    pub fn matches(&self, info_hash: &[u8; 20]) -> bool {
        self.info_hash == *info_hash
    }
}

fn check_protocol(data: &[u8]) -> Result<()> {
    if data[0] != PROTOCOL_LENGTH {
        return Err(TransferError::protocol_error(format!(
            "Unexpected protocol name length {}",
            data[0]
        )));
    }
    if &data[1..20] != PROTOCOL_STRING.as_bytes() {
        warn!("Peer speaks an unknown protocol");
        return Err(TransferError::protocol_error("Invalid protocol string"));
    }
    Ok(())
}

impl fmt::Display for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "handshake peerId={}, reserved={}",
            hex::encode(self.peer_id),
            hex::encode(self.reserved)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fast_handshake_on_the_wire() {
        let sent = Handshake::with_fast_extension([1u8; 20], [2u8; 20]);
        let bytes = sent.serialize();
        assert_eq!(bytes.len(), HANDSHAKE_LENGTH);
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], b"BitTorrent protocol");
        assert_eq!(bytes[27], FAST_EXTENSION_BIT);

        let received = Handshake::deserialize(&bytes).unwrap();
        assert_eq!(received, sent);
        assert!(received.is_fast_extension_supported());
    }

    #[test]
    fn test_peer_id_prefix() {
        let id = Handshake::generate_peer_id();
        assert_eq!(&id[..8], b"-RM0100-");
        assert_ne!(id, Handshake::generate_peer_id());
    }

    #[test]
    fn test_matches_info_hash() {
        let handshake = Handshake::new([1u8; 20], [2u8; 20]);
        assert!(handshake.matches(&[1u8; 20]));
        assert!(!handshake.matches(&[3u8; 20]));
        assert!(!handshake.is_fast_extension_supported());
    }

    #[test]
    fn test_check_prefix() {
        let info_hash = [7u8; 20];
        let bytes = Handshake::new(info_hash, [2u8; 20]).serialize();

        assert!(Handshake::check_prefix(&bytes[..48], &info_hash).is_ok());
        assert!(Handshake::check_prefix(&bytes[..48], &[8u8; 20]).is_err());
        assert!(Handshake::check_prefix(&bytes[..20], &info_hash).is_err());
    }

    #[test]
    fn test_deserialize_rejects_bad_protocol() {
        let mut bytes = Handshake::new([1u8; 20], [2u8; 20]).serialize();
        bytes[1] = b'X';
        assert!(Handshake::deserialize(&bytes).is_err());
        assert!(Handshake::deserialize(&bytes[..40]).is_err());
    }
}
