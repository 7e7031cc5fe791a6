//! Fast extension helpers (BEP 6)

use std::net::IpAddr;

use sha1::{Digest, Sha1};

/// Size of the allowed-fast set handed to each peer
pub const ALLOWED_FAST_SET_SIZE: usize = 10;

/// Generates the allowed-fast set for a peer.
///
/// The set is derived from the peer's masked IP address and the info hash,
/// so both sides can compute the same indices. Returns fewer than
/// `set_size` indices when the torrent has fewer pieces.
pub fn generate_allowed_fast_set(
    info_hash: &[u8; 20],
    peer_ip: IpAddr,
    num_pieces: u32,
    set_size: usize,
) -> Vec<u32> {
    if num_pieces == 0 {
        return Vec::new();
    }
    let set_size = set_size.min(num_pieces as usize);
    let mut allowed = Vec::with_capacity(set_size);

    let masked = match peer_ip {
        IpAddr::V4(ip) => {
            let octets = ip.octets();
            [octets[0], octets[1], octets[2], 0]
        }
        IpAddr::V6(ip) => {
            let octets = ip.octets();
            [octets[0], octets[1], octets[2], octets[3]]
        }
    };

    let mut x = Vec::with_capacity(24);
    x.extend_from_slice(&masked);
    x.extend_from_slice(info_hash);

    while allowed.len() < set_size {
        let hash = Sha1::digest(&x);
        for chunk in hash.chunks(4) {
            if allowed.len() >= set_size {
                break;
            }
            let index = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) % num_pieces;
            if !allowed.contains(&index) {
                allowed.push(index);
            }
        }
        x = hash.to_vec();
    }

    allowed
}
