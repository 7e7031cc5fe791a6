//! Metainfo of a single torrent

use sha1::{Digest, Sha1};

use crate::error::{Result, TransferError};

/// One file of the torrent payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    /// File path components (e.g., ["folder", "file.txt"])
    pub path: Vec<String>,
    /// Length in bytes
    pub length: u64,
}

/// Metainfo needed to download and verify a torrent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentInfo {
    /// Primary tracker announce URL, if any
    pub announce: Option<String>,
    /// SHA1 hash of the bencoded info dictionary
    pub info_hash: [u8; 20],
    /// Nominal piece length
    pub piece_length: u32,
    /// Piece hashes
    pub pieces: Vec<[u8; 20]>,
    /// Suggested file or directory name
    pub name: String,
    /// Files, in the order their bytes are concatenated
    pub files: Vec<TorrentFile>,
}

impl TorrentInfo {
    /// Build single-file torrent information from content bytes
    pub fn from_content(name: &str, piece_length: u32, content: &[u8]) -> Self {
        let pieces: Vec<[u8; 20]> = content
            .chunks(piece_length as usize)
            .map(|chunk| Sha1::digest(chunk).into())
            .collect();
        let mut hasher = Sha1::new();
        hasher.update(name.as_bytes());
        for piece in &pieces {
            hasher.update(piece);
        }
        Self {
            announce: None,
            info_hash: hasher.finalize().into(),
            piece_length,
            pieces,
            name: name.to_string(),
            files: vec![TorrentFile {
                path: vec![name.to_string()],
                length: content.len() as u64,
            }],
        }
    }

    /// Payload length across all files
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.length).sum()
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn is_multi_file(&self) -> bool {
        self.files.len() > 1
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    /// SHA-1 over the bencoded `info` dictionary
    pub fn generate_info_hash(info_dict_bytes: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(info_dict_bytes);
        hasher.finalize().into()
    }

    /// Split the `pieces` string into 20-byte digests
    pub fn parse_piece_hashes(pieces_bytes: &[u8]) -> Result<Vec<[u8; 20]>> {
        if pieces_bytes.len() % 20 != 0 {
            return Err(TransferError::config_error(format!(
                "Pieces field length must be a multiple of 20, got {}",
                pieces_bytes.len()
            )));
        }

        Ok(pieces_bytes
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect())
    }

    pub fn piece_hash(&self, index: usize) -> Option<[u8; 20]> {
        self.pieces.get(index).copied()
    }

    /// Length of a specific piece; the last one may be short
    pub fn piece_size(&self, index: usize) -> u32 {
        match self.piece_range(index) {
            Some((start, end)) => (end - start) as u32,
            None => 0,
        }
    }

    /// Half-open byte range of a piece within the payload
    pub fn piece_range(&self, index: usize) -> Option<(u64, u64)> {
        if index >= self.pieces.len() {
            return None;
        }

        let start = index as u64 * self.piece_length as u64;
        let end = (start + self.piece_length as u64).min(self.total_size());
        Some((start, end))
    }
}
