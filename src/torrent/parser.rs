//! Torrent file parser
//!
//! Decodes .torrent files with `serde_bencode` and extracts metadata. The
//! info hash is the SHA-1 of the re-encoded info dictionary.

use std::collections::HashMap;
use std::path::Path;

use serde_bencode::value::Value;
use tracing::{debug, error, info};

use crate::error::{Result, TransferError};
use crate::torrent::info::{TorrentFile, TorrentInfo};

type Dict = HashMap<Vec<u8>, Value>;

/// Parser for .torrent files
pub struct TorrentParser;

impl TorrentParser {
    /// Parse a .torrent file from bytes
    pub fn parse_bytes(data: &[u8]) -> Result<TorrentInfo> {
        info!("Parsing torrent file from {} bytes", data.len());

        let root = serde_bencode::from_bytes::<Value>(data)
            .map_err(|e| TransferError::config_error(format!("Invalid bencode: {}", e)))?;
        let Value::Dict(root) = root else {
            return Err(TransferError::config_error("Root must be a dictionary"));
        };

        let announce = get_bytes(&root, b"announce").map(|b| String::from_utf8_lossy(b).to_string());

        let info_value = root
            .get(b"info".as_slice())
            .ok_or_else(|| TransferError::config_error("Missing info dictionary"))?;
        let Value::Dict(info_dict) = info_value else {
            return Err(TransferError::config_error("info must be a dictionary"));
        };

        let encoded_info = serde_bencode::to_bytes(info_value)
            .map_err(|e| TransferError::config_error(format!("Failed to encode info: {}", e)))?;
        let info_hash = TorrentInfo::generate_info_hash(&encoded_info);

        let name = get_bytes(info_dict, b"name")
            .map(|b| String::from_utf8_lossy(b).to_string())
            .ok_or_else(|| TransferError::config_error("Missing name field"))?;

        let piece_length = get_int(info_dict, b"piece length")
            .filter(|&len| len > 0 && len <= u32::MAX as i64)
            .ok_or_else(|| TransferError::config_error("Missing or invalid piece length"))?
            as u32;

        let pieces = get_bytes(info_dict, b"pieces")
            .ok_or_else(|| TransferError::config_error("Missing pieces field"))?;
        let pieces = TorrentInfo::parse_piece_hashes(pieces)?;

        let files = if let Some(length) = get_int(info_dict, b"length") {
            vec![TorrentFile {
                path: vec![name.clone()],
                length: length.max(0) as u64,
            }]
        } else if let Some(Value::List(entries)) = info_dict.get(b"files".as_slice()) {
            entries
                .iter()
                .map(parse_file_entry)
                .collect::<Result<Vec<_>>>()?
        } else {
            error!("Torrent has neither length nor files");
            return Err(TransferError::config_error("Missing length or files field"));
        };

        let info = TorrentInfo {
            announce,
            info_hash,
            piece_length,
            pieces,
            name,
            files,
        };

        let expected_pieces = info.total_size().div_ceil(piece_length as u64) as usize;
        if expected_pieces != info.piece_count() {
            return Err(TransferError::config_error(format!(
                "Torrent declares {} piece hashes for {} pieces",
                info.piece_count(),
                expected_pieces
            )));
        }

        debug!("Info hash: {}", info.info_hash_hex());
        info!("Successfully parsed torrent: {}", info.name);
        Ok(info)
    }

    /// Parse a .torrent file from a file path
    pub fn parse_file(path: &Path) -> Result<TorrentInfo> {
        info!("Loading torrent file from: {}", path.display());
        let data = std::fs::read(path).map_err(|e| {
            TransferError::config_error(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::parse_bytes(&data)
    }
}

fn get_bytes<'a>(dict: &'a Dict, key: &[u8]) -> Option<&'a [u8]> {
    match dict.get(key) {
        Some(Value::Bytes(bytes)) => Some(bytes),
        _ => None,
    }
}

fn get_int(dict: &Dict, key: &[u8]) -> Option<i64> {
    match dict.get(key) {
        Some(Value::Int(value)) => Some(*value),
        _ => None,
    }
}

fn parse_file_entry(entry: &Value) -> Result<TorrentFile> {
    let Value::Dict(file) = entry else {
        return Err(TransferError::config_error("File entry must be a dictionary"));
    };
    let length = get_int(file, b"length")
        .ok_or_else(|| TransferError::config_error("Missing file length"))?;
    let Some(Value::List(components)) = file.get(b"path".as_slice()) else {
        return Err(TransferError::config_error("Missing file path"));
    };
    let path = components
        .iter()
        .filter_map(|c| match c {
            Value::Bytes(b) => Some(String::from_utf8_lossy(b).to_string()),
            _ => None,
        })
        .collect();
    Ok(TorrentFile {
        path,
        length: length.max(0) as u64,
    })
}
