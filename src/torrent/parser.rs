//! Torrent file parser
//!
//! Extracts a `Torrent` record from a .torrent file or a magnet URI and
//! computes the info-hash.

use anyhow::Result;
use sha1::{Digest, Sha1};
use tracing::{debug, info};

use crate::bencode::{self, Value};
use crate::error::TorrentError;
use crate::torrent::info::{FileEntry, InfoDict, Torrent};
use crate::torrent::magnet;

/// Extract torrent metadata from a source string.
///
/// The source is either a magnet URI or a filesystem path whose content is
/// a bencoded torrent.
pub fn extract(source: &str) -> Result<Torrent> {
    if source.starts_with("magnet:") {
        magnet::extract_magnet(source)
    } else {
        extract_torrent_file(source)
    }
}

fn extract_torrent_file(path: &str) -> Result<Torrent> {
    info!("loading torrent file from {}", path);

    let data = std::fs::read(path).map_err(|e| {
        TorrentError::transport(format!("failed to read torrent file '{}': {}", path, e))
    })?;
    debug!("read {} bytes from torrent file", data.len());

    parse_bytes(&data)
}

/// Parse the bencoded content of a .torrent file.
pub fn parse_bytes(data: &[u8]) -> Result<Torrent> {
    let (root, _) = bencode::decode(data)?;
    let root = root
        .as_dict()
        .ok_or_else(|| TorrentError::decode("torrent root is not a dictionary"))?;

    let info_value = root
        .get(b"info".as_ref())
        .ok_or_else(|| TorrentError::decode("missing info dictionary"))?;

    // The info-hash must round-trip through canonical encoding so that it
    // is reproducible regardless of how the value reached us.
    let info_hash: [u8; 20] = Sha1::digest(bencode::encode(info_value)).into();

    let info = parse_info_dict(info_value)?;
    let announce_list = parse_announce_list(root)?;

    let mut torrent = Torrent {
        announce_list,
        info_hash,
        piece_hashes: Vec::new(),
        info,
    };
    torrent.calculate_piece_hashes()?;

    info!(
        "parsed torrent '{}': {} pieces, {} bytes",
        torrent.info.name,
        torrent.piece_count(),
        torrent.total_length()
    );
    Ok(torrent)
}

/// Project a decoded `info` value into an `InfoDict`.
///
/// Shared between .torrent parsing and the BEP 9 metadata path.
pub fn parse_info_dict(value: &Value) -> Result<InfoDict> {
    let dict = value
        .as_dict()
        .ok_or_else(|| TorrentError::decode("info is not a dictionary"))?;

    let name = dict
        .get(b"name".as_ref())
        .and_then(Value::as_str)
        .ok_or_else(|| TorrentError::decode("missing name field"))?
        .to_string();

    let piece_length = dict
        .get(b"piece length".as_ref())
        .and_then(Value::as_int)
        .filter(|&n| n > 0)
        .ok_or_else(|| TorrentError::decode("missing or non-positive piece length"))?
        as u64;

    let pieces = dict
        .get(b"pieces".as_ref())
        .and_then(Value::as_bytes)
        .ok_or_else(|| TorrentError::decode("missing pieces field"))?
        .to_vec();

    let mut info = InfoDict {
        name,
        piece_length,
        pieces,
        length: 0,
        files: Vec::new(),
    };

    if let Some(length) = dict.get(b"length".as_ref()).and_then(Value::as_int) {
        info.length = length as u64;
    } else if let Some(file_list) = dict.get(b"files".as_ref()).and_then(Value::as_list) {
        for entry in file_list {
            info.files.push(parse_file_entry(entry)?);
        }
        if info.files.is_empty() {
            return Err(TorrentError::decode("empty files list").into());
        }
    } else {
        return Err(TorrentError::decode("neither length nor files in info dict").into());
    }

    Ok(info)
}

fn parse_file_entry(entry: &Value) -> Result<FileEntry> {
    let length = entry
        .get(b"length")
        .and_then(Value::as_int)
        .ok_or_else(|| TorrentError::decode("file entry missing length"))?
        as u64;

    let path_list = entry
        .get(b"path")
        .and_then(Value::as_list)
        .ok_or_else(|| TorrentError::decode("file entry missing path"))?;

    let mut path = Vec::with_capacity(path_list.len());
    for component in path_list {
        let component = component
            .as_str()
            .ok_or_else(|| TorrentError::decode("path component is not a UTF-8 string"))?;
        path.push(component.to_string());
    }

    Ok(FileEntry { path, length })
}

/// Flatten `announce-list` tiers when present, else fall back to `announce`.
fn parse_announce_list(
    root: &std::collections::BTreeMap<Vec<u8>, Value>,
) -> Result<Vec<String>> {
    let mut announce_list = Vec::new();

    if let Some(tiers) = root.get(b"announce-list".as_ref()).and_then(Value::as_list) {
        for tier in tiers {
            if let Some(urls) = tier.as_list() {
                for url in urls {
                    if let Some(url) = url.as_str() {
                        if !announce_list.contains(&url.to_string()) {
                            announce_list.push(url.to_string());
                        }
                    }
                }
            }
        }
    }

    if announce_list.is_empty() {
        let announce = root
            .get(b"announce".as_ref())
            .and_then(Value::as_str)
            .ok_or_else(|| TorrentError::decode("missing tracker list"))?;
        announce_list.push(announce.to_string());
    }

    Ok(announce_list)
}
