//! Magnet link parser
//!
//! Extracts the info-hash and tracker list from a `magnet:?` URI. Piece
//! hashes and layout stay empty until the BEP 9 metadata exchange fills
//! them in.

use anyhow::Result;
use tracing::{debug, info};
use url::Url;

use crate::error::TorrentError;
use crate::torrent::info::{InfoDict, Torrent};

/// Parse a magnet URI of the form
/// `magnet:?xt=urn:btih:<40-hex|32-base32>&tr=<uri>(&tr=…)*(&dn=<name>)?`.
pub fn extract_magnet(uri: &str) -> Result<Torrent> {
    let url = Url::parse(uri)
        .map_err(|e| TorrentError::decode(format!("invalid magnet URI: {}", e)))?;
    if url.scheme() != "magnet" {
        return Err(TorrentError::decode("URI is not a magnet link").into());
    }

    let mut info_hash = None;
    let mut announce_list = Vec::new();
    let mut name = String::new();

    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "xt" => {
                if let Some(rest) = value.strip_prefix("urn:btih:") {
                    info_hash = Some(parse_info_hash(rest)?);
                }
            }
            "tr" => announce_list.push(value.to_string()),
            "dn" => name = value.to_string(),
            other => debug!("ignoring magnet parameter '{}'", other),
        }
    }

    let info_hash = info_hash
        .ok_or_else(|| TorrentError::decode("magnet URI is missing the info hash"))?;
    if announce_list.is_empty() {
        return Err(TorrentError::decode("magnet URI is missing tracker URLs").into());
    }

    info!(
        "parsed magnet link: info_hash={}, {} trackers",
        hex::encode(info_hash),
        announce_list.len()
    );

    Ok(Torrent {
        announce_list,
        info_hash,
        piece_hashes: Vec::new(),
        info: InfoDict { name, ..Default::default() },
    })
}

/// The hash is either 40 hex characters or 32 base32 characters; any other
/// encoding fails.
fn parse_info_hash(encoded: &str) -> Result<[u8; 20]> {
    match encoded.len() {
        40 => {
            let bytes = hex::decode(encoded)
                .map_err(|_| TorrentError::decode("invalid hexadecimal info hash"))?;
            let mut hash = [0u8; 20];
            hash.copy_from_slice(&bytes);
            Ok(hash)
        }
        32 => base32_decode(encoded)
            .ok_or_else(|| TorrentError::decode("invalid base32 info hash").into()),
        other => Err(TorrentError::decode(format!(
            "unsupported info hash encoding (length {})",
            other
        ))
        .into()),
    }
}

/// Decode 32 characters of RFC 4648 base32 into 20 bytes.
fn base32_decode(input: &str) -> Option<[u8; 20]> {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

    let input = input.to_uppercase();
    let mut bits = 0u64;
    let mut bit_count = 0u32;
    let mut out = Vec::with_capacity(20);

    for &c in input.as_bytes() {
        let val = ALPHABET.iter().position(|&x| x == c)? as u64;
        bits = (bits << 5) | val;
        bit_count += 5;

        while bit_count >= 8 {
            bit_count -= 8;
            out.push((bits >> bit_count) as u8);
            bits &= (1 << bit_count) - 1;
        }
    }

    if out.len() == 20 {
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&out);
        Some(hash)
    } else {
        None
    }
}
