//! HTTP(S) tracker client (BEP 3 / BEP 23)

use std::fmt::Write as _;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use tracing::debug;
use url::Url;

use crate::bencode::{self, Value};
use crate::error::TorrentError;
use crate::tracker::parse_compact_peers;

const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

/// Announce to an HTTP tracker and parse the peer list out of its bencoded
/// response.
pub async fn request_peers(
    url: &Url,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    port: u16,
) -> Result<Vec<SocketAddr>> {
    let announce = build_announce_url(url, &info_hash, &peer_id, port);
    debug!("announcing to {}", url);

    let client = reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(|e| TorrentError::transport(format!("failed to build HTTP client: {}", e)))?;

    let response = client
        .get(&announce)
        .send()
        .await
        .map_err(|e| TorrentError::transport(format!("tracker request failed: {}", e)))?;

    if !response.status().is_success() {
        return Err(TorrentError::transport(format!(
            "tracker responded with status {}",
            response.status()
        ))
        .into());
    }

    let body = response
        .bytes()
        .await
        .map_err(|e| TorrentError::transport(format!("failed to read tracker response: {}", e)))?;

    parse_tracker_response(&body)
}

/// Build the announce URL. `info_hash` and `peer_id` are raw 20-byte values
/// and every byte is percent-encoded.
fn build_announce_url(url: &Url, info_hash: &[u8; 20], peer_id: &[u8; 20], port: u16) -> String {
    let mut announce = url.to_string();
    announce.push(if url.query().is_some() { '&' } else { '?' });

    announce.push_str("info_hash=");
    for byte in info_hash {
        let _ = write!(announce, "%{:02X}", byte);
    }
    announce.push_str("&peer_id=");
    for byte in peer_id {
        let _ = write!(announce, "%{:02X}", byte);
    }

    let _ = write!(
        announce,
        "&port={}&uploaded=0&downloaded=0&left=0&compact=1",
        port
    );
    announce
}

/// Decode a tracker response body into peer addresses.
///
/// The peer list is either a compact byte string or a list of dicts with
/// `ip` and `port` keys; the compact form is tried first.
fn parse_tracker_response(body: &[u8]) -> Result<Vec<SocketAddr>> {
    let (response, _) = bencode::decode(body)?;
    if response.as_dict().is_none() {
        return Err(TorrentError::decode("tracker response is not a dictionary").into());
    }

    if let Some(reason) = response.get(b"failure reason").and_then(Value::as_str) {
        return Err(TorrentError::protocol(format!("tracker refused: {}", reason)).into());
    }

    let peers = response
        .get(b"peers")
        .ok_or_else(|| TorrentError::decode("tracker response has no peers key"))?;

    match peers {
        Value::Bytes(compact) => parse_compact_peers(compact),
        Value::List(entries) => parse_dict_peers(entries),
        _ => Err(TorrentError::decode("peers key is neither compact nor a list").into()),
    }
}

fn parse_dict_peers(entries: &[Value]) -> Result<Vec<SocketAddr>> {
    let mut peers = Vec::with_capacity(entries.len());

    for entry in entries {
        let ip = entry
            .get(b"ip")
            .and_then(Value::as_str)
            .ok_or_else(|| TorrentError::decode("peer dict missing ip"))?;
        let port = entry
            .get(b"port")
            .and_then(Value::as_int)
            .ok_or_else(|| TorrentError::decode("peer dict missing port"))?;

        let ip: std::net::IpAddr = ip
            .parse()
            .map_err(|_| TorrentError::decode(format!("invalid peer ip '{}'", ip)))?;
        peers.push(SocketAddr::new(ip, port as u16));
    }

    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_announce_url_encodes_raw_bytes() {
        let url = Url::parse("http://tracker.example.com/announce").unwrap();
        let announce = build_announce_url(&url, &[0xC9; 20], &[0x2D; 20], 6881);

        assert!(announce.starts_with("http://tracker.example.com/announce?info_hash=%C9"));
        assert!(announce.contains("&peer_id=%2D"));
        assert!(announce.contains("&port=6881"));
        assert!(announce.contains("&uploaded=0&downloaded=0&left=0&compact=1"));
        assert_eq!(announce.matches("%C9").count(), 20);
    }

    #[test]
    fn test_build_announce_url_with_existing_query() {
        let url = Url::parse("http://tracker.example.com/announce?key=abc").unwrap();
        let announce = build_announce_url(&url, &[0u8; 20], &[0u8; 20], 6881);
        assert!(announce.starts_with("http://tracker.example.com/announce?key=abc&info_hash="));
    }

    #[test]
    fn test_parse_compact_response() {
        let mut body = b"d8:intervali1800e5:peers12:".to_vec();
        body.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1, 10, 0, 0, 2, 0, 80]);
        body.push(b'e');

        let peers = parse_tracker_response(&body).unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0], "127.0.0.1:6881".parse().unwrap());
    }

    #[test]
    fn test_parse_dict_response() {
        let body =
            b"d8:intervali1800e5:peersld2:ip9:127.0.0.14:porti6881eed2:ip8:10.0.0.24:porti80eeee";
        let peers = parse_tracker_response(body).unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[1], "10.0.0.2:80".parse().unwrap());
    }

    #[test]
    fn test_parse_failure_reason() {
        let body = b"d14:failure reason15:torrent unknowne";
        let err = parse_tracker_response(body).unwrap_err();
        assert!(err.to_string().contains("torrent unknown"));
    }

    #[test]
    fn test_parse_rejects_ragged_compact_list() {
        let mut body = b"d5:peers5:".to_vec();
        body.extend_from_slice(&[1, 2, 3, 4, 5]);
        body.push(b'e');
        assert!(parse_tracker_response(&body).is_err());
    }

    #[test]
    fn test_parse_rejects_non_bencode_body() {
        assert!(parse_tracker_response(b"<html>error</html>").is_err());
    }
}
