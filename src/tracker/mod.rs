//! Tracker clients
//!
//! Queries HTTP(S) and UDP trackers for peer addresses, dispatching on the
//! announce URI scheme.

pub mod http;
pub mod udp;

use std::net::SocketAddr;

use anyhow::Result;
use url::Url;

use crate::error::TorrentError;

/// Ask a tracker for peers sharing `info_hash`.
///
/// `port` is the TCP port advertised in the announce; the downloader does
/// not accept inbound connections but announces it regardless.
pub async fn request_peers(
    tracker_url: &str,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    port: u16,
) -> Result<Vec<SocketAddr>> {
    let url = Url::parse(tracker_url)
        .map_err(|e| TorrentError::decode(format!("invalid tracker URL '{}': {}", tracker_url, e)))?;

    match url.scheme() {
        "http" | "https" => http::request_peers(&url, info_hash, peer_id, port).await,
        "udp" => udp::request_peers(&url, info_hash, peer_id, port).await,
        scheme => Err(TorrentError::protocol(format!(
            "unrecognised tracker url scheme: {}",
            scheme
        ))
        .into()),
    }
}

/// Parse compact peer records: 6 bytes each, IPv4 followed by a big-endian
/// port. Used by both tracker flavours and the DHT.
pub fn parse_compact_peers(data: &[u8]) -> Result<Vec<SocketAddr>> {
    if data.len() % 6 != 0 {
        return Err(TorrentError::decode(format!(
            "compact peer list length {} is not a multiple of 6",
            data.len()
        ))
        .into());
    }

    let mut peers = Vec::with_capacity(data.len() / 6);
    for chunk in data.chunks_exact(6) {
        let ip = std::net::Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
        let port = u16::from_be_bytes([chunk[4], chunk[5]]);
        peers.push(SocketAddr::new(ip.into(), port));
    }

    Ok(peers)
}
