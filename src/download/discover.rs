//! Peer discovery
//!
//! Parallel tracker announces, deduplication, and concurrent session
//! establishment. Individual tracker or peer failures are logged and
//! dropped; only an empty final set is fatal to the download.

use std::collections::HashSet;
use std::net::SocketAddr;

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::peer::session::PeerSession;
use crate::torrent::Torrent;
use crate::tracker;

/// Query every tracker in the announce list concurrently and pool the
/// results. Failing trackers contribute nothing.
pub async fn gather_tracker_peers(
    torrent: &Torrent,
    peer_id: [u8; 20],
    port: u16,
) -> Vec<SocketAddr> {
    let mut announces = JoinSet::new();
    for tracker_url in torrent.announce_list.clone() {
        let info_hash = torrent.info_hash;
        announces.spawn(async move {
            let result = tracker::request_peers(&tracker_url, info_hash, peer_id, port).await;
            (tracker_url, result)
        });
    }

    let mut peers = Vec::new();
    while let Some(joined) = announces.join_next().await {
        let Ok((tracker_url, result)) = joined else { continue };
        match result {
            Ok(found) => {
                debug!("tracker {} returned {} peers", tracker_url, found.len());
                peers.extend(found);
            }
            Err(e) => warn!("tracker {} failed: {}", tracker_url, e),
        }
    }

    peers
}

/// Drop duplicate addresses, keyed by their `ip:port` string, preserving
/// first-seen order.
pub fn remove_duplicate_peers(peers: Vec<SocketAddr>) -> Vec<SocketAddr> {
    let mut seen = HashSet::new();
    let mut unique = Vec::with_capacity(peers.len());

    for peer in peers {
        if seen.insert(peer.to_string()) {
            unique.push(peer);
        }
    }

    unique
}

/// Dial and handshake every address concurrently, keeping the sessions
/// that complete.
pub async fn connect_peers(
    addrs: &[SocketAddr],
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    piece_count: usize,
) -> Vec<PeerSession> {
    let mut dials = JoinSet::new();
    for &addr in addrs {
        dials.spawn(async move {
            (addr, PeerSession::connect(addr, info_hash, peer_id, piece_count).await)
        });
    }

    let mut sessions = Vec::new();
    while let Some(joined) = dials.join_next().await {
        let Ok((addr, result)) = joined else { continue };
        match result {
            Ok(session) => sessions.push(session),
            Err(e) => debug!("could not connect to peer {}: {}", addr, e),
        }
    }

    info!("established {} peer sessions from {} addresses", sessions.len(), addrs.len());
    sessions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_duplicate_peers_preserves_first_seen_order() {
        let a: SocketAddr = "1.1.1.1:1".parse().unwrap();
        let b: SocketAddr = "2.2.2.2:2".parse().unwrap();

        let unique = remove_duplicate_peers(vec![a, a, b]);
        assert_eq!(unique, vec![a, b]);
    }

    #[test]
    fn test_remove_duplicate_peers_distinguishes_ports() {
        let a: SocketAddr = "1.1.1.1:1".parse().unwrap();
        let b: SocketAddr = "1.1.1.1:2".parse().unwrap();

        let unique = remove_duplicate_peers(vec![a, b, a]);
        assert_eq!(unique, vec![a, b]);
    }

    #[test]
    fn test_remove_duplicate_peers_empty() {
        assert!(remove_duplicate_peers(Vec::new()).is_empty());
    }

    #[tokio::test]
    async fn test_connect_peers_with_no_listeners() {
        let addrs = vec!["127.0.0.1:1".parse().unwrap()];
        let sessions = connect_peers(&addrs, [0u8; 20], [1u8; 20], 4).await;
        assert!(sessions.is_empty());
    }
}
