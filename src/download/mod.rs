//! Download orchestration
//!
//! Runs the full flow: metadata extraction, peer discovery over trackers
//! and the DHT, the magnet metadata pre-phase, then fan-out of piece work
//! to one worker task per peer session and in-order assembly of the
//! results.

pub mod discover;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dht;
use crate::error::TorrentError;
use crate::peer::handshake::Handshake;
use crate::peer::session::PeerSession;
use crate::piece::{try_download_piece, PieceResult, PieceWork};
use crate::storage;
use crate::torrent::{self, Torrent};

/// TCP port advertised to trackers. The downloader does not accept
/// inbound connections.
pub const LISTEN_PORT: u16 = 6881;

/// Consecutive failed piece attempts before a session is abandoned
const MAX_PIECE_FAILURES: u32 = 5;

/// Consecutive skip-and-requeues before a session is abandoned. A peer
/// that lacks everything still in the queue can never finish the
/// download; keeping its worker alive would only stop the dispatcher
/// from observing exhaustion.
const MAX_CONSECUTIVE_SKIPS: u32 = 500;

/// Pause before re-polling the queue after a skip, so a peer that lacks
/// the remaining pieces does not spin on them.
const REQUEUE_BACKOFF: std::time::Duration = std::time::Duration::from_millis(100);

/// Download the content described by `source` (torrent file path or
/// magnet URI) into `output_dir`.
pub async fn run(source: &str, output_dir: &Path) -> Result<()> {
    let mut torrent = torrent::extract(source)?;
    let peer_id = Handshake::generate_peer_id();
    info!("starting download, info hash {}", torrent.info_hash_hex());

    let addrs = discover::gather_tracker_peers(&torrent, peer_id, LISTEN_PORT).await;
    let addrs = discover::remove_duplicate_peers(addrs);
    info!("{} unique peers from trackers", addrs.len());

    let mut sessions =
        discover::connect_peers(&addrs, torrent.info_hash, peer_id, torrent.piece_count()).await;

    supplement_from_dht(&mut sessions, &addrs, &torrent, peer_id).await;

    if sessions.is_empty() {
        return Err(TorrentError::exhausted(
            "no connectable peers after tracker and DHT exhaustion",
        )
        .into());
    }

    // Magnet pre-phase: piece hashes are unknown until a peer hands over
    // the metadata.
    if torrent.piece_hashes.is_empty() {
        fetch_metadata(&mut sessions, &mut torrent).await?;
    }

    let data = dispatch(&torrent, sessions).await?;
    storage::write_to_disk(&torrent, &data, output_dir).await?;

    info!("file download complete: {}", torrent.info.name);
    Ok(())
}

/// Ask the DHT for more peers, bootstrapped from sessions that advertised
/// a DHT port, and connect to whatever is new. Best-effort.
async fn supplement_from_dht(
    sessions: &mut Vec<PeerSession>,
    known: &[SocketAddr],
    torrent: &Torrent,
    peer_id: [u8; 20],
) {
    let bootstrap: Vec<SocketAddr> = sessions
        .iter()
        .filter(|s| s.supports_dht)
        .filter_map(|s| s.dht_port.map(|port| SocketAddr::new(s.addr.ip(), port)))
        .collect();
    if bootstrap.is_empty() {
        return;
    }

    let extra = match dht::discover_peers(&bootstrap, torrent.info_hash).await {
        Ok(extra) => extra,
        Err(e) => {
            debug!("dht lookup failed: {}", e);
            return;
        }
    };

    let fresh: Vec<SocketAddr> = discover::remove_duplicate_peers(extra)
        .into_iter()
        .filter(|addr| !known.contains(addr))
        .collect();
    if fresh.is_empty() {
        return;
    }

    info!("{} additional peers from the DHT", fresh.len());
    let extra_sessions =
        discover::connect_peers(&fresh, torrent.info_hash, peer_id, torrent.piece_count()).await;
    sessions.extend(extra_sessions);
}

/// Fetch the info dictionary via BEP 9 from the first session that will
/// serve it, then derive the piece hashes.
async fn fetch_metadata(sessions: &mut [PeerSession], torrent: &mut Torrent) -> Result<()> {
    for session in sessions.iter_mut() {
        match session.request_metadata().await {
            Ok(metadata) => match torrent.populate_from_metadata(&metadata) {
                Ok(()) => {
                    info!(
                        "metadata acquired from {}: '{}', {} pieces",
                        session.addr,
                        torrent.info.name,
                        torrent.piece_count()
                    );
                    return Ok(());
                }
                Err(e) => warn!("metadata from {} was unusable: {}", session.addr, e),
            },
            Err(e) => debug!("metadata request to {} failed: {}", session.addr, e),
        }
    }

    Err(TorrentError::metadata_unavailable(
        "no connected peer served the torrent metadata",
    )
    .into())
}

/// Fan piece work out to one worker per session and assemble the results
/// into a single buffer.
async fn dispatch(torrent: &Torrent, sessions: Vec<PeerSession>) -> Result<Vec<u8>> {
    let piece_count = torrent.piece_count();
    let total_length = torrent.total_length() as usize;

    let (work_tx, work_rx) = mpsc::channel::<PieceWork>(piece_count.max(1));
    let work_rx = Arc::new(Mutex::new(work_rx));
    let (result_tx, mut result_rx) = mpsc::channel::<PieceResult>(piece_count.max(1));
    let cancel = CancellationToken::new();

    for index in 0..piece_count {
        let work = PieceWork {
            index: index as u32,
            expected_hash: torrent.piece_hashes[index],
            size: torrent.piece_size(index),
        };
        work_tx
            .send(work)
            .await
            .map_err(|_| TorrentError::exhausted("work queue closed during setup"))?;
    }

    info!(
        "dispatching {} pieces across {} peers",
        piece_count,
        sessions.len()
    );

    let mut workers = JoinSet::new();
    for session in sessions {
        workers.spawn(worker(
            session,
            work_tx.clone(),
            work_rx.clone(),
            result_tx.clone(),
            cancel.clone(),
        ));
    }
    // Workers hold the only remaining senders; assembly observes a closed
    // results channel when every worker has exited.
    drop(work_tx);
    drop(result_tx);

    let mut buffer = vec![0u8; total_length];
    let mut completed = 0usize;

    while completed < piece_count {
        let Some(result) = result_rx.recv().await else { break };

        let start = result.index as usize * torrent.info.piece_length as usize;
        buffer[start..start + result.bytes.len()].copy_from_slice(&result.bytes);

        completed += 1;
        info!(
            "{:.2}% complete ({}/{} pieces)",
            completed as f64 / piece_count as f64 * 100.0,
            completed,
            piece_count
        );
    }

    // Tear the sessions down; a worker mid-attempt is not worth waiting
    // out once the buffer is full (or provably never will be).
    cancel.cancel();
    workers.abort_all();
    while workers.join_next().await.is_some() {}

    if completed < piece_count {
        return Err(TorrentError::exhausted(format!(
            "all sessions closed with {} of {} pieces outstanding",
            piece_count - completed,
            piece_count
        ))
        .into());
    }

    Ok(buffer)
}

/// One download worker bound to one peer session.
///
/// Pulls work FIFO, skips-and-requeues pieces the peer lacks, and returns
/// the held work item to the queue before the session is dropped on
/// failure.
async fn worker(
    mut session: PeerSession,
    work_tx: mpsc::Sender<PieceWork>,
    work_rx: Arc<Mutex<mpsc::Receiver<PieceWork>>>,
    result_tx: mpsc::Sender<PieceResult>,
    cancel: CancellationToken,
) {
    let addr = session.addr;
    let mut consecutive_failures = 0u32;
    let mut consecutive_skips = 0u32;

    loop {
        let work = tokio::select! {
            _ = cancel.cancelled() => break,
            work = recv_work(&work_rx) => match work {
                Some(work) => work,
                None => break,
            },
        };

        if !session.has_piece(work.index) {
            let index = work.index;
            if work_tx.send(work).await.is_err() {
                break;
            }
            consecutive_skips += 1;
            if consecutive_skips >= MAX_CONSECUTIVE_SKIPS {
                debug!("peer {} has none of the remaining pieces, giving up", addr);
                break;
            }
            debug!("peer {} lacks piece {}, re-queued", addr, index);
            tokio::time::sleep(REQUEUE_BACKOFF).await;
            continue;
        }
        consecutive_skips = 0;

        match try_download_piece(&mut session, &work).await {
            Ok(bytes) => {
                consecutive_failures = 0;
                let result = PieceResult { index: work.index, bytes };
                if result_tx.send(result).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(
                    "piece {} from {} failed ({}), re-queuing",
                    work.index,
                    addr,
                    error_kind(&e)
                );

                // Hand the item back before this session goes away.
                let _ = work_tx.send(work).await;
                consecutive_failures += 1;

                let fatal = e
                    .downcast_ref::<TorrentError>()
                    .map(TorrentError::is_session_fatal)
                    .unwrap_or(false);
                if fatal || consecutive_failures >= MAX_PIECE_FAILURES {
                    break;
                }
            }
        }
    }

    debug!("worker for {} finished", addr);
}

async fn recv_work(work_rx: &Arc<Mutex<mpsc::Receiver<PieceWork>>>) -> Option<PieceWork> {
    work_rx.lock().await.recv().await
}

fn error_kind(error: &anyhow::Error) -> String {
    match error.downcast_ref::<TorrentError>() {
        Some(e) => format!("{}: {}", e.kind(), e),
        None => error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::info::InfoDict;
    use sha1::{Digest, Sha1};

    fn torrent_for(data: &[u8], piece_length: u64) -> Torrent {
        let mut pieces = Vec::new();
        for chunk in data.chunks(piece_length as usize) {
            pieces.extend_from_slice(&Sha1::digest(chunk));
        }

        let mut torrent = Torrent {
            announce_list: vec!["http://tracker.invalid/announce".to_string()],
            info_hash: [9u8; 20],
            piece_hashes: Vec::new(),
            info: InfoDict {
                name: "assembly-test".to_string(),
                piece_length,
                pieces,
                length: data.len() as u64,
                files: Vec::new(),
            },
        };
        torrent.calculate_piece_hashes().unwrap();
        torrent
    }

    /// Results arriving out of order still land at `index · piece_length`.
    #[tokio::test]
    async fn test_assembly_places_pieces_by_index() {
        let data: Vec<u8> = (0..1000u32).flat_map(|i| i.to_be_bytes()).collect();
        let torrent = torrent_for(&data, 1024);
        let piece_count = torrent.piece_count();

        let (result_tx, mut result_rx) = mpsc::channel::<PieceResult>(piece_count);
        for index in (0..piece_count).rev() {
            let start = index * 1024;
            let end = (start + 1024).min(data.len());
            result_tx
                .send(PieceResult { index: index as u32, bytes: data[start..end].to_vec() })
                .await
                .unwrap();
        }
        drop(result_tx);

        let mut buffer = vec![0u8; data.len()];
        let mut completed = 0;
        while let Some(result) = result_rx.recv().await {
            let start = result.index as usize * 1024;
            buffer[start..start + result.bytes.len()].copy_from_slice(&result.bytes);
            completed += 1;
        }

        assert_eq!(completed, piece_count);
        assert_eq!(buffer, data);
    }

    /// A work item re-queued any number of times yields at most one
    /// result: the queue hands it to exactly one worker at a time, and it
    /// leaves the system only by being resolved.
    #[tokio::test]
    async fn test_requeue_yields_single_result() {
        let (work_tx, mut work_rx) = mpsc::channel::<PieceWork>(4);
        let (result_tx, mut result_rx) = mpsc::channel::<PieceResult>(4);

        work_tx
            .send(PieceWork { index: 0, expected_hash: [0u8; 20], size: 4 })
            .await
            .unwrap();

        // A worker whose peer lacks the piece bounces it back three times
        // before a capable worker resolves it.
        for _ in 0..3 {
            let item = work_rx.recv().await.unwrap();
            work_tx.send(item).await.unwrap();
        }

        let item = work_rx.recv().await.unwrap();
        result_tx
            .send(PieceResult { index: item.index, bytes: vec![0u8; item.size] })
            .await
            .unwrap();
        drop(result_tx);
        drop(work_tx);

        let mut results = Vec::new();
        while let Some(result) = result_rx.recv().await {
            results.push(result);
        }
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].index, 0);
        assert!(work_rx.try_recv().is_err());
    }
}
