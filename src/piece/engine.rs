//! Per-session piece downloads
//!
//! Requests a piece in 16 KiB blocks with a bounded request pipeline,
//! verifies the SHA-1, and announces the piece back to the peer.

use anyhow::Result;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{timeout, Duration};
use tracing::{debug, trace};

use crate::error::TorrentError;
use crate::peer::message::Message;
use crate::peer::session::PeerSession;

/// Block size requested from peers. Matches the block size negotiated by
/// virtually all BitTorrent peers.
pub const MAX_BLOCK_SIZE: usize = 16384;

/// Maximum number of in-flight block requests per piece
pub const MAX_PIPELINE_REQUESTS: usize = 5;

/// Deadline for one whole piece attempt
const PIECE_DEADLINE: Duration = Duration::from_secs(15);

/// One piece to be downloaded. Created once, enqueued, and re-enqueued on
/// failure until a result for its index exists.
#[derive(Debug, Clone)]
pub struct PieceWork {
    pub index: u32,
    pub expected_hash: [u8; 20],
    pub size: usize,
}

/// A downloaded and hash-verified piece
#[derive(Debug, Clone)]
pub struct PieceResult {
    pub index: u32,
    pub bytes: Vec<u8>,
}

/// Per-attempt scratch state
struct PieceProgress {
    buffer: Vec<u8>,
    downloaded: usize,
    requested: usize,
    backlog: usize,
}

/// Download one piece from the peer.
///
/// Fails fast if the peer's bitfield lacks the piece. The whole attempt is
/// bounded by a 15-second deadline; the caller re-queues the work item on
/// any failure.
pub async fn try_download_piece<S>(
    session: &mut PeerSession<S>,
    work: &PieceWork,
) -> Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if !session.has_piece(work.index) {
        return Err(anyhow::anyhow!(
            "peer {} lacks piece {}",
            session.addr,
            work.index
        ));
    }

    trace!("requesting piece {} from {}", work.index, session.addr);
    session.send_interested().await?;

    // Courtesy unchoke toward the peer; our own choke state only clears
    // when the peer unchokes us.
    if session.am_choked {
        session.send_unchoke().await?;
    }

    let mut progress = PieceProgress {
        buffer: vec![0u8; work.size],
        downloaded: 0,
        requested: 0,
        backlog: 0,
    };

    timeout(PIECE_DEADLINE, download_loop(session, work, &mut progress))
        .await
        .map_err(|_| {
            TorrentError::transport(format!(
                "piece {} timed out against {}",
                work.index, session.addr
            ))
        })??;

    let digest: [u8; 20] = Sha1::digest(&progress.buffer).into();
    if digest != work.expected_hash {
        return Err(TorrentError::hash_mismatch(work.index).into());
    }

    // Best-effort: the piece is already verified either way.
    if let Err(e) = session.send_have(work.index).await {
        trace!("could not send Have({}) to {}: {}", work.index, session.addr, e);
    }

    debug!("piece {} downloaded from {}", work.index, session.addr);
    Ok(progress.buffer)
}

async fn download_loop<S>(
    session: &mut PeerSession<S>,
    work: &PieceWork,
    progress: &mut PieceProgress,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while progress.downloaded < work.size {
        // Keep the pipeline full while the peer lets us request.
        while !session.am_choked
            && progress.backlog < MAX_PIPELINE_REQUESTS
            && progress.requested < work.size
        {
            let length = MAX_BLOCK_SIZE.min(work.size - progress.requested);
            session
                .send_request(work.index, progress.requested as u32, length as u32)
                .await?;
            progress.requested += length;
            progress.backlog += 1;
        }

        let message = session.receive_message().await?;
        match message {
            Message::Piece { index, begin, block } => {
                if index != work.index {
                    // Stale reply from a previous attempt against this peer.
                    trace!(
                        "dropping block for piece {} while downloading {}",
                        index,
                        work.index
                    );
                    continue;
                }

                let begin = begin as usize;
                let end = begin
                    .checked_add(block.len())
                    .filter(|&e| e <= work.size)
                    .ok_or_else(|| {
                        TorrentError::protocol(format!(
                            "block [{}, +{}] exceeds piece size {}",
                            begin,
                            block.len(),
                            work.size
                        ))
                    })?;

                progress.buffer[begin..end].copy_from_slice(&block);
                progress.downloaded += block.len();
                progress.backlog = progress.backlog.saturating_sub(1);
            }
            other => session.handle_message(other)?,
        }
    }

    Ok(())
}
