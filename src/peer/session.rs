//! Peer session
//!
//! One alive connection to a remote peer: TCP connect, handshake, initial
//! message intake, per-message state tracking, and the BEP 9/10 metadata
//! exchange used for magnet sources.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tracing::{debug, trace, warn};

use crate::bencode::{self, Value};
use crate::error::TorrentError;
use crate::peer::bitfield::Bitfield;
use crate::peer::handshake::Handshake;
use crate::peer::message::Message;
use crate::peer::wire::{BitTorrentWire, WireProtocol};

/// TCP dial deadline
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline over handshake I/O and initial message intake
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for each read while waiting on extension traffic
const EXTENSION_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Messages to tolerate before giving up on an expected frame
const MAX_SKIPPED_MESSAGES: usize = 50;

/// The extension message id we assign to ut_metadata in our handshake
const LOCAL_METADATA_ID: u8 = 1;

const MSG_TYPE_DATA: i64 = 1;
const MSG_TYPE_REJECT: i64 = 2;

/// Peer's ut_metadata parameters from the BEP 10 extended handshake
#[derive(Debug, Clone, Copy)]
pub struct MetadataExt {
    /// Extension message id the peer assigned to metadata requests
    pub message_id: u8,
    /// Total metadata size in bytes
    pub metadata_size: usize,
}

/// One alive connection to a remote peer
pub struct PeerSession<S = TcpStream> {
    stream: S,
    wire: BitTorrentWire,
    /// Remote address
    pub addr: SocketAddr,
    /// Pieces the peer claims to have
    pub bitfield: Bitfield,
    /// Whether the peer currently chokes us; starts true
    pub am_choked: bool,
    /// Both sides set the BEP 10 extension bit
    pub supports_extension: bool,
    /// The peer set the DHT reserved bit
    pub supports_dht: bool,
    /// UDP port from the peer's Port message, if any
    pub dht_port: Option<u16>,
    /// Populated once the peer's extended handshake arrives
    pub metadata_ext: Option<MetadataExt>,
    piece_count: usize,
}

impl PeerSession<TcpStream> {
    /// Dial a peer and complete the handshake.
    ///
    /// The dial and the handshake I/O (including initial message intake up
    /// to the peer's bitfield) are each bounded by 5 seconds.
    pub async fn connect(
        addr: SocketAddr,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        piece_count: usize,
    ) -> Result<Self> {
        let stream = timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| TorrentError::transport(format!("dial timeout for {}", addr)))?
            .map_err(|e| TorrentError::transport(format!("failed to connect to {}: {}", addr, e)))?;

        let mut session = PeerSession::new(stream, addr, piece_count);
        timeout(HANDSHAKE_TIMEOUT, session.establish(info_hash, peer_id))
            .await
            .map_err(|_| TorrentError::transport(format!("handshake timeout for {}", addr)))??;

        // Bitfield receipt is optional; a peer that stays quiet after the
        // handshake is kept and learned about through Have messages.
        match timeout(HANDSHAKE_TIMEOUT, session.read_initial_messages()).await {
            Ok(result) => result?,
            Err(_) => trace!("no initial messages from {}", addr),
        }

        debug!(
            "session established with {} ({} pieces advertised)",
            addr,
            session.bitfield.count()
        );
        Ok(session)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> PeerSession<S> {
    /// Wrap an already-connected stream. Used directly by tests; the
    /// downloader goes through [`PeerSession::connect`].
    pub fn new(stream: S, addr: SocketAddr, piece_count: usize) -> Self {
        Self {
            stream,
            wire: BitTorrentWire,
            addr,
            bitfield: Bitfield::new(piece_count),
            am_choked: true,
            supports_extension: false,
            supports_dht: false,
            dht_port: None,
            metadata_ext: None,
            piece_count,
        }
    }

    /// Exchange handshakes and consume initial messages up to the bitfield.
    async fn establish(&mut self, info_hash: [u8; 20], peer_id: [u8; 20]) -> Result<()> {
        let ours = Handshake::new(info_hash, peer_id);
        self.wire.write_handshake(&mut self.stream, &ours).await?;

        let theirs = self.wire.read_handshake(&mut self.stream).await?;
        if !theirs.validate(&info_hash) {
            return Err(TorrentError::protocol(format!(
                "info hash mismatch from {}",
                self.addr
            ))
            .into());
        }

        self.supports_extension = theirs.supports_extension();
        self.supports_dht = theirs.supports_dht();

        if self.supports_extension {
            self.send_extended_handshake().await?;
        }

        Ok(())
    }

    /// Consume the messages peers send right after the handshake. Most
    /// lead with their bitfield; Port and the extended handshake may come
    /// first, in any order.
    async fn read_initial_messages(&mut self) -> Result<()> {
        for _ in 0..MAX_SKIPPED_MESSAGES {
            let message = self.receive_message().await?;
            let was_bitfield = matches!(message, Message::Bitfield { .. });
            self.handle_message(message)?;
            if was_bitfield {
                break;
            }
        }
        Ok(())
    }

    /// Apply a message to session state.
    ///
    /// `Piece` frames are not consumed here; the piece engine owns those.
    pub fn handle_message(&mut self, message: Message) -> Result<()> {
        match message {
            Message::Choke => self.am_choked = true,
            Message::Unchoke => self.am_choked = false,
            Message::Bitfield { payload } => {
                self.bitfield = Bitfield::from_payload(payload, self.piece_count)?;
            }
            Message::Have { index } => self.bitfield.set(index),
            Message::Port { port } => self.dht_port = Some(port),
            Message::Extension { ext_id: 0, payload } => {
                self.parse_extended_handshake(&payload)?;
            }
            other => trace!("ignoring {:?} from {}", other.message_id(), self.addr),
        }
        Ok(())
    }

    /// Whether the peer advertises piece `index`
    pub fn has_piece(&self, index: u32) -> bool {
        self.bitfield.has(index)
    }

    pub async fn receive_message(&mut self) -> Result<Message> {
        self.wire.read_message(&mut self.stream).await
    }

    pub async fn send_message(&mut self, message: &Message) -> Result<()> {
        self.wire.write_message(&mut self.stream, message).await
    }

    pub async fn send_interested(&mut self) -> Result<()> {
        self.send_message(&Message::Interested).await
    }

    pub async fn send_unchoke(&mut self) -> Result<()> {
        self.send_message(&Message::Unchoke).await
    }

    pub async fn send_have(&mut self, index: u32) -> Result<()> {
        self.send_message(&Message::Have { index }).await
    }

    pub async fn send_request(&mut self, index: u32, begin: u32, length: u32) -> Result<()> {
        self.send_message(&Message::Request { index, begin, length }).await
    }

    /// Send our BEP 10 extended handshake advertising ut_metadata.
    async fn send_extended_handshake(&mut self) -> Result<()> {
        let mut m = BTreeMap::new();
        m.insert(b"ut_metadata".to_vec(), Value::Int(LOCAL_METADATA_ID as i64));
        let mut dict = BTreeMap::new();
        dict.insert(b"m".to_vec(), Value::Dict(m));

        let payload = bencode::encode(&Value::Dict(dict));
        self.send_message(&Message::Extension { ext_id: 0, payload }).await
    }

    /// Extract `m.metadata` (falling back to `m.ut_metadata`) and
    /// `metadata_size` from the peer's extended handshake.
    fn parse_extended_handshake(&mut self, payload: &[u8]) -> Result<()> {
        let (value, _) = bencode::decode(payload)?;

        let m = value.get(b"m");
        let message_id = m
            .and_then(|m| m.get(b"metadata").or_else(|| m.get(b"ut_metadata")))
            .and_then(Value::as_int)
            .unwrap_or(0);
        let metadata_size = value
            .get(b"metadata_size")
            .and_then(Value::as_int)
            .unwrap_or(0);

        self.metadata_ext = Some(MetadataExt {
            message_id: message_id as u8,
            metadata_size: metadata_size.max(0) as usize,
        });
        debug!(
            "extended handshake from {}: metadata id {}, size {}",
            self.addr, message_id, metadata_size
        );
        Ok(())
    }

    /// Read messages until the peer's extended handshake arrives.
    async fn await_extended_handshake(&mut self) -> Result<()> {
        for _ in 0..MAX_SKIPPED_MESSAGES {
            let message = timeout(EXTENSION_READ_TIMEOUT, self.receive_message())
                .await
                .map_err(TorrentError::from)??;
            self.handle_message(message)?;
            if self.metadata_ext.is_some() {
                return Ok(());
            }
        }

        Err(TorrentError::metadata_unavailable(format!(
            "peer {} never sent the extension handshake",
            self.addr
        ))
        .into())
    }

    /// Fetch the torrent metadata via BEP 9, 16 KiB pieces at a time.
    ///
    /// Returns the raw metadata blob, which is the bencoded info
    /// dictionary.
    pub async fn request_metadata(&mut self) -> Result<Vec<u8>> {
        if !self.supports_extension {
            return Err(TorrentError::metadata_unavailable(format!(
                "peer {} does not support the extension protocol",
                self.addr
            ))
            .into());
        }

        if self.metadata_ext.is_none() {
            self.await_extended_handshake().await?;
        }
        let ext = match self.metadata_ext {
            Some(ext) if ext.message_id != 0 && ext.metadata_size != 0 => ext,
            _ => {
                return Err(TorrentError::metadata_unavailable(format!(
                    "peer {} does not advertise metadata exchange",
                    self.addr
                ))
                .into())
            }
        };

        let mut metadata: Vec<u8> = Vec::with_capacity(ext.metadata_size);
        let mut piece: i64 = 0;

        while metadata.len() < ext.metadata_size {
            let request = metadata_request(piece);
            self.send_message(&Message::Extension {
                ext_id: ext.message_id,
                payload: request,
            })
            .await?;

            let payload = self.read_extension_payload().await?;
            let (header, consumed) = bencode::decode(&payload)?;
            let msg_type = header
                .get(b"msg_type")
                .and_then(Value::as_int)
                .ok_or_else(|| TorrentError::protocol("metadata response missing msg_type"))?;

            match msg_type {
                MSG_TYPE_DATA => {
                    let block = &payload[consumed..];
                    if block.is_empty() {
                        return Err(TorrentError::protocol(
                            "metadata data message carried no bytes",
                        )
                        .into());
                    }
                    metadata.extend_from_slice(block);
                }
                MSG_TYPE_REJECT => {
                    return Err(TorrentError::metadata_unavailable(format!(
                        "peer {} rejected the metadata request",
                        self.addr
                    ))
                    .into())
                }
                other => {
                    return Err(TorrentError::protocol(format!(
                        "unexpected metadata msg_type {}",
                        other
                    ))
                    .into())
                }
            }

            piece += 1;
        }

        metadata.truncate(ext.metadata_size);
        debug!("fetched {} bytes of metadata from {}", metadata.len(), self.addr);
        Ok(metadata)
    }

    /// Read until an extension frame (other than the handshake) arrives,
    /// applying everything else to session state.
    async fn read_extension_payload(&mut self) -> Result<Vec<u8>> {
        for _ in 0..MAX_SKIPPED_MESSAGES {
            let message = timeout(EXTENSION_READ_TIMEOUT, self.receive_message())
                .await
                .map_err(TorrentError::from)??;
            match message {
                Message::Extension { ext_id, payload } if ext_id != 0 => return Ok(payload),
                other => self.handle_message(other)?,
            }
        }

        warn!("no extension response from {}", self.addr);
        Err(TorrentError::protocol("expected an extension message in response").into())
    }
}

/// Bencoded BEP 9 request dictionary `{"msg_type": 0, "piece": n}`
fn metadata_request(piece: i64) -> Vec<u8> {
    let mut dict = BTreeMap::new();
    dict.insert(b"msg_type".to_vec(), Value::Int(0));
    dict.insert(b"piece".to_vec(), Value::Int(piece));
    bencode::encode(&Value::Dict(dict))
}
