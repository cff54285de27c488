//! BitTorrent handshake
//!
//! The 68-byte exchange that opens every peer connection, including the
//! reserved bits advertising extension-protocol and DHT support.

use anyhow::Result;
use bytes::{BufMut, BytesMut};
use tracing::trace;

use crate::error::TorrentError;

/// BitTorrent protocol identifier string
pub const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// Length of the protocol string
pub const PROTOCOL_LENGTH: u8 = 19;

/// Total handshake size in bytes
pub const HANDSHAKE_LEN: usize = 68;

// Reserved byte 5, bit 0x10: extension protocol (BEP 10).
const EXTENSION_BYTE: usize = 5;
const EXTENSION_BIT: u8 = 0x10;

// Reserved byte 7, bit 0x01: DHT (BEP 5).
const DHT_BYTE: usize = 7;
const DHT_BIT: u8 = 0x01;

/// The 68-byte BitTorrent handshake
#[derive(Debug, Clone)]
pub struct Handshake {
    /// Reserved bits
    pub reserved: [u8; 8],
    /// Torrent info hash
    pub info_hash: [u8; 20],
    /// Peer ID
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Create a handshake advertising extension-protocol and DHT support.
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        let mut reserved = [0u8; 8];
        reserved[EXTENSION_BYTE] |= EXTENSION_BIT;
        reserved[DHT_BYTE] |= DHT_BIT;
        Self { reserved, info_hash, peer_id }
    }

    /// Generate a random 20-byte peer ID with an "-SW" client prefix.
    pub fn generate_peer_id() -> [u8; 20] {
        let mut peer_id = [0u8; 20];
        peer_id[0..8].copy_from_slice(b"-SW0010-");
        peer_id[8..].copy_from_slice(&rand::random::<[u8; 12]>());
        peer_id
    }

    /// Serialize the handshake to its 68-byte wire form.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL_LENGTH);
        buf.put_slice(PROTOCOL_STRING.as_bytes());
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        buf.to_vec()
    }

    /// Deserialize a handshake from 68 bytes.
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        trace!("deserializing handshake from {} bytes", data.len());

        if data.len() < HANDSHAKE_LEN {
            return Err(TorrentError::protocol(format!(
                "handshake too short: expected {} bytes, got {}",
                HANDSHAKE_LEN,
                data.len()
            ))
            .into());
        }

        if data[0] != PROTOCOL_LENGTH || &data[1..20] != PROTOCOL_STRING.as_bytes() {
            return Err(TorrentError::protocol("invalid protocol string").into());
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        Ok(Self { reserved, info_hash, peer_id })
    }

    /// Check the remote's info-hash against ours. A mismatch is fatal for
    /// the session.
    pub fn validate(&self, expected_info_hash: &[u8; 20]) -> bool {
        self.info_hash == *expected_info_hash
    }

    /// Whether the remote set the BEP 10 extension-protocol bit
    pub fn supports_extension(&self) -> bool {
        self.reserved[EXTENSION_BYTE] & EXTENSION_BIT != 0
    }

    /// Whether the remote set the DHT bit
    pub fn supports_dht(&self) -> bool {
        self.reserved[DHT_BYTE] & DHT_BIT != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_layout() {
        let handshake = Handshake::new([1u8; 20], [2u8; 20]);
        let bytes = handshake.serialize();

        assert_eq!(bytes.len(), 68);
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], b"BitTorrent protocol");
        assert_eq!(bytes[25] & 0x10, 0x10);
        assert_eq!(bytes[27] & 0x01, 0x01);
        assert_eq!(&bytes[28..48], &[1u8; 20]);
        assert_eq!(&bytes[48..68], &[2u8; 20]);
    }

    #[test]
    fn test_serialize_deserialize() {
        let handshake = Handshake::new([1u8; 20], [2u8; 20]);
        let parsed = Handshake::deserialize(&handshake.serialize()).unwrap();

        assert_eq!(parsed.reserved, handshake.reserved);
        assert_eq!(parsed.info_hash, handshake.info_hash);
        assert_eq!(parsed.peer_id, handshake.peer_id);
        assert!(parsed.supports_extension());
        assert!(parsed.supports_dht());
    }

    #[test]
    fn test_validate() {
        let handshake = Handshake::new([1u8; 20], [2u8; 20]);
        assert!(handshake.validate(&[1u8; 20]));
        assert!(!handshake.validate(&[3u8; 20]));
    }

    #[test]
    fn test_reject_wrong_protocol_string() {
        let mut bytes = Handshake::new([1u8; 20], [2u8; 20]).serialize();
        bytes[3] = b'X';
        assert!(Handshake::deserialize(&bytes).is_err());
    }

    #[test]
    fn test_reject_short_input() {
        assert!(Handshake::deserialize(&[19u8; 40]).is_err());
    }

    #[test]
    fn test_reserved_bits_absent() {
        let mut bytes = Handshake::new([1u8; 20], [2u8; 20]).serialize();
        bytes[25] = 0;
        bytes[27] = 0;
        let parsed = Handshake::deserialize(&bytes).unwrap();
        assert!(!parsed.supports_extension());
        assert!(!parsed.supports_dht());
    }

    #[test]
    fn test_generate_peer_id() {
        let peer_id = Handshake::generate_peer_id();
        assert_eq!(&peer_id[0..3], b"-SW");
        assert_ne!(peer_id, Handshake::generate_peer_id());
    }
}
