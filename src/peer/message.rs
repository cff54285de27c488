//! Peer wire messages
//!
//! Length-prefixed message framing: `[u32 length][u8 id][payload]`, with
//! length 0 meaning keep-alive.

use anyhow::Result;
use bytes::{Buf, BufMut, BytesMut};

use crate::error::TorrentError;

/// Message ids as assigned by BEP 3 (plus Port from BEP 5 and Extension
/// from BEP 10)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
    Extension = 20,
}

impl TryFrom<u8> for MessageId {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            9 => Ok(MessageId::Port),
            20 => Ok(MessageId::Extension),
            other => {
                Err(TorrentError::protocol(format!("unexpected message id {}", other)).into())
            }
        }
    }
}

/// A peer wire message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { index: u32 },
    Bitfield { payload: Vec<u8> },
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    Port { port: u16 },
    Extension { ext_id: u8, payload: Vec<u8> },
}

impl Message {
    /// Message id; `None` for keep-alive
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield { .. } => Some(MessageId::Bitfield),
            Message::Request { .. } => Some(MessageId::Request),
            Message::Piece { .. } => Some(MessageId::Piece),
            Message::Cancel { .. } => Some(MessageId::Cancel),
            Message::Port { .. } => Some(MessageId::Port),
            Message::Extension { .. } => Some(MessageId::Extension),
        }
    }

    /// Body length in bytes, excluding the 4-byte length prefix
    pub fn length(&self) -> u32 {
        match self {
            Message::KeepAlive => 0,
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => 1,
            Message::Have { .. } => 5,
            Message::Bitfield { payload } => 1 + payload.len() as u32,
            Message::Request { .. } | Message::Cancel { .. } => 13,
            Message::Piece { block, .. } => 9 + block.len() as u32,
            Message::Port { .. } => 3,
            Message::Extension { payload, .. } => 2 + payload.len() as u32,
        }
    }

    /// Serialize to wire form, length prefix included
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(4 + self.length() as usize);
        buf.put_u32(self.length());

        if let Some(id) = self.message_id() {
            buf.put_u8(id as u8);
        }

        match self {
            Message::Have { index } => buf.put_u32(*index),
            Message::Bitfield { payload } => buf.put_slice(payload),
            Message::Request { index, begin, length }
            | Message::Cancel { index, begin, length } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece { index, begin, block } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(block);
            }
            Message::Port { port } => buf.put_u16(*port),
            Message::Extension { ext_id, payload } => {
                buf.put_u8(*ext_id);
                buf.put_slice(payload);
            }
            _ => {}
        }

        buf.to_vec()
    }

    /// Deserialize from wire form, length prefix included
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut buf = BytesMut::from(data);

        if buf.remaining() < 4 {
            return Err(TorrentError::protocol("message missing length prefix").into());
        }
        let length = buf.get_u32() as usize;

        if length == 0 {
            return Ok(Message::KeepAlive);
        }
        if buf.remaining() < length {
            return Err(TorrentError::protocol(format!(
                "message body truncated: expected {} bytes, got {}",
                length,
                buf.remaining()
            ))
            .into());
        }

        let id = MessageId::try_from(buf.get_u8())?;
        match id {
            MessageId::Choke => Ok(Message::Choke),
            MessageId::Unchoke => Ok(Message::Unchoke),
            MessageId::Interested => Ok(Message::Interested),
            MessageId::NotInterested => Ok(Message::NotInterested),
            MessageId::Have => {
                Self::need(&buf, 4, "Have")?;
                Ok(Message::Have { index: buf.get_u32() })
            }
            MessageId::Bitfield => Ok(Message::Bitfield { payload: buf.to_vec() }),
            MessageId::Request => {
                Self::need(&buf, 12, "Request")?;
                Ok(Message::Request {
                    index: buf.get_u32(),
                    begin: buf.get_u32(),
                    length: buf.get_u32(),
                })
            }
            MessageId::Piece => {
                Self::need(&buf, 8, "Piece")?;
                Ok(Message::Piece {
                    index: buf.get_u32(),
                    begin: buf.get_u32(),
                    block: buf.to_vec(),
                })
            }
            MessageId::Cancel => {
                Self::need(&buf, 12, "Cancel")?;
                Ok(Message::Cancel {
                    index: buf.get_u32(),
                    begin: buf.get_u32(),
                    length: buf.get_u32(),
                })
            }
            MessageId::Port => {
                Self::need(&buf, 2, "Port")?;
                Ok(Message::Port { port: buf.get_u16() })
            }
            MessageId::Extension => {
                Self::need(&buf, 1, "Extension")?;
                Ok(Message::Extension {
                    ext_id: buf.get_u8(),
                    payload: buf.to_vec(),
                })
            }
        }
    }

    fn need(buf: &BytesMut, bytes: usize, what: &str) -> Result<()> {
        if buf.remaining() < bytes {
            return Err(TorrentError::protocol(format!(
                "{} message too short: expected {} bytes, got {}",
                what,
                bytes,
                buf.remaining()
            ))
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(message: Message) -> Message {
        Message::deserialize(&message.serialize()).unwrap()
    }

    #[test]
    fn test_keepalive_is_four_zero_bytes() {
        assert_eq!(Message::KeepAlive.serialize(), vec![0, 0, 0, 0]);
        assert_eq!(roundtrip(Message::KeepAlive), Message::KeepAlive);
    }

    #[test]
    fn test_state_messages() {
        for message in [
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
        ] {
            assert_eq!(roundtrip(message.clone()), message);
        }
    }

    #[test]
    fn test_have() {
        assert_eq!(roundtrip(Message::Have { index: 42 }), Message::Have { index: 42 });
    }

    #[test]
    fn test_request_wire_layout() {
        let bytes = Message::Request { index: 1, begin: 16384, length: 16384 }.serialize();
        assert_eq!(bytes.len(), 17);
        assert_eq!(&bytes[0..4], &[0, 0, 0, 13]);
        assert_eq!(bytes[4], 6);
        assert_eq!(&bytes[5..9], &[0, 0, 0, 1]);
        assert_eq!(&bytes[9..13], &[0, 0, 0x40, 0]);
        assert_eq!(&bytes[13..17], &[0, 0, 0x40, 0]);
    }

    #[test]
    fn test_piece_roundtrip() {
        let message = Message::Piece { index: 3, begin: 16384, block: vec![7u8; 64] };
        assert_eq!(roundtrip(message.clone()), message);
    }

    #[test]
    fn test_bitfield_roundtrip() {
        let message = Message::Bitfield { payload: vec![0b1010_0000, 0b0000_0001] };
        assert_eq!(roundtrip(message.clone()), message);
    }

    #[test]
    fn test_port_roundtrip() {
        assert_eq!(roundtrip(Message::Port { port: 6881 }), Message::Port { port: 6881 });
    }

    #[test]
    fn test_extension_roundtrip() {
        let message = Message::Extension { ext_id: 3, payload: b"d8:msg_typei0ee".to_vec() };
        assert_eq!(roundtrip(message.clone()), message);
    }

    #[test]
    fn test_reject_unknown_id() {
        assert!(Message::deserialize(&[0, 0, 0, 1, 99]).is_err());
        assert!(MessageId::try_from(10).is_err());
    }

    #[test]
    fn test_reject_truncated_payload() {
        // Have with only two payload bytes
        assert!(Message::deserialize(&[0, 0, 0, 5, 4, 0, 0]).is_err());
    }

    #[test]
    fn test_message_lengths() {
        assert_eq!(Message::KeepAlive.length(), 0);
        assert_eq!(Message::Choke.length(), 1);
        assert_eq!(Message::Have { index: 0 }.length(), 5);
        assert_eq!(Message::Request { index: 0, begin: 0, length: 0 }.length(), 13);
        assert_eq!(Message::Piece { index: 0, begin: 0, block: vec![0; 3] }.length(), 12);
        assert_eq!(Message::Port { port: 0 }.length(), 3);
        assert_eq!(Message::Extension { ext_id: 0, payload: vec![0; 4] }.length(), 6);
    }
}
