//! Wire transport
//!
//! Reads and writes handshakes and length-prefixed frames over any async
//! byte stream. Keeping the transport generic lets the session and piece
//! engine run against in-memory streams in tests.

use anyhow::Result;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::peer::handshake::{Handshake, HANDSHAKE_LEN, PROTOCOL_LENGTH};
use crate::peer::message::Message;
use crate::error::TorrentError;

/// Framing operations over an async stream
pub trait WireProtocol {
    /// Read one complete message
    async fn read_message<R: AsyncReadExt + Unpin>(&mut self, reader: &mut R) -> Result<Message>;

    /// Write one message
    async fn write_message<W: AsyncWriteExt + Unpin>(
        &mut self,
        writer: &mut W,
        message: &Message,
    ) -> Result<()>;

    /// Read the 68-byte handshake
    async fn read_handshake<R: AsyncReadExt + Unpin>(&mut self, reader: &mut R)
        -> Result<Handshake>;

    /// Write the 68-byte handshake
    async fn write_handshake<W: AsyncWriteExt + Unpin>(
        &mut self,
        writer: &mut W,
        handshake: &Handshake,
    ) -> Result<()>;
}

/// The standard BitTorrent framing
pub struct BitTorrentWire;

impl WireProtocol for BitTorrentWire {
    async fn read_message<R: AsyncReadExt + Unpin>(&mut self, reader: &mut R) -> Result<Message> {
        let mut length_buf = [0u8; 4];
        reader.read_exact(&mut length_buf).await?;
        let length = u32::from_be_bytes(length_buf) as usize;

        if length == 0 {
            return Ok(Message::KeepAlive);
        }

        let mut payload = vec![0u8; length];
        reader.read_exact(&mut payload).await?;

        let mut frame = BytesMut::with_capacity(4 + length);
        frame.put_slice(&length_buf);
        frame.put_slice(&payload);
        Message::deserialize(&frame)
    }

    async fn write_message<W: AsyncWriteExt + Unpin>(
        &mut self,
        writer: &mut W,
        message: &Message,
    ) -> Result<()> {
        writer.write_all(&message.serialize()).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn read_handshake<R: AsyncReadExt + Unpin>(
        &mut self,
        reader: &mut R,
    ) -> Result<Handshake> {
        let mut pstrlen = [0u8; 1];
        reader.read_exact(&mut pstrlen).await?;
        if pstrlen[0] != PROTOCOL_LENGTH {
            return Err(TorrentError::protocol(format!(
                "unexpected protocol string length {}",
                pstrlen[0]
            ))
            .into());
        }

        let mut rest = [0u8; HANDSHAKE_LEN - 1];
        reader.read_exact(&mut rest).await?;

        let mut frame = BytesMut::with_capacity(HANDSHAKE_LEN);
        frame.put_u8(pstrlen[0]);
        frame.put_slice(&rest);
        Handshake::deserialize(&frame)
    }

    async fn write_handshake<W: AsyncWriteExt + Unpin>(
        &mut self,
        writer: &mut W,
        handshake: &Handshake,
    ) -> Result<()> {
        writer.write_all(&handshake.serialize()).await?;
        writer.flush().await?;
        Ok(())
    }
}
