//! UDP tracker client (BEP 15)
//!
//! Two-step exchange: a connect request that yields a 64-bit connection
//! id, then a 98-byte announce whose response carries the peer list.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use bytes::{Buf, BufMut, BytesMut};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::debug;
use url::Url;

use crate::error::TorrentError;
use crate::tracker::parse_compact_peers;

const PROTOCOL_ID: u64 = 0x0417_2710_1980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const UDP_TIMEOUT: Duration = Duration::from_secs(5);

/// Announce to a UDP tracker and collect the compact peer records.
pub async fn request_peers(
    url: &Url,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    port: u16,
) -> Result<Vec<SocketAddr>> {
    let host = url
        .host_str()
        .ok_or_else(|| TorrentError::decode(format!("tracker URL '{}' has no host", url)))?;
    let tracker_port = url
        .port()
        .ok_or_else(|| TorrentError::decode(format!("tracker URL '{}' has no port", url)))?;

    let addr = tokio::net::lookup_host((host, tracker_port))
        .await
        .map_err(|e| TorrentError::transport(format!("failed to resolve {}: {}", host, e)))?
        .next()
        .ok_or_else(|| TorrentError::transport(format!("no address for {}", host)))?;

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(addr).await?;

    let connection_id = connect_exchange(&socket).await?;
    announce_exchange(&socket, connection_id, info_hash, peer_id, port).await
}

/// 16-byte connect request, 16-byte response carrying the connection id.
async fn connect_exchange(socket: &UdpSocket) -> Result<u64> {
    let transaction_id: u32 = rand::random();

    let mut request = BytesMut::with_capacity(16);
    request.put_u64(PROTOCOL_ID);
    request.put_u32(ACTION_CONNECT);
    request.put_u32(transaction_id);
    socket.send(&request).await?;

    let mut buf = [0u8; 16];
    let n = timeout(UDP_TIMEOUT, socket.recv(&mut buf))
        .await
        .map_err(TorrentError::from)??;
    if n != 16 {
        return Err(TorrentError::protocol(format!(
            "connect response is {} bytes, expected 16",
            n
        ))
        .into());
    }

    let payload = validate_header(&buf, ACTION_CONNECT, transaction_id)?;
    let mut payload = BytesMut::from(payload);
    Ok(payload.get_u64())
}

/// 98-byte announce request; the response carries interval/leecher/seeder
/// counters followed by compact peer records.
async fn announce_exchange(
    socket: &UdpSocket,
    connection_id: u64,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    port: u16,
) -> Result<Vec<SocketAddr>> {
    let transaction_id: u32 = rand::random();

    let mut request = BytesMut::with_capacity(98);
    request.put_u64(connection_id);
    request.put_u32(ACTION_ANNOUNCE);
    request.put_u32(transaction_id);
    request.put_slice(&info_hash);
    request.put_slice(&peer_id);
    request.put_u64(0); // downloaded
    request.put_u64(0); // left
    request.put_u64(0); // uploaded
    request.put_u32(0); // event: none
    request.put_u32(0); // ip: default
    request.put_u32(0); // key
    request.put_i32(-1); // num_want: default
    request.put_u16(port);
    socket.send(&request).await?;

    let mut buf = [0u8; 4096];
    let n = timeout(UDP_TIMEOUT, socket.recv(&mut buf))
        .await
        .map_err(TorrentError::from)??;

    let payload = validate_header(&buf[..n], ACTION_ANNOUNCE, transaction_id)?;
    if payload.len() < 12 {
        return Err(TorrentError::protocol(format!(
            "announce response payload is {} bytes, expected at least 12",
            payload.len()
        ))
        .into());
    }

    let mut counters = BytesMut::from(&payload[..12]);
    let interval = counters.get_u32();
    let leechers = counters.get_u32();
    let seeders = counters.get_u32();
    debug!(
        "udp tracker: interval={}s leechers={} seeders={}",
        interval, leechers, seeders
    );

    parse_compact_peers(&payload[12..])
}

/// Check the 8-byte action + transaction-id header; a mismatch is an
/// explicit protocol error, never silently ignored.
fn validate_header<'a>(
    response: &'a [u8],
    wanted_action: u32,
    wanted_transaction_id: u32,
) -> Result<&'a [u8]> {
    if response.len() < 8 {
        return Err(TorrentError::protocol("udp tracker response too short").into());
    }

    let action = u32::from_be_bytes([response[0], response[1], response[2], response[3]]);
    let transaction_id = u32::from_be_bytes([response[4], response[5], response[6], response[7]]);

    if action != wanted_action {
        return Err(TorrentError::protocol(format!(
            "unexpected action {} in udp tracker response, wanted {}",
            action, wanted_action
        ))
        .into());
    }
    if transaction_id != wanted_transaction_id {
        return Err(TorrentError::protocol("transaction id mismatch in udp tracker response").into());
    }

    Ok(&response[8..])
}
