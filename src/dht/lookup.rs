//! Iterative Kademlia peer lookup
//!
//! Starting from bootstrap nodes learned from connected peers, repeatedly
//! queries the closest unqueried nodes with `get_peers` until enough peers
//! are found or the candidate space is exhausted.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::dht::krpc::{self, KrpcResponse};
use crate::dht::node::{parse_compact_nodes, sort_by_distance, DhtNode, NodeId};
use crate::error::TorrentError;
use crate::tracker::parse_compact_peers;

/// Parallelism of each lookup round
const ALPHA: usize = 3;

/// Shortlist cap, keeping the candidate set from growing without bound
const MAX_SHORTLIST: usize = 100;

/// Lookup stops once this many peers are found
const ENOUGH_PEERS: usize = 50;

/// Per-RPC response deadline
const RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Find peers for `info_hash` via the DHT.
///
/// `bootstrap` addresses come from connected peers that advertised DHT
/// support. Individual node failures are non-fatal; an empty result is
/// simply an empty supplement.
pub async fn discover_peers(
    bootstrap: &[SocketAddr],
    info_hash: [u8; 20],
) -> Result<Vec<SocketAddr>> {
    let self_id = NodeId::random();

    let mut shortlist = seed_shortlist(bootstrap, &self_id, &info_hash).await;
    if shortlist.is_empty() {
        return Err(TorrentError::transport("no reachable DHT bootstrap node").into());
    }
    sort_by_distance(&mut shortlist, &info_hash);

    let mut queried: HashSet<NodeId> = HashSet::new();
    let mut found: Vec<SocketAddr> = Vec::new();

    loop {
        let batch: Vec<DhtNode> = shortlist
            .iter()
            .filter(|n| !queried.contains(&n.id))
            .take(ALPHA)
            .cloned()
            .collect();

        if batch.is_empty() || found.len() >= ENOUGH_PEERS {
            break;
        }

        let mut queries = JoinSet::new();
        for node in batch {
            queried.insert(node.id);
            queries.spawn(async move {
                let result = query_get_peers(node.addr, self_id, info_hash).await;
                (node.addr, result)
            });
        }

        while let Some(joined) = queries.join_next().await {
            let Ok((addr, result)) = joined else { continue };
            let response = match result {
                Ok(response) => response,
                Err(e) => {
                    trace!("get_peers to {} failed: {}", addr, e);
                    continue;
                }
            };

            match parse_compact_nodes(&response.nodes) {
                Ok(nodes) => merge_nodes(&mut shortlist, nodes),
                Err(e) => trace!("bad node list from {}: {}", addr, e),
            }

            for compact in &response.values {
                match parse_compact_peers(compact) {
                    Ok(peers) => found.extend(peers),
                    Err(e) => trace!("bad peer entry from {}: {}", addr, e),
                }
            }
        }

        sort_by_distance(&mut shortlist, &info_hash);
        shortlist.truncate(MAX_SHORTLIST);
    }

    debug!("dht lookup found {} peers", found.len());
    Ok(found)
}

/// Learn each bootstrap node's id with `ping` and widen the initial
/// shortlist with its `find_node` neighbours.
async fn seed_shortlist(
    bootstrap: &[SocketAddr],
    self_id: &NodeId,
    info_hash: &[u8; 20],
) -> Vec<DhtNode> {
    let mut shortlist = Vec::new();

    for &addr in bootstrap {
        match ping_node(addr, self_id).await {
            Ok(id) => shortlist.push(DhtNode { id, addr }),
            Err(e) => {
                warn!("dht bootstrap node {} unreachable: {}", addr, e);
                continue;
            }
        }

        match query_find_node(addr, self_id, info_hash).await {
            Ok(nodes) => merge_nodes(&mut shortlist, nodes),
            Err(e) => trace!("find_node to {} failed: {}", addr, e),
        }
    }

    shortlist
}

/// Append nodes not already present, deduplicating by id.
fn merge_nodes(shortlist: &mut Vec<DhtNode>, incoming: Vec<DhtNode>) {
    for node in incoming {
        if !shortlist.iter().any(|n| n.id == node.id) {
            shortlist.push(node);
        }
    }
}

async fn ping_node(addr: SocketAddr, self_id: &NodeId) -> Result<NodeId> {
    let response = exchange(addr, krpc::ping_query(self_id)).await?;
    NodeId::from_slice(&response.id)
}

async fn query_find_node(
    addr: SocketAddr,
    self_id: &NodeId,
    target: &[u8; 20],
) -> Result<Vec<DhtNode>> {
    let response = exchange(addr, krpc::find_node_query(self_id, target)).await?;
    parse_compact_nodes(&response.nodes)
}

async fn query_get_peers(
    addr: SocketAddr,
    self_id: NodeId,
    info_hash: [u8; 20],
) -> Result<KrpcResponse> {
    exchange(addr, krpc::get_peers_query(&self_id, &info_hash)).await
}

/// One request/response round trip over a fresh UDP socket.
async fn exchange(addr: SocketAddr, query: Vec<u8>) -> Result<KrpcResponse> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(addr).await?;
    socket.send(&query).await?;

    let mut buf = [0u8; 4096];
    let n = timeout(RPC_TIMEOUT, socket.recv(&mut buf))
        .await
        .map_err(TorrentError::from)??;

    krpc::parse_response(&buf[..n])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::{self, Value};
    use std::collections::BTreeMap;

    fn krpc_reply(entries: Vec<(Vec<u8>, Value)>) -> Vec<u8> {
        let mut r = BTreeMap::new();
        for (k, v) in entries {
            r.insert(k, v);
        }
        let mut dict = BTreeMap::new();
        dict.insert(b"r".to_vec(), Value::Dict(r));
        dict.insert(b"t".to_vec(), Value::Bytes(b"aa".to_vec()));
        dict.insert(b"y".to_vec(), Value::Bytes(b"r".to_vec()));
        bencode::encode(&Value::Dict(dict))
    }

    fn compact_peer(ip: [u8; 4], port: u16) -> Vec<u8> {
        let mut out = ip.to_vec();
        out.extend_from_slice(&port.to_be_bytes());
        out
    }

    /// A single fake DHT node that answers ping, find_node and get_peers.
    async fn fake_node(socket: UdpSocket, id: [u8; 20], peers: Vec<Vec<u8>>) {
        let mut buf = [0u8; 4096];
        loop {
            let Ok((n, from)) = socket.recv_from(&mut buf).await else { return };
            let (query, _) = bencode::decode(&buf[..n]).unwrap();
            let name = query.get(b"q").and_then(Value::as_bytes).unwrap_or_default();

            let reply = match name {
                b"ping" => krpc_reply(vec![(b"id".to_vec(), Value::Bytes(id.to_vec()))]),
                b"find_node" => krpc_reply(vec![
                    (b"id".to_vec(), Value::Bytes(id.to_vec())),
                    (b"nodes".to_vec(), Value::Bytes(Vec::new())),
                ]),
                b"get_peers" => krpc_reply(vec![
                    (b"id".to_vec(), Value::Bytes(id.to_vec())),
                    (b"token".to_vec(), Value::Bytes(b"tok".to_vec())),
                    (
                        b"values".to_vec(),
                        Value::List(peers.iter().cloned().map(Value::Bytes).collect()),
                    ),
                ]),
                _ => continue,
            };

            let _ = socket.send_to(&reply, from).await;
        }
    }

    #[tokio::test]
    async fn test_lookup_against_fake_node() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();

        let peers = vec![
            compact_peer([10, 0, 0, 1], 6881),
            compact_peer([10, 0, 0, 2], 51413),
        ];
        let node = tokio::spawn(fake_node(socket, [0x42; 20], peers));

        let found = discover_peers(&[addr], [0x13; 20]).await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0], "10.0.0.1:6881".parse().unwrap());
        assert_eq!(found[1], "10.0.0.2:51413".parse().unwrap());

        node.abort();
    }

    #[tokio::test]
    async fn test_lookup_fails_without_reachable_bootstrap() {
        // Nothing is listening on this port
        let unreachable: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let started = std::time::Instant::now();
        let result = discover_peers(&[unreachable], [0u8; 20]).await;
        assert!(result.is_err());
        // The ping either errors immediately (ICMP refused) or waits out
        // the RPC deadline; both are acceptable here.
        assert!(started.elapsed() < Duration::from_secs(12));
    }

    #[test]
    fn test_merge_nodes_dedups_by_id() {
        let a = DhtNode { id: NodeId([1; 20]), addr: "1.1.1.1:1".parse().unwrap() };
        let b = DhtNode { id: NodeId([2; 20]), addr: "2.2.2.2:2".parse().unwrap() };
        let mut shortlist = vec![a.clone()];

        merge_nodes(&mut shortlist, vec![a.clone(), b.clone()]);
        assert_eq!(shortlist.len(), 2);

        merge_nodes(&mut shortlist, vec![b]);
        assert_eq!(shortlist.len(), 2);
    }
}
