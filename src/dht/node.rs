//! DHT node identifiers and compact encodings

use std::net::SocketAddr;

use anyhow::Result;
use rand::RngCore;
use sha1::{Digest, Sha1};

use crate::error::TorrentError;

/// 20-byte Kademlia node identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub [u8; 20]);

impl NodeId {
    /// Generate a random id: SHA-1 over 20 random bytes.
    pub fn random() -> Self {
        let mut entropy = [0u8; 20];
        rand::thread_rng().fill_bytes(&mut entropy);
        NodeId(Sha1::digest(entropy).into())
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let id: [u8; 20] = bytes
            .try_into()
            .map_err(|_| TorrentError::decode("node id must be 20 bytes"))?;
        Ok(NodeId(id))
    }

    /// Kademlia distance: bitwise XOR, compared as a big-endian unsigned
    /// integer.
    pub fn distance(&self, target: &[u8; 20]) -> [u8; 20] {
        let mut out = [0u8; 20];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ target[i];
        }
        out
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// A known DHT node
#[derive(Debug, Clone)]
pub struct DhtNode {
    pub id: NodeId,
    pub addr: SocketAddr,
}

/// Sort nodes by XOR distance to the target, closest first.
pub fn sort_by_distance(nodes: &mut [DhtNode], target: &[u8; 20]) {
    nodes.sort_by(|a, b| a.id.distance(target).cmp(&b.id.distance(target)));
}

/// Parse 26-byte compact node entries: 20-byte id, IPv4, big-endian port.
pub fn parse_compact_nodes(data: &[u8]) -> Result<Vec<DhtNode>> {
    if data.len() % 26 != 0 {
        return Err(TorrentError::decode(format!(
            "compact node list length {} is not a multiple of 26",
            data.len()
        ))
        .into());
    }

    let mut nodes = Vec::with_capacity(data.len() / 26);
    for chunk in data.chunks_exact(26) {
        let id = NodeId::from_slice(&chunk[0..20])?;
        let ip = std::net::Ipv4Addr::new(chunk[20], chunk[21], chunk[22], chunk[23]);
        let port = u16::from_be_bytes([chunk[24], chunk[25]]);
        nodes.push(DhtNode { id, addr: SocketAddr::new(ip.into(), port) });
    }

    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_ids_differ() {
        assert_ne!(NodeId::random(), NodeId::random());
    }

    #[test]
    fn test_distance_is_xor() {
        let id = NodeId([0xff; 20]);
        let target = [0x0f; 20];
        assert_eq!(id.distance(&target), [0xf0; 20]);

        let same = NodeId([0x0f; 20]);
        assert_eq!(same.distance(&target), [0u8; 20]);
    }

    #[test]
    fn test_sort_by_distance() {
        let target = [0u8; 20];
        let far = DhtNode { id: NodeId([0xff; 20]), addr: "1.1.1.1:1".parse().unwrap() };
        let near = DhtNode { id: NodeId([0x01; 20]), addr: "2.2.2.2:2".parse().unwrap() };
        let mid = DhtNode { id: NodeId([0x10; 20]), addr: "3.3.3.3:3".parse().unwrap() };

        let mut nodes = vec![far.clone(), near.clone(), mid.clone()];
        sort_by_distance(&mut nodes, &target);

        assert_eq!(nodes[0].id, near.id);
        assert_eq!(nodes[1].id, mid.id);
        assert_eq!(nodes[2].id, far.id);
    }

    #[test]
    fn test_parse_compact_nodes() {
        let mut data = Vec::new();
        data.extend_from_slice(&[1u8; 20]);
        data.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1]);

        let nodes = parse_compact_nodes(&data).unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, NodeId([1u8; 20]));
        assert_eq!(nodes[0].addr, "127.0.0.1:6881".parse().unwrap());
    }

    #[test]
    fn test_parse_compact_nodes_rejects_ragged_input() {
        assert!(parse_compact_nodes(&[0u8; 25]).is_err());
    }

    #[test]
    fn test_node_id_from_slice() {
        assert!(NodeId::from_slice(&[0u8; 19]).is_err());
        assert_eq!(NodeId::from_slice(&[2u8; 20]).unwrap(), NodeId([2u8; 20]));
    }
}
