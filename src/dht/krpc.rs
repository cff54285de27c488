//! KRPC message encoding and decoding (BEP 5)
//!
//! Every message is a bencoded dictionary with a transaction id `t`, a
//! type `y` of "q", "r" or "e", and either `q`+`a` for queries or `r` for
//! responses.

use std::collections::BTreeMap;

use anyhow::Result;

use crate::bencode::{self, Value};
use crate::dht::node::NodeId;
use crate::error::TorrentError;

/// Fixed transaction id for our queries. One outstanding query per socket
/// makes a counter unnecessary.
pub const TRANSACTION_ID: &[u8] = b"aa";

/// The `r` payload of a KRPC response
#[derive(Debug, Default)]
pub struct KrpcResponse {
    /// Responding node's id
    pub id: Vec<u8>,
    /// Compact 26-byte node entries, possibly empty
    pub nodes: Vec<u8>,
    /// Write token for a later announce
    pub token: Option<Vec<u8>>,
    /// Compact 6-byte peer entries
    pub values: Vec<Vec<u8>>,
}

/// Bencoded `ping` query
pub fn ping_query(self_id: &NodeId) -> Vec<u8> {
    let mut args = BTreeMap::new();
    args.insert(b"id".to_vec(), Value::Bytes(self_id.as_bytes().to_vec()));
    build_query(b"ping", args)
}

/// Bencoded `find_node` query
pub fn find_node_query(self_id: &NodeId, target: &[u8; 20]) -> Vec<u8> {
    let mut args = BTreeMap::new();
    args.insert(b"id".to_vec(), Value::Bytes(self_id.as_bytes().to_vec()));
    args.insert(b"target".to_vec(), Value::Bytes(target.to_vec()));
    build_query(b"find_node", args)
}

/// Bencoded `get_peers` query
pub fn get_peers_query(self_id: &NodeId, info_hash: &[u8; 20]) -> Vec<u8> {
    let mut args = BTreeMap::new();
    args.insert(b"id".to_vec(), Value::Bytes(self_id.as_bytes().to_vec()));
    args.insert(b"info_hash".to_vec(), Value::Bytes(info_hash.to_vec()));
    build_query(b"get_peers", args)
}

fn build_query(name: &[u8], args: BTreeMap<Vec<u8>, Value>) -> Vec<u8> {
    let mut dict = BTreeMap::new();
    dict.insert(b"t".to_vec(), Value::Bytes(TRANSACTION_ID.to_vec()));
    dict.insert(b"y".to_vec(), Value::Bytes(b"q".to_vec()));
    dict.insert(b"q".to_vec(), Value::Bytes(name.to_vec()));
    dict.insert(b"a".to_vec(), Value::Dict(args));
    bencode::encode(&Value::Dict(dict))
}

/// Decode and validate a KRPC response.
///
/// The transaction id must match ours and `y` must be "r"; an "e" reply
/// surfaces the remote error, anything else is a protocol violation.
pub fn parse_response(data: &[u8]) -> Result<KrpcResponse> {
    let (value, _) = bencode::decode(data)?;

    let transaction = value
        .get(b"t")
        .and_then(Value::as_bytes)
        .ok_or_else(|| TorrentError::protocol("krpc reply missing transaction id"))?;
    if transaction != TRANSACTION_ID {
        return Err(TorrentError::protocol("krpc transaction id mismatch").into());
    }

    match value.get(b"y").and_then(Value::as_bytes) {
        Some(b"r") => {}
        Some(b"e") => {
            let detail = value
                .get(b"e")
                .and_then(Value::as_list)
                .and_then(|l| l.get(1))
                .and_then(Value::as_str)
                .unwrap_or("unspecified");
            return Err(TorrentError::protocol(format!("krpc error reply: {}", detail)).into());
        }
        _ => return Err(TorrentError::protocol("krpc reply has invalid type").into()),
    }

    let reply = value
        .get(b"r")
        .ok_or_else(|| TorrentError::protocol("krpc reply missing r dictionary"))?;

    let mut response = KrpcResponse {
        id: reply
            .get(b"id")
            .and_then(Value::as_bytes)
            .unwrap_or_default()
            .to_vec(),
        nodes: reply
            .get(b"nodes")
            .and_then(Value::as_bytes)
            .unwrap_or_default()
            .to_vec(),
        token: reply.get(b"token").and_then(Value::as_bytes).map(<[u8]>::to_vec),
        values: Vec::new(),
    };

    if let Some(values) = reply.get(b"values").and_then(Value::as_list) {
        for peer in values {
            if let Some(bytes) = peer.as_bytes() {
                response.values.push(bytes.to_vec());
            }
        }
    }

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_query_encoding() {
        let query = ping_query(&NodeId([b'N'; 20]));
        let expected = format!("d1:ad2:id20:{}e1:q4:ping1:t2:aa1:y1:qe", "N".repeat(20));
        assert_eq!(query, expected.as_bytes());
    }

    #[test]
    fn test_get_peers_query_roundtrip() {
        let query = get_peers_query(&NodeId([1u8; 20]), &[2u8; 20]);
        let (value, _) = bencode::decode(&query).unwrap();

        assert_eq!(value.get(b"y").and_then(Value::as_bytes), Some(b"q".as_ref()));
        assert_eq!(value.get(b"q").and_then(Value::as_bytes), Some(b"get_peers".as_ref()));
        let args = value.get(b"a").unwrap();
        assert_eq!(args.get(b"info_hash").and_then(Value::as_bytes), Some([2u8; 20].as_ref()));
    }

    #[test]
    fn test_find_node_query_carries_target() {
        let query = find_node_query(&NodeId([1u8; 20]), &[3u8; 20]);
        let (value, _) = bencode::decode(&query).unwrap();
        let args = value.get(b"a").unwrap();
        assert_eq!(args.get(b"target").and_then(Value::as_bytes), Some([3u8; 20].as_ref()));
    }

    #[test]
    fn test_parse_response_with_peers_and_token() {
        let mut body = Vec::new();
        body.extend_from_slice(b"d1:rd2:id20:");
        body.extend_from_slice(&[7u8; 20]);
        body.extend_from_slice(b"5:token4:abcd6:valuesl6:");
        body.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1]);
        body.extend_from_slice(b"ee1:t2:aa1:y1:re");

        let response = parse_response(&body).unwrap();
        assert_eq!(response.id, vec![7u8; 20]);
        assert_eq!(response.token.as_deref(), Some(b"abcd".as_ref()));
        assert_eq!(response.values.len(), 1);
        assert!(response.nodes.is_empty());
    }

    #[test]
    fn test_parse_response_rejects_wrong_transaction() {
        let body = b"d1:rd2:id2:xxe1:t2:zz1:y1:re";
        assert!(parse_response(body).is_err());
    }

    #[test]
    fn test_parse_error_reply() {
        let body = b"d1:eli201e13:generic errore1:t2:aa1:y1:ee";
        let err = parse_response(body).unwrap_err();
        assert!(err.to_string().contains("generic error"));
    }

    #[test]
    fn test_parse_response_rejects_unknown_type() {
        let body = b"d1:t2:aa1:y1:qe";
        assert!(parse_response(body).is_err());
    }
}
