//! Bencode encoder
//!
//! Emits canonical form: dictionary keys in ascending lexicographic order
//! and integers without leading zeros. This is the only correct order for
//! recomputing the info-hash.

use crate::bencode::Value;

/// Encode a value into canonical bencode bytes.
///
/// The `Value` sum type only admits the four bencodable shapes, so
/// encoding cannot fail.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Int(i) => {
            out.push(b'i');
            out.extend_from_slice(i.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Bytes(b) => {
            out.extend_from_slice(b.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(b);
        }
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(dict) => {
            out.push(b'd');
            // BTreeMap iteration is already in ascending key order
            for (key, val) in dict {
                out.extend_from_slice(key.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(key);
                encode_into(val, out);
            }
            out.push(b'e');
        }
    }
}
