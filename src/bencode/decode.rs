//! Bencode decoder
//!
//! Consumes a byte slice and returns the decoded value together with the
//! number of bytes read. Anything non-canonical is rejected.

use std::collections::BTreeMap;

use anyhow::Result;

use crate::bencode::Value;
use crate::error::TorrentError;

/// Decode the bencoded value at the start of `data`.
///
/// Returns the value and the number of bytes consumed. Trailing bytes are
/// left for the caller, which matters for BEP 9 payloads where raw
/// metadata follows the dictionary.
pub fn decode(data: &[u8]) -> Result<(Value, usize)> {
    let mut idx = 0;
    let value = decode_value(data, &mut idx)?;
    Ok((value, idx))
}

fn decode_value(data: &[u8], idx: &mut usize) -> Result<Value> {
    let byte = *data
        .get(*idx)
        .ok_or_else(|| TorrentError::decode("unexpected end of data"))?;

    match byte {
        b'i' => decode_integer(data, idx),
        b'l' => decode_list(data, idx),
        b'd' => decode_dictionary(data, idx),
        b'0'..=b'9' => decode_string(data, idx),
        other => Err(TorrentError::decode(format!(
            "invalid leading byte 0x{:02x}, expected 'i', 'l', 'd' or a digit",
            other
        ))
        .into()),
    }
}

/// `i<optional minus><digits>e`; rejects `-0`, leading zeros and empty digits
fn decode_integer(data: &[u8], idx: &mut usize) -> Result<Value> {
    let start = *idx + 1;
    let end = data[start..]
        .iter()
        .position(|&b| b == b'e')
        .map(|p| start + p)
        .ok_or_else(|| TorrentError::decode("missing terminator for integer"))?;

    let digits = &data[start..end];
    if digits.is_empty() || digits == b"-" {
        return Err(TorrentError::decode("integer with empty digits").into());
    }
    if digits == b"-0" {
        return Err(TorrentError::decode("-0 is invalid").into());
    }
    let magnitude = if digits[0] == b'-' { &digits[1..] } else { digits };
    if magnitude.len() > 1 && magnitude[0] == b'0' {
        return Err(TorrentError::decode("leading zeros are not allowed").into());
    }

    let text = std::str::from_utf8(digits)
        .map_err(|_| TorrentError::decode("integer digits are not ASCII"))?;
    let value: i64 = text
        .parse()
        .map_err(|_| TorrentError::decode(format!("invalid integer '{}'", text)))?;

    *idx = end + 1;
    Ok(Value::Int(value))
}

/// `<non-negative decimal length>:<bytes>`
fn decode_string(data: &[u8], idx: &mut usize) -> Result<Value> {
    let colon = data[*idx..]
        .iter()
        .position(|&b| b == b':')
        .map(|p| *idx + p)
        .ok_or_else(|| TorrentError::decode("no ':' found for string length"))?;

    let len_text = std::str::from_utf8(&data[*idx..colon])
        .map_err(|_| TorrentError::decode("string length is not ASCII"))?;
    let length: usize = len_text
        .parse()
        .map_err(|_| TorrentError::decode(format!("invalid string length '{}'", len_text)))?;

    let start = colon + 1;
    let end = start
        .checked_add(length)
        .filter(|&e| e <= data.len())
        .ok_or_else(|| TorrentError::decode("string payload is truncated"))?;

    *idx = end;
    Ok(Value::Bytes(data[start..end].to_vec()))
}

fn decode_list(data: &[u8], idx: &mut usize) -> Result<Value> {
    *idx += 1;
    let mut list = Vec::new();

    loop {
        match data.get(*idx) {
            Some(b'e') => {
                *idx += 1;
                return Ok(Value::List(list));
            }
            Some(_) => list.push(decode_value(data, idx)?),
            None => return Err(TorrentError::decode("missing terminator for list").into()),
        }
    }
}

/// Keys must be byte strings in strictly ascending order, no duplicates
fn decode_dictionary(data: &[u8], idx: &mut usize) -> Result<Value> {
    *idx += 1;
    let mut dict = BTreeMap::new();
    let mut last_key: Option<Vec<u8>> = None;

    loop {
        match data.get(*idx) {
            Some(b'e') => {
                *idx += 1;
                return Ok(Value::Dict(dict));
            }
            Some(_) => {
                let key = match decode_value(data, idx)? {
                    Value::Bytes(b) => b,
                    other => {
                        return Err(TorrentError::decode(format!(
                            "dictionary key must be a byte string, got {:?}",
                            other
                        ))
                        .into())
                    }
                };

                if let Some(prev) = &last_key {
                    if key <= *prev {
                        return Err(TorrentError::decode(
                            "dictionary keys are not in strictly ascending order",
                        )
                        .into());
                    }
                }

                let value = decode_value(data, idx)?;
                last_key = Some(key.clone());
                dict.insert(key, value);
            }
            None => return Err(TorrentError::decode("missing terminator for dictionary").into()),
        }
    }
}
