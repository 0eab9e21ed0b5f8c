//! The dictionary-compressed property block: a flat list of UTF-8
//! key/value pairs prefixed by a length varint, with a fixed 14-entry
//! abbreviation table for common strings.
//!
//! The abbreviation table is positional and must match the reference list
//! byte-for-byte; compatibility between peers depends on it.

use crate::varint::{self, VarintError};
use bytes::{BufMut, BytesMut};

/// Fixed abbreviation table, indexed `1..=14` on the wire (index 0 is unused).
pub const ABBREVIATIONS: [&str; 14] = [
    "Profile",
    "Error-Code",
    "Error-Domain",
    "Content-Type",
    "application/json",
    "application/octet-stream",
    "text/plain; charset=UTF-8",
    "text/xml",
    "Accept",
    "Cache-Control",
    "must-revalidate",
    "If-Match",
    "If-None-Match",
    "Location",
];

/// An ordered key/value property map. Order is preserved through
/// encode/decode so that round-tripping is a byte-for-byte-faithful inverse,
/// but callers should treat lookups as a map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties(Vec<(String, String)>);

impl Properties {
    pub fn new() -> Self {
        Properties(Vec::new())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.push((key.into(), value.into()));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl FromIterator<(String, String)> for Properties {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Properties(iter.into_iter().collect())
    }
}

/// Failure modes while decoding a property block.
#[derive(Debug, PartialEq, Eq)]
pub enum PropertyError {
    /// The buffer does not yet hold the full block; leave it untouched and
    /// wait for more bytes. Not a protocol error.
    Incomplete,
    /// The block was malformed: a bad length varint, an unterminated
    /// string, invalid UTF-8, or an out-of-range abbreviation index.
    BadData(String),
}

fn abbreviation_for(s: &str) -> Option<u8> {
    ABBREVIATIONS
        .iter()
        .position(|entry| *entry == s)
        .map(|i| (i + 1) as u8)
}

fn encode_token(buf: &mut BytesMut, s: &str) {
    if let Some(index) = abbreviation_for(s) {
        buf.put_u8(index);
    } else {
        buf.put_slice(s.as_bytes());
    }
    buf.put_u8(0);
}

/// Encode a property map to its on-wire representation, including the
/// leading length varint.
pub fn encode_properties(props: &Properties) -> BytesMut {
    let mut body = BytesMut::new();
    for (key, value) in props.iter() {
        encode_token(&mut body, key);
        encode_token(&mut body, value);
    }
    let mut out = BytesMut::with_capacity(body.len() + 10);
    varint::put_varint(&mut out, body.len() as u64);
    out.extend_from_slice(&body);
    out
}

/// Decode a property block from the start of `buf`. Returns the decoded
/// properties and the total number of bytes consumed (length varint plus
/// the block itself). On `Incomplete`, `buf` should be considered untouched
/// and the caller should retry once more bytes have arrived.
pub fn decode_properties(buf: &[u8]) -> Result<(Properties, usize), PropertyError> {
    let (length, length_varint_len) = match varint::decode_varint(buf) {
        Ok(v) => v,
        Err(VarintError::Incomplete) => return Err(PropertyError::Incomplete),
        Err(VarintError::Malformed) => {
            return Err(PropertyError::BadData("malformed property block length".into()));
        }
    };
    let length = length as usize;
    let body_start = length_varint_len;
    let body_end = body_start
        .checked_add(length)
        .ok_or_else(|| PropertyError::BadData("property block length overflow".into()))?;
    if buf.len() < body_end {
        return Err(PropertyError::Incomplete);
    }
    let body = &buf[body_start..body_end];
    let props = decode_tokens(body)?;
    Ok((props, body_end))
}

fn decode_tokens(mut body: &[u8]) -> Result<Properties, PropertyError> {
    let mut props = Properties::new();
    while !body.is_empty() {
        let (key, rest) = decode_token(body)?;
        let (value, rest) = decode_token(rest)?;
        props.insert(key, value);
        body = rest;
    }
    Ok(props)
}

fn decode_token(body: &[u8]) -> Result<(String, &[u8]), PropertyError> {
    let nul_pos = body
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| PropertyError::BadData("unterminated property string".into()))?;
    let token = &body[..nul_pos];
    let rest = &body[nul_pos + 1..];

    if token.len() == 1 && token[0] < 0x20 {
        let index = token[0] as usize;
        if index == 0 || index > ABBREVIATIONS.len() {
            return Err(PropertyError::BadData(format!(
                "abbreviation index {index} out of range"
            )));
        }
        return Ok((ABBREVIATIONS[index - 1].to_string(), rest));
    }

    let s = String::from_utf8(token.to_vec())
        .map_err(|e| PropertyError::BadData(format!("invalid UTF-8 in property: {e}")))?;
    Ok((s, rest))
}
