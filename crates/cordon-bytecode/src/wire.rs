//! Self-describing wire format for exported programs
//!
//! Every element starts with a header byte: bits 0-1 carry the kind
//! (string, list, map, blob) and bits 2-4 carry how many little-endian
//! length bytes follow (0 to 6, zero meaning an empty payload). The length
//! is a byte count for strings and blobs and an element count for lists and
//! maps; a map of N pairs declares 2N alternating key and value elements,
//! and an odd count is rejected. Lengths are always written with the minimal number
//! of bytes, and the decoder rejects anything else, so a successful decode
//! re-encodes to exactly the input bytes.

use crate::encoder::{BytecodeReader, DecodeError};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};
use thiserror::Error;

/// Maximum number of length bytes in a header
pub const MAX_LENGTH_BYTES: u8 = 6;

/// Maximum nesting depth accepted by the decoder
pub const MAX_DEPTH: usize = 64;

/// Element kind stored in the low two bits of the header byte
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// UTF-8 text
    String = 0,
    /// Ordered list of elements
    List = 1,
    /// Ordered key/value pairs
    Map = 2,
    /// Opaque bytes
    Blob = 3,
}

impl Kind {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => Kind::String,
            1 => Kind::List,
            2 => Kind::Map,
            _ => Kind::Blob,
        }
    }
}

/// Wire decoding errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// Ran out of input
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Header byte has reserved bits set or too many length bytes
    #[error("Invalid header byte {byte:#04x} at offset {offset}")]
    InvalidHeader {
        /// Offending header byte
        byte: u8,
        /// Offset of the header
        offset: usize,
    },

    /// Length was not written with the minimal number of bytes
    #[error("Non-canonical length encoding at offset {0}")]
    NonCanonicalLength(usize),

    /// Declared length exceeds the bytes left in the input
    #[error("Declared length {length} at offset {offset} exceeds remaining input ({remaining} bytes)")]
    LengthOverflow {
        /// Declared length
        length: u64,
        /// Offset of the header
        offset: usize,
        /// Bytes left after the header
        remaining: usize,
    },

    /// Map declared an odd number of elements
    #[error("Map at offset {offset} declares {length} elements; expected key/value pairs")]
    OddMapLength {
        /// Declared element count
        length: u64,
        /// Offset of the header
        offset: usize,
    },

    /// String payload was not valid UTF-8
    #[error("Invalid UTF-8 string at offset {0}")]
    InvalidUtf8(usize),

    /// Nesting deeper than [`MAX_DEPTH`]
    #[error("Nesting deeper than {MAX_DEPTH} at offset {0}")]
    TooDeep(usize),

    /// Extra bytes after the top-level element
    #[error("Trailing bytes after top-level element at offset {0}")]
    TrailingBytes(usize),
}

/// A decoded wire element
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Encoded {
    /// UTF-8 text
    String(String),
    /// Ordered list
    List(Vec<Encoded>),
    /// Ordered key/value pairs (keys are not required to be unique)
    Map(Vec<(Encoded, Encoded)>),
    /// Opaque bytes
    Blob(Vec<u8>),
}

impl Encoded {
    /// Convenience constructor for a string element
    pub fn str(value: impl Into<String>) -> Self {
        Encoded::String(value.into())
    }

    /// Build a map from string keys
    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, Encoded)>) -> Self {
        Encoded::Map(
            entries
                .into_iter()
                .map(|(k, v)| (Encoded::String(k.into()), v))
                .collect(),
        )
    }

    /// Element kind
    pub fn kind(&self) -> Kind {
        match self {
            Encoded::String(_) => Kind::String,
            Encoded::List(_) => Kind::List,
            Encoded::Map(_) => Kind::Map,
            Encoded::Blob(_) => Kind::Blob,
        }
    }

    /// Borrow the text of a string element
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Encoded::String(s) => Some(s),
            _ => None,
        }
    }

    /// Borrow the elements of a list
    pub fn as_list(&self) -> Option<&[Encoded]> {
        match self {
            Encoded::List(items) => Some(items),
            _ => None,
        }
    }

    /// Borrow the pairs of a map
    pub fn as_map(&self) -> Option<&[(Encoded, Encoded)]> {
        match self {
            Encoded::Map(pairs) => Some(pairs),
            _ => None,
        }
    }

    /// Borrow the bytes of a blob
    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Encoded::Blob(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Look up the first value stored under a string key
    pub fn get(&self, key: &str) -> Option<&Encoded> {
        self.as_map()?
            .iter()
            .find(|(k, _)| k.as_str() == Some(key))
            .map(|(_, v)| v)
    }

    // ===== Encoding =====

    /// Encode this element
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    /// Append the encoding of this element to `out`
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Encoded::String(s) => {
                write_header(out, Kind::String, s.len() as u64);
                out.extend_from_slice(s.as_bytes());
            }
            Encoded::Blob(bytes) => {
                write_header(out, Kind::Blob, bytes.len() as u64);
                out.extend_from_slice(bytes);
            }
            Encoded::List(items) => {
                write_header(out, Kind::List, items.len() as u64);
                for item in items {
                    item.encode_into(out);
                }
            }
            Encoded::Map(pairs) => {
                write_header(out, Kind::Map, pairs.len() as u64 * 2);
                for (k, v) in pairs {
                    k.encode_into(out);
                    v.encode_into(out);
                }
            }
        }
    }

    // ===== Decoding =====

    /// Decode exactly one element spanning all of `bytes`
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut reader = BytecodeReader::new(bytes);
        let value = decode_element(&mut reader, 0)?;
        if reader.has_more() {
            return Err(WireError::TrailingBytes(reader.position()));
        }
        Ok(value)
    }
}

/// Number of bytes needed to hold `length` (0 for 0)
fn length_bytes(length: u64) -> u8 {
    ((64 - length.leading_zeros() + 7) / 8) as u8
}

fn write_header(out: &mut Vec<u8>, kind: Kind, length: u64) {
    let len_of_len = length_bytes(length);
    debug_assert!(len_of_len <= MAX_LENGTH_BYTES);
    out.push((len_of_len << 2) | kind as u8);
    out.extend_from_slice(&length.to_le_bytes()[..len_of_len as usize]);
}

fn read_header(reader: &mut BytecodeReader<'_>) -> Result<(Kind, u64), WireError> {
    let offset = reader.position();
    let byte = reader.read_u8()?;
    let len_of_len = (byte >> 2) & 0b111;
    if byte & 0b1110_0000 != 0 || len_of_len > MAX_LENGTH_BYTES {
        return Err(WireError::InvalidHeader { byte, offset });
    }
    let length = reader.read_uint_le(len_of_len as usize)?;
    if length_bytes(length) != len_of_len {
        return Err(WireError::NonCanonicalLength(offset));
    }
    Ok((Kind::from_bits(byte), length))
}

fn decode_element(reader: &mut BytecodeReader<'_>, depth: usize) -> Result<Encoded, WireError> {
    let offset = reader.position();
    if depth > MAX_DEPTH {
        return Err(WireError::TooDeep(offset));
    }
    let (kind, length) = read_header(reader)?;
    if kind == Kind::Map && length % 2 != 0 {
        return Err(WireError::OddMapLength { length, offset });
    }
    let remaining = reader.remaining();
    // Every nested element takes at least its header byte.
    if length > remaining as u64 {
        return Err(WireError::LengthOverflow {
            length,
            offset,
            remaining,
        });
    }
    let length = length as usize;

    match kind {
        Kind::String => {
            let start = reader.position();
            let bytes = reader.read_bytes(length)?;
            let text = std::str::from_utf8(bytes).map_err(|_| WireError::InvalidUtf8(start))?;
            Ok(Encoded::String(text.to_owned()))
        }
        Kind::Blob => Ok(Encoded::Blob(reader.read_bytes(length)?.to_vec())),
        Kind::List => {
            let mut items = Vec::with_capacity(length);
            for _ in 0..length {
                items.push(decode_element(reader, depth + 1)?);
            }
            Ok(Encoded::List(items))
        }
        Kind::Map => {
            let mut pairs = Vec::with_capacity(length / 2);
            for _ in 0..length / 2 {
                let key = decode_element(reader, depth + 1)?;
                let value = decode_element(reader, depth + 1)?;
                pairs.push((key, value));
            }
            Ok(Encoded::Map(pairs))
        }
    }
}

impl Serialize for Encoded {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Encoded::String(s) => serializer.serialize_str(s),
            Encoded::Blob(bytes) => serializer.serialize_str(&hex::encode(bytes)),
            Encoded::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Encoded::Map(pairs) if pairs.iter().all(|(k, _)| k.as_str().is_some()) => {
                let mut map = serializer.serialize_map(Some(pairs.len()))?;
                for (k, v) in pairs {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
            Encoded::Map(pairs) => {
                let mut seq = serializer.serialize_seq(Some(pairs.len()))?;
                for pair in pairs {
                    seq.serialize_element(&[&pair.0, &pair.1])?;
                }
                seq.end()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_value(rng: &mut StdRng, depth: usize) -> Encoded {
        let kind = if depth > 3 { rng.gen_range(0..2) * 3 } else { rng.gen_range(0..4) };
        match kind {
            0 => {
                let len = rng.gen_range(0..40);
                Encoded::String((0..len).map(|_| rng.gen_range('a'..='z')).collect())
            }
            1 => {
                let len = rng.gen_range(0..6);
                Encoded::List((0..len).map(|_| random_value(rng, depth + 1)).collect())
            }
            2 => {
                let len = rng.gen_range(0..4);
                Encoded::Map(
                    (0..len)
                        .map(|_| (random_value(rng, depth + 1), random_value(rng, depth + 1)))
                        .collect(),
                )
            }
            _ => {
                let len = if rng.gen_bool(0.1) { rng.gen_range(256..70_000) } else { rng.gen_range(0..64) };
                Encoded::Blob((0..len).map(|_| rng.gen()).collect())
            }
        }
    }

    #[test]
    fn test_header_layout() {
        assert_eq!(Encoded::str("").encode(), vec![0x00]);
        assert_eq!(Encoded::str("hi").encode(), vec![0x04, 2, b'h', b'i']);
        assert_eq!(Encoded::List(vec![]).encode(), vec![0x01]);
        assert_eq!(Encoded::Blob(vec![7]).encode(), vec![0x07, 1, 7]);

        let map = Encoded::map([("a", Encoded::Blob(vec![]))]);
        assert_eq!(map.encode(), vec![0x06, 2, 0x04, 1, b'a', 0x03]);

        let blob = Encoded::Blob(vec![0; 300]).encode();
        assert_eq!(&blob[..3], &[0x0B, 0x2C, 0x01]);
        assert_eq!(blob.len(), 303);
    }

    #[test]
    fn test_random_roundtrip_is_byte_exact() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..200 {
            let value = random_value(&mut rng, 0);
            let bytes = value.encode();
            let decoded = Encoded::decode(&bytes).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(decoded.encode(), bytes);
        }
    }

    #[test]
    fn test_truncated_input_never_panics() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..50 {
            let bytes = random_value(&mut rng, 0).encode();
            if bytes.len() > 4096 {
                continue;
            }
            for cut in 0..bytes.len() {
                assert!(Encoded::decode(&bytes[..cut]).is_err());
            }
        }
    }

    #[test]
    fn test_declared_length_past_end() {
        // String claiming 5 bytes with only 2 present.
        let err = Encoded::decode(&[0x04, 5, b'a', b'b']).unwrap_err();
        assert!(matches!(err, WireError::LengthOverflow { length: 5, .. }));

        // List claiming a huge element count.
        let err = Encoded::decode(&[0x19, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x7F]).unwrap_err();
        assert!(matches!(err, WireError::LengthOverflow { .. }));
    }

    #[test]
    fn test_rejects_bad_headers() {
        assert_eq!(
            Encoded::decode(&[0x1C]),
            Err(WireError::InvalidHeader { byte: 0x1C, offset: 0 })
        );
        assert_eq!(
            Encoded::decode(&[0x80]),
            Err(WireError::InvalidHeader { byte: 0x80, offset: 0 })
        );
        // Length 1 written in two bytes.
        assert_eq!(
            Encoded::decode(&[0x0B, 1, 0, 9]),
            Err(WireError::NonCanonicalLength(0))
        );
        // Zero written with one length byte.
        assert_eq!(Encoded::decode(&[0x04, 0]), Err(WireError::NonCanonicalLength(0)));
    }

    #[test]
    fn test_map_declares_element_count() {
        // One pair: key "k", value ""
        assert_eq!(
            Encoded::decode(&[0x06, 2, 0x04, 1, b'k', 0x00]),
            Ok(Encoded::map([("k", Encoded::str(""))]))
        );
        // Three elements cannot form pairs
        assert_eq!(
            Encoded::decode(&[0x06, 3, 0x00, 0x00, 0x00]),
            Err(WireError::OddMapLength { length: 3, offset: 0 })
        );
    }

    #[test]
    fn test_rejects_invalid_utf8_and_trailing() {
        assert_eq!(Encoded::decode(&[0x04, 1, 0xFF]), Err(WireError::InvalidUtf8(2)));
        assert_eq!(Encoded::decode(&[0x00, 0x00]), Err(WireError::TrailingBytes(1)));
    }

    #[test]
    fn test_depth_limit() {
        let mut bytes = vec![0x05, 1].repeat(MAX_DEPTH + 2);
        bytes.push(0x01);
        assert!(matches!(Encoded::decode(&bytes), Err(WireError::TooDeep(_))));
    }

    #[test]
    fn test_get_and_json() {
        let value = Encoded::map([
            ("name", Encoded::str("Player")),
            ("code", Encoded::Blob(vec![0x2A])),
        ]);
        assert_eq!(value.get("name").and_then(Encoded::as_str), Some("Player"));
        assert!(value.get("missing").is_none());
        let json = serde_json::to_string(&value).unwrap();
        assert_eq!(json, r#"{"name":"Player","code":"2a"}"#);
    }
}
