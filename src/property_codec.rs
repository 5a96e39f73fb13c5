//! Binary codec for schemaless property maps
//!
//! Every value is stored as a signed 32-bit type tag followed by its payload.
//! Negative tags name the fixed-width scalar types; a non-negative tag marks
//! UTF-8 text and doubles as the byte length. Map keys always carry an
//! explicit 4-byte length. All multi-byte quantities are big-endian.
//!
//! A property record is `[u32 total-length][u32 pair-count][(key, value)…]`,
//! with the total length covering the length field itself so records can be
//! compared for in-place update and skipped during forward scans.

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Type tag for booleans (1-byte payload).
pub const TAG_BOOL: i32 = -1;
/// Type tag for signed 32-bit integers.
pub const TAG_INT: i32 = -2;
/// Type tag for unsigned 32-bit integers.
pub const TAG_UINT: i32 = -3;
/// Type tag for IEEE-754 single-precision floats.
pub const TAG_FLOAT: i32 = -4;

/// A property map attached to a node or an edge.
pub type PropertyMap = BTreeMap<String, PropertyValue>;

/// Errors raised while encoding or decoding property records.
///
/// Every variant is an invariant violation: the caller holds an address the
/// store itself handed out, so a failed decode means the file is corrupt.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("record extends past the end of the mapped region (offset {offset}, wanted {wanted} bytes)")]
    ShortRead { offset: usize, wanted: usize },
    #[error("unknown property type tag {0}")]
    UnknownTypeTag(i32),
    #[error("text payload is not valid UTF-8")]
    InvalidText(#[from] std::str::Utf8Error),
}

/// A single typed property value.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Bool(bool),
    Int(i32),
    Uint(u32),
    Float(f32),
    Text(String),
}

impl PropertyValue {
    /// Append the tagged wire form of this value to `buf`.
    pub fn pack_into(&self, buf: &mut Vec<u8>) {
        match self {
            PropertyValue::Bool(b) => {
                buf.extend_from_slice(&TAG_BOOL.to_be_bytes());
                buf.push(u8::from(*b));
            }
            PropertyValue::Int(i) => {
                buf.extend_from_slice(&TAG_INT.to_be_bytes());
                buf.extend_from_slice(&i.to_be_bytes());
            }
            PropertyValue::Uint(u) => {
                buf.extend_from_slice(&TAG_UINT.to_be_bytes());
                buf.extend_from_slice(&u.to_be_bytes());
            }
            PropertyValue::Float(f) => {
                buf.extend_from_slice(&TAG_FLOAT.to_be_bytes());
                buf.extend_from_slice(&f.to_be_bytes());
            }
            PropertyValue::Text(t) => {
                // The tag doubles as the byte length for text values.
                buf.extend_from_slice(&(t.len() as i32).to_be_bytes());
                buf.extend_from_slice(t.as_bytes());
            }
        }
    }
}

// Property values cross the HTTP boundary as bare JSON scalars, so the serde
// forms are hand-written rather than derived (an externally tagged enum would
// leak variant names onto the wire).
impl Serialize for PropertyValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            PropertyValue::Bool(b) => serializer.serialize_bool(*b),
            PropertyValue::Int(i) => serializer.serialize_i32(*i),
            PropertyValue::Uint(u) => serializer.serialize_u32(*u),
            PropertyValue::Float(f) => serializer.serialize_f32(*f),
            PropertyValue::Text(t) => serializer.serialize_str(t),
        }
    }
}

impl<'de> Deserialize<'de> for PropertyValue {
    fn deserialize<D>(deserializer: D) -> Result<PropertyValue, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ValueVisitor;

        impl<'de> Visitor<'de> for ValueVisitor {
            type Value = PropertyValue;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a boolean, 32-bit integer, float or string")
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<PropertyValue, E> {
                Ok(PropertyValue::Bool(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<PropertyValue, E> {
                if let Ok(i) = i32::try_from(v) {
                    Ok(PropertyValue::Int(i))
                } else if let Ok(u) = u32::try_from(v) {
                    Ok(PropertyValue::Uint(u))
                } else {
                    Err(E::custom(format!("integer {v} does not fit in 32 bits")))
                }
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<PropertyValue, E> {
                if let Ok(i) = i32::try_from(v) {
                    Ok(PropertyValue::Int(i))
                } else if let Ok(u) = u32::try_from(v) {
                    Ok(PropertyValue::Uint(u))
                } else {
                    Err(E::custom(format!("integer {v} does not fit in 32 bits")))
                }
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<PropertyValue, E> {
                Ok(PropertyValue::Float(v as f32))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<PropertyValue, E> {
                Ok(PropertyValue::Text(v.to_string()))
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<PropertyValue, E> {
                Ok(PropertyValue::Text(v))
            }
        }

        deserializer.deserialize_any(ValueVisitor)
    }
}

/// Pack a whole property record, length prefix included.
pub fn pack_record(props: &PropertyMap) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&(props.len() as u32).to_be_bytes());
    for (key, value) in props {
        body.extend_from_slice(&(key.len() as u32).to_be_bytes());
        body.extend_from_slice(key.as_bytes());
        value.pack_into(&mut body);
    }

    let total = (4 + body.len()) as u32;
    let mut out = Vec::with_capacity(total as usize);
    out.extend_from_slice(&total.to_be_bytes());
    out.extend_from_slice(&body);
    out
}

/// Decode the property record starting at `addr`, returning the map and the
/// stored total record length.
pub fn read_record_at(buf: &[u8], addr: usize) -> Result<(PropertyMap, u32), CodecError> {
    let mut reader = RecordReader { buf, pos: addr };
    let total_len = reader.read_u32()?;
    let count = reader.read_u32()?;
    let mut props = PropertyMap::new();
    for _ in 0..count {
        let key = reader.read_key()?;
        let value = reader.read_value()?;
        props.insert(key, value);
    }
    Ok((props, total_len))
}

struct RecordReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> RecordReader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        let end = self.pos.checked_add(len).ok_or(CodecError::ShortRead {
            offset: self.pos,
            wanted: len,
        })?;
        if end > self.buf.len() {
            return Err(CodecError::ShortRead {
                offset: self.pos,
                wanted: len,
            });
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u32(&mut self) -> Result<u32, CodecError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_i32(&mut self) -> Result<i32, CodecError> {
        let bytes = self.take(4)?;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_text(&mut self, len: usize) -> Result<String, CodecError> {
        let bytes = self.take(len)?;
        Ok(std::str::from_utf8(bytes)?.to_string())
    }

    fn read_key(&mut self) -> Result<String, CodecError> {
        let len = self.read_u32()? as usize;
        self.read_text(len)
    }

    fn read_value(&mut self) -> Result<PropertyValue, CodecError> {
        let tag = self.read_i32()?;
        if tag >= 0 {
            return Ok(PropertyValue::Text(self.read_text(tag as usize)?));
        }
        match tag {
            TAG_BOOL => {
                let byte = self.take(1)?;
                Ok(PropertyValue::Bool(byte[0] != 0))
            }
            TAG_INT => Ok(PropertyValue::Int(self.read_i32()?)),
            TAG_UINT => Ok(PropertyValue::Uint(self.read_u32()?)),
            TAG_FLOAT => {
                let bytes = self.take(4)?;
                Ok(PropertyValue::Float(f32::from_be_bytes([
                    bytes[0], bytes[1], bytes[2], bytes[3],
                ])))
            }
            other => Err(CodecError::UnknownTypeTag(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(props: PropertyMap) {
        let packed = pack_record(&props);
        let (decoded, total) = read_record_at(&packed, 0).unwrap();
        assert_eq!(decoded, props);
        assert_eq!(total as usize, packed.len());
    }

    #[test]
    fn test_every_tag_roundtrips() {
        let mut props = PropertyMap::new();
        props.insert("flag".to_string(), PropertyValue::Bool(true));
        props.insert("count".to_string(), PropertyValue::Int(-12345));
        props.insert("size".to_string(), PropertyValue::Uint(3_000_000_000));
        props.insert("ratio".to_string(), PropertyValue::Float(1.25));
        props.insert("name".to_string(), PropertyValue::Text("hello".to_string()));
        roundtrip(props);
    }

    #[test]
    fn test_multibyte_text_roundtrips() {
        let mut props = PropertyMap::new();
        props.insert(
            "greeting".to_string(),
            PropertyValue::Text("салəм".to_string()),
        );
        roundtrip(props);
    }

    #[test]
    fn test_empty_map_packs_to_header_only() {
        let packed = pack_record(&PropertyMap::new());
        assert_eq!(packed.len(), 8);
        let (decoded, total) = read_record_at(&packed, 0).unwrap();
        assert!(decoded.is_empty());
        assert_eq!(total, 8);
    }

    #[test]
    fn test_record_at_offset() {
        let mut props = PropertyMap::new();
        props.insert("k".to_string(), PropertyValue::Int(7));
        let packed = pack_record(&props);

        let mut buf = vec![0u8; 16];
        buf.extend_from_slice(&packed);
        let (decoded, _) = read_record_at(&buf, 16).unwrap();
        assert_eq!(decoded, props);
    }

    #[test]
    fn test_unknown_tag_is_an_error() {
        let mut props = PropertyMap::new();
        props.insert("k".to_string(), PropertyValue::Int(7));
        let mut packed = pack_record(&props);
        // Corrupt the value tag (after total, count, key length and key byte).
        let tag_offset = 4 + 4 + 4 + 1;
        packed[tag_offset..tag_offset + 4].copy_from_slice(&(-9i32).to_be_bytes());
        match read_record_at(&packed, 0) {
            Err(CodecError::UnknownTypeTag(-9)) => {}
            other => panic!("expected UnknownTypeTag, got {other:?}"),
        }
    }

    #[test]
    fn test_truncated_record_is_a_short_read() {
        let mut props = PropertyMap::new();
        props.insert("k".to_string(), PropertyValue::Text("abcdef".to_string()));
        let packed = pack_record(&props);
        match read_record_at(&packed[..packed.len() - 3], 0) {
            Err(CodecError::ShortRead { .. }) => {}
            other => panic!("expected ShortRead, got {other:?}"),
        }
    }

    #[test]
    fn test_json_scalars_map_to_typed_values() {
        let value: PropertyValue = serde_json::from_str("true").unwrap();
        assert_eq!(value, PropertyValue::Bool(true));
        let value: PropertyValue = serde_json::from_str("-3").unwrap();
        assert_eq!(value, PropertyValue::Int(-3));
        let value: PropertyValue = serde_json::from_str("3000000000").unwrap();
        assert_eq!(value, PropertyValue::Uint(3_000_000_000));
        let value: PropertyValue = serde_json::from_str("1.25").unwrap();
        assert_eq!(value, PropertyValue::Float(1.25));
        let value: PropertyValue = serde_json::from_str("\"z\"").unwrap();
        assert_eq!(value, PropertyValue::Text("z".to_string()));
    }

    #[test]
    fn test_json_roundtrip_preserves_scalar_shape() {
        let mut props = PropertyMap::new();
        props.insert("an_int".to_string(), PropertyValue::Int(2));
        props.insert("flag".to_string(), PropertyValue::Bool(false));
        props.insert("label".to_string(), PropertyValue::Text("user".to_string()));
        let json = serde_json::to_string(&props).unwrap();
        let back: PropertyMap = serde_json::from_str(&json).unwrap();
        assert_eq!(back, props);
    }
}
