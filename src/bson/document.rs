//! Ordered document container and the standard wire framing.
//!
//! A document serializes as `i32 total_len | elements... | 0x00` where each
//! element is `tag | cstring key | payload`. Two extensions ride on the
//! standard tags: binary subtype `0x04` is a 16-byte GUID, and the
//! `MinValue`/`MaxValue` tags (`0xFF`/`0x7F`) may appear as element values.
//! DateTime is milliseconds since the Unix epoch. CStrings must not contain
//! an interior NUL.

use crate::bson::BsonValue;
use crate::collation::Collation;
use crate::{Error, Result};
use std::cmp::Ordering;

// wire tags
const TAG_DOUBLE: u8 = 0x01;
const TAG_STRING: u8 = 0x02;
const TAG_DOCUMENT: u8 = 0x03;
const TAG_ARRAY: u8 = 0x04;
const TAG_BINARY: u8 = 0x05;
const TAG_OBJECT_ID: u8 = 0x07;
const TAG_BOOLEAN: u8 = 0x08;
const TAG_DATE_TIME: u8 = 0x09;
const TAG_NULL: u8 = 0x0A;
const TAG_INT32: u8 = 0x10;
const TAG_INT64: u8 = 0x12;
const TAG_MAX: u8 = 0x7F;
const TAG_MIN: u8 = 0xFF;

const SUBTYPE_GENERIC: u8 = 0x00;
const SUBTYPE_GUID: u8 = 0x04;

/// Insertion-ordered key/value document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BsonDocument {
    fields: Vec<(String, BsonValue)>,
}

impl BsonDocument {
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    pub fn get(&self, key: &str) -> Option<&BsonValue> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Inserts or replaces a field, keeping first-insertion order.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<BsonValue>) -> &mut Self {
        let key = key.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some((_, v)) => *v = value,
            None => self.fields.push((key, value)),
        }
        self
    }

    pub fn remove(&mut self, key: &str) -> Option<BsonValue> {
        let idx = self.fields.iter().position(|(k, _)| k == key)?;
        Some(self.fields.remove(idx).1)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &BsonValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Array items as a positional document (`"0"`, `"1"`, ...), the wire
    /// representation of arrays.
    pub(crate) fn from_array_items(items: &[BsonValue]) -> Self {
        let mut doc = Self::new();
        for (i, item) in items.iter().enumerate() {
            doc.fields.push((i.to_string(), item.clone()));
        }
        doc
    }

    pub(crate) fn into_array_items(self) -> Vec<BsonValue> {
        self.fields.into_iter().map(|(_, v)| v).collect()
    }

    /// Field-by-field comparison: keys in order, then values, then length.
    pub fn compare(&self, other: &BsonDocument, collation: &Collation) -> Ordering {
        for ((lk, lv), (rk, rv)) in self.fields.iter().zip(other.fields.iter()) {
            match lk.cmp(rk) {
                Ordering::Equal => {}
                other => return other,
            }
            match lv.compare(rv, collation) {
                Ordering::Equal => {}
                other => return other,
            }
        }
        self.fields.len().cmp(&other.fields.len())
    }

    // -------------------------------------------------------------------------
    // encode
    // -------------------------------------------------------------------------

    /// Total serialized length including the length prefix and terminator.
    pub fn encoded_length(&self) -> usize {
        let mut len = 4 + 1; // length prefix + terminator
        for (key, value) in &self.fields {
            len += 1 + key.len() + 1 + value_length(value);
        }
        len
    }

    pub fn encode(&self) -> Vec<u8> {
        let total = self.encoded_length();
        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&(total as i32).to_le_bytes());
        for (key, value) in &self.fields {
            write_element(&mut out, key, value);
        }
        out.push(0x00);
        debug_assert_eq!(out.len(), total);
        out
    }

    /// Encode, rejecting interior-NUL keys up front.
    pub fn try_encode(&self) -> Result<Vec<u8>> {
        self.validate_keys()?;
        Ok(self.encode())
    }

    fn validate_keys(&self) -> Result<()> {
        for (key, value) in &self.fields {
            if key.as_bytes().contains(&0) {
                return Err(Error::InvalidBson(format!(
                    "field name {key:?} contains an interior NUL"
                )));
            }
            match value {
                BsonValue::Document(d) => d.validate_keys()?,
                BsonValue::Array(items) => {
                    for item in items {
                        if let BsonValue::Document(d) = item {
                            d.validate_keys()?;
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // decode
    // -------------------------------------------------------------------------

    pub fn decode(data: &[u8]) -> Result<Self> {
        let (doc, used) = Self::decode_prefix(data)?;
        if used != data.len() {
            return Err(Error::InvalidBson(format!(
                "{} trailing bytes after document",
                data.len() - used
            )));
        }
        Ok(doc)
    }

    /// Decodes a document from the front of `data`, returning bytes consumed.
    fn decode_prefix(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < 5 {
            return Err(Error::InvalidBson("document shorter than framing".into()));
        }
        let total = i32::from_le_bytes(data[..4].try_into().unwrap()) as usize;
        if total < 5 || total > data.len() {
            return Err(Error::InvalidBson(format!(
                "document length {total} out of bounds"
            )));
        }
        if data[total - 1] != 0x00 {
            return Err(Error::InvalidBson("missing document terminator".into()));
        }

        let mut doc = Self::new();
        let mut pos = 4;
        while pos < total - 1 {
            let tag = data[pos];
            pos += 1;
            let (key, key_len) = read_cstring(&data[pos..total - 1])?;
            pos += key_len;
            let (value, value_len) = read_value(tag, &data[pos..total - 1])?;
            pos += value_len;
            doc.fields.push((key, value));
        }
        if pos != total - 1 {
            return Err(Error::InvalidBson("element overruns document".into()));
        }
        Ok((doc, total))
    }
}

fn value_length(value: &BsonValue) -> usize {
    match value {
        BsonValue::Null | BsonValue::MinValue | BsonValue::MaxValue => 0,
        BsonValue::Int32(_) => 4,
        BsonValue::Int64(_) | BsonValue::Double(_) | BsonValue::DateTime(_) => 8,
        BsonValue::Boolean(_) => 1,
        BsonValue::String(s) => 4 + s.len() + 1,
        BsonValue::Document(d) => d.encoded_length(),
        BsonValue::Array(items) => BsonDocument::from_array_items(items).encoded_length(),
        BsonValue::Binary(b) => 4 + 1 + b.len(),
        BsonValue::Guid(_) => 4 + 1 + 16,
        BsonValue::ObjectId(_) => 12,
    }
}

fn write_element(out: &mut Vec<u8>, key: &str, value: &BsonValue) {
    let tag = match value {
        BsonValue::Double(_) => TAG_DOUBLE,
        BsonValue::String(_) => TAG_STRING,
        BsonValue::Document(_) => TAG_DOCUMENT,
        BsonValue::Array(_) => TAG_ARRAY,
        BsonValue::Binary(_) | BsonValue::Guid(_) => TAG_BINARY,
        BsonValue::ObjectId(_) => TAG_OBJECT_ID,
        BsonValue::Boolean(_) => TAG_BOOLEAN,
        BsonValue::DateTime(_) => TAG_DATE_TIME,
        BsonValue::Null => TAG_NULL,
        BsonValue::Int32(_) => TAG_INT32,
        BsonValue::Int64(_) => TAG_INT64,
        BsonValue::MaxValue => TAG_MAX,
        BsonValue::MinValue => TAG_MIN,
    };
    out.push(tag);
    out.extend_from_slice(key.as_bytes());
    out.push(0x00);

    match value {
        BsonValue::Null | BsonValue::MinValue | BsonValue::MaxValue => {}
        BsonValue::Double(v) => out.extend_from_slice(&v.to_le_bytes()),
        BsonValue::Int32(v) => out.extend_from_slice(&v.to_le_bytes()),
        BsonValue::Int64(v) | BsonValue::DateTime(v) => out.extend_from_slice(&v.to_le_bytes()),
        BsonValue::Boolean(v) => out.push(*v as u8),
        BsonValue::String(s) => {
            out.extend_from_slice(&((s.len() + 1) as i32).to_le_bytes());
            out.extend_from_slice(s.as_bytes());
            out.push(0x00);
        }
        BsonValue::Document(d) => out.extend_from_slice(&d.encode()),
        BsonValue::Array(items) => {
            out.extend_from_slice(&BsonDocument::from_array_items(items).encode())
        }
        BsonValue::Binary(b) => {
            out.extend_from_slice(&(b.len() as i32).to_le_bytes());
            out.push(SUBTYPE_GENERIC);
            out.extend_from_slice(b);
        }
        BsonValue::Guid(g) => {
            out.extend_from_slice(&16i32.to_le_bytes());
            out.push(SUBTYPE_GUID);
            out.extend_from_slice(g);
        }
        BsonValue::ObjectId(o) => out.extend_from_slice(o),
    }
}

fn read_cstring(data: &[u8]) -> Result<(String, usize)> {
    let nul = data
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::InvalidBson("unterminated cstring".into()))?;
    let text = std::str::from_utf8(&data[..nul])
        .map_err(|_| Error::InvalidBson("cstring is not utf-8".into()))?;
    Ok((text.to_string(), nul + 1))
}

fn read_value(tag: u8, data: &[u8]) -> Result<(BsonValue, usize)> {
    fn fixed<const N: usize>(data: &[u8]) -> Result<[u8; N]> {
        data.get(..N)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| Error::InvalidBson("truncated element value".into()))
    }

    Ok(match tag {
        TAG_NULL => (BsonValue::Null, 0),
        TAG_MIN => (BsonValue::MinValue, 0),
        TAG_MAX => (BsonValue::MaxValue, 0),
        TAG_DOUBLE => (BsonValue::Double(f64::from_le_bytes(fixed(data)?)), 8),
        TAG_INT32 => (BsonValue::Int32(i32::from_le_bytes(fixed(data)?)), 4),
        TAG_INT64 => (BsonValue::Int64(i64::from_le_bytes(fixed(data)?)), 8),
        TAG_DATE_TIME => (BsonValue::DateTime(i64::from_le_bytes(fixed(data)?)), 8),
        TAG_BOOLEAN => {
            let b = *data
                .first()
                .ok_or_else(|| Error::InvalidBson("truncated boolean".into()))?;
            (BsonValue::Boolean(b != 0), 1)
        }
        TAG_OBJECT_ID => (BsonValue::ObjectId(fixed(data)?), 12),
        TAG_STRING => {
            let len = i32::from_le_bytes(fixed(data)?) as usize;
            if len < 1 || data.len() < 4 + len {
                return Err(Error::InvalidBson("bad string length".into()));
            }
            if data[4 + len - 1] != 0 {
                return Err(Error::InvalidBson("string missing terminator".into()));
            }
            let text = std::str::from_utf8(&data[4..4 + len - 1])
                .map_err(|_| Error::InvalidBson("string is not utf-8".into()))?;
            (BsonValue::String(text.to_string()), 4 + len)
        }
        TAG_BINARY => {
            let len = i32::from_le_bytes(fixed(data)?) as usize;
            if data.len() < 4 + 1 + len {
                return Err(Error::InvalidBson("bad binary length".into()));
            }
            let subtype = data[4];
            let bytes = &data[5..5 + len];
            let value = match subtype {
                SUBTYPE_GUID if len == 16 => {
                    BsonValue::Guid(bytes.try_into().expect("checked length"))
                }
                _ => BsonValue::Binary(bytes.to_vec()),
            };
            (value, 4 + 1 + len)
        }
        TAG_DOCUMENT => {
            let (doc, used) = BsonDocument::decode_prefix(data)?;
            (BsonValue::Document(doc), used)
        }
        TAG_ARRAY => {
            let (doc, used) = BsonDocument::decode_prefix(data)?;
            (BsonValue::Array(doc.into_array_items()), used)
        }
        other => {
            return Err(Error::InvalidBson(format!(
                "unknown element tag 0x{other:02x}"
            )))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BsonDocument {
        let mut inner = BsonDocument::new();
        inner.insert("city", "porto");

        let mut doc = BsonDocument::new();
        doc.insert("_id", 1i32);
        doc.insert("name", "alice");
        doc.insert("score", 99.5f64);
        doc.insert("big", 1i64 << 40);
        doc.insert("ok", true);
        doc.insert("none", BsonValue::Null);
        doc.insert("when", BsonValue::DateTime(1_700_000_000_000));
        doc.insert("raw", BsonValue::Binary(vec![0xDE, 0xAD]));
        doc.insert("guid", BsonValue::Guid([7; 16]));
        doc.insert("oid", BsonValue::ObjectId([1; 12]));
        doc.insert("addr", BsonValue::Document(inner));
        doc.insert(
            "tags",
            BsonValue::Array(vec!["a".into(), "b".into(), BsonValue::Int32(3)]),
        );
        doc
    }

    #[test]
    fn encode_decode_round_trip_is_exact() {
        let doc = sample();
        let bytes = doc.try_encode().unwrap();
        assert_eq!(bytes.len(), doc.encoded_length());

        let decoded = BsonDocument::decode(&bytes).unwrap();
        assert_eq!(decoded, doc);
    }

    #[test]
    fn guid_round_trips_through_binary_subtype() {
        let mut doc = BsonDocument::new();
        doc.insert("g", BsonValue::Guid([0xAB; 16]));
        let bytes = doc.encode();

        // tag, "g\0", i32 len, subtype
        assert_eq!(bytes[4], TAG_BINARY);
        assert_eq!(bytes[11], SUBTYPE_GUID);

        let decoded = BsonDocument::decode(&bytes).unwrap();
        assert_eq!(decoded.get("g"), Some(&BsonValue::Guid([0xAB; 16])));
    }

    #[test]
    fn insert_replaces_in_place() {
        let mut doc = BsonDocument::new();
        doc.insert("a", 1i32);
        doc.insert("b", 2i32);
        doc.insert("a", 3i32);

        assert_eq!(doc.len(), 2);
        assert_eq!(doc.get("a"), Some(&BsonValue::Int32(3)));
        assert_eq!(doc.iter().next().unwrap().0, "a");
    }

    #[test]
    fn interior_nul_in_key_is_rejected() {
        let mut doc = BsonDocument::new();
        doc.insert("bad\0key", 1i32);
        assert!(doc.try_encode().is_err());
    }

    #[test]
    fn truncated_document_is_rejected() {
        let bytes = sample().encode();
        assert!(BsonDocument::decode(&bytes[..bytes.len() - 2]).is_err());
        assert!(BsonDocument::decode(&bytes[..3]).is_err());
    }

    #[test]
    fn empty_document_is_five_bytes() {
        let doc = BsonDocument::new();
        let bytes = doc.encode();
        assert_eq!(bytes, vec![5, 0, 0, 0, 0]);
        assert_eq!(BsonDocument::decode(&bytes).unwrap(), doc);
    }
}
