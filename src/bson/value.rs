//! Tagged value union and the index-key codec.
//!
//! Values are stored inline using enum variants; only strings, binaries and
//! containers allocate. Comparison is total across types so a skip list can
//! hold heterogeneous keys between its `MinValue`/`MaxValue` sentinels.

use std::cmp::Ordering;

use crate::bson::BsonDocument;
use crate::collation::Collation;
use crate::{Error, Result};

/// All value types a document field or index key can hold.
#[derive(Debug, Clone, PartialEq)]
pub enum BsonValue {
    /// Sorts before every other value; reserved for index head sentinels.
    MinValue,
    Null,
    Int32(i32),
    Int64(i64),
    Double(f64),
    String(String),
    Document(BsonDocument),
    Array(Vec<BsonValue>),
    Binary(Vec<u8>),
    /// 16-byte GUID, stored as binary subtype 0x04 in documents.
    Guid([u8; 16]),
    ObjectId([u8; 12]),
    Boolean(bool),
    /// Milliseconds since 1970-01-01T00:00:00Z.
    DateTime(i64),
    /// Sorts after every other value; reserved for index tail sentinels.
    MaxValue,
}

// index-key codec tags (not the document wire tags)
const KEY_MIN: u8 = 0;
const KEY_NULL: u8 = 1;
const KEY_INT32: u8 = 2;
const KEY_INT64: u8 = 3;
const KEY_DOUBLE: u8 = 4;
const KEY_STRING: u8 = 5;
const KEY_DOCUMENT: u8 = 6;
const KEY_ARRAY: u8 = 7;
const KEY_BINARY: u8 = 8;
const KEY_GUID: u8 = 9;
const KEY_OBJECT_ID: u8 = 10;
const KEY_BOOLEAN: u8 = 11;
const KEY_DATE_TIME: u8 = 12;
const KEY_MAX: u8 = 13;

impl BsonValue {
    pub fn is_null(&self) -> bool {
        matches!(self, BsonValue::Null)
    }

    pub fn is_min_or_max(&self) -> bool {
        matches!(self, BsonValue::MinValue | BsonValue::MaxValue)
    }

    pub fn is_number(&self) -> bool {
        matches!(
            self,
            BsonValue::Int32(_) | BsonValue::Int64(_) | BsonValue::Double(_)
        )
    }

    fn type_order(&self) -> u8 {
        match self {
            BsonValue::MinValue => 0,
            BsonValue::Null => 1,
            BsonValue::Int32(_) | BsonValue::Int64(_) | BsonValue::Double(_) => 2,
            BsonValue::String(_) => 3,
            BsonValue::Document(_) => 4,
            BsonValue::Array(_) => 5,
            BsonValue::Binary(_) | BsonValue::Guid(_) => 6,
            BsonValue::ObjectId(_) => 7,
            BsonValue::Boolean(_) => 8,
            BsonValue::DateTime(_) => 9,
            BsonValue::MaxValue => 10,
        }
    }

    /// Total ordering across all value types. Numbers compare by value,
    /// strings under `collation`, everything else within its own type.
    pub fn compare(&self, other: &BsonValue, collation: &Collation) -> Ordering {
        use BsonValue::*;

        let (lt, rt) = (self.type_order(), other.type_order());
        if lt != rt {
            return lt.cmp(&rt);
        }

        match (self, other) {
            (MinValue, MinValue) | (Null, Null) | (MaxValue, MaxValue) => Ordering::Equal,

            (Int32(l), Int32(r)) => l.cmp(r),
            (Int64(l), Int64(r)) => l.cmp(r),
            (Int32(l), Int64(r)) => (*l as i64).cmp(r),
            (Int64(l), Int32(r)) => l.cmp(&(*r as i64)),
            (Double(l), Double(r)) => l.partial_cmp(r).unwrap_or(Ordering::Equal),
            (l, r) if l.is_number() && r.is_number() => {
                let lf = l.as_f64();
                let rf = r.as_f64();
                lf.partial_cmp(&rf).unwrap_or(Ordering::Equal)
            }

            (String(l), String(r)) => collation.compare(l, r),

            (Document(l), Document(r)) => l.compare(r, collation),

            (Array(l), Array(r)) => {
                for (lv, rv) in l.iter().zip(r.iter()) {
                    match lv.compare(rv, collation) {
                        Ordering::Equal => continue,
                        other => return other,
                    }
                }
                l.len().cmp(&r.len())
            }

            (Binary(l), Binary(r)) => l.cmp(r),
            (Guid(l), Guid(r)) => l.cmp(r),
            (Binary(l), Guid(r)) => l.as_slice().cmp(&r[..]),
            (Guid(l), Binary(r)) => l[..].cmp(r.as_slice()),

            (ObjectId(l), ObjectId(r)) => l.cmp(r),
            (Boolean(l), Boolean(r)) => l.cmp(r),
            (DateTime(l), DateTime(r)) => l.cmp(r),

            _ => unreachable!("same type_order implies comparable variants"),
        }
    }

    fn as_f64(&self) -> f64 {
        match self {
            BsonValue::Int32(v) => *v as f64,
            BsonValue::Int64(v) => *v as f64,
            BsonValue::Double(v) => *v,
            _ => f64::NAN,
        }
    }

    // -------------------------------------------------------------------------
    // index-key codec
    // -------------------------------------------------------------------------

    /// Serialized index-key length in bytes, including the tag byte.
    pub fn key_length(&self) -> usize {
        1 + match self {
            BsonValue::MinValue | BsonValue::Null | BsonValue::MaxValue => 0,
            BsonValue::Int32(_) => 4,
            BsonValue::Int64(_) | BsonValue::Double(_) | BsonValue::DateTime(_) => 8,
            BsonValue::String(s) => 2 + s.len(),
            BsonValue::Document(d) => 2 + d.encoded_length(),
            BsonValue::Array(items) => {
                2 + BsonDocument::from_array_items(items).encoded_length()
            }
            BsonValue::Binary(b) => 2 + b.len(),
            BsonValue::Guid(_) => 16,
            BsonValue::ObjectId(_) => 12,
            BsonValue::Boolean(_) => 1,
        }
    }

    /// Appends the compact key encoding to `out`.
    pub fn write_key(&self, out: &mut Vec<u8>) -> Result<()> {
        match self {
            BsonValue::MinValue => out.push(KEY_MIN),
            BsonValue::Null => out.push(KEY_NULL),
            BsonValue::MaxValue => out.push(KEY_MAX),
            BsonValue::Int32(v) => {
                out.push(KEY_INT32);
                out.extend_from_slice(&v.to_le_bytes());
            }
            BsonValue::Int64(v) => {
                out.push(KEY_INT64);
                out.extend_from_slice(&v.to_le_bytes());
            }
            BsonValue::Double(v) => {
                out.push(KEY_DOUBLE);
                out.extend_from_slice(&v.to_le_bytes());
            }
            BsonValue::DateTime(v) => {
                out.push(KEY_DATE_TIME);
                out.extend_from_slice(&v.to_le_bytes());
            }
            BsonValue::String(s) => {
                out.push(KEY_STRING);
                write_len_prefixed(out, s.as_bytes())?;
            }
            BsonValue::Document(d) => {
                out.push(KEY_DOCUMENT);
                write_len_prefixed(out, &d.encode())?;
            }
            BsonValue::Array(items) => {
                out.push(KEY_ARRAY);
                write_len_prefixed(out, &BsonDocument::from_array_items(items).encode())?;
            }
            BsonValue::Binary(b) => {
                out.push(KEY_BINARY);
                write_len_prefixed(out, b)?;
            }
            BsonValue::Guid(g) => {
                out.push(KEY_GUID);
                out.extend_from_slice(g);
            }
            BsonValue::ObjectId(o) => {
                out.push(KEY_OBJECT_ID);
                out.extend_from_slice(o);
            }
            BsonValue::Boolean(b) => {
                out.push(KEY_BOOLEAN);
                out.push(*b as u8);
            }
        }
        Ok(())
    }

    /// Decodes one key from the front of `data`, returning the value and
    /// the number of bytes consumed.
    pub fn read_key(data: &[u8]) -> Result<(BsonValue, usize)> {
        let tag = *data
            .first()
            .ok_or_else(|| Error::InvalidBson("empty index key".into()))?;
        let body = &data[1..];

        let (value, body_len) = match tag {
            KEY_MIN => (BsonValue::MinValue, 0),
            KEY_NULL => (BsonValue::Null, 0),
            KEY_MAX => (BsonValue::MaxValue, 0),
            KEY_INT32 => (BsonValue::Int32(i32::from_le_bytes(take(body, 0)?)), 4),
            KEY_INT64 => (BsonValue::Int64(i64::from_le_bytes(take(body, 0)?)), 8),
            KEY_DOUBLE => (BsonValue::Double(f64::from_le_bytes(take(body, 0)?)), 8),
            KEY_DATE_TIME => (BsonValue::DateTime(i64::from_le_bytes(take(body, 0)?)), 8),
            KEY_BOOLEAN => {
                let b = *body
                    .first()
                    .ok_or_else(|| Error::InvalidBson("truncated boolean key".into()))?;
                (BsonValue::Boolean(b != 0), 1)
            }
            KEY_GUID => (BsonValue::Guid(take(body, 0)?), 16),
            KEY_OBJECT_ID => (BsonValue::ObjectId(take(body, 0)?), 12),
            KEY_STRING => {
                let (bytes, used) = read_len_prefixed(body)?;
                let text = std::str::from_utf8(bytes)
                    .map_err(|_| Error::InvalidBson("index key is not utf-8".into()))?;
                (BsonValue::String(text.to_string()), used)
            }
            KEY_BINARY => {
                let (bytes, used) = read_len_prefixed(body)?;
                (BsonValue::Binary(bytes.to_vec()), used)
            }
            KEY_DOCUMENT => {
                let (bytes, used) = read_len_prefixed(body)?;
                (BsonValue::Document(BsonDocument::decode(bytes)?), used)
            }
            KEY_ARRAY => {
                let (bytes, used) = read_len_prefixed(body)?;
                let doc = BsonDocument::decode(bytes)?;
                (BsonValue::Array(doc.into_array_items()), used)
            }
            other => {
                return Err(Error::InvalidBson(format!(
                    "unknown index key tag 0x{other:02x}"
                )))
            }
        };

        Ok((value, 1 + body_len))
    }
}

fn write_len_prefixed(out: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
    let len = u16::try_from(bytes.len())
        .map_err(|_| Error::InvalidIndexKey("key longer than 65535 bytes".into()))?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

fn read_len_prefixed(data: &[u8]) -> Result<(&[u8], usize)> {
    let len_bytes: [u8; 2] = take(data, 0)?;
    let len = u16::from_le_bytes(len_bytes) as usize;
    let end = 2 + len;
    if data.len() < end {
        return Err(Error::InvalidBson("truncated length-prefixed key".into()));
    }
    Ok((&data[2..end], end))
}

fn take<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N]> {
    data.get(offset..offset + N)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| Error::InvalidBson("truncated value".into()))
}

impl From<i32> for BsonValue {
    fn from(v: i32) -> Self {
        BsonValue::Int32(v)
    }
}

impl From<i64> for BsonValue {
    fn from(v: i64) -> Self {
        BsonValue::Int64(v)
    }
}

impl From<f64> for BsonValue {
    fn from(v: f64) -> Self {
        BsonValue::Double(v)
    }
}

impl From<&str> for BsonValue {
    fn from(v: &str) -> Self {
        BsonValue::String(v.to_string())
    }
}

impl From<String> for BsonValue {
    fn from(v: String) -> Self {
        BsonValue::String(v)
    }
}

impl From<bool> for BsonValue {
    fn from(v: bool) -> Self {
        BsonValue::Boolean(v)
    }
}
