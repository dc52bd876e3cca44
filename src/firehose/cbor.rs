//! Minimal DAG-CBOR value decoder.
//!
//! The firehose carries DAG-CBOR maps whose shapes we only partially care
//! about, so rather than generated lexicon types we decode into a generic
//! [`Value`] tree and extract the handful of fields each record needs.
//! DAG-CBOR is definite-length only; indefinite items are rejected.

use minicbor::data::Type;
use minicbor::decode::Error as DecodeError;
use minicbor::Decoder;
use std::collections::BTreeMap;

/// CID tag number in DAG-CBOR.
const CID_TAG: u64 = 42;

/// A content identifier, kept as opaque binary (version + codec + multihash).
///
/// Used only as a lookup key into a commit's CAR block store, so no multibase
/// or multihash interpretation is done.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cid(pub Vec<u8>);

impl Cid {
    /// Parse the payload of a DAG-CBOR tag-42 byte string. The payload has a
    /// single leading multibase-identity byte which is stripped.
    pub fn from_tagged_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes.split_first() {
            Some((0x00, rest)) if !rest.is_empty() => Some(Self(rest.to_vec())),
            _ => None,
        }
    }
}

/// A decoded DAG-CBOR value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Bytes(Vec<u8>),
    Text(String),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Cid(Cid),
}

impl Value {
    /// Decode a single value from `bytes`, ignoring any trailing data.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut d = Decoder::new(bytes);
        decode_value(&mut d)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_cid(&self) -> Option<&Cid> {
        match self {
            Value::Cid(c) => Some(c),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Map field lookup; `None` for non-maps and missing keys.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|m| m.get(key))
    }

    /// Like [`Value::get`] but treats an explicit CBOR null as absent.
    pub fn get_non_null(&self, key: &str) -> Option<&Value> {
        self.get(key).filter(|v| !v.is_null())
    }
}

/// Decode one value at the decoder's current position.
pub fn decode_value(d: &mut Decoder<'_>) -> Result<Value, DecodeError> {
    match d.datatype()? {
        Type::Bool => Ok(Value::Bool(d.bool()?)),
        Type::Null => {
            d.null()?;
            Ok(Value::Null)
        }
        Type::Undefined => {
            d.undefined()?;
            Ok(Value::Null)
        }
        Type::U8 | Type::U16 | Type::U32 | Type::U64 => {
            let n = d.u64()?;
            i64::try_from(n)
                .map(Value::Int)
                .map_err(|_| DecodeError::message("integer out of i64 range"))
        }
        Type::I8 | Type::I16 | Type::I32 | Type::I64 | Type::Int => Ok(Value::Int(d.i64()?)),
        Type::F16 | Type::F32 | Type::F64 => Ok(Value::Float(d.f64()?)),
        Type::Bytes => Ok(Value::Bytes(d.bytes()?.to_vec())),
        Type::String => Ok(Value::Text(d.str()?.to_string())),
        Type::Array => {
            let len = d
                .array()?
                .ok_or_else(|| DecodeError::message("indefinite array"))?;
            let mut items = Vec::with_capacity(len.min(1024) as usize);
            for _ in 0..len {
                items.push(decode_value(d)?);
            }
            Ok(Value::Array(items))
        }
        Type::Map => {
            let len = d
                .map()?
                .ok_or_else(|| DecodeError::message("indefinite map"))?;
            let mut entries = BTreeMap::new();
            for _ in 0..len {
                let key = d.str()?.to_string();
                let value = decode_value(d)?;
                entries.insert(key, value);
            }
            Ok(Value::Map(entries))
        }
        Type::Tag => {
            let tag = d.tag()?;
            if tag.as_u64() != CID_TAG {
                return Err(DecodeError::message("unsupported cbor tag"));
            }
            let bytes = d.bytes()?;
            Cid::from_tagged_bytes(bytes)
                .map(Value::Cid)
                .ok_or_else(|| DecodeError::message("malformed cid payload"))
        }
        ty => Err(DecodeError::message(format!("unsupported cbor type {ty}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minicbor::data::Tag;
    use minicbor::Encoder;

    fn encode<F>(f: F) -> Vec<u8>
    where
        F: FnOnce(&mut Encoder<&mut Vec<u8>>) -> Result<(), minicbor::encode::Error<std::convert::Infallible>>,
    {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        f(&mut enc).unwrap();
        buf
    }

    #[test]
    fn decodes_scalars() {
        let buf = encode(|e| {
            e.u64(42)?;
            Ok(())
        });
        assert_eq!(Value::decode(&buf).unwrap(), Value::Int(42));

        let buf = encode(|e| {
            e.i64(-7)?;
            Ok(())
        });
        assert_eq!(Value::decode(&buf).unwrap(), Value::Int(-7));

        let buf = encode(|e| {
            e.str("hello")?;
            Ok(())
        });
        assert_eq!(
            Value::decode(&buf).unwrap(),
            Value::Text("hello".to_string())
        );

        let buf = encode(|e| {
            e.null()?;
            Ok(())
        });
        assert!(Value::decode(&buf).unwrap().is_null());
    }

    #[test]
    fn decodes_nested_map() {
        let buf = encode(|e| {
            e.map(2)?;
            e.str("seq")?.u64(100)?;
            e.str("ops")?.array(1)?.map(1)?;
            e.str("action")?.str("create")?;
            Ok(())
        });
        let v = Value::decode(&buf).unwrap();
        assert_eq!(v.get("seq").and_then(Value::as_int), Some(100));
        let ops = v.get("ops").and_then(Value::as_array).unwrap();
        assert_eq!(
            ops[0].get("action").and_then(Value::as_str),
            Some("create")
        );
    }

    #[test]
    fn decodes_cid_tag() {
        let cid_body = vec![0x01, 0x71, 0x12, 0x04, 0xde, 0xad, 0xbe, 0xef];
        let mut payload = vec![0x00];
        payload.extend_from_slice(&cid_body);
        let buf = encode(|e| {
            e.tag(Tag::new(42))?.bytes(&payload)?;
            Ok(())
        });
        let v = Value::decode(&buf).unwrap();
        assert_eq!(v.as_cid(), Some(&Cid(cid_body)));
    }

    #[test]
    fn rejects_unknown_tag() {
        let buf = encode(|e| {
            e.tag(Tag::new(7))?.str("x")?;
            Ok(())
        });
        assert!(Value::decode(&buf).is_err());
    }

    #[test]
    fn get_non_null_treats_null_as_absent() {
        let buf = encode(|e| {
            e.map(1)?;
            e.str("prev")?.null()?;
            Ok(())
        });
        let v = Value::decode(&buf).unwrap();
        assert!(v.get("prev").is_some());
        assert!(v.get_non_null("prev").is_none());
    }
}
