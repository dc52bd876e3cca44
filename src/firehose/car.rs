//! CAR (content-addressed archive) block-store reader.
//!
//! Each commit event carries its record blocks as a CAR v1 byte string:
//! a varint-prefixed CBOR header followed by varint-prefixed sections of
//! `CID || block bytes`. We only need CID -> bytes lookups, so blocks are
//! read into a flat map and the header roots are ignored.

use super::cbor::Cid;
use crate::{Error, Result};
use std::collections::HashMap;

/// Parsed block store for one commit event.
#[derive(Debug, Default)]
pub struct BlockStore {
    blocks: HashMap<Cid, Vec<u8>>,
}

impl BlockStore {
    /// Parse a CAR v1 archive.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor { data, pos: 0 };

        // Header section: varint length + CBOR map. Contents unused.
        let header_len = cursor.read_uvarint()? as usize;
        cursor.take(header_len)?;

        let mut blocks = HashMap::new();
        while !cursor.is_empty() {
            let section_len = cursor.read_uvarint()? as usize;
            let section = cursor.take(section_len)?;
            let (cid, body) = split_cid(section)?;
            blocks.insert(cid, body.to_vec());
        }

        Ok(Self { blocks })
    }

    /// Look up a block's raw bytes by CID.
    pub fn get(&self, cid: &Cid) -> Option<&[u8]> {
        self.blocks.get(cid).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Split a CAR section into its leading binary CID and the block body.
fn split_cid(section: &[u8]) -> Result<(Cid, &[u8])> {
    // CIDv0: bare sha2-256 multihash, fixed 34 bytes.
    if section.len() >= 34 && section[0] == 0x12 && section[1] == 0x20 {
        let (cid, body) = section.split_at(34);
        return Ok((Cid(cid.to_vec()), body));
    }

    // CIDv1: version varint, codec varint, multihash (code, size, digest).
    let mut cursor = Cursor {
        data: section,
        pos: 0,
    };
    let version = cursor.read_uvarint()?;
    if version != 1 {
        return Err(Error::Car(format!("unsupported cid version {version}")));
    }
    cursor.read_uvarint()?; // codec
    cursor.read_uvarint()?; // multihash code
    let digest_len = cursor.read_uvarint()? as usize;
    cursor.take(digest_len)?;

    let (cid, body) = section.split_at(cursor.pos);
    Ok((Cid(cid.to_vec()), body))
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| Error::Car("section exceeds archive length".to_string()))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_uvarint(&mut self) -> Result<u64> {
        let mut value: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = *self
                .data
                .get(self.pos)
                .ok_or_else(|| Error::Car("truncated varint".to_string()))?;
            self.pos += 1;
            if shift >= 64 {
                return Err(Error::Car("varint overflow".to_string()));
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn write_uvarint(buf: &mut Vec<u8>, mut value: u64) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                buf.push(byte);
                break;
            }
            buf.push(byte | 0x80);
        }
    }

    /// Build a minimal CAR v1 archive from `(cid, block)` pairs.
    pub fn build_car(blocks: &[(Cid, Vec<u8>)]) -> Vec<u8> {
        // Header payload is opaque to the parser; an empty CBOR map will do.
        let header = vec![0xa0];
        let mut out = Vec::new();
        write_uvarint(&mut out, header.len() as u64);
        out.extend_from_slice(&header);
        for (cid, body) in blocks {
            let section_len = cid.0.len() + body.len();
            write_uvarint(&mut out, section_len as u64);
            out.extend_from_slice(&cid.0);
            out.extend_from_slice(body);
        }
        out
    }

    /// A syntactically valid CIDv1 with the given digest byte.
    pub fn test_cid(marker: u8) -> Cid {
        // version 1, codec dag-cbor (0x71), sha2-256 (0x12), 4-byte digest
        Cid(vec![0x01, 0x71, 0x12, 0x04, marker, marker, marker, marker])
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{build_car, test_cid};
    use super::*;

    #[test]
    fn parses_blocks_by_cid() {
        let a = test_cid(0xaa);
        let b = test_cid(0xbb);
        let car = build_car(&[
            (a.clone(), b"first block".to_vec()),
            (b.clone(), b"second".to_vec()),
        ]);

        let store = BlockStore::parse(&car).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.get(&a), Some(b"first block".as_ref()));
        assert_eq!(store.get(&b), Some(b"second".as_ref()));
        assert_eq!(store.get(&test_cid(0xcc)), None);
    }

    #[test]
    fn empty_archive_has_no_blocks() {
        let car = build_car(&[]);
        let store = BlockStore::parse(&car).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn rejects_truncated_archive() {
        let a = test_cid(0xaa);
        let mut car = build_car(&[(a, b"block".to_vec())]);
        car.truncate(car.len() - 3);
        assert!(BlockStore::parse(&car).is_err());
    }
}
