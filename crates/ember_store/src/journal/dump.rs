//! Native binary encoding of values, used by RESTORE emission.
//!
//! Layout: type tag byte, type-specific payload with varint lengths, then a
//! CRC32 of everything preceding it.

use std::collections::{HashMap, HashSet, VecDeque};

use bytes::Bytes;

use crate::journal::serializer::{read_varint, write_varint};
use crate::value::{PrimeValue, ValueKind};

const TAG_STRING: u8 = 0;
const TAG_LIST: u8 = 1;
const TAG_SET: u8 = 2;
const TAG_ZSET: u8 = 3;
const TAG_HASH: u8 = 4;
const TAG_STREAM: u8 = 5;
const TAG_JSON: u8 = 6;

fn write_blob(buf: &mut Vec<u8>, data: &[u8]) {
    write_varint(buf, data.len() as u64);
    buf.extend_from_slice(data);
}

fn read_blob(input: &mut &[u8]) -> anyhow::Result<Bytes> {
    let len = read_varint(input)? as usize;
    anyhow::ensure!(input.len() >= len, "truncated dump blob");
    let (data, rest) = input.split_at(len);
    *input = rest;
    Ok(Bytes::copy_from_slice(data))
}

/// Serialize a resident value. Offloaded strings must be resolved first.
pub fn dump_value(pv: &PrimeValue) -> anyhow::Result<Bytes> {
    let mut buf = Vec::new();
    match pv.kind() {
        ValueKind::Str(_) => {
            let raw = pv
                .get_string()
                .ok_or_else(|| anyhow::anyhow!("cannot dump an offloaded string"))?;
            buf.push(TAG_STRING);
            write_blob(&mut buf, &raw);
        }
        ValueKind::List(items) => {
            buf.push(TAG_LIST);
            write_varint(&mut buf, items.len() as u64);
            for item in items {
                write_blob(&mut buf, item);
            }
        }
        ValueKind::Set(items) => {
            buf.push(TAG_SET);
            write_varint(&mut buf, items.len() as u64);
            for item in items {
                write_blob(&mut buf, item);
            }
        }
        ValueKind::ZSet(items) => {
            buf.push(TAG_ZSET);
            write_varint(&mut buf, items.len() as u64);
            for (score, member) in items {
                buf.extend_from_slice(&score.to_le_bytes());
                write_blob(&mut buf, member);
            }
        }
        ValueKind::Hash(items) => {
            buf.push(TAG_HASH);
            write_varint(&mut buf, items.len() as u64);
            for (field, value) in items {
                write_blob(&mut buf, field);
                write_blob(&mut buf, value);
            }
        }
        ValueKind::Stream(items) => {
            buf.push(TAG_STREAM);
            write_varint(&mut buf, items.len() as u64);
            for (id, payload) in items {
                write_varint(&mut buf, *id);
                write_blob(&mut buf, payload);
            }
        }
        ValueKind::Json(value) => {
            buf.push(TAG_JSON);
            let text = serde_json::to_vec(value)?;
            write_blob(&mut buf, &text);
        }
    }

    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(Bytes::from(buf))
}

/// Decode a dump produced by [`dump_value`], verifying the checksum.
pub fn load_value(data: &[u8]) -> anyhow::Result<PrimeValue> {
    anyhow::ensure!(data.len() >= 5, "dump too short");
    let (payload, crc_bytes) = data.split_at(data.len() - 4);
    let expected = u32::from_le_bytes(crc_bytes.try_into().expect("4 byte split"));
    anyhow::ensure!(crc32fast::hash(payload) == expected, "dump checksum mismatch");

    let mut input = payload;
    let (&tag, rest) = input.split_first().expect("length checked above");
    input = rest;

    let kind = match tag {
        TAG_STRING => {
            let raw = read_blob(&mut input)?;
            return Ok(PrimeValue::new_string(&raw));
        }
        TAG_LIST => {
            let count = read_varint(&mut input)? as usize;
            let mut items = VecDeque::with_capacity(count.min(1024));
            for _ in 0..count {
                items.push_back(read_blob(&mut input)?);
            }
            ValueKind::List(items)
        }
        TAG_SET => {
            let count = read_varint(&mut input)? as usize;
            let mut items = HashSet::with_capacity(count.min(1024));
            for _ in 0..count {
                items.insert(read_blob(&mut input)?);
            }
            ValueKind::Set(items)
        }
        TAG_ZSET => {
            let count = read_varint(&mut input)? as usize;
            let mut items = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                anyhow::ensure!(input.len() >= 8, "truncated zset score");
                let (score_bytes, rest) = input.split_at(8);
                input = rest;
                let score = f64::from_le_bytes(score_bytes.try_into().expect("8 byte split"));
                items.push((score, read_blob(&mut input)?));
            }
            ValueKind::ZSet(items)
        }
        TAG_HASH => {
            let count = read_varint(&mut input)? as usize;
            let mut items = HashMap::with_capacity(count.min(1024));
            for _ in 0..count {
                let field = read_blob(&mut input)?;
                let value = read_blob(&mut input)?;
                items.insert(field, value);
            }
            ValueKind::Hash(items)
        }
        TAG_STREAM => {
            let count = read_varint(&mut input)? as usize;
            let mut items = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                let id = read_varint(&mut input)?;
                items.push((id, read_blob(&mut input)?));
            }
            ValueKind::Stream(items)
        }
        TAG_JSON => {
            let text = read_blob(&mut input)?;
            ValueKind::Json(serde_json::from_slice(&text)?)
        }
        other => anyhow::bail!("unknown dump tag {other}"),
    };
    anyhow::ensure!(input.is_empty(), "trailing bytes in dump");
    Ok(PrimeValue::new(kind))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn string_dump_round_trips() {
        let pv = PrimeValue::new_string(b"hello world");
        let dump = dump_value(&pv).unwrap();
        let loaded = load_value(&dump).unwrap();
        assert_eq!(loaded.get_string().unwrap(), b("hello world"));
    }

    #[test]
    fn container_dumps_round_trip() {
        let list = PrimeValue::new(ValueKind::List(VecDeque::from([b("a"), b("b"), b("c")])));
        let set = PrimeValue::new(ValueKind::Set(HashSet::from([b("x"), b("y")])));
        let zset = PrimeValue::new(ValueKind::ZSet(vec![(1.5, b("one")), (2.0, b("two"))]));
        let hash = PrimeValue::new(ValueKind::Hash(HashMap::from([(b("f"), b("v"))])));

        for pv in [&list, &set, &zset, &hash] {
            let dump = dump_value(pv).unwrap();
            let loaded = load_value(&dump).unwrap();
            match (pv.kind(), loaded.kind()) {
                (ValueKind::List(a), ValueKind::List(c)) => assert_eq!(a, c),
                (ValueKind::Set(a), ValueKind::Set(c)) => assert_eq!(a, c),
                (ValueKind::ZSet(a), ValueKind::ZSet(c)) => assert_eq!(a, c),
                (ValueKind::Hash(a), ValueKind::Hash(c)) => assert_eq!(a, c),
                _ => panic!("kind changed across dump/load"),
            }
        }
    }

    #[test]
    fn corrupted_dump_is_rejected() {
        let pv = PrimeValue::new_string(b"payload");
        let mut dump = dump_value(&pv).unwrap().to_vec();
        dump[2] ^= 0xff;
        assert!(load_value(&dump).is_err());
    }
}
