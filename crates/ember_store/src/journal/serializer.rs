//! Wire framing of journal records.
//!
//! Frame: opcode byte, then opcode-dependent fields encoded as LEB128
//! varints. Command records carry txid, dbid, shard count, an optional slot
//! (presence byte + varint), the command name as a length-prefixed byte
//! string, and an argument count followed by length-prefixed arguments.

use bytes::Bytes;

use crate::journal::types::{Entry, Op};

pub fn write_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

pub fn read_varint(input: &mut &[u8]) -> anyhow::Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let (&byte, rest) = input
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("truncated varint"))?;
        *input = rest;
        anyhow::ensure!(shift < 64, "varint too long");
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

fn write_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    write_varint(buf, data.len() as u64);
    buf.extend_from_slice(data);
}

fn read_bytes(input: &mut &[u8]) -> anyhow::Result<Bytes> {
    let len = read_varint(input)? as usize;
    anyhow::ensure!(input.len() >= len, "truncated byte string");
    let (data, rest) = input.split_at(len);
    *input = rest;
    Ok(Bytes::copy_from_slice(data))
}

/// Append the serialized form of `entry` to `buf`.
pub fn write_entry(buf: &mut Vec<u8>, entry: &Entry) {
    buf.push(entry.opcode as u8);
    match entry.opcode {
        Op::Noop => {}
        Op::Select => write_varint(buf, u64::from(entry.dbid)),
        Op::Lsn => write_varint(buf, entry.lsn),
        Op::Command => {
            write_varint(buf, entry.txid);
            write_varint(buf, u64::from(entry.dbid));
            write_varint(buf, u64::from(entry.shard_cnt));
            match entry.slot {
                Some(slot) => {
                    buf.push(1);
                    write_varint(buf, u64::from(slot));
                }
                None => buf.push(0),
            }
            write_bytes(buf, entry.cmd.as_bytes());
            write_varint(buf, entry.args.len() as u64);
            for arg in &entry.args {
                write_bytes(buf, arg);
            }
        }
    }
}

/// Serialize a single entry into a fresh buffer.
pub fn serialize_entry(entry: &Entry) -> Bytes {
    let mut buf = Vec::new();
    write_entry(&mut buf, entry);
    Bytes::from(buf)
}

/// Parse one record from the front of `input`, advancing it.
pub fn read_entry(input: &mut &[u8]) -> anyhow::Result<Entry> {
    let (&opcode, rest) = input
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("empty journal record"))?;
    *input = rest;
    let opcode = Op::from_u8(opcode)?;

    let mut entry = Entry::noop();
    entry.opcode = opcode;
    match opcode {
        Op::Noop => {}
        Op::Select => entry.dbid = u16::try_from(read_varint(input)?)?,
        Op::Lsn => entry.lsn = read_varint(input)?,
        Op::Command => {
            entry.txid = read_varint(input)?;
            entry.dbid = u16::try_from(read_varint(input)?)?;
            entry.shard_cnt = u32::try_from(read_varint(input)?)?;
            let (&has_slot, rest) = input
                .split_first()
                .ok_or_else(|| anyhow::anyhow!("truncated slot flag"))?;
            *input = rest;
            entry.slot = match has_slot {
                0 => None,
                1 => Some(u16::try_from(read_varint(input)?)?),
                other => anyhow::bail!("invalid slot presence byte {other}"),
            };
            let cmd = read_bytes(input)?;
            entry.cmd = String::from_utf8(cmd.to_vec())
                .map_err(|_| anyhow::anyhow!("command name is not utf-8"))?;
            let argc = read_varint(input)? as usize;
            anyhow::ensure!(argc <= input.len(), "argument count exceeds payload");
            let mut args = Vec::with_capacity(argc);
            for _ in 0..argc {
                args.push(read_bytes(input)?);
            }
            entry.args = args;
        }
    }
    Ok(entry)
}
