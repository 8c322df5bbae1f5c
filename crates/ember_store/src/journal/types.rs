//! Journal record types.

use bytes::Bytes;

use crate::slots::SlotId;
use crate::table::DbIndex;

pub type TxId = u64;
/// Monotonically increasing sequence number of journal records.
pub type Lsn = u64;

/// Record opcodes. `Noop` exists solely to trigger back-pressure awaiting;
/// `Lsn` is a synthetic watermark record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    Noop = 0,
    Select = 6,
    Command = 10,
    Lsn = 11,
}

impl Op {
    pub fn from_u8(raw: u8) -> anyhow::Result<Self> {
        match raw {
            0 => Ok(Op::Noop),
            6 => Ok(Op::Select),
            10 => Ok(Op::Command),
            11 => Ok(Op::Lsn),
            other => anyhow::bail!("unknown journal opcode {other}"),
        }
    }
}

/// A journal record before serialization.
#[derive(Clone, Debug, PartialEq)]
pub struct Entry {
    pub opcode: Op,
    pub txid: TxId,
    pub dbid: DbIndex,
    pub shard_cnt: u32,
    pub slot: Option<SlotId>,
    /// Command name; empty for control records.
    pub cmd: String,
    pub args: Vec<Bytes>,
    /// Watermark value for `Op::Lsn` records.
    pub lsn: Lsn,
}

impl Entry {
    pub fn command(
        txid: TxId,
        dbid: DbIndex,
        shard_cnt: u32,
        slot: Option<SlotId>,
        cmd: impl Into<String>,
        args: Vec<Bytes>,
    ) -> Self {
        Self {
            opcode: Op::Command,
            txid,
            dbid,
            shard_cnt,
            slot,
            cmd: cmd.into(),
            args,
            lsn: 0,
        }
    }

    pub fn select(dbid: DbIndex) -> Self {
        Self {
            opcode: Op::Select,
            txid: 0,
            dbid,
            shard_cnt: 0,
            slot: None,
            cmd: String::new(),
            args: Vec::new(),
            lsn: 0,
        }
    }

    pub fn noop() -> Self {
        Self {
            opcode: Op::Noop,
            txid: 0,
            dbid: 0,
            shard_cnt: 0,
            slot: None,
            cmd: String::new(),
            args: Vec::new(),
            lsn: 0,
        }
    }

    pub fn lsn(value: Lsn) -> Self {
        Self {
            opcode: Op::Lsn,
            txid: 0,
            dbid: 0,
            shard_cnt: 0,
            slot: None,
            cmd: String::new(),
            args: Vec::new(),
            lsn: value,
        }
    }
}

/// A record as stored in the ring buffer and handed to subscribers.
#[derive(Clone, Debug)]
pub struct JournalItem {
    pub lsn: Lsn,
    pub opcode: Op,
    pub dbid: DbIndex,
    pub slot: Option<SlotId>,
    pub cmd: String,
    /// Serialized wire form of the record.
    pub data: Bytes,
}
