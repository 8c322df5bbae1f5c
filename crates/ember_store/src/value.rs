//! Tagged value representation for the prime table.
//!
//! A value is one of the Redis-style container kinds. String payloads can
//! additionally live in one of four tiering states: resident (inline bytes),
//! stash-pending (resident, a disk write is in flight), cool (on disk, but the
//! hot copy is retained by the cool queue) and external (on disk only).

use std::collections::{HashMap, HashSet, VecDeque};

use bytes::Bytes;

use crate::tiered::cool::CoolHandle;
use crate::tiered::disk::DiskSegment;

/// Flag: a stash write for this value is in flight.
const FLAG_STASH_PENDING: u8 = 1 << 0;
/// Flag: the key survives eviction (STICK).
const FLAG_STICKY: u8 = 1 << 1;
/// Flag: accessed since the offloader last visited it (CLOCK bit).
const FLAG_TOUCHED: u8 = 1 << 2;

/// Object kind tags, aligned with the wire-level type namespace.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjType {
    String,
    List,
    Set,
    ZSet,
    Hash,
    Stream,
    Json,
}

/// In-memory representation of a resident string.
#[derive(Clone, Debug, PartialEq)]
pub enum StrRepr {
    Raw(Bytes),
    /// Integer-encoded string; raw form is the decimal text.
    Int(i64),
}

impl StrRepr {
    pub fn from_raw(raw: &[u8]) -> Self {
        if let Ok(text) = std::str::from_utf8(raw) {
            // Reject leading zeros and "-0" so raw bytes round-trip exactly.
            if let Ok(num) = text.parse::<i64>() {
                if num.to_string().as_bytes() == raw {
                    return StrRepr::Int(num);
                }
            }
        }
        StrRepr::Raw(Bytes::copy_from_slice(raw))
    }

    pub fn raw_bytes(&self) -> Bytes {
        match self {
            StrRepr::Raw(b) => b.clone(),
            StrRepr::Int(n) => Bytes::from(n.to_string().into_bytes()),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            StrRepr::Raw(b) => b.len(),
            StrRepr::Int(n) => {
                let mut digits = if *n <= 0 { 1 } else { 0 };
                let mut v = n.unsigned_abs();
                while v > 0 {
                    digits += 1;
                    v /= 10;
                }
                digits
            }
        }
    }

    pub fn is_int(&self) -> bool {
        matches!(self, StrRepr::Int(_))
    }
}

/// Tiering state of a string payload.
#[derive(Clone, Debug)]
pub enum StrState {
    Inline(StrRepr),
    External {
        segment: DiskSegment,
        int_encoded: bool,
    },
    Cool {
        /// Offset of the serialized bytes within the record's page.
        page_offset: u32,
        len: u32,
        handle: CoolHandle,
        int_encoded: bool,
    },
}

#[derive(Clone, Debug)]
pub enum ValueKind {
    Str(StrState),
    List(VecDeque<Bytes>),
    Set(HashSet<Bytes>),
    /// Sorted by (score, member); members unique.
    ZSet(Vec<(f64, Bytes)>),
    Hash(HashMap<Bytes, Bytes>),
    /// Minimal stream representation: (sequence id, payload).
    Stream(Vec<(u64, Bytes)>),
    Json(serde_json::Value),
}

/// Decoder carrying the encoding of an offloaded string so raw disk bytes can
/// be rematerialized through it.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExternalDecoder {
    int_encoded: bool,
}

impl ExternalDecoder {
    /// Decode `raw` back into its in-memory representation. `is_raw` is false
    /// when the bytes were already decoded upstream (e.g. after a modify).
    pub fn decode(&self, raw: &[u8], is_raw: bool) -> StrRepr {
        if is_raw && self.int_encoded {
            StrRepr::from_raw(raw)
        } else {
            StrRepr::Raw(Bytes::copy_from_slice(raw))
        }
    }
}

/// Cool-state view handed to the tiered engine for warmup and delete.
#[derive(Clone, Copy, Debug)]
pub struct CoolInfo {
    pub page_offset: u32,
    pub len: u32,
    pub handle: CoolHandle,
}

#[derive(Clone, Debug)]
pub struct PrimeValue {
    flags: u8,
    kind: ValueKind,
}

impl PrimeValue {
    pub fn new_string(raw: &[u8]) -> Self {
        Self {
            flags: 0,
            kind: ValueKind::Str(StrState::Inline(StrRepr::from_raw(raw))),
        }
    }

    pub fn new(kind: ValueKind) -> Self {
        Self { flags: 0, kind }
    }

    pub fn kind(&self) -> &ValueKind {
        &self.kind
    }

    pub fn kind_mut(&mut self) -> &mut ValueKind {
        &mut self.kind
    }

    pub fn obj_type(&self) -> ObjType {
        match &self.kind {
            ValueKind::Str(_) => ObjType::String,
            ValueKind::List(_) => ObjType::List,
            ValueKind::Set(_) => ObjType::Set,
            ValueKind::ZSet(_) => ObjType::ZSet,
            ValueKind::Hash(_) => ObjType::Hash,
            ValueKind::Stream(_) => ObjType::Stream,
            ValueKind::Json(_) => ObjType::Json,
        }
    }

    // Flags.

    pub fn has_stash_pending(&self) -> bool {
        self.flags & FLAG_STASH_PENDING != 0
    }

    pub fn set_stash_pending(&mut self, on: bool) {
        if on {
            debug_assert!(!self.is_external(), "stash-pending value cannot be external");
            self.flags |= FLAG_STASH_PENDING;
        } else {
            self.flags &= !FLAG_STASH_PENDING;
        }
    }

    pub fn is_sticky(&self) -> bool {
        self.flags & FLAG_STICKY != 0
    }

    pub fn set_sticky(&mut self, on: bool) {
        if on {
            self.flags |= FLAG_STICKY;
        } else {
            self.flags &= !FLAG_STICKY;
        }
    }

    pub fn was_touched(&self) -> bool {
        self.flags & FLAG_TOUCHED != 0
    }

    pub fn set_touched(&mut self, on: bool) {
        if on {
            self.flags |= FLAG_TOUCHED;
        } else {
            self.flags &= !FLAG_TOUCHED;
        }
    }

    // Tiering state.

    /// True if the bytes live on disk, including the cool state.
    pub fn is_external(&self) -> bool {
        matches!(
            self.kind,
            ValueKind::Str(StrState::External { .. }) | ValueKind::Str(StrState::Cool { .. })
        )
    }

    pub fn is_cool(&self) -> bool {
        matches!(self.kind, ValueKind::Str(StrState::Cool { .. }))
    }

    pub fn is_inline_string(&self) -> bool {
        matches!(self.kind, ValueKind::Str(StrState::Inline(_)))
    }

    /// Logical byte size of the value. For containers, the summed element size.
    pub fn size(&self) -> usize {
        match &self.kind {
            ValueKind::Str(StrState::Inline(repr)) => repr.len(),
            ValueKind::Str(StrState::External { segment, .. }) => segment.len as usize,
            ValueKind::Str(StrState::Cool { len, .. }) => *len as usize,
            ValueKind::List(items) => items.iter().map(Bytes::len).sum(),
            ValueKind::Set(items) => items.iter().map(Bytes::len).sum(),
            ValueKind::ZSet(items) => items.iter().map(|(_, m)| m.len() + 8).sum(),
            ValueKind::Hash(items) => items.iter().map(|(k, v)| k.len() + v.len()).sum(),
            ValueKind::Stream(items) => items.iter().map(|(_, p)| p.len() + 8).sum(),
            ValueKind::Json(v) => v.to_string().len(),
        }
    }

    /// Approximate heap footprint, used for the chunked-serialization cutoff.
    pub fn malloc_used(&self) -> usize {
        const PER_ENTRY: usize = 32;
        match &self.kind {
            ValueKind::Str(_) => self.size(),
            ValueKind::List(items) => self.size() + items.len() * PER_ENTRY,
            ValueKind::Set(items) => self.size() + items.len() * PER_ENTRY,
            ValueKind::ZSet(items) => self.size() + items.len() * PER_ENTRY,
            ValueKind::Hash(items) => self.size() + items.len() * PER_ENTRY,
            ValueKind::Stream(items) => self.size() + items.len() * PER_ENTRY,
            ValueKind::Json(_) => self.size(),
        }
    }

    /// Resident string bytes, raw encoding. None for non-strings and offloaded
    /// strings.
    pub fn get_string(&self) -> Option<Bytes> {
        match &self.kind {
            ValueKind::Str(StrState::Inline(repr)) => Some(repr.raw_bytes()),
            _ => None,
        }
    }

    pub fn is_int_encoded(&self) -> bool {
        match &self.kind {
            ValueKind::Str(StrState::Inline(repr)) => repr.is_int(),
            ValueKind::Str(StrState::External { int_encoded, .. }) => *int_encoded,
            ValueKind::Str(StrState::Cool { int_encoded, .. }) => *int_encoded,
            _ => false,
        }
    }

    /// Replace a resident string with its external disk slice.
    pub fn set_external(&mut self, segment: DiskSegment) {
        let int_encoded = self.is_int_encoded();
        self.kind = ValueKind::Str(StrState::External {
            segment,
            int_encoded,
        });
    }

    /// Replace a resident string with a cool stub referencing `handle`.
    pub fn set_cool(&mut self, offset: u64, len: u32, handle: CoolHandle) {
        let int_encoded = self.is_int_encoded();
        self.kind = ValueKind::Str(StrState::Cool {
            page_offset: (offset % crate::tiered::disk::PAGE_SIZE as u64) as u32,
            len,
            handle,
            int_encoded,
        });
    }

    pub fn external_slice(&self) -> Option<DiskSegment> {
        match &self.kind {
            ValueKind::Str(StrState::External { segment, .. }) => Some(*segment),
            _ => None,
        }
    }

    pub fn cool_info(&self) -> Option<CoolInfo> {
        match &self.kind {
            ValueKind::Str(StrState::Cool {
                page_offset,
                len,
                handle,
                ..
            }) => Some(CoolInfo {
                page_offset: *page_offset,
                len: *len,
                handle: *handle,
            }),
            _ => None,
        }
    }

    /// Capture the encoding of an offloaded value for later decode.
    pub fn import_external(&self) -> ExternalDecoder {
        ExternalDecoder {
            int_encoded: self.is_int_encoded(),
        }
    }

    /// Turn the value back into a resident string. `is_raw` marks bytes that
    /// came straight from disk and must pass through the encoding decoder.
    pub fn materialize(&mut self, raw: &[u8], is_raw: bool) {
        let decoder = self.import_external();
        let flags = self.flags & !FLAG_STASH_PENDING;
        self.kind = ValueKind::Str(StrState::Inline(decoder.decode(raw, is_raw)));
        self.flags = flags;
    }

    /// Reset to an empty resident string, clearing tiering state and flags
    /// other than stickiness.
    pub fn reset(&mut self) {
        self.flags &= FLAG_STICKY;
        self.kind = ValueKind::Str(StrState::Inline(StrRepr::Raw(Bytes::new())));
    }
}
