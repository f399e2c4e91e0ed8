//! Record Module
//!
//! Binary layout of a single key/value version inside a data block.
//!
//! ## Layouts
//! All integers are big-endian.
//! ```text
//! header (20 bytes, every record):
//!   [keylen:2][vallen:2][expire:8][eviction:8]
//!
//! EMBEDDED          keylen = k, vallen = v
//!   header | key | seq:8 | op:1 | value
//!
//! EXTERNAL VALUE    keylen = k, vallen = 0xFFFF
//!   header | key | seq:8 | op:1 | vlen:4 | handle:8
//!   external body: value
//!
//! EXTERNAL KEY+VALUE keylen = 0, vallen = 0xFFFF
//!   header | extlen:4 | handle:8 | seq:8 | op:1
//!   external body: [klen:4][key][value]
//! ```
//!
//! Records within a block are ordered by key ascending, then sequence id
//! descending, then op ascending, so the newest version of a key comes
//! first.

mod codec;
mod view;

use std::cmp::Ordering;

pub use codec::{write_record, NewRecord, Placement};
pub use view::RecordView;

/// Size of the fixed header
pub const HEADER_SIZE: usize = 20;
/// Size of the sequence id field
pub const SEQ_SIZE: usize = 8;
/// Size of the op type field
pub const OP_SIZE: usize = 1;
/// Fixed bytes carried by every record regardless of class
pub const RECORD_OVERHEAD: usize = HEADER_SIZE + SEQ_SIZE + OP_SIZE;
/// Length plus handle of an external body reference
pub const EXTERNAL_REF_SIZE: usize = 12;
/// `vallen` marker for both external classes
pub const EXTERNAL_VALUE_MARKER: u16 = u16::MAX;
/// `keylen` marker for the external key+value class
pub const EXTERNAL_KEY_MARKER: u16 = 0;

/// What a record version does to its key
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum OpType {
    Delete = 0,
    Put = 1,
}

impl OpType {
    pub fn from_u8(value: u8) -> Self {
        if value == OpType::Delete as u8 {
            OpType::Delete
        } else {
            OpType::Put
        }
    }
}

/// Where a record's key and value bytes live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocClass {
    Embedded,
    ExternalValue,
    ExternalKeyValue,
}

impl AllocClass {
    /// Pick the class for a key/value pair given the external threshold
    /// (half the maximum data block size).
    pub fn classify(key_len: usize, value_len: usize, threshold: usize) -> Self {
        if key_len + value_len + RECORD_OVERHEAD < threshold {
            AllocClass::Embedded
        } else if key_len + RECORD_OVERHEAD + EXTERNAL_REF_SIZE < threshold {
            AllocClass::ExternalValue
        } else {
            AllocClass::ExternalKeyValue
        }
    }

    /// Bytes the record occupies inside the block
    pub fn encoded_len(self, key_len: usize, value_len: usize) -> usize {
        match self {
            AllocClass::Embedded => RECORD_OVERHEAD + key_len + value_len,
            AllocClass::ExternalValue => RECORD_OVERHEAD + key_len + EXTERNAL_REF_SIZE,
            AllocClass::ExternalKeyValue => RECORD_OVERHEAD + EXTERNAL_REF_SIZE,
        }
    }
}

/// Total order of record versions
pub fn compare_versions(
    a_key: &[u8],
    a_seq: u64,
    a_op: OpType,
    b_key: &[u8],
    b_seq: u64,
    b_op: OpType,
) -> Ordering {
    a_key
        .cmp(b_key)
        .then_with(|| b_seq.cmp(&a_seq))
        .then_with(|| a_op.cmp(&b_op))
}
