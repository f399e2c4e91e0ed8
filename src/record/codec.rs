use bytes::BufMut;

use super::{AllocClass, OpType, EXTERNAL_KEY_MARKER, EXTERNAL_VALUE_MARKER};

/// A record about to be written
#[derive(Debug, Clone, Copy)]
pub struct NewRecord<'a> {
    pub key: &'a [u8],
    pub value: &'a [u8],
    pub seq: u64,
    pub op: OpType,
    pub expire: u64,
}

/// Where the bytes of a [`NewRecord`] went, decided after any external
/// body has been allocated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Embedded,
    ExternalValue { handle: u64 },
    ExternalKeyValue { handle: u64, len: u32 },
}

impl Placement {
    pub fn class(&self) -> AllocClass {
        match self {
            Placement::Embedded => AllocClass::Embedded,
            Placement::ExternalValue { .. } => AllocClass::ExternalValue,
            Placement::ExternalKeyValue { .. } => AllocClass::ExternalKeyValue,
        }
    }
}

/// Encode `record` into `dst`, which must be exactly the class's encoded length
pub fn write_record(dst: &mut [u8], record: &NewRecord<'_>, placement: Placement) {
    debug_assert_eq!(
        dst.len(),
        placement
            .class()
            .encoded_len(record.key.len(), record.value.len())
    );
    let mut out: &mut [u8] = dst;
    match placement {
        Placement::Embedded => {
            out.put_u16(record.key.len() as u16);
            out.put_u16(record.value.len() as u16);
            out.put_u64(record.expire);
            out.put_u64(0);
            out.put_slice(record.key);
            out.put_u64(record.seq);
            out.put_u8(record.op as u8);
            out.put_slice(record.value);
        }
        Placement::ExternalValue { handle } => {
            out.put_u16(record.key.len() as u16);
            out.put_u16(EXTERNAL_VALUE_MARKER);
            out.put_u64(record.expire);
            out.put_u64(0);
            out.put_slice(record.key);
            out.put_u64(record.seq);
            out.put_u8(record.op as u8);
            out.put_u32(record.value.len() as u32);
            out.put_u64(handle);
        }
        Placement::ExternalKeyValue { handle, len } => {
            out.put_u16(EXTERNAL_KEY_MARKER);
            out.put_u16(EXTERNAL_VALUE_MARKER);
            out.put_u64(record.expire);
            out.put_u64(0);
            out.put_u32(len);
            out.put_u64(handle);
            out.put_u64(record.seq);
            out.put_u8(record.op as u8);
        }
    }
}
