use bytes::Buf;
use tracing::error;

use super::{
    AllocClass, OpType, EXTERNAL_KEY_MARKER, EXTERNAL_REF_SIZE, EXTERNAL_VALUE_MARKER,
    HEADER_SIZE, RECORD_OVERHEAD, SEQ_SIZE,
};
use crate::memory::ExternalStore;

/// Borrowed view of one encoded record.
///
/// Key and value accessors resolve external bodies through the owning
/// block's [`ExternalStore`], so callers never see the difference between
/// the three allocation classes.
#[derive(Clone, Copy)]
pub struct RecordView<'a> {
    bytes: &'a [u8],
    externals: &'a ExternalStore,
}

impl<'a> RecordView<'a> {
    /// View the record starting at `offset` of `buf`
    pub fn new(buf: &'a [u8], offset: usize, externals: &'a ExternalStore) -> Self {
        Self {
            bytes: &buf[offset..],
            externals,
        }
    }

    fn key_len_field(&self) -> usize {
        (&self.bytes[0..2]).get_u16() as usize
    }

    fn value_len_field(&self) -> u16 {
        (&self.bytes[2..4]).get_u16()
    }

    pub fn class(&self) -> AllocClass {
        if self.value_len_field() != EXTERNAL_VALUE_MARKER {
            AllocClass::Embedded
        } else if self.key_len_field() == EXTERNAL_KEY_MARKER as usize {
            AllocClass::ExternalKeyValue
        } else {
            AllocClass::ExternalValue
        }
    }

    pub fn expire(&self) -> u64 {
        (&self.bytes[4..12]).get_u64()
    }

    pub fn eviction(&self) -> u64 {
        (&self.bytes[12..20]).get_u64()
    }

    /// Offset of the sequence id from the start of the record
    pub(crate) fn seq_offset(&self) -> usize {
        match self.class() {
            AllocClass::ExternalKeyValue => HEADER_SIZE + EXTERNAL_REF_SIZE,
            _ => HEADER_SIZE + self.key_len_field(),
        }
    }

    pub fn seq_id(&self) -> u64 {
        let at = self.seq_offset();
        (&self.bytes[at..at + SEQ_SIZE]).get_u64()
    }

    pub fn op(&self) -> OpType {
        OpType::from_u8(self.bytes[self.seq_offset() + SEQ_SIZE])
    }

    pub fn is_delete(&self) -> bool {
        self.op() == OpType::Delete
    }

    /// Bytes the record occupies inside its block
    pub fn encoded_len(&self) -> usize {
        match self.class() {
            AllocClass::Embedded => {
                RECORD_OVERHEAD + self.key_len_field() + self.value_len_field() as usize
            }
            AllocClass::ExternalValue => RECORD_OVERHEAD + self.key_len_field() + EXTERNAL_REF_SIZE,
            AllocClass::ExternalKeyValue => RECORD_OVERHEAD + EXTERNAL_REF_SIZE,
        }
    }

    /// Handle of the external body, if the record has one
    pub fn external_handle(&self) -> Option<u64> {
        let at = match self.class() {
            AllocClass::Embedded => return None,
            AllocClass::ExternalValue => self.seq_offset() + SEQ_SIZE + 1 + 4,
            AllocClass::ExternalKeyValue => HEADER_SIZE + 4,
        };
        Some((&self.bytes[at..at + 8]).get_u64())
    }

    fn external_body(&self) -> &'a [u8] {
        let externals: &'a ExternalStore = self.externals;
        let Some(handle) = self.external_handle() else {
            return &[];
        };
        let body = externals.get(handle);
        debug_assert!(body.is_some(), "dangling external handle {}", handle);
        body.unwrap_or_else(|| {
            error!(handle, "Record points at a freed external allocation");
            &[]
        })
    }

    fn external_key_len(body: &[u8]) -> usize {
        if body.len() < 4 {
            return 0;
        }
        (&body[0..4]).get_u32() as usize
    }

    pub fn key(&self) -> &'a [u8] {
        match self.class() {
            AllocClass::ExternalKeyValue => {
                let body = self.external_body();
                let klen = Self::external_key_len(body);
                body.get(4..4 + klen).unwrap_or(&[])
            }
            _ => {
                let bytes: &'a [u8] = self.bytes;
                &bytes[HEADER_SIZE..HEADER_SIZE + self.key_len_field()]
            }
        }
    }

    pub fn value(&self) -> &'a [u8] {
        match self.class() {
            AllocClass::Embedded => {
                let bytes: &'a [u8] = self.bytes;
                let at = self.seq_offset() + SEQ_SIZE + 1;
                &bytes[at..at + self.value_len_field() as usize]
            }
            AllocClass::ExternalValue => self.external_body(),
            AllocClass::ExternalKeyValue => {
                let body = self.external_body();
                let klen = Self::external_key_len(body);
                body.get(4 + klen..).unwrap_or(&[])
            }
        }
    }

    pub fn key_size(&self) -> usize {
        self.key().len()
    }

    pub fn value_size(&self) -> usize {
        match self.class() {
            AllocClass::Embedded => self.value_len_field() as usize,
            _ => self.value().len(),
        }
    }
}

impl std::fmt::Debug for RecordView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordView")
            .field("class", &self.class())
            .field("key_size", &self.key_size())
            .field("value_size", &self.value_size())
            .field("seq", &self.seq_id())
            .field("op", &self.op())
            .finish()
    }
}
