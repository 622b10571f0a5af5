//! Typed tagged values carried inside control-channel packets.
//!
//! Every field on the wire is introduced by a one-byte type tag so both
//! sides can detect schema drift instead of silently misreading bytes.
//! Integers are big-endian; strings and arbitrary blobs are
//! length-prefixed with a `u32`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

const TAG_U32: u8 = b'L';
const TAG_STRING: u8 = b't';
const TAG_ARBITRARY: u8 = b'x';

/// Failure while decoding a tagged body.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TagError {
    #[error("expected field tag {expected:?}, found {found:?}")]
    UnexpectedTag { expected: char, found: char },
    #[error("tagged body truncated")]
    Truncated,
    #[error("tagged body has trailing bytes")]
    Trailing,
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
}

/// Serializer for one tagged message body.
#[derive(Debug, Default)]
pub struct TagWriter {
    buf: BytesMut,
}

impl TagWriter {
    pub fn new() -> Self {
        Self { buf: BytesMut::new() }
    }

    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u8(TAG_U32);
        self.buf.put_u32(value);
        self
    }

    pub fn put_string(&mut self, value: &str) -> &mut Self {
        self.buf.put_u8(TAG_STRING);
        self.buf.put_u32(value.len() as u32);
        self.buf.put_slice(value.as_bytes());
        self
    }

    pub fn put_arbitrary(&mut self, value: &[u8]) -> &mut Self {
        self.buf.put_u8(TAG_ARBITRARY);
        self.buf.put_u32(value.len() as u32);
        self.buf.put_slice(value);
        self
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Cursor over a received tagged body.
///
/// Reads consume the buffer; [`TagReader::eof`] reports whether the body
/// was fully drained, which callers use to reject trailing bytes.
#[derive(Debug)]
pub struct TagReader {
    buf: Bytes,
}

impl TagReader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    fn expect_tag(&mut self, expected: u8) -> Result<(), TagError> {
        if self.buf.remaining() < 1 {
            return Err(TagError::Truncated);
        }
        let found = self.buf.get_u8();
        if found != expected {
            return Err(TagError::UnexpectedTag {
                expected: expected as char,
                found: found as char,
            });
        }
        Ok(())
    }

    fn take_len_prefixed(&mut self) -> Result<Bytes, TagError> {
        if self.buf.remaining() < 4 {
            return Err(TagError::Truncated);
        }
        let len = self.buf.get_u32() as usize;
        if self.buf.remaining() < len {
            return Err(TagError::Truncated);
        }
        Ok(self.buf.split_to(len))
    }

    pub fn get_u32(&mut self) -> Result<u32, TagError> {
        self.expect_tag(TAG_U32)?;
        if self.buf.remaining() < 4 {
            return Err(TagError::Truncated);
        }
        Ok(self.buf.get_u32())
    }

    pub fn get_string(&mut self) -> Result<String, TagError> {
        self.expect_tag(TAG_STRING)?;
        let raw = self.take_len_prefixed()?;
        String::from_utf8(raw.to_vec()).map_err(|_| TagError::InvalidUtf8)
    }

    pub fn get_arbitrary(&mut self) -> Result<Bytes, TagError> {
        self.expect_tag(TAG_ARBITRARY)?;
        self.take_len_prefixed()
    }

    /// True once every field has been consumed.
    pub fn eof(&self) -> bool {
        !self.buf.has_remaining()
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_round_trip_in_order() {
        let mut w = TagWriter::new();
        w.put_u32(7).put_string("payload").put_arbitrary(&[1, 2, 3]);
        let mut r = TagReader::new(w.into_bytes());

        assert_eq!(r.get_u32().unwrap(), 7);
        assert_eq!(r.get_string().unwrap(), "payload");
        assert_eq!(r.get_arbitrary().unwrap().as_ref(), &[1, 2, 3]);
        assert!(r.eof());
    }

    #[test]
    fn tag_mismatch_is_reported() {
        let mut w = TagWriter::new();
        w.put_string("not a number");
        let mut r = TagReader::new(w.into_bytes());

        assert_eq!(
            r.get_u32(),
            Err(TagError::UnexpectedTag {
                expected: 'L',
                found: 't',
            })
        );
    }

    #[test]
    fn truncated_body_is_reported() {
        let mut w = TagWriter::new();
        w.put_u32(1);
        let full = w.into_bytes();
        let mut r = TagReader::new(full.slice(..3));

        assert_eq!(r.get_u32(), Err(TagError::Truncated));
    }

    #[test]
    fn short_length_prefix_is_reported() {
        let mut r = TagReader::new(Bytes::from_static(&[TAG_ARBITRARY, 0, 0, 0, 9, 1]));
        assert_eq!(r.get_arbitrary(), Err(TagError::Truncated));
    }

    #[test]
    fn eof_only_after_full_drain() {
        let mut w = TagWriter::new();
        w.put_u32(1).put_u32(2);
        let mut r = TagReader::new(w.into_bytes());
        assert!(!r.eof());
        r.get_u32().unwrap();
        assert!(!r.eof());
        r.get_u32().unwrap();
        assert!(r.eof());
    }
}
