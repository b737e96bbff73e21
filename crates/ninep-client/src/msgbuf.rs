//! The Message Buffer: a growable scratch buffer used to assemble an outbound
//! frame before it is handed to the Send Engine, and to hold a decoded frame's
//! raw bytes while the Receive Engine dispatches it.
//!
//! Mirrors the `BytesMut::with_capacity(4096).writer()` idiom a 9P2000.L
//! server dispatch loop uses to build a reply frame and patch its length
//! afterward, but exposes named operations instead of raw `Buf`/`BufMut` calls.

use bytes::{Buf, BufMut, BytesMut};
use std::io;

/// Default scratch capacity, matching a typical server dispatch buffer.
const DEFAULT_CAPACITY: usize = 4096;

/// A growable, position-addressable byte buffer with a reserved 4-byte size
/// prefix at offset 0. Callers build a frame with `append*`, then call
/// `finalize` to patch the size prefix before handing the bytes to the
/// transport.
#[derive(Debug)]
pub struct MessageBuffer {
    inner: BytesMut,
}

impl MessageBuffer {
    /// A fresh buffer with the 4-byte size field reserved (written as zero
    /// until `finalize` patches it).
    pub fn new() -> Self {
        let mut inner = BytesMut::with_capacity(DEFAULT_CAPACITY);
        inner.put_u32_le(0);
        MessageBuffer { inner }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let mut inner = BytesMut::with_capacity(capacity.max(4));
        inner.put_u32_le(0);
        MessageBuffer { inner }
    }

    /// Bytes written so far, including the reserved size prefix.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len() <= 4
    }

    /// Append raw bytes.
    pub fn append(&mut self, bytes: &[u8]) {
        self.inner.put_slice(bytes);
    }

    /// Append a 9P-encoded string: a `u16` length prefix followed by the
    /// UTF-8 bytes.
    pub fn append_string(&mut self, s: &str) {
        self.inner.put_u16_le(s.len() as u16);
        self.inner.put_slice(s.as_bytes());
    }

    /// Append bytes drained from a `bytes::Buf`-compatible source, e.g. a
    /// partially-consumed inbound frame being copied into a reassembly
    /// buffer. Consumes exactly `len` bytes from `src`.
    pub fn append_from_stream<B: Buf>(&mut self, src: &mut B, len: usize) -> io::Result<()> {
        if src.remaining() < len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "short read while reassembling message buffer",
            ));
        }
        self.inner.put(src.take(len));
        Ok(())
    }

    /// A `std::io::Write`-compatible cursor positioned past the reserved
    /// size prefix, for codecs (e.g. `serialize::write_msg`) that want to
    /// stream fields in directly rather than go through `append*`.
    pub fn writer(&mut self) -> bytes::buf::Writer<&mut BytesMut> {
        BufMut::writer(&mut self.inner)
    }

    /// Patch the reserved 4-byte prefix with the buffer's total length
    /// (`size[4]` covers the whole frame, itself included) and return the
    /// finished bytes.
    pub fn finalize(mut self) -> BytesMut {
        let total = self.inner.len() as u32;
        self.inner[0..4].copy_from_slice(&total.to_le_bytes());
        self.inner
    }

    /// Read `len` bytes at absolute offset `at`, without consuming them.
    pub fn read_at(&self, at: usize, len: usize) -> io::Result<&[u8]> {
        self.inner
            .get(at..at + len)
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "read_at past end"))
    }

    /// Read a 9P string (`u16` length prefix + UTF-8 bytes) at absolute
    /// offset `at`. Returns the string and the offset immediately past it.
    pub fn read_string_at(&self, at: usize) -> io::Result<(String, usize)> {
        let len_bytes = self.read_at(at, 2)?;
        let len = u16::from_le_bytes([len_bytes[0], len_bytes[1]]) as usize;
        let bytes = self.read_at(at + 2, len)?;
        let s = String::from_utf8(bytes.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid UTF-8"))?;
        Ok((s, at + 2 + len))
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.inner[..]
    }
}

impl Default for MessageBuffer {
    fn default() -> Self {
        MessageBuffer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalize_patches_total_length() {
        let mut buf = MessageBuffer::new();
        buf.append(&[1, 2, 3, 4]);
        buf.append_string("hello");
        let bytes = buf.finalize();
        let total = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(total as usize, bytes.len());
    }

    #[test]
    fn read_string_at_roundtrips() {
        let mut buf = MessageBuffer::new();
        buf.append_string("root");
        let (s, next) = buf.read_string_at(4).unwrap();
        assert_eq!(s, "root");
        assert_eq!(next, 4 + 2 + 4);
    }

    #[test]
    fn read_at_past_end_is_an_error() {
        let buf = MessageBuffer::new();
        assert!(buf.read_at(0, 100).is_err());
    }

    #[test]
    fn append_from_stream_consumes_exact_length() {
        let mut buf = MessageBuffer::new();
        let mut src = &b"0123456789"[..];
        buf.append_from_stream(&mut src, 4).unwrap();
        assert_eq!(src.remaining(), 6);
        assert_eq!(buf.read_at(4, 4).unwrap(), b"0123");
    }
}
