//! Length-prefixed binary object streams.
//!
//! A classifier image is a concatenation of nested sub-objects, each framed
//! as `[u32 length][length bytes]` with all integers little-endian. The
//! reader consumes from the front of a shared [`Bytes`] buffer, so taking a
//! sub-stream is a reference-counted slice of the engine's single image
//! buffer rather than a copy.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FlowMatchError, Result};

// ============================================================================
// Reader
// ============================================================================

/// Consuming reader over one object stream.
#[derive(Debug, Clone)]
pub struct ObjectReader {
    buf: Bytes,
}

impl ObjectReader {
    /// Wrap an existing buffer.
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    /// Copy a byte slice into a new reader.
    pub fn from_slice(data: &[u8]) -> Self {
        Self {
            buf: Bytes::copy_from_slice(data),
        }
    }

    /// Read an entire image file into memory.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        Ok(Self {
            buf: Bytes::from(data),
        })
    }

    /// Bytes left in the stream.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// View of the unconsumed bytes.
    #[inline]
    pub fn as_bytes(&self) -> &Bytes {
        &self.buf
    }

    fn ensure(&self, n: usize) -> Result<()> {
        if self.buf.len() < n {
            return Err(FlowMatchError::ImageCorrupt(format!(
                "unexpected end of stream: need {} bytes, have {}",
                n,
                self.buf.len()
            )));
        }
        Ok(())
    }

    /// Read one little-endian `u32`.
    pub fn read_u32(&mut self) -> Result<u32> {
        self.ensure(4)?;
        Ok(self.buf.get_u32_le())
    }

    /// Read one little-endian `f32`.
    pub fn read_f32(&mut self) -> Result<f32> {
        self.ensure(4)?;
        Ok(self.buf.get_f32_le())
    }

    /// Take `n` raw bytes as a zero-copy slice.
    pub fn read_bytes(&mut self, n: usize) -> Result<Bytes> {
        self.ensure(n)?;
        Ok(self.buf.split_to(n))
    }

    /// Consume one length prefix and return the named byte range as a
    /// sub-stream. The sub-stream shares the parent's backing buffer.
    pub fn sub_reader(&mut self) -> Result<ObjectReader> {
        let len = self.read_u32()? as usize;
        let body = self.read_bytes(len).map_err(|_| {
            FlowMatchError::ImageCorrupt(format!(
                "sub-object length {} exceeds remaining stream",
                len
            ))
        })?;
        Ok(ObjectReader::new(body))
    }
}

// ============================================================================
// Packer
// ============================================================================

/// Accumulating writer for object streams.
///
/// Raw fields are appended unframed; nested objects are appended with a
/// `u32` length prefix so an [`ObjectReader::sub_reader`] call recovers them.
#[derive(Debug, Default)]
pub struct ObjectPacker {
    buf: BytesMut,
}

impl ObjectPacker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes accumulated so far.
    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Append one little-endian `u32`.
    pub fn push_u32(&mut self, value: u32) {
        self.buf.put_u32_le(value);
    }

    /// Append one little-endian `f32`.
    pub fn push_f32(&mut self, value: f32) {
        self.buf.put_f32_le(value);
    }

    /// Append raw bytes without framing.
    pub fn append_raw(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }

    /// Append a nested object with its `u32` length prefix.
    pub fn push_object(&mut self, object: &ObjectPacker) {
        self.buf.put_u32_le(object.buf.len() as u32);
        self.buf.put_slice(&object.buf);
    }

    /// Finalise into an immutable buffer.
    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}
