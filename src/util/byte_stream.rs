use bytes::{Buf, BufMut, BytesMut};

use crate::comm::error::Result;

/// A growable byte buffer with an append-write end and a separate typed-read
///  cursor. This is the payload container handed to [crate::comm::messenger::Messenger::send_data]
///  and yielded by [crate::comm::messenger::Messenger::recv_data]: callers serialize into it
///  sequentially, receivers `rewind` and read it back out.
///
/// There are no concurrency guarantees; a ByteStream is used single-threaded by its owner.
pub struct ByteStream {
    buf: BytesMut,
    read_pos: usize,
}

impl ByteStream {
    pub fn new() -> ByteStream {
        ByteStream {
            buf: BytesMut::new(),
            read_pos: 0,
        }
    }

    pub fn with_capacity(capacity: usize) -> ByteStream {
        ByteStream {
            buf: BytesMut::with_capacity(capacity),
            read_pos: 0,
        }
    }

    /// copies a byte slice into a fresh stream with the read cursor at the start
    pub fn from_slice(data: &[u8]) -> ByteStream {
        let mut buf = BytesMut::with_capacity(data.len());
        buf.put_slice(data);
        ByteStream {
            buf,
            read_pos: 0,
        }
    }

    /// number of bytes written so far, independent of the read cursor
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// all written bytes, for zero-copy hand-off to the fragmenter
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// bytes between the read cursor and the write end
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.read_pos
    }

    pub fn rewind(&mut self) {
        self.read_pos = 0;
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.put_u32(value);
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.put_u64(value);
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.put_i32(value);
    }

    pub fn write_f32(&mut self, value: f32) {
        self.buf.put_f32(value);
    }

    pub fn write_f64(&mut self, value: f64) {
        self.buf.put_f64(value);
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }

    /// length-prefixed vector of i32, the encoding used by the control message channel
    pub fn write_i32_vec(&mut self, values: &[i32]) {
        self.buf.put_u64(values.len() as u64);
        for &value in values {
            self.buf.put_i32(value);
        }
    }

    pub fn try_read_u8(&mut self) -> Result<u8> {
        let mut cursor = &self.buf[self.read_pos..];
        let value = cursor.try_get_u8()?;
        self.read_pos = self.buf.len() - cursor.len();
        Ok(value)
    }

    pub fn try_read_u32(&mut self) -> Result<u32> {
        let mut cursor = &self.buf[self.read_pos..];
        let value = cursor.try_get_u32()?;
        self.read_pos = self.buf.len() - cursor.len();
        Ok(value)
    }

    pub fn try_read_u64(&mut self) -> Result<u64> {
        let mut cursor = &self.buf[self.read_pos..];
        let value = cursor.try_get_u64()?;
        self.read_pos = self.buf.len() - cursor.len();
        Ok(value)
    }

    pub fn try_read_i32(&mut self) -> Result<i32> {
        let mut cursor = &self.buf[self.read_pos..];
        let value = cursor.try_get_i32()?;
        self.read_pos = self.buf.len() - cursor.len();
        Ok(value)
    }

    pub fn try_read_f32(&mut self) -> Result<f32> {
        let mut cursor = &self.buf[self.read_pos..];
        let value = cursor.try_get_f32()?;
        self.read_pos = self.buf.len() - cursor.len();
        Ok(value)
    }

    pub fn try_read_f64(&mut self) -> Result<f64> {
        let mut cursor = &self.buf[self.read_pos..];
        let value = cursor.try_get_f64()?;
        self.read_pos = self.buf.len() - cursor.len();
        Ok(value)
    }

    pub fn try_read_i32_vec(&mut self) -> Result<Vec<i32>> {
        let count = self.try_read_u64()?;
        let mut values = Vec::new();
        for _ in 0..count {
            values.push(self.try_read_i32()?);
        }
        Ok(values)
    }
}

impl Default for ByteStream {
    fn default() -> Self {
        ByteStream::new()
    }
}

impl std::fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ByteStream{{len:{}, read_pos:{}}}", self.buf.len(), self.read_pos)
    }
}
