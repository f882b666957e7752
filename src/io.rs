//! Little-endian byte codecs shared by page headers, B+ tree nodes,
//! records and the catalog.

use crate::error::{DbError, DbResult};

/// Append-only byte buffer with little-endian primitives.
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.push(v as u8);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_f32(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// u32 length prefix followed by the raw bytes.
    pub fn write_len_bytes(&mut self, bytes: &[u8]) {
        self.write_u32(bytes.len() as u32);
        self.write_bytes(bytes);
    }

    pub fn write_len_str(&mut self, s: &str) {
        self.write_len_bytes(s.as_bytes());
    }

    /// Zero-fill up to `size` bytes. The caller guarantees the content
    /// fits; overflow is a logic error surfaced loudly.
    pub fn to_padded_bytes(mut self, size: usize) -> Vec<u8> {
        assert!(
            self.buf.len() <= size,
            "serialized {} bytes into a {} byte region",
            self.buf.len(),
            size
        );
        self.buf.resize(size, 0);
        self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over a byte slice with little-endian primitives. Reads past
/// the end surface as `CorruptPage`-grade errors at the call site; here
/// they come back as `InvalidArgument` for the caller to wrap.
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub fn seek(&mut self, pos: usize) -> DbResult<()> {
        if pos > self.buf.len() {
            return Err(DbError::invalid(format!(
                "seek to {} beyond buffer of {} bytes",
                pos,
                self.buf.len()
            )));
        }
        self.pos = pos;
        Ok(())
    }

    pub fn skip(&mut self, count: usize) -> DbResult<()> {
        self.seek(self.pos + count)
    }

    fn take(&mut self, count: usize) -> DbResult<&'a [u8]> {
        if self.remaining() < count {
            return Err(DbError::invalid(format!(
                "unexpected end of buffer: need {} bytes, have {}",
                count,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> DbResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> DbResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> DbResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> DbResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i32(&mut self) -> DbResult<i32> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i64(&mut self) -> DbResult<i64> {
        let b = self.take(8)?;
        Ok(i64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn read_u64(&mut self) -> DbResult<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn read_f32(&mut self) -> DbResult<f32> {
        let b = self.take(4)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_f64(&mut self) -> DbResult<f64> {
        let b = self.take(8)?;
        Ok(f64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn read_bytes(&mut self, count: usize) -> DbResult<Vec<u8>> {
        Ok(self.take(count)?.to_vec())
    }

    pub fn read_len_bytes(&mut self) -> DbResult<Vec<u8>> {
        let len = self.read_u32()? as usize;
        self.read_bytes(len)
    }

    pub fn read_len_str(&mut self) -> DbResult<String> {
        let bytes = self.read_len_bytes()?;
        String::from_utf8(bytes).map_err(|e| DbError::invalid(format!("invalid utf-8: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_round_trip() {
        let mut w = ByteWriter::new();
        w.write_u8(0xAB);
        w.write_u16(0xBEEF);
        w.write_i32(-42);
        w.write_i64(1 << 40);
        w.write_f64(3.5);
        w.write_len_str("hello");

        let bytes = w.into_bytes();
        let mut r = ByteReader::new(&bytes);
        assert_eq!(r.read_u8().unwrap(), 0xAB);
        assert_eq!(r.read_u16().unwrap(), 0xBEEF);
        assert_eq!(r.read_i32().unwrap(), -42);
        assert_eq!(r.read_i64().unwrap(), 1 << 40);
        assert_eq!(r.read_f64().unwrap(), 3.5);
        assert_eq!(r.read_len_str().unwrap(), "hello");
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_short_read_fails() {
        let bytes = [0u8; 2];
        let mut r = ByteReader::new(&bytes);
        assert!(r.read_u32().is_err());
    }

    #[test]
    fn test_padded_bytes() {
        let mut w = ByteWriter::new();
        w.write_u16(7);
        let bytes = w.to_padded_bytes(8);
        assert_eq!(bytes, vec![7, 0, 0, 0, 0, 0, 0, 0]);
    }
}
