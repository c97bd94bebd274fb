//! # Byte Codec
//!
//! Bounds-checked primitives for the engine's on-disk encoding: fixed-width
//! big-endian integers and length-prefixed UTF-8 strings. Records, segment
//! payloads and the file header all go through this module.
//!
//! ## String Encoding
//!
//! Strings carry a `u32` big-endian byte-length prefix followed by the raw
//! UTF-8 bytes. A prefix of `0xFFFF_FFFF` (`-1` as `i32`) encodes the
//! absence of a string and decodes as `None`; this is how optional fields
//! such as a measurement alias are stored.
//!
//! ## Error Handling
//!
//! Every read validates the remaining length and fails with
//! [`StoreError::Corrupt`] on insufficient bytes; a short buffer is always
//! treated as corruption, never as an implicit end-of-stream.

use crate::error::{StoreError, StoreResult};

/// Byte width of the string length prefix.
pub const STR_PREFIX_SIZE: usize = 4;

/// Sentinel length prefix encoding `None`.
const NONE_STR_PREFIX: u32 = u32::MAX;

/// Sequential reader over a byte slice.
#[derive(Debug)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, len: usize) -> StoreResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(StoreError::corrupt(format!(
                "short read: need {} bytes at offset {}, {} remain",
                len,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> StoreResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_i16(&mut self) -> StoreResult<i16> {
        let b = self.take(2)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u16(&mut self) -> StoreResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_i32(&mut self) -> StoreResult<i32> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u32(&mut self) -> StoreResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i64(&mut self) -> StoreResult<i64> {
        let b = self.take(8)?;
        Ok(i64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Reads a length-prefixed UTF-8 string. A `-1` prefix yields `None`.
    pub fn read_opt_string(&mut self) -> StoreResult<Option<String>> {
        let len = self.read_u32()?;
        if len == NONE_STR_PREFIX {
            return Ok(None);
        }
        let bytes = self.take(len as usize)?;
        let s = std::str::from_utf8(bytes)
            .map_err(|e| StoreError::corrupt(format!("invalid UTF-8 in string: {e}")))?;
        Ok(Some(s.to_string()))
    }

    pub fn read_string(&mut self) -> StoreResult<String> {
        self.read_opt_string()?
            .ok_or_else(|| StoreError::corrupt("unexpected null string"))
    }
}

/// Sequential writer over a mutable byte slice.
#[derive(Debug)]
pub struct ByteWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> ByteWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn put(&mut self, bytes: &[u8]) -> StoreResult<()> {
        if self.buf.len() - self.pos < bytes.len() {
            return Err(StoreError::corrupt(format!(
                "short write: need {} bytes at offset {}, {} remain",
                bytes.len(),
                self.pos,
                self.buf.len() - self.pos
            )));
        }
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        Ok(())
    }

    pub fn write_u8(&mut self, v: u8) -> StoreResult<()> {
        self.put(&[v])
    }

    pub fn write_i16(&mut self, v: i16) -> StoreResult<()> {
        self.put(&v.to_be_bytes())
    }

    pub fn write_u16(&mut self, v: u16) -> StoreResult<()> {
        self.put(&v.to_be_bytes())
    }

    pub fn write_i32(&mut self, v: i32) -> StoreResult<()> {
        self.put(&v.to_be_bytes())
    }

    pub fn write_u32(&mut self, v: u32) -> StoreResult<()> {
        self.put(&v.to_be_bytes())
    }

    pub fn write_i64(&mut self, v: i64) -> StoreResult<()> {
        self.put(&v.to_be_bytes())
    }

    /// Writes a length-prefixed UTF-8 string; `None` writes the `-1` prefix.
    pub fn write_opt_string(&mut self, s: Option<&str>) -> StoreResult<()> {
        match s {
            Some(s) => {
                self.write_u32(s.len() as u32)?;
                self.put(s.as_bytes())
            }
            None => self.write_u32(NONE_STR_PREFIX),
        }
    }

    pub fn write_string(&mut self, s: &str) -> StoreResult<()> {
        self.write_opt_string(Some(s))
    }
}

/// Encoded byte length of a length-prefixed string.
pub fn string_len(s: &str) -> usize {
    STR_PREFIX_SIZE + s.len()
}

/// Encoded byte length of an optional length-prefixed string.
pub fn opt_string_len(s: Option<&str>) -> usize {
    STR_PREFIX_SIZE + s.map_or(0, str::len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_round_trip_is_big_endian() {
        let mut buf = [0u8; 32];
        let mut w = ByteWriter::new(&mut buf);
        w.write_u8(0xAB).unwrap();
        w.write_i16(-2).unwrap();
        w.write_u32(0x1122_3344).unwrap();
        w.write_i64(-1).unwrap();

        assert_eq!(buf[0], 0xAB);
        assert_eq!(&buf[1..3], &[0xFF, 0xFE]);
        assert_eq!(&buf[3..7], &[0x11, 0x22, 0x33, 0x44]);
        assert_eq!(&buf[7..15], &[0xFF; 8]);

        let mut r = ByteReader::new(&buf);
        assert_eq!(r.read_u8().unwrap(), 0xAB);
        assert_eq!(r.read_i16().unwrap(), -2);
        assert_eq!(r.read_u32().unwrap(), 0x1122_3344);
        assert_eq!(r.read_i64().unwrap(), -1);
    }

    #[test]
    fn string_round_trip() {
        let mut buf = [0u8; 64];
        let mut w = ByteWriter::new(&mut buf);
        w.write_string("temperature").unwrap();
        let written = w.position();
        assert_eq!(written, string_len("temperature"));

        let mut r = ByteReader::new(&buf);
        assert_eq!(r.read_string().unwrap(), "temperature");
    }

    #[test]
    fn none_string_uses_negative_prefix() {
        let mut buf = [0u8; 8];
        let mut w = ByteWriter::new(&mut buf);
        w.write_opt_string(None).unwrap();
        assert_eq!(&buf[..4], &[0xFF, 0xFF, 0xFF, 0xFF]);

        let mut r = ByteReader::new(&buf);
        assert_eq!(r.read_opt_string().unwrap(), None);
    }

    #[test]
    fn empty_string_is_not_none() {
        let mut buf = [0u8; 8];
        let mut w = ByteWriter::new(&mut buf);
        w.write_string("").unwrap();

        let mut r = ByteReader::new(&buf);
        assert_eq!(r.read_opt_string().unwrap(), Some(String::new()));
    }

    #[test]
    fn short_read_is_corrupt() {
        let buf = [0u8; 3];
        let mut r = ByteReader::new(&buf);
        let err = r.read_u32().unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
        assert!(err.to_string().contains("short read"));
    }

    #[test]
    fn truncated_string_body_is_corrupt() {
        let mut buf = [0u8; 8];
        buf[..4].copy_from_slice(&100u32.to_be_bytes());
        let mut r = ByteReader::new(&buf);
        assert!(matches!(
            r.read_string().unwrap_err(),
            StoreError::Corrupt(_)
        ));
    }

    #[test]
    fn short_write_is_rejected() {
        let mut buf = [0u8; 2];
        let mut w = ByteWriter::new(&mut buf);
        assert!(matches!(
            w.write_u32(1).unwrap_err(),
            StoreError::Corrupt(_)
        ));
    }

    #[test]
    fn invalid_utf8_is_corrupt() {
        let mut buf = [0u8; 8];
        buf[..4].copy_from_slice(&2u32.to_be_bytes());
        buf[4] = 0xFF;
        buf[5] = 0xFE;
        let mut r = ByteReader::new(&buf);
        assert!(matches!(
            r.read_string().unwrap_err(),
            StoreError::Corrupt(_)
        ));
    }
}
