//! Frame primitives.
//!
//! A frame is a type tag followed immediately by the message payload.
//! The tag is a big-endian `u16` byte length plus that many bytes of
//! UTF-8. There is no frame length prefix: decoding is incremental, and
//! a decoder that runs out of buffered bytes reports
//! [`ProtocolError::Incomplete`] so the caller can refill and retry.
//!
//! Strings inside payloads travel as a big-endian `u32` count of UTF-16
//! code units followed by the units themselves, each a big-endian `u16`.

use crate::error::ProtocolError;

/// Append-only frame builder.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.push(value as u8);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Writes a type tag: `u16` byte length + UTF-8 bytes.
    pub fn write_tag(&mut self, tag: &str) -> Result<(), ProtocolError> {
        let len = u16::try_from(tag.len())
            .map_err(|_| ProtocolError::Encode(format!("type tag too long ({} bytes)", tag.len())))?;
        self.write_u16(len);
        self.buf.extend_from_slice(tag.as_bytes());
        Ok(())
    }

    /// Writes a string as a `u32` count of UTF-16 code units followed
    /// by the units.
    pub fn write_string(&mut self, value: &str) -> Result<(), ProtocolError> {
        let units: Vec<u16> = value.encode_utf16().collect();
        let count = u32::try_from(units.len())
            .map_err(|_| ProtocolError::Encode("string too long".into()))?;
        self.write_u32(count);
        for unit in units {
            self.write_u16(unit);
        }
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over a byte buffer that may hold a partial frame.
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < n {
            return Err(ProtocolError::Incomplete);
        }
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, ProtocolError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16, ProtocolError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64, ProtocolError> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_be_bytes(raw))
    }

    pub fn read_i32(&mut self) -> Result<i32, ProtocolError> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i64(&mut self) -> Result<i64, ProtocolError> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(i64::from_be_bytes(raw))
    }

    /// Reads a type tag written by [`WireWriter::write_tag`].
    pub fn read_tag(&mut self) -> Result<String, ProtocolError> {
        let len = self.read_u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| ProtocolError::Malformed("type tag is not valid UTF-8".into()))
    }

    /// Reads a string written by [`WireWriter::write_string`].
    pub fn read_string(&mut self) -> Result<String, ProtocolError> {
        let count = self.read_u32()? as usize;
        let mut units = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            units.push(self.read_u16()?);
        }
        String::from_utf16(&units)
            .map_err(|_| ProtocolError::Malformed("string holds unpaired surrogates".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars_round_trip() {
        let mut w = WireWriter::new();
        w.write_u8(7);
        w.write_bool(true);
        w.write_u16(512);
        w.write_u32(70_000);
        w.write_i32(-42);
        w.write_u64(u64::MAX);
        w.write_i64(i64::MIN);

        let bytes = w.into_bytes();
        let mut r = WireReader::new(&bytes);
        assert_eq!(r.read_u8().unwrap(), 7);
        assert!(r.read_bool().unwrap());
        assert_eq!(r.read_u16().unwrap(), 512);
        assert_eq!(r.read_u32().unwrap(), 70_000);
        assert_eq!(r.read_i32().unwrap(), -42);
        assert_eq!(r.read_u64().unwrap(), u64::MAX);
        assert_eq!(r.read_i64().unwrap(), i64::MIN);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn strings_round_trip_through_utf16() {
        let mut w = WireWriter::new();
        w.write_string("héllo ✈ wörld").unwrap();
        let bytes = w.into_bytes();
        let mut r = WireReader::new(&bytes);
        assert_eq!(r.read_string().unwrap(), "héllo ✈ wörld");
    }

    #[test]
    fn string_length_counts_utf16_units_not_bytes() {
        // '𝄞' needs a surrogate pair: two UTF-16 units, four UTF-8 bytes.
        let mut w = WireWriter::new();
        w.write_string("𝄞").unwrap();
        let bytes = w.into_bytes();
        assert_eq!(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]), 2);
        let mut r = WireReader::new(&bytes);
        assert_eq!(r.read_string().unwrap(), "𝄞");
    }

    #[test]
    fn truncated_buffer_reports_incomplete() {
        let mut w = WireWriter::new();
        w.write_tag("chat.say").unwrap();
        w.write_string("hello").unwrap();
        let bytes = w.into_bytes();

        // Every proper prefix must ask for more bytes, never error out.
        for cut in 0..bytes.len() {
            let mut r = WireReader::new(&bytes[..cut]);
            let outcome = r.read_tag().and_then(|_| r.read_string());
            assert!(
                matches!(outcome, Err(ProtocolError::Incomplete)),
                "prefix of {cut} bytes should be incomplete"
            );
        }

        let mut r = WireReader::new(&bytes);
        assert_eq!(r.read_tag().unwrap(), "chat.say");
        assert_eq!(r.read_string().unwrap(), "hello");
        assert_eq!(r.position(), bytes.len());
    }

    #[test]
    fn tag_round_trip() {
        let mut w = WireWriter::new();
        w.write_tag("sys.ping").unwrap();
        let bytes = w.into_bytes();
        let mut r = WireReader::new(&bytes);
        assert_eq!(r.read_tag().unwrap(), "sys.ping");
    }
}
