//! Fixed-capacity wire buffer with typed little-endian codecs
//!
//! A `RawBuffer` is one network frame in the making (write mode) or one
//! received frame being picked apart (read mode). Integers are little-endian,
//! strings are NUL-terminated, and the capacity is a hard 500 bytes.
//!
//! Overflowing the buffer on write is a programming error (callers must
//! pre-validate with [`Packet::size_hint`](crate::Packet::size_hint)) and
//! panics. Running off the end on read is a data error and returns
//! `EngineError::InvalidData`.

use bytes::{BufMut, BytesMut};
use gamewire_core::{EngineError, Result};

/// Hard capacity of one frame, in bytes.
pub const RAW_BUFFER_SIZE: usize = 500;

/// A bounded byte buffer with a write cursor and a read cursor
///
/// # Thread Safety
/// Not shared; each buffer belongs to exactly one task at a time.
pub struct RawBuffer {
    buf: BytesMut,
    read_pos: usize,
}

impl RawBuffer {
    /// Create an empty buffer for writing
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(RAW_BUFFER_SIZE),
            read_pos: 0,
        }
    }

    /// Wrap received bytes for reading
    ///
    /// Frames longer than [`RAW_BUFFER_SIZE`] are rejected up front; a peer
    /// that sends one is not speaking this protocol.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() > RAW_BUFFER_SIZE {
            return Err(EngineError::InvalidData(format!(
                "frame of {} bytes exceeds the {} byte limit",
                data.len(),
                RAW_BUFFER_SIZE
            )));
        }
        Ok(Self {
            buf: BytesMut::from(data),
            read_pos: 0,
        })
    }

    /// Bytes written so far
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes consumed by reads so far
    pub fn consumed(&self) -> usize {
        self.read_pos
    }

    /// Bytes still readable
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.read_pos
    }

    /// Rewind the read cursor to the start
    pub fn reset(&mut self) {
        self.read_pos = 0;
    }

    /// The written bytes, ready to hand to a transport
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    fn check_write(&self, n: usize) {
        assert!(
            self.buf.len() + n <= RAW_BUFFER_SIZE,
            "raw buffer overflow: {} + {} exceeds {} (size_hint under-reported?)",
            self.buf.len(),
            n,
            RAW_BUFFER_SIZE
        );
    }

    fn take(&mut self, n: usize) -> Result<&[u8]> {
        if self.remaining() < n {
            return Err(EngineError::InvalidData(format!(
                "buffer underflow: wanted {} bytes, {} remain",
                n,
                self.remaining()
            )));
        }
        let start = self.read_pos;
        self.read_pos += n;
        Ok(&self.buf[start..self.read_pos])
    }

    #[inline]
    pub fn write_u8(&mut self, val: u8) {
        self.check_write(1);
        self.buf.put_u8(val);
    }

    #[inline]
    pub fn write_i8(&mut self, val: i8) {
        self.check_write(1);
        self.buf.put_i8(val);
    }

    #[inline]
    pub fn write_u16(&mut self, val: u16) {
        self.check_write(2);
        self.buf.put_u16_le(val);
    }

    #[inline]
    pub fn write_i16(&mut self, val: i16) {
        self.check_write(2);
        self.buf.put_i16_le(val);
    }

    #[inline]
    pub fn write_u32(&mut self, val: u32) {
        self.check_write(4);
        self.buf.put_u32_le(val);
    }

    #[inline]
    pub fn write_i32(&mut self, val: i32) {
        self.check_write(4);
        self.buf.put_i32_le(val);
    }

    #[inline]
    pub fn write_f32(&mut self, val: f32) {
        self.check_write(4);
        self.buf.put_f32_le(val);
    }

    #[inline]
    pub fn write_f64(&mut self, val: f64) {
        self.check_write(8);
        self.buf.put_f64_le(val);
    }

    /// Write a time span as whole seconds plus microseconds (8 bytes)
    pub fn write_duration(&mut self, val: std::time::Duration) {
        self.write_u32(val.as_secs() as u32);
        self.write_u32(val.subsec_micros());
    }

    /// Read a time span written by [`write_duration`](Self::write_duration)
    pub fn read_duration(&mut self) -> Result<std::time::Duration> {
        let secs = self.read_u32()?;
        let micros = self.read_u32()?;
        if micros >= 1_000_000 {
            return Err(EngineError::InvalidData(format!(
                "microsecond field out of range: {}",
                micros
            )));
        }
        Ok(std::time::Duration::new(secs as u64, micros * 1_000))
    }

    /// Write a NUL-terminated string
    ///
    /// The string must not itself contain NUL; that would shift the
    /// terminator and corrupt everything after it.
    pub fn write_str(&mut self, val: &str) {
        let bytes = val.as_bytes();
        assert!(
            !bytes.contains(&0),
            "strings on the wire are NUL-terminated and cannot contain NUL"
        );
        self.check_write(bytes.len() + 1);
        self.buf.put_slice(bytes);
        self.buf.put_u8(0);
    }

    /// Write a raw byte block (no length marker)
    pub fn write_raw(&mut self, block: &[u8]) {
        self.check_write(block.len());
        self.buf.put_slice(block);
    }

    #[inline]
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    #[inline]
    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.take(1)?[0] as i8)
    }

    #[inline]
    pub fn read_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    #[inline]
    pub fn read_i16(&mut self) -> Result<i16> {
        let b = self.take(2)?;
        Ok(i16::from_le_bytes([b[0], b[1]]))
    }

    #[inline]
    pub fn read_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    #[inline]
    pub fn read_i32(&mut self) -> Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    #[inline]
    pub fn read_f32(&mut self) -> Result<f32> {
        let b = self.take(4)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    #[inline]
    pub fn read_f64(&mut self) -> Result<f64> {
        let b = self.take(8)?;
        Ok(f64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Read a NUL-terminated string
    pub fn read_str(&mut self) -> Result<String> {
        let rest = &self.buf[self.read_pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| EngineError::InvalidData("unterminated string".into()))?;
        let s = String::from_utf8(rest[..nul].to_vec())
            .map_err(|e| EngineError::InvalidData(format!("invalid UTF-8 in string: {}", e)))?;
        self.read_pos += nul + 1;
        Ok(s)
    }

    /// Read a raw byte block of known length
    pub fn read_raw(&mut self, len: usize) -> Result<Vec<u8>> {
        Ok(self.take(len)?.to_vec())
    }
}

impl Default for RawBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u8_roundtrip() {
        let test_cases = vec![0u8, 1, 127, 128, 255];

        for val in test_cases {
            let mut buf = RawBuffer::new();
            buf.write_u8(val);
            assert_eq!(buf.len(), 1);
            let decoded = buf.read_u8().unwrap();
            assert_eq!(val, decoded, "Failed for {}", val);
        }
    }

    #[test]
    fn test_signed_roundtrip() {
        let mut buf = RawBuffer::new();
        buf.write_i8(-1);
        buf.write_i16(-12345);
        buf.write_i32(-1_000_000);
        assert_eq!(buf.len(), 1 + 2 + 4);
        assert_eq!(buf.read_i8().unwrap(), -1);
        assert_eq!(buf.read_i16().unwrap(), -12345);
        assert_eq!(buf.read_i32().unwrap(), -1_000_000);
    }

    #[test]
    fn test_unsigned_roundtrip() {
        let mut buf = RawBuffer::new();
        buf.write_u16(65535);
        buf.write_u32(0xDEADBEEF);
        assert_eq!(buf.read_u16().unwrap(), 65535);
        assert_eq!(buf.read_u32().unwrap(), 0xDEADBEEF);
    }

    #[test]
    fn test_float_roundtrip() {
        let mut buf = RawBuffer::new();
        buf.write_f32(3.5);
        buf.write_f64(-0.125);
        assert_eq!(buf.read_f32().unwrap(), 3.5);
        assert_eq!(buf.read_f64().unwrap(), -0.125);
    }

    #[test]
    fn test_string_roundtrip() {
        let test_cases = vec!["", "hello", "two words", "ünïcode"];

        for val in test_cases {
            let mut buf = RawBuffer::new();
            buf.write_str(val);
            assert_eq!(buf.len(), val.len() + 1);
            let decoded = buf.read_str().unwrap();
            assert_eq!(val, decoded, "Failed for {:?}", val);
        }
    }

    #[test]
    fn test_duration_roundtrip() {
        use std::time::Duration;
        let test_cases = vec![
            Duration::ZERO,
            Duration::from_millis(16),
            Duration::new(3600, 999_999_000),
        ];

        for val in test_cases {
            let mut buf = RawBuffer::new();
            buf.write_duration(val);
            assert_eq!(buf.len(), 8);
            let decoded = buf.read_duration().unwrap();
            assert_eq!(val, decoded, "Failed for {:?}", val);
        }
    }

    #[test]
    fn test_duration_rejects_bad_micros() {
        let mut buf = RawBuffer::new();
        buf.write_u32(1);
        buf.write_u32(2_000_000);
        assert!(buf.read_duration().is_err());
    }

    #[test]
    fn test_little_endian_layout() {
        let mut buf = RawBuffer::new();
        buf.write_u16(0x0102);
        buf.write_u32(0x03040506);
        assert_eq!(buf.as_slice(), &[0x02, 0x01, 0x06, 0x05, 0x04, 0x03]);
    }

    #[test]
    fn test_consumed_tracks_reads() {
        let mut buf = RawBuffer::new();
        buf.write_u32(7);
        buf.write_str("x");
        assert_eq!(buf.consumed(), 0);
        buf.read_u32().unwrap();
        assert_eq!(buf.consumed(), 4);
        buf.read_str().unwrap();
        assert_eq!(buf.consumed(), 6);
        assert_eq!(buf.remaining(), 0);
    }

    #[test]
    fn test_reset_rewinds_reads() {
        let mut buf = RawBuffer::new();
        buf.write_u16(42);
        assert_eq!(buf.read_u16().unwrap(), 42);
        buf.reset();
        assert_eq!(buf.read_u16().unwrap(), 42);
    }

    #[test]
    fn test_underflow_is_an_error() {
        let mut buf = RawBuffer::from_bytes(&[1, 2]).unwrap();
        assert!(buf.read_u32().is_err());

        let mut buf = RawBuffer::from_bytes(b"no terminator").unwrap();
        assert!(buf.read_str().is_err());
    }

    #[test]
    #[should_panic(expected = "raw buffer overflow")]
    fn test_overflow_panics() {
        let mut buf = RawBuffer::new();
        let block = [0u8; 400];
        buf.write_raw(&block);
        buf.write_raw(&block);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let data = vec![0u8; RAW_BUFFER_SIZE + 1];
        assert!(RawBuffer::from_bytes(&data).is_err());
    }
}
