//! dqlite message body reader.

#![allow(clippy::cast_possible_truncation)]

use crate::{WORD_SIZE, padding};

/// A reader over a dqlite message body.
///
/// Reads return `None` when the body is too short; callers turn that into
/// a protocol error naming the field.
#[derive(Debug)]
pub struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Get remaining bytes in the buffer.
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        let byte = self.data.get(self.pos)?;
        self.pos += 1;
        Some(*byte)
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        let bytes = self.read_bytes(4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_u64(&mut self) -> Option<u64> {
        let bytes: [u8; 8] = self.read_bytes(8)?.try_into().ok()?;
        Some(u64::from_le_bytes(bytes))
    }

    pub fn read_i64(&mut self) -> Option<i64> {
        self.read_u64().map(|v| v as i64)
    }

    pub fn read_f64(&mut self) -> Option<f64> {
        self.read_u64().map(f64::from_bits)
    }

    /// Peek at the next word without advancing.
    pub fn peek_u64(&self) -> Option<u64> {
        let bytes: [u8; 8] = self.data.get(self.pos..self.pos + 8)?.try_into().ok()?;
        Some(u64::from_le_bytes(bytes))
    }

    /// Read raw bytes without padding.
    pub fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let bytes = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(bytes)
    }

    /// Read a NUL-terminated string and skip its padding.
    ///
    /// Returns `None` if the terminator is missing. The bytes are not
    /// checked for UTF-8; see [`read_text`](Self::read_text).
    pub fn read_text_bytes(&mut self) -> Option<&'a [u8]> {
        let rest = self.data.get(self.pos..)?;
        let nul = rest.iter().position(|&b| b == 0)?;
        let text = &rest[..nul];
        let consumed = nul + 1;
        self.pos += consumed;
        self.skip(padding(consumed))?;
        Some(text)
    }

    /// Read a NUL-terminated UTF-8 string.
    ///
    /// `Some(Err(_))` means the field was present but not valid UTF-8.
    pub fn read_text(&mut self) -> Option<Result<&'a str, std::str::Utf8Error>> {
        self.read_text_bytes().map(std::str::from_utf8)
    }

    /// Read a u64-length-prefixed blob and skip its padding.
    pub fn read_blob(&mut self) -> Option<&'a [u8]> {
        let len = usize::try_from(self.read_u64()?).ok()?;
        let bytes = self.read_bytes(len)?;
        self.skip(padding(len))?;
        Some(bytes)
    }

    /// Skip `n` bytes.
    pub fn skip(&mut self, n: usize) -> Option<()> {
        self.read_bytes(n).map(|_| ())
    }

    /// Skip to the next word boundary relative to the body start.
    pub fn align(&mut self) -> Option<()> {
        self.skip(padding(self.pos % WORD_SIZE))
    }
}
