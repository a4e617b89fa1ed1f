//! dqlite message body writer.

#![allow(clippy::cast_possible_truncation)]

use crate::{HEADER_SIZE, Header, WORD_SIZE, padding};

/// A writer for dqlite message bodies.
///
/// Integers are little-endian. Text and blobs are padded to the next word
/// so every field after them starts aligned.
#[derive(Debug, Default)]
pub struct WireWriter {
    buffer: Vec<u8>,
}

impl WireWriter {
    /// Create a new writer with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(64)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_f64(&mut self, value: f64) {
        self.buffer.extend_from_slice(&value.to_bits().to_le_bytes());
    }

    /// Write a NUL-terminated string padded to a word boundary.
    pub fn write_text(&mut self, s: &str) {
        self.buffer.extend_from_slice(s.as_bytes());
        self.buffer.push(0);
        self.pad();
    }

    /// Write a u64 length followed by the bytes, padded to a word boundary.
    pub fn write_blob(&mut self, data: &[u8]) {
        self.write_u64(data.len() as u64);
        self.buffer.extend_from_slice(data);
        self.pad();
    }

    /// Zero-fill up to the next word boundary.
    pub fn pad(&mut self) {
        let n = padding(self.buffer.len());
        self.buffer.resize(self.buffer.len() + n, 0);
    }

    /// Wrap the body in a header, producing a complete frame.
    pub fn into_frame(mut self, kind: u8, schema: u8) -> Vec<u8> {
        self.pad();
        let header = Header {
            words: (self.buffer.len() / WORD_SIZE) as u32,
            kind,
            schema,
        };
        let mut frame = Vec::with_capacity(HEADER_SIZE + self.buffer.len());
        frame.extend_from_slice(&header.to_bytes());
        frame.extend_from_slice(&self.buffer);
        frame
    }
}
