//! Newline-delimited record framing
//!
//! One JSON record per line. The codec accumulates raw socket reads and
//! yields complete lines; partial input returns `Ok(None)` until the rest
//! arrives.

use bytes::{Bytes, BytesMut};
use std::io;

/// Maximum size of a single record line (64 KB)
pub const MAX_LINE_SIZE: usize = 64 * 1024;

/// Streaming decoder for newline-delimited records
#[derive(Debug)]
pub struct LineCodec {
    buffer: BytesMut,
    max_line: usize,
}

impl LineCodec {
    /// Create a new codec with the default line limit
    pub fn new() -> Self {
        Self::with_max_line(MAX_LINE_SIZE)
    }

    /// Create a new codec with a specific line limit
    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            max_line,
        }
    }

    /// Feed raw bytes into the codec
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode the next complete line, newline and any trailing
    /// carriage return stripped.
    ///
    /// Returns `Ok(None)` when more data is needed. A line exceeding the
    /// limit is an error; the connection should be torn down since the
    /// stream can no longer be trusted to frame correctly.
    pub fn decode_next(&mut self) -> io::Result<Option<Bytes>> {
        match self.buffer.iter().position(|&b| b == b'\n') {
            Some(idx) => {
                if idx > self.max_line {
                    return Err(oversize(idx, self.max_line));
                }
                let mut line = self.buffer.split_to(idx + 1);
                line.truncate(idx);
                if line.last() == Some(&b'\r') {
                    line.truncate(idx - 1);
                }
                Ok(Some(line.freeze()))
            }
            None if self.buffer.len() > self.max_line => {
                Err(oversize(self.buffer.len(), self.max_line))
            }
            None => Ok(None),
        }
    }

    /// Get the current buffer length
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Clear the buffer
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn oversize(len: usize, max: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("record too large: {} bytes (max: {})", len, max),
    )
}
