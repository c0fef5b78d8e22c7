//! Reassembly of delimiter-terminated messages from a byte stream.

use crate::error::{ProtocolError, Result};
use crate::message::Message;
use log::{debug, warn};

/// Byte terminating every message on a stream transport.
pub const FRAME_DELIMITER: u8 = 0x00;
/// Buffer size above which unparsed data is discarded.
pub const MAX_BUFFER_SIZE: usize = 64 * 1024;
/// How much of the newest data survives an overflow.
pub const RETAINED_TAIL: usize = 8 * 1024;

/// Accumulates read chunks and yields complete messages in arrival order.
///
/// A message is only returned once its delimiter has arrived, so a frame split
/// over any number of reads is seen exactly once. Segments that are not valid
/// JSON are logged and skipped without disturbing their neighbours.
#[derive(Debug)]
pub struct FrameParser {
    buffer: Vec<u8>,
    max_buffer: usize,
    retained_tail: usize,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameParser {
    pub fn new() -> Self {
        Self::with_limits(MAX_BUFFER_SIZE, RETAINED_TAIL)
    }

    pub fn with_limits(max_buffer: usize, retained_tail: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_buffer,
            retained_tail: retained_tail.min(max_buffer),
        }
    }

    /// Buffers a chunk. Past the size cap only the newest tail is kept.
    pub fn append(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);

        if self.buffer.len() > self.max_buffer {
            let discarded = self.buffer.len() - self.retained_tail;
            self.buffer.drain(..discarded);
            warn!(
                "Frame buffer exceeded {} bytes, discarded {} oldest bytes",
                self.max_buffer, discarded
            );
        }
    }

    /// Extracts every complete message currently buffered.
    pub fn parse(&mut self) -> Vec<Message> {
        let mut messages = Vec::new();
        let mut consumed = 0;

        while let Some(offset) = self.buffer[consumed..]
            .iter()
            .position(|&b| b == FRAME_DELIMITER)
        {
            let end = consumed + offset;
            let segment = trim_whitespace(&self.buffer[consumed..end]);
            consumed = end + 1;

            if segment.is_empty() {
                continue;
            }

            match serde_json::from_slice::<Message>(segment) {
                Ok(message) => messages.push(message),
                Err(e) => warn!(
                    "Skipping malformed frame ({}): {}",
                    e,
                    String::from_utf8_lossy(segment)
                ),
            }
        }

        if consumed > 0 {
            self.buffer.drain(..consumed);
        }
        if !self.buffer.is_empty() {
            debug!("{} bytes awaiting delimiter", self.buffer.len());
        }

        messages
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Bytes held back waiting for a delimiter.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// Decodes a transport frame that holds exactly one message.
///
/// Trailing delimiters and whitespace are ignored. Input with nothing else in
/// it yields [`ProtocolError::Incomplete`]; anything that is not a message
/// yields [`ProtocolError::InvalidJson`].
pub fn decode_single(data: &[u8]) -> Result<Message> {
    let end = data
        .iter()
        .rposition(|&b| !matches!(b, FRAME_DELIMITER | b'\n' | b'\r' | b' '))
        .map_or(0, |i| i + 1);
    let trimmed = trim_whitespace(&data[..end]);

    if trimmed.is_empty() {
        return Err(ProtocolError::Incomplete);
    }

    Ok(serde_json::from_slice(trimmed)?)
}

fn trim_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}
