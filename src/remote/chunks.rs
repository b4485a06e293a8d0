//! Byte-level decoding of the SSE-framed message stream.
//!
//! HTTP responses arrive as arbitrary byte chunks; a single SSE frame may be
//! split across packets, and one packet may carry several frames. The
//! decoder buffers bytes until a full frame (terminated by a blank line) is
//! available, then strips the `data:` prefixes and parses the payload as
//! JSON. Parsing is strict: a frame that is not valid JSON is an error, not
//! a dropped message.

use miette::Diagnostic;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum TransportError {
    #[error("malformed message: {detail}")]
    #[diagnostic(
        code(flowboard::remote::malformed_message),
        help("The server sent a frame that does not follow the [type, data, next?] protocol.")
    )]
    MalformedMessage { detail: String },

    #[error("transport closed unexpectedly")]
    #[diagnostic(code(flowboard::remote::closed))]
    Closed,
}

impl TransportError {
    pub fn malformed(detail: impl Into<String>) -> Self {
        TransportError::MalformedMessage {
            detail: detail.into(),
        }
    }
}

/// Incremental SSE decoder with frame repair across chunk boundaries.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw response bytes; returns the JSON payload of every frame
    /// completed by this chunk, in order.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Result<Vec<Value>, TransportError> {
        self.buffer.extend_from_slice(bytes);
        let mut payloads = Vec::new();
        while let Some(end) = find_frame_end(&self.buffer) {
            let frame: Vec<u8> = self.buffer.drain(..end + 2).collect();
            if let Some(payload) = decode_frame(&frame[..end])? {
                payloads.push(payload);
            }
        }
        Ok(payloads)
    }

    /// Flush at stream end. A trailing frame without its blank-line
    /// terminator is still decoded; leftover bytes that are not a frame are
    /// an error.
    pub fn finish(&mut self) -> Result<Option<Value>, TransportError> {
        let rest = std::mem::take(&mut self.buffer);
        if rest.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(None);
        }
        decode_frame(&rest)
    }
}

fn find_frame_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|pair| pair == b"\n\n")
}

/// Decode one frame body: join its `data:` lines and parse as JSON.
/// Comment and field lines other than `data` are ignored, per SSE.
fn decode_frame(frame: &[u8]) -> Result<Option<Value>, TransportError> {
    let text = std::str::from_utf8(frame)
        .map_err(|_| TransportError::malformed("frame is not valid UTF-8"))?;
    let mut data_lines = Vec::new();
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
    if data_lines.is_empty() {
        // Comment-only frames are keepalives; anything else is a protocol
        // violation.
        if text
            .lines()
            .all(|line| line.is_empty() || line.starts_with(':'))
        {
            return Ok(None);
        }
        return Err(TransportError::malformed("frame carries no data line"));
    }
    let payload = data_lines.join("\n");
    serde_json::from_str(&payload)
        .map(Some)
        .map_err(|e| TransportError::malformed(format!("invalid JSON payload: {e}")))
}
