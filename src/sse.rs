//! Server-sent-event framing, both directions.
//!
//! Upstream: [`SseLineDecoder`] turns raw body chunks into `data:` payloads.
//! Lines may be split across chunks, and so may multi-byte UTF-8 sequences.
//! Anything that is not a `data:` line is dropped.
//!
//! Downstream: [`token_frame`] / [`DONE_FRAME`] produce the frames sent to the
//! browser.

use serde::Serialize;
use thiserror::Error;

/// Terminal frame written after the last token.
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

const DONE_MARKER: &str = "[DONE]";

/// Longest unterminated line the decoder will hold before giving up.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("upstream sent a line longer than {limit} bytes")]
pub struct LineTooLong {
    pub limit: usize,
}

/// One meaningful line from the upstream stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseLine {
    /// Payload of a `data:` line, trimmed.
    Data(String),
    /// The literal `data: [DONE]` terminator.
    Done,
}

#[derive(Debug, Default)]
pub struct SseLineDecoder {
    buffer: String,
    incomplete_utf8: Vec<u8>,
}

impl SseLineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one network chunk; returns every complete line it finished.
    ///
    /// Fails once the unterminated remainder grows past [`MAX_LINE_BYTES`].
    /// The buffer is dropped at that point.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<SseLine>, LineTooLong> {
        let bytes = if self.incomplete_utf8.is_empty() {
            chunk.to_vec()
        } else {
            let mut combined = std::mem::take(&mut self.incomplete_utf8);
            combined.extend_from_slice(chunk);
            combined
        };

        let (text, rest) = split_utf8(&bytes);
        self.incomplete_utf8 = rest;
        self.buffer.push_str(&text);

        let mut lines = Vec::new();
        while let Some(line_end) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=line_end).collect();
            if let Some(parsed) = parse_line(&line) {
                lines.push(parsed);
            }
        }
        if self.buffer.len() + self.incomplete_utf8.len() > MAX_LINE_BYTES {
            self.buffer.clear();
            self.incomplete_utf8.clear();
            return Err(LineTooLong {
                limit: MAX_LINE_BYTES,
            });
        }
        Ok(lines)
    }

    /// Flush a trailing line that was never newline-terminated.
    pub fn finish(&mut self) -> Option<SseLine> {
        let rest = std::mem::take(&mut self.buffer);
        self.incomplete_utf8.clear();
        parse_line(&rest)
    }

    pub fn has_remaining(&self) -> bool {
        !self.buffer.is_empty() || !self.incomplete_utf8.is_empty()
    }
}

fn parse_line(line: &str) -> Option<SseLine> {
    let line = line.trim_end_matches(['\r', '\n']);
    let payload = line.strip_prefix("data:")?.trim();
    if payload == DONE_MARKER {
        Some(SseLine::Done)
    } else if payload.is_empty() {
        None
    } else {
        Some(SseLine::Data(payload.to_string()))
    }
}

/// Decode as much valid UTF-8 as possible and hand back a trailing partial
/// sequence (at most 3 bytes) for the next chunk. Invalid bytes in the middle
/// are replaced, not carried.
fn split_utf8(bytes: &[u8]) -> (String, Vec<u8>) {
    match std::str::from_utf8(bytes) {
        Ok(s) => (s.to_string(), Vec::new()),
        Err(e) if e.error_len().is_none() => {
            let valid = e.valid_up_to();
            // valid_up_to guarantees this prefix decodes.
            let head = String::from_utf8_lossy(&bytes[..valid]).into_owned();
            (head, bytes[valid..].to_vec())
        }
        Err(_) => (String::from_utf8_lossy(bytes).into_owned(), Vec::new()),
    }
}

#[derive(Serialize)]
struct TokenPayload<'a> {
    token: &'a str,
}

/// `data: {"token":"..."}\n\n` with the fragment JSON-escaped.
pub fn token_frame(token: &str) -> String {
    let json = serde_json::to_string(&TokenPayload { token })
        .unwrap_or_else(|_| String::from("{\"token\":\"\"}"));
    format!("data: {}\n\n", json)
}
