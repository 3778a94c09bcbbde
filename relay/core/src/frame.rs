//! Upstream Frame Protocol
//!
//! The research agent answers with a chunked byte stream of newline-terminated
//! lines. Lines of the form `data: <json>` carry one event each; everything
//! else (blank separators, `: keep-alive` comments) is noise.
//!
//! # Line Format
//!
//! ```text
//! data: {"type":"thinking","content":{"step":"planning", ...}}\n
//! data: {"type":"answer","content":"Hello "}\n
//! data: {"type":"sources","content":[{"url":"https://...","title":"..."}]}\n
//! data: {"type":"done","content":{"thinking_trace":[...]}}\n
//! ```
//!
//! Network chunk boundaries are unrelated to line boundaries. [`FrameDecoder`]
//! keeps a carry-over buffer of raw bytes so that a line split anywhere (inside
//! the `data: ` prefix, inside the JSON payload, or inside a multi-byte UTF-8
//! character) decodes to the same frame as an unsplit one.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Prefix marking a line that carries a frame
pub const DATA_PREFIX: &[u8] = b"data: ";

/// Maximum length of a single line (10 MB)
///
/// A peer that never sends a newline would otherwise grow the buffer forever.
pub const MAX_LINE_LENGTH: usize = 10 * 1024 * 1024;

/// Minimum buffer capacity for decoder
const MIN_BUFFER_CAPACITY: usize = 4096;

// ============================================================================
// Frames
// ============================================================================

/// Discriminant of a [`Frame`], matching the wire `type` field
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    /// Intermediate reasoning step
    Thinking,
    /// Incremental answer text
    Answer,
    /// Cited source candidates
    Sources,
    /// Successful completion
    Done,
    /// Agent-reported failure
    Error,
}

impl FrameKind {
    /// Whether this kind ends the stream
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Thinking => "thinking",
            Self::Answer => "answer",
            Self::Sources => "sources",
            Self::Done => "done",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// One decoded upstream event
///
/// Serializes back to the exact `{"type": ..., "content": ...}` shape it was
/// decoded from, so the client sees what the agent emitted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "lowercase")]
pub enum Frame {
    /// A thinking step (usually an object with `step` and `content`)
    Thinking(Value),
    /// A fragment of answer text
    Answer(String),
    /// Sources discovered by the agent
    Sources(Vec<SourceCandidate>),
    /// The agent finished
    Done(DonePayload),
    /// The agent failed
    Error(Value),
}

impl Frame {
    /// The kind of this frame
    #[must_use]
    pub fn kind(&self) -> FrameKind {
        match self {
            Self::Thinking(_) => FrameKind::Thinking,
            Self::Answer(_) => FrameKind::Answer,
            Self::Sources(_) => FrameKind::Sources,
            Self::Done(_) => FrameKind::Done,
            Self::Error(_) => FrameKind::Error,
        }
    }

    /// Parse the JSON text following a `data: ` prefix
    ///
    /// # Errors
    ///
    /// Returns `FrameError::Malformed` if the payload is not a valid frame.
    pub fn parse(json: &str) -> Result<Self, FrameError> {
        serde_json::from_str(json).map_err(|e| FrameError::Malformed(e.to_string()))
    }

    /// Human-readable message of an `error` frame
    #[must_use]
    pub fn error_message(&self) -> Option<String> {
        match self {
            Self::Error(Value::String(message)) => Some(message.clone()),
            Self::Error(Value::Null) => Some("unknown agent error".to_string()),
            Self::Error(other) => Some(other.to_string()),
            _ => None,
        }
    }
}

/// A source the agent cited
///
/// Fields the relay does not interpret are kept in `extra` and re-emitted.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceCandidate {
    /// Source URL (deduplication key)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Page title
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Short excerpt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    /// Extracted page content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Publication date as reported by the search provider
    #[serde(
        default,
        rename = "published_date",
        alias = "published_at",
        skip_serializing_if = "Option::is_none"
    )]
    pub published_at: Option<String>,
    /// Any other fields
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SourceCandidate {
    /// Create a candidate with just a URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }

    /// Set the title
    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Set the snippet
    #[must_use]
    pub fn with_snippet(mut self, snippet: impl Into<String>) -> Self {
        self.snippet = Some(snippet.into());
        self
    }
}

/// Payload of a `done` frame
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DonePayload {
    /// Final thinking trace; supersedes the streamed steps when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_trace: Option<Vec<Value>>,
    /// Final source list as seen by the agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<SourceCandidate>>,
    /// Any other fields
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// ============================================================================
// Decoder
// ============================================================================

/// A complete `data: ` line that could not be decoded
///
/// Always scoped to a single line; the decoder stays usable afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The line is not valid UTF-8
    #[error("data line is not valid UTF-8")]
    InvalidUtf8,
    /// The JSON payload is not a valid frame
    #[error("malformed frame: {0}")]
    Malformed(String),
    /// No line terminator within `MAX_LINE_LENGTH` bytes
    #[error("line exceeds {max} bytes without a terminator")]
    LineTooLong {
        /// The enforced limit
        max: usize,
    },
}

/// Streaming decoder for `data: ` lines
///
/// Buffers incoming bytes and yields complete frames.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Start of the first unconsumed line
    read_pos: usize,
    /// Bytes before this offset are known to contain no newline
    scan_pos: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Create a new decoder with default buffer capacity
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(MIN_BUFFER_CAPACITY),
            read_pos: 0,
            scan_pos: 0,
        }
    }

    /// Append a network chunk to the buffer
    pub fn push(&mut self, data: &[u8]) {
        // Compact buffer if we've consumed a lot
        if self.read_pos > self.buffer.len() / 2 && self.read_pos > MIN_BUFFER_CAPACITY {
            self.buffer.drain(..self.read_pos);
            self.scan_pos -= self.read_pos;
            self.read_pos = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    /// Number of buffered bytes not yet consumed
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    /// Signal end of input
    ///
    /// A trailing fragment without a terminator is treated as a final line and
    /// becomes visible to [`decode`](Self::decode).
    pub fn finish(&mut self) {
        if self.available() > 0 && self.buffer.last() != Some(&b'\n') {
            self.buffer.push(b'\n');
        }
    }

    /// Try to decode the next frame
    ///
    /// Returns:
    /// - `Ok(Some(frame))` if a complete `data: ` line was decoded
    /// - `Ok(None)` if more data is needed
    /// - `Err(_)` if one complete line was invalid; that line is consumed and
    ///   decoding may continue with the next call
    pub fn decode(&mut self) -> Result<Option<Frame>, FrameError> {
        loop {
            let Some(offset) = self.buffer[self.scan_pos..]
                .iter()
                .position(|&b| b == b'\n')
            else {
                self.scan_pos = self.buffer.len();
                if self.available() > MAX_LINE_LENGTH {
                    self.clear();
                    return Err(FrameError::LineTooLong {
                        max: MAX_LINE_LENGTH,
                    });
                }
                return Ok(None);
            };

            let line_end = self.scan_pos + offset;
            let start = self.read_pos;
            self.read_pos = line_end + 1;
            self.scan_pos = self.read_pos;

            let mut line = &self.buffer[start..line_end];
            if let Some(stripped) = line.strip_suffix(b"\r") {
                line = stripped;
            }

            // Keep-alives and SSE separators
            let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
                continue;
            };

            let json = std::str::from_utf8(payload).map_err(|_| FrameError::InvalidUtf8)?;
            return Frame::parse(json).map(Some);
        }
    }

    /// Clear the buffer
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.read_pos = 0;
        self.scan_pos = 0;
    }
}

/// Decode a complete byte stream delivered as `chunks`
///
/// Convenience wrapper around [`FrameDecoder`] for callers that already hold
/// every chunk.
pub fn decode_all<I, B>(chunks: I) -> Vec<Result<Frame, FrameError>>
where
    I: IntoIterator<Item = B>,
    B: AsRef<[u8]>,
{
    fn drain(decoder: &mut FrameDecoder, out: &mut Vec<Result<Frame, FrameError>>) {
        loop {
            match decoder.decode() {
                Ok(Some(frame)) => out.push(Ok(frame)),
                Ok(None) => break,
                Err(e) => out.push(Err(e)),
            }
        }
    }

    let mut decoder = FrameDecoder::new();
    let mut out = Vec::new();
    for chunk in chunks {
        decoder.push(chunk.as_ref());
        drain(&mut decoder, &mut out);
    }
    decoder.finish();
    drain(&mut decoder, &mut out);
    out
}
