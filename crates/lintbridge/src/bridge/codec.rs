//! Marker-delimited JSON framing for worker communication.
//!
//! A frame is `OPEN_MARKER + json + CLOSE_MARKER`. The worker's output also
//! carries free text (install logs, engine chatter), so anything outside a
//! complete frame is surfaced as [`Chunk::Text`] and never as an error.
//!
//! [`encode`] and [`decode`] work on whole chunks. [`FrameCodec`] buffers
//! across reads for use with `FramedRead`/`FramedWrite`.
//!
//! Both markers start with `{{{`. Valid JSON only contains that sequence
//! inside strings, so [`encode`] escapes its third brace as `\u007b` and a
//! frame body never contains a marker.

use std::io;

use serde::Serialize;
use tokio_util::bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

pub const OPEN_MARKER: &str = "{{{stylelint-json-start}}}";
pub const CLOSE_MARKER: &str = "{{{stylelint-json-end}}}";

/// Default cap on an unterminated frame before its bytes are given up as text.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

const MARKER_PREFIX: &str = "{{{";
const ESCAPED_PREFIX: &str = "{{\\u007b";

/// Wrap a payload in frame markers.
pub fn encode<T: Serialize + ?Sized>(payload: &T) -> serde_json::Result<String> {
    let mut json = serde_json::to_string(payload)?;
    if json.contains(MARKER_PREFIX) {
        json = json.replace(MARKER_PREFIX, ESCAPED_PREFIX);
    }
    let mut framed = String::with_capacity(OPEN_MARKER.len() + json.len() + CLOSE_MARKER.len());
    framed.push_str(OPEN_MARKER);
    framed.push_str(&json);
    framed.push_str(CLOSE_MARKER);
    Ok(framed)
}

/// Parse a chunk that is exactly one frame.
///
/// Returns `None` for anything that is not: plain text, text carrying only one
/// of the markers, text around a frame, or a frame whose body is not JSON.
pub fn decode(chunk: &[u8]) -> Option<serde_json::Value> {
    let open = OPEN_MARKER.as_bytes();
    let close = CLOSE_MARKER.as_bytes();
    if chunk.len() < open.len() + close.len()
        || !chunk.starts_with(open)
        || !chunk.ends_with(close)
    {
        return None;
    }
    serde_json::from_slice(&chunk[open.len()..chunk.len() - close.len()]).ok()
}

/// One item read from a worker stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Chunk {
    /// A complete frame with a JSON body.
    Message(serde_json::Value),
    /// Anything else. Callers log it and move on.
    Text(String),
}

/// Streaming codec for marker-framed JSON.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_bytes: usize,
    /// Bytes of the buffered frame already searched for the close marker.
    scanned: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_frame_bytes(DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            scanned: 0,
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Length of the longest suffix of `buf` that is a proper prefix of `marker`.
fn partial_marker_len(buf: &[u8], marker: &[u8]) -> usize {
    let max = buf.len().min(marker.len() - 1);
    (1..=max)
        .rev()
        .find(|&n| buf.ends_with(&marker[..n]))
        .unwrap_or(0)
}

fn text(bytes: BytesMut) -> Chunk {
    Chunk::Text(String::from_utf8_lossy(&bytes).into_owned())
}

impl Decoder for FrameCodec {
    type Item = Chunk;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let open = OPEN_MARKER.as_bytes();
        let close = CLOSE_MARKER.as_bytes();

        if src.starts_with(open) {
            let from = self.scanned.max(open.len());
            return match find(&src[from..], close) {
                Some(offset) => {
                    self.scanned = 0;
                    let frame = src.split_to(from + offset + close.len());
                    match decode(&frame) {
                        Some(value) => Ok(Some(Chunk::Message(value))),
                        None => {
                            tracing::warn!(
                                frame_bytes = frame.len(),
                                "Frame body is not valid JSON, treating as text"
                            );
                            Ok(Some(text(frame)))
                        }
                    }
                }
                None if src.len() > self.max_frame_bytes => {
                    self.scanned = 0;
                    tracing::warn!(
                        buffered_bytes = src.len(),
                        max_frame_bytes = self.max_frame_bytes,
                        "Unterminated frame exceeds limit, discarding as text"
                    );
                    Ok(Some(text(src.split())))
                }
                None => {
                    // A close marker may straddle the next read.
                    self.scanned = src.len() + 1 - close.len();
                    Ok(None)
                }
            };
        }

        match find(src, open) {
            Some(start) => Ok(Some(text(src.split_to(start)))),
            None => {
                let held = partial_marker_len(src, open);
                let ready = src.len() - held;
                if ready == 0 {
                    Ok(None)
                } else {
                    Ok(Some(text(src.split_to(ready))))
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(chunk) => Ok(Some(chunk)),
            None if src.is_empty() => Ok(None),
            None => {
                self.scanned = 0;
                Ok(Some(text(src.split())))
            }
        }
    }
}

impl<T: Serialize> Encoder<T> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let framed =
            encode(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(frame_bytes = framed.len(), "Encoding frame");
        dst.reserve(framed.len());
        dst.put_slice(framed.as_bytes());
        Ok(())
    }
}
