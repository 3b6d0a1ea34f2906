//! Server-sent event decoding for the Anthropic-style backends.
//!
//! Two wire formats arrive here. The vendor's own stream carries the event
//! type inside each `data:` payload. A relay names the event on a separate
//! `event:` line and sends a flat payload. Both are normalized into
//! [`StreamChunk`]s; malformed payloads are skipped.

use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::Value;

use super::base::{ChunkStream, StreamChunk, ToolCallAnnouncement};
use crate::errors::{ForgeError, ForgeResult};

/// One `event:`/`data:` block of an SSE stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    /// Parse a single block. Multiple `data:` lines are joined with newlines
    /// as the SSE format requires. Blocks without data yield `None`.
    pub fn parse(block: &str) -> Option<Self> {
        let mut event = None;
        let mut data: Vec<&str> = Vec::new();
        for line in block.lines() {
            if let Some(name) = line.strip_prefix("event:") {
                event = Some(name.trim().to_string());
            } else if let Some(d) = line.strip_prefix("data:") {
                data.push(d.strip_prefix(' ').unwrap_or(d));
            }
        }
        if data.is_empty() {
            return None;
        }
        Some(Self {
            event,
            data: data.join("\n"),
        })
    }
}

/// Accumulates raw bytes and splits off complete SSE blocks.
///
/// Bytes are only decoded once a whole block has arrived, so a character
/// split across two reads survives.
#[derive(Debug, Default)]
pub struct SseBuffer {
    buf: Vec<u8>,
}

impl SseBuffer {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseFrame> {
        self.buf.extend(bytes.iter().copied().filter(|b| *b != b'\r'));

        let mut frames = Vec::new();
        while let Some(pos) = self.buf.windows(2).position(|w| w == b"\n\n") {
            let block: Vec<u8> = self.buf.drain(..pos + 2).collect();
            if let Some(frame) = SseFrame::parse(&String::from_utf8_lossy(&block)) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Whatever is left once the body ends
    pub fn finish(&mut self) -> Option<SseFrame> {
        let rest = std::mem::take(&mut self.buf);
        let rest = String::from_utf8_lossy(&rest);
        if rest.trim().is_empty() {
            None
        } else {
            SseFrame::parse(&rest)
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NativeEvent {
    ContentBlockStart {
        content_block: NativeBlock,
    },
    ContentBlockDelta {
        delta: NativeDelta,
    },
    MessageStop,
    Error {
        error: NativeError,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NativeBlock {
    ToolUse {
        id: String,
        name: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
pub struct NativeDelta {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct NativeError {
    #[serde(default)]
    pub message: String,
}

/// Decode one frame of the vendor's own stream
pub fn decode_native(frame: &SseFrame) -> Option<ForgeResult<StreamChunk>> {
    if frame.data == "[DONE]" {
        return Some(Ok(StreamChunk::done()));
    }
    let event: NativeEvent = match serde_json::from_str(&frame.data) {
        Ok(event) => event,
        Err(e) => {
            tracing::debug!("skipping malformed stream event: {e}");
            return None;
        }
    };
    match event {
        NativeEvent::ContentBlockDelta { delta } => delta
            .text
            .filter(|text| !text.is_empty())
            .map(|text| Ok(StreamChunk::text(text))),
        NativeEvent::ContentBlockStart {
            content_block: NativeBlock::ToolUse { id, name },
        } => Some(Ok(StreamChunk::tool_call(ToolCallAnnouncement {
            id: Some(id),
            name,
        }))),
        NativeEvent::MessageStop => Some(Ok(StreamChunk::done())),
        NativeEvent::Error { error } => Some(Err(ForgeError::provider(
            "anthropic",
            format!("stream error: {}", error.message),
        ))),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayEvent {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        name: String,
    },
    ToolResult,
    Error {
        #[serde(default)]
        message: String,
    },
    Done,
    #[serde(other)]
    Unknown,
}

impl RelayEvent {
    /// The relay names the event on its own line; fold it into the payload
    /// so the tagged representation applies.
    pub fn from_frame(frame: &SseFrame) -> Option<Self> {
        let mut payload: Value = serde_json::from_str(&frame.data).ok()?;
        let object = payload.as_object_mut()?;
        if let Some(event) = &frame.event {
            object.insert("type".to_string(), Value::String(event.clone()));
        }
        serde_json::from_value(payload).ok()
    }
}

/// Decode one frame of a relay stream
pub fn decode_relay(frame: &SseFrame) -> Option<ForgeResult<StreamChunk>> {
    if frame.event.as_deref() == Some("done") {
        return Some(Ok(StreamChunk::done()));
    }
    let Some(event) = RelayEvent::from_frame(frame) else {
        tracing::debug!("skipping malformed relay event");
        return None;
    };
    match event {
        RelayEvent::Text { text } if !text.is_empty() => Some(Ok(StreamChunk::text(text))),
        RelayEvent::ToolUse { id, name } if !name.is_empty() => {
            Some(Ok(StreamChunk::tool_call(ToolCallAnnouncement { id, name })))
        }
        RelayEvent::Error { message } if !message.is_empty() => Some(Ok(StreamChunk::text(
            format!("\n[Error: {}]\n", message),
        ))),
        RelayEvent::Done => Some(Ok(StreamChunk::done())),
        _ => None,
    }
}

/// Turn a response body into a normalized chunk stream. The stream stops at
/// the first terminal chunk or error, and ends with a terminal chunk even if
/// the body closes without one.
pub fn decode_sse<S, B, E, F>(provider: &'static str, body: S, decode: F) -> ChunkStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: std::fmt::Display + Send,
    F: Fn(&SseFrame) -> Option<ForgeResult<StreamChunk>> + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut body = Box::pin(body);
        let mut buffer = SseBuffer::default();
        while let Some(bytes) = body.next().await {
            let bytes = match bytes {
                Ok(bytes) => bytes,
                Err(e) => {
                    yield Err(ForgeError::provider(provider, format!("stream interrupted: {e}")));
                    return;
                }
            };
            for frame in buffer.push(bytes.as_ref()) {
                if let Some(item) = decode(&frame) {
                    let terminal = !matches!(&item, Ok(chunk) if !chunk.done);
                    yield item;
                    if terminal {
                        return;
                    }
                }
            }
        }
        if let Some(frame) = buffer.finish() {
            if let Some(item) = decode(&frame) {
                let terminal = !matches!(&item, Ok(chunk) if !chunk.done);
                yield item;
                if terminal {
                    return;
                }
            }
        }
        yield Ok(StreamChunk::done());
    };
    stream.boxed()
}
