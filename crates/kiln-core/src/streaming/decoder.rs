//! Incremental decoder for `data: <json>` server-sent event records.
//!
//! Bytes are buffered until a full line is available. Splitting on `\n`
//! never cuts a multi-byte UTF-8 sequence, so characters straddling chunk
//! boundaries are reassembled before decoding.

use serde::Deserialize;
use tracing::{debug, warn};

use super::{Delta, StreamEvent, ToolCallFragment};
use crate::error::{self, KilnError};
use crate::message::Usage;
use crate::provider::FinishReason;

const DATA_PREFIX: &str = "data:";
const DONE_SENTINEL: &str = "[DONE]";
const LOG_PAYLOAD_LIMIT: usize = 200;

/// Turns arbitrary byte chunks into [`StreamEvent`] frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    terminated: bool,
    dropped: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and return every frame completed by it.
    ///
    /// Once the `[DONE]` sentinel has been seen, further input is ignored.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        if self.terminated {
            return Vec::new();
        }
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(frame) = self.decode_line(&line[..line.len() - 1]) {
                frames.push(frame);
            }
            if self.terminated {
                self.buffer.clear();
                break;
            }
        }
        frames
    }

    /// Flush a trailing record that was not newline-terminated.
    pub fn finish(&mut self) -> Option<StreamEvent> {
        if self.terminated || self.buffer.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.buffer);
        self.decode_line(&line)
    }

    /// Whether the end-of-stream sentinel has been received.
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Number of records dropped because they failed to parse.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    fn decode_line(&mut self, raw: &[u8]) -> Option<StreamEvent> {
        let line = match std::str::from_utf8(raw) {
            Ok(s) => std::borrow::Cow::Borrowed(s),
            Err(e) => {
                warn!(error = %e, "Invalid UTF-8 in stream record, decoding lossily");
                String::from_utf8_lossy(raw)
            }
        };
        let line = line.trim();

        // Blank separators, SSE comments and non-data fields carry no frame.
        let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
            return None;
        };
        let payload = payload.trim_start();

        if payload == DONE_SENTINEL {
            debug!("Stream terminator received");
            self.terminated = true;
            return None;
        }
        if payload.is_empty() {
            return None;
        }

        match parse_frame(payload) {
            Ok(frame) => Some(frame),
            Err(e) => {
                self.dropped += 1;
                warn!(
                    error = %e,
                    payload = %truncate(payload, LOG_PAYLOAD_LIMIT),
                    "Dropping malformed stream frame"
                );
                None
            }
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

// ─── Wire shape ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WireChunk {
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    #[serde(default)]
    delta: WireDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireDelta {
    #[serde(default, alias = "reasoning")]
    reasoning_content: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<WireFunction>,
}

#[derive(Debug, Default, Deserialize)]
struct WireFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    completion_tokens_details: Option<WireCompletionDetails>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireCompletionDetails {
    #[serde(default)]
    reasoning_tokens: Option<u64>,
}

impl From<WireUsage> for Usage {
    fn from(u: WireUsage) -> Self {
        Usage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
            reasoning_tokens: u.completion_tokens_details.and_then(|d| d.reasoning_tokens),
        }
    }
}

/// Parse one `data:` payload into a frame.
///
/// Only the first choice is considered. Empty text deltas are dropped so
/// that channel start notifications fire on real text only.
pub fn parse_frame(payload: &str) -> error::Result<StreamEvent> {
    let chunk: WireChunk = serde_json::from_str(payload)
        .map_err(|e| KilnError::parse(format!("Invalid stream frame: {e}")))?;

    let mut frame = StreamEvent {
        usage: chunk.usage.map(Usage::from),
        ..Default::default()
    };

    if let Some(choice) = chunk.choices.into_iter().next() {
        let WireDelta {
            reasoning_content,
            content,
            tool_calls,
        } = choice.delta;

        if let Some(text) = reasoning_content.filter(|t| !t.is_empty()) {
            frame.deltas.push(Delta::Reasoning { text });
        }
        if let Some(text) = content.filter(|t| !t.is_empty()) {
            frame.deltas.push(Delta::Content { text });
        }
        for tc in tool_calls.unwrap_or_default() {
            let function = tc.function.unwrap_or_default();
            frame.deltas.push(Delta::ToolCall(ToolCallFragment {
                index: tc.index,
                id: tc.id,
                function_name: function.name,
                arguments_chunk: function.arguments.unwrap_or_default(),
            }));
        }

        if let Some(reason) = choice.finish_reason {
            frame.finished = true;
            frame.finish_reason = Some(FinishReason::from_wire(&reason));
        }
    }

    Ok(frame)
}
