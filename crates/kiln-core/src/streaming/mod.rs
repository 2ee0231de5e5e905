//! Streaming protocol types and the client that consumes them.
//!
//! A provider's chunked response is decoded into [`StreamEvent`] frames by
//! [`decoder::FrameDecoder`]. [`client::StreamClient`] walks those frames,
//! splitting them into reasoning, content and tool-call channels, and hands
//! tool-call fragments to a per-stream [`accumulator::ToolCallAccumulator`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{self, KilnError};
use crate::message::Usage;
use crate::provider::FinishReason;

pub mod accumulator;
pub mod client;
pub mod decoder;

pub use accumulator::ToolCallAccumulator;
pub use client::{ClientEvent, StreamClient, StreamHandler, StreamRequest};
pub use decoder::FrameDecoder;

/// One decoded protocol frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub deltas: Vec<Delta>,
    pub finished: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl StreamEvent {
    pub fn with_deltas(deltas: Vec<Delta>) -> Self {
        Self {
            deltas,
            ..Default::default()
        }
    }

    pub fn finish(reason: FinishReason) -> Self {
        Self {
            deltas: Vec::new(),
            finished: true,
            finish_reason: Some(reason),
            usage: None,
        }
    }
}

/// One incremental fragment of model output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Delta {
    Reasoning { text: String },
    Content { text: String },
    ToolCall(ToolCallFragment),
}

/// Partial data for the tool call at `index`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallFragment {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    pub arguments_chunk: String,
}

/// A tool call as assembled so far.
///
/// `arguments` is only guaranteed to be valid JSON once the stream that
/// produced it has completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccumulatedToolCall {
    pub id: String,
    pub function_name: String,
    pub arguments: String,
}

impl AccumulatedToolCall {
    /// Parse the accumulated arguments. Empty arguments parse as `{}`.
    pub fn parse_arguments(&self) -> error::Result<serde_json::Value> {
        if self.arguments.trim().is_empty() {
            return Ok(serde_json::Value::Object(serde_json::Map::new()));
        }
        serde_json::from_str(&self.arguments).map_err(|e| {
            KilnError::parse(format!(
                "Arguments of tool call '{}' ({}) are not valid JSON: {e}",
                self.id, self.function_name
            ))
        })
    }
}

/// Terminal aggregate of one stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamResult {
    pub reasoning: String,
    pub content: String,
    pub tool_calls: BTreeMap<usize, AccumulatedToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl StreamResult {
    /// Tool calls in index order.
    pub fn ordered_tool_calls(&self) -> impl Iterator<Item = &AccumulatedToolCall> {
        self.tool_calls.values()
    }
}
