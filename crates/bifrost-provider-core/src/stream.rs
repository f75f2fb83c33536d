use serde::{Deserialize, Serialize};

use bifrost_common::BifrostError;

use crate::request::MessageRole;
use crate::response::{FinishReason, Usage};

/// One element of a streaming response.
///
/// Per stream, `seq` is strictly monotonic from 0 and exactly one chunk is
/// terminal: either `end` is set (successful completion, carrying the final
/// usage and finish reason) or `error` is set. A chunk never carries both.
#[derive(Debug, Clone, Default)]
pub struct StreamChunk {
    pub seq: u64,
    pub delta: Option<ChunkDelta>,
    pub end: Option<StreamEnd>,
    pub error: Option<BifrostError>,
}

impl StreamChunk {
    pub fn delta(seq: u64, delta: ChunkDelta) -> Self {
        Self { seq, delta: Some(delta), end: None, error: None }
    }

    pub fn end(seq: u64, end: StreamEnd) -> Self {
        Self { seq, delta: None, end: Some(end), error: None }
    }

    pub fn error(seq: u64, error: BifrostError) -> Self {
        Self { seq, delta: None, end: None, error: Some(error) }
    }

    pub fn is_terminal(&self) -> bool {
        self.end.is_some() || self.error.is_some()
    }

    /// Clears every field so the carrier can go back to a pool.
    pub fn reset(&mut self) {
        self.seq = 0;
        self.delta = None;
        self.end = None;
        self.error = None;
    }

    pub fn is_reset(&self) -> bool {
        self.seq == 0 && self.delta.is_none() && self.end.is_none() && self.error.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<MessageRole>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallDelta>,
}

impl ChunkDelta {
    pub fn text(text: impl Into<String>) -> Self {
        Self { role: None, text: Some(text.into()), tool_calls: Vec::new() }
    }
}

/// Fragment of a streamed tool call. Fragments for the same call share an
/// `index`; `id` and `name` appear on the first fragment, `arguments` are
/// concatenated across fragments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCallDelta {
    pub index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamEnd {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}
