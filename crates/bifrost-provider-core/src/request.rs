use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::operation::Operation;

/// A single dispatchable request. Immutable once handed to the dispatcher;
/// per-request mutable state lives in the request context instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BifrostRequest {
    pub provider: String,
    pub model: String,
    pub operation: Operation,
    pub payload: RequestPayload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<ModelParams>,
    /// Ordered alternates tried by the fallback orchestrator when the
    /// primary target fails with a fallback-eligible error.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fallbacks: Vec<FallbackTarget>,
    /// Present iff the request opts into MCP tool discovery and execution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolOptions>,
}

impl BifrostRequest {
    pub fn new(
        provider: impl Into<String>,
        model: impl Into<String>,
        operation: Operation,
        payload: RequestPayload,
    ) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            operation,
            payload,
            params: None,
            fallbacks: Vec::new(),
            tools: None,
        }
    }

    pub fn with_params(mut self, params: ModelParams) -> Self {
        self.params = Some(params);
        self
    }

    pub fn with_fallbacks(mut self, fallbacks: Vec<FallbackTarget>) -> Self {
        self.fallbacks = fallbacks;
        self
    }

    pub fn with_tools(mut self, tools: ToolOptions) -> Self {
        self.tools = Some(tools);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackTarget {
    pub provider: String,
    pub model: String,
}

impl FallbackTarget {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

/// Operation-discriminated request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum RequestPayload {
    Chat(ChatRequest),
    Text(TextRequest),
    Embedding(EmbeddingRequest),
    Speech(SpeechRequest),
    Transcription(TranscriptionRequest),
    Image(ImageRequest),
    File(FilePayload),
    Batch(BatchPayload),
    Container(ContainerPayload),
    /// Operations with no body (`list_models`).
    Empty,
}

/// Sampling and decoding parameters shared across chat-like operations.
/// Unknown provider-specific knobs ride along in `extra` untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Set on `Tool` role messages: the id of the call being answered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self::text(MessageRole::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::text(MessageRole::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::text(MessageRole::Assistant, text)
    }

    pub fn tool_result(call_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: Some(MessageContent::Text(text.into())),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }

    fn text(role: MessageRole, text: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(MessageContent::Text(text.into())),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Flattened text content, empty for non-text parts.
    pub fn content_text(&self) -> String {
        match &self.content {
            Some(MessageContent::Text(text)) => text.clone(),
            Some(MessageContent::Parts(parts)) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join(""),
            None => String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { url: String },
}

/// A model-requested tool invocation as carried on assistant messages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// JSON-encoded argument object; streamed as raw fragments.
    #[serde(default)]
    pub arguments: String,
}

/// Tool surface advertised to the model: name, human description, and a
/// JSON-schema for arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub schema: Value,
}

/// Per-request MCP opt-in. `None` lists mean "everything the outer filter
/// levels allow"; set lists narrow further.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<BTreeSet<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_execute: Option<BTreeSet<String>>,
    /// Overrides the configured agent-loop depth bound for this request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_depth: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextRequest {
    pub prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    pub input: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechRequest {
    pub input: String,
    pub voice: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionRequest {
    #[serde(with = "serde_bytes_vec")]
    pub audio: Vec<u8>,
    pub file_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRequest {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u8>,
    /// Source image for edits and variations.
    #[serde(default, skip_serializing_if = "Vec::is_empty", with = "serde_bytes_vec")]
    pub image: Vec<u8>,
    #[serde(default, skip_serializing_if = "Vec::is_empty", with = "serde_bytes_vec")]
    pub mask: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FilePayload {
    Upload {
        #[serde(with = "serde_bytes_vec")]
        data: Vec<u8>,
        file_name: String,
        purpose: String,
    },
    Get {
        file_id: String,
    },
    List,
    Delete {
        file_id: String,
    },
    Content {
        file_id: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BatchPayload {
    Create {
        input_file_id: String,
        endpoint: String,
        completion_window: String,
    },
    Get {
        batch_id: String,
    },
    List,
    Cancel {
        batch_id: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ContainerPayload {
    Create { name: String },
    Get { container_id: String },
    List,
    Delete { container_id: String },
}

/// Plain base64 is deliberately avoided for in-process payloads; byte blobs
/// serialize as JSON arrays only in debug snapshots, which is acceptable
/// because requests are not persisted.
mod serde_bytes_vec {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.collect_seq(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        Vec::<u8>::deserialize(de)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_text_flattens_parts() {
        let msg = ChatMessage {
            role: MessageRole::User,
            content: Some(MessageContent::Parts(vec![
                ContentPart::Text { text: "see ".into() },
                ContentPart::ImageUrl { url: "https://example.com/a.png".into() },
                ContentPart::Text { text: "this".into() },
            ])),
            tool_calls: Vec::new(),
            tool_call_id: None,
        };
        assert_eq!(msg.content_text(), "see this");
    }

    #[test]
    fn payload_serializes_with_kind_tag() {
        let payload = RequestPayload::Batch(BatchPayload::Get { batch_id: "b1".into() });
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "batch");
        assert_eq!(json["data"]["op"], "get");
        assert_eq!(json["data"]["batch_id"], "b1");
    }
}
