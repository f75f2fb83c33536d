use serde::{Deserialize, Serialize};

use crate::request::ChatMessage;

/// Operation-discriminated response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum BifrostResponse {
    Chat(ChatResponse),
    Text(TextResponse),
    Embedding(EmbeddingResponse),
    Speech(SpeechResponse),
    Transcription(TranscriptionResponse),
    Image(ImageResponse),
    TokenCount(TokenCountResponse),
    ModelList(ModelListResponse),
    Batch(BatchObject),
    BatchList(Vec<BatchObject>),
    File(FileObject),
    FileList(Vec<FileObject>),
    FileContent(FileContent),
    Container(ContainerObject),
    ContainerList(Vec<ContainerObject>),
    Deleted(DeletionStatus),
}

impl BifrostResponse {
    pub fn as_chat(&self) -> Option<&ChatResponse> {
        match self {
            BifrostResponse::Chat(chat) => Some(chat),
            _ => None,
        }
    }

    pub fn as_chat_mut(&mut self) -> Option<&mut ChatResponse> {
        match self {
            BifrostResponse::Chat(chat) => Some(chat),
            _ => None,
        }
    }

    pub fn into_chat(self) -> Option<ChatResponse> {
        match self {
            BifrostResponse::Chat(chat) => Some(chat),
            _ => None,
        }
    }

    pub fn usage(&self) -> Option<&Usage> {
        match self {
            BifrostResponse::Chat(chat) => chat.usage.as_ref(),
            BifrostResponse::Text(text) => text.usage.as_ref(),
            BifrostResponse::Embedding(emb) => emb.usage.as_ref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub choices: Vec<ChatChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ChatResponse {
    /// The first choice's message, which is what tool orchestration and most
    /// callers operate on.
    pub fn primary(&self) -> Option<&ChatChoice> {
        self.choices.first()
    }

    pub fn primary_mut(&mut self) -> Option<&mut ChatChoice> {
        self.choices.first_mut()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChoice {
    pub index: u32,
    pub message: ChatMessage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
}

impl FinishReason {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "stop" | "end_turn" | "stop_sequence" => Some(FinishReason::Stop),
            "length" | "max_tokens" => Some(FinishReason::Length),
            "tool_calls" | "tool_use" | "function_call" => Some(FinishReason::ToolCalls),
            "content_filter" | "refusal" => Some(FinishReason::ContentFilter),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TextResponse {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    pub embeddings: Vec<Vec<f32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpeechResponse {
    pub audio: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranscriptionResponse {
    pub text: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageResponse {
    pub images: Vec<ImageDatum>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageDatum {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub b64_json: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenCountResponse {
    pub input_tokens: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelListResponse {
    pub models: Vec<ModelInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owned_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchObject {
    pub id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_file_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_file_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileObject {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileContent {
    pub data: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerObject {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletionStatus {
    pub id: String,
    pub deleted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_reason_parses_cross_provider_spellings() {
        assert_eq!(FinishReason::parse("stop"), Some(FinishReason::Stop));
        assert_eq!(FinishReason::parse("end_turn"), Some(FinishReason::Stop));
        assert_eq!(FinishReason::parse("tool_use"), Some(FinishReason::ToolCalls));
        assert_eq!(FinishReason::parse("max_tokens"), Some(FinishReason::Length));
        assert_eq!(FinishReason::parse("banana"), None);
    }

    #[test]
    fn usage_accumulates() {
        let mut total = Usage::default();
        total.add(&Usage { prompt_tokens: 3, completion_tokens: 2, total_tokens: 5 });
        total.add(&Usage { prompt_tokens: 1, completion_tokens: 1, total_tokens: 2 });
        assert_eq!(total.total_tokens, 7);
        assert_eq!(total.prompt_tokens, 4);
    }
}
