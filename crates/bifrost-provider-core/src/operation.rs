use serde::{Deserialize, Serialize};

/// The uniform verbs the gateway exposes. Streaming variants are distinct
/// operations so allow-lists can differentiate them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Chat,
    ChatStream,
    Responses,
    ResponsesStream,
    TextCompletion,
    TextCompletionStream,
    Embedding,
    Speech,
    Transcription,
    ImageGeneration,
    ImageEdit,
    ImageVariation,
    CountTokens,
    ListModels,
    BatchCreate,
    BatchGet,
    BatchList,
    BatchCancel,
    FileUpload,
    FileGet,
    FileList,
    FileDelete,
    FileContent,
    ContainerCreate,
    ContainerGet,
    ContainerList,
    ContainerDelete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Chat => "chat",
            Operation::ChatStream => "chat_stream",
            Operation::Responses => "responses",
            Operation::ResponsesStream => "responses_stream",
            Operation::TextCompletion => "text_completion",
            Operation::TextCompletionStream => "text_completion_stream",
            Operation::Embedding => "embedding",
            Operation::Speech => "speech",
            Operation::Transcription => "transcription",
            Operation::ImageGeneration => "image_generation",
            Operation::ImageEdit => "image_edit",
            Operation::ImageVariation => "image_variation",
            Operation::CountTokens => "count_tokens",
            Operation::ListModels => "list_models",
            Operation::BatchCreate => "batch_create",
            Operation::BatchGet => "batch_get",
            Operation::BatchList => "batch_list",
            Operation::BatchCancel => "batch_cancel",
            Operation::FileUpload => "file_upload",
            Operation::FileGet => "file_get",
            Operation::FileList => "file_list",
            Operation::FileDelete => "file_delete",
            Operation::FileContent => "file_content",
            Operation::ContainerCreate => "container_create",
            Operation::ContainerGet => "container_get",
            Operation::ContainerList => "container_list",
            Operation::ContainerDelete => "container_delete",
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(
            self,
            Operation::ChatStream | Operation::ResponsesStream | Operation::TextCompletionStream
        )
    }

    /// The non-streaming operation whose response shape a stream accumulates
    /// into; identity for non-streaming operations.
    pub fn non_streaming(&self) -> Operation {
        match self {
            Operation::ChatStream => Operation::Chat,
            Operation::ResponsesStream => Operation::Responses,
            Operation::TextCompletionStream => Operation::TextCompletion,
            other => *other,
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::Operation;

    #[test]
    fn streaming_variants_map_to_their_base_operation() {
        assert_eq!(Operation::ChatStream.non_streaming(), Operation::Chat);
        assert_eq!(Operation::ResponsesStream.non_streaming(), Operation::Responses);
        assert_eq!(Operation::Embedding.non_streaming(), Operation::Embedding);
        assert!(Operation::ChatStream.is_streaming());
        assert!(!Operation::Chat.is_streaming());
    }

    #[test]
    fn serializes_as_snake_case() {
        assert_eq!(
            serde_json::to_string(&Operation::ImageGeneration).unwrap(),
            "\"image_generation\""
        );
    }
}
