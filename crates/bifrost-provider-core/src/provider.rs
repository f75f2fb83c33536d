use std::time::Duration;

use async_trait::async_trait;

use bifrost_common::{BifrostError, BifrostResult, ErrorKind};

use crate::config::ProviderConfig;
use crate::context::RequestContext;
use crate::headers::{Headers, header_get};
use crate::keys::Key;
use crate::operation::Operation;
use crate::request::{
    BatchPayload, ChatRequest, ContainerPayload, EmbeddingRequest, FilePayload, ImageRequest,
    ModelParams, SpeechRequest, TextRequest, TranscriptionRequest,
};
use crate::response::{
    BatchObject, ChatResponse, ContainerObject, DeletionStatus, EmbeddingResponse, FileContent,
    FileObject, ImageResponse, ModelListResponse, SpeechResponse, TextResponse,
    TokenCountResponse, TranscriptionResponse,
};
use crate::stream::StreamChunk;

/// Streaming results are a finite, non-restartable sequence of chunks. The
/// producing adapter stops promptly when the receiver is dropped.
pub type ChunkStream = tokio::sync::mpsc::Receiver<StreamChunk>;

/// Everything an adapter call needs besides the operation payload: the
/// request context (deadline, cancellation), the selected key, the provider
/// config snapshot, and the target model.
pub struct CallCtx<'a> {
    pub context: &'a RequestContext,
    pub key: &'a Key,
    pub config: &'a ProviderConfig,
    pub model: &'a str,
    pub params: Option<&'a ModelParams>,
    /// 1-based transport attempt within this target.
    pub attempt: u32,
}

fn unsupported(provider: &str, op: Operation) -> BifrostError {
    BifrostError::new(
        ErrorKind::OperationUnsupported,
        format!("{provider} does not implement {op}"),
    )
    .with_provider(provider)
    .with_operation(op.as_str())
}

/// Uniform capability surface over one upstream. Every operation defaults to
/// `operation_unsupported`; adapters override what the upstream can serve.
///
/// Contract for implementors:
/// - stop promptly when `ctx.context` is cancelled and release the
///   connection;
/// - translate upstream failures via [`http_status_kind`] and populate
///   provider/model/operation on every error;
/// - keep request/response conversion in pure functions with no IO so the
///   codecs stay testable offline.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn chat(&self, _ctx: &CallCtx<'_>, _req: &ChatRequest) -> BifrostResult<ChatResponse> {
        Err(unsupported(self.name(), Operation::Chat))
    }

    async fn chat_stream(
        &self,
        _ctx: &CallCtx<'_>,
        _req: &ChatRequest,
    ) -> BifrostResult<ChunkStream> {
        Err(unsupported(self.name(), Operation::ChatStream))
    }

    async fn responses(
        &self,
        _ctx: &CallCtx<'_>,
        _req: &ChatRequest,
    ) -> BifrostResult<ChatResponse> {
        Err(unsupported(self.name(), Operation::Responses))
    }

    async fn responses_stream(
        &self,
        _ctx: &CallCtx<'_>,
        _req: &ChatRequest,
    ) -> BifrostResult<ChunkStream> {
        Err(unsupported(self.name(), Operation::ResponsesStream))
    }

    async fn text_completion(
        &self,
        _ctx: &CallCtx<'_>,
        _req: &TextRequest,
    ) -> BifrostResult<TextResponse> {
        Err(unsupported(self.name(), Operation::TextCompletion))
    }

    async fn text_completion_stream(
        &self,
        _ctx: &CallCtx<'_>,
        _req: &TextRequest,
    ) -> BifrostResult<ChunkStream> {
        Err(unsupported(self.name(), Operation::TextCompletionStream))
    }

    async fn embedding(
        &self,
        _ctx: &CallCtx<'_>,
        _req: &EmbeddingRequest,
    ) -> BifrostResult<EmbeddingResponse> {
        Err(unsupported(self.name(), Operation::Embedding))
    }

    async fn speech(
        &self,
        _ctx: &CallCtx<'_>,
        _req: &SpeechRequest,
    ) -> BifrostResult<SpeechResponse> {
        Err(unsupported(self.name(), Operation::Speech))
    }

    async fn transcription(
        &self,
        _ctx: &CallCtx<'_>,
        _req: &TranscriptionRequest,
    ) -> BifrostResult<TranscriptionResponse> {
        Err(unsupported(self.name(), Operation::Transcription))
    }

    async fn image_generation(
        &self,
        _ctx: &CallCtx<'_>,
        _req: &ImageRequest,
    ) -> BifrostResult<ImageResponse> {
        Err(unsupported(self.name(), Operation::ImageGeneration))
    }

    async fn image_edit(
        &self,
        _ctx: &CallCtx<'_>,
        _req: &ImageRequest,
    ) -> BifrostResult<ImageResponse> {
        Err(unsupported(self.name(), Operation::ImageEdit))
    }

    async fn image_variation(
        &self,
        _ctx: &CallCtx<'_>,
        _req: &ImageRequest,
    ) -> BifrostResult<ImageResponse> {
        Err(unsupported(self.name(), Operation::ImageVariation))
    }

    async fn count_tokens(
        &self,
        _ctx: &CallCtx<'_>,
        _req: &ChatRequest,
    ) -> BifrostResult<TokenCountResponse> {
        Err(unsupported(self.name(), Operation::CountTokens))
    }

    async fn list_models(&self, _ctx: &CallCtx<'_>) -> BifrostResult<ModelListResponse> {
        Err(unsupported(self.name(), Operation::ListModels))
    }

    async fn batch(
        &self,
        _ctx: &CallCtx<'_>,
        req: &BatchPayload,
    ) -> BifrostResult<BatchResult> {
        let op = match req {
            BatchPayload::Create { .. } => Operation::BatchCreate,
            BatchPayload::Get { .. } => Operation::BatchGet,
            BatchPayload::List => Operation::BatchList,
            BatchPayload::Cancel { .. } => Operation::BatchCancel,
        };
        Err(unsupported(self.name(), op))
    }

    async fn file(&self, _ctx: &CallCtx<'_>, req: &FilePayload) -> BifrostResult<FileResult> {
        let op = match req {
            FilePayload::Upload { .. } => Operation::FileUpload,
            FilePayload::Get { .. } => Operation::FileGet,
            FilePayload::List => Operation::FileList,
            FilePayload::Delete { .. } => Operation::FileDelete,
            FilePayload::Content { .. } => Operation::FileContent,
        };
        Err(unsupported(self.name(), op))
    }

    async fn container(
        &self,
        _ctx: &CallCtx<'_>,
        req: &ContainerPayload,
    ) -> BifrostResult<ContainerResult> {
        let op = match req {
            ContainerPayload::Create { .. } => Operation::ContainerCreate,
            ContainerPayload::Get { .. } => Operation::ContainerGet,
            ContainerPayload::List => Operation::ContainerList,
            ContainerPayload::Delete { .. } => Operation::ContainerDelete,
        };
        Err(unsupported(self.name(), op))
    }
}

#[derive(Debug, Clone)]
pub enum BatchResult {
    One(BatchObject),
    Many(Vec<BatchObject>),
}

#[derive(Debug, Clone)]
pub enum FileResult {
    One(FileObject),
    Many(Vec<FileObject>),
    Content(FileContent),
    Deleted(DeletionStatus),
}

#[derive(Debug, Clone)]
pub enum ContainerResult {
    One(ContainerObject),
    Many(Vec<ContainerObject>),
    Deleted(DeletionStatus),
}

/// Canonical upstream-status translation shared by all adapters.
pub fn http_status_kind(status: u16) -> ErrorKind {
    match status {
        401 => ErrorKind::Unauthenticated,
        403 => ErrorKind::Forbidden,
        429 => ErrorKind::RateLimited,
        400 | 404 | 409 | 422 => ErrorKind::InvalidRequest,
        408 | 504 => ErrorKind::Timeout,
        500..=599 => ErrorKind::UpstreamUnavailable,
        _ => ErrorKind::UpstreamUnavailable,
    }
}

/// Integer-seconds Retry-After, which is what LLM upstreams send.
pub fn parse_retry_after(headers: &Headers) -> Option<Duration> {
    let value = header_get(headers, "retry-after")?.trim();
    if value.is_empty() {
        return None;
    }
    let secs = value.parse::<u64>().ok()?;
    Some(Duration::from_secs(secs))
}
