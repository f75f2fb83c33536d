//! Core provider abstractions for bifrost.
//!
//! This crate intentionally does **not** depend on any concrete HTTP client.
//! It defines the uniform data model (requests, responses, stream chunks),
//! the `ProviderAdapter` capability surface, provider configuration, the
//! weighted key selector, and the operational event hub. Concrete adapters
//! and IO live in `bifrost-provider-impl`; dispatch lives in `bifrost-core`.

pub mod config;
pub mod context;
pub mod events;
pub mod headers;
pub mod keys;
pub mod operation;
pub mod provider;
pub mod request;
pub mod response;
pub mod stream;

pub use bifrost_common::{
    BifrostError, BifrostResult, ErrorKind, FallbackPolicy, RequestId, TraceId,
};

pub use config::{
    AllowedOperations, ConcurrencyConfig, NetworkConfig, ProviderConfig, ProviderKind,
};
pub use context::{RequestContext, reserved};
pub use events::{Event, EventHub, EventSink};
pub use headers::{Headers, header_get, header_set};
pub use keys::{CooldownReason, Key, KeySet};
pub use operation::Operation;
pub use provider::{
    BatchResult, CallCtx, ChunkStream, ContainerResult, FileResult, ProviderAdapter,
    http_status_kind, parse_retry_after,
};
pub use request::{
    BatchPayload, BifrostRequest, ChatMessage, ChatRequest, ContainerPayload, ContentPart,
    EmbeddingRequest, FallbackTarget, FilePayload, FunctionCall, ImageRequest, MessageContent,
    MessageRole, ModelParams, RequestPayload, SpeechRequest, TextRequest, ToolCall,
    ToolDefinition, ToolOptions, TranscriptionRequest,
};
pub use response::{
    BatchObject, BifrostResponse, ChatChoice, ChatResponse, ContainerObject, DeletionStatus,
    EmbeddingResponse, FileContent, FileObject, FinishReason, ImageDatum, ImageResponse,
    ModelInfo, ModelListResponse, SpeechResponse, TextResponse, TokenCountResponse,
    TranscriptionResponse, Usage,
};
pub use stream::{ChunkDelta, StreamChunk, StreamEnd, ToolCallDelta};
