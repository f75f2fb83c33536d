//! The bifrost dispatch core: plugin pipeline, per-provider queues and
//! workers, fallback orchestration, stream accumulation, MCP tool
//! orchestration, and the top-level [`Bifrost`] composition root.
//!
//! Control flow for a non-streaming request: caller → dispatcher → plugin
//! pre-hooks → provider queue → worker (key selection, adapter call with
//! transport retries) → plugin post-hooks (reverse order) → caller. On
//! failure the fallback orchestrator re-enters the dispatcher per target.

pub mod accumulator;
pub mod core;
mod dispatch;
pub mod mcp;
pub mod plugins;
pub mod pool;
pub mod queue;
pub mod state;
mod worker;

pub use bifrost_common::{BifrostError, BifrostResult, ErrorKind, FallbackPolicy, RequestId, TraceId};
pub use bifrost_provider_core::{
    AllowedOperations, BifrostRequest, BifrostResponse, ChatMessage, ChatRequest, ChatResponse,
    ChunkStream, ConcurrencyConfig, Event, EventHub, EventSink, FallbackTarget, Key, KeySet,
    NetworkConfig, Operation, ProviderAdapter, ProviderConfig, ProviderKind, RequestContext,
    RequestPayload, StreamChunk, ToolDefinition, ToolOptions,
};

pub use crate::accumulator::PostHookRunner;
pub use crate::core::{Bifrost, BifrostConfig};
pub use crate::mcp::{McpClientConfig, McpConfig, McpToolManager, ToolHandler};
pub use crate::plugins::{
    ChunkAction, HookOutcome, Plugin, PluginKind, PluginPipeline, PreHookResult,
};
pub use crate::pool::{ObjectPool, PoolConfig, PoolItem};
pub use crate::queue::{AdapterReply, ProviderQueue, QueueItem};
