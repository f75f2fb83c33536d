//! Top-level composition and lifecycle. [`Bifrost`] is the single ownership
//! root: it wires configs to adapters, owns the pools, the plugin list, the
//! MCP registry, and the provider queues, and brackets everything between
//! `init` and `shutdown`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use bifrost_common::{BifrostError, BifrostResult, ErrorKind};
use bifrost_provider_core::{
    BifrostRequest, BifrostResponse, ChatRequest, ChatResponse, ChunkStream, EmbeddingRequest,
    EmbeddingResponse, EventHub, ModelListResponse, Operation, ProviderAdapter, ProviderConfig,
    ProviderKind, RequestContext, RequestPayload,
};
use bifrost_provider_impl::{
    AnthropicAdapter, OpenAiAdapter, UpstreamClient, UpstreamClientConfig, WreqUpstreamClient,
};

use crate::dispatch::{self, DispatchOutput};
use crate::mcp::{McpConfig, McpToolManager};
use crate::plugins::Plugin;
use crate::pool::{ObjectPool, PoolConfig};
use crate::queue::QueueItem;
use crate::state::RuntimeState;

/// Whole-gateway configuration snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BifrostConfig {
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub mcp: McpConfig,
}

pub(crate) struct CorePools {
    pub queue_items: Arc<ObjectPool<QueueItem>>,
    pub pipelines: ObjectPool<crate::plugins::PluginPipeline>,
}

pub(crate) struct CoreInner {
    pub state: RuntimeState,
    pub pools: Arc<CorePools>,
    pub mcp: McpToolManager,
    pub events: EventHub,
    /// Shared upstream transport; one connection pool serves all adapters.
    client: std::sync::Mutex<Option<Arc<dyn UpstreamClient>>>,
    shutdown: AtomicBool,
}

/// The gateway core. Cheap to clone; all clones share one runtime.
#[derive(Clone)]
pub struct Bifrost {
    inner: Arc<CoreInner>,
}

impl Bifrost {
    /// Wires adapters from the config using the production HTTP client.
    pub fn init(config: BifrostConfig) -> BifrostResult<Self> {
        let client = WreqUpstreamClient::new(UpstreamClientConfig::default())
            .map_err(|e| BifrostError::internal("build upstream http client").with_cause(e))?;
        let client: Arc<dyn UpstreamClient> = Arc::new(client);
        Self::init_with_client(config, client)
    }

    /// Same wiring with a caller-supplied transport; tests inject fakes
    /// here.
    pub fn init_with_client(
        config: BifrostConfig,
        client: Arc<dyn UpstreamClient>,
    ) -> BifrostResult<Self> {
        let core = Self::empty(config.mcp);
        *core.inner.client.lock().expect("client lock poisoned") = Some(client.clone());
        for provider in config.providers {
            let adapter = build_adapter(&provider, &client)?;
            core.inner.state.upsert_provider(provider, adapter);
        }
        Ok(core)
    }

    /// A core with no providers; adapters are registered programmatically
    /// via [`Bifrost::upsert_provider_with_adapter`].
    pub fn empty(mcp: McpConfig) -> Self {
        Self {
            inner: Arc::new(CoreInner {
                state: RuntimeState::new(),
                pools: Arc::new(CorePools {
                    queue_items: Arc::new(ObjectPool::new(PoolConfig::default())),
                    pipelines: ObjectPool::new(PoolConfig::default()),
                }),
                mcp: McpToolManager::new(mcp),
                events: EventHub::default(),
                client: std::sync::Mutex::new(None),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    pub fn events(&self) -> &EventHub {
        &self.inner.events
    }

    pub fn mcp(&self) -> &McpToolManager {
        &self.inner.mcp
    }

    // ---- provider administration ----

    /// Adds a provider or swaps an existing provider's config, building the
    /// adapter from the config's kind.
    pub fn upsert_provider(&self, config: ProviderConfig) -> BifrostResult<()> {
        let client = self.shared_client()?;
        let adapter = build_adapter(&config, &client)?;
        self.inner.state.upsert_provider(config, adapter);
        Ok(())
    }

    fn shared_client(&self) -> BifrostResult<Arc<dyn UpstreamClient>> {
        let mut guard = self.inner.client.lock().expect("client lock poisoned");
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }
        let client = WreqUpstreamClient::new(UpstreamClientConfig::default())
            .map_err(|e| BifrostError::internal("build upstream http client").with_cause(e))?;
        let client: Arc<dyn UpstreamClient> = Arc::new(client);
        *guard = Some(client.clone());
        Ok(client)
    }

    pub fn upsert_provider_with_adapter(
        &self,
        config: ProviderConfig,
        adapter: Arc<dyn ProviderAdapter>,
    ) {
        self.inner.state.upsert_provider(config, adapter);
    }

    /// Removes a provider and closes its queue; queued work is answered
    /// with `provider_shutting_down`.
    pub async fn remove_provider(&self, name: &str) {
        if let Some(runtime) = self.inner.state.remove_provider(name) {
            if let Some(queue) = runtime.started_queue() {
                queue.close(&self.inner.events).await;
            }
        }
    }

    // ---- plugin administration ----

    pub fn add_plugin(&self, plugin: Arc<dyn Plugin>) {
        self.inner.state.add_plugin(plugin);
    }

    pub fn remove_plugin(&self, name: &str) {
        self.inner.state.remove_plugin(name);
    }

    // ---- request surface ----

    /// Dispatches a non-streaming operation.
    pub async fn request(
        &self,
        ctx: &RequestContext,
        req: BifrostRequest,
    ) -> BifrostResult<BifrostResponse> {
        self.ensure_running(&req)?;
        if req.operation.is_streaming() {
            return Err(BifrostError::new(
                ErrorKind::InvalidRequest,
                format!("{} is a streaming operation; use request_stream", req.operation),
            ));
        }
        match dispatch::dispatch(&self.inner, ctx, &req).await? {
            DispatchOutput::Full(response) => Ok(response),
            DispatchOutput::Stream(_) => {
                Err(BifrostError::internal("streaming output for a non-streaming request"))
            }
        }
    }

    /// Dispatches a streaming operation. The returned sequence is finite
    /// and non-restartable; post-hooks run once the stream settles.
    pub async fn request_stream(
        &self,
        ctx: &RequestContext,
        req: BifrostRequest,
    ) -> BifrostResult<ChunkStream> {
        self.ensure_running(&req)?;
        if !req.operation.is_streaming() {
            return Err(BifrostError::new(
                ErrorKind::InvalidRequest,
                format!("{} is not a streaming operation; use request", req.operation),
            ));
        }
        match dispatch::dispatch(&self.inner, ctx, &req).await? {
            DispatchOutput::Stream(stream) => Ok(stream),
            DispatchOutput::Full(_) => {
                Err(BifrostError::internal("full output for a streaming request"))
            }
        }
    }

    // ---- typed conveniences over `request` ----

    pub async fn chat(
        &self,
        ctx: &RequestContext,
        provider: &str,
        model: &str,
        chat: ChatRequest,
    ) -> BifrostResult<ChatResponse> {
        let req = BifrostRequest::new(provider, model, Operation::Chat, RequestPayload::Chat(chat));
        match self.request(ctx, req).await? {
            BifrostResponse::Chat(response) => Ok(response),
            _ => Err(BifrostError::internal("chat produced a non-chat response")),
        }
    }

    pub async fn chat_stream(
        &self,
        ctx: &RequestContext,
        provider: &str,
        model: &str,
        chat: ChatRequest,
    ) -> BifrostResult<ChunkStream> {
        let req = BifrostRequest::new(
            provider,
            model,
            Operation::ChatStream,
            RequestPayload::Chat(chat),
        );
        self.request_stream(ctx, req).await
    }

    pub async fn embedding(
        &self,
        ctx: &RequestContext,
        provider: &str,
        model: &str,
        embedding: EmbeddingRequest,
    ) -> BifrostResult<EmbeddingResponse> {
        let req = BifrostRequest::new(
            provider,
            model,
            Operation::Embedding,
            RequestPayload::Embedding(embedding),
        );
        match self.request(ctx, req).await? {
            BifrostResponse::Embedding(response) => Ok(response),
            _ => Err(BifrostError::internal("embedding produced an unexpected response")),
        }
    }

    pub async fn list_models(
        &self,
        ctx: &RequestContext,
        provider: &str,
    ) -> BifrostResult<ModelListResponse> {
        let req = BifrostRequest::new(provider, "", Operation::ListModels, RequestPayload::Empty);
        match self.request(ctx, req).await? {
            BifrostResponse::ModelList(response) => Ok(response),
            _ => Err(BifrostError::internal("list_models produced an unexpected response")),
        }
    }

    // ---- lifecycle ----

    /// Closes every provider queue and waits for workers to drain.
    /// Idempotent; concurrent callers all wait for completion.
    pub async fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        let providers = self.inner.state.providers.load_full();
        for runtime in providers.values() {
            if let Some(queue) = runtime.started_queue() {
                queue.close(&self.inner.events).await;
            }
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    fn ensure_running(&self, req: &BifrostRequest) -> BifrostResult<()> {
        if self.is_shut_down() {
            return Err(BifrostError::new(
                ErrorKind::ProviderShuttingDown,
                "gateway is shutting down",
            )
            .with_provider(req.provider.clone()));
        }
        Ok(())
    }
}

fn build_adapter(
    config: &ProviderConfig,
    client: &Arc<dyn UpstreamClient>,
) -> BifrostResult<Arc<dyn ProviderAdapter>> {
    let adapter: Arc<dyn ProviderAdapter> = match config.kind {
        ProviderKind::OpenAi => Arc::new(OpenAiAdapter::compatible(
            config.name.clone(),
            "https://api.openai.com/v1",
            client.clone(),
        )),
        ProviderKind::Anthropic => Arc::new(AnthropicAdapter::named(config.name.clone(), client.clone())),
        ProviderKind::OpenAiCompatible => {
            let base_url = config.network.base_url.clone().ok_or_else(|| {
                BifrostError::new(
                    ErrorKind::InvalidRequest,
                    format!("provider {} needs network.base_url", config.name),
                )
            })?;
            Arc::new(OpenAiAdapter::compatible(config.name.clone(), base_url, client.clone()))
        }
    };
    Ok(adapter)
}
