//! Shared fixtures: a scriptable adapter and a recording plugin.
// Not every test target uses every helper.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use bifrost_core::{
    Bifrost, BifrostRequest, HookOutcome, Plugin, PreHookResult, ProviderConfig, ProviderKind,
};
use bifrost_common::{BifrostError, BifrostResult};
use bifrost_provider_core::{
    CallCtx, ChatChoice, ChatMessage, ChatRequest, ChatResponse, ChunkStream, FinishReason,
    ProviderAdapter, RequestContext, StreamChunk,
};

/// Adapter with scripted chat results and streams. Tracks call counts and
/// the high-water mark of concurrent calls.
pub struct FakeAdapter {
    name: String,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    chat_script: Mutex<VecDeque<BifrostResult<ChatResponse>>>,
    stream_script: Mutex<VecDeque<Vec<StreamChunk>>>,
}

impl FakeAdapter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            chat_script: Mutex::new(VecDeque::new()),
            stream_script: Mutex::new(VecDeque::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn push_chat(&self, result: BifrostResult<ChatResponse>) {
        self.chat_script.lock().unwrap().push_back(result);
    }

    pub fn push_stream(&self, chunks: Vec<StreamChunk>) {
        self.stream_script.lock().unwrap().push_back(chunks);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderAdapter for FakeAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(&self, ctx: &CallCtx<'_>, _req: &ChatRequest) -> BifrostResult<ChatResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::select! {
                _ = ctx.context.cancellation().cancelled() => {
                    self.in_flight.fetch_sub(1, Ordering::SeqCst);
                    return Err(BifrostError::cancelled());
                }
                _ = tokio::time::sleep(self.delay) => {}
            }
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.chat_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(text_response("ok")))
    }

    async fn chat_stream(
        &self,
        _ctx: &CallCtx<'_>,
        _req: &ChatRequest,
    ) -> BifrostResult<ChunkStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let chunks = self
            .stream_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        tokio::spawn(async move {
            for chunk in chunks {
                if tx.send(chunk).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }
}

pub fn text_response(text: &str) -> ChatResponse {
    ChatResponse {
        id: None,
        model: None,
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessage::assistant(text),
            finish_reason: Some(FinishReason::Stop),
        }],
        usage: None,
    }
}

pub fn provider_config(name: &str, concurrency: usize, buffer_size: usize) -> ProviderConfig {
    let mut config = ProviderConfig::new(name, ProviderKind::OpenAiCompatible);
    config.keys = vec![bifrost_provider_core::Key::new("k1", "sk-test")];
    config.concurrency.concurrency = concurrency;
    config.concurrency.buffer_size = buffer_size;
    config.network.max_retries = 0;
    config
}

pub fn gateway_with(configs: Vec<(ProviderConfig, Arc<FakeAdapter>)>) -> Bifrost {
    let core = Bifrost::empty(Default::default());
    for (config, adapter) in configs {
        core.upsert_provider_with_adapter(config, adapter);
    }
    core
}

/// Records hook invocations as `"<name>.pre"` / `"<name>.post"` strings.
pub struct RecordingPlugin {
    pub name: String,
    pub log: Arc<Mutex<Vec<String>>>,
    pub short_circuit: Option<ChatResponse>,
}

impl RecordingPlugin {
    pub fn passthrough(name: &str, log: &Arc<Mutex<Vec<String>>>) -> Arc<dyn Plugin> {
        Arc::new(Self {
            name: name.to_string(),
            log: log.clone(),
            short_circuit: None,
        })
    }

    pub fn short_circuiting(
        name: &str,
        log: &Arc<Mutex<Vec<String>>>,
        response: ChatResponse,
    ) -> Arc<dyn Plugin> {
        Arc::new(Self {
            name: name.to_string(),
            log: log.clone(),
            short_circuit: Some(response),
        })
    }
}

#[async_trait]
impl Plugin for RecordingPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    async fn pre_hook(
        &self,
        _ctx: &RequestContext,
        _req: &mut BifrostRequest,
    ) -> BifrostResult<PreHookResult> {
        self.log.lock().unwrap().push(format!("{}.pre", self.name));
        match &self.short_circuit {
            Some(response) => Ok(PreHookResult::ShortCircuitResponse(
                bifrost_core::BifrostResponse::Chat(response.clone()),
            )),
            None => Ok(PreHookResult::Continue),
        }
    }

    async fn post_hook(
        &self,
        _ctx: &RequestContext,
        _outcome: &mut HookOutcome,
    ) -> BifrostResult<()> {
        self.log.lock().unwrap().push(format!("{}.post", self.name));
        Ok(())
    }
}
