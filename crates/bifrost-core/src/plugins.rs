//! Plugin hooks around every request: ordered pre-hooks, LIFO post-hooks,
//! short-circuiting, and recovery. Plugin faults (panics or returned
//! errors) are logged and swallowed; a misbehaving plugin never changes a
//! request's outcome.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;

use bifrost_common::{BifrostError, BifrostResult};
use bifrost_provider_core::{BifrostRequest, BifrostResponse, RequestContext, StreamChunk};

use crate::pool::PoolItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginKind {
    /// Pre/post hooks around model calls.
    Llm,
    /// Pre/post hooks around tool orchestration.
    Mcp,
    /// Pre/post plus per-chunk stream hooks.
    Transport,
    /// Async, post-response only; never on the hot path.
    Observability,
}

/// Outcome of a pre-hook. A short-circuit stops further pre-hooks and
/// supplies the result directly; post-hooks of already-run pre-hooks still
/// execute.
pub enum PreHookResult {
    Continue,
    ShortCircuitResponse(BifrostResponse),
    ShortCircuitError(BifrostError),
}

/// What a stream-chunk hook did with the chunk.
pub enum ChunkAction {
    Forward(StreamChunk),
    Drop,
    Terminate(Option<BifrostError>),
}

/// The mutable (response, error) pair post-hooks operate on. A post-hook
/// may swap the two: clear the error and provide a response (recovery), or
/// clear the response and provide an error (invalidation).
#[derive(Debug, Default)]
pub struct HookOutcome {
    pub response: Option<BifrostResponse>,
    pub error: Option<BifrostError>,
}

impl HookOutcome {
    pub fn from_response(response: BifrostResponse) -> Self {
        Self { response: Some(response), error: None }
    }

    pub fn from_error(error: BifrostError) -> Self {
        Self { response: None, error: Some(error) }
    }
}

#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> PluginKind {
        PluginKind::Llm
    }

    async fn pre_hook(
        &self,
        _ctx: &RequestContext,
        _req: &mut BifrostRequest,
    ) -> BifrostResult<PreHookResult> {
        Ok(PreHookResult::Continue)
    }

    async fn post_hook(
        &self,
        _ctx: &RequestContext,
        _outcome: &mut HookOutcome,
    ) -> BifrostResult<()> {
        Ok(())
    }

    /// Called per stream chunk in order. Only meaningful for transport
    /// plugins; the default forwards untouched.
    async fn stream_chunk(&self, _ctx: &RequestContext, chunk: StreamChunk) -> ChunkAction {
        ChunkAction::Forward(chunk)
    }

    /// Observability hook, run detached after the outcome is settled.
    async fn observe(&self, _ctx: &RequestContext, _outcome: &HookOutcome) {}
}

/// Pooled snapshot of the plugin list for one dispatch. `executed` is the
/// stack of pre-hooks that ran; popping it drives the reverse-order
/// post-hook pass, which keeps the two passes symmetric even after a
/// short-circuit.
#[derive(Default)]
pub struct PluginPipeline {
    plugins: Vec<Arc<dyn Plugin>>,
    executed: Vec<usize>,
}

impl PoolItem for PluginPipeline {
    fn reset(&mut self) {
        self.plugins.clear();
        self.executed.clear();
    }

    fn is_reset(&self) -> bool {
        self.plugins.is_empty() && self.executed.is_empty()
    }

    fn retained_bytes(&self) -> usize {
        self.plugins.capacity() * std::mem::size_of::<Arc<dyn Plugin>>()
    }
}

impl PluginPipeline {
    pub fn load(&mut self, snapshot: &[Arc<dyn Plugin>]) {
        self.plugins.extend_from_slice(snapshot);
    }

    pub fn plugins(&self) -> &[Arc<dyn Plugin>] {
        &self.plugins
    }

    /// Runs pre-hooks in registration order. Returns `Some` when a hook
    /// short-circuited; the outcome carries the supplied response or error.
    pub async fn run_pre_hooks(
        &mut self,
        ctx: &RequestContext,
        req: &mut BifrostRequest,
    ) -> Option<HookOutcome> {
        for index in 0..self.plugins.len() {
            let plugin = self.plugins[index].clone();
            self.executed.push(index);

            let result = AssertUnwindSafe(plugin.pre_hook(ctx, req))
                .catch_unwind()
                .await;
            match result {
                Ok(Ok(PreHookResult::Continue)) => {}
                Ok(Ok(PreHookResult::ShortCircuitResponse(response))) => {
                    return Some(HookOutcome::from_response(response));
                }
                Ok(Ok(PreHookResult::ShortCircuitError(error))) => {
                    return Some(HookOutcome::from_error(error));
                }
                Ok(Err(err)) => {
                    tracing::warn!(plugin = plugin.name(), error = %err, "pre-hook fault ignored");
                }
                Err(_) => {
                    tracing::warn!(plugin = plugin.name(), "pre-hook panicked; ignored");
                }
            }
        }
        None
    }

    /// Runs post-hooks of executed pre-hooks in reverse order, then kicks
    /// off detached observability hooks.
    pub async fn run_post_hooks(&mut self, ctx: &RequestContext, outcome: &mut HookOutcome) {
        while let Some(index) = self.executed.pop() {
            let plugin = self.plugins[index].clone();
            let result = AssertUnwindSafe(plugin.post_hook(ctx, outcome))
                .catch_unwind()
                .await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!(plugin = plugin.name(), error = %err, "post-hook fault ignored");
                }
                Err(_) => {
                    tracing::warn!(plugin = plugin.name(), "post-hook panicked; ignored");
                }
            }
        }

        for plugin in &self.plugins {
            if plugin.kind() != PluginKind::Observability {
                continue;
            }
            let plugin = plugin.clone();
            let ctx = ctx.clone();
            let snapshot = HookOutcome {
                response: outcome.response.clone(),
                error: outcome.error.clone(),
            };
            tokio::spawn(async move {
                let _ = AssertUnwindSafe(plugin.observe(&ctx, &snapshot))
                    .catch_unwind()
                    .await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bifrost_common::ErrorKind;
    use bifrost_provider_core::{ChatResponse, Operation, RequestPayload};
    use std::sync::Mutex;

    fn chat_request() -> BifrostRequest {
        BifrostRequest::new(
            "openai",
            "m1",
            Operation::Chat,
            RequestPayload::Chat(Default::default()),
        )
    }

    struct Recording {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        pre: Box<dyn Fn() -> BifrostResult<PreHookResult> + Send + Sync>,
    }

    #[async_trait]
    impl Plugin for Recording {
        fn name(&self) -> &str {
            self.name
        }

        async fn pre_hook(
            &self,
            _ctx: &RequestContext,
            _req: &mut BifrostRequest,
        ) -> BifrostResult<PreHookResult> {
            self.log.lock().unwrap().push(format!("{}.pre", self.name));
            (self.pre)()
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

    fn recording(
        name: &'static str,
        log: &Arc<Mutex<Vec<String>>>,
        pre: impl Fn() -> BifrostResult<PreHookResult> + Send + Sync + 'static,
    ) -> Arc<dyn Plugin> {
        Arc::new(Recording { name, log: log.clone(), pre: Box::new(pre) })
    }

    #[tokio::test]
    async fn post_hooks_run_in_reverse_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let plugins: Vec<Arc<dyn Plugin>> = vec![
            recording("p1", &log, || Ok(PreHookResult::Continue)),
            recording("p2", &log, || Ok(PreHookResult::Continue)),
            recording("p3", &log, || Ok(PreHookResult::Continue)),
        ];

        let ctx = RequestContext::new();
        let mut req = chat_request();
        let mut pipeline = PluginPipeline::default();
        pipeline.load(&plugins);

        assert!(pipeline.run_pre_hooks(&ctx, &mut req).await.is_none());
        let mut outcome = HookOutcome::default();
        pipeline.run_post_hooks(&ctx, &mut outcome).await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["p1.pre", "p2.pre", "p3.pre", "p3.post", "p2.post", "p1.post"]
        );
    }

    #[tokio::test]
    async fn short_circuit_skips_later_pre_hooks_but_keeps_symmetry() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let plugins: Vec<Arc<dyn Plugin>> = vec![
            recording("p1", &log, || Ok(PreHookResult::Continue)),
            recording("p2", &log, || {
                Ok(PreHookResult::ShortCircuitResponse(BifrostResponse::Chat(
                    ChatResponse::default(),
                )))
            }),
            recording("p3", &log, || Ok(PreHookResult::Continue)),
        ];

        let ctx = RequestContext::new();
        let mut req = chat_request();
        let mut pipeline = PluginPipeline::default();
        pipeline.load(&plugins);

        let mut outcome = pipeline.run_pre_hooks(&ctx, &mut req).await.unwrap();
        assert!(outcome.response.is_some());
        pipeline.run_post_hooks(&ctx, &mut outcome).await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["p1.pre", "p2.pre", "p2.post", "p1.post"]
        );
    }

    #[tokio::test]
    async fn faulting_pre_hook_is_ignored_but_counts_as_executed() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let plugins: Vec<Arc<dyn Plugin>> = vec![
            recording("bad", &log, || {
                Err(BifrostError::internal("plugin exploded"))
            }),
            recording("good", &log, || Ok(PreHookResult::Continue)),
        ];

        let ctx = RequestContext::new();
        let mut req = chat_request();
        let mut pipeline = PluginPipeline::default();
        pipeline.load(&plugins);

        assert!(pipeline.run_pre_hooks(&ctx, &mut req).await.is_none());
        let mut outcome = HookOutcome::default();
        pipeline.run_post_hooks(&ctx, &mut outcome).await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["bad.pre", "good.pre", "good.post", "bad.post"]
        );
    }

    struct Panicking;

    #[async_trait]
    impl Plugin for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn pre_hook(
            &self,
            _ctx: &RequestContext,
            _req: &mut BifrostRequest,
        ) -> BifrostResult<PreHookResult> {
            panic!("boom");
        }
    }

    #[tokio::test]
    async fn panicking_plugin_does_not_affect_outcome() {
        let plugins: Vec<Arc<dyn Plugin>> = vec![Arc::new(Panicking)];
        let ctx = RequestContext::new();
        let mut req = chat_request();
        let mut pipeline = PluginPipeline::default();
        pipeline.load(&plugins);

        assert!(pipeline.run_pre_hooks(&ctx, &mut req).await.is_none());
    }

    struct Recovering;

    #[async_trait]
    impl Plugin for Recovering {
        fn name(&self) -> &str {
            "recovering"
        }

        async fn post_hook(
            &self,
            _ctx: &RequestContext,
            outcome: &mut HookOutcome,
        ) -> BifrostResult<()> {
            if outcome.error.take().is_some() {
                outcome.response = Some(BifrostResponse::Chat(ChatResponse::default()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn post_hook_can_recover_an_error() {
        let plugins: Vec<Arc<dyn Plugin>> = vec![Arc::new(Recovering)];
        let ctx = RequestContext::new();
        let mut req = chat_request();
        let mut pipeline = PluginPipeline::default();
        pipeline.load(&plugins);

        pipeline.run_pre_hooks(&ctx, &mut req).await;
        let mut outcome = HookOutcome::from_error(BifrostError::new(
            ErrorKind::UpstreamUnavailable,
            "upstream down",
        ));
        pipeline.run_post_hooks(&ctx, &mut outcome).await;

        assert!(outcome.error.is_none());
        assert!(outcome.response.is_some());
    }
}
