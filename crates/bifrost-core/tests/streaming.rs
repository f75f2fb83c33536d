mod common;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bifrost_common::BifrostResult;
use bifrost_core::{Bifrost, HookOutcome, Plugin};
use bifrost_provider_core::{
    ChatRequest, ChunkDelta, FinishReason, RequestContext, StreamChunk, StreamEnd, Usage,
};

use common::{FakeAdapter, gateway_with, provider_config};

/// Captures what the post-hook observed once the stream settled.
struct CapturePlugin {
    seen: Arc<Mutex<Option<HookOutcome>>>,
}

#[async_trait]
impl Plugin for CapturePlugin {
    fn name(&self) -> &str {
        "capture"
    }

    async fn post_hook(
        &self,
        _ctx: &RequestContext,
        outcome: &mut HookOutcome,
    ) -> BifrostResult<()> {
        *self.seen.lock().unwrap() = Some(HookOutcome {
            response: outcome.response.clone(),
            error: outcome.error.clone(),
        });
        Ok(())
    }
}

fn hello_chunks() -> Vec<StreamChunk> {
    vec![
        StreamChunk::delta(0, ChunkDelta::text("He")),
        StreamChunk::delta(1, ChunkDelta::text("llo")),
        StreamChunk::end(
            2,
            StreamEnd {
                finish_reason: Some(FinishReason::Stop),
                usage: Some(Usage { prompt_tokens: 3, completion_tokens: 2, total_tokens: 5 }),
            },
        ),
    ]
}

fn streaming_gateway() -> (Bifrost, Arc<FakeAdapter>, Arc<Mutex<Option<HookOutcome>>>) {
    let adapter = Arc::new(FakeAdapter::new("openai"));
    let core = gateway_with(vec![(provider_config("openai", 2, 8), adapter.clone())]);
    let seen = Arc::new(Mutex::new(None));
    core.add_plugin(Arc::new(CapturePlugin { seen: seen.clone() }));
    (core, adapter, seen)
}

#[tokio::test]
async fn caller_sees_ordered_chunks_and_post_hook_sees_the_whole_response() {
    let (core, adapter, seen) = streaming_gateway();
    adapter.push_stream(hello_chunks());

    let ctx = RequestContext::new();
    let mut stream = core
        .chat_stream(&ctx, "openai", "m1", ChatRequest::default())
        .await
        .unwrap();

    let mut chunks = Vec::new();
    while let Some(chunk) = stream.recv().await {
        chunks.push(chunk);
    }

    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks.iter().map(|c| c.seq).collect::<Vec<_>>(), vec![0, 1, 2]);
    assert_eq!(chunks[0].delta.as_ref().unwrap().text.as_deref(), Some("He"));
    assert!(chunks[2].end.is_some());

    // Post-hooks ran exactly once, after the terminal chunk, with the
    // accumulated response.
    let outcome = seen.lock().unwrap().take().expect("post-hook ran");
    assert!(outcome.error.is_none());
    let chat = outcome.response.unwrap().into_chat().unwrap();
    let choice = chat.primary().unwrap();
    assert_eq!(choice.message.content_text(), "Hello");
    assert_eq!(choice.finish_reason, Some(FinishReason::Stop));
    let usage = chat.usage.unwrap();
    assert_eq!(usage.prompt_tokens, 3);
    assert_eq!(usage.completion_tokens, 2);
    assert_eq!(usage.total_tokens, 5);
}

#[tokio::test]
async fn accumulated_stream_matches_the_non_streaming_equivalent() {
    let (core, adapter, seen) = streaming_gateway();
    adapter.push_stream(hello_chunks());
    adapter.push_chat(Ok(common::text_response("Hello")));

    let ctx = RequestContext::new();
    let mut stream = core
        .chat_stream(&ctx, "openai", "m1", ChatRequest::default())
        .await
        .unwrap();
    while stream.recv().await.is_some() {}
    let streamed = seen
        .lock()
        .unwrap()
        .take()
        .unwrap()
        .response
        .unwrap()
        .into_chat()
        .unwrap();

    let direct = core
        .chat(&ctx, "openai", "m1", ChatRequest::default())
        .await
        .unwrap();

    assert_eq!(
        streamed.primary().unwrap().message.content_text(),
        direct.primary().unwrap().message.content_text()
    );
    assert_eq!(
        streamed.primary().unwrap().finish_reason,
        direct.primary().unwrap().finish_reason
    );
}

#[tokio::test]
async fn stream_error_reaches_caller_and_post_hook() {
    let (core, adapter, seen) = streaming_gateway();
    adapter.push_stream(vec![
        StreamChunk::delta(0, ChunkDelta::text("par")),
        StreamChunk::error(
            1,
            bifrost_common::BifrostError::new(
                bifrost_common::ErrorKind::UpstreamUnavailable,
                "connection reset",
            ),
        ),
    ]);

    let ctx = RequestContext::new();
    let mut stream = core
        .chat_stream(&ctx, "openai", "m1", ChatRequest::default())
        .await
        .unwrap();

    let mut last = None;
    while let Some(chunk) = stream.recv().await {
        last = Some(chunk);
    }
    assert!(last.unwrap().error.is_some());

    let outcome = seen.lock().unwrap().take().unwrap();
    assert_eq!(
        outcome.error.unwrap().kind,
        bifrost_common::ErrorKind::UpstreamUnavailable
    );
    // The partial accumulation is still visible to post-hooks.
    let chat = outcome.response.unwrap().into_chat().unwrap();
    assert_eq!(chat.primary().unwrap().message.content_text(), "par");
}

#[tokio::test]
async fn short_circuited_stream_is_synthesized_from_the_response() {
    let (core, adapter, _seen) = streaming_gateway();
    let log = Arc::new(Mutex::new(Vec::new()));
    core.add_plugin(common::RecordingPlugin::short_circuiting(
        "cache",
        &log,
        common::text_response("from cache"),
    ));

    let ctx = RequestContext::new();
    let mut stream = core
        .chat_stream(&ctx, "openai", "m1", ChatRequest::default())
        .await
        .unwrap();

    let mut text = String::new();
    let mut saw_end = false;
    while let Some(chunk) = stream.recv().await {
        if let Some(delta) = &chunk.delta {
            text.push_str(delta.text.as_deref().unwrap_or(""));
        }
        saw_end |= chunk.end.is_some();
    }
    assert_eq!(text, "from cache");
    assert!(saw_end);
    assert_eq!(adapter.calls(), 0);
}
