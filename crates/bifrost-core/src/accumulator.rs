//! Folds an adapter's chunk stream into a complete response for post-hooks
//! while forwarding live chunks to the caller. The post-hook runner fires
//! exactly once per stream: on the terminal chunk, on an error chunk, or on
//! cancellation with the partial snapshot.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::json;

use bifrost_common::BifrostError;
use bifrost_provider_core::{
    BifrostResponse, ChatChoice, ChatMessage, ChatResponse, ChunkDelta, ChunkStream, FinishReason,
    MessageContent, MessageRole, Operation, RequestContext, StreamChunk, StreamEnd, TextResponse,
    ToolCall, Usage, reserved,
};

use crate::plugins::{ChunkAction, Plugin};

/// Invoked exactly once with the accumulated response (or the partial
/// snapshot plus the terminal error). Drives reverse-order post-hooks and
/// pipeline release for streaming dispatches.
pub type PostHookRunner =
    Box<dyn FnOnce(Option<BifrostResponse>, Option<BifrostError>) -> BoxFuture<'static, ()> + Send>;

/// Running merge state. Text deltas concatenate; tool-call fragments merge
/// by index with id/name from the first non-empty fragment and argument
/// strings concatenated; finish reason and usage come from the terminal
/// chunk.
#[derive(Default)]
struct Accumulation {
    text: String,
    tool_calls: BTreeMap<u32, ToolCall>,
    finish_reason: Option<FinishReason>,
    usage: Option<Usage>,
}

impl Accumulation {
    fn apply_delta(&mut self, delta: &ChunkDelta) {
        if let Some(text) = &delta.text {
            self.text.push_str(text);
        }
        for fragment in &delta.tool_calls {
            let entry = self.tool_calls.entry(fragment.index).or_default();
            if entry.id.is_none() {
                entry.id = fragment.id.clone().filter(|s| !s.is_empty());
            }
            if entry.function.name.is_none() {
                entry.function.name = fragment.name.clone().filter(|s| !s.is_empty());
            }
            if let Some(arguments) = &fragment.arguments {
                entry.function.arguments.push_str(arguments);
            }
        }
    }

    fn apply_end(&mut self, end: &StreamEnd) {
        if end.finish_reason.is_some() {
            self.finish_reason = end.finish_reason;
        }
        if end.usage.is_some() {
            self.usage = end.usage;
        }
    }

    fn snapshot(&self, operation: Operation) -> BifrostResponse {
        match operation.non_streaming() {
            Operation::TextCompletion => BifrostResponse::Text(TextResponse {
                text: self.text.clone(),
                finish_reason: self.finish_reason,
                usage: self.usage,
            }),
            _ => {
                let tool_calls: Vec<ToolCall> = self.tool_calls.values().cloned().collect();
                let finish_reason = self.finish_reason.or_else(|| {
                    (!tool_calls.is_empty()).then_some(FinishReason::ToolCalls)
                });
                BifrostResponse::Chat(ChatResponse {
                    id: None,
                    model: None,
                    choices: vec![ChatChoice {
                        index: 0,
                        message: ChatMessage {
                            role: MessageRole::Assistant,
                            content: (!self.text.is_empty())
                                .then(|| MessageContent::Text(self.text.clone())),
                            tool_calls,
                            tool_call_id: None,
                        },
                        finish_reason,
                    }],
                    usage: self.usage,
                })
            }
        }
    }
}

/// Wraps an adapter stream: enforces `seq` order (stale chunks are dropped),
/// runs per-chunk plugin hooks, forwards live chunks, and settles the
/// post-hook runner exactly once.
pub(crate) fn spawn(
    mut upstream: ChunkStream,
    ctx: RequestContext,
    plugins: Vec<Arc<dyn Plugin>>,
    operation: Operation,
    runner: PostHookRunner,
) -> ChunkStream {
    let (tx, rx) = tokio::sync::mpsc::channel::<StreamChunk>(32);

    tokio::spawn(async move {
        let mut acc = Accumulation::default();
        let mut runner = Some(runner);
        let mut next_seq: Option<u64> = None;

        loop {
            let chunk = tokio::select! {
                _ = ctx.cancellation().cancelled() => {
                    settle(&mut runner, &acc, operation, Some(BifrostError::cancelled())).await;
                    mark_stream_end(&ctx);
                    let seq = next_seq.unwrap_or(0);
                    let _ = tx.try_send(StreamChunk::error(seq, BifrostError::cancelled()));
                    return;
                }
                chunk = upstream.recv() => chunk,
            };

            let Some(mut chunk) = chunk else {
                // Adapter went away without a terminal chunk.
                let err = BifrostError::internal("stream ended without a terminal chunk");
                settle(&mut runner, &acc, operation, Some(err.clone())).await;
                mark_stream_end(&ctx);
                let _ = tx.try_send(StreamChunk::error(next_seq.unwrap_or(0), err));
                return;
            };

            // Stale or duplicate sequence numbers are dropped silently.
            if let Some(expected) = next_seq {
                if chunk.seq < expected {
                    tracing::debug!(seq = chunk.seq, expected, "dropping out-of-order chunk");
                    continue;
                }
            }
            next_seq = Some(chunk.seq + 1);

            if let Some(delta) = &chunk.delta {
                acc.apply_delta(delta);
            }
            if let Some(end) = &chunk.end {
                acc.apply_end(end);
            }

            let mut terminated: Option<Option<BifrostError>> = None;
            for plugin in &plugins {
                match plugin.stream_chunk(&ctx, chunk).await {
                    ChunkAction::Forward(next) => chunk = next,
                    ChunkAction::Drop => {
                        terminated = None;
                        chunk = StreamChunk::default();
                        break;
                    }
                    ChunkAction::Terminate(err) => {
                        terminated = Some(err);
                        chunk = StreamChunk::default();
                        break;
                    }
                }
            }

            if let Some(err) = terminated {
                let err = err.unwrap_or_else(|| {
                    BifrostError::cancelled()
                });
                settle(&mut runner, &acc, operation, Some(err.clone())).await;
                mark_stream_end(&ctx);
                let _ = tx
                    .send(StreamChunk::error(next_seq.unwrap_or(1) - 1, err))
                    .await;
                return;
            }
            if chunk.is_reset() {
                // A hook dropped the chunk.
                continue;
            }

            let ended = chunk.end.is_some();
            let errored = chunk.error.clone();

            if tx.send(chunk).await.is_err() {
                // Caller stopped consuming; treat like cancellation and let
                // dropping `upstream` release the adapter connection.
                settle(&mut runner, &acc, operation, Some(BifrostError::cancelled())).await;
                mark_stream_end(&ctx);
                return;
            }

            if let Some(err) = errored {
                settle(&mut runner, &acc, operation, Some(err)).await;
                mark_stream_end(&ctx);
                return;
            }
            if ended {
                settle(&mut runner, &acc, operation, None).await;
                mark_stream_end(&ctx);
                return;
            }
        }
    });

    rx
}

async fn settle(
    runner: &mut Option<PostHookRunner>,
    acc: &Accumulation,
    operation: Operation,
    error: Option<BifrostError>,
) {
    let Some(runner) = runner.take() else { return };
    let response = acc.snapshot(operation);
    runner(Some(response), error).await;
}

fn mark_stream_end(ctx: &RequestContext) {
    ctx.set_reserved_value(reserved::STREAM_END, json!(true));
}

/// Turns an already-complete response into a single-delta stream, used when
/// a pre-hook short-circuits a streaming operation.
pub(crate) fn stream_from_response(response: &BifrostResponse) -> ChunkStream {
    let (tx, rx) = tokio::sync::mpsc::channel::<StreamChunk>(4);

    let (text, finish_reason, usage) = match response {
        BifrostResponse::Chat(chat) => {
            let choice = chat.choices.first();
            (
                choice.map(|c| c.message.content_text()).unwrap_or_default(),
                choice.and_then(|c| c.finish_reason),
                chat.usage,
            )
        }
        BifrostResponse::Text(text) => (text.text.clone(), text.finish_reason, text.usage),
        _ => (String::new(), None, None),
    };

    tokio::spawn(async move {
        let mut seq = 0;
        if !text.is_empty() {
            if tx.send(StreamChunk::delta(seq, ChunkDelta::text(text))).await.is_err() {
                return;
            }
            seq += 1;
        }
        let _ = tx
            .send(StreamChunk::end(seq, StreamEnd { finish_reason, usage }))
            .await;
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn text_chunk(seq: u64, text: &str) -> StreamChunk {
        StreamChunk::delta(seq, ChunkDelta::text(text))
    }

    fn end_chunk(seq: u64) -> StreamChunk {
        StreamChunk::end(
            seq,
            StreamEnd {
                finish_reason: Some(FinishReason::Stop),
                usage: Some(Usage { prompt_tokens: 3, completion_tokens: 2, total_tokens: 5 }),
            },
        )
    }

    fn capture_runner(
        slot: Arc<Mutex<Option<(Option<BifrostResponse>, Option<BifrostError>)>>>,
        count: Arc<AtomicUsize>,
    ) -> PostHookRunner {
        Box::new(move |response, error| {
            Box::pin(async move {
                count.fetch_add(1, Ordering::SeqCst);
                *slot.lock().unwrap() = Some((response, error));
            })
        })
    }

    #[tokio::test]
    async fn accumulates_text_and_fires_runner_once() {
        let (tx, upstream) = tokio::sync::mpsc::channel(8);
        let slot = Arc::new(Mutex::new(None));
        let count = Arc::new(AtomicUsize::new(0));
        let mut rx = spawn(
            upstream,
            RequestContext::new(),
            Vec::new(),
            Operation::ChatStream,
            capture_runner(slot.clone(), count.clone()),
        );

        tx.send(text_chunk(0, "He")).await.unwrap();
        tx.send(text_chunk(1, "llo")).await.unwrap();
        tx.send(end_chunk(2)).await.unwrap();
        drop(tx);

        let mut seen = Vec::new();
        while let Some(chunk) = rx.recv().await {
            seen.push(chunk);
        }
        assert_eq!(seen.len(), 3);
        assert!(seen[2].end.is_some());
        assert_eq!(seen.iter().map(|c| c.seq).collect::<Vec<_>>(), vec![0, 1, 2]);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        let (response, error) = slot.lock().unwrap().take().unwrap();
        assert!(error.is_none());
        let chat = response.unwrap().into_chat().unwrap();
        assert_eq!(chat.primary().unwrap().message.content_text(), "Hello");
        assert_eq!(chat.primary().unwrap().finish_reason, Some(FinishReason::Stop));
        assert_eq!(chat.usage.unwrap().total_tokens, 5);
    }

    #[tokio::test]
    async fn stale_chunks_are_dropped() {
        let (tx, upstream) = tokio::sync::mpsc::channel(8);
        let slot = Arc::new(Mutex::new(None));
        let count = Arc::new(AtomicUsize::new(0));
        let mut rx = spawn(
            upstream,
            RequestContext::new(),
            Vec::new(),
            Operation::ChatStream,
            capture_runner(slot.clone(), count.clone()),
        );

        tx.send(text_chunk(0, "a")).await.unwrap();
        tx.send(text_chunk(0, "dup")).await.unwrap();
        tx.send(text_chunk(1, "b")).await.unwrap();
        tx.send(end_chunk(2)).await.unwrap();
        drop(tx);

        let mut texts = Vec::new();
        while let Some(chunk) = rx.recv().await {
            if let Some(delta) = chunk.delta {
                texts.push(delta.text.unwrap());
            }
        }
        assert_eq!(texts, vec!["a", "b"]);

        let (response, _) = slot.lock().unwrap().take().unwrap();
        let chat = response.unwrap().into_chat().unwrap();
        assert_eq!(chat.primary().unwrap().message.content_text(), "ab");
    }

    #[tokio::test]
    async fn tool_call_fragments_merge_by_index() {
        let (tx, upstream) = tokio::sync::mpsc::channel(8);
        let slot = Arc::new(Mutex::new(None));
        let count = Arc::new(AtomicUsize::new(0));
        let mut rx = spawn(
            upstream,
            RequestContext::new(),
            Vec::new(),
            Operation::ChatStream,
            capture_runner(slot.clone(), count.clone()),
        );

        let frag = |seq, index, id: Option<&str>, name: Option<&str>, args: &str| {
            StreamChunk::delta(
                seq,
                ChunkDelta {
                    role: None,
                    text: None,
                    tool_calls: vec![bifrost_provider_core::ToolCallDelta {
                        index,
                        id: id.map(str::to_string),
                        name: name.map(str::to_string),
                        arguments: Some(args.to_string()),
                    }],
                },
            )
        };

        tx.send(frag(0, 0, Some("c1"), Some("lookup"), "{\"q\":")).await.unwrap();
        tx.send(frag(1, 0, None, None, "1}")).await.unwrap();
        tx.send(frag(2, 1, Some("c2"), Some("other"), "{}")).await.unwrap();
        tx.send(end_chunk(3)).await.unwrap();
        drop(tx);

        while rx.recv().await.is_some() {}

        let (response, _) = slot.lock().unwrap().take().unwrap();
        let chat = response.unwrap().into_chat().unwrap();
        let calls = &chat.primary().unwrap().message.tool_calls;
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id.as_deref(), Some("c1"));
        assert_eq!(calls[0].function.name.as_deref(), Some("lookup"));
        assert_eq!(calls[0].function.arguments, "{\"q\":1}");
        assert_eq!(calls[1].id.as_deref(), Some("c2"));
    }

    #[tokio::test]
    async fn error_chunk_settles_runner_with_partial() {
        let (tx, upstream) = tokio::sync::mpsc::channel(8);
        let slot = Arc::new(Mutex::new(None));
        let count = Arc::new(AtomicUsize::new(0));
        let mut rx = spawn(
            upstream,
            RequestContext::new(),
            Vec::new(),
            Operation::ChatStream,
            capture_runner(slot.clone(), count.clone()),
        );

        tx.send(text_chunk(0, "partial")).await.unwrap();
        tx.send(StreamChunk::error(
            1,
            BifrostError::new(bifrost_common::ErrorKind::UpstreamUnavailable, "died"),
        ))
        .await
        .unwrap();
        drop(tx);

        while rx.recv().await.is_some() {}

        assert_eq!(count.load(Ordering::SeqCst), 1);
        let (response, error) = slot.lock().unwrap().take().unwrap();
        assert_eq!(
            error.unwrap().kind,
            bifrost_common::ErrorKind::UpstreamUnavailable
        );
        let chat = response.unwrap().into_chat().unwrap();
        assert_eq!(chat.primary().unwrap().message.content_text(), "partial");
    }

    #[tokio::test]
    async fn dropped_consumer_settles_with_cancelled() {
        let (tx, upstream) = tokio::sync::mpsc::channel(8);
        let slot = Arc::new(Mutex::new(None));
        let count = Arc::new(AtomicUsize::new(0));
        let rx = spawn(
            upstream,
            RequestContext::new(),
            Vec::new(),
            Operation::ChatStream,
            capture_runner(slot.clone(), count.clone()),
        );

        tx.send(text_chunk(0, "x")).await.unwrap();
        drop(rx);
        // Keep feeding until the task notices the closed side.
        for seq in 1..20 {
            if tx.send(text_chunk(seq, "y")).await.is_err() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        let (_, error) = slot.lock().unwrap().take().unwrap();
        assert_eq!(error.unwrap().kind, bifrost_common::ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn cancellation_settles_with_partial_snapshot() {
        let (tx, upstream) = tokio::sync::mpsc::channel(8);
        let ctx = RequestContext::new();
        let slot = Arc::new(Mutex::new(None));
        let count = Arc::new(AtomicUsize::new(0));
        let mut rx = spawn(
            upstream,
            ctx.clone(),
            Vec::new(),
            Operation::ChatStream,
            capture_runner(slot.clone(), count.clone()),
        );

        tx.send(text_chunk(0, "before")).await.unwrap();
        assert!(rx.recv().await.unwrap().delta.is_some());

        ctx.cancellation().cancel();
        let last = rx.recv().await.unwrap();
        assert_eq!(last.error.as_ref().unwrap().kind, bifrost_common::ErrorKind::Cancelled);

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        let (response, error) = slot.lock().unwrap().take().unwrap();
        assert_eq!(error.unwrap().kind, bifrost_common::ErrorKind::Cancelled);
        let chat = response.unwrap().into_chat().unwrap();
        assert_eq!(chat.primary().unwrap().message.content_text(), "before");
        assert!(ctx.get_value(reserved::STREAM_END).is_some());
    }

    #[tokio::test]
    async fn chunk_hook_can_drop_chunks() {
        struct DropAll;

        #[async_trait::async_trait]
        impl Plugin for DropAll {
            fn name(&self) -> &str {
                "drop-all"
            }

            fn kind(&self) -> crate::plugins::PluginKind {
                crate::plugins::PluginKind::Transport
            }

            async fn stream_chunk(
                &self,
                _ctx: &RequestContext,
                chunk: StreamChunk,
            ) -> ChunkAction {
                if chunk.delta.is_some() {
                    ChunkAction::Drop
                } else {
                    ChunkAction::Forward(chunk)
                }
            }
        }

        let (tx, upstream) = tokio::sync::mpsc::channel(8);
        let slot = Arc::new(Mutex::new(None));
        let count = Arc::new(AtomicUsize::new(0));
        let mut rx = spawn(
            upstream,
            RequestContext::new(),
            vec![Arc::new(DropAll) as Arc<dyn Plugin>],
            Operation::ChatStream,
            capture_runner(slot.clone(), count.clone()),
        );

        tx.send(text_chunk(0, "hidden")).await.unwrap();
        tx.send(end_chunk(1)).await.unwrap();
        drop(tx);

        let mut seen = Vec::new();
        while let Some(chunk) = rx.recv().await {
            seen.push(chunk);
        }
        // Only the terminal chunk made it through.
        assert_eq!(seen.len(), 1);
        assert!(seen[0].end.is_some());
        // The accumulator still saw the dropped delta.
        let (response, _) = slot.lock().unwrap().take().unwrap();
        let chat = response.unwrap().into_chat().unwrap();
        assert_eq!(chat.primary().unwrap().message.content_text(), "hidden");
    }
}
